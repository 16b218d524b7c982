// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Client-side protocol engine for a deep-packet-inspection event stream.
//!
//! A long-lived daemon emits a continuous sequence of length-prefixed JSON
//! records describing network flow lifecycle events over a stream socket.
//! This crate turns that raw, possibly fragmented byte stream into
//! well-formed per-record callbacks while maintaining consistent,
//! garbage-collected state about every instance (a remote probe), thread
//! (a worker inside that probe), and flow (a single network connection)
//! referenced by the stream.
//!
//! The engine is driven cooperatively from the outside: it performs no I/O
//! scheduling of its own and the only suspension point is the non-blocking
//! read from the transport. One engine serves exactly one connection.
//!
//! ```no_run
//! use flow_event_client::{
//!     CallbackResult, ClientConfig, Entities, EventProcessor, FlowClient, TokenIndex,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[derive(Default)]
//! struct FlowCounter {
//!     seen: u64,
//! }
//!
//! impl EventProcessor for FlowCounter {
//!     type InstanceState = ();
//!     type ThreadState = ();
//!     type FlowState = ();
//!
//!     fn on_record(
//!         &mut self,
//!         record: &TokenIndex,
//!         entities: Entities<'_, (), (), ()>,
//!     ) -> CallbackResult {
//!         if entities.flow.is_some() && record.value_equals("flow_event_name", "new") {
//!             self.seen += 1;
//!         }
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClientConfig::from_env()?;
//! let mut client = FlowClient::new(&config, FlowCounter::default())?;
//! client.connect().await?;
//! client.run(CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod client;
pub mod config;
pub mod errors;
pub mod frame;
pub mod net;
pub mod registry;
pub mod token;
pub mod util;

pub use client::{CallbackResult, Entities, EventProcessor, FlowClient, InstanceHandle};
pub use config::ClientConfig;
pub use errors::{
    AddressError, ConfigError, ConnectError, ConversionError, FramingError, ProcessError,
    RunError, TokenError,
};
pub use net::{Endpoint, ReadStatus};
pub use registry::{
    CleanupReason, Flow, FlowKey, Instance, InstanceKey, Registry, ThreadData, ThreadKey,
};
pub use token::{Token, TokenIndex, ValueKind};
