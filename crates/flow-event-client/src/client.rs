// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The client engine: one connection to the daemon's event stream.
//!
//! [`FlowClient`] owns the receive buffer, the token index, and the entity
//! registry for a single connection, and drives the per-record dispatch:
//! extract a frame, index its tokens, resolve the entities it references,
//! hand the record to the consumer, apply the flow lifecycle checks, and
//! compact the buffer. It performs no I/O scheduling of its own - the caller
//! owns readiness and retries; [`run`](FlowClient::run) is a convenience
//! loop over exactly those public steps.

use crate::buffer::RecvBuffer;
use crate::config::ClientConfig;
use crate::errors::{ConnectError, ProcessError, RunError};
use crate::frame::{self, FrameStatus};
use crate::net::{Endpoint, ReadStatus, Transport};
use crate::registry::{
    fields, CleanupEvent, CleanupReason, Flow, InstanceKey, Registry, Resolved, ThreadData,
};
use crate::token::TokenIndex;
use std::io;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

/// Fallible outcome of the consumer callback.
pub type CallbackResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Mutable handle to an instance's consumer payload.
pub struct InstanceHandle<'a, I> {
    pub key: InstanceKey,
    pub state: &'a mut I,
}

/// The entities one record resolved to. `None` means the record does not
/// carry that tier's fields - normal for daemon-level events, not an error.
pub struct Entities<'a, I, T, F> {
    pub instance: Option<InstanceHandle<'a, I>>,
    pub thread: Option<&'a mut ThreadData<T>>,
    pub flow: Option<&'a mut Flow<F>>,
}

impl<I, T, F> Entities<'_, I, T, F> {
    fn none() -> Self {
        Entities {
            instance: None,
            thread: None,
            flow: None,
        }
    }
}

/// Consumer of the event stream.
///
/// The associated types are the per-entity payloads the engine constructs
/// with `Default` when an entity is first seen and owns 1:1 with the entity.
pub trait EventProcessor {
    type InstanceState: Default;
    type ThreadState: Default;
    type FlowState: Default;

    /// Invoked once per successfully parsed record. An error aborts the
    /// current dispatch pass as fatal, though lifecycle bookkeeping for the
    /// record still runs first.
    fn on_record(
        &mut self,
        record: &TokenIndex,
        entities: Entities<'_, Self::InstanceState, Self::ThreadState, Self::FlowState>,
    ) -> CallbackResult;

    /// Fired before a flow is dropped, with the reason it is going away.
    fn on_flow_cleanup(
        &mut self,
        _instance: InstanceHandle<'_, Self::InstanceState>,
        _thread: Option<&mut ThreadData<Self::ThreadState>>,
        _flow: &Flow<Self::FlowState>,
        _reason: CleanupReason,
    ) {
    }

    /// Fired before an instance and everything it owns are dropped.
    fn on_instance_cleanup(
        &mut self,
        _instance: InstanceHandle<'_, Self::InstanceState>,
        _reason: CleanupReason,
    ) {
    }
}

/// One engine instance: one connection, one consumer.
pub struct FlowClient<P: EventProcessor> {
    endpoint: Endpoint,
    transport: Option<Transport>,
    buffer: RecvBuffer,
    tokens: TokenIndex,
    registry: Registry<P::InstanceState, P::ThreadState, P::FlowState>,
    processor: P,
}

impl<P: EventProcessor> FlowClient<P> {
    /// Build an unconnected engine from a validated configuration.
    pub fn new(config: &ClientConfig, processor: P) -> Result<Self, ConnectError> {
        config.validate()?;
        let endpoint: Endpoint = config.endpoint.parse()?;
        Ok(Self {
            endpoint,
            transport: None,
            buffer: RecvBuffer::new(config.receive_buffer_size),
            tokens: TokenIndex::new(),
            registry: Registry::new(),
            processor,
        })
    }

    /// Connect to the configured endpoint.
    pub async fn connect(&mut self) -> Result<(), ConnectError> {
        self.transport = Some(self.endpoint.connect().await?);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    pub fn processor(&self) -> &P {
        &self.processor
    }

    pub fn processor_mut(&mut self) -> &mut P {
        &mut self.processor
    }

    pub fn registry(&self) -> &Registry<P::InstanceState, P::ThreadState, P::FlowState> {
        &self.registry
    }

    /// Wait until the transport is readable. External event loops may use
    /// their own readiness mechanism instead and go straight to
    /// [`read`](Self::read).
    pub async fn readable(&self) -> io::Result<()> {
        match &self.transport {
            Some(transport) => transport.readable().await,
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "not connected")),
        }
    }

    /// Attempt one non-blocking read from the transport into the buffer.
    pub fn read(&mut self) -> io::Result<ReadStatus> {
        match &mut self.transport {
            Some(transport) => transport.read_into(&mut self.buffer),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "not connected")),
        }
    }

    /// Append bytes obtained out-of-band (e.g. by a caller that owns its own
    /// socket); returns how many fit.
    pub fn feed(&mut self, data: &[u8]) -> usize {
        self.buffer.extend_from_slice(data)
    }

    /// Drain every complete frame currently buffered, dispatching each to
    /// the consumer. Returns the number of records dispatched; the remaining
    /// bytes are a partial frame awaiting more data. Any error is fatal to
    /// the connection.
    pub fn process_buffered(&mut self) -> Result<usize, ProcessError> {
        let mut dispatched = 0;
        loop {
            let frame = match frame::extract_frame(&self.buffer) {
                Ok(FrameStatus::Complete(frame)) => frame,
                Ok(FrameStatus::NeedMoreData) => return Ok(dispatched),
                Err(framing) => {
                    error!(error = %framing, "protocol desync");
                    return Err(framing.into());
                }
            };

            let indexed = self.tokens.index_record(frame.payload(&self.buffer));
            let result = match indexed {
                Ok(()) => self.dispatch_record(),
                Err(token_error) => {
                    error!(error = %token_error, "failed to tokenize record");
                    Err(token_error.into())
                }
            };

            // The frame is consumed even when its dispatch failed; committed
            // entity state stays intact either way.
            self.tokens.clear_values();
            self.buffer.consume(frame.total_len);
            result?;
            dispatched += 1;
        }
    }

    /// Cooperative loop: wait for readability, read, drain frames, repeat.
    /// Returns `Ok` on a clean peer disconnect or cancellation.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), RunError> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("run loop cancelled");
                    return Ok(());
                }
                ready = self.readable() => {
                    ready?;
                }
            }

            match self.read()? {
                ReadStatus::Timeout => continue,
                ReadStatus::PeerDisconnect => {
                    debug!("peer disconnected");
                    return Ok(());
                }
                ReadStatus::Ok(count) => {
                    trace!(count, "read bytes");
                }
            }

            self.process_buffered()?;
        }
    }

    /// Drop the transport and evict every instance with `AppShutdown`,
    /// firing the cleanup notifications. Also runs on drop.
    pub fn close(&mut self) {
        if self.transport.take().is_some() {
            debug!("closing connection");
        }
        let processor = &mut self.processor;
        self.registry
            .teardown(CleanupReason::AppShutdown, |event| match event {
                CleanupEvent::Instance { key, state, reason } => {
                    processor.on_instance_cleanup(InstanceHandle { key, state }, reason);
                }
                CleanupEvent::Flow {
                    key,
                    state,
                    thread,
                    flow,
                    reason,
                } => {
                    processor.on_flow_cleanup(InstanceHandle { key, state }, thread, flow, reason);
                }
            });
    }

    fn dispatch_record(&mut self) -> Result<(), ProcessError> {
        let resolved = self.registry.resolve(&self.tokens);

        let callback_result = self
            .processor
            .on_record(&self.tokens, entities(&mut self.registry, &resolved));

        // Lifecycle checks run even when the callback failed, so the
        // registry never retains flows the stream has already ended.
        self.apply_lifecycle(&resolved);

        callback_result.map_err(ProcessError::Callback)
    }

    fn apply_lifecycle(&mut self, resolved: &Resolved) {
        let Some(instance) = resolved.instance else {
            return;
        };
        let processor = &mut self.processor;

        if let Some(thread) = resolved.thread {
            for (event_name, reason) in [
                ("init", CleanupReason::DaemonInit),
                ("shutdown", CleanupReason::DaemonShutdown),
            ] {
                if self.tokens.value_equals(fields::DAEMON_EVENT_NAME, event_name) {
                    self.registry
                        .evict_thread_flows(instance, thread, reason, |event| {
                            notify_flow_cleanup(processor, event);
                        });
                }
            }
        }

        let Some(flow) = resolved.flow else {
            return;
        };

        if self.tokens.value_equals(fields::FLOW_EVENT_NAME, "idle") {
            self.registry
                .evict_flow(instance, flow, CleanupReason::FlowIdle, |event| {
                    notify_flow_cleanup(processor, event);
                });
        } else if self.tokens.value_equals(fields::FLOW_EVENT_NAME, "end") {
            self.registry
                .evict_flow(instance, flow, CleanupReason::FlowEnd, |event| {
                    notify_flow_cleanup(processor, event);
                });
        } else {
            let timed_out = self
                .registry
                .get(instance)
                .and_then(|entry| {
                    let flow = entry.flows.get(&flow)?;
                    let thread = entry.threads.get(&resolved.thread?)?;
                    Some(flow.timed_out(thread.most_recent_flow_time))
                })
                .unwrap_or(false);
            if timed_out {
                self.registry
                    .evict_flow(instance, flow, CleanupReason::FlowTimeout, |event| {
                        notify_flow_cleanup(processor, event);
                    });
            }
        }
    }
}

fn entities<'a, I, T, F>(
    registry: &'a mut Registry<I, T, F>,
    resolved: &Resolved,
) -> Entities<'a, I, T, F>
where
    I: Default,
    T: Default,
    F: Default,
{
    let Some(instance_key) = resolved.instance else {
        return Entities::none();
    };
    let Some(instance) = registry.get_mut(instance_key) else {
        return Entities::none();
    };

    let thread = resolved
        .thread
        .and_then(|key| instance.threads.get_mut(&key));
    let flow = resolved.flow.and_then(|key| instance.flows.get_mut(&key));
    Entities {
        instance: Some(InstanceHandle {
            key: instance.key,
            state: &mut instance.state,
        }),
        thread,
        flow,
    }
}

fn notify_flow_cleanup<P: EventProcessor>(
    processor: &mut P,
    event: CleanupEvent<'_, P::InstanceState, P::ThreadState, P::FlowState>,
) {
    if let CleanupEvent::Flow {
        key,
        state,
        thread,
        flow,
        reason,
    } = event
    {
        processor.on_flow_cleanup(InstanceHandle { key, state }, thread, flow, reason);
    }
}

impl<P: EventProcessor> Drop for FlowClient<P> {
    fn drop(&mut self) {
        self.close();
    }
}
