// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Client configuration and wire-format constants.

use crate::errors::ConfigError;
use std::env;

/// Receive buffer capacity in bytes. Needs to stay in sync with the
/// daemon's network buffer size so an oversized-frame error really means a
/// protocol violation rather than a mismatched build.
pub const RECEIVE_BUFFER_SIZE: usize = 12288; // 8192 + 4096

/// Digit count of the length prefix the daemon writes. Readers accept any
/// width; writers should emit this fixed, zero-padded form.
pub const LENGTH_PREFIX_DIGITS: usize = 5;

/// Default distributor endpoint on the local machine.
pub const DEFAULT_UNIX_ENDPOINT: &str = "/tmp/flow-distributor.sock";

/// Default distributor endpoint when connecting over TCP.
pub const DEFAULT_TCP_ENDPOINT: &str = "127.0.0.1:7000";

// Anything below this cannot hold a length prefix plus a minimal record.
const MIN_RECEIVE_BUFFER_SIZE: usize = 64;

/// Configuration for a [`FlowClient`](crate::client::FlowClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Distributor endpoint: a bare filesystem path for a unix domain
    /// socket, `host:port` for IPv4, or `[host]:port` for IPv6.
    pub endpoint: String,
    /// Receive buffer capacity in bytes; bounds the maximum frame size.
    pub receive_buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_UNIX_ENDPOINT.to_string(),
            receive_buffer_size: RECEIVE_BUFFER_SIZE,
        }
    }
}

impl ClientConfig {
    /// Create configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let endpoint = env::var("DD_FLOW_CLIENT_ENDPOINT")
            .unwrap_or_else(|_| DEFAULT_UNIX_ENDPOINT.to_string());
        let receive_buffer_size = env::var("DD_FLOW_CLIENT_BUFFER_SIZE")
            .ok()
            .and_then(|size| size.parse::<usize>().ok())
            .unwrap_or(RECEIVE_BUFFER_SIZE);

        let config = Self {
            endpoint,
            receive_buffer_size,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "endpoint address cannot be empty".to_string(),
            ));
        }

        if self.receive_buffer_size < MIN_RECEIVE_BUFFER_SIZE {
            return Err(ConfigError::Invalid(format!(
                "receive buffer of {} bytes is below the {} byte minimum",
                self.receive_buffer_size, MIN_RECEIVE_BUFFER_SIZE
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.receive_buffer_size, RECEIVE_BUFFER_SIZE);
    }

    #[test]
    fn test_validate_empty_endpoint() {
        let config = ClientConfig {
            endpoint: "   ".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_tiny_buffer() {
        let config = ClientConfig {
            receive_buffer_size: 16,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tcp_default_endpoint_is_accepted() {
        let config = ClientConfig {
            endpoint: DEFAULT_TCP_ENDPOINT.to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}
