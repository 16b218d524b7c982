// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for the flow event client.
//!
//! Recoverable conditions (a frame needing more bytes, a read that would
//! block) are ordinary control values and never appear here; everything in
//! this module is either fatal to the connection or, for
//! [`ConversionError`], a local, skippable failure.

/// Fatal errors while locating one length-prefixed record at the head of the
/// receive buffer. A stream that produces any of these cannot be
/// resynchronized and must be torn down.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    #[error("byte after the length prefix is not an opening brace")]
    InvalidOpeningChar,

    #[error("length prefix does not fit into an unsigned 64-bit integer")]
    SizeExceedsConversionLimit,

    #[error("length prefix missing")]
    SizeMissing,

    #[error("frame of {total} bytes exceeds the receive buffer capacity of {capacity}")]
    FrameTooBig { total: u64, capacity: usize },

    #[error("frame does not end with a closing brace and a newline")]
    InvalidClosingChar,
}

/// Fatal errors while tokenizing one record payload.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("record payload is not valid UTF-8")]
    NotUtf8,

    #[error("record JSON is truncated")]
    Truncated,

    #[error("record JSON is malformed: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("record holds more than {limit} distinct keys")]
    TooManyKeys { limit: usize },

    #[error("record key {key:?} exceeds {limit} bytes")]
    KeyTooLong { key: String, limit: usize },
}

/// Local, non-fatal failures when interpreting a single token. Callers are
/// free to skip the field or fall back to a default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConversionError {
    #[error("key not found in the current record")]
    KeyNotFound,

    #[error("value is not an unsigned integer")]
    NotANumber,

    #[error("value exceeds the unsigned 64-bit range")]
    RangeExceeded,
}

/// Fatal errors from one dispatch pass over the buffered frames.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error("consumer callback failed: {0}")]
    Callback(Box<dyn std::error::Error + Send + Sync>),
}

/// Errors while parsing a distributor endpoint address.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("endpoint address is empty")]
    Empty,

    #[error("IPv4 endpoint {0:?} is too short")]
    TooShort(String),

    #[error("invalid host in endpoint {0:?}")]
    InvalidHost(String),

    #[error("invalid port in endpoint {0:?}")]
    InvalidPort(String),

    #[error("IPv6 endpoint {0:?} has mismatched brackets")]
    MismatchedBrackets(String),
}

/// Invalid [`ClientConfig`](crate::config::ClientConfig) contents.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors while setting up the connection to the distributor.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Address(#[from] AddressError),

    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),
}

/// Fatal errors from the cooperative [`run`](crate::client::FlowClient::run)
/// loop. A clean peer disconnect or cancellation is not an error and makes
/// `run` return `Ok`.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Process(#[from] ProcessError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framing_error_display() {
        let error = FramingError::FrameTooBig {
            total: 20000,
            capacity: 12288,
        };
        assert_eq!(
            error.to_string(),
            "frame of 20000 bytes exceeds the receive buffer capacity of 12288"
        );
    }

    #[test]
    fn test_conversion_error_display() {
        assert_eq!(
            ConversionError::NotANumber.to_string(),
            "value is not an unsigned integer"
        );
        assert_eq!(
            ConversionError::RangeExceeded.to_string(),
            "value exceeds the unsigned 64-bit range"
        );
    }

    #[test]
    fn test_process_error_wraps_framing() {
        let error = ProcessError::from(FramingError::InvalidOpeningChar);
        assert!(matches!(error, ProcessError::Framing(_)));
        assert_eq!(
            error.to_string(),
            "byte after the length prefix is not an opening brace"
        );
    }
}
