// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Frame extraction.
//!
//! One frame on the wire is `<digits>{...}\n`: a decimal ASCII length
//! prefix counting the bytes from the opening brace through the trailing
//! newline inclusive, followed by exactly that payload. The extractor never
//! consumes bytes itself; the dispatch loop compacts the buffer once a frame
//! has been fully handled.

use crate::buffer::RecvBuffer;
use crate::errors::FramingError;
use tracing::trace;

// A u64 length prefix has at most 20 decimal digits; a longer digit run can
// never convert.
const MAX_LENGTH_PREFIX_DIGITS: usize = 20;

/// One complete frame at the head of the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    /// Digit count of the length prefix.
    pub prefix_len: usize,
    /// Prefix plus payload; the byte count to consume after dispatch.
    pub total_len: usize,
}

impl Frame {
    /// The JSON payload, from the opening brace through the trailing
    /// newline.
    pub fn payload<'a>(&self, buffer: &'a RecvBuffer) -> &'a [u8] {
        &buffer.as_slice()[self.prefix_len..self.total_len]
    }
}

/// Outcome of one extraction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Complete(Frame),
    /// The buffered bytes are a prefix of a valid frame; append more and
    /// retry.
    NeedMoreData,
}

/// Locate one complete frame at the head of the buffer.
///
/// `NeedMoreData` is the only recoverable outcome; every error indicates an
/// unrecoverable protocol desync.
pub fn extract_frame(buffer: &RecvBuffer) -> Result<FrameStatus, FramingError> {
    let data = buffer.as_slice();

    let prefix_len = data
        .iter()
        .take(MAX_LENGTH_PREFIX_DIGITS + 1)
        .take_while(|byte| byte.is_ascii_digit())
        .count();
    if prefix_len > MAX_LENGTH_PREFIX_DIGITS {
        return Err(FramingError::SizeExceedsConversionLimit);
    }
    if prefix_len == data.len() {
        // Still reading the prefix itself.
        return Ok(FrameStatus::NeedMoreData);
    }
    if data[prefix_len] != b'{' {
        return Err(FramingError::InvalidOpeningChar);
    }
    if prefix_len == 0 {
        return Err(FramingError::SizeMissing);
    }

    let mut payload_len: u64 = 0;
    for &digit in &data[..prefix_len] {
        payload_len = payload_len
            .checked_mul(10)
            .and_then(|value| value.checked_add(u64::from(digit - b'0')))
            .ok_or(FramingError::SizeExceedsConversionLimit)?;
    }

    let total = prefix_len as u64 + payload_len;
    if total > buffer.capacity() as u64 {
        return Err(FramingError::FrameTooBig {
            total,
            capacity: buffer.capacity(),
        });
    }
    let total = total as usize;
    if total > data.len() {
        return Ok(FrameStatus::NeedMoreData);
    }

    // The payload must close as `}` + newline; anything else means the
    // prefix lied about the record length.
    if total < prefix_len + 3 || data[total - 2] != b'}' || data[total - 1] != b'\n' {
        return Err(FramingError::InvalidClosingChar);
    }

    trace!(prefix_len, total, "extracted frame");
    Ok(FrameStatus::Complete(Frame {
        prefix_len,
        total_len: total,
    }))
}
