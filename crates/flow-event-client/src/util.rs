// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helpers for working with record values.

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;

// The daemon escapes strings before shipping them; padding may be absent on
// values it truncated.
const LENIENT_STANDARD: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Decode a base64-encoded string value.
///
/// The daemon prefixes `/` with `\` when escaping string values, so
/// backslashes (and stray whitespace) are stripped before decoding.
pub fn decode_escaped_base64(value: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let cleaned: String = value
        .chars()
        .filter(|c| *c != '\\' && !c.is_ascii_whitespace())
        .collect();
    LENIENT_STANDARD.decode(cleaned.as_bytes())
}
