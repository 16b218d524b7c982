// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Key/value index over one record payload.
//!
//! Each record is a flat JSON object. The index walks its direct children in
//! emission order and files every value under its key. Keys are interned
//! once and their slots are reused for the rest of the connection — the set
//! of keys the daemon emits is small and stable, so after the first few
//! records steady-state dispatch does not allocate. Only the *values* are
//! reset between records.

use crate::errors::{ConversionError, TokenError};
use serde::de::{self, Deserializer as _, MapAccess, Visitor};
use serde_json::value::RawValue;
use std::fmt;
use std::num::IntErrorKind;
use ustr::Ustr;

/// Upper bound on distinct keys across the life of a connection. Sized well
/// above the daemon's record vocabulary; hitting it means the stream is not
/// what we think it is.
pub const MAX_RECORD_TOKENS: usize = 512;

/// Upper bound on the byte length of a single key.
pub const MAX_KEY_LEN: usize = 32;

/// JSON shape of a token's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// Quoted string; the stored value excludes the quotes and is not
    /// unescaped.
    String,
    /// Number, boolean, or null, stored as its raw text.
    Primitive,
    Array,
    Object,
}

#[derive(Debug)]
struct TokenSlot {
    key: Ustr,
    value: String,
    kind: ValueKind,
    index: usize,
}

/// One key/value pair of the current record.
#[derive(Debug, Clone, Copy)]
pub struct Token<'a> {
    key: &'a str,
    value: &'a str,
    kind: ValueKind,
    index: usize,
}

impl<'a> Token<'a> {
    pub fn key(&self) -> &'a str {
        self.key
    }

    /// Raw value text: string contents without quotes, primitives verbatim,
    /// arrays and objects as their full JSON text.
    pub fn value(&self) -> &'a str {
        self.value
    }

    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    /// Insertion order of this key in the index.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Byte-exact comparison against a literal.
    pub fn value_equals(&self, literal: &str) -> bool {
        self.value == literal
    }

    pub fn value_as_u64(&self) -> Result<u64, ConversionError> {
        parse_u64(self.value)
    }

    pub fn key_as_u64(&self) -> Result<u64, ConversionError> {
        parse_u64(self.key)
    }

    /// The string-typed items of an array-valued token, in order. Non-string
    /// items are skipped; non-array tokens yield nothing.
    pub fn string_items(&self) -> Vec<&'a str> {
        if self.kind != ValueKind::Array {
            return Vec::new();
        }
        match serde_json::from_str::<Vec<&RawValue>>(self.value) {
            Ok(items) => items
                .into_iter()
                .filter_map(|item| {
                    item.get()
                        .strip_prefix('"')
                        .and_then(|text| text.strip_suffix('"'))
                })
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

/// The per-connection token index.
#[derive(Debug, Default)]
pub struct TokenIndex {
    slots: Vec<TokenSlot>,
    by_key: hashbrown::HashMap<Ustr, usize>,
}

impl TokenIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys ever seen on this connection.
    pub fn key_count(&self) -> usize {
        self.slots.len()
    }

    /// Tokenize one record payload into the index. On error the index holds
    /// the values filed before the failure; the caller is expected to reset
    /// it via [`clear_values`](Self::clear_values) either way.
    pub fn index_record(&mut self, payload: &[u8]) -> Result<(), TokenError> {
        let text = std::str::from_utf8(payload).map_err(|_| TokenError::NotUtf8)?;

        let mut fatal = None;
        let mut deserializer = serde_json::Deserializer::from_str(text);
        let outcome = deserializer.deserialize_map(RecordVisitor {
            index: self,
            fatal: &mut fatal,
        });

        match outcome {
            Ok(()) => deserializer.end().map_err(classify_json_error),
            Err(error) => match fatal {
                Some(fatal) => Err(fatal),
                None => Err(classify_json_error(error)),
            },
        }
    }

    /// Look up a key; absent keys and empty values both yield `None`.
    pub fn get(&self, key: &str) -> Option<Token<'_>> {
        let interned = ustr::existing_ustr(key)?;
        let slot = &self.slots[*self.by_key.get(&interned)?];
        if slot.value.is_empty() {
            return None;
        }
        Some(Token {
            key: slot.key.as_str(),
            value: &slot.value,
            kind: slot.kind,
            index: slot.index,
        })
    }

    /// Value text for a key, if present in the current record.
    pub fn value(&self, key: &str) -> Option<&str> {
        self.get(key).map(|token| token.value)
    }

    pub fn value_as_u64(&self, key: &str) -> Result<u64, ConversionError> {
        self.get(key)
            .ok_or(ConversionError::KeyNotFound)?
            .value_as_u64()
    }

    pub fn value_equals(&self, key: &str, literal: &str) -> bool {
        self.get(key)
            .map(|token| token.value_equals(literal))
            .unwrap_or(false)
    }

    /// Reset every value to absent while keeping the key slots.
    pub fn clear_values(&mut self) {
        for slot in &mut self.slots {
            slot.value.clear();
        }
    }

    fn insert(&mut self, key: &str, raw: &RawValue) -> Result<(), TokenError> {
        if key.len() > MAX_KEY_LEN {
            return Err(TokenError::KeyTooLong {
                key: key.to_string(),
                limit: MAX_KEY_LEN,
            });
        }

        let interned = Ustr::from(key);
        let slot_index = match self.by_key.get(&interned) {
            Some(&slot_index) => slot_index,
            None => {
                if self.slots.len() >= MAX_RECORD_TOKENS {
                    return Err(TokenError::TooManyKeys {
                        limit: MAX_RECORD_TOKENS,
                    });
                }
                let slot_index = self.slots.len();
                self.slots.push(TokenSlot {
                    key: interned,
                    value: String::new(),
                    kind: ValueKind::Primitive,
                    index: slot_index,
                });
                self.by_key.insert(interned, slot_index);
                slot_index
            }
        };

        let slot = &mut self.slots[slot_index];
        let text = raw.get();
        let (kind, stored) = match text.as_bytes().first() {
            Some(b'"') => (ValueKind::String, &text[1..text.len() - 1]),
            Some(b'[') => (ValueKind::Array, text),
            Some(b'{') => (ValueKind::Object, text),
            _ => (ValueKind::Primitive, text),
        };
        slot.kind = kind;
        slot.value.clear();
        slot.value.push_str(stored);
        Ok(())
    }
}

struct RecordVisitor<'x> {
    index: &'x mut TokenIndex,
    fatal: &'x mut Option<TokenError>,
}

impl<'de> Visitor<'de> for RecordVisitor<'_> {
    type Value = ();

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("a flat JSON object")
    }

    fn visit_map<A>(self, mut map: A) -> Result<(), A::Error>
    where
        A: MapAccess<'de>,
    {
        while let Some(key) = map.next_key::<&str>()? {
            let raw = map.next_value::<&RawValue>()?;
            if let Err(error) = self.index.insert(key, raw) {
                *self.fatal = Some(error);
                return Err(de::Error::custom("token index limit exceeded"));
            }
        }
        Ok(())
    }
}

fn classify_json_error(error: serde_json::Error) -> TokenError {
    if error.is_eof() {
        TokenError::Truncated
    } else {
        TokenError::Malformed(error)
    }
}

fn parse_u64(text: &str) -> Result<u64, ConversionError> {
    text.parse::<u64>().map_err(|error| match error.kind() {
        IntErrorKind::PosOverflow => ConversionError::RangeExceeded,
        _ => ConversionError::NotANumber,
    })
}
