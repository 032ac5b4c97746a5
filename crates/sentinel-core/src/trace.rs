// Copyright (C) 2025 The Sentinel Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! W3C `traceparent` header handling.
//!
//! Requests may carry distributed-tracing context; the parsed ids are
//! attached to request spans and propagated into log rows.

use std::fmt;

/// Parsed `traceparent` header: `XX-<32 hex>-<16 hex>-<2 hex>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Traceparent {
    pub version: u8,
    pub trace_id: String,
    pub parent_id: String,
    pub flags: u8,
}

/// Traceparent parse failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TraceparentError {
    #[error("traceparent must have four dash-separated fields")]
    FieldCount,
    #[error("traceparent field has wrong length or non-hex characters")]
    BadField,
    #[error("traceparent version ff is invalid")]
    InvalidVersion,
    #[error("traceparent ids must not be all zeroes")]
    ZeroId,
}

impl Traceparent {
    /// Parse a header value. Version `ff` is rejected; unknown non-`ff`
    /// versions are accepted as long as the four fields are well formed.
    pub fn parse(value: &str) -> Result<Traceparent, TraceparentError> {
        let mut parts = value.trim().split('-');
        let version = parts.next().ok_or(TraceparentError::FieldCount)?;
        let trace_id = parts.next().ok_or(TraceparentError::FieldCount)?;
        let parent_id = parts.next().ok_or(TraceparentError::FieldCount)?;
        let flags = parts.next().ok_or(TraceparentError::FieldCount)?;
        // Future versions may append fields; four is the minimum.

        let version = parse_hex_u8(version)?;
        if version == 0xff {
            return Err(TraceparentError::InvalidVersion);
        }
        check_hex(trace_id, 32)?;
        check_hex(parent_id, 16)?;
        let flags = parse_hex_u8(flags)?;

        if trace_id.bytes().all(|b| b == b'0') || parent_id.bytes().all(|b| b == b'0') {
            return Err(TraceparentError::ZeroId);
        }

        Ok(Traceparent {
            version,
            trace_id: trace_id.to_string(),
            parent_id: parent_id.to_string(),
            flags,
        })
    }
}

impl fmt::Display for Traceparent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}-{}-{}-{:02x}",
            self.version, self.trace_id, self.parent_id, self.flags
        )
    }
}

fn check_hex(s: &str, len: usize) -> Result<(), TraceparentError> {
    if s.len() != len || !s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
        return Err(TraceparentError::BadField);
    }
    Ok(())
}

fn parse_hex_u8(s: &str) -> Result<u8, TraceparentError> {
    if s.len() != 2 || s.bytes().any(|b| b.is_ascii_uppercase()) {
        return Err(TraceparentError::BadField);
    }
    u8::from_str_radix(s, 16).map_err(|_| TraceparentError::BadField)
}
