// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Favicon hashing compatible with public favicon-hash databases.
//!
//! The bytes are standard-base64 encoded, wrapped to 76-character lines with
//! a trailing newline (the MIME layout those databases were built with), and
//! hashed with 32-bit MurmurHash3 (seed 0) interpreted as a signed integer.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::io::Cursor;

const LINE_WIDTH: usize = 76;

fn wrapped_base64(raw: &[u8]) -> Vec<u8> {
    let encoded = STANDARD.encode(raw);
    let mut out = Vec::with_capacity(encoded.len() + encoded.len() / LINE_WIDTH + 1);
    for line in encoded.as_bytes().chunks(LINE_WIDTH) {
        out.extend_from_slice(line);
        if line.len() == LINE_WIDTH {
            out.push(b'\n');
        }
    }
    out.push(b'\n');
    out
}

pub fn favicon_hash(raw: &[u8]) -> i32 {
    let buf = wrapped_base64(raw);
    // reading from an in-memory cursor cannot fail
    let h = murmur3::murmur3_32(&mut Cursor::new(buf), 0).unwrap_or_default();
    h as i32
}

/// Parse a rule literal as a signed 32-bit hash.
pub fn parse_rule_hash(rule: &str) -> Option<i32> {
    rule.trim().parse::<i32>().ok()
}
