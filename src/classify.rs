// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Transport error classification.
//!
//! Scanning many heterogeneous hosts produces a steady stream of failures.
//! Only DNS and certificate failures abandon a target; everything else is
//! logged and left to the sibling probes.

use std::error::Error as StdError;
use std::fmt;
use std::io;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Connection,
    Timeout,
    Dns,
    Http2,
    Protocol,
    Certificate,
    Generic,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Connection => "CONNECTION",
            ErrorCategory::Timeout => "TIMEOUT",
            ErrorCategory::Dns => "DNS",
            ErrorCategory::Http2 => "HTTP2",
            ErrorCategory::Protocol => "PROTOCOL",
            ErrorCategory::Certificate => "CERTIFICATE",
            ErrorCategory::Generic => "GENERIC",
        }
    }

    /// Terminal categories stop every remaining probe for a target.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ErrorCategory::Dns | ErrorCategory::Certificate)
    }

    /// Transient categories are expected noise and logged as warnings.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Timeout
                | ErrorCategory::Connection
                | ErrorCategory::Http2
                | ErrorCategory::Protocol
        )
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    pub category: ErrorCategory,
    pub message: String,
}

/// Flatten an error and its `source()` chain into one lowercase string.
fn chain_text(err: &(dyn StdError + 'static)) -> String {
    let mut parts = Vec::new();
    let mut cur = Some(err);
    while let Some(e) = cur {
        parts.push(e.to_string());
        cur = e.source();
    }
    parts.join(": ").to_ascii_lowercase()
}

fn io_kind(err: &(dyn StdError + 'static)) -> Option<io::ErrorKind> {
    let mut cur = Some(err);
    while let Some(e) = cur {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            return Some(io_err.kind());
        }
        cur = e.source();
    }
    None
}

/// Map an error to its category and a short operator-facing message.
pub fn classify(err: &(dyn StdError + 'static)) -> Classified {
    let msg = chain_text(err);
    let kind = io_kind(err);
    let has = |needle: &str| msg.contains(needle);

    let (category, message) = if has("actively refused")
        || has("connection refused")
        || has("malformed")
    {
        (ErrorCategory::Connection, "Connection refused / malformed".to_string())
    } else if has("reset by peer")
        || has("connection reset")
        || has("broken pipe")
        || has("eof")
    {
        (ErrorCategory::Connection, "Connection reset".to_string())
    } else if has("connection closed before message completed") || has("incomplete message") {
        (ErrorCategory::Connection, "Connection closed early".to_string())
    } else if has("timeout") || has("timed out") || kind == Some(io::ErrorKind::TimedOut) {
        (ErrorCategory::Timeout, "Timeout".to_string())
    } else if has("dns")
        || has("no such host")
        || has("failed to lookup address")
        || has("name or service not known")
        || has("nodename nor servname")
    {
        (ErrorCategory::Dns, "DNS resolution failed".to_string())
    } else if has("stream closed") || has("h2 protocol error") || has("go away") {
        (ErrorCategory::Http2, "HTTP/2 stream closed by peer".to_string())
    } else if has("does not allow body") || has("not allowed for this status") {
        (
            ErrorCategory::Protocol,
            "Response body not allowed for this status/method".to_string(),
        )
    } else if has("aborted") {
        (ErrorCategory::Connection, "Local connection aborted".to_string())
    } else if has("x509") || has("invalid peer certificate") || has("certificate verify failed")
    {
        (ErrorCategory::Certificate, "Certificate error".to_string())
    } else if matches!(
        kind,
        Some(io::ErrorKind::ConnectionRefused)
            | Some(io::ErrorKind::ConnectionReset)
            | Some(io::ErrorKind::ConnectionAborted)
    ) {
        (ErrorCategory::Connection, "System network error".to_string())
    } else {
        (ErrorCategory::Generic, err.to_string())
    };

    Classified { category, message }
}

/// Whether an error should abandon the remaining probes of a target.
pub fn should_terminate(err: &(dyn StdError + 'static)) -> bool {
    classify(err).category.is_terminal()
}

/// Log an error at the severity its category deserves and return the category.
pub fn log_error(err: &(dyn StdError + 'static), url: &str) -> ErrorCategory {
    let c = classify(err);
    if c.category.is_transient() {
        warn!(category = %c.category, "Request {} Error: {}", url, c.message);
    } else {
        error!(category = %c.category, "Request {} Error: {}", url, c.message);
    }
    c.category
}
