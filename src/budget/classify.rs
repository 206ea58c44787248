//! Error classification for collaborator failures.
//!
//! Collaborators that know what went wrong return an [`RpcFault`] (directly or
//! wrapped in context); anything else is classified by matching well-known
//! fragments of the rendered error message.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcErrorKind {
    RateLimit,
    Timeout,
    ServerError,
    Network,
    Unknown,
}

impl fmt::Display for RpcErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RpcErrorKind::RateLimit => "rate limit",
            RpcErrorKind::Timeout => "timeout",
            RpcErrorKind::ServerError => "server error",
            RpcErrorKind::Network => "network",
            RpcErrorKind::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// Typed failure returned by ingesters and head fetchers that can name the cause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcFault {
    kind: RpcErrorKind,
    message: String,
}

impl RpcFault {
    pub fn new(kind: RpcErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::RateLimit, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::Timeout, message)
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::ServerError, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::Network, message)
    }

    pub fn kind(&self) -> RpcErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for RpcFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.kind)
    }
}

impl std::error::Error for RpcFault {}

const RATE_LIMIT_MARKERS: &[&str] = &[
    "rate limit",
    "rate-limit",
    "ratelimit",
    "too many requests",
    "quota exceeded",
];
const TIMEOUT_MARKERS: &[&str] = &["timeout", "timed out", "etimedout", "deadline exceeded"];
const SERVER_ERROR_MARKERS: &[&str] = &[
    "internal server error",
    "bad gateway",
    "service unavailable",
    "gateway timeout",
];
const NETWORK_MARKERS: &[&str] = &[
    "econnrefused",
    "econnreset",
    "enotfound",
    "connection refused",
    "connection reset",
    "socket hang up",
    "network",
    "dns",
];

/// Words that mark the next number in a message as an HTTP status.
const STATUS_CONTEXT: &[&str] = &["http", "status", "code", "error", "returned", "response"];

/// Finds one of `codes` as a standalone status: the first token of a
/// `": "`-separated segment, or right after a [`STATUS_CONTEXT`] word.
/// Block numbers and ranges in context lines never qualify.
fn has_status_code(message: &str, codes: &[&str]) -> bool {
    message.split(": ").any(|segment| {
        let mut previous: Option<&str> = None;
        for token in segment
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|token| !token.is_empty())
        {
            if codes.contains(&token)
                && previous.map_or(true, |word| STATUS_CONTEXT.contains(&word))
            {
                return true;
            }
            previous = Some(token);
        }
        false
    })
}

/// Classifies a collaborator error, preferring a typed [`RpcFault`] anywhere in
/// the chain over message matching.
pub fn classify_error(err: &anyhow::Error) -> RpcErrorKind {
    if let Some(fault) = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<RpcFault>())
    {
        return fault.kind();
    }

    classify_message(&format!("{err:#}"))
}

/// Case-insensitive classification for opaque error messages.
pub fn classify_message(message: &str) -> RpcErrorKind {
    let message = message.to_ascii_lowercase();
    let matches_any = |markers: &[&str]| markers.iter().any(|marker| message.contains(marker));

    if matches_any(RATE_LIMIT_MARKERS) || has_status_code(&message, &["429"]) {
        RpcErrorKind::RateLimit
    } else if message.contains("gateway timeout") || has_status_code(&message, &["504"]) {
        // Upstream gateway gave up; the provider failed, not our request.
        RpcErrorKind::ServerError
    } else if matches_any(TIMEOUT_MARKERS) {
        RpcErrorKind::Timeout
    } else if matches_any(SERVER_ERROR_MARKERS)
        || has_status_code(&message, &["500", "502", "503"])
    {
        RpcErrorKind::ServerError
    } else if matches_any(NETWORK_MARKERS) {
        RpcErrorKind::Network
    } else {
        RpcErrorKind::Unknown
    }
}
