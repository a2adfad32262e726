use std::time::Duration;

use thiserror::Error;

/// JSON-RPC codes providers use for "block range too large".
const RANGE_TOO_LARGE_CODES: [i64; 2] = [-32062, -32602];

/// JSON-RPC codes providers use for throttling instead of an HTTP 429.
const THROTTLE_CODES: [i64; 4] = [429, -32005, -32029, -32090];

const METHOD_NOT_FOUND: i64 = -32601;

/// Floor applied to every rate-limit backoff, whatever the provider says.
pub const MIN_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Everything that can go wrong talking to a single JSON-RPC endpoint.
#[derive(Debug, Error)]
pub enum RpcError {
    /// HTTP 429/503 or a vendor throttling code.
    #[error("{method}: rate limited, retry after {}ms", .retry_after.as_millis())]
    RateLimited {
        method: &'static str,
        retry_after: Duration,
    },

    /// HTTP 401/403. The endpoint is misconfigured, retrying will not help.
    #[error("{method}: unauthorized (HTTP {status})")]
    Unauthorized { method: &'static str, status: u16 },

    /// A hex field the caller cannot do without failed to parse.
    #[error("{method}: invalid hex in `{field}`: {raw:?}")]
    InvalidHex {
        method: &'static str,
        field: &'static str,
        raw: Option<String>,
    },

    /// Any other JSON-RPC `error` object.
    #[error("{method}: rpc error {code}: {message}")]
    Rpc {
        method: &'static str,
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Non-success HTTP status that is not one of the classified ones.
    #[error("{method}: HTTP {status}: {body}")]
    Http {
        method: &'static str,
        status: u16,
        body: String,
    },

    #[error("{method}: transport error: {source}")]
    Transport {
        method: &'static str,
        #[source]
        source: reqwest::Error,
    },

    /// The response body was not a JSON-RPC envelope we understand.
    #[error("{method}: malformed response: {detail}")]
    Malformed { method: &'static str, detail: String },

    /// `null` where the caller needs a value (unknown block, pending receipt).
    #[error("{method}: no result for {what}")]
    Missing { method: &'static str, what: String },
}

/// How a poller should react to a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Shrink the span and retry.
    RangeTooLarge,
    /// Back off for at least this long, do not blame the endpoint.
    RateLimited(Duration),
    /// Demote the endpoint that produced this error.
    Endpoint(EndpointHealth),
    /// Fail the cycle; the next one retries from the same checkpoint.
    Other,
}

/// Health string persisted to `chain_endpoints.last_health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointHealth {
    Ok,
    Unauthorized,
    InvalidHex,
}

impl EndpointHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointHealth::Ok => "ok",
            EndpointHealth::Unauthorized => "unauthorized",
            EndpointHealth::InvalidHex => "invalid_hex",
        }
    }
}

impl RpcError {
    /// The single decision table every poller uses.
    pub fn class(&self) -> ErrorClass {
        match self {
            RpcError::RateLimited { retry_after, .. } => {
                ErrorClass::RateLimited((*retry_after).max(MIN_RETRY_AFTER))
            }
            RpcError::Unauthorized { .. } => ErrorClass::Endpoint(EndpointHealth::Unauthorized),
            RpcError::InvalidHex { .. } => ErrorClass::Endpoint(EndpointHealth::InvalidHex),
            RpcError::Rpc { code, message, .. } => {
                if RANGE_TOO_LARGE_CODES.contains(code)
                    || mentions_payload_too_large(message)
                    || mentions_result_limit(message)
                {
                    ErrorClass::RangeTooLarge
                } else {
                    ErrorClass::Other
                }
            }
            RpcError::Http { status, body, .. } => {
                if *status == 413 || mentions_payload_too_large(body) {
                    ErrorClass::RangeTooLarge
                } else {
                    ErrorClass::Other
                }
            }
            RpcError::Transport { .. } | RpcError::Malformed { .. } | RpcError::Missing { .. } => {
                ErrorClass::Other
            }
        }
    }

    pub fn is_method_not_found(&self) -> bool {
        matches!(self, RpcError::Rpc { code, .. } if *code == METHOD_NOT_FOUND)
    }

    /// Build the error for a JSON-RPC `error` object, routing throttling codes
    /// to [`RpcError::RateLimited`].
    pub fn from_rpc_object(
        method: &'static str,
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
        fallback_retry: Duration,
    ) -> Self {
        // Infura shares -32005 between throttling and oversized log queries.
        if THROTTLE_CODES.contains(&code) && !mentions_result_limit(&message) {
            return RpcError::RateLimited {
                method,
                retry_after: fallback_retry.max(MIN_RETRY_AFTER),
            };
        }
        RpcError::Rpc {
            method,
            code,
            message,
            data,
        }
    }
}

fn mentions_payload_too_large(text: &str) -> bool {
    text.to_ascii_lowercase().contains("payload too large")
}

/// Provider wording for "the range holds too many logs".
fn mentions_result_limit(text: &str) -> bool {
    let text = text.to_ascii_lowercase();
    (text.contains("more than") && text.contains("results"))
        || text.contains("response size")
        || text.contains("block range")
        || text.contains("range is too large")
}

/// Classify an orchestration error. Anything that is not an [`RpcError`]
/// (decode failures, database errors) fails the cycle.
pub fn classify(err: &eyre::Report) -> ErrorClass {
    err.downcast_ref::<RpcError>()
        .map(RpcError::class)
        .unwrap_or(ErrorClass::Other)
}
