//! Conduit RPC transport.
//!
//! Every API call goes through the `arc call-conduit` command-line tool,
//! which handles authentication from the operator's `.arcrc`. Requests are
//! JSON on stdin, responses are a JSON envelope on stdout.

use std::process::Command;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::exec::{run_checked, REMOTE_TIMEOUT};

/// An error reported by the API itself, as opposed to a transport failure.
///
/// Publish-path callers treat these as best-effort and log them; everything
/// else propagates them as fatal.
#[derive(Debug, Error)]
#[error("Conduit call {method} failed: {message}")]
pub struct ConduitError {
    pub method: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    error: Option<String>,
    #[serde(rename = "errorMessage")]
    error_message: Option<String>,
    response: Option<T>,
}

/// Client for the remote review service's RPC interface.
#[derive(Debug, Default)]
pub struct ConduitClient;

impl ConduitClient {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Issue one API call and decode its response payload.
    ///
    /// `None` means the call succeeded but returned no payload, which some
    /// methods use as a silent refusal.
    pub fn call<Req, Resp>(&self, method: &str, request: &Req) -> Result<Option<Resp>>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let input = serde_json::to_vec(request)
            .with_context(|| format!("Failed to encode {method} request"))?;
        debug!(method, request = %String::from_utf8_lossy(&input), "conduit request");

        let mut command = Command::new("arc");
        command.args(["call-conduit", method]);
        let stdout = run_checked(command, Some(&input), Some(REMOTE_TIMEOUT))
            .with_context(|| format!("Conduit call {method} did not complete"))?;
        debug!(method, response = %stdout, "conduit response");

        decode_envelope(method, &stdout)
    }
}

fn decode_envelope<Resp: DeserializeOwned>(method: &str, body: &str) -> Result<Option<Resp>> {
    let envelope: Envelope<Resp> = serde_json::from_str(body)
        .with_context(|| format!("Malformed {method} response: {body}"))?;
    if let Some(error) = envelope.error.filter(|error| !error.is_empty()) {
        return Err(ConduitError {
            method: method.to_string(),
            message: envelope.error_message.unwrap_or(error),
        }
        .into());
    }
    Ok(envelope.response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Payload {
        id: u32,
    }

    #[test]
    fn test_decode_successful_envelope() {
        let payload: Option<Payload> =
            decode_envelope("test.method", r#"{"error":null,"response":{"id":7}}"#)
                .expect("decode");
        assert_eq!(payload, Some(Payload { id: 7 }));
    }

    #[test]
    fn test_decode_empty_response() {
        let payload: Option<Payload> =
            decode_envelope("test.method", r#"{"error":null,"response":null}"#).expect("decode");
        assert_eq!(payload, None);
    }

    #[test]
    fn test_api_error_surfaces_the_message() {
        let result: Result<Option<Payload>> = decode_envelope(
            "test.method",
            r#"{"error":"ERR-CONDUIT-CORE","errorMessage":"no such revision"}"#,
        );
        let err = result.expect_err("api error");
        let conduit = err.downcast_ref::<ConduitError>().expect("typed error");
        assert_eq!(conduit.message, "no such revision");
    }

    #[test]
    fn test_garbage_body_is_an_error() {
        let result: Result<Option<Payload>> = decode_envelope("test.method", "not json");
        assert!(result.is_err());
    }
}
