//! Provider subprocess protocol.
//!
//! Calendars, payment processors and mailers are reached through external
//! provider binaries (e.g. `slotbook-provider-google`) that read one JSON
//! request on stdin and write one JSON response on stdout. Any executable
//! that speaks the protocol can be a provider.
//!
//! Providers manage their own credentials. Core only forwards the
//! provider-specific parameters from its config section.

pub mod protocol;

use std::process::Stdio;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command as TokioCommand;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{BookingError, BookingResult};
use protocol::{Command, ProviderCommand, Request, Response};

const PROVIDER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider(String);

impl Provider {
    pub fn from_name(name: &str) -> Self {
        Provider(name.to_string())
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    pub fn binary_name(&self) -> String {
        format!("slotbook-provider-{}", self.0)
    }

    fn binary_path(&self) -> BookingResult<std::path::PathBuf> {
        let binary_name = self.binary_name();
        which::which(&binary_name).map_err(|_| BookingError::ProviderNotInstalled(binary_name))
    }

    /// Call a typed provider command. The response type follows from the command.
    pub async fn call<C: ProviderCommand>(&self, cmd: C) -> BookingResult<C::Response> {
        timeout(PROVIDER_TIMEOUT, self.call_raw(C::command(), cmd))
            .await
            .map_err(|_| BookingError::ProviderTimeout(PROVIDER_TIMEOUT.as_secs()))?
    }

    async fn call_raw<P: Serialize, R: DeserializeOwned>(
        &self,
        command: Command,
        params: P,
    ) -> BookingResult<R> {
        let params = serde_json::to_value(params)?;
        let request_json = serde_json::to_string(&Request { command, params })?;

        let binary_path = self.binary_path()?;
        debug!(provider = %self.0, ?command, "Calling provider");

        let mut child = TokioCommand::new(&binary_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BookingError::Provider(format!("Failed to spawn {}: {}", binary_path.display(), e))
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| BookingError::Provider("Provider stdin unavailable".into()))?;
        stdin
            .write_all(format!("{request_json}\n").as_bytes())
            .await?;
        drop(stdin);

        let output = child.wait_with_output().await?;

        if !output.status.success() {
            return Err(BookingError::Provider(format!(
                "Provider '{}' exited with status: {}",
                self.0,
                output.status.code().unwrap_or(-1)
            )));
        }

        parse_response(&String::from_utf8_lossy(&output.stdout))
    }
}

fn parse_response<R: DeserializeOwned>(stdout: &str) -> BookingResult<R> {
    if stdout.trim().is_empty() {
        return Err(BookingError::Provider("Provider returned no response".into()));
    }

    let response: Response<R> = serde_json::from_str(stdout)
        .map_err(|e| BookingError::Provider(format!("Failed to parse response: {}", e)))?;

    match response {
        Response::Success { data } => Ok(data),
        Response::Error { error } => Err(BookingError::Provider(error)),
    }
}

/// A provider plus the parameters forwarded with every call, as configured:
///
/// ```toml
/// [calendar]
/// provider = "google"
/// google_account = "me@example.com"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub provider: Provider,
    #[serde(flatten)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl ProviderConfig {
    pub fn new(provider: Provider) -> Self {
        ProviderConfig {
            provider,
            params: serde_json::Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payment::{Refund, RefundStatus};

    #[test]
    fn test_parse_success_and_error() {
        let url: String =
            parse_response(r#"{"status":"success","data":"https://pay.example/s/1"}"#).unwrap();
        assert_eq!(url, "https://pay.example/s/1");

        let refund: Refund =
            parse_response(r#"{"status":"success","data":{"id":"re_1","status":"pending"}}"#)
                .unwrap();
        assert_eq!(refund.status, RefundStatus::Pending);

        let err = parse_response::<()>(r#"{"status":"error","error":"card_declined"}"#).unwrap_err();
        assert_eq!(err.to_string(), "Provider error: card_declined");

        assert!(parse_response::<()>("  \n").is_err());
        assert!(parse_response::<()>("not json").is_err());
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let provider = Provider::from_name("does-not-exist-4bd1");
        let err = provider
            .call(protocol::DeleteEvent {
                params: serde_json::Map::new(),
                event_id: "evt-1".into(),
            })
            .await
            .unwrap_err();
        match err {
            BookingError::ProviderNotInstalled(name) => {
                assert_eq!(name, "slotbook-provider-does-not-exist-4bd1")
            }
            other => panic!("Unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_provider_config_flattens_params() {
        let config: ProviderConfig = serde_json::from_value(serde_json::json!({
            "provider": "google",
            "google_account": "me@example.com",
        }))
        .unwrap();
        assert_eq!(config.provider.name(), "google");
        assert_eq!(config.params["google_account"], "me@example.com");

        let request = serde_json::to_value(protocol::CancelSessions {
            params: config.params.clone(),
            booking_id: "b-1".into(),
        })
        .unwrap();
        assert_eq!(request["google_account"], "me@example.com");
        assert_eq!(request["booking_id"], "b-1");
    }
}
