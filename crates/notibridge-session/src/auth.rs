//! Login and token pairing.

use serde_json::{Value, json};
use tokio::time::Duration;
use tracing::{debug, info, warn};

use notibridge_core::config::SessionConfig;
use notibridge_core::protocol::{Inbound, parse_frame};

use crate::correlator::RequestCorrelator;
use crate::error::{AuthError, SessionError, TransportError};
use crate::transport::{Connector, FrameSender, TransportEvent};

pub const ACTION_LOGIN: &str = "login";
pub const ACTION_REQUEST_TOKEN: &str = "request_token";

/// Result of a successful login.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoginOutcome {
    /// Replacement token issued by the device, if it rotated the old one.
    pub refreshed_token: Option<String>,
}

/// Authenticate an open transport with the device's stored token.
pub async fn login(
    correlator: &RequestCorrelator,
    sender: &FrameSender,
    token: Option<&str>,
    timeout: Duration,
) -> Result<LoginOutcome, AuthError> {
    let token = token
        .filter(|t| !t.is_empty())
        .ok_or(AuthError::MissingToken)?;

    let response = correlator
        .request(sender, ACTION_LOGIN, json!({ "token": token }), timeout)
        .await?;

    if !response.success {
        let message = response
            .message
            .unwrap_or_else(|| "device refused the token".to_string());
        warn!(%message, "Login rejected");
        return Err(AuthError::Rejected { message });
    }

    let refreshed_token = response
        .payload_str("token")
        .filter(|t| !t.is_empty() && *t != token)
        .map(String::from);
    debug!(refreshed = refreshed_token.is_some(), "Login accepted");
    Ok(LoginOutcome { refreshed_token })
}

/// Ask the device at `endpoint` to issue a new token.
///
/// Opens a short-lived transport. The device usually answers `pending`
/// first and sends the final answer once the user approves or rejects
/// the pairing on the phone.
pub async fn request_token<C: Connector>(
    connector: &C,
    endpoint: &str,
    config: &SessionConfig,
) -> Result<String, SessionError> {
    let connect_timeout = config.connect_timeout();
    let mut transport = tokio::time::timeout(connect_timeout, connector.connect(endpoint))
        .await
        .map_err(|_| TransportError::ConnectTimeout(duration_ms(connect_timeout)))??;
    info!(endpoint, transport = %transport.id(), "Requesting token from device");

    let correlator = RequestCorrelator::new(
        format!("pair_{}", transport.id()),
        config.approval_timeout(),
    );
    let sender = transport.sender();
    let request = correlator.request(
        &sender,
        ACTION_REQUEST_TOKEN,
        Value::Null,
        config.request_timeout(),
    );
    tokio::pin!(request);

    let result = loop {
        tokio::select! {
            result = &mut request => break result,
            event = transport.recv() => match event {
                Some(TransportEvent::Frame(text)) => match parse_frame(&text) {
                    Ok(Inbound::Response(response)) => {
                        correlator.complete(response);
                    }
                    Ok(_) => debug!("Ignoring push frame during pairing"),
                    Err(e) => warn!(error = %e, "Dropping malformed frame during pairing"),
                },
                Some(TransportEvent::Closed(reason)) => {
                    debug!(%reason, "Pairing transport closed");
                    correlator.fail_all();
                    break request.await;
                }
                None => {
                    correlator.fail_all();
                    break request.await;
                }
            },
        }
    };
    transport.close();

    let response = result.map_err(AuthError::from)?;
    if response.payload_bool("rejected") {
        warn!(endpoint, "Pairing rejected on device");
        return Err(AuthError::Denied.into());
    }
    match response.payload_str("token") {
        Some(token) if !token.is_empty() => {
            info!(endpoint, "Token issued");
            Ok(token.to_string())
        }
        _ => Err(AuthError::Rejected {
            message: response
                .message
                .unwrap_or_else(|| "no token in authorization response".to_string()),
        }
        .into()),
    }
}

#[allow(clippy::cast_possible_truncation)]
pub(crate) const fn duration_ms(d: Duration) -> u64 {
    d.as_millis() as u64
}
