use thiserror::Error;

/// Errors surfaced by the gateway client.
///
/// Communication variants distinguish the device from the Enlighten cloud
/// so callers can tell a flaky LAN from a cloud outage. Authentication
/// variants are never retried silently; the reader performs at most one
/// bounded recovery attempt before surfacing them.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("error communicating with the gateway: {0}")]
    GatewayCommunication(String),

    #[error("error communicating with the Enlighten cloud: {0}")]
    CloudCommunication(String),

    #[error("the Enlighten cloud rejected the account credentials")]
    CloudAuthentication,

    #[error("the gateway rejected the configured credentials: {0}")]
    GatewayAuthentication(String),

    #[error("invalid or expired token: {0}")]
    InvalidToken(String),

    #[error("authentication is not configured: {0}")]
    AuthenticationRequired(String),

    #[error("gateway setup failed: {0}")]
    Setup(String),

    #[error("malformed payload from '{path}': {reason}")]
    Decode { path: String, reason: String },
}

impl GatewayError {
    /// True for errors that indicate the current credentials or session
    /// are no longer accepted, as opposed to transport trouble.
    pub fn is_auth_error(&self) -> bool {
        matches!(
            self,
            GatewayError::GatewayAuthentication(_)
                | GatewayError::InvalidToken(_)
                | GatewayError::AuthenticationRequired(_)
                | GatewayError::CloudAuthentication
        )
    }
}
