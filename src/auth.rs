//! Request authentication

use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::net::IpAddr;
use std::time::Duration;

use crate::config::AuthConfig;
use crate::error::{PlaybackError, Result};

/// Delay applied before answering a request whose credentials were rejected
pub const PAUSE_AFTER_AUTH_ERROR: Duration = Duration::from_secs(2);

/// Operation the caller is attempting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthAction {
    Playback,
}

/// Normalized description of an inbound request
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub action: AuthAction,
    pub path: String,
    pub query: String,
    /// Basic credentials, if the client sent any
    pub credentials: Option<(String, String)>,
    pub ip: IpAddr,
}

/// Decides whether a request may proceed
pub trait AuthManager: Send + Sync {
    /// `Ok(())` to allow, otherwise `PlaybackError::Unauthorized`.
    fn authenticate(&self, req: &AuthRequest) -> Result<()>;
}

/// Accepts every request
#[derive(Debug, Default, Clone)]
pub struct AllowAll;

impl AuthManager for AllowAll {
    fn authenticate(&self, _req: &AuthRequest) -> Result<()> {
        Ok(())
    }
}

/// Single static user
#[derive(Debug, Clone)]
pub struct BasicAuth {
    user: String,
    pass: String,
}

impl BasicAuth {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            user: config.user.clone(),
            pass: config.pass.clone(),
        }
    }
}

impl AuthManager for BasicAuth {
    fn authenticate(&self, req: &AuthRequest) -> Result<()> {
        match &req.credentials {
            None => Err(PlaybackError::Unauthorized {
                message: "authentication required".into(),
                ask_credentials: true,
            }),
            Some((user, pass)) if *user == self.user && *pass == self.pass => Ok(()),
            Some((user, _)) => Err(PlaybackError::Unauthorized {
                message: format!("invalid credentials for user '{}' from {}", user, req.ip),
                ask_credentials: false,
            }),
        }
    }
}

/// Decode the value of an `Authorization: Basic ...` header.
pub fn parse_basic_credentials(header: &str) -> Option<(String, String)> {
    let (scheme, encoded) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}
