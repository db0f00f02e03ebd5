use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("config parse error: {0}")]
    ParseError(String),

    #[error("config validation error: {0}")]
    ValidationError(String),
}

/// Failures surfaced by a voice-channel session.
///
/// Transport and media errors are transient from the user's point of view,
/// auth errors need a fresh credential, and negotiation errors only ever
/// affect a single peer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VoiceError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("transport gave up after {attempts} reconnect attempts")]
    TransportExhausted { attempts: u32 },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("media access error: {0}")]
    MediaAccess(String),

    #[error("negotiation with {peer} failed: {reason}")]
    Negotiation { peer: String, reason: String },

    #[error("signaling channel is not connected")]
    NotConnected,

    #[error("ice server lookup failed: {0}")]
    IceServers(String),

    #[error("voice session closed")]
    Closed,
}

impl VoiceError {
    /// Whether the user can reasonably retry the action that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::TransportExhausted { .. } | Self::MediaAccess(_)
        )
    }

    /// Whether recovering requires the user to sign in again.
    pub fn requires_sign_in(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// Negotiation errors stay internal; everything else is worth showing.
    pub fn is_user_visible(&self) -> bool {
        !matches!(self, Self::Negotiation { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VoxmeshError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Voice(#[from] VoiceError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}
