pub mod errors;
pub mod id;

pub use errors::{ConfigError, VoiceError, VoxmeshError};
pub use id::{new_id, PeerId, INVALID_PEER_ID};

pub type Result<T> = std::result::Result<T, VoxmeshError>;
