//! Error taxonomy for parsing, marker resolution and process launches
//!
//! None of these abort message processing. Each is absorbed and logged at
//! the point where it occurs.

use thiserror::Error;

use crate::marker::MarkerId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CueError {
    /// A `!`-prefixed token that looked like a command but yields no argv
    #[error("malformed command token '{0}'")]
    MalformedToken(String),

    /// Marker event for an id the registry never handed out
    #[error("marker {0} was never allocated")]
    UnknownMarker(MarkerId),

    /// Marker event for an id whose unit already completed and released it
    #[error("marker {0} has no pending command")]
    StaleMarker(MarkerId),

    #[error("command for marker {0} was already launched")]
    AlreadyLaunched(MarkerId),

    #[error("all marker ids in {first}..={last} are in use")]
    RegistryFull { first: MarkerId, last: MarkerId },

    #[error("failed to launch {program}: {reason}")]
    ProcessLaunch { program: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, CueError>;
