//! Error taxonomy for the supervisor

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Listener socket could not be opened; the channel is classified unavailable, never retried
#[derive(Debug, Error)]
pub enum BindError {
    #[error("invalid UDP port {0}")]
    InvalidPort(u16),
    #[error("invalid listen address '{0}'")]
    InvalidAddress(String),
    #[error("port {port} on {addr} is already in use")]
    PortInUse { addr: String, port: u16 },
    #[error("address {addr} is not available on this host: {source}")]
    AddressUnavailable {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to open UDP socket on {addr}: {source}")]
    Io {
        addr: String,
        #[source]
        source: io::Error,
    },
}

/// Encoder could not be started
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("an encoder is already active for channel '{0}'")]
    AlreadyActive(String),
    #[error("executable '{program}' not found")]
    ExecutableNotFound { program: String },
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
}

impl LaunchError {
    pub fn from_spawn(program: &str, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            LaunchError::ExecutableNotFound { program: program.to_string() }
        } else {
            LaunchError::Spawn { program: program.to_string(), source }
        }
    }
}

/// Structural probe failed; the user has to re-trigger the scan
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("prober executable '{program}' not found")]
    ExecutableNotFound { program: String },
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("prober exited with code {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },
    #[error("malformed prober output: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("prober i/o error: {0}")]
    Io(#[source] io::Error),
}

/// Indirect platform link could not be turned into a media URL
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("resolver executable '{program}' not found")]
    ExecutableNotFound { program: String },
    #[error("resolver timed out after {0:?}")]
    Timeout(Duration),
    #[error("resolver exited with code {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },
    #[error("resolver returned an empty URL")]
    EmptyUrl,
    #[error("resolver i/o error: {0}")]
    Io(#[source] io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Errors returned synchronously by registry commands
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("unknown channel '{0}'")]
    UnknownChannel(String),
    #[error("channel '{0}' already exists")]
    DuplicateChannel(String),
    #[error("UDP input {ip}:{port} is already used by running channel '{other}'")]
    ConfigConflict { ip: String, port: u16, other: String },
    #[error("channel '{0}' has no usable input configured")]
    MissingInput(String),
    #[error("channel '{0}' has no usable output configured")]
    MissingOutput(String),
    #[error("channel '{0}' is already streaming or starting")]
    AlreadyActive(String),
    #[error("channel '{0}' is busy scanning")]
    ChannelBusy(String),
    #[error("input port of channel '{0}' is held by a scan or preview")]
    PortBusy(String),
    #[error("no preview is running")]
    PreviewNotRunning,
    #[error("supervisor is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
