//! Typed errors for the subsystems that can fail at construction time.
//!
//! Everything that can happen *during* steady-state operation (malformed
//! packets, `EAGAIN`, a full queue while shutting down) is handled locally
//! and logged — see §7 of the design doc. Only resource-acquisition failures
//! propagate as errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("failed to create mio poll instance")]
    Poll(#[source] std::io::Error),
    #[error("failed to create waker")]
    Waker(#[source] std::io::Error),
    #[error("failed to spawn reactor thread")]
    Spawn(#[source] std::io::Error),
}

#[derive(Debug, Error)]
pub enum TimerError {
    #[error("expires ({expires}ms) must be a positive multiple of the resolution ({resolution}ms)")]
    InvalidExpiry { expires: u64, resolution: u64 },
    #[error("timer manager is shutting down")]
    ShuttingDown,
    #[error("failed to spawn timer thread")]
    Spawn(#[source] std::io::Error),
}

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("failed to open {0}")]
    Open(&'static str, #[source] std::io::Error),
    #[error("TUNSETIFF ioctl failed")]
    SetIff(#[source] std::io::Error),
    #[error("failed to configure interface: {0}")]
    Configure(String),
}

#[derive(Debug, Error)]
pub enum UdpError {
    #[error("failed to create socket")]
    Create(#[source] std::io::Error),
    #[error("failed to bind to {addr}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("node `{0}` cannot act as an upstream endpoint (it is a sink)")]
    UpIsSink(String),
    #[error("node `{0}` cannot act as a downstream endpoint (it is a source)")]
    DownIsSource(String),
    #[error("node `{0}` is already registered")]
    AlreadyRegistered(String),
    #[error("node `{0}` has no attached channels")]
    NoChannels(String),
    #[error("full-duplex node `{0}` cannot be run with more than one worker thread")]
    DuplexFanout(String),
    #[error("failed to spawn worker thread for node `{0}`")]
    Spawn(String, #[source] std::io::Error),
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file {path}")]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse settings file {path}")]
    Parse {
        path: std::path::PathBuf,
        #[source]
        source: ini::Error,
    },
}
