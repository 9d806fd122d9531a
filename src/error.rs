use std::path::PathBuf;
use thiserror::Error;

/// Failures talking to the remote document.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The endpoint answered with a non-2xx status.
    #[error("RPC {function} failed with status {status}: {body}")]
    Status {
        function: String,
        status: u16,
        body: String,
    },

    /// The call went through but the remote function reported an error.
    #[error("RPC {function} returned an error: {message}")]
    Remote { function: String, message: String },

    #[error("RPC {function} returned an unexpected payload: {source}")]
    Decode {
        function: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("RPC transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
