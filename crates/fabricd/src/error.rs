//! Daemon error types with miette diagnostics and process exit codes.

use miette::Diagnostic;
use thiserror::Error;

pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const CONFIG: i32 = 2;
    pub const TLS: i32 = 3;
    pub const BIND: i32 = 7;
}

#[derive(Debug, Error, Diagnostic)]
pub enum DaemonError {
    #[error("invalid configuration: {message}")]
    #[diagnostic(
        code(fabricd::config),
        help("Check the realm and neighbor-realm flags; selectors must not overlap.")
    )]
    Config { message: String },

    #[error("unable to load TLS material: {message}")]
    #[diagnostic(
        code(fabricd::tls),
        help("Both --tls-cert and --tls-key must point at readable PEM files.")
    )]
    Tls { message: String },

    #[error("unable to bind northbound endpoint {address}")]
    #[diagnostic(
        code(fabricd::bind),
        help("Is another process already listening on this address?")
    )]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Core(#[from] fabric_core::CoreError),
}

impl DaemonError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config { .. } => exit_code::CONFIG,
            Self::Tls { .. } => exit_code::TLS,
            Self::Bind { .. } => exit_code::BIND,
            Self::Core(_) => exit_code::GENERAL,
        }
    }
}
