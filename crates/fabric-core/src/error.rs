use thiserror::Error;

use fabric_api::Fault;

/// Unified error type for the discovery core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Failure talking to the catalog or a device agent.
    #[error(transparent)]
    Api(#[from] fabric_api::Error),

    /// Invalid runtime configuration, rejected at startup.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A northbound operation arrived before the controller reached its
    /// monitoring state.
    #[error("controller not ready yet")]
    NotReady,

    /// A device answered, but the report is unusable.
    #[error("invalid device report: {0}")]
    InvalidReport(String),
}

impl CoreError {
    /// True for failures the next sweep is expected to repair.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Api(e) if e.is_transient())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Api(e) if e.is_not_found())
    }

    /// Map into a wire fault for northbound callers.
    pub fn to_fault(&self) -> Fault {
        match self {
            Self::NotReady => Fault::unavailable(self.to_string()),
            Self::Config(_) | Self::InvalidReport(_) => Fault::invalid_argument(self.to_string()),
            Self::Api(fabric_api::Error::Fault(fault)) => fault.clone(),
            Self::Api(_) => Fault::internal(self.to_string()),
        }
    }
}
