// ── Reconcilers ──
//
// Translate per-device southbound observations into catalog mutations.
// All three are value-holding objects with internal locks; the worker pool
// invokes them in port → link → host order for one device at a time, while
// their subscription pumps apply streamed changes concurrently. Both paths
// rely on create-if-absent and update-if-newer semantics, so interleavings
// converge on the create-time clock.

mod hosts;
mod links;
mod ports;

pub use hosts::HostReconciler;
pub use links::LinkReconciler;
pub use ports::PortReconciler;

use crate::error::CoreError;

/// Create-if-absent: an already-exists collision means another path won
/// the race, which is success for our purposes.
pub(crate) fn absorb_existing(result: Result<(), fabric_api::Error>) -> Result<(), CoreError> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_already_exists() => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Read-modify-write against a concurrently deleted object is skipped,
/// not failed; the next sweep re-creates whatever should exist.
pub(crate) fn absorb_missing(result: Result<(), fabric_api::Error>) -> Result<(), CoreError> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e.into()),
    }
}
