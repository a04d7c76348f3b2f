// ── Southbound device access ──
//
// Shared capability layer for the three reconcilers: dial a device agent,
// fold its structured notifications into typed reports, and run the
// long-lived subscription monitors that stream changes back through
// per-reconciler event channels.
//
// Sessions are cached per (device, agent role); a transport-broken session
// is evicted so the next sweep redials instead of reusing a dead socket.

mod hosts;
mod links;
mod ports;

pub use hosts::{HostEntry, HostEvent, HostReport, HostScanner};
pub use links::{IngressLink, LinkEvent, LinkReport, LinkScanner};
pub use ports::{PortScanner, PortStatusEvent};

use chrono::Utc;

/// Current wall clock as unix nanoseconds, the clock used for stamping
/// transitions the device itself did not timestamp.
pub(crate) fn now_nanos() -> u64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX) as u64
}
