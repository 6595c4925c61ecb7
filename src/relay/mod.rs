//! The four relay directions of a session.
//!
//! ```text
//! transport ──transport_to_channel──▶ inbound ──channel_to_process──▶ stdin
//! transport ◀─channel_to_transport─── outbound ◀─process_to_channel── stdout
//! ```
//!
//! Every relay ends on upstream closure or on the first read/write error and
//! never retries. Order is preserved within a direction only.

pub mod bridge;
pub mod lines;

use std::fmt;

pub use bridge::{channel_to_transport, transport_to_channel};
pub use lines::{channel_to_process, process_to_channel, LineLimit, Overflow};

/// Which relay a task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayKind {
    /// Process stdout → outbound channel
    ProcessOutput,
    /// Inbound channel → process stdin
    ProcessInput,
    /// Transport → inbound channel
    TransportInbound,
    /// Outbound channel → transport
    TransportOutbound,
}

impl fmt::Display for RelayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RelayKind::ProcessOutput => "process-output",
            RelayKind::ProcessInput => "process-input",
            RelayKind::TransportInbound => "transport-inbound",
            RelayKind::TransportOutbound => "transport-outbound",
        };
        f.write_str(name)
    }
}
