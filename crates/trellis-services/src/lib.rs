//! The stateful parts of a Trellis node.
//!
//! Reachability registry, chunk reassembly and splitting, and the TCP
//! fallback pair. Everything here is transport-agnostic apart from the
//! fallback, which speaks TCP itself and wraps a [`PrimaryTransport`] for
//! everything else.

pub mod chunker;
pub mod fallback;
pub mod peer;
pub mod reassembly;
pub mod transport;

pub use chunker::{aggregate, MessageSplitter, SplitError};
pub use fallback::{FallbackClient, FallbackError, FallbackServer, ServerOptions};
pub use peer::{
    Path, PathKind, PeerInformation, PeerRecord, PeerRegistry, PeerSnapshot, Reachability,
    ReachabilityEvent,
};
pub use reassembly::{ReassemblyBuffer, ReassemblyError, TimeoutTicket};
pub use transport::{Direct, Outbound, PrimaryTransport, SendError};
