//! Mesh overlay between controller peers.
//!
//! Peer discovery by UDP solicitation, lollipop-sequenced link-state
//! flooding, effective-adjacency computation, next-hop routing, reliable
//! unicast with ACK/timeout, and broadcast.

pub mod discovery;
pub mod error;
pub mod message;
pub mod node;
pub mod sequence;
pub mod topology;

pub use discovery::{parse_solicitation, solicitation, Backoff, SOLICIT_PREFIX};
pub use error::MeshError;
pub use message::{MeshMessage, MeshPayload};
pub use node::{Delivery, MeshConfig, Node, RelayHook};
pub use sequence::{SequenceSource, SequenceTracker, LOLLIPOP_THRESHOLD};
pub use topology::Topology;
