// Peer-to-peer networking: wire codec, peer sessions, and the node

pub mod message;
pub mod node;
pub mod peer;

pub use message::{GetHeadersMessage, Inventory, InvType, Message, NetAddress, VersionMessage};
pub use node::Node;
pub use peer::{PeerError, PeerInfo, PeerSession, RequestTracker, SessionState};
