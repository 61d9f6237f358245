//! Peer identities, network addresses and the peer table.
//!
//! A [`PeerId`] is the stable, wallet-derived identity used as the primary
//! key for sessions, contacts and routing. An [`Address`] is an ephemeral way
//! to reach a peer over one transport; many addresses may map to one peer.

pub mod address;
pub mod peer_id;
pub mod peer_store;

pub use address::{Address, TransportKind};
pub use peer_id::{create_peer_id, ChainType, PeerId};
pub use peer_store::{PeerRecord, PeerStore};
