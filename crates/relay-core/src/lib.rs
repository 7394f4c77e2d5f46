//! relay-core: shared wire vocabulary for the P2P firewall relay.
//!
//! Provides CBOR framing, broker address conventions, certificate
//! fingerprints, and the message types exchanged on the bridge control
//! address, between peers, and across the inner/outer tunnel.

pub mod codec;
pub mod error;
pub mod identity;
pub mod messages;
pub mod names;

// Re-export commonly used items at crate root.
pub use codec::{cbor_decode, cbor_encode, frame_encode, read_frame, write_frame};
pub use error::{RelayError, RelayResult};
pub use identity::{fingerprint, short_fingerprint};
pub use messages::{
    BridgeControl, BridgeEntry, Envelope, HostPort, IdentityMaterial, PeerFrame, TunnelControl,
    TunnelData, TunnelFrame, CHANNEL_CONTROL, CHANNEL_DATA,
};
