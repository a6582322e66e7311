use std::fmt;

use rand_core::{OsRng, RngCore as _};
use sha1::{Digest, Sha1};
use thiserror::Error;

/// Low-level cryptographic primitives: DH group arithmetic, AES-128-CBC with
/// the 8-byte wire IV, HMAC-SHA1 and the CSPRNG helpers.
pub mod crypto;
/// Identity and overlay gateway traits the service is wired against.
pub mod gateway;
/// Tunnel item codec and overlay frame classification.
pub mod items;
/// The tunnel service core: handshakes, framing, reliability, dispatch.
pub mod service;

pub use gateway::{
    IdentityGateway, IdentityKey, IdentitySignature, OverlayRouter, OverlayTunnelClient,
    TunnelClientService,
};
pub use items::TunnelItem;
pub use service::GxsTunnelService;

/// Number of bytes in a [`GxsId`].
pub const GXS_ID_SIZE: usize = 16;
/// Number of bytes in a [`TunnelId`] or [`TunnelHash`].
pub const TUNNEL_ID_SIZE: usize = 20;

/// A 16-byte stable pseudonymous identity.
///
/// Ids order byte-lexicographically; [`TunnelId::for_pair`] relies on this to
/// derive the same tunnel name on both endpoints.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GxsId([u8; GXS_ID_SIZE]);

impl GxsId {
    #[must_use]
    pub const fn from_bytes(bytes: [u8; GXS_ID_SIZE]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; GXS_ID_SIZE] {
        &self.0
    }
}

impl fmt::Display for GxsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for GxsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GxsId({})", hex::encode(self.0))
    }
}

/// The 20-byte deterministic name of a conversation between two ids.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TunnelId([u8; TUNNEL_ID_SIZE]);

impl TunnelId {
    #[must_use]
    pub const fn from_bytes(bytes: [u8; TUNNEL_ID_SIZE]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; TUNNEL_ID_SIZE] {
        &self.0
    }

    /// Derives the tunnel id for a pair of identities.
    ///
    /// The two ids are sorted byte-lexicographically before hashing, so both
    /// endpoints of a conversation compute the same name.
    #[must_use]
    pub fn for_pair(a: &GxsId, b: &GxsId) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let mut hasher = Sha1::new();
        hasher.update(lo.as_bytes());
        hasher.update(hi.as_bytes());
        Self(hasher.finalize().into())
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TunnelId({})", hex::encode(self.0))
    }
}

/// The 20-byte rendezvous token the overlay digs tunnels for.
///
/// The first 16 bytes carry the destination [`GxsId`]; the last 4 are drawn
/// from the CSPRNG so the same destination appears under many hashes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TunnelHash([u8; TUNNEL_ID_SIZE]);

impl TunnelHash {
    #[must_use]
    pub const fn from_bytes(bytes: [u8; TUNNEL_ID_SIZE]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; TUNNEL_ID_SIZE] {
        &self.0
    }

    /// Mints a fresh rendezvous hash for a destination id.
    #[must_use]
    pub fn random_for(destination: &GxsId) -> Self {
        let mut bytes = [0u8; TUNNEL_ID_SIZE];
        bytes[..GXS_ID_SIZE].copy_from_slice(destination.as_bytes());
        OsRng.fill_bytes(&mut bytes[GXS_ID_SIZE..]);
        Self(bytes)
    }

    /// The destination id encoded in the low 16 bytes.
    #[must_use]
    pub fn destination(&self) -> GxsId {
        let mut id = [0u8; GXS_ID_SIZE];
        id.copy_from_slice(&self.0[..GXS_ID_SIZE]);
        GxsId::from_bytes(id)
    }
}

impl fmt::Display for TunnelHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for TunnelHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TunnelHash({})", hex::encode(self.0))
    }
}

/// Opaque handle the overlay mints for one instance of a virtual circuit.
///
/// Not stable across tunnel restarts; a re-dug circuit arrives under a new
/// handle.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct VirtualPeerId([u8; 16]);

impl VirtualPeerId {
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for VirtualPeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for VirtualPeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualPeerId({})", hex::encode(self.0))
    }
}

/// Whether this endpoint dug the circuit or answered a dig.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TunnelDirection {
    /// We initiated the dig (and monitor the rendezvous hash).
    Server,
    /// We answered a dig against one of our own ids.
    Client,
}

/// Lifecycle state of a tunnel record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TunnelStatus {
    /// No live circuit is bound; the overlay is (re-)digging.
    TunnelDn,
    /// DH completed on both sides and encrypted frames flow.
    CanTalk,
    /// The distant peer sent a closing notice.
    RemotelyClosed,
    /// The tunnel id is not known to this service.
    Unknown,
}

/// Error taxonomy for the tunnel service.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TunnelError {
    #[error("gxs id is not one of our own")]
    UnknownGxsId,
    #[error("no tunnel with this id")]
    UnknownTunnel,
    #[error("no client service registered under this id")]
    UnknownService,
    #[error("signing key unavailable")]
    SignKeyUnavailable,
    #[error("signature verification failed")]
    SignatureInvalid,
    #[error("diffie-hellman computation failed")]
    DhFailure,
    #[error("frame mac does not match")]
    MacMismatch,
    #[error("frame decryption failed")]
    DecryptFailure,
    #[error("item could not be serialized")]
    SerializeFailure,
    #[error("overlay refused to send")]
    SendFailure,
}

/// Timing knobs for the service core.
///
/// Defaults match the deployed constants; tests shrink them to drive the
/// state machine quickly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServiceTiming {
    /// Interval between keep-alive items on an idle tunnel, seconds.
    pub keep_alive_secs: u64,
    /// Grace period on top of the keep-alive interval before a silent
    /// tunnel is declared down, seconds.
    pub liveness_grace_secs: u64,
    /// Delay between retransmissions of unacknowledged data items, seconds.
    pub resend_delay_secs: u64,
    /// How many times to poll the identity gateway for a cold key.
    pub key_fetch_retries: u32,
    /// Wait between key polls, milliseconds.
    pub key_fetch_wait_ms: u64,
}

impl ServiceTiming {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            keep_alive_secs: 6,
            liveness_grace_secs: 20,
            resend_delay_secs: 10,
            key_fetch_retries: 6,
            key_fetch_wait_ms: 500,
        }
    }

    /// Seconds of silence after which a CAN_TALK tunnel is marked down.
    #[must_use]
    pub const fn liveness_timeout_secs(&self) -> u64 {
        self.liveness_grace_secs + self.keep_alive_secs
    }
}

impl Default for ServiceTiming {
    fn default() -> Self {
        Self::new()
    }
}

/// Static description of this service, in the form the overlay registry
/// expects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServiceInfo {
    pub name: &'static str,
    pub version_major: u8,
    pub version_minor: u8,
    pub min_version_major: u8,
    pub min_version_minor: u8,
}

/// Live snapshot of one tunnel, as reported by
/// [`GxsTunnelService::get_tunnel_info`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TunnelInfo {
    pub source: GxsId,
    pub destination: GxsId,
    pub status: TunnelStatus,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub data_items_sent: u64,
    pub data_items_received: u64,
    pub pending_data_items: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn tunnel_id_is_symmetric() {
        let a = GxsId::from_bytes([1u8; 16]);
        let b = GxsId::from_bytes([2u8; 16]);
        assert_eq!(TunnelId::for_pair(&a, &b), TunnelId::for_pair(&b, &a));
    }

    #[test]
    fn tunnel_id_matches_reference_layout() {
        // sha1(min || max) over the raw id bytes.
        let a = GxsId::from_bytes([1u8; 16]);
        let b = GxsId::from_bytes([2u8; 16]);
        let mut hasher = Sha1::new();
        hasher.update(a.as_bytes());
        hasher.update(b.as_bytes());
        let expected: [u8; 20] = hasher.finalize().into();
        assert_eq!(TunnelId::for_pair(&b, &a).as_bytes(), &expected);
    }

    #[test]
    fn hash_carries_destination_in_low_bytes() {
        let dest = GxsId::from_bytes(*b"0123456789abcdef");
        let hash = TunnelHash::random_for(&dest);
        assert_eq!(hash.destination(), dest);
    }

    #[test]
    fn hashes_for_same_destination_differ() {
        let dest = GxsId::from_bytes([7u8; 16]);
        assert_ne!(
            TunnelHash::random_for(&dest),
            TunnelHash::random_for(&dest)
        );
    }

    #[test]
    fn liveness_timeout_is_grace_plus_keep_alive() {
        let timing = ServiceTiming::new();
        assert_eq!(timing.liveness_timeout_secs(), 26);
    }

    proptest! {
        #[test]
        fn tunnel_id_symmetry_holds(a in any::<[u8; 16]>(), b in any::<[u8; 16]>()) {
            let a = GxsId::from_bytes(a);
            let b = GxsId::from_bytes(b);
            prop_assert_eq!(TunnelId::for_pair(&a, &b), TunnelId::for_pair(&b, &a));
        }
    }
}
