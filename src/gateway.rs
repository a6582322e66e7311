// This file is part of gxstunnel and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

//! Seams to the two external collaborators: the identity store that owns
//! long-term keys, and the anonymizing overlay that digs circuits. The
//! service core only ever talks to these traits; production wires them to
//! the real subsystems, tests wire them to doubles.

use std::sync::Arc;

use crate::{GxsId, TunnelDirection, TunnelHash, TunnelId, VirtualPeerId};

/// Public half of a long-term identity key, as handed around in DH items.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityKey {
    /// The identity this key belongs to.
    pub key_id: GxsId,
    /// Opaque serialized public key material.
    pub public_bytes: Vec<u8>,
}

/// A detached signature naming its signing identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentitySignature {
    /// The identity whose key produced this signature.
    pub signer: GxsId,
    /// Opaque signature bytes.
    pub bytes: Vec<u8>,
}

/// Why a signing request failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignError {
    /// The signing key for the requested identity is not available.
    KeyUnavailable,
    /// The backend failed for another reason.
    Failed,
}

/// Long-term identity storage and signing.
///
/// `get_key` may be cold: the handshake polls it a bounded number of times
/// before falling back to the key embedded in the DH item. `sign` and
/// `validate` are treated as slow and are never called with the service
/// core locked.
pub trait IdentityGateway: Send + Sync {
    /// The identities this node can speak as.
    fn own_ids(&self) -> Vec<GxsId>;

    /// Looks up the public key for an identity; `None` while the cache is
    /// cold.
    fn get_key(&self, id: &GxsId) -> Option<IdentityKey>;

    /// Signs `data` with the identity's long-term key.
    fn sign(&self, id: &GxsId, data: &[u8]) -> Result<IdentitySignature, SignError>;

    /// Verifies `sig` over `data` against `key`.
    fn validate(&self, sig: &IdentitySignature, data: &[u8], key: &IdentityKey) -> bool;

    /// Self-consistency check on key material received from the wire.
    fn check_key(&self, key: &IdentityKey) -> bool;

    /// Advisory: records that the key was seen in use, refreshing its
    /// retention clock.
    fn timestamp_key(&self, _id: &GxsId) {}
}

/// Outbound half of the overlay: circuit management and raw sends.
pub trait OverlayRouter: Send + Sync {
    /// Registers the consumer of this overlay's tunnel events.
    fn register_service(&self, client: Arc<dyn OverlayTunnelClient>);

    /// Asks the overlay to keep digging circuits for `hash`.
    fn monitor_tunnels(&self, hash: &TunnelHash);

    /// Stops digging for `hash`.
    fn stop_monitoring(&self, hash: &TunnelHash);

    /// Drops the overlay's circuit state for `hash` and searches anew.
    fn force_redig(&self, hash: &TunnelHash);

    /// Pushes one payload down a virtual circuit. Returns `false` when the
    /// overlay cannot take the payload right now; the caller retries later.
    fn send(&self, vpid: &VirtualPeerId, frame: Vec<u8>) -> bool;
}

/// Inbound half of the overlay: callbacks the tunnel service implements.
pub trait OverlayTunnelClient: Send + Sync {
    /// Should this node answer a dig for `hash`?
    fn on_tunnel_request(&self, hash: &TunnelHash) -> bool;

    /// A circuit instance came up for `hash`.
    fn on_virtual_peer_added(
        &self,
        hash: &TunnelHash,
        vpid: &VirtualPeerId,
        direction: TunnelDirection,
    );

    /// The circuit instance died.
    fn on_virtual_peer_removed(&self, hash: &TunnelHash, vpid: &VirtualPeerId);

    /// A payload arrived on a circuit.
    fn on_data(&self, vpid: &VirtualPeerId, bytes: &[u8], direction: TunnelDirection);
}

/// An upper-layer consumer of decrypted tunnel payloads.
///
/// Implementations must be re-entrancy-safe with respect to the service
/// tick: `receive_data` may run concurrently with API calls into the
/// service.
pub trait TunnelClientService: Send + Sync {
    /// Hands over one decrypted data payload. The buffer belongs to the
    /// service from here on.
    fn receive_data(&self, tunnel_id: &TunnelId, data: Vec<u8>);
}
