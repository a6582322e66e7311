// This file is part of gxstunnel and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

//! The tunnel service core.
//!
//! One instance multiplexes any number of secured tunnels over the overlay.
//! All shared state lives behind a single mutex; the overlay's `send` and
//! the identity gateway's `sign`/`validate` are never invoked with that
//! mutex held. Outbound items go through three pending queues drained by
//! [`GxsTunnelService::tick`], which the host is expected to call at about
//! 1 Hz.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, trace, warn};
use zeroize::Zeroizing;

use crate::crypto::{self, DhKeypair, AES_KEY_SIZE};
use crate::gateway::{
    IdentityGateway, IdentityKey, IdentitySignature, OverlayRouter, OverlayTunnelClient,
    SignError, TunnelClientService,
};
use crate::items::{
    self, Frame, TunnelItem, STATUS_ACK_CONNECTION, STATUS_CLOSING, STATUS_KEEP_ALIVE,
};
use crate::{
    GxsId, ServiceInfo, ServiceTiming, TunnelDirection, TunnelError, TunnelHash, TunnelId,
    TunnelInfo, TunnelStatus, VirtualPeerId,
};

const STATE_DUMP_INTERVAL_SECS: u64 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DhStatus {
    Uninitialized,
    HalfKeyDone,
    KeyAvailable,
}

/// One live circuit instance, keyed by its overlay handle.
struct VirtualPeer {
    hash: TunnelHash,
    direction: TunnelDirection,
    own_gxs_id: Option<GxsId>,
    peer_gxs_id: Option<GxsId>,
    tunnel_id: Option<TunnelId>,
    dh: Option<DhKeypair>,
    dh_status: DhStatus,
}

impl VirtualPeer {
    fn new(hash: TunnelHash, direction: TunnelDirection) -> Self {
        Self {
            hash,
            direction,
            own_gxs_id: None,
            peer_gxs_id: None,
            tunnel_id: None,
            dh: None,
            dh_status: DhStatus::Uninitialized,
        }
    }
}

/// One conversation, keyed by its deterministic tunnel id.
struct TunnelRecord {
    own_gxs_id: GxsId,
    peer_gxs_id: GxsId,
    /// Monitored rendezvous hash; only set on the side that digs.
    hash: Option<TunnelHash>,
    direction: TunnelDirection,
    status: TunnelStatus,
    aes_key: Zeroizing<[u8; AES_KEY_SIZE]>,
    last_contact: u64,
    last_keep_alive_sent: u64,
    virtual_peer_id: Option<VirtualPeerId>,
    bytes_sent: u64,
    bytes_received: u64,
    data_items_sent: u64,
    data_items_received: u64,
}

impl TunnelRecord {
    fn new(own_gxs_id: GxsId, peer_gxs_id: GxsId, direction: TunnelDirection, now: u64) -> Self {
        Self {
            own_gxs_id,
            peer_gxs_id,
            hash: None,
            direction,
            status: TunnelStatus::TunnelDn,
            aes_key: Zeroizing::new([0u8; AES_KEY_SIZE]),
            last_contact: now,
            last_keep_alive_sent: now,
            virtual_peer_id: None,
            bytes_sent: 0,
            bytes_received: 0,
            data_items_sent: 0,
            data_items_received: 0,
        }
    }
}

/// A serialized DH item waiting for a clear send.
struct PendingDh {
    vpid: VirtualPeerId,
    frame: Vec<u8>,
}

/// A serialized status/ack item waiting for an encrypted send.
struct PendingCtrl {
    vpid: VirtualPeerId,
    encoded: Vec<u8>,
}

/// A data item retained until its ack arrives.
struct PendingData {
    tunnel_id: TunnelId,
    encoded: Vec<u8>,
    payload_len: u64,
    last_attempt: u64,
}

#[derive(Default)]
struct Core {
    tunnels: HashMap<TunnelId, TunnelRecord>,
    virtual_peers: HashMap<VirtualPeerId, VirtualPeer>,
    services: HashMap<u32, Arc<dyn TunnelClientService>>,
    pending_dh: VecDeque<PendingDh>,
    pending_ctrl: VecDeque<PendingCtrl>,
    pending_data: BTreeMap<u64, PendingData>,
    item_counter: u64,
    last_state_dump: u64,
}

enum CtrlTarget {
    Ready {
        target: VirtualPeerId,
        key: Zeroizing<[u8; AES_KEY_SIZE]>,
    },
    NotReady,
    Gone,
}

/// End-to-end secured messaging over anonymous overlay circuits.
pub struct GxsTunnelService {
    identities: Arc<dyn IdentityGateway>,
    overlay: Arc<dyn OverlayRouter>,
    timing: ServiceTiming,
    core: Mutex<Core>,
}

impl GxsTunnelService {
    #[must_use]
    pub fn new(identities: Arc<dyn IdentityGateway>, overlay: Arc<dyn OverlayRouter>) -> Self {
        Self::with_timing(identities, overlay, ServiceTiming::new())
    }

    #[must_use]
    pub fn with_timing(
        identities: Arc<dyn IdentityGateway>,
        overlay: Arc<dyn OverlayRouter>,
        timing: ServiceTiming,
    ) -> Self {
        Self {
            identities,
            overlay,
            timing,
            core: Mutex::new(Core::default()),
        }
    }

    /// Wires this service into the overlay's tunnel event stream.
    pub fn connect_to_overlay(self: &Arc<Self>) {
        self.overlay.register_service(Arc::clone(self) as Arc<dyn OverlayTunnelClient>);
    }

    /// Description handed to the overlay's service registry.
    #[must_use]
    pub const fn service_info() -> ServiceInfo {
        ServiceInfo {
            name: "GxsTunnels",
            version_major: 1,
            version_minor: 0,
            min_version_major: 1,
            min_version_minor: 0,
        }
    }

    /// Registers an upper-layer consumer for `service_id`. Duplicates are
    /// rejected.
    pub fn register_client_service(
        &self,
        service_id: u32,
        handler: Arc<dyn TunnelClientService>,
    ) -> bool {
        let mut core = self.lock();
        if core.services.contains_key(&service_id) {
            warn!(service_id, "client service already registered");
            return false;
        }
        debug!(service_id, "registering client service");
        core.services.insert(service_id, handler);
        true
    }

    /// Starts (or reuses) a secured tunnel from one of our own ids to a
    /// distant id.
    ///
    /// On first request the overlay is asked to dig circuits for a fresh
    /// rendezvous hash; repeated requests for the same pair return the
    /// existing tunnel without digging again.
    pub fn request_secured_tunnel(&self, to: &GxsId, from: &GxsId) -> Result<TunnelId, TunnelError> {
        if !self.identities.own_ids().contains(from) {
            warn!(%from, "cannot open tunnel from an id we do not own");
            return Err(TunnelError::UnknownGxsId);
        }

        let tunnel_id = TunnelId::for_pair(from, to);
        let hash = TunnelHash::random_for(to);
        let now = now_secs();
        {
            let mut core = self.lock();
            if core.tunnels.contains_key(&tunnel_id) {
                debug!(%tunnel_id, "tunnel already requested, reusing");
                return Ok(tunnel_id);
            }
            let mut record = TunnelRecord::new(*from, *to, TunnelDirection::Server, now);
            record.hash = Some(hash);
            core.tunnels.insert(tunnel_id, record);
        }

        debug!(%tunnel_id, %hash, "starting tunnel campaign");
        self.overlay.monitor_tunnels(&hash);
        Ok(tunnel_id)
    }

    /// Queues `data` for reliable delivery to the distant end of a tunnel.
    ///
    /// The item is retained and retransmitted until the peer acknowledges
    /// it; there is no deadline.
    pub fn send_data(
        &self,
        tunnel_id: &TunnelId,
        service_id: u32,
        data: &[u8],
    ) -> Result<(), TunnelError> {
        let mut core = self.lock();
        if !core.tunnels.contains_key(tunnel_id) {
            return Err(TunnelError::UnknownTunnel);
        }
        if !core.services.contains_key(&service_id) {
            return Err(TunnelError::UnknownService);
        }

        let counter = core.item_counter;
        core.item_counter += 1;

        let encoded = TunnelItem::Data {
            counter,
            flags: 0,
            service_id,
            data: data.to_vec(),
        }
        .encode()?;

        debug!(counter, service_id, len = data.len(), "queueing data item");
        core.pending_data.insert(
            counter,
            PendingData {
                tunnel_id: *tunnel_id,
                encoded,
                payload_len: data.len() as u64,
                last_attempt: 0,
            },
        );
        Ok(())
    }

    /// Closes a tunnel and drops its record.
    ///
    /// On the digging side a closing notice is sent best-effort first and
    /// the overlay stops monitoring the hash. Circuit teardown arrives
    /// later through [`OverlayTunnelClient::on_virtual_peer_removed`].
    pub fn close_tunnel(&self, tunnel_id: &TunnelId) -> Result<(), TunnelError> {
        let (closing, hash) = {
            let mut core = self.lock();
            let record = core
                .tunnels
                .remove(tunnel_id)
                .ok_or(TunnelError::UnknownTunnel)?;
            core.pending_data.retain(|_, entry| entry.tunnel_id != *tunnel_id);
            match record.direction {
                TunnelDirection::Client => (None, None),
                TunnelDirection::Server => {
                    let closing = match (record.status, record.virtual_peer_id) {
                        (TunnelStatus::CanTalk, Some(vpid)) => {
                            Some((vpid, record.aes_key.clone()))
                        }
                        _ => None,
                    };
                    (closing, record.hash)
                }
            }
        };

        debug!(%tunnel_id, "closing tunnel");
        if let Some((vpid, key)) = closing {
            if let Ok(encoded) = (TunnelItem::Status {
                flags: STATUS_CLOSING,
            })
            .encode()
            {
                if !self.overlay.send(&vpid, seal_frame(&key, &encoded)) {
                    debug!(%vpid, "overlay refused the closing notice");
                }
            }
        }
        if let Some(hash) = hash {
            self.overlay.stop_monitoring(&hash);
        }
        Ok(())
    }

    /// Current status of a tunnel; [`TunnelStatus::Unknown`] if the id is
    /// not registered.
    #[must_use]
    pub fn get_tunnel_status(&self, tunnel_id: &TunnelId) -> TunnelStatus {
        self.lock()
            .tunnels
            .get(tunnel_id)
            .map_or(TunnelStatus::Unknown, |t| t.status)
    }

    /// Snapshot of a tunnel's endpoints, status and traffic counters.
    #[must_use]
    pub fn get_tunnel_info(&self, tunnel_id: &TunnelId) -> Option<TunnelInfo> {
        let core = self.lock();
        let record = core.tunnels.get(tunnel_id)?;
        let pending = core
            .pending_data
            .values()
            .filter(|entry| entry.tunnel_id == *tunnel_id)
            .count() as u64;
        Some(TunnelInfo {
            source: record.own_gxs_id,
            destination: record.peer_gxs_id,
            status: record.status,
            bytes_sent: record.bytes_sent,
            bytes_received: record.bytes_received,
            data_items_sent: record.data_items_sent,
            data_items_received: record.data_items_received,
            pending_data_items: pending,
        })
    }

    /// Drives queues, retransmissions, keep-alives and liveness. Call at
    /// about 1 Hz.
    pub fn tick(&self) {
        self.tick_at(now_secs());
    }

    fn tick_at(&self, now: u64) {
        // Clear DH items have priority over everything encrypted.
        self.flush_pending_dh();
        self.flush_pending_ctrl();
        self.flush_pending_data(now);
        self.sweep_tunnels(now);
        self.maybe_dump_state(now);
    }

    // ---- handshake engine ----------------------------------------------

    /// Destroys any DH state on the virtual peer and opens a fresh session:
    /// new keypair, signed public value queued for a clear send.
    fn start_dh_session(&self, vpid: &VirtualPeerId, own_gxs_id: &GxsId) {
        debug!(%vpid, "starting new dh session");
        let keypair = DhKeypair::generate();
        let public_value = keypair.public_bytes();
        {
            let mut core = self.lock();
            let Some(record) = core.virtual_peers.get_mut(vpid) else {
                debug!(%vpid, "virtual peer vanished before dh start");
                return;
            };
            record.own_gxs_id = Some(*own_gxs_id);
            record.dh = Some(keypair);
            record.dh_status = DhStatus::HalfKeyDone;
        }

        // Signing happens off-lock; the gateway may be slow.
        let signature = match self.identities.sign(own_gxs_id, &public_value) {
            Ok(signature) => signature,
            Err(SignError::KeyUnavailable) => {
                warn!(%own_gxs_id, "signing key unavailable, dh item not sent");
                return;
            }
            Err(SignError::Failed) => {
                warn!(%own_gxs_id, "signing failed, dh item not sent");
                return;
            }
        };
        let Some(signer_key) = self.identities.get_key(own_gxs_id) else {
            warn!(%own_gxs_id, "cannot fetch our own public key, dh item not sent");
            return;
        };

        let item = TunnelItem::DhPublicKey {
            public_value,
            signature,
            signer_key,
        };
        let Ok(encoded) = item.encode() else {
            warn!(%vpid, "could not serialize dh item");
            return;
        };
        let frame = items::encode_clear_frame(&encoded);
        self.lock().pending_dh.push_back(PendingDh { vpid: *vpid, frame });
    }

    fn handle_dh_public_key(
        &self,
        vpid: &VirtualPeerId,
        public_value: Vec<u8>,
        signature: IdentitySignature,
        signer_key: IdentityKey,
        now: u64,
    ) {
        if !self.lock().virtual_peers.contains_key(vpid) {
            warn!(%vpid, "dh public key for an unknown virtual peer");
            return;
        }

        let sender = signature.signer;

        // The identity cache may be cold; poll it a bounded number of
        // times before falling back to the key carried in the item.
        let mut cached = self.identities.get_key(&sender);
        let mut attempt = 0;
        while cached.is_none() && attempt < self.timing.key_fetch_retries {
            trace!(%sender, attempt, "sender key not cached yet, waiting");
            thread::sleep(Duration::from_millis(self.timing.key_fetch_wait_ms));
            attempt += 1;
            cached = self.identities.get_key(&sender);
        }

        let verify_key = match cached {
            Some(key) => key,
            None => {
                warn!(%sender, "sender key unknown, using the key embedded in the dh item");
                if !self.identities.check_key(&signer_key) {
                    warn!(%sender, "embedded key failed its consistency check, refusing handshake");
                    return;
                }
                if signer_key.key_id != sender {
                    warn!(%sender, "embedded key does not match the signature key, refusing handshake");
                    return;
                }
                signer_key
            }
        };

        // A bad signature kills this attempt only; restarting here would
        // let a forger churn our sessions at will.
        if !self.identities.validate(&signature, &public_value, &verify_key) {
            warn!(%sender, "dh public key signature does not verify");
            return;
        }
        self.identities.timestamp_key(&sender);

        let mut restart_with: Option<GxsId> = None;
        {
            let core = self.lock();
            match core.virtual_peers.get(vpid) {
                None => {
                    debug!(%vpid, "virtual peer vanished during key fetch");
                    return;
                }
                Some(record) if record.dh_status == DhStatus::KeyAvailable => {
                    restart_with = record.own_gxs_id;
                }
                Some(_) => {}
            }
        }
        if let Some(own) = restart_with {
            debug!(%vpid, "peer restarted its handshake, resetting the session");
            self.start_dh_session(vpid, &own);
        }

        let mut guard = self.lock();
        let core = &mut *guard;
        let Some(record) = core.virtual_peers.get_mut(vpid) else {
            debug!(%vpid, "virtual peer vanished during handshake");
            return;
        };
        let Some(own_gxs_id) = record.own_gxs_id else {
            warn!(%vpid, "dh public key before session initialization");
            return;
        };
        let Some(dh) = record.dh.as_ref() else {
            warn!(%vpid, "no dh state for this virtual peer");
            return;
        };
        let shared = match dh.compute_shared(&public_value) {
            Ok(shared) => shared,
            Err(err) => {
                warn!(%vpid, %err, "dh computation failed");
                return;
            }
        };

        let aes_key = crypto::derive_aes_key(&shared);
        record.dh_status = DhStatus::KeyAvailable;
        record.peer_gxs_id = Some(sender);
        let tunnel_id = TunnelId::for_pair(&own_gxs_id, &sender);
        record.tunnel_id = Some(tunnel_id);
        let direction = record.direction;

        let tunnel = core
            .tunnels
            .entry(tunnel_id)
            .or_insert_with(|| TunnelRecord::new(own_gxs_id, sender, direction, now));
        tunnel.own_gxs_id = own_gxs_id;
        tunnel.peer_gxs_id = sender;
        tunnel.direction = direction;
        tunnel.status = TunnelStatus::CanTalk;
        tunnel.virtual_peer_id = Some(*vpid);
        tunnel.aes_key = aes_key;
        tunnel.last_contact = now;
        tunnel.last_keep_alive_sent = now;
        debug!(%tunnel_id, %sender, "dh complete, tunnel secured");

        // Tell the peer the tunnel works end to end; this also proves to
        // it that every intermediate hop forwards our frames.
        if let Ok(encoded) = (TunnelItem::Status {
            flags: STATUS_ACK_CONNECTION,
        })
        .encode()
        {
            core.pending_ctrl.push_back(PendingCtrl {
                vpid: *vpid,
                encoded,
            });
        }
    }

    // ---- frame layer ---------------------------------------------------

    fn ingest(&self, vpid: &VirtualPeerId, bytes: &[u8], now: u64) {
        match items::classify_frame(bytes) {
            None => debug!(%vpid, len = bytes.len(), "dropping undersized overlay payload"),
            Some(Frame::Clear(item_bytes)) => self.handle_clear_item(vpid, &item_bytes, now),
            Some(Frame::Encrypted {
                iv,
                mac,
                ciphertext,
            }) => self.handle_encrypted_frame(vpid, iv, &mac, &ciphertext, now),
        }
    }

    fn handle_clear_item(&self, vpid: &VirtualPeerId, item_bytes: &[u8], now: u64) {
        match TunnelItem::decode(item_bytes) {
            Some(TunnelItem::DhPublicKey {
                public_value,
                signature,
                signer_key,
            }) => self.handle_dh_public_key(vpid, public_value, signature, signer_key, now),
            Some(_) => warn!(%vpid, "non-dh item on a clear frame, dropping"),
            None => warn!(%vpid, "undecodable clear item, dropping"),
        }
    }

    fn handle_encrypted_frame(
        &self,
        vpid: &VirtualPeerId,
        iv: u64,
        mac: &[u8; crypto::HMAC_SIZE],
        ciphertext: &[u8],
        now: u64,
    ) {
        let (tunnel_id, key, own_gxs_id) = {
            let core = self.lock();
            let Some(record) = core.virtual_peers.get(vpid) else {
                warn!(%vpid, "encrypted frame from an unregistered circuit");
                return;
            };
            let Some(tunnel_id) = record.tunnel_id else {
                debug!(%vpid, "encrypted frame before handshake completion, dropping");
                return;
            };
            let Some(tunnel) = core.tunnels.get(&tunnel_id) else {
                debug!(%vpid, %tunnel_id, "encrypted frame for a closed tunnel, dropping");
                return;
            };
            (tunnel_id, tunnel.aes_key.clone(), tunnel.own_gxs_id)
        };

        let expected = crypto::hmac_sha1(&*key, ciphertext);
        if !crypto::hmac_matches(&expected, mac) {
            warn!(%vpid, %tunnel_id, "frame mac mismatch, restarting dh session");
            self.start_dh_session(vpid, &own_gxs_id);
            return;
        }

        let plaintext = match crypto::aes_cbc_decrypt(&key, iv, ciphertext) {
            Ok(plaintext) => plaintext,
            Err(_) => {
                warn!(%vpid, %tunnel_id, "frame decryption failed, restarting dh session");
                self.start_dh_session(vpid, &own_gxs_id);
                return;
            }
        };

        {
            let mut core = self.lock();
            if let Some(tunnel) = core.tunnels.get_mut(&tunnel_id) {
                // A valid MAC proves this circuit is live: rebind it, so a
                // tunnel downed by a liveness timeout comes back sendable.
                // A remotely closed tunnel stays closed.
                if tunnel.status != TunnelStatus::RemotelyClosed {
                    tunnel.status = TunnelStatus::CanTalk;
                    tunnel.virtual_peer_id = Some(*vpid);
                }
                tunnel.last_contact = now;
            }
        }

        let Some(item) = TunnelItem::decode(&plaintext) else {
            warn!(%vpid, %tunnel_id, "undecodable tunnel item, dropping");
            return;
        };
        self.dispatch_item(&tunnel_id, vpid, item);
    }

    // ---- reliable delivery and dispatch --------------------------------

    fn dispatch_item(&self, tunnel_id: &TunnelId, vpid: &VirtualPeerId, item: TunnelItem) {
        match item {
            TunnelItem::Data {
                counter,
                service_id,
                data,
                ..
            } => self.handle_data_item(tunnel_id, vpid, counter, service_id, data),
            TunnelItem::DataAck { counter } => self.handle_data_ack(counter),
            TunnelItem::Status { flags } => self.handle_status_item(tunnel_id, flags),
            TunnelItem::DhPublicKey { .. } => {
                warn!(%tunnel_id, "dh public key on an encrypted frame, dropping");
            }
        }
    }

    fn handle_data_item(
        &self,
        tunnel_id: &TunnelId,
        vpid: &VirtualPeerId,
        counter: u64,
        service_id: u32,
        data: Vec<u8>,
    ) {
        debug!(counter, service_id, len = data.len(), "data item received");
        let handler = {
            let mut core = self.lock();
            // Ack first, unconditionally. Acks ride the queue that is not
            // itself acked, so no loop can form.
            if let Ok(encoded) = (TunnelItem::DataAck { counter }).encode() {
                core.pending_ctrl.push_back(PendingCtrl {
                    vpid: *vpid,
                    encoded,
                });
            }
            if let Some(tunnel) = core.tunnels.get_mut(tunnel_id) {
                tunnel.bytes_received += data.len() as u64;
                tunnel.data_items_received += 1;
            }
            match core.services.get(&service_id) {
                Some(handler) => Some(Arc::clone(handler)),
                None => {
                    warn!(service_id, "no client service registered, dropping data item");
                    None
                }
            }
        };

        // The handler runs off-lock; the buffer belongs to it now.
        if let Some(handler) = handler {
            handler.receive_data(tunnel_id, data);
        }
    }

    fn handle_data_ack(&self, counter: u64) {
        let mut core = self.lock();
        if core.pending_data.remove(&counter).is_some() {
            debug!(counter, "data item acknowledged");
        } else {
            warn!(counter, "ack for an unknown data item, ignoring");
        }
    }

    fn handle_status_item(&self, tunnel_id: &TunnelId, flags: u32) {
        if flags & STATUS_CLOSING != 0 {
            self.mark_remotely_closed(tunnel_id);
        }
        if flags & STATUS_KEEP_ALIVE != 0 {
            // Nothing to do: decryption already refreshed last_contact.
            trace!(%tunnel_id, "keep-alive received");
        }
        if flags & STATUS_ACK_CONNECTION != 0 {
            debug!(%tunnel_id, "peer confirmed the tunnel end to end");
        }
    }

    fn mark_remotely_closed(&self, tunnel_id: &TunnelId) {
        let mut core = self.lock();
        let Some(tunnel) = core.tunnels.get_mut(tunnel_id) else {
            warn!(%tunnel_id, "closing notice for an unknown tunnel");
            return;
        };
        if tunnel.direction == TunnelDirection::Client {
            debug!(%tunnel_id, "peer closed the conversation");
            tunnel.status = TunnelStatus::RemotelyClosed;
            tunnel.virtual_peer_id = None;
        }
    }

    // ---- tick internals ------------------------------------------------

    fn flush_pending_dh(&self) {
        loop {
            let (vpid, frame) = {
                let core = self.lock();
                match core.pending_dh.front() {
                    Some(entry) => (entry.vpid, entry.frame.clone()),
                    None => break,
                }
            };
            let sent = self.overlay.send(&vpid, frame);
            let mut core = self.lock();
            if sent {
                core.pending_dh.pop_front();
            } else if !core.virtual_peers.contains_key(&vpid) {
                debug!(%vpid, "dropping dh item for a collected circuit");
                core.pending_dh.pop_front();
            } else {
                // Transient overlay refusal; retry from the head next tick.
                break;
            }
        }
    }

    fn flush_pending_ctrl(&self) {
        loop {
            let work = {
                let mut core = self.lock();
                loop {
                    let Some(entry) = core.pending_ctrl.front() else {
                        break None;
                    };
                    match ctrl_target(&core, &entry.vpid) {
                        CtrlTarget::Gone => {
                            debug!(vpid = %entry.vpid, "dropping control item for a dead circuit");
                            core.pending_ctrl.pop_front();
                        }
                        CtrlTarget::NotReady => break None,
                        CtrlTarget::Ready { target, key } => {
                            break Some((target, key, entry.encoded.clone()))
                        }
                    }
                }
            };
            let Some((target, key, encoded)) = work else {
                break;
            };
            if self.overlay.send(&target, seal_frame(&key, &encoded)) {
                self.lock().pending_ctrl.pop_front();
            } else {
                debug!(%target, "overlay refused a control item, will retry");
                break;
            }
        }
    }

    fn flush_pending_data(&self, now: u64) {
        struct Due {
            counter: u64,
            target: VirtualPeerId,
            key: Zeroizing<[u8; AES_KEY_SIZE]>,
            encoded: Vec<u8>,
            payload_len: u64,
        }

        let due: Vec<Due> = {
            let mut core = self.lock();
            let orphaned: Vec<u64> = core
                .pending_data
                .iter()
                .filter(|(_, entry)| !core.tunnels.contains_key(&entry.tunnel_id))
                .map(|(counter, _)| *counter)
                .collect();
            for counter in orphaned {
                debug!(counter, "dropping data item for a closed tunnel");
                core.pending_data.remove(&counter);
            }

            core.pending_data
                .iter()
                .filter(|(_, entry)| entry.last_attempt + self.timing.resend_delay_secs < now)
                .filter_map(|(counter, entry)| {
                    let tunnel = core.tunnels.get(&entry.tunnel_id)?;
                    if tunnel.status != TunnelStatus::CanTalk {
                        return None;
                    }
                    let target = tunnel.virtual_peer_id?;
                    Some(Due {
                        counter: *counter,
                        target,
                        key: tunnel.aes_key.clone(),
                        encoded: entry.encoded.clone(),
                        payload_len: entry.payload_len,
                    })
                })
                .collect()
        };

        for item in due {
            if self.overlay.send(&item.target, seal_frame(&item.key, &item.encoded)) {
                debug!(counter = item.counter, "data item sent");
                let mut core = self.lock();
                let meta = core.pending_data.get_mut(&item.counter).map(|entry| {
                    let first = entry.last_attempt == 0;
                    entry.last_attempt = now;
                    (first, entry.tunnel_id)
                });
                if let Some((true, tunnel_id)) = meta {
                    if let Some(tunnel) = core.tunnels.get_mut(&tunnel_id) {
                        tunnel.data_items_sent += 1;
                        tunnel.bytes_sent += item.payload_len;
                    }
                }
            } else {
                debug!(counter = item.counter, "overlay refused a data item, will retry");
            }
        }
    }

    fn sweep_tunnels(&self, now: u64) {
        let mut redigs: Vec<TunnelHash> = Vec::new();
        {
            let mut guard = self.lock();
            let core = &mut *guard;
            let mut keep_alives: Vec<VirtualPeerId> = Vec::new();

            for (tunnel_id, tunnel) in &mut core.tunnels {
                if tunnel.status != TunnelStatus::CanTalk {
                    continue;
                }
                if tunnel.last_contact + self.timing.liveness_timeout_secs() < now {
                    warn!(%tunnel_id, "tunnel went silent, marking it down");
                    tunnel.status = TunnelStatus::TunnelDn;
                    tunnel.virtual_peer_id = None;
                    if tunnel.direction == TunnelDirection::Server {
                        // A fresh hash makes the overlay search anew instead
                        // of waiting for its own circuit timeout.
                        let hash = TunnelHash::random_for(&tunnel.peer_gxs_id);
                        tunnel.hash = Some(hash);
                        redigs.push(hash);
                    }
                    continue;
                }
                if tunnel.last_keep_alive_sent + self.timing.keep_alive_secs < now {
                    if let Some(vpid) = tunnel.virtual_peer_id {
                        trace!(%tunnel_id, "queueing keep-alive");
                        keep_alives.push(vpid);
                        tunnel.last_keep_alive_sent = now;
                    }
                }
            }

            for vpid in keep_alives {
                if let Ok(encoded) = (TunnelItem::Status {
                    flags: STATUS_KEEP_ALIVE,
                })
                .encode()
                {
                    core.pending_ctrl.push_back(PendingCtrl { vpid, encoded });
                }
            }
        }

        for hash in redigs {
            debug!(%hash, "forcing a new tunnel campaign");
            self.overlay.force_redig(&hash);
        }
    }

    fn maybe_dump_state(&self, now: u64) {
        let mut core = self.lock();
        if now < core.last_state_dump + STATE_DUMP_INTERVAL_SECS {
            return;
        }
        core.last_state_dump = now;
        trace!(
            services = core.services.len(),
            tunnels = core.tunnels.len(),
            virtual_peers = core.virtual_peers.len(),
            pending_dh = core.pending_dh.len(),
            pending_ctrl = core.pending_ctrl.len(),
            pending_data = core.pending_data.len(),
            "service state"
        );
        for (tunnel_id, tunnel) in &core.tunnels {
            trace!(
                %tunnel_id,
                status = ?tunnel.status,
                direction = ?tunnel.direction,
                vpid = ?tunnel.virtual_peer_id,
                contact_age = now.saturating_sub(tunnel.last_contact),
                keep_alive_age = now.saturating_sub(tunnel.last_keep_alive_sent),
                "tunnel state"
            );
        }
        for (vpid, record) in &core.virtual_peers {
            trace!(
                %vpid,
                hash = %record.hash,
                dh_status = ?record.dh_status,
                peer = ?record.peer_gxs_id,
                tunnel = ?record.tunnel_id,
                "virtual peer state"
            );
        }
    }

    fn lock(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl OverlayTunnelClient for GxsTunnelService {
    /// Answer a dig iff the hash addresses one of our own ids.
    fn on_tunnel_request(&self, hash: &TunnelHash) -> bool {
        let destination = hash.destination();
        let ours = self.identities.own_ids().contains(&destination);
        if ours {
            debug!(%hash, %destination, "answering tunnel request for one of our ids");
        }
        ours
    }

    fn on_virtual_peer_added(
        &self,
        hash: &TunnelHash,
        vpid: &VirtualPeerId,
        direction: TunnelDirection,
    ) {
        debug!(%vpid, %hash, ?direction, "virtual peer added");
        let own_gxs_id = {
            let mut core = self.lock();
            // A repeated announcement for a known handle resets its DH
            // state; restart is destroy-and-recreate, never in-place.
            let record = core
                .virtual_peers
                .entry(*vpid)
                .or_insert_with(|| VirtualPeer::new(*hash, direction));
            record.hash = *hash;
            record.direction = direction;
            record.own_gxs_id = None;
            record.peer_gxs_id = None;
            record.tunnel_id = None;
            record.dh = None;
            record.dh_status = DhStatus::Uninitialized;

            match direction {
                // We answered a dig: our id is in the hash itself.
                TunnelDirection::Client => hash.destination(),
                // We dug: a tunnel record was registered with this hash.
                TunnelDirection::Server => {
                    let tunnel = core
                        .tunnels
                        .values()
                        .find(|tunnel| tunnel.hash.as_ref() == Some(hash));
                    match tunnel {
                        None => {
                            warn!(%hash, "no pre-registered tunnel for this hash");
                            return;
                        }
                        Some(tunnel) if tunnel.status == TunnelStatus::CanTalk => {
                            debug!(%hash, "tunnel already alive, abandoning this virtual peer");
                            return;
                        }
                        Some(tunnel) => tunnel.own_gxs_id,
                    }
                }
            }
        };
        self.start_dh_session(vpid, &own_gxs_id);
    }

    fn on_virtual_peer_removed(&self, hash: &TunnelHash, vpid: &VirtualPeerId) {
        debug!(%vpid, %hash, "virtual peer removed");
        let mut core = self.lock();
        let Some(record) = core.virtual_peers.remove(vpid) else {
            warn!(%vpid, "removal of an unknown virtual peer");
            return;
        };
        let Some(tunnel_id) = record.tunnel_id else {
            return;
        };
        if let Some(tunnel) = core.tunnels.get_mut(&tunnel_id) {
            if tunnel.virtual_peer_id.as_ref() == Some(vpid) {
                debug!(%tunnel_id, "tunnel lost its circuit");
                tunnel.status = TunnelStatus::TunnelDn;
                tunnel.virtual_peer_id = None;
            }
        }
    }

    fn on_data(&self, vpid: &VirtualPeerId, bytes: &[u8], direction: TunnelDirection) {
        trace!(%vpid, ?direction, len = bytes.len(), "overlay payload received");
        self.ingest(vpid, bytes, now_secs());
    }
}

/// Serializes, encrypts and authenticates one item into a wire frame.
fn seal_frame(key: &[u8; AES_KEY_SIZE], plaintext: &[u8]) -> Vec<u8> {
    let iv = crypto::csprng_u64_nonzero();
    let ciphertext = crypto::aes_cbc_encrypt(key, iv, plaintext);
    let mac = crypto::hmac_sha1(key, &ciphertext);
    items::encode_encrypted_frame(iv, &mac, &ciphertext)
}

fn ctrl_target(core: &Core, vpid: &VirtualPeerId) -> CtrlTarget {
    let Some(record) = core.virtual_peers.get(vpid) else {
        return CtrlTarget::Gone;
    };
    let Some(tunnel_id) = record.tunnel_id else {
        return CtrlTarget::NotReady;
    };
    let Some(tunnel) = core.tunnels.get(&tunnel_id) else {
        return CtrlTarget::Gone;
    };
    if tunnel.status != TunnelStatus::CanTalk {
        return CtrlTarget::NotReady;
    }
    let Some(target) = tunnel.virtual_peer_id else {
        return CtrlTarget::NotReady;
    };
    CtrlTarget::Ready {
        target,
        key: tunnel.aes_key.clone(),
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}
