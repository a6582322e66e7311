//! Wire codec for the tunnel item kinds and the overlay frame envelope.
//!
//! Frames start with an 8-byte discriminator: all-zero for clear frames
//! (DH key exchange only), a nonzero random IV for encrypted frames. The
//! item codec itself is length-delimited with big-endian integers.

use crate::crypto::HMAC_SIZE;
use crate::gateway::{IdentityKey, IdentitySignature};
use crate::{GxsId, TunnelError, GXS_ID_SIZE};

/// Status flag: keep the circuit warm while the conversation idles.
pub const STATUS_KEEP_ALIVE: u32 = 0x0001;
/// Status flag: the sender is closing the conversation.
pub const STATUS_CLOSING: u32 = 0x0002;
/// Status flag: the sender derived a key and the tunnel works end to end.
pub const STATUS_ACK_CONNECTION: u32 = 0x0004;

const KIND_DH_PUBLIC_KEY: u8 = 0x01;
const KIND_DATA: u8 = 0x02;
const KIND_DATA_ACK: u8 = 0x03;
const KIND_STATUS: u8 = 0x04;

/// Size of the clear/encrypted discriminator at the head of every frame.
pub const FRAME_PREFIX_SIZE: usize = 8;

/// One decoded tunnel item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TunnelItem {
    /// Signed half of the DH exchange, sent in clear.
    DhPublicKey {
        /// Big-endian DH public value, leading zeros stripped.
        public_value: Vec<u8>,
        /// Signature over the raw public value bytes.
        signature: IdentitySignature,
        /// The sender's public identity key, for cold-cache verification.
        signer_key: IdentityKey,
    },
    /// Application payload, individually acknowledged.
    Data {
        counter: u64,
        flags: u32,
        service_id: u32,
        data: Vec<u8>,
    },
    /// Acknowledgement of one data item.
    DataAck { counter: u64 },
    /// Connection status notice.
    Status { flags: u32 },
}

impl TunnelItem {
    /// Serializes the item, kind tag and length framing included.
    pub fn encode(&self) -> Result<Vec<u8>, TunnelError> {
        let mut body = Vec::new();
        let kind = match self {
            Self::DhPublicKey {
                public_value,
                signature,
                signer_key,
            } => {
                put_block(&mut body, public_value)?;
                body.extend_from_slice(signature.signer.as_bytes());
                put_block(&mut body, &signature.bytes)?;
                body.extend_from_slice(signer_key.key_id.as_bytes());
                put_block(&mut body, &signer_key.public_bytes)?;
                KIND_DH_PUBLIC_KEY
            }
            Self::Data {
                counter,
                flags,
                service_id,
                data,
            } => {
                body.extend_from_slice(&counter.to_be_bytes());
                body.extend_from_slice(&flags.to_be_bytes());
                body.extend_from_slice(&service_id.to_be_bytes());
                put_block(&mut body, data)?;
                KIND_DATA
            }
            Self::DataAck { counter } => {
                body.extend_from_slice(&counter.to_be_bytes());
                KIND_DATA_ACK
            }
            Self::Status { flags } => {
                body.extend_from_slice(&flags.to_be_bytes());
                KIND_STATUS
            }
        };

        let body_len = u32::try_from(body.len()).map_err(|_| TunnelError::SerializeFailure)?;
        let mut out = Vec::with_capacity(5 + body.len());
        out.push(kind);
        out.extend_from_slice(&body_len.to_be_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decodes one item; `None` on truncation, trailing bytes, or an
    /// unknown kind tag.
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 5 {
            return None;
        }
        let kind = bytes[0];
        let body_len = u32::from_be_bytes(bytes[1..5].try_into().ok()?) as usize;
        let body = &bytes[5..];
        if body.len() != body_len {
            return None;
        }

        let mut idx = 0usize;
        let item = match kind {
            KIND_DH_PUBLIC_KEY => {
                let public_value = get_block(body, &mut idx)?;
                let signer = get_id(body, &mut idx)?;
                let sig_bytes = get_block(body, &mut idx)?;
                let key_id = get_id(body, &mut idx)?;
                let public_bytes = get_block(body, &mut idx)?;
                Self::DhPublicKey {
                    public_value,
                    signature: IdentitySignature {
                        signer,
                        bytes: sig_bytes,
                    },
                    signer_key: IdentityKey {
                        key_id,
                        public_bytes,
                    },
                }
            }
            KIND_DATA => {
                let counter = get_u64(body, &mut idx)?;
                let flags = get_u32(body, &mut idx)?;
                let service_id = get_u32(body, &mut idx)?;
                let data = get_block(body, &mut idx)?;
                Self::Data {
                    counter,
                    flags,
                    service_id,
                    data,
                }
            }
            KIND_DATA_ACK => Self::DataAck {
                counter: get_u64(body, &mut idx)?,
            },
            KIND_STATUS => Self::Status {
                flags: get_u32(body, &mut idx)?,
            },
            _ => return None,
        };

        if idx != body.len() {
            return None;
        }
        Some(item)
    }
}

fn put_block(out: &mut Vec<u8>, block: &[u8]) -> Result<(), TunnelError> {
    let len = u32::try_from(block.len()).map_err(|_| TunnelError::SerializeFailure)?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(block);
    Ok(())
}

fn get_u32(body: &[u8], idx: &mut usize) -> Option<u32> {
    let v = u32::from_be_bytes(body.get(*idx..*idx + 4)?.try_into().ok()?);
    *idx += 4;
    Some(v)
}

fn get_u64(body: &[u8], idx: &mut usize) -> Option<u64> {
    let v = u64::from_be_bytes(body.get(*idx..*idx + 8)?.try_into().ok()?);
    *idx += 8;
    Some(v)
}

fn get_block(body: &[u8], idx: &mut usize) -> Option<Vec<u8>> {
    let len = get_u32(body, idx)? as usize;
    let block = body.get(*idx..*idx + len)?.to_vec();
    *idx += len;
    Some(block)
}

fn get_id(body: &[u8], idx: &mut usize) -> Option<GxsId> {
    let bytes: [u8; GXS_ID_SIZE] = body.get(*idx..*idx + GXS_ID_SIZE)?.try_into().ok()?;
    *idx += GXS_ID_SIZE;
    Some(GxsId::from_bytes(bytes))
}

/// An overlay payload split along the clear/encrypted discriminator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// Discriminator was all-zero; the rest is a serialized item.
    Clear(Vec<u8>),
    /// Discriminator was a nonzero IV; MAC and ciphertext follow.
    Encrypted {
        iv: u64,
        mac: [u8; HMAC_SIZE],
        ciphertext: Vec<u8>,
    },
}

/// Splits an overlay payload into its frame form.
///
/// Returns `None` for payloads shorter than the discriminator, and for
/// encrypted payloads too short to carry a MAC.
#[must_use]
pub fn classify_frame(bytes: &[u8]) -> Option<Frame> {
    if bytes.len() < FRAME_PREFIX_SIZE {
        return None;
    }
    let prefix = u64::from_be_bytes(bytes[..FRAME_PREFIX_SIZE].try_into().ok()?);
    if prefix == 0 {
        return Some(Frame::Clear(bytes[FRAME_PREFIX_SIZE..].to_vec()));
    }
    if bytes.len() < FRAME_PREFIX_SIZE + HMAC_SIZE {
        return None;
    }
    let mac: [u8; HMAC_SIZE] = bytes[FRAME_PREFIX_SIZE..FRAME_PREFIX_SIZE + HMAC_SIZE]
        .try_into()
        .ok()?;
    Some(Frame::Encrypted {
        iv: prefix,
        mac,
        ciphertext: bytes[FRAME_PREFIX_SIZE + HMAC_SIZE..].to_vec(),
    })
}

/// Builds a clear frame: zero discriminator followed by the item bytes.
#[must_use]
pub fn encode_clear_frame(item_bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_PREFIX_SIZE + item_bytes.len());
    out.extend_from_slice(&0u64.to_be_bytes());
    out.extend_from_slice(item_bytes);
    out
}

/// Builds an encrypted frame: `iv || mac || ciphertext`.
#[must_use]
pub fn encode_encrypted_frame(iv: u64, mac: &[u8; HMAC_SIZE], ciphertext: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_PREFIX_SIZE + HMAC_SIZE + ciphertext.len());
    out.extend_from_slice(&iv.to_be_bytes());
    out.extend_from_slice(mac);
    out.extend_from_slice(ciphertext);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_dh_item() -> TunnelItem {
        TunnelItem::DhPublicKey {
            public_value: vec![0x2a; 256],
            signature: IdentitySignature {
                signer: GxsId::from_bytes([3u8; 16]),
                bytes: vec![1, 2, 3, 4],
            },
            signer_key: IdentityKey {
                key_id: GxsId::from_bytes([3u8; 16]),
                public_bytes: vec![9, 9, 9],
            },
        }
    }

    #[test]
    fn round_trips_every_item_kind() {
        let items = [
            sample_dh_item(),
            TunnelItem::Data {
                counter: 0x0102_0304_0506_0708,
                flags: 0,
                service_id: 0xbeef,
                data: b"hello through the tunnel".to_vec(),
            },
            TunnelItem::Data {
                counter: 1,
                flags: 0,
                service_id: 7,
                data: Vec::new(),
            },
            TunnelItem::DataAck { counter: 42 },
            TunnelItem::Status {
                flags: STATUS_KEEP_ALIVE,
            },
        ];
        for item in items {
            let encoded = item.encode().unwrap();
            assert_eq!(TunnelItem::decode(&encoded), Some(item));
        }
    }

    #[test]
    fn decode_rejects_truncation_and_garbage() {
        let encoded = sample_dh_item().encode().unwrap();
        for cut in 0..encoded.len() {
            assert_eq!(TunnelItem::decode(&encoded[..cut]), None);
        }
        let mut extended = encoded.clone();
        extended.push(0);
        assert_eq!(TunnelItem::decode(&extended), None);

        let mut bad_kind = encoded;
        bad_kind[0] = 0x7f;
        assert_eq!(TunnelItem::decode(&bad_kind), None);
    }

    #[test]
    fn status_flags_are_distinct_bits() {
        assert_eq!(STATUS_KEEP_ALIVE & STATUS_CLOSING, 0);
        assert_eq!(STATUS_KEEP_ALIVE & STATUS_ACK_CONNECTION, 0);
        assert_eq!(STATUS_CLOSING & STATUS_ACK_CONNECTION, 0);
    }

    #[test]
    fn short_payloads_are_not_frames() {
        for len in 0..FRAME_PREFIX_SIZE {
            assert_eq!(classify_frame(&vec![1u8; len]), None);
        }
    }

    #[test]
    fn undersized_encrypted_payloads_are_dropped() {
        // Nonzero discriminator but no room for the MAC.
        for len in FRAME_PREFIX_SIZE..FRAME_PREFIX_SIZE + HMAC_SIZE {
            let mut bytes = vec![0u8; len];
            bytes[0] = 1;
            assert_eq!(classify_frame(&bytes), None);
        }
    }

    #[test]
    fn zero_prefix_classifies_as_clear() {
        let frame = encode_clear_frame(b"item bytes");
        assert_eq!(classify_frame(&frame), Some(Frame::Clear(b"item bytes".to_vec())));
        // A bare discriminator is a clear frame with an empty item.
        assert_eq!(
            classify_frame(&[0u8; FRAME_PREFIX_SIZE]),
            Some(Frame::Clear(Vec::new()))
        );
    }

    #[test]
    fn encrypted_frame_round_trips() {
        let mac = [7u8; HMAC_SIZE];
        let frame = encode_encrypted_frame(0xdead_beef, &mac, b"ciphertext");
        assert_eq!(
            classify_frame(&frame),
            Some(Frame::Encrypted {
                iv: 0xdead_beef,
                mac,
                ciphertext: b"ciphertext".to_vec(),
            })
        );
    }

    fn item_strategy() -> impl Strategy<Value = TunnelItem> {
        prop_oneof![
            (
                proptest::collection::vec(any::<u8>(), 1..300),
                any::<[u8; 16]>(),
                proptest::collection::vec(any::<u8>(), 0..80),
                any::<[u8; 16]>(),
                proptest::collection::vec(any::<u8>(), 0..80),
            )
                .prop_map(|(public_value, signer, sig, key_id, key)| {
                    TunnelItem::DhPublicKey {
                        public_value,
                        signature: IdentitySignature {
                            signer: GxsId::from_bytes(signer),
                            bytes: sig,
                        },
                        signer_key: IdentityKey {
                            key_id: GxsId::from_bytes(key_id),
                            public_bytes: key,
                        },
                    }
                }),
            (
                any::<u64>(),
                any::<u32>(),
                any::<u32>(),
                proptest::collection::vec(any::<u8>(), 0..300),
            )
                .prop_map(|(counter, flags, service_id, data)| TunnelItem::Data {
                    counter,
                    flags,
                    service_id,
                    data,
                }),
            any::<u64>().prop_map(|counter| TunnelItem::DataAck { counter }),
            any::<u32>().prop_map(|flags| TunnelItem::Status { flags }),
        ]
    }

    proptest! {
        #[test]
        fn codec_round_trip(item in item_strategy()) {
            let encoded = item.encode().unwrap();
            prop_assert_eq!(TunnelItem::decode(&encoded), Some(item));
        }

        #[test]
        fn decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let _ = TunnelItem::decode(&bytes);
            let _ = classify_frame(&bytes);
        }
    }
}
