// This file is part of gxstunnel and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

//! Cryptographic primitives behind the tunnel service: the fixed 2048-bit DH
//! group, AES-128-CBC with the 8-byte wire IV, HMAC-SHA1 and CSPRNG helpers.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use num_bigint::BigUint;
use num_traits::One;
use rand_core::{OsRng, RngCore};
use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::TunnelError;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type HmacSha1 = Hmac<Sha1>;

/// AES key size used on the wire.
pub const AES_KEY_SIZE: usize = 16;
/// Size of the truncated IV carried in each encrypted frame.
pub const IV_SIZE: usize = 8;
/// Size of the HMAC-SHA1 tag carried in each encrypted frame.
pub const HMAC_SIZE: usize = 20;
/// Size of the fixed DH modulus, in bytes.
pub const DH_MODULUS_SIZE: usize = 256;

// The group is shared with the deployed network; any other modulus breaks
// wire compatibility. Generator is 5.
const DH_PRIME_2048_HEX: &[u8] = b"B3B86A844550486C7EA459FA468D3A8EFD71139593FE1C658BBEFA9B2FC0AD2628242C2CDC2F91F5B220ED29AAC271192A7374DFA28CDDCA70252F342D0821273940344A7A6A3CB70C7897A39864309F6CAC5C7EA18020EF882693CA2C12BB211B7BA8367D5A7C7252A5B5E840C9E8F081469EBA0B98BCC3F593A4D9C4D5DF539362084F1B9581316C1F80FDAD452FD56DBC6B8ED0775F596F7BB22A3FE2B4753764221528D33DB4140DE58083DB660E3E105123FC963BFF108AC3A268B7380FFA72005A1515C371287C5706FFA6062C9AC73A9B1A6AC842C2764CDACFC85556607E86611FDF486C222E4896CDF6908F239E177ACC641FCBFF72A758D1C10CBB";

fn dh_prime() -> BigUint {
    // The constant is well-formed hex, so parsing cannot fail.
    BigUint::parse_bytes(DH_PRIME_2048_HEX, 16).unwrap_or_default()
}

fn dh_generator() -> BigUint {
    BigUint::from(5u8)
}

/// An in-flight DH half-key, owned by exactly one virtual-peer record.
#[derive(Clone, Debug)]
pub struct DhKeypair {
    secret: BigUint,
    public: BigUint,
}

impl DhKeypair {
    /// Draws a fresh secret exponent and computes the matching public value.
    #[must_use]
    pub fn generate() -> Self {
        let p = dh_prime();
        let secret = random_exponent(&p);
        let public = dh_generator().modpow(&secret, &p);
        Self { secret, public }
    }

    /// Big-endian public value, leading zero bytes stripped.
    #[must_use]
    pub fn public_bytes(&self) -> Vec<u8> {
        self.public.to_bytes_be()
    }

    /// Computes the shared secret against the peer's public value.
    ///
    /// The peer value must fall inside the group, and the resulting secret
    /// must span the full modulus width; a short secret is reported as a
    /// failure, exactly like the deployed implementation.
    pub fn compute_shared(&self, peer_public: &[u8]) -> Result<Zeroizing<Vec<u8>>, TunnelError> {
        let p = dh_prime();
        let peer = BigUint::from_bytes_be(peer_public);
        let one = BigUint::one();
        if peer <= one || peer >= &p - &one {
            return Err(TunnelError::DhFailure);
        }
        let shared = peer.modpow(&self.secret, &p);
        let bytes = Zeroizing::new(shared.to_bytes_be());
        if bytes.len() != DH_MODULUS_SIZE {
            return Err(TunnelError::DhFailure);
        }
        Ok(bytes)
    }
}

// 256-bit exponents in the 2048-bit group; the exponent never leaves this
// process, so its length is not a wire-format concern.
const DH_EXPONENT_SIZE: usize = 32;

fn random_exponent(p: &BigUint) -> BigUint {
    let mut buf = Zeroizing::new([0u8; DH_EXPONENT_SIZE]);
    loop {
        OsRng.fill_bytes(&mut *buf);
        let candidate = BigUint::from_bytes_be(&*buf) % p;
        if candidate > BigUint::one() {
            return candidate;
        }
    }
}

/// Derives the 16-byte tunnel key from a DH shared secret.
#[must_use]
pub fn derive_aes_key(shared: &[u8]) -> Zeroizing<[u8; AES_KEY_SIZE]> {
    let digest = sha1_digest(shared);
    let mut key = Zeroizing::new([0u8; AES_KEY_SIZE]);
    key.copy_from_slice(&digest[..AES_KEY_SIZE]);
    key
}

/// Ciphertext length for a plaintext of `len` bytes under PKCS#7 padding.
#[must_use]
pub const fn ciphertext_len(len: usize) -> usize {
    len + (16 - len % 16)
}

/// AES-128-CBC encryption with the 8-byte wire IV zero-extended to 16.
#[must_use]
pub fn aes_cbc_encrypt(key: &[u8; AES_KEY_SIZE], iv: u64, plaintext: &[u8]) -> Vec<u8> {
    let iv16 = extend_iv(iv);
    Aes128CbcEnc::new(key.into(), (&iv16).into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

/// Matching decryption; padding errors surface as [`TunnelError::DecryptFailure`].
pub fn aes_cbc_decrypt(
    key: &[u8; AES_KEY_SIZE],
    iv: u64,
    ciphertext: &[u8],
) -> Result<Vec<u8>, TunnelError> {
    let iv16 = extend_iv(iv);
    Aes128CbcDec::new(key.into(), (&iv16).into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| TunnelError::DecryptFailure)
}

fn extend_iv(iv: u64) -> [u8; 16] {
    let mut iv16 = [0u8; 16];
    iv16[..IV_SIZE].copy_from_slice(&iv.to_be_bytes());
    iv16
}

/// HMAC-SHA1 over `data`. The frame layer keys this with the tunnel AES key.
#[must_use]
pub fn hmac_sha1(key: &[u8], data: &[u8]) -> [u8; HMAC_SIZE] {
    let mut mac = <HmacSha1 as Mac>::new_from_slice(key).expect("hmac accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Constant-time comparison of two MAC tags.
#[must_use]
pub fn hmac_matches(expected: &[u8; HMAC_SIZE], got: &[u8; HMAC_SIZE]) -> bool {
    expected.ct_eq(got).unwrap_u8() == 1
}

/// Plain SHA-1 digest.
#[must_use]
pub fn sha1_digest(data: &[u8]) -> [u8; 20] {
    Sha1::digest(data).into()
}

/// Fills a buffer of `n` bytes from the CSPRNG.
#[must_use]
pub fn csprng_bytes(n: usize) -> Vec<u8> {
    let mut out = vec![0u8; n];
    OsRng.fill_bytes(&mut out);
    out
}

/// A nonzero random 64-bit value, suitable as a frame IV.
///
/// Zero is reserved as the clear-frame discriminator, so the generator
/// redraws until the value is nonzero.
#[must_use]
pub fn csprng_u64_nonzero() -> u64 {
    nonzero_u64(&mut OsRng)
}

fn nonzero_u64<R: RngCore>(rng: &mut R) -> u64 {
    loop {
        let v = rng.next_u64();
        if v != 0 {
            return v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn ciphertext_len_always_adds_padding() {
        assert_eq!(ciphertext_len(0), 16);
        assert_eq!(ciphertext_len(15), 16);
        assert_eq!(ciphertext_len(16), 32);
        assert_eq!(ciphertext_len(17), 32);
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let key = [0x42u8; AES_KEY_SIZE];
        let iv = 0x0123_4567_89ab_cdefu64;
        let plaintext = b"a short tunnel item";
        let ct = aes_cbc_encrypt(&key, iv, plaintext);
        assert_eq!(ct.len(), ciphertext_len(plaintext.len()));
        let pt = aes_cbc_decrypt(&key, iv, &ct).unwrap();
        assert_eq!(pt, plaintext);
    }

    #[test]
    fn decrypt_with_wrong_key_fails_or_garbles() {
        let key = [0x42u8; AES_KEY_SIZE];
        let wrong = [0x43u8; AES_KEY_SIZE];
        let ct = aes_cbc_encrypt(&key, 7, b"payload bytes here");
        match aes_cbc_decrypt(&wrong, 7, &ct) {
            Err(TunnelError::DecryptFailure) => {}
            Err(other) => panic!("unexpected error {other:?}"),
            Ok(pt) => assert_ne!(pt, b"payload bytes here"),
        }
    }

    #[test]
    fn hmac_sha1_matches_rfc2202_vector() {
        let key = [0x0bu8; 20];
        let mac = hmac_sha1(&key, b"Hi There");
        assert_eq!(
            hex::encode(mac),
            "b617318655057264e28bc0b6fb378c8ef146be00"
        );
    }

    #[test]
    fn hmac_compare_is_exact() {
        let key = [9u8; AES_KEY_SIZE];
        let a = hmac_sha1(&key, b"frame");
        let mut b = a;
        assert!(hmac_matches(&a, &b));
        b[3] ^= 1;
        assert!(!hmac_matches(&a, &b));
    }

    #[test]
    fn dh_sides_agree_on_shared_secret() {
        let ours = DhKeypair::generate();
        let theirs = DhKeypair::generate();
        let a = ours.compute_shared(&theirs.public_bytes());
        let b = theirs.compute_shared(&ours.public_bytes());
        match (a, b) {
            (Ok(a), Ok(b)) => {
                assert_eq!(a.as_slice(), b.as_slice());
                assert_eq!(a.len(), DH_MODULUS_SIZE);
            }
            // A shared secret with a leading zero byte is reported as a
            // failure on both sides; rare but legitimate.
            (Err(TunnelError::DhFailure), Err(TunnelError::DhFailure)) => {}
            _ => panic!("asymmetric dh outcome"),
        }
    }

    #[test]
    fn dh_rejects_degenerate_peer_values() {
        let ours = DhKeypair::generate();
        assert!(matches!(
            ours.compute_shared(&[0u8]),
            Err(TunnelError::DhFailure)
        ));
        assert!(matches!(
            ours.compute_shared(&[1u8]),
            Err(TunnelError::DhFailure)
        ));
    }

    #[test]
    fn zero_iv_is_redrawn() {
        struct ZeroThenValue(u64, u32);
        impl RngCore for ZeroThenValue {
            fn next_u32(&mut self) -> u32 {
                self.next_u64() as u32
            }
            fn next_u64(&mut self) -> u64 {
                if self.1 == 0 {
                    self.1 = 1;
                    0
                } else {
                    self.0
                }
            }
            fn fill_bytes(&mut self, dest: &mut [u8]) {
                dest.fill(0);
            }
            fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
                self.fill_bytes(dest);
                Ok(())
            }
        }

        let mut rng = ZeroThenValue(0xdead_beef, 0);
        assert_eq!(nonzero_u64(&mut rng), 0xdead_beef);
    }

    proptest! {
        #[test]
        fn encrypt_decrypt_identity(
            key in any::<[u8; AES_KEY_SIZE]>(),
            iv in 1u64..,
            plaintext in proptest::collection::vec(any::<u8>(), 0..512),
        ) {
            let ct = aes_cbc_encrypt(&key, iv, &plaintext);
            prop_assert_eq!(ct.len(), ciphertext_len(plaintext.len()));
            let pt = aes_cbc_decrypt(&key, iv, &ct).unwrap();
            prop_assert_eq!(pt, plaintext);
        }
    }
}
