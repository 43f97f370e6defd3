//! Pseudo-Random Function (PRF) implementations
//!
//! Implements PRF algorithms for IKEv2 key derivation as defined in RFC 7296.

use crate::ipsec::ikev2::proposal::PrfTransformId;
use crate::ipsec::{Error, Result};
use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha384, Sha512};
use zeroize::Zeroizing;

/// Pad string for shared-key AUTH values (RFC 7296 Section 2.15)
const KEY_PAD: &[u8] = b"Key Pad for IKEv2";

/// prf+ counter is a single octet
const MAX_PRF_PLUS_BLOCKS: usize = 255;

/// PRF algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrfAlgorithm {
    /// HMAC-SHA2-256
    HmacSha256,
    /// HMAC-SHA2-384
    HmacSha384,
    /// HMAC-SHA2-512
    HmacSha512,
}

impl PrfAlgorithm {
    /// Map a negotiated PRF transform
    pub fn from_transform(id: PrfTransformId) -> Self {
        match id {
            PrfTransformId::HmacSha256 => PrfAlgorithm::HmacSha256,
            PrfTransformId::HmacSha384 => PrfAlgorithm::HmacSha384,
            PrfTransformId::HmacSha512 => PrfAlgorithm::HmacSha512,
        }
    }

    /// Get PRF output length in bytes
    pub fn output_len(self) -> usize {
        match self {
            PrfAlgorithm::HmacSha256 => 32,
            PrfAlgorithm::HmacSha384 => 48,
            PrfAlgorithm::HmacSha512 => 64,
        }
    }

    /// Compute prf(key, data)
    pub fn prf(self, key: &[u8], data: &[u8]) -> Vec<u8> {
        match self {
            PrfAlgorithm::HmacSha256 => {
                let mut mac =
                    Hmac::<Sha256>::new_from_slice(key).expect("HMAC can take key of any size");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            PrfAlgorithm::HmacSha384 => {
                let mut mac =
                    Hmac::<Sha384>::new_from_slice(key).expect("HMAC can take key of any size");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            PrfAlgorithm::HmacSha512 => {
                let mut mac =
                    Hmac::<Sha512>::new_from_slice(key).expect("HMAC can take key of any size");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
        }
    }

    /// Compute prf+ (RFC 7296 Section 2.13)
    ///
    /// ```text
    /// prf+ (K,S) = T1 | T2 | T3 | T4 | ...
    ///
    /// T1 = prf (K, S | 0x01)
    /// T2 = prf (K, T1 | S | 0x02)
    /// ```
    ///
    /// # Errors
    ///
    /// Fails when more than 255 output blocks would be needed.
    pub fn prf_plus(self, key: &[u8], seed: &[u8], output_len: usize) -> Result<Vec<u8>> {
        let blocks = (output_len + self.output_len() - 1) / self.output_len();
        if blocks > MAX_PRF_PLUS_BLOCKS {
            return Err(Error::CryptoError(format!(
                "prf+ output of {} bytes exceeds {} blocks",
                output_len, MAX_PRF_PLUS_BLOCKS
            )));
        }

        let mut output = Vec::with_capacity(blocks * self.output_len());
        let mut t: Vec<u8> = Vec::new();
        for counter in 1..=blocks as u8 {
            let mut input = Vec::with_capacity(t.len() + seed.len() + 1);
            input.extend_from_slice(&t);
            input.extend_from_slice(seed);
            input.push(counter);

            t = self.prf(key, &input);
            output.extend_from_slice(&t);
        }

        output.truncate(output_len);
        Ok(output)
    }

    /// Shared-key AUTH value: prf(prf(PSK, "Key Pad for IKEv2"), octets)
    pub fn psk_auth(self, psk: &[u8], signed_octets: &[u8]) -> Vec<u8> {
        let pad_key = Zeroizing::new(self.prf(psk, KEY_PAD));
        self.prf(&pad_key, signed_octets)
    }
}

/// IKE SA key material (RFC 7296 Section 2.14)
///
/// Keys are wiped on drop.
#[derive(Clone)]
pub struct KeyMaterial {
    /// SK_d - Key for deriving Child SA keys
    pub sk_d: Zeroizing<Vec<u8>>,
    /// SK_ai - Initiator's integrity key
    pub sk_ai: Zeroizing<Vec<u8>>,
    /// SK_ar - Responder's integrity key
    pub sk_ar: Zeroizing<Vec<u8>>,
    /// SK_ei - Initiator's encryption key
    pub sk_ei: Zeroizing<Vec<u8>>,
    /// SK_er - Responder's encryption key
    pub sk_er: Zeroizing<Vec<u8>>,
    /// SK_pi - Initiator's AUTH payload key
    pub sk_pi: Zeroizing<Vec<u8>>,
    /// SK_pr - Responder's AUTH payload key
    pub sk_pr: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial").finish_non_exhaustive()
    }
}

impl KeyMaterial {
    /// Derive key material from an already agreed shared secret
    ///
    /// ```text
    /// SKEYSEED = prf(Ni | Nr, g^ir)
    /// {SK_d | SK_ai | SK_ar | SK_ei | SK_er | SK_pi | SK_pr}
    ///     = prf+ (SKEYSEED, Ni | Nr | SPIi | SPIr)
    /// ```
    #[allow(clippy::too_many_arguments)]
    pub fn derive(
        prf: PrfAlgorithm,
        nonce_i: &[u8],
        nonce_r: &[u8],
        shared_secret: &[u8],
        spi_i: u64,
        spi_r: u64,
        encr_key_len: usize,
        integ_key_len: usize,
    ) -> Result<Self> {
        let mut nonces = Vec::with_capacity(nonce_i.len() + nonce_r.len());
        nonces.extend_from_slice(nonce_i);
        nonces.extend_from_slice(nonce_r);
        let skeyseed = Zeroizing::new(prf.prf(&nonces, shared_secret));

        let mut seed = nonces;
        seed.extend_from_slice(&spi_i.to_be_bytes());
        seed.extend_from_slice(&spi_r.to_be_bytes());

        let prf_len = prf.output_len();
        let total = 3 * prf_len + 2 * integ_key_len + 2 * encr_key_len;
        let keymat = Zeroizing::new(prf.prf_plus(&skeyseed, &seed, total)?);

        let mut rest = &keymat[..];
        let mut take = |len: usize| {
            let (key, tail) = rest.split_at(len);
            rest = tail;
            Zeroizing::new(key.to_vec())
        };

        Ok(KeyMaterial {
            sk_d: take(prf_len),
            sk_ai: take(integ_key_len),
            sk_ar: take(integ_key_len),
            sk_ei: take(encr_key_len),
            sk_er: take(encr_key_len),
            sk_pi: take(prf_len),
            sk_pr: take(prf_len),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prf_output_len() {
        for alg in [
            PrfAlgorithm::HmacSha256,
            PrfAlgorithm::HmacSha384,
            PrfAlgorithm::HmacSha512,
        ] {
            assert_eq!(alg.prf(b"key", b"data").len(), alg.output_len());
        }
    }

    #[test]
    fn test_prf_rfc4231_case2() {
        let out = PrfAlgorithm::HmacSha256.prf(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(
            hex::encode(out),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_prf_plus_prefix_stable() {
        let alg = PrfAlgorithm::HmacSha256;
        let short = alg.prf_plus(b"key", b"seed", 20).unwrap();
        let long = alg.prf_plus(b"key", b"seed", 100).unwrap();

        assert_eq!(short.len(), 20);
        assert_eq!(long.len(), 100);
        assert_eq!(&long[..20], &short[..]);

        let mut first = b"seed".to_vec();
        first.push(1);
        assert_eq!(&long[..32], &alg.prf(b"key", &first)[..]);
    }

    #[test]
    fn test_prf_plus_limit() {
        let alg = PrfAlgorithm::HmacSha256;
        assert!(alg.prf_plus(b"k", b"s", 255 * 32).is_ok());
        assert!(matches!(
            alg.prf_plus(b"k", b"s", 255 * 32 + 1),
            Err(Error::CryptoError(_))
        ));
    }

    #[test]
    fn test_key_material_layout() {
        let keys = KeyMaterial::derive(
            PrfAlgorithm::HmacSha256,
            &[1u8; 32],
            &[2u8; 32],
            &[3u8; 256],
            0x1111,
            0x2222,
            16,
            32,
        )
        .unwrap();

        assert_eq!(keys.sk_d.len(), 32);
        assert_eq!(keys.sk_ai.len(), 32);
        assert_eq!(keys.sk_ei.len(), 16);
        assert_eq!(keys.sk_pr.len(), 32);
        assert_ne!(keys.sk_ai, keys.sk_ar);
        assert_ne!(keys.sk_ei, keys.sk_er);
    }

    #[test]
    fn test_psk_auth_depends_on_key() {
        let alg = PrfAlgorithm::HmacSha256;
        let a = alg.psk_auth(b"secret", b"octets");
        assert_eq!(a, alg.psk_auth(b"secret", b"octets"));
        assert_ne!(a, alg.psk_auth(b"other", b"octets"));
    }
}
