//! Cipher suites protecting the Encrypted payload
//!
//! A [`CipherSuite`] holds already derived key material. Callers hand it
//! block-aligned input only: the message codec rejects misaligned
//! ciphertext before it gets here, so a misaligned call is a bug and
//! panics.

use crate::ipsec::ikev2::proposal::{EncrTransformId, IntegTransformId};
use crate::ipsec::{Error, Result};
use aes::{Aes128, Aes192, Aes256};
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockCipher, BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit};
use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha384, Sha512};
use zeroize::Zeroizing;

/// AES block size
const AES_BLOCK_SIZE: usize = 16;

/// Per-SA cryptographic provider
pub trait CipherSuite: Send + Sync {
    /// Cipher block size; plaintext and ciphertext lengths are multiples of it
    fn block_size(&self) -> usize;

    /// IV length expected by `encrypt`/`decrypt`
    fn iv_size(&self) -> usize {
        self.block_size()
    }

    /// Length of the tag returned by `compute_integrity`
    fn integrity_size(&self) -> usize;

    /// Encrypt block-aligned plaintext; output has the same length
    fn encrypt(&self, plaintext: &[u8], iv: &[u8]) -> Vec<u8>;

    /// Decrypt block-aligned ciphertext; output has the same length
    fn decrypt(&self, ciphertext: &[u8], iv: &[u8]) -> Vec<u8>;

    /// Integrity tag over `buffer` with the SA's authentication key
    fn compute_integrity(&self, buffer: &[u8]) -> Vec<u8>;

    /// Full-length HMAC over `buffer` with an explicit key
    fn hmac(&self, buffer: &[u8], key: &[u8]) -> Vec<u8>;
}

/// Keys for one direction of an IKE SA
pub struct SuiteKeys {
    /// SK_e
    pub encryption: Zeroizing<Vec<u8>>,
    /// SK_a
    pub integrity: Zeroizing<Vec<u8>>,
}

impl SuiteKeys {
    /// Wrap raw key bytes
    pub fn new(encryption: &[u8], integrity: &[u8]) -> Self {
        SuiteKeys {
            encryption: Zeroizing::new(encryption.to_vec()),
            integrity: Zeroizing::new(integrity.to_vec()),
        }
    }
}

/// AES-CBC encryption with truncated HMAC-SHA2 integrity
pub struct CbcHmacSuite {
    integ: IntegTransformId,
    keys: SuiteKeys,
}

impl std::fmt::Debug for CbcHmacSuite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CbcHmacSuite")
            .field("key_bits", &(self.keys.encryption.len() * 8))
            .field("integ", &self.integ)
            .finish()
    }
}

impl CbcHmacSuite {
    /// Create a suite, checking both key lengths
    pub fn new(integ: IntegTransformId, keys: SuiteKeys) -> Result<Self> {
        if !matches!(keys.encryption.len(), 16 | 24 | 32) {
            return Err(Error::InvalidKeyLength {
                expected: 16,
                actual: keys.encryption.len(),
            });
        }
        let expected = integ_key_len(integ);
        if keys.integrity.len() != expected {
            return Err(Error::InvalidKeyLength {
                expected,
                actual: keys.integrity.len(),
            });
        }
        Ok(CbcHmacSuite { integ, keys })
    }

    fn check_alignment(&self, data: &[u8], iv: &[u8]) {
        assert!(
            data.len() % AES_BLOCK_SIZE == 0,
            "cipher input of {} bytes is not block aligned",
            data.len()
        );
        assert_eq!(iv.len(), AES_BLOCK_SIZE, "IV must be one block");
    }

    fn full_hmac(&self, key: &[u8], buffer: &[u8]) -> Vec<u8> {
        match self.integ {
            IntegTransformId::HmacSha256_128 => {
                let mut mac =
                    <Hmac<Sha256> as Mac>::new_from_slice(key).expect("HMAC can take key of any size");
                mac.update(buffer);
                mac.finalize().into_bytes().to_vec()
            }
            IntegTransformId::HmacSha384_192 => {
                let mut mac =
                    <Hmac<Sha384> as Mac>::new_from_slice(key).expect("HMAC can take key of any size");
                mac.update(buffer);
                mac.finalize().into_bytes().to_vec()
            }
            IntegTransformId::HmacSha512_256 => {
                let mut mac =
                    <Hmac<Sha512> as Mac>::new_from_slice(key).expect("HMAC can take key of any size");
                mac.update(buffer);
                mac.finalize().into_bytes().to_vec()
            }
        }
    }
}

fn cbc_encrypt<C>(key: &[u8], iv: &[u8], data: &[u8]) -> Vec<u8>
where
    C: BlockCipher + BlockEncryptMut + KeyInit,
{
    cbc::Encryptor::<C>::new_from_slices(key, iv)
        .expect("key and IV lengths validated")
        .encrypt_padded_vec_mut::<NoPadding>(data)
}

fn cbc_decrypt<C>(key: &[u8], iv: &[u8], data: &[u8]) -> Vec<u8>
where
    C: BlockCipher + BlockDecryptMut + KeyInit,
{
    cbc::Decryptor::<C>::new_from_slices(key, iv)
        .expect("key and IV lengths validated")
        .decrypt_padded_vec_mut::<NoPadding>(data)
        .expect("aligned input never fails to unpad")
}

/// Integrity key length, equal to the hash output length
fn integ_key_len(integ: IntegTransformId) -> usize {
    match integ {
        IntegTransformId::HmacSha256_128 => 32,
        IntegTransformId::HmacSha384_192 => 48,
        IntegTransformId::HmacSha512_256 => 64,
    }
}

impl CipherSuite for CbcHmacSuite {
    fn block_size(&self) -> usize {
        AES_BLOCK_SIZE
    }

    fn integrity_size(&self) -> usize {
        integ_key_len(self.integ) / 2
    }

    fn encrypt(&self, plaintext: &[u8], iv: &[u8]) -> Vec<u8> {
        self.check_alignment(plaintext, iv);
        let key = &self.keys.encryption[..];
        match key.len() {
            16 => cbc_encrypt::<Aes128>(key, iv, plaintext),
            24 => cbc_encrypt::<Aes192>(key, iv, plaintext),
            _ => cbc_encrypt::<Aes256>(key, iv, plaintext),
        }
    }

    fn decrypt(&self, ciphertext: &[u8], iv: &[u8]) -> Vec<u8> {
        self.check_alignment(ciphertext, iv);
        let key = &self.keys.encryption[..];
        match key.len() {
            16 => cbc_decrypt::<Aes128>(key, iv, ciphertext),
            24 => cbc_decrypt::<Aes192>(key, iv, ciphertext),
            _ => cbc_decrypt::<Aes256>(key, iv, ciphertext),
        }
    }

    fn compute_integrity(&self, buffer: &[u8]) -> Vec<u8> {
        let mut tag = self.full_hmac(&self.keys.integrity, buffer);
        tag.truncate(self.integrity_size());
        tag
    }

    fn hmac(&self, buffer: &[u8], key: &[u8]) -> Vec<u8> {
        self.full_hmac(key, buffer)
    }
}

/// Select a suite for the negotiated ENCR/INTEG transforms
///
/// `key_bits` is the ENCR Key Length attribute.
pub fn cipher_suite_for(
    encr: EncrTransformId,
    key_bits: Option<u16>,
    integ: IntegTransformId,
    keys: SuiteKeys,
) -> Result<Box<dyn CipherSuite>> {
    if encr != EncrTransformId::AesCbc {
        return Err(Error::UnsupportedAlgorithm(format!("{:?}", encr)));
    }

    let bits = key_bits.ok_or_else(|| {
        Error::InvalidParameter("AES-CBC requires a Key Length attribute".to_string())
    })?;
    if !matches!(bits, 128 | 192 | 256) {
        return Err(Error::UnsupportedAlgorithm(format!("AES-CBC-{}", bits)));
    }
    if keys.encryption.len() * 8 != bits as usize {
        return Err(Error::InvalidKeyLength {
            expected: bits as usize / 8,
            actual: keys.encryption.len(),
        });
    }

    Ok(Box::new(CbcHmacSuite::new(integ, keys)?))
}
