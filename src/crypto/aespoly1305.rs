use aes256ctr_poly1305aes::{
    aead::{self, Aead, AeadInPlace},
    Aes256CtrPoly1305Aes,
};
use rand::{thread_rng, RngCore};

use crate::{crypto::CryptoKey, error::CryptoErrorKind, PackdenResult};

pub(crate) mod constants {
    /// The length of the nonce prepended to every ciphertext
    pub(crate) const NONCE_LEN: usize = 16;
    /// The length of the authentication tag appended to every ciphertext
    pub(crate) const TAG_LEN: usize = 16;
    /// The fixed per-encryption overhead: nonce + tag
    pub(crate) const OVERHEAD: usize = NONCE_LEN + TAG_LEN;
}

type Nonce = aead::Nonce<Aes256CtrPoly1305Aes>;
type AeadKey = aes256ctr_poly1305aes::Key;

/// The `Key` is used to encrypt/MAC and decrypt/verify data.
///
/// It is a 64-byte key: a 32-byte AES-256-CTR encryption key followed by the
/// 16-byte `k` and 16-byte `r` parts of the Poly1305-AES MAC key.
#[derive(Clone, Default)]
pub struct Key(AeadKey);

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // don't leak the key material into logs
        f.write_str("Key([redacted])")
    }
}

impl Key {
    /// Generate a new random [`Key`].
    #[must_use]
    pub fn new() -> Self {
        let mut key = AeadKey::default();
        thread_rng().fill_bytes(&mut key);
        Self(key)
    }

    /// Create a [`Key`] from a 64-byte slice.
    ///
    /// # Panics
    ///
    /// If the slice does not have length 64.
    #[must_use]
    pub fn from_slice(key: &[u8]) -> Self {
        Self(*AeadKey::from_slice(key))
    }

    /// Create a [`Key`] from its three parts.
    ///
    /// # Arguments
    ///
    /// * `encrypt` - The 32-byte encryption key
    /// * `k` - The 16-byte `k` part of the MAC key
    /// * `r` - The 16-byte `r` part of the MAC key
    #[must_use]
    pub fn from_keys(encrypt: &[u8], k: &[u8], r: &[u8]) -> Self {
        let mut key = AeadKey::default();
        key[0..32].copy_from_slice(encrypt);
        key[32..48].copy_from_slice(k);
        key[48..64].copy_from_slice(r);

        Self(key)
    }

    /// Split the [`Key`] into its three parts.
    #[must_use]
    pub fn to_keys(&self) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
        let mut encrypt = vec![0; 32];
        let mut k = vec![0; 16];
        let mut r = vec![0; 16];
        encrypt[0..32].copy_from_slice(&self.0[0..32]);
        k[0..16].copy_from_slice(&self.0[32..48]);
        r[0..16].copy_from_slice(&self.0[48..64]);

        (encrypt, k, r)
    }

    fn seal_into(&self, data: &[u8], out: &mut Vec<u8>) -> PackdenResult<()> {
        let mut nonce = Nonce::default();
        thread_rng().fill_bytes(&mut nonce);

        out.clear();
        out.reserve(data.len() + constants::OVERHEAD);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(data);
        let tag = Aes256CtrPoly1305Aes::new(&self.0)
            .encrypt_in_place_detached(&nonce, &[], &mut out[constants::NONCE_LEN..])
            .map_err(|_| CryptoErrorKind::DataEncryptionFailed)?;
        out.extend_from_slice(&tag);
        Ok(())
    }
}

impl CryptoKey for Key {
    fn decrypt_data(&self, data: &[u8]) -> PackdenResult<Vec<u8>> {
        if data.len() < constants::OVERHEAD {
            return Err(CryptoErrorKind::DataDecryptionFailed(aead::Error).into());
        }

        let nonce = Nonce::from_slice(&data[0..constants::NONCE_LEN]);
        Ok(Aes256CtrPoly1305Aes::new(&self.0)
            .decrypt(nonce, &data[constants::NONCE_LEN..])
            .map_err(CryptoErrorKind::DataDecryptionFailed)?)
    }

    fn encrypt_data(&self, data: &[u8]) -> PackdenResult<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() + constants::OVERHEAD);
        self.seal_into(data, &mut out)?;
        Ok(out)
    }

    fn encrypt_data_into(&self, data: &[u8], out: &mut Vec<u8>) -> PackdenResult<()> {
        self.seal_into(data, out)
    }
}
