use crate::PackdenResult;

pub(crate) mod aespoly1305;
pub(crate) mod hasher;

/// A trait for encrypting and decrypting data.
pub trait CryptoKey: Clone + Sized + Send + Sync + 'static {
    /// Decrypt the given data.
    ///
    /// # Arguments
    ///
    /// * `data` - The data to decrypt.
    ///
    /// # Returns
    ///
    /// A vector containing the decrypted data.
    fn decrypt_data(&self, data: &[u8]) -> PackdenResult<Vec<u8>>;

    /// Encrypt the given data.
    ///
    /// # Arguments
    ///
    /// * `data` - The data to encrypt.
    ///
    /// # Returns
    ///
    /// A vector containing the encrypted data.
    fn encrypt_data(&self, data: &[u8]) -> PackdenResult<Vec<u8>>;

    /// Encrypt the given data into a caller-supplied buffer.
    ///
    /// The buffer is cleared first; on success it holds the complete
    /// ciphertext. This allows callers on a hot path to pool buffers.
    ///
    /// # Arguments
    ///
    /// * `data` - The data to encrypt.
    /// * `out` - The buffer receiving the ciphertext.
    fn encrypt_data_into(&self, data: &[u8], out: &mut Vec<u8>) -> PackdenResult<()> {
        let ciphertext = self.encrypt_data(data)?;
        out.clear();
        out.extend_from_slice(&ciphertext);
        Ok(())
    }
}
