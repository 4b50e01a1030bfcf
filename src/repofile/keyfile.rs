use chrono::{DateTime, Local};
use derive_setters::Setters;
use log::info;
use rand::{thread_rng, RngCore};
use scrypt::Params;
use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};

use crate::{
    backend::{FileType, ReadBackend, WriteBackend},
    crypto::{aespoly1305::Key, hasher::hash, CryptoKey},
    error::{KeyFileErrorKind, RepositoryErrorKind},
    id::Id,
    PackdenResult,
};

pub(super) mod constants {
    /// The length of the salt used by the key derivation function
    pub(super) const SALT_LEN: usize = 64;
    /// The length of the derived key
    pub(super) const DERIVED_KEY_LEN: usize = 64;
}

/// Options for generating a new repository key
#[derive(Debug, Clone, Setters)]
#[setters(into, strip_option)]
pub struct KeyOptions {
    /// The hostname to record in the key file
    pub hostname: Option<String>,

    /// The username to record in the key file
    pub username: Option<String>,

    /// Whether to record the creation time in the key file
    pub with_created: bool,

    /// The log2 of the scrypt cost parameter N
    pub log_n: u8,

    /// The scrypt block size parameter r
    pub r: u32,

    /// The scrypt parallelization parameter p
    pub p: u32,
}

impl Default for KeyOptions {
    fn default() -> Self {
        Self {
            hostname: None,
            username: None,
            with_created: true,
            log_n: 17,
            r: 8,
            p: 1,
        }
    }
}

/// A stored repository key.
///
/// Key files are plain (unencrypted) JSON; the contained `data` field holds
/// the master key, encrypted with a key derived from the password via
/// scrypt.
#[serde_as]
#[derive(Debug, Serialize, Deserialize)]
pub struct KeyFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    /// The hostname where the key was created
    hostname: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    /// The user who created the key
    username: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    /// The creation time of the key
    created: Option<DateTime<Local>>,

    /// The key derivation function used; currently always `scrypt`
    kdf: String,

    #[serde(rename = "N")]
    /// The scrypt cost parameter
    n: u32,

    /// The scrypt block size parameter
    r: u32,

    /// The scrypt parallelization parameter
    p: u32,

    #[serde_as(as = "Base64")]
    /// The salt fed into the key derivation function
    salt: Vec<u8>,

    #[serde_as(as = "Base64")]
    /// The master key, encrypted with the derived key
    data: Vec<u8>,
}

/// The master key as serialized within [`KeyFile::data`]
#[serde_as]
#[derive(Serialize, Deserialize)]
struct MasterKey {
    /// The MAC key parts
    mac: MacKey,
    #[serde_as(as = "Base64")]
    /// The encryption key
    encrypt: Vec<u8>,
}

/// The Poly1305-AES MAC key parts
#[serde_as]
#[derive(Serialize, Deserialize)]
struct MacKey {
    #[serde_as(as = "Base64")]
    k: Vec<u8>,
    #[serde_as(as = "Base64")]
    r: Vec<u8>,
}

impl KeyFile {
    /// Generate a new [`KeyFile`] wrapping the given master key.
    ///
    /// # Arguments
    ///
    /// * `key` - The master key to wrap
    /// * `passwd` - The password protecting the key
    /// * `opts` - KDF cost parameters and key metadata
    pub fn generate(key: &Key, passwd: &str, opts: &KeyOptions) -> PackdenResult<Self> {
        let (encrypt, k, r) = key.to_keys();
        let masterkey = MasterKey {
            mac: MacKey { k, r },
            encrypt,
        };
        let data = serde_json::to_vec(&masterkey)
            .map_err(KeyFileErrorKind::CouldNotSerializeAsJsonByteVector)?;

        let mut salt = vec![0; constants::SALT_LEN];
        thread_rng().fill_bytes(&mut salt);

        let mut file = Self {
            hostname: opts.hostname.clone(),
            username: opts.username.clone(),
            created: opts.with_created.then(Local::now),
            kdf: "scrypt".to_string(),
            n: 1 << opts.log_n,
            r: opts.r,
            p: opts.p,
            salt,
            data: Vec::new(),
        };
        file.data = file.kdf_key(passwd)?.encrypt_data(&data)?;

        Ok(file)
    }

    /// Recover the master key from this key file.
    ///
    /// # Errors
    ///
    /// * [`RepositoryErrorKind::IncorrectPassword`] - If the password does not decrypt the key
    ///
    /// [`RepositoryErrorKind::IncorrectPassword`]: crate::error::RepositoryErrorKind::IncorrectPassword
    pub fn key_from_password(&self, passwd: &str) -> PackdenResult<Key> {
        let data = self
            .kdf_key(passwd)?
            .decrypt_data(&self.data)
            .map_err(|_| RepositoryErrorKind::IncorrectPassword)?;
        let masterkey: MasterKey = serde_json::from_slice(&data)
            .map_err(KeyFileErrorKind::DeserializingFromSliceFailed)?;

        Ok(Key::from_keys(
            &masterkey.encrypt,
            &masterkey.mac.k,
            &masterkey.mac.r,
        ))
    }

    /// Derive the key-encryption key from the given password.
    fn kdf_key(&self, passwd: &str) -> PackdenResult<Key> {
        if self.kdf != "scrypt" {
            return Err(KeyFileErrorKind::KdfNotSupported(self.kdf.clone()).into());
        }
        if !self.n.is_power_of_two() {
            return Err(
                KeyFileErrorKind::InvalidSCryptParameters(scrypt::errors::InvalidParams).into(),
            );
        }

        let params = Params::new(
            self.n.trailing_zeros().try_into().unwrap_or(u8::MAX),
            self.r,
            self.p,
            constants::DERIVED_KEY_LEN,
        )
        .map_err(KeyFileErrorKind::InvalidSCryptParameters)?;

        let mut key = [0; constants::DERIVED_KEY_LEN];
        scrypt::scrypt(passwd.as_bytes(), &self.salt, &params, &mut key)
            .map_err(KeyFileErrorKind::OutputLengthInvalid)?;

        Ok(Key::from_slice(&key))
    }
}

/// Generate a new key file and store it in the backend.
///
/// # Returns
///
/// The id under which the key file was stored.
pub(crate) fn add_key_to_backend<B: WriteBackend>(
    be: &B,
    key: &Key,
    passwd: &str,
    opts: &KeyOptions,
) -> PackdenResult<Id> {
    let file = KeyFile::generate(key, passwd, opts)?;
    let data =
        serde_json::to_vec(&file).map_err(KeyFileErrorKind::CouldNotSerializeAsJsonByteVector)?;
    let id = hash(&data);
    be.write_bytes(FileType::Key, &id, data.into())?;
    info!("key {id} successfully added.");

    Ok(id)
}

/// Try to decrypt any stored key with the given password.
///
/// # Errors
///
/// * [`KeyFileErrorKind::NoSuitableKeyFound`] - If the password decrypts none of the stored keys
///
/// [`KeyFileErrorKind::NoSuitableKeyFound`]: crate::error::KeyFileErrorKind::NoSuitableKeyFound
pub(crate) fn find_key_in_backend<B: ReadBackend>(be: &B, passwd: &str) -> PackdenResult<Key> {
    for id in be.list(FileType::Key)? {
        let data = be.read_full(FileType::Key, &id)?;
        let file: KeyFile =
            serde_json::from_slice(&data).map_err(KeyFileErrorKind::DeserializingFromSliceFailed)?;
        if let Ok(key) = file.key_from_password(passwd) {
            return Ok(key);
        }
    }
    Err(KeyFileErrorKind::NoSuitableKeyFound.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::InMemoryBackend;

    pub(crate) fn test_key_opts() -> KeyOptions {
        // weak parameters to keep the tests fast
        KeyOptions {
            log_n: 4,
            r: 2,
            p: 1,
            ..KeyOptions::default()
        }
    }

    #[test]
    fn generated_key_roundtrips() {
        let key = Key::new();
        let file = KeyFile::generate(&key, "s3cr3t", &test_key_opts()).unwrap();

        let recovered = file.key_from_password("s3cr3t").unwrap();
        assert_eq!(recovered.to_keys(), key.to_keys());
    }

    #[test]
    fn wrong_password_is_rejected() {
        let file = KeyFile::generate(&Key::new(), "right", &test_key_opts()).unwrap();
        assert!(file.key_from_password("wrong").is_err());
    }

    #[test]
    fn keyfile_json_roundtrips() {
        let key = Key::new();
        let file = KeyFile::generate(&key, "pw", &test_key_opts()).unwrap();
        let json = serde_json::to_vec(&file).unwrap();

        let read: KeyFile = serde_json::from_slice(&json).unwrap();
        assert_eq!(
            read.key_from_password("pw").unwrap().to_keys(),
            key.to_keys()
        );
    }

    #[test]
    fn find_key_searches_all_keys() {
        let be = InMemoryBackend::new();
        let key1 = Key::new();
        let key2 = Key::new();
        _ = add_key_to_backend(&be, &key1, "first", &test_key_opts()).unwrap();
        _ = add_key_to_backend(&be, &key2, "second", &test_key_opts()).unwrap();

        let found = find_key_in_backend(&be, "second").unwrap();
        assert_eq!(found.to_keys(), key2.to_keys());

        let err = find_key_in_backend(&be, "third").unwrap_err();
        assert!(err.is_incorrect_password());
    }
}
