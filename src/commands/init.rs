//! Repository initialization

use log::info;

use crate::{
    backend::{FileType, WriteBackend},
    chunker::random_poly,
    crypto::{aespoly1305::Key, CryptoKey},
    error::{CryptBackendErrorKind, RepositoryErrorKind},
    id::Id,
    repofile::{
        keyfile::{add_key_to_backend, KeyOptions},
        ConfigFile,
    },
    PackdenResult,
};

/// Initialize a new repository on the given backend.
///
/// Creates a fresh master key protected by the given password and persists
/// the repository config.
///
/// # Errors
///
/// * [`RepositoryErrorKind::ConfigFileExists`] - If the backend already holds a config
///
/// # Returns
///
/// A tuple of the master key and the config file.
///
/// [`RepositoryErrorKind::ConfigFileExists`]: crate::error::RepositoryErrorKind::ConfigFileExists
pub(crate) fn init<B: WriteBackend>(
    be: &B,
    pass: &str,
    key_opts: &KeyOptions,
) -> PackdenResult<(Key, ConfigFile)> {
    if be.test(FileType::Config, &Id::default())? {
        return Err(RepositoryErrorKind::ConfigFileExists.into());
    }
    be.create()?;

    let key = Key::new();
    _ = add_key_to_backend(be, &key, pass, key_opts)?;

    // Create the config: the repository id is random, not a hash
    let repo_id = Id::random();
    let chunker_poly = random_poly()?;
    let config = ConfigFile::new(1, repo_id, chunker_poly);
    save_config(be, &key, &config)?;
    info!("repository {repo_id} successfully created.");

    Ok((key, config))
}

/// Encrypt and persist the config file.
///
/// The config is the only repository file stored under the empty name, i.e.
/// the null id.
pub(crate) fn save_config<B: WriteBackend>(
    be: &B,
    key: &Key,
    config: &ConfigFile,
) -> PackdenResult<()> {
    let data = serde_json::to_vec(config)
        .map_err(CryptBackendErrorKind::SerializingToJsonByteVectorFailed)?;
    let data = key.encrypt_data(&data)?;
    be.write_bytes(FileType::Config, &Id::default(), data.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{memory::InMemoryBackend, ReadBackend};

    fn weak_key_opts() -> KeyOptions {
        KeyOptions::default().log_n(4_u8).r(2_u32).p(1_u32)
    }

    #[test]
    fn init_writes_key_and_config() {
        let be = InMemoryBackend::new();
        let (key, config) = init(&be, "pw", &weak_key_opts()).unwrap();

        assert_eq!(config.version, 1);
        assert!(!config.id.is_null());
        assert_ne!(config.chunker_polynomial, 0);

        assert_eq!(be.list(FileType::Key).unwrap().len(), 1);
        assert!(be.test(FileType::Config, &Id::default()).unwrap());

        // the config is encrypted with the returned key
        let data = be.read_full(FileType::Config, &Id::default()).unwrap();
        let read: ConfigFile = serde_json::from_slice(&key.decrypt_data(&data).unwrap()).unwrap();
        assert_eq!(read, config);
    }

    #[test]
    fn init_twice_fails() {
        let be = InMemoryBackend::new();
        _ = init(&be, "pw", &weak_key_opts()).unwrap();
        assert!(init(&be, "pw", &weak_key_opts()).is_err());
    }
}
