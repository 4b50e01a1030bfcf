use serde::{de::DeserializeOwned, Serialize};

pub(crate) mod configfile;
pub(crate) mod indexfile;
pub(crate) mod keyfile;
pub(crate) mod packfile;
pub(crate) mod snapshotfile;

use crate::{backend::FileType, error::CryptBackendErrorKind, PackdenResult};

/// Marker trait for repository files which are stored as encrypted JSON
pub trait RepoFile: Serialize + DeserializeOwned + Sized + Send + Sync + 'static {
    /// The [`FileType`] associated with the repository file
    const TYPE: FileType;

    /// Deserializes the repository file from its JSON plaintext.
    fn from_slice(data: &[u8]) -> PackdenResult<Self> {
        Ok(serde_json::from_slice(data)
            .map_err(CryptBackendErrorKind::DeserializingFromBytesOfJsonTextFailed)?)
    }
}

// Part of public API

pub use {
    configfile::ConfigFile,
    indexfile::{IndexBlob, IndexFile, IndexPack},
    keyfile::KeyFile,
    packfile::{HeaderEntry, PackHeader, PackHeaderLength, PackHeaderRef},
    snapshotfile::SnapshotFile,
};
