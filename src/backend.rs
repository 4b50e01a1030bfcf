pub(crate) mod decrypt;
pub(crate) mod memory;

use bytes::Bytes;
use displaydoc::Display;
use serde::{Deserialize, Serialize};

use crate::{id::Id, PackdenResult};

/// Type for describing the kind of a file that can occur.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Display, Serialize, Deserialize,
)]
pub enum FileType {
    /// config
    #[serde(rename = "config")]
    Config,
    /// index
    #[serde(rename = "index")]
    Index,
    /// keys
    #[serde(rename = "key")]
    Key,
    /// snapshots
    #[serde(rename = "snapshot")]
    Snapshot,
    /// data
    #[serde(rename = "pack")]
    Pack,
    /// locks
    #[serde(rename = "lock")]
    Lock,
}

impl From<FileType> for &'static str {
    fn from(value: FileType) -> &'static str {
        match value {
            FileType::Config => "config",
            FileType::Snapshot => "snapshots",
            FileType::Index => "index",
            FileType::Key => "keys",
            FileType::Pack => "data",
            FileType::Lock => "locks",
        }
    }
}

/// Read-only access to a backend storing opaque named files per [`FileType`].
///
/// Names are the hex renderings of [`Id`]s; the config file is the exception
/// and is addressed with the null id.
pub trait ReadBackend: Clone + Send + Sync + 'static {
    /// Location of the backend, used in error messages.
    fn location(&self) -> String;

    /// Lists all files of the given type along with their stored size.
    fn list_with_size(&self, tpe: FileType) -> PackdenResult<Vec<(Id, u32)>>;

    /// Lists all files of the given type.
    fn list(&self, tpe: FileType) -> PackdenResult<Vec<Id>> {
        Ok(self
            .list_with_size(tpe)?
            .into_iter()
            .map(|(id, _)| id)
            .collect())
    }

    /// Tests whether the given file exists.
    fn test(&self, tpe: FileType, id: &Id) -> PackdenResult<bool> {
        Ok(self.list(tpe)?.contains(id))
    }

    /// Reads the complete contents of the given file.
    fn read_full(&self, tpe: FileType, id: &Id) -> PackdenResult<Bytes>;

    /// Reads `length` bytes starting at `offset` from the given file.
    fn read_partial(
        &self,
        tpe: FileType,
        id: &Id,
        offset: u32,
        length: u32,
    ) -> PackdenResult<Bytes>;
}

/// Write access to a backend.
pub trait WriteBackend: ReadBackend {
    /// Creates the backend (e.g. the directory layout). Idempotent.
    fn create(&self) -> PackdenResult<()>;

    /// Writes the given bytes under the given name.
    fn write_bytes(&self, tpe: FileType, id: &Id, buf: Bytes) -> PackdenResult<()>;

    /// Removes the given file.
    ///
    /// # Errors
    ///
    /// * [`BackendErrorKind::FileNotFound`] - If the file does not exist
    ///
    /// [`BackendErrorKind::FileNotFound`]: crate::error::BackendErrorKind::FileNotFound
    fn remove(&self, tpe: FileType, id: &Id) -> PackdenResult<()>;
}
