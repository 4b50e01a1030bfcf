//! Error types and Result module.

use std::num::TryFromIntError;

use aes256ctr_poly1305aes::aead;
use displaydoc::Display;
use thiserror::Error;

use crate::{backend::FileType, blob::BlobType, id::Id};

/// Result type that is being returned from methods that can fail and thus have [`PackdenError`]s.
pub type PackdenResult<T> = Result<T, PackdenError>;

// [`PackdenError`] is public, but opaque and easy to keep compatible.
#[derive(Error, Debug)]
#[error(transparent)]
/// Errors that can result from packden.
pub struct PackdenError(#[from] PackdenErrorKind);

// Accessors for anything we do want to expose publicly.
impl PackdenError {
    /// Expose the inner error kind.
    ///
    /// This is useful for matching on the error kind.
    pub fn into_inner(self) -> PackdenErrorKind {
        self.0
    }

    /// Checks if the error is an index file in the legacy on-wire shape.
    ///
    /// Callers getting this should retry with [`IndexFile::from_slice_legacy`].
    ///
    /// [`IndexFile::from_slice_legacy`]: crate::repofile::indexfile::IndexFile::from_slice_legacy
    pub fn is_old_index_format(&self) -> bool {
        matches!(
            self.0,
            PackdenErrorKind::Index(IndexErrorKind::OldIndexFormat)
        )
    }

    /// Checks if no key could be decrypted with the given password.
    pub fn is_incorrect_password(&self) -> bool {
        matches!(
            self.0,
            PackdenErrorKind::KeyFile(KeyFileErrorKind::NoSuitableKeyFound)
        )
    }

    /// Checks if the error reports a cooperatively cancelled stream.
    ///
    /// Streams interrupted by their `done` channel emit this before closing,
    /// so a cancelled drain is distinguishable from a completed one.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.0,
            PackdenErrorKind::Backend(BackendErrorKind::Cancelled)
        )
    }
}

/// [`PackdenErrorKind`] describes the errors that can happen while working with a repository.
///
/// This is a non-exhaustive enum, so additional variants may be added in future. It is
/// recommended to match against the wildcard `_` instead of listing all possible variants,
/// to avoid problems when new variants are added.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum PackdenErrorKind {
    /// [`CommandErrorKind`] describes the errors that can happen while executing a high-level command
    #[error(transparent)]
    Command(#[from] CommandErrorKind),

    /// [`CryptoErrorKind`] describes the errors that can happen while dealing with Cryptographic functions
    #[error(transparent)]
    Crypto(#[from] CryptoErrorKind),

    /// [`PolynomialErrorKind`] describes the errors that can happen while dealing with Polynomials
    #[error(transparent)]
    Polynomial(#[from] PolynomialErrorKind),

    /// [`IdErrorKind`] describes the errors that can be returned by processing IDs
    #[error(transparent)]
    Id(#[from] IdErrorKind),

    /// [`RepositoryErrorKind`] describes the errors that can be returned by processing Repositories
    #[error(transparent)]
    Repository(#[from] RepositoryErrorKind),

    /// [`IndexErrorKind`] describes the errors that can be returned by processing Indizes
    #[error(transparent)]
    Index(#[from] IndexErrorKind),

    /// [`BackendErrorKind`] describes the errors that can be returned by the Backend
    #[error(transparent)]
    Backend(#[from] BackendErrorKind),

    /// [`ConfigFileErrorKind`] describes the errors that can be returned for `ConfigFile`s
    #[error(transparent)]
    ConfigFile(#[from] ConfigFileErrorKind),

    /// [`KeyFileErrorKind`] describes the errors that can be returned for `KeyFile`s
    #[error(transparent)]
    KeyFile(#[from] KeyFileErrorKind),

    /// [`PackFileErrorKind`] describes the errors that can be returned for `PackFile`s
    #[error(transparent)]
    PackFile(#[from] PackFileErrorKind),

    /// [`PackerErrorKind`] describes the errors that can be returned for a Packer
    #[error(transparent)]
    Packer(#[from] PackerErrorKind),

    /// [`TreeErrorKind`] describes the errors that can come up dealing with Trees
    #[error(transparent)]
    Tree(#[from] TreeErrorKind),

    /// [`CryptBackendErrorKind`] describes the errors that can be returned by a Decryption action in Backends
    #[error(transparent)]
    CryptBackend(#[from] CryptBackendErrorKind),

    /// [`std::io::Error`]
    #[error(transparent)]
    StdIo(#[from] std::io::Error),
}

/// [`CommandErrorKind`] describes the errors that can happen while executing a high-level command
#[derive(Error, Debug, Display)]
pub enum CommandErrorKind {
    /// used blobs are missing: blob {0} doesn't exist
    BlobsMissing(Id),
}

/// [`CryptoErrorKind`] describes the errors that can happen while dealing with Cryptographic functions
#[derive(Error, Debug, Display, Copy, Clone)]
pub enum CryptoErrorKind {
    /// data decryption failed: `{0:?}`
    DataDecryptionFailed(aead::Error),
    /// data encryption failed
    DataEncryptionFailed,
}

/// [`PolynomialErrorKind`] describes the errors that can happen while dealing with Polynomials
#[derive(Error, Debug, Display, Copy, Clone)]
pub enum PolynomialErrorKind {
    /// no suitable polynomial found
    NoSuitablePolynomialFound,
}

/// [`IdErrorKind`] describes the errors that can be returned by processing IDs
#[derive(Error, Debug, Display, Copy, Clone)]
pub enum IdErrorKind {
    /// Hex decoding error: `{0:?}`
    HexError(hex::FromHexError),
}

/// [`RepositoryErrorKind`] describes the errors that can be returned by processing Repositories
#[derive(Error, Debug, Display)]
pub enum RepositoryErrorKind {
    /// Config file already exists. Aborting.
    ConfigFileExists,
    /// No repository config file found. Is there a repo at {0}?
    NoRepositoryConfigFound(String),
    /// incorrect password!
    IncorrectPassword,
    /// did not find id {0} in index
    IdNotFound(Id),
    /// blob {id} does not match its hash, computed: {computed}
    HashDoesNotMatch {
        /// the requested blob id
        id: Id,
        /// the hash of the data that was actually read
        computed: Id,
    },
    /// blob {id} has wrong type: requested {requested:?}, index records {recorded:?}
    WrongBlobType {
        /// the requested blob id
        id: Id,
        /// the type the caller asked for
        requested: BlobType,
        /// the type the index records
        recorded: BlobType,
    },
}

/// [`IndexErrorKind`] describes the errors that can be returned by processing Indizes
#[derive(Error, Debug, Display)]
pub enum IndexErrorKind {
    /// index is already finalized
    IndexAlreadyFinalized,
    /// index is not finalized
    IndexNotFinalized,
    /// index file is in the legacy format
    OldIndexFormat,
    /// deserializing index from JSON failed: `{0:?}`
    DeserializingIndexFailed(serde_json::Error),
    /// serializing index to JSON failed: `{0:?}`
    SerializingIndexFailed(serde_json::Error),
}

/// [`BackendErrorKind`] describes the errors that can be returned by the Backend
#[derive(Error, Debug, Display)]
pub enum BackendErrorKind {
    /// file {tpe:?} {id} does not exist in the backend
    FileNotFound {
        /// the file type
        tpe: FileType,
        /// the file id
        id: Id,
    },
    /// partial read of {tpe:?} {id} is out of bounds: offset {offset}, length {length}, file size {size}
    PartialReadOutOfBounds {
        /// the file type
        tpe: FileType,
        /// the file id
        id: Id,
        /// the requested offset
        offset: u32,
        /// the requested length
        length: u32,
        /// the actual file size
        size: u32,
    },
    /// operation was cancelled
    Cancelled,
}

/// [`CryptBackendErrorKind`] describes the errors that can be returned by a Decryption action in Backends
#[derive(Error, Debug, Display)]
pub enum CryptBackendErrorKind {
    /// deserializing from bytes of JSON Text failed: `{0:?}`
    DeserializingFromBytesOfJsonTextFailed(serde_json::Error),
    /// Serializing to JSON byte vector failed: `{0:?}`
    SerializingToJsonByteVectorFailed(serde_json::Error),
}

/// [`ConfigFileErrorKind`] describes the errors that can be returned for `ConfigFile`s
#[derive(Error, Debug, Display, Copy, Clone)]
pub enum ConfigFileErrorKind {
    /// config version {0} is not supported!
    ConfigVersionNotSupported(u32),
}

/// [`KeyFileErrorKind`] describes the errors that can be returned for `KeyFile`s
#[derive(Error, Debug, Display)]
pub enum KeyFileErrorKind {
    /// no suitable key found!
    NoSuitableKeyFound,
    /// kdf {0} is not supported
    KdfNotSupported(String),
    /// serde_json couldn't deserialize the data: `{0:?}`
    DeserializingFromSliceFailed(serde_json::Error),
    /// serde_json couldn't serialize the data into a JSON byte vector: `{0:?}`
    CouldNotSerializeAsJsonByteVector(serde_json::Error),
    /// output length is invalid: `{0:?}`
    OutputLengthInvalid(scrypt::errors::InvalidOutputLen),
    /// invalid scrypt parameters: `{0:?}`
    InvalidSCryptParameters(scrypt::errors::InvalidParams),
}

/// [`PackFileErrorKind`] describes the errors that can be returned for `PackFile`s
#[derive(Error, Debug, Display)]
pub enum PackFileErrorKind {
    /// Failed reading binary representation of the pack header: `{0:?}`
    ReadingBinaryRepresentationFailed(binrw::Error),
    /// Failed writing binary representation of the pack header: `{0:?}`
    WritingBinaryRepresentationFailed(binrw::Error),
    /// Read header length is too large! Length: {size_real}, file size: {pack_size}
    HeaderLengthTooLarge {
        /// the header length read from the file
        size_real: u32,
        /// the size of the pack file
        pack_size: u32,
    },
    /// Read header length doesn't match header contents! Length: {size_real}, computed: {size_computed}
    HeaderLengthDoesNotMatchHeaderContents {
        /// the header length read from the file
        size_real: u32,
        /// the header length computed from the parsed entries
        size_computed: u32,
    },
    /// pack size computed from header doesn't match real pack file size! Computed: {size_computed}, real: {size_real}
    HeaderPackSizeDoesNotMatchRealPackFile {
        /// the real size of the pack file
        size_real: u32,
        /// the size computed from the parsed entries
        size_computed: u32,
    },
    /// pack header contains no entries
    PackHeaderHasNoEntries,
    /// pack file is too short: {0} bytes
    PackFileTooShort(u32),
}

/// [`PackerErrorKind`] describes the errors that can be returned for a Packer
#[derive(Error, Debug, Display)]
pub enum PackerErrorKind {
    /// conversion for integer failed: `{0:?}`
    IntConversionFailed(#[from] TryFromIntError),
}

/// [`TreeErrorKind`] describes the errors that can come up dealing with Trees
#[derive(Error, Debug, Display)]
pub enum TreeErrorKind {
    /// serde_json couldn't serialize the tree: `{0:?}`
    SerializingTreeFailed(serde_json::Error),
    /// serde_json couldn't deserialize tree from bytes of JSON text: `{0:?}`
    DeserializingTreeFailed(serde_json::Error),
}

trait PackdenErrorMarker: std::error::Error {}

impl PackdenErrorMarker for CommandErrorKind {}
impl PackdenErrorMarker for CryptoErrorKind {}
impl PackdenErrorMarker for PolynomialErrorKind {}
impl PackdenErrorMarker for IdErrorKind {}
impl PackdenErrorMarker for RepositoryErrorKind {}
impl PackdenErrorMarker for IndexErrorKind {}
impl PackdenErrorMarker for BackendErrorKind {}
impl PackdenErrorMarker for CryptBackendErrorKind {}
impl PackdenErrorMarker for ConfigFileErrorKind {}
impl PackdenErrorMarker for KeyFileErrorKind {}
impl PackdenErrorMarker for PackFileErrorKind {}
impl PackdenErrorMarker for PackerErrorKind {}
impl PackdenErrorMarker for TreeErrorKind {}
impl PackdenErrorMarker for std::io::Error {}

impl<E> From<E> for PackdenError
where
    E: PackdenErrorMarker,
    PackdenErrorKind: From<E>,
{
    fn from(value: E) -> Self {
        Self(PackdenErrorKind::from(value))
    }
}
