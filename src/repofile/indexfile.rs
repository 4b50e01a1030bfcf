use std::cmp::Ordering;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    backend::FileType,
    blob::BlobType,
    error::IndexErrorKind,
    id::Id,
    repofile::{packfile::PackHeaderRef, RepoFile},
    PackdenResult,
};

/// An index file, mapping blob ids to the pack, offset and length they are
/// stored at.
///
/// It is stored in the repository as `index/<id>` where `<id>` is the hash of
/// the encrypted file contents.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct IndexFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    /// The ids of older index files which this file supersedes
    pub(crate) supersedes: Option<Vec<Id>>,
    /// The packs described by this index file
    pub(crate) packs: Vec<IndexPack>,
}

impl RepoFile for IndexFile {
    const TYPE: FileType = FileType::Index;

    /// Deserializes an index file, accepting both on-wire shapes.
    ///
    /// The current shape is tried first; when it reports the distinguished
    /// old-format error, the legacy decoder is retried.
    fn from_slice(data: &[u8]) -> PackdenResult<Self> {
        match Self::from_slice_current(data) {
            Err(err) if err.is_old_index_format() => {
                debug!("index file is in the legacy format, retrying with the legacy decoder");
                Self::from_slice_legacy(data)
            }
            res => res,
        }
    }
}

impl IndexFile {
    /// Adds a pack to the index file
    pub fn add(&mut self, p: IndexPack) {
        self.packs.push(p);
    }

    /// Deserializes an index file in the current on-wire shape.
    ///
    /// # Errors
    ///
    /// * [`IndexErrorKind::OldIndexFormat`] - If the document is a bare
    ///   top-level array, i.e. the legacy shape
    ///
    /// [`IndexErrorKind::OldIndexFormat`]: crate::error::IndexErrorKind::OldIndexFormat
    pub fn from_slice_current(data: &[u8]) -> PackdenResult<Self> {
        serde_json::from_slice(data).map_err(|err| {
            let first = data.iter().find(|b| !b.is_ascii_whitespace());
            if first == Some(&b'[') {
                IndexErrorKind::OldIndexFormat.into()
            } else {
                IndexErrorKind::DeserializingIndexFailed(err).into()
            }
        })
    }

    /// Deserializes an index file in the legacy on-wire shape: a bare
    /// top-level array of packs and no supersedes list.
    ///
    /// This shape is accepted on load but never produced.
    pub fn from_slice_legacy(data: &[u8]) -> PackdenResult<Self> {
        let packs: Vec<IndexPack> =
            serde_json::from_slice(data).map_err(IndexErrorKind::DeserializingIndexFailed)?;
        Ok(Self {
            supersedes: None,
            packs,
        })
    }
}

/// A pack description within an [`IndexFile`]
#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub struct IndexPack {
    /// The pack id
    pub(crate) id: Id,
    /// The blobs contained in the pack
    pub(crate) blobs: Vec<IndexBlob>,
}

impl IndexPack {
    /// Adds a blob to the pack
    ///
    /// # Arguments
    ///
    /// * `id` - The blob id
    /// * `tpe` - The blob type
    /// * `offset` - The offset of the blob within the pack
    /// * `length` - The (encrypted) length of the blob
    pub fn add(&mut self, id: Id, tpe: BlobType, offset: u32, length: u32) {
        self.blobs.push(IndexBlob {
            id,
            tpe,
            offset,
            length,
        });
    }

    /// Calculate the pack size from the contained blobs
    #[must_use]
    pub fn pack_size(&self) -> u32 {
        PackHeaderRef::from_index_pack(self).pack_size()
    }
}

/// A blob description within an [`IndexPack`]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct IndexBlob {
    /// The blob id
    pub(crate) id: Id,
    #[serde(rename = "type")]
    /// The blob type
    pub(crate) tpe: BlobType,
    /// The offset of the blob within its pack
    pub(crate) offset: u32,
    /// The (encrypted) length of the blob
    pub(crate) length: u32,
}

impl PartialOrd<IndexBlob> for IndexBlob {
    fn partial_cmp(&self, other: &IndexBlob) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexBlob {
    fn cmp(&self, other: &Self) -> Ordering {
        self.offset.cmp(&other.offset)
    }
}
