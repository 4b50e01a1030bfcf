pub(crate) mod packer;
pub(crate) mod tree;

use enum_map::{Enum, EnumMap};
use serde::{Deserialize, Serialize};

/// All [`BlobType`]s which are supported by the repository
pub const ALL_BLOB_TYPES: [BlobType; 2] = [BlobType::Tree, BlobType::Data];

#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Enum,
)]
/// The type a `blob` can have
pub enum BlobType {
    #[serde(rename = "tree")]
    /// This is a tree blob
    Tree,
    #[serde(rename = "data")]
    /// This is a data blob
    Data,
}

/// A map from [`BlobType`] to values of type `T`
pub type BlobTypeMap<T> = EnumMap<BlobType, T>;
