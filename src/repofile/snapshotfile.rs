use std::cmp::Ordering;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::{backend::FileType, id::Id, repofile::RepoFile};

/// A snapshot references the root tree of one stored filesystem state.
///
/// It is stored in the repository as `snapshots/<id>` where `<id>` is the
/// hash of the encrypted file contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotFile {
    /// The time the snapshot was taken
    pub time: DateTime<Local>,

    /// The id of the root tree blob
    pub tree: Id,

    #[serde(default)]
    /// The paths contained in the snapshot
    pub paths: Vec<String>,

    #[serde(default)]
    /// The hostname of the machine the snapshot was taken on
    pub hostname: String,

    #[serde(default)]
    /// The user that took the snapshot
    pub username: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    /// Tags set on the snapshot
    pub tags: Vec<String>,

    #[serde(skip)]
    /// The storage id of this snapshot; filled in after loading
    pub id: Id,
}

impl RepoFile for SnapshotFile {
    const TYPE: FileType = FileType::Snapshot;
}

impl SnapshotFile {
    /// Create a new snapshot referencing the given root tree.
    #[must_use]
    pub fn new(tree: Id) -> Self {
        Self {
            time: Local::now(),
            tree,
            paths: Vec::new(),
            hostname: String::new(),
            username: String::new(),
            tags: Vec::new(),
            id: Id::default(),
        }
    }

    /// Set the storage id.
    pub fn set_id(&mut self, id: Id) {
        self.id = id;
    }
}

impl PartialOrd for SnapshotFile {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SnapshotFile {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time.cmp(&other.time)
    }
}
