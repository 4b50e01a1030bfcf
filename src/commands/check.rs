//! Structural validation of a repository.

use std::collections::{HashMap, HashSet, VecDeque};

use crossbeam_channel::bounded;
use displaydoc::Display;
use log::{error, warn};
use rayon::prelude::*;

use crate::{
    backend::{decrypt::DecryptFullBackend, FileType},
    blob::tree::NodeType,
    id::Id,
    index::master::MasterIndex,
    progress::Progress,
    repository::Repository,
    PackdenResult,
};

/// One structural problem found by the [`Checker`].
///
/// Issues are accumulated, not raised: every check returns the full list of
/// problems it found and it is up to the caller to decide their severity.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum CheckIssue {
    /// pack {0} is referenced in the index but missing from the backend
    PackMissing(Id),
    /// pack {0} exists in the backend but is not referenced in any index
    PackUnreferenced(Id),
    /// snapshot {0} could not be loaded: {1}
    SnapshotUnreadable(Id, String),
    /// snapshot {0} has a null tree id
    SnapshotTreeNull(Id),
    /// tree {0} is not contained in the index
    TreeNotInIndex(Id),
    /// tree {0} could not be loaded: {1}
    TreeUnreadable(Id, String),
    /// file {name} in tree {tree} has no content list
    FileWithoutContent {
        /// the containing tree
        tree: Id,
        /// the file node name
        name: String,
    },
    /// file {name} in tree {tree} has a null blob id
    BlobIdNull {
        /// the containing tree
        tree: Id,
        /// the file node name
        name: String,
    },
    /// file {name} in tree {tree} references blob {blob} which is not in the index
    BlobNotInIndex {
        /// the containing tree
        tree: Id,
        /// the file node name
        name: String,
        /// the missing blob
        blob: Id,
    },
    /// dir {name} in tree {tree} has no subtree id
    SubtreeMissing {
        /// the containing tree
        tree: Id,
        /// the dir node name
        name: String,
    },
}

/// Validates that every blob referenced by every snapshot tree is present
/// in some pack, using only the index and backend listings.
///
/// Construction snapshots the master index into three helper structures:
/// the set of referenced packs, the set of indexed blobs, and a reference
/// counter per blob which [`check_structure`] fills and
/// [`unused_blobs`] evaluates.
///
/// [`check_structure`]: Checker::check_structure
/// [`unused_blobs`]: Checker::unused_blobs
#[derive(Debug)]
pub struct Checker {
    /// All pack ids seen in any index entry
    packs: HashSet<Id>,
    /// All blob ids present in any index entry, minus those of missing packs
    blobs: HashSet<Id>,
    /// Reference counts per blob, filled by the structure check
    blob_refs: HashMap<Id, u32>,
    /// The blobs living in each pack
    by_pack: HashMap<Id, Vec<Id>>,
}

impl Checker {
    /// Create a new checker from the repository's loaded master index.
    ///
    /// # Errors
    ///
    /// If the index entry stream is interrupted.
    pub fn new<BE: DecryptFullBackend>(repo: &Repository<BE>) -> PackdenResult<Self> {
        let mut packs = HashSet::new();
        let mut blobs = HashSet::new();
        let mut blob_refs = HashMap::new();
        let mut by_pack: HashMap<Id, Vec<Id>> = HashMap::new();

        let (done_tx, done_rx) = bounded(1);
        for res in MasterIndex::stream_entries(&repo.index, done_rx).iter() {
            let (id, entry) = res?;
            _ = packs.insert(entry.pack);
            _ = blobs.insert(id);
            _ = blob_refs.entry(id).or_insert(0_u32);
            by_pack.entry(entry.pack).or_default().push(id);
        }
        drop(done_tx);

        Ok(Self {
            packs,
            blobs,
            blob_refs,
            by_pack,
        })
    }

    /// Check that every indexed pack exists in the backend and that every
    /// pack in the backend is indexed.
    ///
    /// Blobs of missing packs are dropped from the indexed-blob set, so a
    /// following [`check_structure`] reports every reference into them.
    ///
    /// [`check_structure`]: Checker::check_structure
    pub fn check_packs<BE: DecryptFullBackend>(
        &mut self,
        repo: &Repository<BE>,
    ) -> PackdenResult<Vec<CheckIssue>> {
        let mut issues = Vec::new();

        let existing = self
            .packs
            .par_iter()
            .map(|id| Ok((*id, repo.be.test(FileType::Pack, id)?)))
            .collect::<PackdenResult<Vec<_>>>()?;

        for (id, exists) in existing {
            if !exists {
                error!("pack {id} is referenced in the index but missing from the backend");
                issues.push(CheckIssue::PackMissing(id));
                if let Some(pack_blobs) = self.by_pack.get(&id) {
                    for blob in pack_blobs {
                        _ = self.blobs.remove(blob);
                    }
                }
            }
        }

        for id in repo.be.list(FileType::Pack)? {
            if !self.packs.contains(&id) {
                warn!("pack {id} exists in the backend but is not referenced in any index");
                issues.push(CheckIssue::PackUnreferenced(id));
            }
        }

        Ok(issues)
    }

    /// Breadth-first traverse the snapshot forest and verify that every
    /// referenced tree and data blob is indexed.
    ///
    /// The traversal uses an explicit work queue (deep trees exist) and a
    /// `seen` set, so shared subtrees are checked once while their
    /// references are still all counted. It continues past corrupt trees;
    /// their subtree list is simply empty.
    pub fn check_structure<BE: DecryptFullBackend>(
        &mut self,
        repo: &Repository<BE>,
        p: &impl Progress,
    ) -> PackdenResult<Vec<CheckIssue>> {
        let mut issues = Vec::new();
        let mut queue = VecDeque::new();

        let snap_ids = repo.snapshot_ids()?;
        p.set_title("checking snapshots...");
        p.set_length(snap_ids.len() as u64);
        for id in snap_ids {
            match repo.get_snapshot(&id) {
                Ok(snap) if snap.tree.is_null() => {
                    error!("snapshot {id} has a null tree id");
                    issues.push(CheckIssue::SnapshotTreeNull(id));
                }
                Ok(snap) => queue.push_back(snap.tree),
                Err(err) => {
                    error!("snapshot {id} could not be loaded: {err}");
                    issues.push(CheckIssue::SnapshotUnreadable(id, err.to_string()));
                }
            }
            p.inc(1);
        }

        let mut seen = HashSet::new();
        while let Some(tree_id) = queue.pop_front() {
            *self.blob_refs.entry(tree_id).or_insert(0) += 1;
            if !seen.insert(tree_id) {
                continue;
            }

            if !self.blobs.contains(&tree_id) {
                error!("tree {tree_id} is not contained in the index");
                issues.push(CheckIssue::TreeNotInIndex(tree_id));
                continue;
            }

            let tree = match repo.get_tree(&tree_id) {
                Ok(tree) => tree,
                Err(err) => {
                    error!("tree {tree_id} could not be loaded: {err}");
                    issues.push(CheckIssue::TreeUnreadable(tree_id, err.to_string()));
                    continue;
                }
            };

            for node in tree.nodes {
                match node.node_type {
                    NodeType::File => match &node.content {
                        None => {
                            error!("file {} in tree {tree_id} has no content list", node.name);
                            issues.push(CheckIssue::FileWithoutContent {
                                tree: tree_id,
                                name: node.name.clone(),
                            });
                        }
                        Some(content) => {
                            for blob in content {
                                if blob.is_null() {
                                    error!(
                                        "file {} in tree {tree_id} has a null blob id",
                                        node.name
                                    );
                                    issues.push(CheckIssue::BlobIdNull {
                                        tree: tree_id,
                                        name: node.name.clone(),
                                    });
                                    continue;
                                }

                                *self.blob_refs.entry(*blob).or_insert(0) += 1;
                                if !self.blobs.contains(blob) {
                                    error!(
                                        "file {} in tree {tree_id} references blob {blob} which is not in the index",
                                        node.name
                                    );
                                    issues.push(CheckIssue::BlobNotInIndex {
                                        tree: tree_id,
                                        name: node.name.clone(),
                                        blob: *blob,
                                    });
                                }
                            }
                        }
                    },
                    NodeType::Dir => match node.subtree {
                        None => {
                            error!("dir {} in tree {tree_id} has no subtree id", node.name);
                            issues.push(CheckIssue::SubtreeMissing {
                                tree: tree_id,
                                name: node.name.clone(),
                            });
                        }
                        Some(subtree) if subtree.is_null() => {
                            error!("dir {} in tree {tree_id} has a null subtree id", node.name);
                            issues.push(CheckIssue::SubtreeMissing {
                                tree: tree_id,
                                name: node.name.clone(),
                            });
                        }
                        Some(subtree) => queue.push_back(subtree),
                    },
                    NodeType::Symlink { .. } => {}
                }
            }
        }

        p.finish();
        Ok(issues)
    }

    /// Every indexed blob the structure check found no reference to.
    ///
    /// Only meaningful after [`check_structure`]; these are the candidates
    /// for pruning.
    ///
    /// [`check_structure`]: Checker::check_structure
    #[must_use]
    pub fn unused_blobs(&self) -> Vec<Id> {
        self.blob_refs
            .iter()
            .filter(|(_, refs)| **refs == 0)
            .map(|(id, _)| *id)
            .collect()
    }
}
