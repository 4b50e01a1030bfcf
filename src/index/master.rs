use std::{
    collections::HashSet,
    sync::{Arc, Mutex, RwLock},
    thread,
};

use crossbeam_channel::{bounded, select, Receiver};
use log::trace;

use crate::{
    blob::BlobType,
    error::BackendErrorKind,
    id::Id,
    index::{BlobIndex, IndexEntry, IndexFullness, ReadIndex},
    repofile::indexfile::IndexPack,
    PackdenResult,
};

pub(super) mod constants {
    /// Bound of the entry stream queue; the producer blocks when it is reached
    pub(super) const STREAM_QUEUE_LEN: usize = 64;
}

/// A shared handle to one member index
pub(crate) type SharedIndex = Arc<Mutex<BlobIndex>>;

/// The master index: an ordered collection of indexes plus the set of
/// in-flight blob ids.
///
/// Readers may run concurrently; inserting, replacing and creating the
/// current mutable index are serialized through a writer lock. At most one
/// member index is mutable at any time. Lookups consult the members in
/// order and return the first hit.
#[derive(Debug)]
pub struct MasterIndex {
    /// The member indexes, in insertion order
    indexes: RwLock<Vec<SharedIndex>>,
    /// Ids of blobs handed to a packer whose pack is not yet persisted
    in_flight: Mutex<HashSet<Id>>,
    /// Fullness thresholds handed to newly created mutable indexes
    fullness: IndexFullness,
}

impl MasterIndex {
    /// Create a new, empty master index.
    #[must_use]
    pub fn new(fullness: IndexFullness) -> Self {
        Self {
            indexes: RwLock::new(Vec::new()),
            in_flight: Mutex::new(HashSet::new()),
            fullness,
        }
    }

    /// Insert the given index as a new member.
    pub fn insert(&self, index: BlobIndex) {
        self.indexes
            .write()
            .unwrap()
            .push(Arc::new(Mutex::new(index)));
    }

    /// Replace all members by the given index.
    ///
    /// Used after a rebuild: the new index covers everything the old members
    /// covered.
    pub fn replace(&self, index: BlobIndex) {
        *self.indexes.write().unwrap() = vec![Arc::new(Mutex::new(index))];
    }

    /// Get the current mutable index, materializing a fresh one if no
    /// mutable index exists.
    pub fn current(&self) -> SharedIndex {
        let mut indexes = self.indexes.write().unwrap();
        for shared in indexes.iter() {
            if !shared.lock().unwrap().is_finalized() {
                return shared.clone();
            }
        }

        trace!("creating new mutable index");
        let shared = Arc::new(Mutex::new(BlobIndex::new(self.fullness)));
        indexes.push(shared.clone());
        shared
    }

    /// Look up the given blob id, returning the first hit in member order.
    #[must_use]
    pub fn lookup(&self, id: &Id) -> Option<IndexEntry> {
        for shared in self.indexes.read().unwrap().iter() {
            if let Some(entry) = shared.lock().unwrap().lookup(id) {
                return Some(*entry);
            }
        }
        None
    }

    /// Look up the plaintext length of the given blob id.
    #[must_use]
    pub fn lookup_size(&self, id: &Id) -> Option<u32> {
        self.lookup(id).map(|entry| entry.data_length())
    }

    /// The number of entries of the given blob type over all members.
    #[must_use]
    pub fn count(&self, tpe: BlobType) -> usize {
        self.indexes
            .read()
            .unwrap()
            .iter()
            .map(|shared| shared.lock().unwrap().count(tpe))
            .sum()
    }

    /// The set of distinct pack ids referenced by any member.
    #[must_use]
    pub fn packs(&self) -> HashSet<Id> {
        let mut packs = HashSet::new();
        for shared in self.indexes.read().unwrap().iter() {
            packs.extend(shared.lock().unwrap().packs().iter().copied());
        }
        packs
    }

    /// Check whether the given blob id is in-flight.
    #[must_use]
    pub fn in_flight(&self, id: &Id) -> bool {
        self.in_flight.lock().unwrap().contains(id)
    }

    /// Register the given blob id as in-flight.
    ///
    /// Returns `false` without registering if the blob is already indexed
    /// or already in-flight; concurrent saves of the same content thereby
    /// deduplicate against uncommitted blobs.
    pub fn register_in_flight(&self, id: &Id) -> bool {
        let mut in_flight = self.in_flight.lock().unwrap();
        if in_flight.contains(id) || self.has(id) {
            return false;
        }
        _ = in_flight.insert(*id);
        true
    }

    /// Remove the given blob id from the in-flight set.
    pub fn remove_in_flight(&self, id: &Id) {
        _ = self.in_flight.lock().unwrap().remove(id);
    }

    /// Add all blobs of a persisted pack to the current mutable index and
    /// take their ids off the in-flight set.
    pub fn add_pack(&self, pack: IndexPack) -> PackdenResult<()> {
        let current = self.current();
        current.lock().unwrap().add_pack(&pack)?;

        let mut in_flight = self.in_flight.lock().unwrap();
        for blob in &pack.blobs {
            _ = in_flight.remove(&blob.id);
        }
        Ok(())
    }

    /// All mutable member indexes for which [`BlobIndex::full`] holds.
    #[must_use]
    pub fn full_indexes(&self) -> Vec<SharedIndex> {
        self.indexes
            .read()
            .unwrap()
            .iter()
            .filter(|shared| {
                let index = shared.lock().unwrap();
                !index.is_finalized() && index.full()
            })
            .cloned()
            .collect()
    }

    /// All mutable member indexes.
    #[must_use]
    pub fn not_final_indexes(&self) -> Vec<SharedIndex> {
        self.indexes
            .read()
            .unwrap()
            .iter()
            .filter(|shared| !shared.lock().unwrap().is_finalized())
            .cloned()
            .collect()
    }

    /// Build a new mutable index holding every entry from every member
    /// except those living in a blacklisted pack.
    ///
    /// The new index supersedes all finalized members.
    pub fn rebuild_index(&self, blacklist: &HashSet<Id>) -> PackdenResult<BlobIndex> {
        let mut rebuilt = BlobIndex::new(self.fullness);
        let mut superseded = Vec::new();

        for shared in self.indexes.read().unwrap().iter() {
            let index = shared.lock().unwrap();
            for (id, entry) in index.entries() {
                if !blacklist.contains(&entry.pack) {
                    rebuilt.store(*id, *entry)?;
                }
            }
            if let Some(id) = index.id() {
                superseded.push(id);
            }
        }

        rebuilt.add_to_supersedes(superseded)?;
        Ok(rebuilt)
    }

    /// Stream all entries of all members over a bounded channel.
    ///
    /// The producer snapshots the member list under the read lock and holds
    /// that lock until the consumer drained the stream or cancelled it by
    /// dropping the sending half of `done`. Consumers MUST drain or cancel.
    /// A stream interrupted before its natural end emits
    /// [`BackendErrorKind::Cancelled`] as its final item, so a cancelled
    /// drain never looks like a completed one.
    ///
    /// [`BackendErrorKind::Cancelled`]: crate::error::BackendErrorKind::Cancelled
    pub fn stream_entries(
        master: &Arc<Self>,
        done: Receiver<()>,
    ) -> Receiver<PackdenResult<(Id, IndexEntry)>> {
        let (tx, rx) = bounded(constants::STREAM_QUEUE_LEN);
        let master = Arc::clone(master);

        let _ = thread::spawn(move || {
            let indexes = master.indexes.read().unwrap();
            'outer: for shared in indexes.iter() {
                let index = shared.lock().unwrap();
                for (id, entry) in index.entries() {
                    select! {
                        recv(done) -> _ => {
                            let _ = tx.send(Err(BackendErrorKind::Cancelled.into()));
                            break 'outer;
                        }
                        send(tx, Ok((*id, *entry))) -> res => {
                            if res.is_err() {
                                break 'outer;
                            }
                        }
                    }
                }
            }
        });

        rx
    }
}

impl ReadIndex for MasterIndex {
    fn get_id(&self, id: &Id) -> Option<IndexEntry> {
        self.lookup(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexFullness;

    fn entry(pack: Id) -> IndexEntry {
        IndexEntry::new(BlobType::Data, pack, 0, 64)
    }

    fn pack_with_blobs(n: u32) -> IndexPack {
        let mut pack = IndexPack::default();
        pack.id = Id::random();
        for i in 0..n {
            pack.add(Id::random(), BlobType::Data, i * 10, 10);
        }
        pack
    }

    #[test]
    fn current_materializes_one_mutable_index() {
        let master = MasterIndex::new(IndexFullness::default());
        let first = master.current();
        let second = master.current();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn lookup_returns_first_hit_in_member_order() {
        let master = MasterIndex::new(IndexFullness::default());
        let id = Id::random();
        let pack1 = Id::random();
        let pack2 = Id::random();

        let mut index1 = BlobIndex::new(IndexFullness::default());
        index1.store(id, entry(pack1)).unwrap();
        index1.finalize(Vec::new()).unwrap();
        master.insert(index1);

        let mut index2 = BlobIndex::new(IndexFullness::default());
        index2.store(id, entry(pack2)).unwrap();
        index2.finalize(Vec::new()).unwrap();
        master.insert(index2);

        assert_eq!(master.lookup(&id).unwrap().pack, pack1);
    }

    #[test]
    fn register_in_flight_deduplicates() {
        let master = MasterIndex::new(IndexFullness::default());
        let id = Id::random();

        assert!(master.register_in_flight(&id));
        assert!(!master.register_in_flight(&id));
        assert!(master.in_flight(&id));

        master.remove_in_flight(&id);
        assert!(master.register_in_flight(&id));
    }

    #[test]
    fn add_pack_indexes_blobs_and_clears_in_flight() {
        let master = MasterIndex::new(IndexFullness::default());
        let pack = pack_with_blobs(3);
        let blob_id = pack.blobs[0].id;

        assert!(master.register_in_flight(&blob_id));
        master.add_pack(pack).unwrap();

        assert!(!master.in_flight(&blob_id));
        assert!(master.has(&blob_id));
        assert_eq!(master.count(BlobType::Data), 3);
        // registering again dedups via the index now
        assert!(!master.register_in_flight(&blob_id));
    }

    #[test]
    fn rebuild_index_honors_blacklist_and_supersedes() {
        let master = MasterIndex::new(IndexFullness::default());
        let keep_pack = pack_with_blobs(2);
        let drop_pack = pack_with_blobs(2);
        let keep_blob = keep_pack.blobs[0].id;
        let drop_blob = drop_pack.blobs[0].id;

        let mut index = BlobIndex::new(IndexFullness::default());
        index.add_pack(&keep_pack).unwrap();
        index.add_pack(&drop_pack).unwrap();
        index.finalize(Vec::new()).unwrap();
        let index_id = Id::random();
        index.set_id(index_id).unwrap();
        master.insert(index);

        let blacklist = HashSet::from([drop_pack.id]);
        let rebuilt = master.rebuild_index(&blacklist).unwrap();

        assert!(rebuilt.has(&keep_blob));
        assert!(!rebuilt.has(&drop_blob));
        assert_eq!(rebuilt.supersedes(), &[index_id]);
    }

    #[test]
    fn stream_entries_yields_everything() {
        let master = Arc::new(MasterIndex::new(IndexFullness::default()));
        let pack = pack_with_blobs(100);
        master.add_pack(pack).unwrap();

        let (_done_tx, done_rx) = bounded(1);
        let streamed: Vec<_> = MasterIndex::stream_entries(&master, done_rx)
            .iter()
            .map(|res| res.unwrap())
            .collect();
        assert_eq!(streamed.len(), 100);
    }

    #[test]
    fn stream_entries_can_be_cancelled() {
        let master = Arc::new(MasterIndex::new(IndexFullness::default()));
        master.add_pack(pack_with_blobs(1000)).unwrap();

        let (done_tx, done_rx) = bounded::<()>(1);
        let rx = MasterIndex::stream_entries(&master, done_rx);
        assert!(rx.iter().next().unwrap().is_ok());
        drop(done_tx);

        // the interruption surfaces as a Cancelled error
        let rest: Vec<_> = rx.iter().collect();
        assert!(rest
            .iter()
            .any(|res| matches!(res, Err(err) if err.is_cancelled())));

        // the producer released its lock, mutation is possible again
        master.add_pack(pack_with_blobs(1)).unwrap();
    }
}
