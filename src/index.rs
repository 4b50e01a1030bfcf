use std::{
    collections::{HashMap, HashSet},
    io::Write,
    time::{Duration, SystemTime},
};

use bytes::Bytes;
use derive_more::Constructor;

use crate::{
    backend::{decrypt::DecryptReadBackend, FileType},
    blob::BlobType,
    crypto::aespoly1305,
    error::IndexErrorKind,
    id::Id,
    repofile::indexfile::{IndexBlob, IndexFile, IndexPack},
    PackdenResult,
};

pub(crate) mod master;

/// An entry in the index: where one blob lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Constructor)]
pub struct IndexEntry {
    /// The type of the blob
    pub tpe: BlobType,
    /// The pack the blob is in
    pub pack: Id,
    /// The offset of the blob in the pack
    pub offset: u32,
    /// The (encrypted) length of the blob in the pack
    pub length: u32,
}

impl IndexEntry {
    /// Create an [`IndexEntry`] from an [`IndexBlob`]
    ///
    /// # Arguments
    ///
    /// * `blob` - The [`IndexBlob`] to create the [`IndexEntry`] from
    /// * `pack` - The pack the blob is in
    #[must_use]
    pub(crate) const fn from_index_blob(blob: &IndexBlob, pack: Id) -> Self {
        Self {
            tpe: blob.tpe,
            pack,
            offset: blob.offset,
            length: blob.length,
        }
    }

    /// Get the blob described by this [`IndexEntry`] from the backend
    pub fn read_data<B: DecryptReadBackend>(&self, be: &B) -> PackdenResult<Bytes> {
        be.read_encrypted_partial(FileType::Pack, &self.pack, self.offset, self.length)
    }

    /// Get the plaintext length of the blob described by this [`IndexEntry`]
    #[must_use]
    pub const fn data_length(&self) -> u32 {
        self.length - aespoly1305::constants::OVERHEAD as u32
    }
}

/// Read access to an index
pub trait ReadIndex {
    /// Get the [`IndexEntry`] of the given blob, if indexed.
    fn get_id(&self, id: &Id) -> Option<IndexEntry>;

    /// Get the plaintext length of the given blob, if indexed.
    fn get_size(&self, id: &Id) -> Option<u32> {
        self.get_id(id).map(|entry| entry.data_length())
    }

    /// Check if the index contains the given blob.
    fn has(&self, id: &Id) -> bool {
        self.get_id(id).is_some()
    }
}

/// The thresholds deciding when a mutable index is considered full.
///
/// A full index is flushed to the backend so that a crash loses at most a
/// few minutes of index work, while large repositories amortize the index
/// overhead across many packs.
#[derive(Debug, Clone, Copy)]
pub struct IndexFullness {
    /// Number of packs after which an index is full once it also reached `min_age`
    pub min_packs: usize,
    /// Number of packs after which an index is full regardless of age
    pub max_packs: usize,
    /// Age an index must have reached before `min_packs` applies
    pub min_age: Duration,
    /// Age after which an index is full regardless of pack count
    pub max_age: Duration,
}

impl Default for IndexFullness {
    fn default() -> Self {
        Self {
            min_packs: 20,
            max_packs: 2000,
            min_age: Duration::from_secs(2 * 60),
            max_age: Duration::from_secs(15 * 60),
        }
    }
}

impl IndexFullness {
    fn is_full(&self, packs: usize, age: Duration) -> bool {
        age > self.max_age
            || packs > self.max_packs
            || (packs >= self.min_packs && age >= self.min_age)
    }
}

/// A single index: a map from blob ids to [`IndexEntry`]s.
///
/// An index starts out *mutable* and accepts [`store`]; once [`finalize`]d
/// it is immutable, may carry the storage id it was persisted under, and
/// rejects any further modification. An index decoded from an [`IndexFile`]
/// is finalized by construction.
///
/// A blob id may map to several entries when the same blob ended up in more
/// than one pack (e.g. after an interrupted repack); lookups return the
/// first entry.
///
/// [`store`]: BlobIndex::store
/// [`finalize`]: BlobIndex::finalize
#[derive(Debug)]
pub struct BlobIndex {
    /// The indexed entries
    entries: HashMap<Id, Vec<IndexEntry>>,
    /// All distinct pack ids referenced by the entries
    packs: HashSet<Id>,
    /// The ids of older indexes this index replaces
    supersedes: Vec<Id>,
    /// The fullness thresholds
    fullness: IndexFullness,
    /// When this index was created
    created: SystemTime,
    /// Whether this index has been finalized
    finalized: bool,
    /// The storage id; only set once finalized and persisted
    id: Option<Id>,
}

impl BlobIndex {
    /// Create a new mutable index.
    #[must_use]
    pub fn new(fullness: IndexFullness) -> Self {
        Self {
            entries: HashMap::new(),
            packs: HashSet::new(),
            supersedes: Vec::new(),
            fullness,
            created: SystemTime::now(),
            finalized: false,
            id: None,
        }
    }

    /// Create a finalized index from a decoded [`IndexFile`].
    ///
    /// # Arguments
    ///
    /// * `id` - The storage id the file was loaded from
    /// * `file` - The decoded index file
    #[must_use]
    pub fn from_file(id: Id, file: IndexFile) -> Self {
        let mut index = Self::new(IndexFullness::default());
        for pack in &file.packs {
            for blob in &pack.blobs {
                index.store_unchecked(blob.id, IndexEntry::from_index_blob(blob, pack.id));
            }
        }
        index.supersedes = file.supersedes.unwrap_or_default();
        index.finalized = true;
        index.id = Some(id);
        index
    }

    fn store_unchecked(&mut self, id: Id, entry: IndexEntry) {
        _ = self.packs.insert(entry.pack);
        self.entries.entry(id).or_default().push(entry);
    }

    /// Store an entry for the given blob id.
    ///
    /// # Errors
    ///
    /// * [`IndexErrorKind::IndexAlreadyFinalized`] - If the index is finalized
    ///
    /// [`IndexErrorKind::IndexAlreadyFinalized`]: crate::error::IndexErrorKind::IndexAlreadyFinalized
    pub fn store(&mut self, id: Id, entry: IndexEntry) -> PackdenResult<()> {
        if self.finalized {
            return Err(IndexErrorKind::IndexAlreadyFinalized.into());
        }
        self.store_unchecked(id, entry);
        Ok(())
    }

    /// Store entries for all blobs of the given pack.
    pub fn add_pack(&mut self, pack: &IndexPack) -> PackdenResult<()> {
        for blob in &pack.blobs {
            self.store(blob.id, IndexEntry::from_index_blob(blob, pack.id))?;
        }
        Ok(())
    }

    /// Look up the first entry of the given blob id.
    #[must_use]
    pub fn lookup(&self, id: &Id) -> Option<&IndexEntry> {
        self.entries.get(id).and_then(|entries| entries.first())
    }

    /// Look up the plaintext length of the given blob id.
    #[must_use]
    pub fn lookup_size(&self, id: &Id) -> Option<u32> {
        self.lookup(id).map(IndexEntry::data_length)
    }

    /// Check whether the given blob id is indexed.
    #[must_use]
    pub fn has(&self, id: &Id) -> bool {
        self.entries.contains_key(id)
    }

    /// All entries living in the given pack.
    ///
    /// This is a linear scan over the index.
    #[must_use]
    pub fn list_pack(&self, pack: &Id) -> Vec<(Id, IndexEntry)> {
        self.entries()
            .filter(|(_, entry)| &entry.pack == pack)
            .map(|(id, entry)| (*id, *entry))
            .collect()
    }

    /// The number of entries of the given blob type.
    #[must_use]
    pub fn count(&self, tpe: BlobType) -> usize {
        self.entries().filter(|(_, entry)| entry.tpe == tpe).count()
    }

    /// The total number of entries.
    #[must_use]
    pub fn total_count(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    /// The set of distinct pack ids referenced by this index.
    #[must_use]
    pub fn packs(&self) -> &HashSet<Id> {
        &self.packs
    }

    /// Iterate over all entries.
    ///
    /// The returned iterator borrows the index, so mutation is blocked for
    /// as long as it lives.
    pub fn entries(&self) -> impl Iterator<Item = (&Id, &IndexEntry)> + '_ {
        self.entries
            .iter()
            .flat_map(|(id, entries)| entries.iter().map(move |entry| (id, entry)))
    }

    /// Union another index into this one.
    ///
    /// On blob id collisions the other index wins: its entries are the ones
    /// future lookups return.
    ///
    /// # Errors
    ///
    /// * [`IndexErrorKind::IndexAlreadyFinalized`] - If this index is finalized
    ///
    /// [`IndexErrorKind::IndexAlreadyFinalized`]: crate::error::IndexErrorKind::IndexAlreadyFinalized
    pub fn merge(&mut self, other: Self) -> PackdenResult<()> {
        if self.finalized {
            return Err(IndexErrorKind::IndexAlreadyFinalized.into());
        }

        self.packs.extend(other.packs);
        for (id, mut new_entries) in other.entries {
            match self.entries.entry(id) {
                std::collections::hash_map::Entry::Occupied(mut occupied) => {
                    new_entries.append(occupied.get_mut());
                    *occupied.get_mut() = new_entries;
                }
                std::collections::hash_map::Entry::Vacant(vacant) => {
                    _ = vacant.insert(new_entries);
                }
            }
        }
        for id in other.supersedes {
            if !self.supersedes.contains(&id) {
                self.supersedes.push(id);
            }
        }
        Ok(())
    }

    /// Append ids to the supersedes list.
    ///
    /// # Errors
    ///
    /// * [`IndexErrorKind::IndexAlreadyFinalized`] - If the index is finalized
    ///
    /// [`IndexErrorKind::IndexAlreadyFinalized`]: crate::error::IndexErrorKind::IndexAlreadyFinalized
    pub fn add_to_supersedes(&mut self, ids: impl IntoIterator<Item = Id>) -> PackdenResult<()> {
        if self.finalized {
            return Err(IndexErrorKind::IndexAlreadyFinalized.into());
        }
        self.supersedes.extend(ids);
        Ok(())
    }

    /// The ids of the indexes this index replaces.
    #[must_use]
    pub fn supersedes(&self) -> &[Id] {
        &self.supersedes
    }

    /// Whether this index holds neither entries nor supersedes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.supersedes.is_empty()
    }

    /// Whether this index should be flushed to the backend.
    #[must_use]
    pub fn full(&self) -> bool {
        let age = self.created.elapsed().unwrap_or_default();
        self.fullness.is_full(self.packs.len(), age)
    }

    /// Convert into the serializable [`IndexFile`] form.
    #[must_use]
    pub fn to_file(&self) -> IndexFile {
        let mut packs: HashMap<Id, IndexPack> = HashMap::new();
        for (id, entry) in self.entries() {
            let pack = packs.entry(entry.pack).or_insert_with(|| IndexPack {
                id: entry.pack,
                blobs: Vec::new(),
            });
            pack.add(*id, entry.tpe, entry.offset, entry.length);
        }

        IndexFile {
            supersedes: if self.supersedes.is_empty() {
                None
            } else {
                Some(self.supersedes.clone())
            },
            packs: packs.into_values().collect(),
        }
    }

    /// Write the JSON form to the given sink without finalizing.
    pub fn encode<W: Write>(&self, writer: W) -> PackdenResult<()> {
        serde_json::to_writer(writer, &self.to_file())
            .map_err(IndexErrorKind::SerializingIndexFailed)?;
        Ok(())
    }

    /// Write the JSON form to the given sink and finalize the index.
    ///
    /// After this, no further modification is accepted.
    pub fn finalize<W: Write>(&mut self, writer: W) -> PackdenResult<()> {
        self.encode(writer)?;
        self.finalized = true;
        Ok(())
    }

    /// Whether this index has been finalized.
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Set the storage id.
    ///
    /// # Errors
    ///
    /// * [`IndexErrorKind::IndexNotFinalized`] - If the index is still mutable
    ///
    /// [`IndexErrorKind::IndexNotFinalized`]: crate::error::IndexErrorKind::IndexNotFinalized
    pub fn set_id(&mut self, id: Id) -> PackdenResult<()> {
        if !self.finalized {
            return Err(IndexErrorKind::IndexNotFinalized.into());
        }
        self.id = Some(id);
        Ok(())
    }

    /// The storage id, if finalized and persisted.
    #[must_use]
    pub fn id(&self) -> Option<Id> {
        self.id
    }
}

impl ReadIndex for BlobIndex {
    fn get_id(&self, id: &Id) -> Option<IndexEntry> {
        self.lookup(id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn entry(tpe: BlobType, pack: Id, offset: u32, length: u32) -> IndexEntry {
        IndexEntry::new(tpe, pack, offset, length)
    }

    fn index_with_one_entry() -> (BlobIndex, Id, IndexEntry) {
        let mut index = BlobIndex::new(IndexFullness::default());
        let id = Id::random();
        let e = entry(BlobType::Data, Id::random(), 0, 57);
        index.store(id, e).unwrap();
        (index, id, e)
    }

    #[test]
    fn store_and_lookup() {
        let (index, id, e) = index_with_one_entry();
        assert_eq!(index.lookup(&id), Some(&e));
        assert_eq!(index.lookup_size(&id), Some(57 - 32));
        assert!(index.has(&id));
        assert!(!index.has(&Id::random()));
        assert_eq!(index.count(BlobType::Data), 1);
        assert_eq!(index.count(BlobType::Tree), 0);
        assert_eq!(index.packs().len(), 1);
    }

    #[test]
    fn store_on_finalized_index_fails() {
        let (mut index, id, e) = index_with_one_entry();
        index.finalize(Vec::new()).unwrap();
        assert!(index.store(id, e).is_err());
        assert!(index.add_to_supersedes([Id::random()]).is_err());
    }

    #[test]
    fn set_id_requires_finalized() {
        let (mut index, _, _) = index_with_one_entry();
        assert!(index.set_id(Id::random()).is_err());
        index.finalize(Vec::new()).unwrap();
        index.set_id(Id::random()).unwrap();
        assert!(index.id().is_some());
    }

    #[test]
    fn encode_decode_roundtrip() {
        let mut index = BlobIndex::new(IndexFullness::default());
        let pack = Id::random();
        let ids: Vec<Id> = (0..10).map(|_| Id::random()).collect();
        for (i, id) in ids.iter().enumerate() {
            index
                .store(*id, entry(BlobType::Data, pack, 100 * i as u32, 100))
                .unwrap();
        }
        index.add_to_supersedes([Id::random(), Id::random()]).unwrap();

        let mut encoded = Vec::new();
        index.encode(&mut encoded).unwrap();

        let file = IndexFile::from_slice_current(&encoded).unwrap();
        let decoded = BlobIndex::from_file(Id::random(), file);
        assert!(decoded.is_finalized());
        assert_eq!(decoded.supersedes(), index.supersedes());
        for id in &ids {
            assert_eq!(decoded.lookup(id), index.lookup(id));
        }
        assert_eq!(decoded.total_count(), index.total_count());
    }

    #[test]
    fn list_pack_filters_by_pack() {
        let mut index = BlobIndex::new(IndexFullness::default());
        let pack1 = Id::random();
        let pack2 = Id::random();
        let id1 = Id::random();
        let id2 = Id::random();
        index.store(id1, entry(BlobType::Data, pack1, 0, 40)).unwrap();
        index.store(id2, entry(BlobType::Tree, pack2, 0, 50)).unwrap();

        let listed = index.list_pack(&pack1);
        assert_eq!(listed, vec![(id1, entry(BlobType::Data, pack1, 0, 40))]);
    }

    #[test]
    fn merge_lets_other_entries_win() {
        let pack1 = Id::random();
        let pack2 = Id::random();
        let id = Id::random();

        let mut first = BlobIndex::new(IndexFullness::default());
        first.store(id, entry(BlobType::Data, pack1, 0, 40)).unwrap();

        let mut second = BlobIndex::new(IndexFullness::default());
        second.store(id, entry(BlobType::Data, pack2, 7, 40)).unwrap();

        first.merge(second).unwrap();
        assert_eq!(first.lookup(&id).unwrap().pack, pack2);
        assert_eq!(first.entries.get(&id).unwrap().len(), 2);
        assert!(first.packs().contains(&pack1) && first.packs().contains(&pack2));
    }

    #[test]
    fn duplicate_entries_are_tolerated() {
        let mut index = BlobIndex::new(IndexFullness::default());
        let id = Id::random();
        index.store(id, entry(BlobType::Data, Id::random(), 0, 40)).unwrap();
        index.store(id, entry(BlobType::Data, Id::random(), 9, 40)).unwrap();

        assert_eq!(index.total_count(), 2);
        // lookup returns a stable entry
        assert_eq!(index.lookup(&id), index.lookup(&id));
    }

    #[test]
    fn fullness_predicate() {
        let fullness = IndexFullness::default();
        let minute = Duration::from_secs(60);

        assert!(!fullness.is_full(0, Duration::ZERO));
        assert!(!fullness.is_full(19, 10 * minute));

        // min pack count + min age
        assert!(fullness.is_full(20, 2 * minute));
        assert!(!fullness.is_full(20, minute));

        // hard bounds
        assert!(fullness.is_full(2001, Duration::ZERO));
        assert!(fullness.is_full(0, 16 * minute));
    }
}
