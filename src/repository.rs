use std::sync::{Arc, Mutex};

use bytes::Bytes;
use crossbeam_channel::bounded;
use derive_setters::Setters;
use log::{debug, trace};

use crate::{
    backend::{
        decrypt::{DecryptBackend, DecryptFullBackend, DecryptReadBackend},
        FileType, ReadBackend, WriteBackend,
    },
    blob::{
        packer::{PackerManager, PackerOptions},
        tree::Tree,
        BlobType,
    },
    commands,
    crypto::{aespoly1305::Key, hasher::hash, CryptoKey},
    error::{CryptBackendErrorKind, PackerErrorKind, RepositoryErrorKind},
    id::Id,
    index::{master::MasterIndex, BlobIndex, IndexFullness, ReadIndex},
    progress::Progress,
    repofile::{
        keyfile::{find_key_in_backend, KeyOptions},
        ConfigFile, IndexFile, SnapshotFile,
    },
    PackdenResult,
};

pub(super) mod constants {
    /// The maximum number of ciphertext buffers kept for reuse
    pub(super) const MAX_POOLED_BUFFERS: usize = 16;
}

/// Options for opening a [`Repository`]
#[derive(Debug, Clone, Copy, Default, Setters)]
#[setters(into)]
pub struct RepositoryOptions {
    /// Pack size bounds and the open-packer limit
    pub packer: PackerOptions,

    /// Thresholds deciding when a mutable index is flushed
    pub index_fullness: IndexFullness,
}

/// A pool of ciphertext buffers.
///
/// Encryption runs in a hot loop during backup; reusing buffers avoids a
/// heap allocation per blob.
#[derive(Debug, Default)]
struct BufferPool(Mutex<Vec<Vec<u8>>>);

impl BufferPool {
    fn acquire(&self) -> Vec<u8> {
        self.0.lock().unwrap().pop().unwrap_or_default()
    }

    fn release(&self, mut buf: Vec<u8>) {
        buf.clear();
        let mut pool = self.0.lock().unwrap();
        if pool.len() < constants::MAX_POOLED_BUFFERS {
            pool.push(buf);
        }
    }
}

/// The repository: the data-plane façade over backend, crypto, index and
/// packer.
///
/// Saving deduplicates blobs by content hash against the master index;
/// loading verifies hash and blob type. [`flush`] followed by
/// [`save_index`] establishes a durability barrier: afterwards every id
/// returned by a save is recoverable from backend state alone.
///
/// [`flush`]: Repository::flush
/// [`save_index`]: Repository::save_index
#[derive(Debug)]
pub struct Repository<BE: DecryptFullBackend> {
    /// The decrypting backend
    pub(crate) be: BE,
    /// The repository config
    config: ConfigFile,
    /// The master index
    pub(crate) index: Arc<MasterIndex>,
    /// The packer manager
    packer: PackerManager<BE>,
    /// Pooled ciphertext buffers
    buffers: BufferPool,
}

impl<B: WriteBackend> Repository<DecryptBackend<B, Key>> {
    /// Initialize a new repository on the given backend.
    ///
    /// # Errors
    ///
    /// * [`RepositoryErrorKind::ConfigFileExists`] - If the backend already holds a repository
    ///
    /// [`RepositoryErrorKind::ConfigFileExists`]: crate::error::RepositoryErrorKind::ConfigFileExists
    pub fn init(
        be: &B,
        password: &str,
        key_opts: &KeyOptions,
        opts: RepositoryOptions,
    ) -> PackdenResult<Self> {
        let (key, config) = commands::init::init(be, password, key_opts)?;
        Ok(Self::from_parts(DecryptBackend::new(be, key), config, opts))
    }

    /// Open an existing repository, searching for a key the password can
    /// decrypt.
    ///
    /// # Errors
    ///
    /// * [`RepositoryErrorKind::NoRepositoryConfigFound`] - If the backend holds no config
    /// * [`KeyFileErrorKind::NoSuitableKeyFound`] - If the password decrypts none of the keys
    ///
    /// [`RepositoryErrorKind::NoRepositoryConfigFound`]: crate::error::RepositoryErrorKind::NoRepositoryConfigFound
    /// [`KeyFileErrorKind::NoSuitableKeyFound`]: crate::error::KeyFileErrorKind::NoSuitableKeyFound
    pub fn open(be: &B, password: &str, opts: RepositoryOptions) -> PackdenResult<Self> {
        if !be.test(FileType::Config, &Id::default())? {
            return Err(RepositoryErrorKind::NoRepositoryConfigFound(be.location()).into());
        }

        let key = find_key_in_backend(be, password)?;
        let dbe = DecryptBackend::new(be, key);
        let data = dbe.decrypt(&dbe.read_full(FileType::Config, &Id::default())?)?;
        let config: ConfigFile = serde_json::from_slice(&data)
            .map_err(CryptBackendErrorKind::DeserializingFromBytesOfJsonTextFailed)?;
        config.validate()?;
        debug!("opened repository {}", config.id);

        Ok(Self::from_parts(dbe, config, opts))
    }
}

impl<BE: DecryptFullBackend> Repository<BE> {
    fn from_parts(be: BE, config: ConfigFile, opts: RepositoryOptions) -> Self {
        let index = Arc::new(MasterIndex::new(opts.index_fullness));
        let packer = PackerManager::new(be.clone(), index.clone(), opts.packer);
        Self {
            be,
            config,
            index,
            packer,
            buffers: BufferPool::default(),
        }
    }

    /// The repository config.
    pub fn config(&self) -> &ConfigFile {
        &self.config
    }

    /// The master index.
    pub fn master_index(&self) -> &Arc<MasterIndex> {
        &self.index
    }

    /// Save a blob, deduplicating by content hash.
    ///
    /// # Returns
    ///
    /// The blob id, i.e. the hash of the plaintext.
    pub fn save_blob(&self, tpe: BlobType, data: &[u8]) -> PackdenResult<Id> {
        let id = hash(data);
        _ = self.save_blob_with_id(tpe, data, id)?;
        Ok(id)
    }

    /// Save a blob under a caller-provided id.
    ///
    /// The id is trusted, not recomputed.
    ///
    /// # Returns
    ///
    /// `false` if the blob was already present (indexed or in-flight) and
    /// nothing was written.
    pub fn save_blob_with_id(&self, tpe: BlobType, data: &[u8], id: Id) -> PackdenResult<bool> {
        if !self.index.register_in_flight(&id) {
            trace!("blob {id} is already known, skipping");
            return Ok(false);
        }

        match self.pack_blob(tpe, data, &id) {
            Ok(()) => Ok(true),
            Err(err) => {
                self.index.remove_in_flight(&id);
                Err(err)
            }
        }
    }

    /// Encrypt the blob and hand it to a packer, bypassing deduplication.
    ///
    /// Used by the repacker, which rewrites blobs that are still indexed in
    /// the packs about to be removed.
    pub(crate) fn repack_blob(&self, tpe: BlobType, data: &[u8], id: &Id) -> PackdenResult<()> {
        self.pack_blob(tpe, data, id)
    }

    fn pack_blob(&self, tpe: BlobType, data: &[u8], id: &Id) -> PackdenResult<()> {
        let mut buf = self.buffers.acquire();
        self.be.key().encrypt_data_into(data, &mut buf)?;
        let len = buf
            .len()
            .try_into()
            .map_err(PackerErrorKind::IntConversionFailed)?;

        let mut packer = self.packer.find_packer(len);
        if let Err(err) = packer.add_raw(&buf, id, tpe) {
            self.packer.insert_packer(packer);
            return Err(err);
        }
        self.buffers.release(buf);

        if packer.size() < self.packer.options().min_pack_size
            && self.packer.open_packers() < self.packer.options().max_packers
        {
            self.packer.insert_packer(packer);
            Ok(())
        } else {
            self.packer.save_packer(packer)
        }
    }

    /// Load a blob and verify its hash and type.
    ///
    /// # Errors
    ///
    /// * [`RepositoryErrorKind::IdNotFound`] - If the blob is not indexed
    /// * [`RepositoryErrorKind::HashDoesNotMatch`] - If the stored data does not hash to the id
    /// * [`RepositoryErrorKind::WrongBlobType`] - If the index records another type
    ///
    /// [`RepositoryErrorKind::IdNotFound`]: crate::error::RepositoryErrorKind::IdNotFound
    /// [`RepositoryErrorKind::HashDoesNotMatch`]: crate::error::RepositoryErrorKind::HashDoesNotMatch
    /// [`RepositoryErrorKind::WrongBlobType`]: crate::error::RepositoryErrorKind::WrongBlobType
    pub fn load_blob(&self, tpe: BlobType, id: &Id) -> PackdenResult<Bytes> {
        let entry = match self.index.lookup(id) {
            Some(entry) => entry,
            // the blob may still sit in an open packer; flush and retry
            None if self.index.in_flight(id) => {
                self.flush()?;
                self.index
                    .lookup(id)
                    .ok_or(RepositoryErrorKind::IdNotFound(*id))?
            }
            None => return Err(RepositoryErrorKind::IdNotFound(*id).into()),
        };

        if entry.tpe != tpe {
            return Err(RepositoryErrorKind::WrongBlobType {
                id: *id,
                requested: tpe,
                recorded: entry.tpe,
            }
            .into());
        }

        let data = entry.read_data(&self.be)?;
        let computed = hash(&data);
        if &computed != id {
            return Err(RepositoryErrorKind::HashDoesNotMatch { id: *id, computed }.into());
        }

        Ok(data)
    }

    /// Check whether a blob is present (indexed or in-flight).
    #[must_use]
    pub fn has_blob(&self, id: &Id) -> bool {
        self.index.has(id) || self.index.in_flight(id)
    }

    /// Save every open pack.
    pub fn flush(&self) -> PackdenResult<()> {
        self.packer.flush()
    }

    /// Load all index files from the backend into the master index.
    ///
    /// Index files are fetched and decoded by a bounded worker pool; the
    /// first error aborts the load and cancels the outstanding workers.
    pub fn load_index(&self, p: &impl Progress) -> PackdenResult<()> {
        p.set_title("reading index...");
        let (done_tx, done_rx) = bounded::<()>(1);
        let rx = self.be.stream_all::<IndexFile>(done_rx)?;

        for res in rx.iter() {
            match res {
                Ok((id, file)) => {
                    self.index.insert(BlobIndex::from_file(id, file));
                    p.inc(1);
                }
                Err(err) => {
                    drop(done_tx);
                    return Err(err);
                }
            }
        }

        p.finish();
        Ok(())
    }

    /// Finalize and persist every not-final index.
    pub fn save_index(&self) -> PackdenResult<()> {
        self.save_indexes(false)
    }

    /// Finalize and persist every full index.
    pub fn save_full_index(&self) -> PackdenResult<()> {
        self.save_indexes(true)
    }

    fn save_indexes(&self, only_full: bool) -> PackdenResult<()> {
        let list = if only_full {
            self.index.full_indexes()
        } else {
            self.index.not_final_indexes()
        };

        for shared in list {
            let mut index = shared.lock().unwrap();
            if index.is_empty() {
                continue;
            }

            let mut data = Vec::new();
            index.finalize(&mut data)?;
            let id = self.be.hash_write_full(FileType::Index, &data)?;
            index.set_id(id)?;
            debug!("saved index {id}");
        }
        Ok(())
    }

    /// Serialize and save a tree blob.
    pub fn save_tree(&self, tree: &Tree) -> PackdenResult<Id> {
        let (chunk, id) = tree.serialize()?;
        _ = self.save_blob_with_id(BlobType::Tree, &chunk, id)?;
        Ok(id)
    }

    /// Load and deserialize a tree blob.
    pub fn get_tree(&self, id: &Id) -> PackdenResult<Tree> {
        Tree::from_slice(&self.load_blob(BlobType::Tree, id)?)
    }

    /// Save a snapshot file.
    pub fn save_snapshot(&self, snap: &SnapshotFile) -> PackdenResult<Id> {
        self.be.save_file(snap)
    }

    /// Load a snapshot file.
    pub fn get_snapshot(&self, id: &Id) -> PackdenResult<SnapshotFile> {
        let mut snap: SnapshotFile = self.be.get_file(id)?;
        snap.set_id(*id);
        Ok(snap)
    }

    /// Remove a snapshot file.
    pub fn remove_snapshot(&self, id: &Id) -> PackdenResult<()> {
        self.be.remove(FileType::Snapshot, id)
    }

    /// List all snapshot ids.
    pub fn snapshot_ids(&self) -> PackdenResult<Vec<Id>> {
        self.be.list(FileType::Snapshot)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::{backend::memory::InMemoryBackend, progress::NoProgress};

    pub(crate) fn test_repo_opts() -> RepositoryOptions {
        // tiny packs so that tests exercise the pack rotation paths
        RepositoryOptions::default()
            .packer(PackerOptions::default().min_pack_size(512_u32).max_pack_size(2048_u32))
    }

    pub(crate) fn test_key_opts() -> KeyOptions {
        KeyOptions::default().log_n(4_u8).r(2_u32).p(1_u32)
    }

    fn init_repo() -> Repository<DecryptBackend<InMemoryBackend, Key>> {
        Repository::init(
            &InMemoryBackend::new(),
            "test",
            &test_key_opts(),
            test_repo_opts(),
        )
        .unwrap()
    }

    #[test]
    fn init_refuses_existing_repository() {
        let be = InMemoryBackend::new();
        _ = Repository::init(&be, "test", &test_key_opts(), test_repo_opts()).unwrap();

        let err = Repository::init(&be, "test", &test_key_opts(), test_repo_opts()).unwrap_err();
        assert!(matches!(
            err.into_inner(),
            crate::error::PackdenErrorKind::Repository(RepositoryErrorKind::ConfigFileExists)
        ));
    }

    #[test]
    fn open_requires_correct_password() {
        let be = InMemoryBackend::new();
        let repo = Repository::init(&be, "right", &test_key_opts(), test_repo_opts()).unwrap();
        let repo_id = repo.config().id;
        drop(repo);

        assert!(Repository::open(&be, "wrong", test_repo_opts())
            .unwrap_err()
            .is_incorrect_password());

        let repo = Repository::open(&be, "right", test_repo_opts()).unwrap();
        assert_eq!(repo.config().id, repo_id);
    }

    #[test]
    fn open_without_repository_fails() {
        let err = Repository::open(&InMemoryBackend::new(), "pw", test_repo_opts()).unwrap_err();
        assert!(matches!(
            err.into_inner(),
            crate::error::PackdenErrorKind::Repository(
                RepositoryErrorKind::NoRepositoryConfigFound(_)
            )
        ));
    }

    #[test]
    fn save_load_roundtrip() {
        let repo = init_repo();
        let id = repo.save_blob(BlobType::Data, b"some file contents").unwrap();
        repo.flush().unwrap();

        let data = repo.load_blob(BlobType::Data, &id).unwrap();
        assert_eq!(&data[..], b"some file contents");
    }

    #[test]
    fn save_deduplicates() {
        let repo = init_repo();
        let id1 = repo.save_blob(BlobType::Data, b"same bytes").unwrap();
        let id2 = repo.save_blob(BlobType::Data, b"same bytes").unwrap();
        assert_eq!(id1, id2);
        assert_eq!(id1, hash(b"same bytes"));

        repo.flush().unwrap();
        assert_eq!(repo.index.count(BlobType::Data), 1);
        assert_eq!(repo.be.list(FileType::Pack).unwrap().len(), 1);
    }

    #[test]
    fn load_of_in_flight_blob_succeeds() {
        let repo = init_repo();
        let id = repo.save_blob(BlobType::Data, b"not yet flushed").unwrap();

        // no flush yet; the blob sits in an open packer
        assert!(repo.has_blob(&id));
        let data = repo.load_blob(BlobType::Data, &id).unwrap();
        assert_eq!(&data[..], b"not yet flushed");
    }

    #[test]
    fn load_with_wrong_type_is_an_error() {
        let repo = init_repo();
        let id = repo.save_blob(BlobType::Data, b"typed").unwrap();
        repo.flush().unwrap();

        let err = repo.load_blob(BlobType::Tree, &id).unwrap_err();
        assert!(matches!(
            err.into_inner(),
            crate::error::PackdenErrorKind::Repository(RepositoryErrorKind::WrongBlobType { .. })
        ));
    }

    #[test]
    fn load_of_unknown_blob_is_not_found() {
        let repo = init_repo();
        let err = repo.load_blob(BlobType::Data, &Id::random()).unwrap_err();
        assert!(matches!(
            err.into_inner(),
            crate::error::PackdenErrorKind::Repository(RepositoryErrorKind::IdNotFound(_))
        ));
    }

    #[test]
    fn fresh_handle_recovers_from_persisted_state() {
        let be = InMemoryBackend::new();
        let repo = Repository::init(&be, "pw", &test_key_opts(), test_repo_opts()).unwrap();

        let mut ids = Vec::new();
        for i in 0..10_u32 {
            ids.push(
                repo.save_blob(BlobType::Data, format!("content {i}").as_bytes())
                    .unwrap(),
            );
        }
        repo.flush().unwrap();
        repo.save_index().unwrap();

        let fresh = Repository::open(&be, "pw", test_repo_opts()).unwrap();
        fresh.load_index(&NoProgress).unwrap();
        for (i, id) in ids.iter().enumerate() {
            assert!(fresh.has_blob(id));
            assert_eq!(
                &fresh.load_blob(BlobType::Data, id).unwrap()[..],
                format!("content {i}").as_bytes()
            );
        }
    }

    #[test]
    fn save_index_sets_index_ids() {
        let repo = init_repo();
        _ = repo.save_blob(BlobType::Data, b"blob").unwrap();
        repo.flush().unwrap();
        repo.save_index().unwrap();

        // the only member index was finalized
        assert!(repo.index.not_final_indexes().is_empty());

        let index_ids = repo.be.list(FileType::Index).unwrap();
        assert_eq!(index_ids.len(), 1);

        // and it carries the id it was stored under: rebuilding supersedes
        // exactly the persisted index file
        let rebuilt = repo.index.rebuild_index(&HashSet::new()).unwrap();
        assert_eq!(rebuilt.supersedes(), &index_ids[..]);
    }

    #[test]
    fn snapshot_roundtrip() {
        let repo = init_repo();
        let snap = SnapshotFile::new(Id::random());
        let id = repo.save_snapshot(&snap).unwrap();

        let read = repo.get_snapshot(&id).unwrap();
        assert_eq!(read.tree, snap.tree);
        assert_eq!(read.id, id);
        assert_eq!(repo.snapshot_ids().unwrap(), vec![id]);

        repo.remove_snapshot(&id).unwrap();
        assert!(repo.snapshot_ids().unwrap().is_empty());
    }
}
