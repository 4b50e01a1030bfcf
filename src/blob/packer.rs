use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use derive_setters::Setters;
use log::debug;

use crate::{
    backend::{decrypt::DecryptWriteBackend, FileType},
    blob::BlobType,
    crypto::{hasher::Hasher, CryptoKey},
    error::PackerErrorKind,
    id::Id,
    index::master::MasterIndex,
    repofile::{
        indexfile::IndexPack,
        packfile::{PackHeaderLength, PackHeaderRef},
    },
    PackdenResult,
};

pub(crate) mod constants {
    pub(super) const KB: u32 = 1024;
    pub(super) const MB: u32 = 1024 * KB;
    /// The soft minimum pack size; packs below it stay open for more blobs
    pub(super) const DEFAULT_MIN_PACK_SIZE: u32 = 4 * MB;
    /// The hard maximum pack size
    pub(super) const DEFAULT_MAX_PACK_SIZE: u32 = 16 * MB;
    /// The maximum number of simultaneously open packers
    pub(super) const DEFAULT_MAX_PACKERS: usize = 200;
}

/// Size bounds for packs and the open-packer set.
#[derive(Debug, Clone, Copy, Setters)]
#[setters(into)]
pub struct PackerOptions {
    /// Packs smaller than this stay open for more blobs; only the final
    /// flush may produce smaller packs
    pub min_pack_size: u32,

    /// No pack payload ever exceeds this size
    pub max_pack_size: u32,

    /// At most this many packers are kept open simultaneously
    pub max_packers: usize,
}

impl Default for PackerOptions {
    fn default() -> Self {
        Self {
            min_pack_size: constants::DEFAULT_MIN_PACK_SIZE,
            max_pack_size: constants::DEFAULT_MAX_PACK_SIZE,
            max_packers: constants::DEFAULT_MAX_PACKERS,
        }
    }
}

/// A pack file being assembled.
///
/// Blobs are appended already encrypted; a running SHA-256 over everything
/// written makes the pack id available right at [`finalize`] without
/// re-hashing the assembled bytes.
///
/// [`finalize`]: RawPacker::finalize
#[derive(Debug, Default)]
pub(crate) struct RawPacker {
    /// The assembled pack file contents
    file: BytesMut,
    /// The current payload size
    size: u32,
    /// The running hash over everything written
    hasher: Hasher,
    /// The index entries of the contained blobs
    index: IndexPack,
}

impl RawPacker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// The current payload size.
    pub(crate) fn size(&self) -> u32 {
        self.size
    }

    /// The number of contained blobs.
    pub(crate) fn count(&self) -> usize {
        self.index.blobs.len()
    }

    /// Whether the given blob is already contained.
    pub(crate) fn has(&self, id: &Id) -> bool {
        self.index.blobs.iter().any(|blob| &blob.id == id)
    }

    /// Whether a blob of the given size still fits under the hard maximum.
    fn fits(&self, extra: u32, max_pack_size: u32) -> bool {
        u64::from(self.size) + u64::from(extra) < u64::from(max_pack_size)
    }

    fn write_data(&mut self, data: &[u8]) -> PackdenResult<u32> {
        let len = data
            .len()
            .try_into()
            .map_err(PackerErrorKind::IntConversionFailed)?;
        self.hasher.update(data);
        self.file.extend_from_slice(data);
        self.size += len;
        Ok(len)
    }

    /// Append an already-encrypted blob and record its index entry.
    ///
    /// # Returns
    ///
    /// The number of bytes written.
    pub(crate) fn add_raw(&mut self, data: &[u8], id: &Id, tpe: BlobType) -> PackdenResult<u32> {
        let offset = self.size;
        let len = self.write_data(data)?;
        self.index.add(*id, tpe, offset, len);
        Ok(len)
    }

    /// Write the encrypted header and the header length field.
    fn write_header(&mut self, key: &impl CryptoKey) -> PackdenResult<()> {
        let data = PackHeaderRef::from_index_pack(&self.index).to_binary()?;
        let data = key.encrypt_data(&data)?;

        let headerlen = data
            .len()
            .try_into()
            .map_err(PackerErrorKind::IntConversionFailed)?;
        _ = self.write_data(&data)?;

        // finally write length of header unencrypted to pack file
        _ = self.write_data(&PackHeaderLength::from_u32(headerlen).to_binary()?)?;

        Ok(())
    }

    /// Finish the pack: write the trailer and compute the pack id from the
    /// running hash.
    ///
    /// Returns `None` for a packer without any blobs; zero-blob packs are
    /// never produced.
    pub(crate) fn finalize(
        mut self,
        key: &impl CryptoKey,
    ) -> PackdenResult<Option<(Id, Bytes, IndexPack)>> {
        if self.index.blobs.is_empty() {
            return Ok(None);
        }

        self.write_header(key)?;
        let id = self.hasher.finalize();
        let mut index = self.index;
        index.id = id;

        Ok(Some((id, self.file.freeze(), index)))
    }
}

/// Batches blobs into packs honoring the size bounds.
///
/// The manager keeps a set of open packers. Its lock only guards the
/// open-set bookkeeping; backend I/O happens without holding it.
#[derive(Debug)]
pub struct PackerManager<BE: DecryptWriteBackend> {
    /// The backend to write packs to
    be: BE,
    /// The master index receiving entries of persisted packs
    index: Arc<MasterIndex>,
    /// The size bounds
    opts: PackerOptions,
    /// The open packers
    open: Mutex<Vec<RawPacker>>,
}

impl<BE: DecryptWriteBackend> PackerManager<BE> {
    /// Create a new packer manager writing through the given backend.
    pub fn new(be: BE, index: Arc<MasterIndex>, opts: PackerOptions) -> Self {
        Self {
            be,
            index,
            opts,
            open: Mutex::new(Vec::new()),
        }
    }

    /// The configured size bounds.
    pub fn options(&self) -> &PackerOptions {
        &self.opts
    }

    /// The number of currently open packers.
    pub fn open_packers(&self) -> usize {
        self.open.lock().unwrap().len()
    }

    /// Take a packer which still has room for `size` more bytes.
    ///
    /// The packer is removed from the open set while the caller holds it;
    /// hand it back via [`insert_packer`] or [`save_packer`]. If no open
    /// packer fits, a fresh one is created.
    ///
    /// [`insert_packer`]: PackerManager::insert_packer
    /// [`save_packer`]: PackerManager::save_packer
    pub(crate) fn find_packer(&self, size: u32) -> RawPacker {
        let mut open = self.open.lock().unwrap();
        match open
            .iter()
            .position(|packer| packer.fits(size, self.opts.max_pack_size))
        {
            Some(pos) => open.remove(pos),
            None => RawPacker::new(),
        }
    }

    /// Put a not-yet-full packer back into the open set.
    pub(crate) fn insert_packer(&self, packer: RawPacker) {
        self.open.lock().unwrap().push(packer);
    }

    /// Finalize the pack, persist it and index its blobs.
    ///
    /// A packer without blobs is silently discarded.
    pub(crate) fn save_packer(&self, packer: RawPacker) -> PackdenResult<()> {
        match packer.finalize(self.be.key())? {
            None => {
                debug!("discarding empty pack");
                Ok(())
            }
            Some((id, file, index_pack)) => {
                debug!(
                    "saving pack {id}: {} blobs, {} bytes",
                    index_pack.blobs.len(),
                    file.len()
                );
                self.be.write_bytes(FileType::Pack, &id, file)?;
                self.index.add_pack(index_pack)
            }
        }
    }

    /// Save every open packer and drop them.
    pub fn flush(&self) -> PackdenResult<()> {
        let packers = std::mem::take(&mut *self.open.lock().unwrap());
        for packer in packers {
            self.save_packer(packer)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{
            decrypt::{DecryptBackend, DecryptReadBackend},
            memory::InMemoryBackend,
            ReadBackend,
        },
        crypto::{aespoly1305::Key, hasher::hash},
        index::{IndexFullness, ReadIndex},
        repofile::packfile::PackHeader,
    };

    fn manager() -> PackerManager<DecryptBackend<InMemoryBackend, Key>> {
        let be = DecryptBackend::new(&InMemoryBackend::new(), Key::new());
        let index = Arc::new(MasterIndex::new(IndexFullness::default()));
        PackerManager::new(be, index, PackerOptions::default())
    }

    #[test]
    fn empty_packer_is_discarded() {
        let manager = manager();
        let packer = manager.find_packer(10);
        manager.save_packer(packer).unwrap();

        assert!(manager.be.list(FileType::Pack).unwrap().is_empty());
    }

    #[test]
    fn pack_roundtrips_through_reader() {
        let manager = manager();
        let key = manager.be.key().clone();

        let blobs: Vec<(Id, Vec<u8>)> = [&b"first"[..], &b"second blob"[..], &b""[..]]
            .iter()
            .map(|data| (hash(data), key.encrypt_data(data).unwrap()))
            .collect();

        let mut packer = manager.find_packer(0);
        for (id, ciphertext) in &blobs {
            _ = packer.add_raw(ciphertext, id, BlobType::Data).unwrap();
        }
        manager.save_packer(packer).unwrap();

        let pack_ids = manager.be.list(FileType::Pack).unwrap();
        assert_eq!(pack_ids.len(), 1);
        let pack_id = pack_ids[0];

        // the pack id is the hash of the whole byte stream
        let raw = manager.be.read_full(FileType::Pack, &pack_id).unwrap();
        assert_eq!(hash(&raw), pack_id);

        // the reader yields the entries in insertion order with cumulative offsets
        let header = PackHeader::from_file(
            &manager.be,
            pack_id,
            None,
            raw.len().try_into().unwrap(),
        )
        .unwrap();
        let entries = header.into_blobs();
        assert_eq!(entries.len(), blobs.len());

        let mut offset = 0;
        for (entry, (id, ciphertext)) in entries.iter().zip(&blobs) {
            assert_eq!(&entry.id, id);
            assert_eq!(entry.offset, offset);
            assert_eq!(entry.length as usize, ciphertext.len());
            offset += entry.length;

            // each blob decrypts to the original plaintext
            let data = manager
                .be
                .read_encrypted_partial(FileType::Pack, &pack_id, entry.offset, entry.length)
                .unwrap();
            assert_eq!(&hash(&data), id);
        }
    }

    #[test]
    fn save_packer_updates_master_index() {
        let manager = manager();
        let key = manager.be.key().clone();

        let data = key.encrypt_data(b"indexed blob").unwrap();
        let id = hash(b"indexed blob");

        let mut packer = manager.find_packer(data.len() as u32);
        _ = packer.add_raw(&data, &id, BlobType::Tree).unwrap();
        manager.save_packer(packer).unwrap();

        let entry = manager.index.lookup(&id).unwrap();
        assert_eq!(entry.tpe, BlobType::Tree);
        assert_eq!(entry.offset, 0);
        assert_eq!(entry.length as usize, data.len());
        assert!(manager.index.has(&id));
    }

    #[test]
    fn find_packer_reuses_open_packers_with_room() {
        let manager = manager();

        let mut packer = manager.find_packer(100);
        _ = packer
            .add_raw(&[0; 100], &Id::random(), BlobType::Data)
            .unwrap();
        manager.insert_packer(packer);
        assert_eq!(manager.open_packers(), 1);

        let packer = manager.find_packer(100);
        assert_eq!(packer.count(), 1);
        assert_eq!(manager.open_packers(), 0);
        manager.insert_packer(packer);
    }

    #[test]
    fn find_packer_respects_max_pack_size() {
        let be = DecryptBackend::new(&InMemoryBackend::new(), Key::new());
        let index = Arc::new(MasterIndex::new(IndexFullness::default()));
        let opts = PackerOptions::default()
            .min_pack_size(64_u32)
            .max_pack_size(256_u32);
        let manager = PackerManager::new(be, index, opts);

        let mut packer = manager.find_packer(200);
        _ = packer
            .add_raw(&[0; 200], &Id::random(), BlobType::Data)
            .unwrap();
        manager.insert_packer(packer);

        // 200 + 100 exceeds the hard maximum, so a fresh packer is handed out
        let packer = manager.find_packer(100);
        assert_eq!(packer.count(), 0);
        assert_eq!(manager.open_packers(), 1);
    }

    #[test]
    fn flush_saves_all_open_packers() {
        let manager = manager();
        let key = manager.be.key().clone();

        for data in [&b"one"[..], &b"two"[..]] {
            let ciphertext = key.encrypt_data(data).unwrap();
            let mut packer = RawPacker::new();
            _ = packer
                .add_raw(&ciphertext, &hash(data), BlobType::Data)
                .unwrap();
            manager.insert_packer(packer);
        }

        manager.flush().unwrap();
        assert_eq!(manager.open_packers(), 0);
        assert_eq!(manager.be.list(FileType::Pack).unwrap().len(), 2);
        assert!(manager.index.has(&hash(b"one")));
        assert!(manager.index.has(&hash(b"two")));
    }
}
