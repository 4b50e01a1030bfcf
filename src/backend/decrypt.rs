use std::thread;

use bytes::Bytes;
use crossbeam_channel::{bounded, select, Receiver};

use crate::{
    backend::{FileType, ReadBackend, WriteBackend},
    crypto::{hasher::hash, CryptoKey},
    error::{BackendErrorKind, CryptBackendErrorKind},
    id::Id,
    repofile::RepoFile,
    PackdenResult,
};

pub(super) mod constants {
    /// The number of workers fetching and decrypting files in parallel
    pub(super) const MAX_STREAM_WORKERS: usize = 20;
    /// Bound of the work and output queues; producers block when it is reached
    pub(super) const STREAM_QUEUE_LEN: usize = 20;
}

/// A backend that can both decrypt reads and encrypt writes.
pub trait DecryptFullBackend: DecryptWriteBackend + DecryptReadBackend {}
impl<T: DecryptWriteBackend + DecryptReadBackend> DecryptFullBackend for T {}

/// Read access to an encrypted backend.
pub trait DecryptReadBackend: ReadBackend {
    /// Decrypts the given ciphertext.
    fn decrypt(&self, data: &[u8]) -> PackdenResult<Vec<u8>>;

    /// Reads and decrypts the complete given file.
    fn read_encrypted_full(&self, tpe: FileType, id: &Id) -> PackdenResult<Bytes>;

    /// Reads and decrypts a single encrypted region of the given file.
    fn read_encrypted_partial(
        &self,
        tpe: FileType,
        id: &Id,
        offset: u32,
        length: u32,
    ) -> PackdenResult<Bytes> {
        let data = self.decrypt(&self.read_partial(tpe, id, offset, length)?)?;
        Ok(data.into())
    }

    /// Reads, decrypts and deserializes the given repository file.
    fn get_file<F: RepoFile>(&self, id: &Id) -> PackdenResult<F> {
        let data = self.read_encrypted_full(F::TYPE, id)?;
        F::from_slice(&data)
    }

    /// Streams all repository files of type `F`, fetched by a bounded worker
    /// pool.
    ///
    /// Results arrive in arbitrary order. The output channel is bounded, so
    /// workers block until the consumer accepts results (back-pressure).
    /// Closing or dropping the `done` channel stops all workers; a consumer
    /// that hits an error should drop its `done` sender and stop draining.
    /// A stream interrupted before its natural end emits
    /// [`BackendErrorKind::Cancelled`], so a cancelled drain never looks
    /// like a completed one.
    ///
    /// [`BackendErrorKind::Cancelled`]: crate::error::BackendErrorKind::Cancelled
    fn stream_all<F: RepoFile>(
        &self,
        done: Receiver<()>,
    ) -> PackdenResult<Receiver<PackdenResult<(Id, F)>>> {
        let list = self.list(F::TYPE)?;
        self.stream_list(list, done)
    }

    /// Streams the given repository files of type `F`, see [`stream_all`].
    ///
    /// [`stream_all`]: DecryptReadBackend::stream_all
    fn stream_list<F: RepoFile>(
        &self,
        list: Vec<Id>,
        done: Receiver<()>,
    ) -> PackdenResult<Receiver<PackdenResult<(Id, F)>>> {
        let (work_tx, work_rx) = bounded::<Id>(constants::STREAM_QUEUE_LEN);
        let (out_tx, out_rx) = bounded::<PackdenResult<(Id, F)>>(constants::STREAM_QUEUE_LEN);

        for _ in 0..constants::MAX_STREAM_WORKERS {
            let be = self.clone();
            let work_rx = work_rx.clone();
            let out_tx = out_tx.clone();
            let done = done.clone();
            let _ = thread::spawn(move || loop {
                select! {
                    recv(done) -> _ => {
                        let _ = out_tx.send(Err(BackendErrorKind::Cancelled.into()));
                        break;
                    }
                    recv(work_rx) -> msg => match msg {
                        Ok(id) => {
                            let res = be.get_file::<F>(&id).map(|file| (id, file));
                            let failed = res.is_err();
                            if out_tx.send(res).is_err() || failed {
                                break;
                            }
                        }
                        Err(_) => break,
                    },
                }
            });
        }

        let _ = thread::spawn(move || {
            let mut ids = list.into_iter();
            let cancelled = loop {
                let Some(id) = ids.next() else { break false };
                select! {
                    recv(done) -> _ => break true,
                    send(work_tx, id) -> res => {
                        if res.is_err() {
                            break false;
                        }
                    }
                }
            };
            // not all files were dispatched; tell the consumer
            if cancelled {
                let _ = out_tx.send(Err(BackendErrorKind::Cancelled.into()));
            }
        });

        Ok(out_rx)
    }
}

/// Write access to an encrypted backend.
pub trait DecryptWriteBackend: WriteBackend {
    /// The type of the key used for encryption.
    type Key: CryptoKey;

    /// The key used for encryption.
    fn key(&self) -> &Self::Key;

    /// Encrypts the given data, writes it under the hash of the ciphertext
    /// and returns that hash.
    fn hash_write_full(&self, tpe: FileType, data: &[u8]) -> PackdenResult<Id>;

    /// Serializes, encrypts and writes the given repository file.
    fn save_file<F: RepoFile>(&self, file: &F) -> PackdenResult<Id> {
        let data = serde_json::to_vec(file)
            .map_err(CryptBackendErrorKind::SerializingToJsonByteVectorFailed)?;
        self.hash_write_full(F::TYPE, &data)
    }
}

/// A backend combining a raw backend with a [`CryptoKey`].
#[derive(Clone, Debug)]
pub struct DecryptBackend<R, C> {
    /// The raw backend
    backend: R,
    /// The key
    key: C,
}

impl<R: ReadBackend, C: CryptoKey> DecryptBackend<R, C> {
    /// Creates a new decrypting backend wrapping the given backend.
    pub fn new(be: &R, key: C) -> Self {
        Self {
            backend: be.clone(),
            key,
        }
    }
}

impl<R: WriteBackend, C: CryptoKey> DecryptWriteBackend for DecryptBackend<R, C> {
    type Key = C;

    fn key(&self) -> &Self::Key {
        &self.key
    }

    fn hash_write_full(&self, tpe: FileType, data: &[u8]) -> PackdenResult<Id> {
        let data = self.key().encrypt_data(data)?;
        let id = hash(&data);
        self.write_bytes(tpe, &id, data.into())?;
        Ok(id)
    }
}

impl<R: ReadBackend, C: CryptoKey> DecryptReadBackend for DecryptBackend<R, C> {
    fn decrypt(&self, data: &[u8]) -> PackdenResult<Vec<u8>> {
        self.key.decrypt_data(data)
    }

    fn read_encrypted_full(&self, tpe: FileType, id: &Id) -> PackdenResult<Bytes> {
        Ok(self.decrypt(&self.read_full(tpe, id)?)?.into())
    }
}

impl<R: ReadBackend, C: CryptoKey> ReadBackend for DecryptBackend<R, C> {
    fn location(&self) -> String {
        self.backend.location()
    }

    fn list_with_size(&self, tpe: FileType) -> PackdenResult<Vec<(Id, u32)>> {
        self.backend.list_with_size(tpe)
    }

    fn test(&self, tpe: FileType, id: &Id) -> PackdenResult<bool> {
        self.backend.test(tpe, id)
    }

    fn read_full(&self, tpe: FileType, id: &Id) -> PackdenResult<Bytes> {
        self.backend.read_full(tpe, id)
    }

    fn read_partial(
        &self,
        tpe: FileType,
        id: &Id,
        offset: u32,
        length: u32,
    ) -> PackdenResult<Bytes> {
        self.backend.read_partial(tpe, id, offset, length)
    }
}

impl<R: WriteBackend, C: CryptoKey> WriteBackend for DecryptBackend<R, C> {
    fn create(&self) -> PackdenResult<()> {
        self.backend.create()
    }

    fn write_bytes(&self, tpe: FileType, id: &Id, buf: Bytes) -> PackdenResult<()> {
        self.backend.write_bytes(tpe, id, buf)
    }

    fn remove(&self, tpe: FileType, id: &Id) -> PackdenResult<()> {
        self.backend.remove(tpe, id)
    }
}

#[cfg(test)]
mod tests {
    use crossbeam_channel::bounded;

    use super::*;
    use crate::{
        backend::memory::InMemoryBackend,
        crypto::aespoly1305::Key,
        repofile::{ConfigFile, SnapshotFile},
    };

    fn backend() -> DecryptBackend<InMemoryBackend, Key> {
        DecryptBackend::new(&InMemoryBackend::new(), Key::new())
    }

    #[test]
    fn encrypted_write_read_roundtrip() {
        let be = backend();
        let id = be.hash_write_full(FileType::Pack, b"plaintext").unwrap();

        // stored bytes are not the plaintext
        assert_ne!(&be.read_full(FileType::Pack, &id).unwrap()[..], b"plaintext");
        assert_eq!(
            &be.read_encrypted_full(FileType::Pack, &id).unwrap()[..],
            b"plaintext"
        );
    }

    #[test]
    fn save_and_get_file() {
        let be = backend();
        let config = ConfigFile::new(1, Id::random(), 0x3abc_9bff_07d9_e5);
        let id = be.save_file(&config).unwrap();

        let read: ConfigFile = be.get_file(&id).unwrap();
        assert_eq!(read, config);
    }

    #[test]
    fn stream_all_yields_all_files() {
        let be = backend();
        let mut ids: Vec<Id> = (0..30)
            .map(|_| be.save_file(&SnapshotFile::new(Id::random())).unwrap())
            .collect();

        let (_done_tx, done_rx) = bounded(1);
        let rx = be.stream_all::<SnapshotFile>(done_rx).unwrap();
        let mut streamed: Vec<Id> = rx.iter().map(|res| res.unwrap().0).collect();

        ids.sort_unstable();
        streamed.sort_unstable();
        assert_eq!(ids, streamed);
    }

    #[test]
    fn stream_all_reports_cancellation() {
        let be = backend();
        for _ in 0..200 {
            _ = be.save_file(&SnapshotFile::new(Id::random())).unwrap();
        }

        let (done_tx, done_rx) = bounded(1);
        let rx = be.stream_all::<SnapshotFile>(done_rx).unwrap();
        // consume one element, then cancel
        assert!(rx.iter().next().unwrap().is_ok());
        drop(done_tx);

        // draining whatever is still buffered must terminate, and the
        // interruption must be visible as a Cancelled error
        let rest: Vec<_> = rx.iter().collect();
        assert!(rest
            .iter()
            .any(|res| matches!(res, Err(err) if err.is_cancelled())));
    }
}
