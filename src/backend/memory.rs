use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
};

use bytes::Bytes;
use log::trace;

use crate::{
    backend::{FileType, ReadBackend, WriteBackend},
    error::BackendErrorKind,
    id::Id,
    PackdenResult,
};

/// A backend keeping all files in memory.
///
/// This is the reference implementation of the backend contract and the
/// backend used by the test suite. All clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend(Arc<RwLock<BTreeMap<(FileType, Id), Bytes>>>);

impl InMemoryBackend {
    /// Create a new, empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReadBackend for InMemoryBackend {
    fn location(&self) -> String {
        "memory".to_string()
    }

    fn list_with_size(&self, tpe: FileType) -> PackdenResult<Vec<(Id, u32)>> {
        Ok(self
            .0
            .read()
            .unwrap()
            .iter()
            .filter(|((t, _), _)| *t == tpe)
            .map(|((_, id), data)| (*id, data.len().try_into().unwrap_or(u32::MAX)))
            .collect())
    }

    fn test(&self, tpe: FileType, id: &Id) -> PackdenResult<bool> {
        Ok(self.0.read().unwrap().contains_key(&(tpe, *id)))
    }

    fn read_full(&self, tpe: FileType, id: &Id) -> PackdenResult<Bytes> {
        self.0
            .read()
            .unwrap()
            .get(&(tpe, *id))
            .cloned()
            .ok_or_else(|| BackendErrorKind::FileNotFound { tpe, id: *id }.into())
    }

    fn read_partial(
        &self,
        tpe: FileType,
        id: &Id,
        offset: u32,
        length: u32,
    ) -> PackdenResult<Bytes> {
        let guard = self.0.read().unwrap();
        let data = guard
            .get(&(tpe, *id))
            .ok_or(BackendErrorKind::FileNotFound { tpe, id: *id })?;

        let size = data.len().try_into().unwrap_or(u32::MAX);
        if offset.checked_add(length).map_or(true, |end| end > size) {
            return Err(BackendErrorKind::PartialReadOutOfBounds {
                tpe,
                id: *id,
                offset,
                length,
                size,
            }
            .into());
        }

        Ok(data.slice(offset as usize..(offset + length) as usize))
    }
}

impl WriteBackend for InMemoryBackend {
    fn create(&self) -> PackdenResult<()> {
        Ok(())
    }

    fn write_bytes(&self, tpe: FileType, id: &Id, buf: Bytes) -> PackdenResult<()> {
        trace!("writing {tpe:?} {id}, length {}", buf.len());
        _ = self.0.write().unwrap().insert((tpe, *id), buf);
        Ok(())
    }

    fn remove(&self, tpe: FileType, id: &Id) -> PackdenResult<()> {
        trace!("removing {tpe:?} {id}");
        self.0
            .write()
            .unwrap()
            .remove(&(tpe, *id))
            .map(|_| ())
            .ok_or_else(|| BackendErrorKind::FileNotFound { tpe, id: *id }.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_roundtrip() {
        let be = InMemoryBackend::new();
        let id = Id::random();
        be.write_bytes(FileType::Pack, &id, Bytes::from_static(b"some bytes"))
            .unwrap();

        assert_eq!(&be.read_full(FileType::Pack, &id).unwrap()[..], b"some bytes");
        assert!(be.test(FileType::Pack, &id).unwrap());
        assert!(!be.test(FileType::Index, &id).unwrap());
    }

    #[test]
    fn clones_share_storage() {
        let be = InMemoryBackend::new();
        let clone = be.clone();
        let id = Id::random();
        be.write_bytes(FileType::Snapshot, &id, Bytes::from_static(b"x"))
            .unwrap();
        assert!(clone.test(FileType::Snapshot, &id).unwrap());
    }

    #[test]
    fn read_partial_checks_bounds() {
        let be = InMemoryBackend::new();
        let id = Id::random();
        be.write_bytes(FileType::Pack, &id, Bytes::from_static(b"0123456789"))
            .unwrap();

        assert_eq!(&be.read_partial(FileType::Pack, &id, 2, 3).unwrap()[..], b"234");
        assert!(be.read_partial(FileType::Pack, &id, 8, 3).is_err());
    }

    #[test]
    fn remove_missing_fails() {
        let be = InMemoryBackend::new();
        assert!(be.remove(FileType::Pack, &Id::random()).is_err());
    }

    #[test]
    fn list_filters_by_type() {
        let be = InMemoryBackend::new();
        let id1 = Id::random();
        let id2 = Id::random();
        be.write_bytes(FileType::Pack, &id1, Bytes::from_static(b"abc"))
            .unwrap();
        be.write_bytes(FileType::Index, &id2, Bytes::from_static(b"defg"))
            .unwrap();

        assert_eq!(be.list(FileType::Pack).unwrap(), vec![id1]);
        assert_eq!(
            be.list_with_size(FileType::Index).unwrap(),
            vec![(id2, 4)]
        );
    }
}
