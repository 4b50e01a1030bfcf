use binrw::{io::Cursor, BinRead, BinWrite};
use log::trace;

use crate::{
    backend::{decrypt::DecryptReadBackend, FileType},
    blob::BlobType,
    crypto::aespoly1305,
    error::PackFileErrorKind,
    id::Id,
    repofile::indexfile::{IndexBlob, IndexPack},
    PackdenResult,
};

pub(crate) mod constants {
    /// The length of the pack header length field at the end of the pack
    pub(crate) const LENGTH_LEN: u32 = 4;
    /// The crypto overhead of the encrypted pack header
    pub(crate) const HEADER_CRYPTO_OVERHEAD: u32 = super::aespoly1305::constants::OVERHEAD as u32;
}

#[derive(BinWrite, BinRead, Debug, Clone, Copy)]
#[brw(little)]
/// The length of the encrypted pack header, stored as the last 4 bytes of
/// every pack file.
pub struct PackHeaderLength(u32);

impl PackHeaderLength {
    /// Create a new [`PackHeaderLength`]
    #[must_use]
    pub fn from_u32(len: u32) -> Self {
        Self(len)
    }

    /// Get the length
    #[must_use]
    pub fn to_u32(&self) -> u32 {
        self.0
    }

    /// Read pack header length from binary representation
    ///
    /// # Arguments
    ///
    /// * `data` - The 4 trailing bytes of a pack file
    pub fn from_binary(data: &[u8]) -> PackdenResult<Self> {
        let mut reader = Cursor::new(data);
        Ok(Self::read(&mut reader).map_err(PackFileErrorKind::ReadingBinaryRepresentationFailed)?)
    }

    /// Generate the binary representation of the pack header length
    pub fn to_binary(&self) -> PackdenResult<Vec<u8>> {
        let mut writer = Cursor::new(Vec::with_capacity(constants::LENGTH_LEN as usize));
        self.write(&mut writer)
            .map_err(PackFileErrorKind::WritingBinaryRepresentationFailed)?;
        Ok(writer.into_inner())
    }
}

#[derive(BinRead, BinWrite, Debug, Clone, Copy, PartialEq, Eq)]
#[brw(little)]
/// A pack header entry: fixed-width description of one contained blob.
pub enum HeaderEntry {
    #[brw(magic(0u8))]
    /// Entry of a data blob
    Data {
        /// Lengths of the blob (encrypted blob length)
        len: u32,
        /// Id of the blob
        id: Id,
    },

    #[brw(magic(1u8))]
    /// Entry of a tree blob
    Tree {
        /// Lengths of the blob (encrypted blob length)
        len: u32,
        /// Id of the blob
        id: Id,
    },
}

impl HeaderEntry {
    /// The length of a header entry: 1 type byte + 4 length bytes + 32 id bytes
    pub(crate) const ENTRY_LEN: u32 = 37;

    /// Convert from an [`IndexBlob`]
    const fn from_blob(blob: &IndexBlob) -> Self {
        match blob.tpe {
            BlobType::Data => Self::Data {
                len: blob.length,
                id: blob.id,
            },
            BlobType::Tree => Self::Tree {
                len: blob.length,
                id: blob.id,
            },
        }
    }

    /// Convert into an [`IndexBlob`] at the given offset
    const fn into_blob(self, offset: u32) -> IndexBlob {
        match self {
            Self::Data { len, id } => IndexBlob {
                id,
                length: len,
                tpe: BlobType::Data,
                offset,
            },
            Self::Tree { len, id } => IndexBlob {
                id,
                length: len,
                tpe: BlobType::Tree,
                offset,
            },
        }
    }
}

/// The parsed header of a pack file: the list of contained blobs with their
/// offsets reconstructed by a cumulative sum of the entry lengths.
#[derive(Debug)]
pub struct PackHeader(Vec<IndexBlob>);

impl PackHeader {
    /// Read the binary representation of the pack header
    ///
    /// # Arguments
    ///
    /// * `pack` - The decrypted pack header
    pub fn from_binary(pack: &[u8]) -> PackdenResult<Self> {
        let mut reader = Cursor::new(pack);
        let mut offset = 0;
        let mut blobs = Vec::new();
        loop {
            let blob = match HeaderEntry::read(&mut reader) {
                Ok(entry) => entry.into_blob(offset),
                Err(err) if err.is_eof() => break,
                Err(err) => {
                    return Err(PackFileErrorKind::ReadingBinaryRepresentationFailed(err).into())
                }
            };
            offset += blob.length;
            blobs.push(blob);
        }
        Ok(Self(blobs))
    }

    /// Read the pack header directly from a pack file using the backend
    ///
    /// # Arguments
    ///
    /// * `be` - The backend to read from
    /// * `id` - The pack id
    /// * `size_hint` - The expected header size, if known (e.g. from the index)
    /// * `pack_size` - The total size of the pack file
    pub fn from_file(
        be: &impl DecryptReadBackend,
        id: Id,
        size_hint: Option<u32>,
        pack_size: u32,
    ) -> PackdenResult<Self> {
        if pack_size < constants::LENGTH_LEN + constants::HEADER_CRYPTO_OVERHEAD {
            return Err(PackFileErrorKind::PackFileTooShort(pack_size).into());
        }

        // guess the header size from size_hint and pack_size
        // If the guess is too small, we have to re-read. If the guess is too large,
        // we have read too much, but this should normally not matter too much.
        // So we try to overguess here...
        let size_guess = size_hint
            .unwrap_or(0)
            .min(pack_size.saturating_sub(constants::LENGTH_LEN));

        // read (guessed) header + length field
        let read_size = size_guess + constants::LENGTH_LEN;
        let offset = pack_size - read_size;
        let mut data = be
            .read_partial(FileType::Pack, &id, offset, read_size)?
            .to_vec();

        // get header length from the file
        let size_real =
            PackHeaderLength::from_binary(&data.split_off(size_guess as usize))?.to_u32();
        trace!("header size: {size_real}");

        if size_real.saturating_add(constants::LENGTH_LEN) > pack_size {
            return Err(PackFileErrorKind::HeaderLengthTooLarge {
                size_real,
                pack_size,
            }
            .into());
        }

        // now read the header
        let data = if size_real <= size_guess {
            // header was already read
            data.split_off((size_guess - size_real) as usize)
        } else {
            // size_guess was too small; we have to read again
            let offset = pack_size - size_real - constants::LENGTH_LEN;
            be.read_partial(FileType::Pack, &id, offset, size_real)?
                .to_vec()
        };

        let header = Self::from_binary(&be.decrypt(&data)?)?;

        if header.0.is_empty() {
            return Err(PackFileErrorKind::PackHeaderHasNoEntries.into());
        }

        if header.size() != size_real {
            return Err(PackFileErrorKind::HeaderLengthDoesNotMatchHeaderContents {
                size_real,
                size_computed: header.size(),
            }
            .into());
        }

        if header.pack_size() != pack_size {
            return Err(PackFileErrorKind::HeaderPackSizeDoesNotMatchRealPackFile {
                size_real: pack_size,
                size_computed: header.pack_size(),
            }
            .into());
        }

        Ok(header)
    }

    /// Extract the contained blobs
    #[must_use]
    pub fn into_blobs(self) -> Vec<IndexBlob> {
        self.0
    }

    /// Calculate the pack header size from the contained blobs
    #[must_use]
    pub fn size(&self) -> u32 {
        PackHeaderRef(&self.0).size()
    }

    /// Calculate the pack size from the contained blobs
    #[must_use]
    pub fn pack_size(&self) -> u32 {
        PackHeaderRef(&self.0).pack_size()
    }
}

/// A borrowed view on the blobs of an [`IndexPack`], for computing and
/// writing the pack header.
#[derive(Debug, Clone, Copy)]
pub struct PackHeaderRef<'a>(&'a [IndexBlob]);

impl<'a> PackHeaderRef<'a> {
    /// Create a [`PackHeaderRef`] from the given [`IndexPack`]
    #[must_use]
    pub fn from_index_pack(pack: &'a IndexPack) -> Self {
        Self(&pack.blobs)
    }

    /// Calculate the pack header size (encrypted header length) from the
    /// contained blobs
    #[must_use]
    pub fn size(&self) -> u32 {
        constants::HEADER_CRYPTO_OVERHEAD + self.0.len() as u32 * HeaderEntry::ENTRY_LEN
    }

    /// Calculate the pack size from the contained blobs
    #[must_use]
    pub fn pack_size(&self) -> u32 {
        self.0.iter().fold(
            constants::HEADER_CRYPTO_OVERHEAD + constants::LENGTH_LEN,
            |acc, blob| acc + blob.length + HeaderEntry::ENTRY_LEN,
        )
    }

    /// Generate the binary representation of the pack header
    pub fn to_binary(&self) -> PackdenResult<Vec<u8>> {
        let mut writer = Cursor::new(Vec::with_capacity(self.size() as usize));
        // collect header entries
        for blob in self.0 {
            HeaderEntry::from_blob(blob)
                .write(&mut writer)
                .map_err(PackFileErrorKind::WritingBinaryRepresentationFailed)?;
        }
        Ok(writer.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(tpe: BlobType, offset: u32, length: u32) -> IndexBlob {
        IndexBlob {
            id: Id::random(),
            tpe,
            offset,
            length,
        }
    }

    #[test]
    fn header_length_binary_is_little_endian() {
        let data = PackHeaderLength::from_u32(0x0102_0304).to_binary().unwrap();
        assert_eq!(data, vec![0x04, 0x03, 0x02, 0x01]);
        assert_eq!(
            PackHeaderLength::from_binary(&data).unwrap().to_u32(),
            0x0102_0304
        );
    }

    #[test]
    fn header_entries_roundtrip_in_order() {
        let blobs = vec![
            blob(BlobType::Data, 0, 25),
            blob(BlobType::Tree, 25, 100),
            blob(BlobType::Data, 125, 123),
        ];
        let binary = PackHeaderRef(&blobs).to_binary().unwrap();
        assert_eq!(binary.len() as u32, 3 * HeaderEntry::ENTRY_LEN);

        let parsed = PackHeader::from_binary(&binary).unwrap().into_blobs();
        assert_eq!(parsed, blobs);
    }

    #[test]
    fn parsed_offsets_are_cumulative_sums() {
        let blobs = vec![
            blob(BlobType::Data, 0, 42),
            blob(BlobType::Data, 999, 10), // bogus offset is not serialized
        ];
        let binary = PackHeaderRef(&blobs).to_binary().unwrap();
        let parsed = PackHeader::from_binary(&binary).unwrap().into_blobs();
        assert_eq!(parsed[0].offset, 0);
        assert_eq!(parsed[1].offset, 42);
    }

    #[test]
    fn truncated_header_fails() {
        let blobs = vec![blob(BlobType::Tree, 0, 1)];
        let mut binary = PackHeaderRef(&blobs).to_binary().unwrap();
        _ = binary.pop();
        assert!(PackHeader::from_binary(&binary).is_err());
    }

    #[test]
    fn pack_size_accounts_for_header_and_length_field() {
        let blobs = vec![blob(BlobType::Data, 0, 100), blob(BlobType::Data, 100, 50)];
        let header = PackHeaderRef(&blobs);
        assert_eq!(
            header.size(),
            constants::HEADER_CRYPTO_OVERHEAD + 2 * HeaderEntry::ENTRY_LEN
        );
        assert_eq!(
            header.pack_size(),
            150 + header.size() + constants::LENGTH_LEN
        );
    }
}
