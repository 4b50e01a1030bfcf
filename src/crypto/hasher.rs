use sha2::{Digest, Sha256};

use crate::id::Id;

/// Hashes the given data.
///
/// # Arguments
///
/// * `data` - The data to hash
///
/// # Returns
///
/// The SHA-256 hash of the data as an [`Id`]
#[must_use]
pub fn hash(data: &[u8]) -> Id {
    Id::new(Sha256::digest(data).into())
}

/// A streaming SHA-256 hasher.
///
/// Used where the hashed data is produced piecewise, e.g. the running id of
/// a pack file being written.
#[derive(Debug, Default)]
pub struct Hasher(Sha256);

impl Hasher {
    /// Create a new [`Hasher`].
    #[must_use]
    pub fn new() -> Self {
        Self(Sha256::new())
    }

    /// Reset the hasher to its initial state.
    pub fn reset(&mut self) {
        self.0.reset();
    }

    /// Feed data into the hasher.
    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    /// Finalize and return the hash; the hasher is reset.
    pub fn finalize(&mut self) -> Id {
        Id::new(self.0.finalize_reset().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_hash_matches_oneshot() {
        let mut hasher = Hasher::new();
        hasher.update(b"foo");
        hasher.update(b"bar");
        assert_eq!(hasher.finalize(), hash(b"foobar"));
    }

    #[test]
    fn finalize_resets() {
        let mut hasher = Hasher::new();
        hasher.update(b"foo");
        let _ = hasher.finalize();
        hasher.update(b"bar");
        assert_eq!(hasher.finalize(), hash(b"bar"));
    }
}
