use serde::{Deserialize, Serialize};

use crate::{
    backend::FileType, error::ConfigFileErrorKind, id::Id, repofile::RepoFile, PackdenResult,
};

#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
/// The config file describes all repository-wide information.
///
/// It is usually saved in the repository as `config`
pub struct ConfigFile {
    /// Repository version. Currently only 1 is supported
    pub version: u32,

    /// The [`Id`] identifying the repository. This is not the hash of
    /// anything but chosen randomly at `init`
    pub id: Id,

    /// The polynomial the chunker uses to split data
    pub chunker_polynomial: u64,
}

impl RepoFile for ConfigFile {
    const TYPE: FileType = FileType::Config;
}

impl ConfigFile {
    /// Creates a new config file
    ///
    /// # Arguments
    ///
    /// * `version` - The repository version
    /// * `id` - The repository id
    /// * `poly` - The chunker polynomial
    #[must_use]
    pub fn new(version: u32, id: Id, poly: u64) -> Self {
        Self {
            version,
            id,
            chunker_polynomial: poly,
        }
    }

    /// Checks that the repository version is one this implementation handles
    ///
    /// # Errors
    ///
    /// * [`ConfigFileErrorKind::ConfigVersionNotSupported`] - If the version is not supported
    ///
    /// [`ConfigFileErrorKind::ConfigVersionNotSupported`]: crate::error::ConfigFileErrorKind::ConfigVersionNotSupported
    pub fn validate(&self) -> PackdenResult<()> {
        if self.version != 1 {
            return Err(ConfigFileErrorKind::ConfigVersionNotSupported(self.version).into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_polynomial_as_integer() {
        let config = ConfigFile::new(1, Id::default(), 0x3abc_9bff_07d9_e5);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains(&format!("\"chunker_polynomial\":{}", 0x3abc_9bff_07d9_e5_u64)));
    }

    #[test]
    fn validate_rejects_unknown_version() {
        let config = ConfigFile::new(2, Id::default(), 0);
        assert!(config.validate().is_err());
        assert!(ConfigFile::new(1, Id::default(), 0).validate().is_ok());
    }
}
