/*!
A library implementing the repository core of a deduplicated, encrypted,
content-addressed backup store.

# Overview

Content blobs handed to [`Repository::save_blob`] are deduplicated by their
SHA-256 hash, encrypted and batched into pack files; an encrypted index maps
every blob back to its pack. [`Checker`] validates that every blob referenced
by every snapshot tree is present, and [`prune`] rewrites packs to drop
blobs nothing references anymore.

The storage backend is abstract; [`InMemoryBackend`] is the bundled
reference implementation. Real backends (local filesystem, object stores)
live outside of this crate.

# Examples

```
use packden::{BlobType, InMemoryBackend, KeyOptions, NoProgress, Repository, RepositoryOptions};

let backend = InMemoryBackend::new();
let key_opts = KeyOptions::default().log_n(4_u8).r(2_u32).p(1_u32);
let repo = Repository::init(&backend, "password", &key_opts, RepositoryOptions::default())?;

let id = repo.save_blob(BlobType::Data, b"some content")?;
repo.flush()?;
repo.save_index()?;

assert_eq!(&repo.load_blob(BlobType::Data, &id)?[..], b"some content");
# Ok::<(), packden::PackdenError>(())
```
*/

#![forbid(unsafe_code)]
#![warn(
    // unreachable_pub, // frequently check
    // TODO: Activate and create better docs
    // missing_docs,
    rust_2018_idioms,
    trivial_casts,
    unused_lifetimes,
    unused_qualifications,
    clippy::nursery,
    bad_style,
    dead_code,
    improper_ctypes,
    missing_copy_implementations,
    missing_debug_implementations,
    non_shorthand_field_patterns,
    no_mangle_generic_items,
    overflowing_literals,
    path_statements,
    patterns_in_fns_without_body,
    trivial_numeric_casts,
    unused_results,
    unused_extern_crates,
    unused_import_braces,
    unconditional_recursion,
    unused,
    unused_allocation,
    unused_comparisons,
    unused_parens,
    while_true,
    clippy::cast_lossless,
    clippy::default_trait_access,
    clippy::doc_markdown,
    clippy::manual_string_new,
    clippy::match_same_arms,
    clippy::semicolon_if_nothing_returned,
    clippy::trivially_copy_pass_by_ref
)]
#![allow(clippy::module_name_repetitions, clippy::redundant_pub_crate)]

pub(crate) mod backend;
pub(crate) mod blob;
pub(crate) mod chunker;
pub(crate) mod commands;
pub(crate) mod crypto;
pub(crate) mod error;
pub(crate) mod id;
pub(crate) mod index;
pub(crate) mod progress;
pub(crate) mod repofile;
pub(crate) mod repository;

// packden Public API
pub use crate::{
    backend::{
        decrypt::{DecryptBackend, DecryptFullBackend, DecryptReadBackend, DecryptWriteBackend},
        memory::InMemoryBackend,
        FileType, ReadBackend, WriteBackend,
    },
    blob::{
        packer::{PackerManager, PackerOptions},
        tree::{Node, NodeType, Tree},
        BlobType, BlobTypeMap, ALL_BLOB_TYPES,
    },
    chunker::random_poly,
    commands::{
        check::{CheckIssue, Checker},
        prune::{find_blobs_for_packs, find_packs_for_blobs, prune, PruneStats},
    },
    crypto::{aespoly1305::Key, hasher::hash, CryptoKey},
    error::{PackdenError, PackdenErrorKind, PackdenResult},
    id::{HexId, Id},
    index::{master::MasterIndex, BlobIndex, IndexEntry, IndexFullness, ReadIndex},
    progress::{NoProgress, Progress},
    repofile::{
        configfile::ConfigFile,
        indexfile::{IndexBlob, IndexFile, IndexPack},
        keyfile::{KeyFile, KeyOptions},
        packfile::{HeaderEntry, PackHeader, PackHeaderLength, PackHeaderRef},
        snapshotfile::SnapshotFile,
        RepoFile,
    },
    repository::{Repository, RepositoryOptions},
};
