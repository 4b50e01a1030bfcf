//! Repacking packs with unreferenced blobs and rebuilding the index.

use std::{collections::HashSet, sync::Arc};

use crossbeam_channel::bounded;
use itertools::Itertools;
use log::{debug, info};

use crate::{
    backend::{decrypt::DecryptFullBackend, FileType},
    error::CommandErrorKind,
    id::Id,
    index::master::MasterIndex,
    progress::Progress,
    repository::Repository,
    PackdenResult,
};

/// Statistics of one prune run
#[derive(Debug, Default, Clone, Copy)]
pub struct PruneStats {
    /// Packs removed from the backend
    pub packs_removed: u64,
    /// Blobs dropped because nothing references them
    pub blobs_removed: u64,
    /// Blobs rewritten into fresh packs
    pub blobs_repacked: u64,
    /// Plaintext bytes rewritten into fresh packs
    pub bytes_repacked: u64,
    /// Index files replaced by the rebuilt index
    pub indexes_superseded: u64,
}

/// The set of packs containing at least one of the given blobs.
pub fn find_packs_for_blobs(
    index: &Arc<MasterIndex>,
    blobs: &HashSet<Id>,
) -> PackdenResult<HashSet<Id>> {
    let (done_tx, done_rx) = bounded(1);
    let mut packs = HashSet::new();
    for res in MasterIndex::stream_entries(index, done_rx).iter() {
        let (id, entry) = res?;
        if blobs.contains(&id) {
            _ = packs.insert(entry.pack);
        }
    }
    drop(done_tx);
    Ok(packs)
}

/// The union of all blob ids living in any of the given packs.
pub fn find_blobs_for_packs(
    index: &Arc<MasterIndex>,
    packs: &HashSet<Id>,
) -> PackdenResult<HashSet<Id>> {
    let (done_tx, done_rx) = bounded(1);
    let mut blobs = HashSet::new();
    for res in MasterIndex::stream_entries(index, done_rx).iter() {
        let (id, entry) = res?;
        if packs.contains(&entry.pack) {
            _ = blobs.insert(id);
        }
    }
    drop(done_tx);
    Ok(blobs)
}

/// Rewrite all packs containing unused blobs, keeping only the blobs still
/// referenced, then remove those packs and rebuild the index.
///
/// The kept blobs are persisted and indexed before any pack is removed, and
/// the rebuilt index is persisted before the superseded index files are
/// removed. A crash in between leaves duplicate storage but never a missing
/// reference; the repacker aborts on the first error.
pub fn prune<BE: DecryptFullBackend>(
    repo: &Repository<BE>,
    unused_blobs: &HashSet<Id>,
    p: &impl Progress,
) -> PackdenResult<PruneStats> {
    let mut stats = PruneStats::default();

    let repack_packs = find_packs_for_blobs(&repo.index, unused_blobs)?;
    if repack_packs.is_empty() {
        debug!("no packs contain unused blobs, nothing to prune");
        return Ok(stats);
    }

    let all_blobs = find_blobs_for_packs(&repo.index, &repack_packs)?;
    let keep: Vec<Id> = all_blobs
        .difference(unused_blobs)
        .copied()
        .sorted_unstable()
        .collect();
    stats.blobs_removed = (all_blobs.len() - keep.len()) as u64;
    info!(
        "repacking {} packs: keeping {} blobs, dropping {}",
        repack_packs.len(),
        keep.len(),
        stats.blobs_removed
    );

    // rewrite all kept blobs into fresh packs
    p.set_title("repacking blobs...");
    p.set_length(keep.len() as u64);
    for id in &keep {
        let entry = repo
            .index
            .lookup(id)
            .ok_or(CommandErrorKind::BlobsMissing(*id))?;
        let data = repo.load_blob(entry.tpe, id)?;
        repo.repack_blob(entry.tpe, &data, id)?;
        stats.blobs_repacked += 1;
        stats.bytes_repacked += data.len() as u64;
        p.inc(1);
    }
    repo.flush()?;
    // the new packs must be indexed before the old ones go away
    repo.save_index()?;

    // now the old packs can be removed
    for pack_id in &repack_packs {
        repo.be.remove(FileType::Pack, pack_id)?;
        stats.packs_removed += 1;
    }

    // rebuild the index without the removed packs and persist it
    let mut rebuilt = repo.index.rebuild_index(&repack_packs)?;
    let superseded = rebuilt.supersedes().to_vec();

    let mut data = Vec::new();
    rebuilt.finalize(&mut data)?;
    let rebuilt_id = repo.be.hash_write_full(FileType::Index, &data)?;
    rebuilt.set_id(rebuilt_id)?;
    repo.index.replace(rebuilt);

    for old in superseded {
        repo.be.remove(FileType::Index, &old)?;
        stats.indexes_superseded += 1;
    }

    p.finish();
    info!(
        "pruned {} packs, removed {} blobs, rewrote {} blobs",
        stats.packs_removed, stats.blobs_removed, stats.blobs_repacked
    );
    Ok(stats)
}
