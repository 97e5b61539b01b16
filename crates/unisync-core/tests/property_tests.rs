//! Property-based tests for replica merging
//!
//! Uses proptest to verify that replicas fed the same signed entries in any
//! order, and in any batching, end up with the same current state.

use proptest::prelude::*;
use tempfile::TempDir;
use unisync_core::replica::Replicas;
use unisync_core::{
    Author, BlobStore, Entry, Hash, NamespaceId, NamespaceOrigin, SignedEntry, Storage,
};

// ============================================================================
// Strategy Generators
// ============================================================================

/// One remote write: (author index, path index, timestamp, content byte, tombstone)
type Op = (usize, usize, u64, u8, bool);

const AUTHORS: usize = 3;
const PATHS: [&str; 4] = ["a.txt", "b.txt", "dir/c.txt", "dir/d.txt"];

fn op_strategy() -> impl Strategy<Value = Op> {
    (0..AUTHORS, 0..PATHS.len(), 0..20u64, any::<u8>(), prop::bool::weighted(0.2))
}

fn ops_strategy(max_ops: usize) -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(op_strategy(), 1..max_ops)
}

// ============================================================================
// Helpers
// ============================================================================

fn sign_ops(authors: &[Author], ns: NamespaceId, ops: &[Op]) -> Vec<SignedEntry> {
    ops.iter()
        .map(|&(author, path, ts, byte, tombstone)| {
            let author = &authors[author];
            let entry = if tombstone {
                Entry::tombstone(ns, PATHS[path], author.id(), ts)
            } else {
                let content = [byte; 3];
                Entry::new(ns, PATHS[path], author.id(), ts, Hash::new(content), content.len() as u64)
            };
            author.sign(entry).unwrap()
        })
        .collect()
}

/// Merge `batches` into a fresh replica and return its full state
async fn merged_state(ns: NamespaceId, batches: Vec<Vec<SignedEntry>>) -> Vec<Entry> {
    let temp = TempDir::new().unwrap();
    let storage = Storage::new(temp.path().join("test.redb")).unwrap();
    let blobs = BlobStore::memory();
    let replicas = Replicas::new(storage, blobs, Author::generate().unwrap());
    let (replica, _) = replicas.ensure(ns, NamespaceOrigin::Imported).unwrap();

    for batch in batches {
        replica.merge(batch).await.unwrap();
    }
    replica.list(true).unwrap()
}

/// Expected winner per path, computed directly from the merge order
fn expected_state(entries: &[SignedEntry]) -> Vec<Entry> {
    let mut winners: Vec<Entry> = Vec::new();
    for signed in entries {
        match winners.iter_mut().find(|e| e.path == signed.entry.path) {
            Some(current) if signed.entry.supersedes(current) => *current = signed.entry.clone(),
            Some(_) => {}
            None => winners.push(signed.entry.clone()),
        }
    }
    winners.sort_by(|a, b| a.path.cmp(&b.path));
    winners
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Merge order does not change the outcome
    #[test]
    fn merge_is_order_independent(
        ops in ops_strategy(24),
        seed in any::<u64>(),
    ) {
        let authors: Vec<Author> = (0..AUTHORS).map(|_| Author::generate().unwrap()).collect();
        let ns = NamespaceId::generate().unwrap();
        let entries = sign_ops(&authors, ns, &ops);

        let mut shuffled = entries.clone();
        let len = shuffled.len();
        shuffled.rotate_left((seed as usize) % len);
        if seed % 2 == 0 {
            shuffled.reverse();
        }

        let rt = runtime();
        let forward = rt.block_on(merged_state(ns, vec![entries.clone()]));
        let other = rt.block_on(merged_state(ns, vec![shuffled]));

        prop_assert_eq!(&forward, &other);
        prop_assert_eq!(forward, expected_state(&entries));
    }

    /// Splitting the entries into several merges gives the same result as one
    #[test]
    fn merge_batching_is_irrelevant(
        ops in ops_strategy(24),
        split in 0usize..24,
    ) {
        let authors: Vec<Author> = (0..AUTHORS).map(|_| Author::generate().unwrap()).collect();
        let ns = NamespaceId::generate().unwrap();
        let entries = sign_ops(&authors, ns, &ops);

        let split = split.min(entries.len());
        let (head, tail) = entries.split_at(split);

        let rt = runtime();
        let whole = rt.block_on(merged_state(ns, vec![entries.clone()]));
        let batched = rt.block_on(merged_state(ns, vec![tail.to_vec(), head.to_vec()]));
        let one_by_one = rt.block_on(merged_state(
            ns,
            entries.iter().cloned().map(|e| vec![e]).collect(),
        ));

        prop_assert_eq!(&whole, &batched);
        prop_assert_eq!(&whole, &one_by_one);
    }

    /// Content hashes depend on bytes only
    #[test]
    fn hash_is_deterministic(data in prop::collection::vec(any::<u8>(), 0..4096)) {
        prop_assert_eq!(Hash::new(&data), Hash::new(data.clone()));
        prop_assert_eq!(Hash::new(&data).to_hex().parse::<Hash>().unwrap(), Hash::new(&data));
    }
}
