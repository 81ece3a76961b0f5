//! Key hashing and partition assignment.
//!
//! A routing key is hashed to a partition index modulo the cluster-wide
//! partition count; each node owns a subset of the partitions. The hash
//! must be stable and deterministic across processes and builds, which
//! rules out the standard library's randomized hasher; the built-in
//! implementation is FNV-1a.

use std::collections::HashSet;
use std::sync::Arc;

/// Stable key-to-u64 hash used for partitioning.
pub trait Hasher: Send + Sync {
  /// Hashes a routing key. Deterministic: the same key always maps to the
  /// same value, on every node.
  fn hash(&self, key: &str) -> u64;

  /// Maps a key to a partition index in `0..partition_count`.
  fn partition(&self, key: &str, partition_count: u32) -> u32 {
    if partition_count == 0 {
      return 0;
    }
    (self.hash(key) % u64::from(partition_count)) as u32
  }
}

/// FNV-1a 64-bit hasher.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fnv1aHasher;

impl Fnv1aHasher {
  const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
  const PRIME: u64 = 0x0000_0100_0000_01b3;

  /// Creates a new hasher.
  #[must_use]
  pub fn new() -> Self {
    Self
  }
}

impl Hasher for Fnv1aHasher {
  fn hash(&self, key: &str) -> u64 {
    let mut state = Self::OFFSET_BASIS;
    for byte in key.as_bytes() {
      state ^= u64::from(*byte);
      state = state.wrapping_mul(Self::PRIME);
    }
    state
  }
}

/// Partition layout of the cluster as seen from this node: which
/// partitions exist and which of them are local. Polled when a stream is
/// constructed and on topology change.
pub trait Topology: Send + Sync {
  /// Total number of partitions in the cluster.
  fn partition_count(&self) -> u32;

  /// Partitions owned by this node.
  fn local_partitions(&self) -> HashSet<u32>;

  /// Whether `partition` is owned by this node.
  fn is_local(&self, partition: u32) -> bool {
    self.local_partitions().contains(&partition)
  }
}

/// Fixed partition assignment, configured up front.
#[derive(Debug, Clone)]
pub struct StaticTopology {
  partition_count: u32,
  local: HashSet<u32>,
}

impl StaticTopology {
  /// Creates a topology with `partition_count` partitions, of which
  /// `local` are owned by this node.
  pub fn new(partition_count: u32, local: impl IntoIterator<Item = u32>) -> Self {
    Self {
      partition_count,
      local: local.into_iter().collect(),
    }
  }

  /// Single-node layout: every partition is local.
  #[must_use]
  pub fn single_node(partition_count: u32) -> Self {
    Self::new(partition_count, 0..partition_count)
  }
}

impl Default for StaticTopology {
  fn default() -> Self {
    Self::single_node(1)
  }
}

impl Topology for StaticTopology {
  fn partition_count(&self) -> u32 {
    self.partition_count
  }

  fn local_partitions(&self) -> HashSet<u32> {
    self.local.clone()
  }

  fn is_local(&self, partition: u32) -> bool {
    self.local.contains(&partition)
  }
}

/// Hasher + topology bundle handed to streams.
#[derive(Clone)]
pub struct Partitioning {
  pub hasher: Arc<dyn Hasher>,
  pub topology: Arc<dyn Topology>,
}

impl Partitioning {
  /// Creates a partitioning scheme from a hasher and a topology.
  pub fn new(hasher: Arc<dyn Hasher>, topology: Arc<dyn Topology>) -> Self {
    Self { hasher, topology }
  }

  /// Single-node default: one partition, FNV-1a.
  #[must_use]
  pub fn local() -> Self {
    Self {
      hasher: Arc::new(Fnv1aHasher::new()),
      topology: Arc::new(StaticTopology::default()),
    }
  }

  /// Maps a key to its partition.
  pub fn partition_for(&self, key: &str) -> u32 {
    self
      .hasher
      .partition(key, self.topology.partition_count())
  }
}

impl std::fmt::Debug for Partitioning {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Partitioning")
      .field("partition_count", &self.topology.partition_count())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_fnv1a_is_deterministic() {
    let hasher = Fnv1aHasher::new();
    assert_eq!(hasher.hash("alpha"), hasher.hash("alpha"));
    assert_ne!(hasher.hash("alpha"), hasher.hash("beta"));
    // Known FNV-1a 64 vector.
    assert_eq!(hasher.hash(""), 0xcbf2_9ce4_8422_2325);
  }

  #[test]
  fn test_partition_is_in_range() {
    let hasher = Fnv1aHasher::new();
    for key in ["a", "b", "some-longer-key", ""] {
      assert!(hasher.partition(key, 5) < 5);
    }
    // Same key, same partition.
    assert_eq!(hasher.partition("k", 7), hasher.partition("k", 7));
    // Zero partitions degrades to partition 0.
    assert_eq!(hasher.partition("k", 0), 0);
  }

  #[test]
  fn test_static_topology_locality() {
    let topology = StaticTopology::new(4, [1, 3]);
    assert_eq!(topology.partition_count(), 4);
    assert!(topology.is_local(1));
    assert!(!topology.is_local(0));

    let single = StaticTopology::single_node(3);
    assert!((0..3).all(|p| single.is_local(p)));
  }

  #[test]
  fn test_partitioning_local_default() {
    let partitioning = Partitioning::local();
    assert_eq!(partitioning.partition_for("anything"), 0);
    assert!(partitioning.topology.is_local(0));
  }
}
