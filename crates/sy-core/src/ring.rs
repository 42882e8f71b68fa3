//! Consistent-hash ring with virtual nodes.
//!
//! Immutable once built: membership changes produce a new ring, and the
//! caller reuses the old one whenever the member multiset is unchanged.

use std::collections::HashMap;
use xxhash_rust::xxh64::xxh64;

/// Hash a selection key to its 64-bit ring position.
pub fn hash_key(key: &str) -> u64 {
    xxh64(key.as_bytes(), 0)
}

/// Sorted ring of `(hash_point, member_tag)` pairs, `virtual_nodes` points
/// per member.
#[derive(Debug, Clone)]
pub struct HashRing {
    points: Vec<(u64, String)>,
    members: Vec<String>,
}

impl HashRing {
    /// Build a ring from member tags. Virtual keys take the form
    /// `"{tag}:{index}"` for `index` in `0..virtual_nodes`.
    pub fn new(members: &[String], virtual_nodes: usize) -> Self {
        let mut points = Vec::with_capacity(members.len() * virtual_nodes);
        for tag in members {
            for index in 0..virtual_nodes {
                let virtual_key = format!("{tag}:{index}");
                points.push((hash_key(&virtual_key), tag.clone()));
            }
        }
        // Tie-break colliding points by tag so lookups stay deterministic.
        points.sort_unstable_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

        Self {
            points,
            members: members.to_vec(),
        }
    }

    /// Member owning `key_hash`: the first point at or after it, wrapping
    /// past the end.
    pub fn lookup(&self, key_hash: u64) -> Option<&str> {
        if self.points.is_empty() {
            return None;
        }
        let idx = self.points.partition_point(|(point, _)| *point < key_hash);
        let idx = if idx >= self.points.len() { 0 } else { idx };
        Some(&self.points[idx].1)
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Whether `tags` is the same member multiset this ring was built
    /// from, order-independent. Used to skip rebuilding on stable
    /// memberships.
    pub fn same_membership(&self, tags: &[String]) -> bool {
        if self.members.len() != tags.len() {
            return false;
        }
        let mut counts: HashMap<&str, isize> = HashMap::with_capacity(self.members.len());
        for tag in &self.members {
            *counts.entry(tag.as_str()).or_default() += 1;
        }
        for tag in tags {
            match counts.get_mut(tag.as_str()) {
                Some(n) => *n -= 1,
                None => return false,
            }
        }
        counts.values().all(|n| *n == 0)
    }
}
