// Bounded Trie
// Character-keyed tree where every node holds a capped, sorted bucket of record
// identifiers. Pure data structure: no I/O and no internal locking. Mutation goes
// through `&mut Trie`, so the single-writer rule of the build phase is enforced by
// the borrow checker; a finalized trie is shared read-only behind an `Arc`.

use anyhow::{bail, Result};
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, trace};

use crate::error::IndexError;
use crate::types::{BucketCap, Lexeme};
use crate::validation;

/// A single node of the trie
///
/// Children are kept in insertion order; that order is the visiting order of
/// the finalization pass.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TrieNode {
    ch: char,
    children: Vec<TrieNode>,
    bucket: Vec<u32>,
}

impl TrieNode {
    /// Create a node from its parts
    pub fn new(ch: char, children: Vec<TrieNode>, bucket: Vec<u32>) -> Self {
        Self {
            ch,
            children,
            bucket,
        }
    }

    fn leaf(ch: char) -> Self {
        Self {
            ch,
            children: Vec::new(),
            bucket: Vec::new(),
        }
    }

    /// Character on the edge leading to this node (unused on the root)
    pub fn character(&self) -> char {
        self.ch
    }

    pub fn children(&self) -> &[TrieNode] {
        &self.children
    }

    pub fn bucket(&self) -> &[u32] {
        &self.bucket
    }

    fn find_child(&self, c: char) -> Option<&TrieNode> {
        self.children.iter().find(|child| child.ch == c)
    }

    fn child_or_insert(&mut self, c: char) -> &mut TrieNode {
        let pos = match self.children.iter().position(|child| child.ch == c) {
            Some(pos) => pos,
            None => {
                self.children.push(TrieNode::leaf(c));
                self.children.len() - 1
            }
        };
        &mut self.children[pos]
    }

    /// Cap and redistribute this node's bucket; children must already be final
    ///
    /// Own entries are deduplicated (first occurrence wins) and truncated to
    /// `cap`. Then entries are pulled from children in passes: pass `j` visits
    /// every child in stored order and takes its `j`-th entry. The cap is checked
    /// before every take, so once the bucket fills up mid-pass the children later
    /// in that pass contribute nothing. An entry already present in this bucket
    /// still counts as that child's take for the pass. Finally the bucket is sorted.
    fn finalize_bucket(&mut self, cap: usize) {
        let Self {
            children, bucket, ..
        } = self;

        let mut seen: HashSet<u32> = HashSet::with_capacity(bucket.len().min(cap));
        bucket.retain(|id| seen.insert(*id));
        bucket.truncate(cap);

        if !children.is_empty() {
            let passes = children.iter().map(|c| c.bucket.len()).max().unwrap_or(0);
            trace!(children = children.len(), passes, "redistributing child buckets");

            'fill: for j in 0..passes {
                for child in children.iter() {
                    let Some(&id) = child.bucket.get(j) else {
                        continue;
                    };
                    if bucket.len() >= cap {
                        break 'fill;
                    }
                    if seen.insert(id) {
                        bucket.push(id);
                    }
                }
            }
        }

        bucket.sort_unstable();
    }
}

/// Summary figures for logging and the stats endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrieStats {
    /// Nodes excluding the root
    pub nodes: usize,
    pub max_depth: usize,
    pub bucket_entries: usize,
    /// Buckets whose length reached the cap
    pub saturated_buckets: usize,
}

/// The bounded trie
///
/// Lifecycle: created empty, filled with `append`/`insert`, finalized exactly
/// once with `merge_upwards`, then read-only.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Trie {
    root: TrieNode,
    finalized: bool,
}

impl Trie {
    /// Create an empty, unfinalized trie
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a root node that has already been finalized (for example, loaded from disk)
    pub fn from_finalized_root(root: TrieNode) -> Self {
        Self {
            root,
            finalized: true,
        }
    }

    pub fn root(&self) -> &TrieNode {
        &self.root
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Exact-path lookup
    ///
    /// Returns the bucket stored at the node reached by `path`, or an empty slice
    /// when any character along the path is absent. No prefix expansion happens
    /// here; prefix semantics come from the finalization pass.
    pub fn lookup(&self, path: &[char]) -> &[u32] {
        let mut node = &self.root;
        for &c in path {
            match node.find_child(c) {
                Some(child) => node = child,
                None => return &[],
            }
        }
        &node.bucket
    }

    /// Lookup by clamped lexeme
    pub fn lookup_lexeme(&self, lexeme: &Lexeme) -> &[u32] {
        self.lookup(lexeme.path())
    }

    fn node_or_insert(&mut self, path: &[char]) -> Result<&mut TrieNode> {
        if self.finalized {
            bail!(IndexError::Lifecycle(
                "trie is finalized and can no longer be mutated".to_string()
            ));
        }
        let mut node = &mut self.root;
        for &c in path {
            node = node.child_or_insert(c);
        }
        Ok(node)
    }

    /// Append `id` to the bucket at `path`, creating missing nodes
    ///
    /// No sorting, capping or deduplication happens until `merge_upwards`.
    pub fn append(&mut self, path: &[char], id: u32) -> Result<()> {
        self.node_or_insert(path)?.bucket.push(id);
        Ok(())
    }

    /// Replace the bucket at `path`, creating missing nodes
    pub fn insert(&mut self, path: &[char], ids: Vec<u32>) -> Result<()> {
        self.node_or_insert(path)?.bucket = ids;
        Ok(())
    }

    /// Finalize the trie with a post-order pass over every node
    ///
    /// See `TrieNode::finalize_bucket` for the per-node rule. Can run only once.
    pub fn merge_upwards(&mut self, cap: BucketCap) -> Result<TrieStats> {
        if self.finalized {
            bail!(IndexError::Lifecycle(
                "merge_upwards may only run once".to_string()
            ));
        }

        fn visit(node: &mut TrieNode, cap: usize) {
            for child in node.children.iter_mut() {
                visit(child, cap);
            }
            node.finalize_bucket(cap);
        }

        visit(&mut self.root, cap.get());
        self.finalized = true;

        let stats = self.stats(cap);
        debug!(
            nodes = stats.nodes,
            max_depth = stats.max_depth,
            bucket_entries = stats.bucket_entries,
            saturated = stats.saturated_buckets,
            "trie finalized"
        );
        Ok(stats)
    }

    /// Compute summary figures; `cap` decides which buckets count as saturated
    pub fn stats(&self, cap: BucketCap) -> TrieStats {
        fn walk(node: &TrieNode, depth: usize, cap: usize, stats: &mut TrieStats) {
            stats.max_depth = stats.max_depth.max(depth);
            stats.bucket_entries += node.bucket.len();
            if node.bucket.len() >= cap {
                stats.saturated_buckets += 1;
            }
            for child in &node.children {
                stats.nodes += 1;
                walk(child, depth + 1, cap, stats);
            }
        }

        let mut stats = TrieStats::default();
        walk(&self.root, 0, cap.get(), &mut stats);
        stats
    }

    /// Number of nodes excluding the root
    pub fn node_count(&self) -> usize {
        fn count(node: &TrieNode) -> usize {
            node.children.iter().map(|c| 1 + count(c)).sum()
        }
        count(&self.root)
    }

    /// Length of the longest path from the root
    pub fn depth(&self) -> usize {
        fn deepest(node: &TrieNode) -> usize {
            node.children.iter().map(|c| 1 + deepest(c)).max().unwrap_or(0)
        }
        deepest(&self.root)
    }

    /// Verify the post-finalization invariants on every node
    ///
    /// Buckets are strictly ascending and at most `cap` long, and sibling
    /// characters are distinct. Reports the first violation found.
    pub fn check_finalized(&self, cap: BucketCap) -> Result<()> {
        fn walk(node: &TrieNode, path: &mut String, cap: usize) -> Result<()> {
            validation::index::validate_bucket(path, &node.bucket, cap)?;
            let chars: Vec<char> = node.children.iter().map(|c| c.ch).collect();
            validation::index::validate_children(path, &chars)?;
            for child in &node.children {
                path.push(child.ch);
                walk(child, path, cap)?;
                path.pop();
            }
            Ok(())
        }

        let mut path = String::new();
        walk(&self.root, &mut path, cap.get())
    }
}
