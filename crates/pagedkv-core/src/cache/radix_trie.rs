//! Reference-counted radix trie over page-aligned token runs.
//!
//! Nodes live in an arena indexed by `NodeId`; parent and child links are
//! indices, not owning references, so eviction can drop a node and reuse its
//! slot without reference cycles. Every non-root node covers exactly one page
//! of tokens and the block holding their KV projections. A node is evictable
//! once no active sequence passes through it and it has no children; the
//! evictable leaves are kept in an ordered set keyed by
//! `(last_use, block, node)` so LRU selection is O(log n) with a
//! lowest-block-id tie-break.

use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{BlockId, SeqId, TokenId};

/// Index of a node in the trie arena.
pub type NodeId = usize;

const ROOT: NodeId = 0;

struct TrieNode {
    parent: NodeId,
    /// Page-sized token run on the edge leading into this node. Empty for
    /// the root.
    run: Vec<TokenId>,
    /// Block holding the KV projections for `run`. Unused for the root.
    block: BlockId,
    /// Children keyed by their full page run. Edges sharing a first token
    /// may coexist; the COW scan compares against every child.
    children: HashMap<Vec<TokenId>, NodeId>,
    /// Active sequences whose committed path passes through this node.
    /// The refcount is the size of this set.
    in_use_by: HashSet<SeqId>,
    last_use: u64,
}

pub struct RadixTrie {
    page_size: usize,
    nodes: Vec<Option<TrieNode>>,
    free_slots: Vec<NodeId>,
    /// Logical clock for LRU ordering.
    clock: u64,
    /// Evictable leaves: refcount zero, no children.
    evictable: BTreeSet<(u64, BlockId, NodeId)>,
}

impl RadixTrie {
    pub fn new(page_size: usize) -> Self {
        let root = TrieNode {
            parent: ROOT,
            run: Vec::new(),
            block: 0,
            children: HashMap::new(),
            in_use_by: HashSet::new(),
            last_use: 0,
        };
        Self {
            page_size,
            nodes: vec![Some(root)],
            free_slots: Vec::new(),
            clock: 0,
            evictable: BTreeSet::new(),
        }
    }

    pub fn root(&self) -> NodeId {
        ROOT
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    fn node(&self, id: NodeId) -> &TrieNode {
        self.nodes[id].as_ref().expect("vacant trie node")
    }

    fn node_mut(&mut self, id: NodeId) -> &mut TrieNode {
        self.nodes[id].as_mut().expect("vacant trie node")
    }

    /// Bump a node's recency and keep the evictable set in sync.
    fn touch(&mut self, id: NodeId) {
        self.clock += 1;
        let tick = self.clock;
        let (old_key, block, eligible) = {
            let node = self.node_mut(id);
            let old_key = (node.last_use, node.block, id);
            node.last_use = tick;
            let eligible =
                id != ROOT && node.children.is_empty() && node.in_use_by.is_empty();
            (old_key, node.block, eligible)
        };
        self.evictable.remove(&old_key);
        if eligible {
            self.evictable.insert((tick, block, id));
        }
    }

    /// Reconcile a node's membership in the evictable set with its state.
    fn update_evictable(&mut self, id: NodeId) {
        let (key, eligible) = {
            let node = self.node(id);
            (
                (node.last_use, node.block, id),
                id != ROOT && node.children.is_empty() && node.in_use_by.is_empty(),
            )
        };
        if eligible {
            self.evictable.insert(key);
        } else {
            self.evictable.remove(&key);
        }
    }

    fn walk(&self, tokens: &[TokenId], from: NodeId) -> (NodeId, Vec<NodeId>) {
        let mut cur = from;
        let mut path = Vec::new();
        let mut pos = 0;
        while pos + self.page_size <= tokens.len() {
            let run = &tokens[pos..pos + self.page_size];
            match self.node(cur).children.get(run) {
                Some(&child) => {
                    path.push(child);
                    cur = child;
                    pos += self.page_size;
                }
                None => break,
            }
        }
        (cur, path)
    }

    /// Greedy longest-prefix match in page-aligned steps, starting at `from`.
    /// A trailing run shorter than the page size is never matched. Bumps the
    /// recency of every node on the matched path.
    pub fn match_prefix(&mut self, tokens: &[TokenId], from: NodeId) -> (NodeId, Vec<BlockId>) {
        let (end, path) = self.walk(tokens, from);
        let blocks = path.iter().map(|&id| self.node(id).block).collect();
        for &id in &path {
            self.touch(id);
        }
        (end, blocks)
    }

    /// Read-only variant of `match_prefix`: no recency update.
    pub fn peek_prefix(&self, tokens: &[TokenId], from: NodeId) -> (NodeId, Vec<BlockId>) {
        let (end, path) = self.walk(tokens, from);
        let blocks = path.iter().map(|&id| self.node(id).block).collect();
        (end, blocks)
    }

    /// Insert page runs below `from`, one node per page.
    ///
    /// When an identical edge already exists with a different block id, the
    /// existing block wins and the caller's block is reported back as
    /// `(page_index, existing_block)`; the caller frees its own block and
    /// adopts the existing one.
    pub fn insert(
        &mut self,
        tokens: &[TokenId],
        blocks: &[BlockId],
        from: NodeId,
    ) -> Result<(NodeId, Vec<(usize, BlockId)>)> {
        if tokens.len() % self.page_size != 0 {
            return Err(Error::Protocol(format!(
                "inserted token run of {} is not a multiple of the page size {}",
                tokens.len(),
                self.page_size
            )));
        }
        if blocks.len() * self.page_size != tokens.len() {
            return Err(Error::Protocol(format!(
                "{} blocks cannot back {} tokens with page size {}",
                blocks.len(),
                tokens.len(),
                self.page_size
            )));
        }
        let mut cur = from;
        let mut superseded = Vec::new();
        for (i, run) in tokens.chunks(self.page_size).enumerate() {
            let existing = self.node(cur).children.get(run).copied();
            match existing {
                Some(child) => {
                    let child_block = self.node(child).block;
                    if child_block != blocks[i] {
                        superseded.push((i, child_block));
                    }
                    self.touch(child);
                    cur = child;
                }
                None => {
                    cur = self.new_node(cur, run.to_vec(), blocks[i]);
                }
            }
        }
        if !blocks.is_empty() {
            debug!(pages = blocks.len(), node = cur, "committed pages into trie");
        }
        Ok((cur, superseded))
    }

    fn new_node(&mut self, parent: NodeId, run: Vec<TokenId>, block: BlockId) -> NodeId {
        self.clock += 1;
        let node = TrieNode {
            parent,
            run: run.clone(),
            block,
            children: HashMap::new(),
            in_use_by: HashSet::new(),
            last_use: self.clock,
        };
        let id = match self.free_slots.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                slot
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        let tick = self.node(id).last_use;
        // the parent gained a child and can no longer be an evictable leaf
        let parent_key = {
            let p = self.node(parent);
            (p.last_use, p.block, parent)
        };
        self.evictable.remove(&parent_key);
        self.node_mut(parent).children.insert(run, id);
        // fresh nodes carry no references yet
        self.evictable.insert((tick, block, id));
        id
    }

    /// Mark every node on the path root→`node` as in use by `seq`.
    /// Idempotent per `(seq, node)`: the walk stops at the first node already
    /// carrying the mark, since its ancestors must carry it too.
    pub fn mark_in_use_by(&mut self, node: NodeId, seq: SeqId) {
        let mut cur = node;
        while cur != ROOT {
            let (already, parent) = {
                let n = self.node(cur);
                (n.in_use_by.contains(&seq), n.parent)
            };
            if already {
                break;
            }
            self.node_mut(cur).in_use_by.insert(seq);
            self.touch(cur);
            cur = parent;
        }
    }

    /// Remove `seq`'s marks along the path root→`node`.
    pub fn mark_not_in_use_by(&mut self, node: NodeId, seq: SeqId) {
        let mut cur = node;
        while cur != ROOT {
            let (removed, parent) = {
                let n = self.node_mut(cur);
                (n.in_use_by.remove(&seq), n.parent)
            };
            if !removed {
                break;
            }
            self.update_evictable(cur);
            cur = parent;
        }
    }

    /// Evict up to `desired` blocks, least recently used first, lowest block
    /// id breaking ties. Ancestors that become childless and unreferenced are
    /// evicted in the same sweep. Returns as many as possible; a node with a
    /// nonzero refcount is never evicted.
    pub fn evict_blocks(&mut self, desired: usize) -> Vec<BlockId> {
        self.evict_blocks_guarded(desired, &BTreeSet::new())
    }

    /// Eviction variant that leaves `protected` blocks in place.
    pub(crate) fn evict_blocks_guarded(
        &mut self,
        desired: usize,
        protected: &BTreeSet<BlockId>,
    ) -> Vec<BlockId> {
        let mut evicted = Vec::new();
        let mut skipped = Vec::new();
        while evicted.len() < desired {
            let Some(&key) = self.evictable.iter().next() else {
                break;
            };
            self.evictable.remove(&key);
            let (_, block, id) = key;
            if protected.contains(&block) {
                skipped.push(key);
                continue;
            }
            let (parent, run) = {
                let n = self.node(id);
                (n.parent, n.run.clone())
            };
            self.node_mut(parent).children.remove(run.as_slice());
            self.nodes[id] = None;
            self.free_slots.push(id);
            evicted.push(block);
            debug!(block, node = id, "evicted trie block");
            if parent != ROOT {
                self.update_evictable(parent);
            }
        }
        for key in skipped {
            self.evictable.insert(key);
        }
        evicted
    }

    /// Scan `node`'s children for the edge sharing the longest strict prefix
    /// with `candidate`. Returns `(block, k)` with `0 < k < page_size`, the
    /// longest match winning and the lowest block id breaking ties, so the
    /// result does not depend on child iteration order.
    pub fn find_block_with_largest_common_prefix(
        &self,
        node: NodeId,
        candidate: &[TokenId],
    ) -> Option<(BlockId, usize)> {
        let n = self.node(node);
        let mut best: Option<(usize, BlockId)> = None;
        for (run, &child) in &n.children {
            let k = run
                .iter()
                .zip(candidate.iter())
                .take_while(|(a, b)| a == b)
                .count();
            if k == 0 || k >= self.page_size {
                continue;
            }
            let block = self.node(child).block;
            let better = match best {
                None => true,
                Some((best_k, best_block)) => k > best_k || (k == best_k && block < best_block),
            };
            if better {
                best = Some((k, block));
            }
        }
        best.map(|(k, block)| (block, k))
    }

    /// All blocks currently owned by the trie.
    pub fn all_blocks(&self) -> BTreeSet<BlockId> {
        self.occupied()
            .filter(|&(id, _)| id != ROOT)
            .map(|(_, n)| n.block)
            .collect()
    }

    /// Blocks of nodes no active sequence passes through. Marks propagate
    /// toward the root, so every such node sits in a fully unreferenced
    /// subtree and is reclaimable by cascading eviction.
    pub fn evictable_blocks(&self) -> BTreeSet<BlockId> {
        self.occupied()
            .filter(|&(id, n)| id != ROOT && n.in_use_by.is_empty())
            .map(|(_, n)| n.block)
            .collect()
    }

    pub fn contains_block(&self, block: BlockId) -> bool {
        self.occupied()
            .any(|(id, n)| id != ROOT && n.block == block)
    }

    /// Number of non-root nodes.
    pub fn num_nodes(&self) -> usize {
        self.occupied().filter(|&(id, _)| id != ROOT).count()
    }

    pub fn refcount(&self, node: NodeId) -> usize {
        self.node(node).in_use_by.len()
    }

    /// Tokens and blocks accumulated along the path root→`node`.
    pub fn prefix_tokens_and_blocks(&self, node: NodeId) -> (Vec<TokenId>, Vec<BlockId>) {
        let path = self.path_to_root(node);
        let mut tokens = Vec::new();
        let mut blocks = Vec::new();
        for &id in path.iter().rev() {
            let n = self.node(id);
            tokens.extend_from_slice(&n.run);
            blocks.push(n.block);
        }
        (tokens, blocks)
    }

    /// Node ids from `node` up to the root, exclusive of the root.
    pub fn path_to_root(&self, node: NodeId) -> Vec<NodeId> {
        let mut path = Vec::new();
        let mut cur = node;
        while cur != ROOT {
            path.push(cur);
            cur = self.node(cur).parent;
        }
        path
    }

    /// Refcounts of every non-root node, keyed by node id.
    pub fn refcounts(&self) -> HashMap<NodeId, usize> {
        self.occupied()
            .filter(|&(id, _)| id != ROOT)
            .map(|(id, n)| (id, n.in_use_by.len()))
            .collect()
    }

    fn occupied(&self) -> impl Iterator<Item = (NodeId, &TrieNode)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_ref().map(|n| (id, n)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trie_with(page_size: usize, entries: &[(&[TokenId], &[BlockId])]) -> RadixTrie {
        let mut trie = RadixTrie::new(page_size);
        for (tokens, blocks) in entries {
            trie.insert(tokens, blocks, ROOT).unwrap();
        }
        trie
    }

    #[test]
    fn test_insert_then_match_round_trip() {
        let mut trie = trie_with(2, &[(&[1, 2, 3, 4], &[7, 8])]);
        let (node, blocks) = trie.match_prefix(&[1, 2, 3, 4], ROOT);
        assert_eq!(blocks, vec![7, 8]);
        let (tokens, path_blocks) = trie.prefix_tokens_and_blocks(node);
        assert_eq!(tokens, vec![1, 2, 3, 4]);
        assert_eq!(path_blocks, vec![7, 8]);
    }

    #[test]
    fn test_match_stops_at_divergence() {
        let mut trie = trie_with(2, &[(&[1, 2, 3, 4], &[7, 8])]);
        let (_, blocks) = trie.match_prefix(&[1, 2, 9, 9], ROOT);
        assert_eq!(blocks, vec![7]);
        // partial trailing runs are never matched
        let (_, blocks) = trie.match_prefix(&[1, 2, 3], ROOT);
        assert_eq!(blocks, vec![7]);
    }

    #[test]
    fn test_shared_first_token_edges_both_survive() {
        let mut trie = trie_with(2, &[(&[1, 2], &[0]), (&[1, 9], &[1])]);
        assert_eq!(trie.num_nodes(), 2);
        let (_, blocks) = trie.match_prefix(&[1, 9], ROOT);
        assert_eq!(blocks, vec![1]);
    }

    #[test]
    fn test_insert_reports_superseded_blocks() {
        let mut trie = trie_with(2, &[(&[1, 2, 3, 4], &[7, 8])]);
        let (_, superseded) = trie.insert(&[1, 2, 3, 4], &[5, 6], ROOT).unwrap();
        assert_eq!(superseded, vec![(0, 7), (1, 8)]);
        // the existing blocks stay canonical
        let (_, blocks) = trie.match_prefix(&[1, 2, 3, 4], ROOT);
        assert_eq!(blocks, vec![7, 8]);
    }

    #[test]
    fn test_insert_rejects_unaligned_runs() {
        let mut trie = RadixTrie::new(4);
        assert!(trie.insert(&[1, 2, 3], &[0], ROOT).is_err());
        assert!(trie.insert(&[1, 2, 3, 4], &[0, 1], ROOT).is_err());
    }

    #[test]
    fn test_refcounts_along_path() {
        let mut trie = trie_with(2, &[(&[1, 2, 3, 4], &[7, 8])]);
        let (node, _) = trie.match_prefix(&[1, 2, 3, 4], ROOT);
        trie.mark_in_use_by(node, 0);
        trie.mark_in_use_by(node, 1);
        trie.mark_in_use_by(node, 1); // idempotent
        for id in trie.path_to_root(node) {
            assert_eq!(trie.refcount(id), 2);
        }
        trie.mark_not_in_use_by(node, 0);
        for id in trie.path_to_root(node) {
            assert_eq!(trie.refcount(id), 1);
        }
    }

    #[test]
    fn test_referenced_nodes_are_not_evicted() {
        let mut trie = trie_with(2, &[(&[1, 2], &[0]), (&[5, 6], &[1])]);
        let (node, _) = trie.match_prefix(&[1, 2], ROOT);
        trie.mark_in_use_by(node, 0);
        let evicted = trie.evict_blocks(10);
        assert_eq!(evicted, vec![1]);
        assert!(trie.contains_block(0));
    }

    #[test]
    fn test_evict_lru_order_with_block_tie_break() {
        let mut trie = trie_with(2, &[(&[1, 2], &[0]), (&[5, 6], &[1]), (&[7, 8], &[2])]);
        // refresh block 0 so block 1 becomes the least recently used
        trie.match_prefix(&[1, 2], ROOT);
        assert_eq!(trie.evict_blocks(1), vec![1]);
        assert_eq!(trie.evict_blocks(2), vec![2, 0]);
    }

    #[test]
    fn test_evict_cascades_to_parents() {
        let mut trie = trie_with(2, &[(&[1, 2, 3, 4, 5, 6], &[0, 1, 2])]);
        let evicted = trie.evict_blocks(3);
        // the chain unwinds leaf-first
        assert_eq!(evicted, vec![2, 1, 0]);
        assert_eq!(trie.num_nodes(), 0);
    }

    #[test]
    fn test_evict_returns_fewer_when_supply_is_short() {
        let mut trie = trie_with(2, &[(&[1, 2], &[0])]);
        assert_eq!(trie.evict_blocks(5), vec![0]);
        assert!(trie.evict_blocks(1).is_empty());
    }

    #[test]
    fn test_guarded_eviction_skips_protected_blocks() {
        let mut trie = trie_with(2, &[(&[1, 2], &[0]), (&[5, 6], &[1])]);
        let protected: BTreeSet<BlockId> = [0].into_iter().collect();
        assert_eq!(trie.evict_blocks_guarded(1, &protected), vec![1]);
        // the protected entry is still evictable afterwards
        assert_eq!(trie.evict_blocks(1), vec![0]);
    }

    #[test]
    fn test_arena_slots_are_reused() {
        let mut trie = trie_with(2, &[(&[1, 2], &[0])]);
        trie.evict_blocks(1);
        trie.insert(&[9, 9], &[3], ROOT).unwrap();
        // one vacated slot plus the root
        assert_eq!(trie.nodes.len(), 2);
        assert_eq!(trie.num_nodes(), 1);
    }

    #[test]
    fn test_largest_common_prefix_scan() {
        let mut trie = RadixTrie::new(4);
        trie.insert(&[1, 2, 3, 4], &[0], ROOT).unwrap();
        trie.insert(&[1, 2, 9, 9], &[1], ROOT).unwrap();
        let hit = trie.find_block_with_largest_common_prefix(ROOT, &[1, 2, 3, 7]);
        assert_eq!(hit, Some((0, 3)));
        // k == page_size is a full match and never reported here, so the
        // shorter partial overlap on the sibling edge wins
        let hit = trie.find_block_with_largest_common_prefix(ROOT, &[1, 2, 3, 4]);
        assert_eq!(hit, Some((1, 2)));
        let hit = trie.find_block_with_largest_common_prefix(ROOT, &[8, 8, 8, 8]);
        assert_eq!(hit, None);
    }

    #[test]
    fn test_peek_does_not_change_recency() {
        let mut trie = trie_with(2, &[(&[1, 2], &[0]), (&[5, 6], &[1])]);
        trie.peek_prefix(&[1, 2], ROOT);
        // block 0 was only peeked, so it is still the LRU entry
        assert_eq!(trie.evict_blocks(1), vec![0]);
    }
}
