// Arena-allocated B+ tree.
//
// Nodes live in a flat arena and reference each other by index, so there
// are no reference-counted back-pointers to cycle. Values are stored only
// in leaves; internal nodes hold separator keys, where `keys[i]` is the
// smallest key in the subtree of `children[i+1]`. Leaves are chained
// left-to-right for range scans.
//
// Insertion splits full nodes on the way down; deletion guarantees every
// child entered has at least `t` keys by borrowing from or merging with a
// sibling first. Both are single-pass descents.
//
// The whole tree sits behind one readers-writer lock. Range scans hold the
// read lock only while refilling a batch, re-seeking past the last yielded
// key, so concurrent mutation neither crashes a scan nor hides keys that
// are present throughout it.

use std::collections::VecDeque;

use parking_lot::RwLock;

use crate::error::{DbError, Result};

use super::key::IndexKey;

/// Default minimum degree. Nodes hold between t-1 and 2t-1 keys.
pub const DEFAULT_MIN_DEGREE: usize = 4;

/// Keys yielded per read-lock acquisition during a range scan.
const SCAN_BATCH: usize = 32;

struct Node {
    leaf: bool,
    keys: Vec<IndexKey>,
    /// Leaf only: values per key, parallel to `keys`.
    vals: Vec<Vec<String>>,
    /// Internal only: `keys.len() + 1` children.
    children: Vec<usize>,
    /// Leaf only: right neighbour in the leaf chain.
    next: Option<usize>,
}

impl Node {
    fn new_leaf() -> Self {
        Node {
            leaf: true,
            keys: Vec::new(),
            vals: Vec::new(),
            children: Vec::new(),
            next: None,
        }
    }

    fn new_internal() -> Self {
        Node {
            leaf: false,
            keys: Vec::new(),
            vals: Vec::new(),
            children: Vec::new(),
            next: None,
        }
    }

    /// Child slot to descend into when looking for `key`.
    fn child_index(&self, key: &IndexKey) -> usize {
        self.keys.partition_point(|sep| sep <= key)
    }
}

struct Tree {
    arena: Vec<Node>,
    free: Vec<usize>,
    root: usize,
    t: usize,
    /// Total stored values (not distinct keys).
    value_count: usize,
}

impl Tree {
    fn new(t: usize) -> Self {
        Tree {
            arena: vec![Node::new_leaf()],
            free: Vec::new(),
            root: 0,
            t,
            value_count: 0,
        }
    }

    fn max_keys(&self) -> usize {
        2 * self.t - 1
    }

    fn alloc(&mut self, node: Node) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.arena[idx] = node;
                idx
            }
            None => {
                self.arena.push(node);
                self.arena.len() - 1
            }
        }
    }

    fn release(&mut self, idx: usize) {
        self.arena[idx] = Node::new_leaf();
        self.free.push(idx);
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    fn find_leaf(&self, key: &IndexKey) -> usize {
        let mut idx = self.root;
        loop {
            let node = &self.arena[idx];
            if node.leaf {
                return idx;
            }
            idx = node.children[node.child_index(key)];
        }
    }

    fn leftmost_leaf(&self) -> usize {
        let mut idx = self.root;
        loop {
            let node = &self.arena[idx];
            if node.leaf {
                return idx;
            }
            idx = node.children[0];
        }
    }

    fn get(&self, key: &IndexKey) -> Option<&Vec<String>> {
        let leaf = &self.arena[self.find_leaf(key)];
        leaf.keys
            .binary_search(key)
            .ok()
            .map(|i| &leaf.vals[i])
    }

    // =========================================================================
    // Insertion
    // =========================================================================

    fn insert(&mut self, key: IndexKey, value: String, unique: bool) -> Result<()> {
        if self.arena[self.root].keys.len() == self.max_keys() {
            let old_root = self.root;
            let mut new_root = Node::new_internal();
            new_root.children.push(old_root);
            let new_root = self.alloc(new_root);
            self.root = new_root;
            self.split_child(new_root, 0);
        }
        self.insert_nonfull(self.root, key, value, unique)
    }

    fn insert_nonfull(
        &mut self,
        mut idx: usize,
        key: IndexKey,
        value: String,
        unique: bool,
    ) -> Result<()> {
        loop {
            if self.arena[idx].leaf {
                let node = &mut self.arena[idx];
                match node.keys.binary_search(&key) {
                    Ok(i) => {
                        if unique {
                            return Err(DbError::duplicate_key("unique index", key.render()));
                        }
                        node.vals[i].push(value);
                    }
                    Err(i) => {
                        node.keys.insert(i, key);
                        node.vals.insert(i, vec![value]);
                    }
                }
                self.value_count += 1;
                return Ok(());
            }

            let mut ci = self.arena[idx].child_index(&key);
            let child = self.arena[idx].children[ci];
            if self.arena[child].keys.len() == self.max_keys() {
                self.split_child(idx, ci);
                // A new separator landed at `ci`; step right when the key
                // belongs in the new right sibling.
                if self.arena[idx].keys[ci] <= key {
                    ci += 1;
                }
            }
            idx = self.arena[idx].children[ci];
        }
    }

    /// Splits the full child at `parent.children[ci]` into two nodes.
    fn split_child(&mut self, parent: usize, ci: usize) {
        let t = self.t;
        let child = self.arena[parent].children[ci];

        let (separator, right) = if self.arena[child].leaf {
            // Left keeps t-1 keys, right takes t; the separator is a copy of
            // the right node's first key.
            let node = &mut self.arena[child];
            let right_keys = node.keys.split_off(t - 1);
            let right_vals = node.vals.split_off(t - 1);
            let next = node.next.take();
            let separator = right_keys[0].clone();
            let mut right = Node::new_leaf();
            right.keys = right_keys;
            right.vals = right_vals;
            right.next = next;
            (separator, right)
        } else {
            // The median key moves up; both sides keep t-1 keys and t
            // children.
            let node = &mut self.arena[child];
            let right_keys = node.keys.split_off(t);
            let separator = node.keys.pop().expect("full node has 2t-1 keys");
            let right_children = node.children.split_off(t);
            let mut right = Node::new_internal();
            right.keys = right_keys;
            right.children = right_children;
            (separator, right)
        };

        let right_idx = self.alloc(right);
        if self.arena[child].leaf {
            self.arena[child].next = Some(right_idx);
        }
        let parent_node = &mut self.arena[parent];
        parent_node.keys.insert(ci, separator);
        parent_node.children.insert(ci + 1, right_idx);
    }

    // =========================================================================
    // Deletion
    // =========================================================================

    /// Removes a whole key entry, returning its values.
    fn remove_entry(&mut self, key: &IndexKey) -> Option<Vec<String>> {
        let removed = self.delete_from(self.root, key);
        self.collapse_root();
        if let Some(vals) = &removed {
            self.value_count -= vals.len();
        }
        removed
    }

    /// Removes one occurrence of `value` under `key`. Drops the whole entry
    /// when it was the last value.
    fn remove_value(&mut self, key: &IndexKey, value: &str) -> bool {
        let last = match self.get(key) {
            None => return false,
            Some(vals) => {
                if !vals.iter().any(|v| v == value) {
                    return false;
                }
                vals.len() == 1
            }
        };
        if last {
            self.remove_entry(key).is_some()
        } else {
            let leaf = self.find_leaf(key);
            let node = &mut self.arena[leaf];
            let i = node.keys.binary_search(key).expect("checked above");
            let pos = node.vals[i]
                .iter()
                .position(|v| v == value)
                .expect("checked above");
            node.vals[i].remove(pos);
            self.value_count -= 1;
            true
        }
    }

    fn delete_from(&mut self, mut idx: usize, key: &IndexKey) -> Option<Vec<String>> {
        loop {
            if self.arena[idx].leaf {
                let node = &mut self.arena[idx];
                return match node.keys.binary_search(key) {
                    Ok(i) => {
                        node.keys.remove(i);
                        Some(node.vals.remove(i))
                    }
                    Err(_) => None,
                };
            }
            let ci = self.arena[idx].child_index(key);
            let ci = self.fortify_child(idx, ci);
            idx = self.arena[idx].children[ci];
        }
    }

    /// Ensures `parent.children[ci]` holds at least `t` keys before it is
    /// entered, borrowing from a sibling or merging. Returns the child slot
    /// that now covers the descent (merging into the left shifts it).
    fn fortify_child(&mut self, parent: usize, ci: usize) -> usize {
        let t = self.t;
        let child = self.arena[parent].children[ci];
        if self.arena[child].keys.len() >= t {
            return ci;
        }

        let sibling_len = |tree: &Tree, slot: usize| tree.arena[tree.arena[parent].children[slot]].keys.len();

        if ci > 0 && sibling_len(self, ci - 1) >= t {
            self.borrow_from_left(parent, ci);
            ci
        } else if ci + 1 < self.arena[parent].children.len() && sibling_len(self, ci + 1) >= t {
            self.borrow_from_right(parent, ci);
            ci
        } else if ci > 0 {
            self.merge_children(parent, ci - 1);
            ci - 1
        } else {
            self.merge_children(parent, ci);
            ci
        }
    }

    fn borrow_from_left(&mut self, parent: usize, ci: usize) {
        let left = self.arena[parent].children[ci - 1];
        let child = self.arena[parent].children[ci];
        let sep = ci - 1;

        if self.arena[child].leaf {
            let (key, vals) = {
                let node = &mut self.arena[left];
                (
                    node.keys.pop().expect("donor has >= t keys"),
                    node.vals.pop().expect("donor has >= t keys"),
                )
            };
            let node = &mut self.arena[child];
            node.keys.insert(0, key.clone());
            node.vals.insert(0, vals);
            self.arena[parent].keys[sep] = key;
        } else {
            let (donor_key, donor_child) = {
                let node = &mut self.arena[left];
                (
                    node.keys.pop().expect("donor has >= t keys"),
                    node.children.pop().expect("donor has >= t+1 children"),
                )
            };
            let sep_key = std::mem::replace(&mut self.arena[parent].keys[sep], donor_key);
            let node = &mut self.arena[child];
            node.keys.insert(0, sep_key);
            node.children.insert(0, donor_child);
        }
    }

    fn borrow_from_right(&mut self, parent: usize, ci: usize) {
        let child = self.arena[parent].children[ci];
        let right = self.arena[parent].children[ci + 1];
        let sep = ci;

        if self.arena[child].leaf {
            let (key, vals) = {
                let node = &mut self.arena[right];
                (node.keys.remove(0), node.vals.remove(0))
            };
            let new_sep = self.arena[right].keys[0].clone();
            let node = &mut self.arena[child];
            node.keys.push(key);
            node.vals.push(vals);
            self.arena[parent].keys[sep] = new_sep;
        } else {
            let (donor_key, donor_child) = {
                let node = &mut self.arena[right];
                (node.keys.remove(0), node.children.remove(0))
            };
            let sep_key = std::mem::replace(&mut self.arena[parent].keys[sep], donor_key);
            let node = &mut self.arena[child];
            node.keys.push(sep_key);
            node.children.push(donor_child);
        }
    }

    /// Merges `parent.children[li + 1]` into `parent.children[li]`.
    fn merge_children(&mut self, parent: usize, li: usize) {
        let left = self.arena[parent].children[li];
        let right = self.arena[parent].children[li + 1];
        let sep_key = self.arena[parent].keys.remove(li);
        self.arena[parent].children.remove(li + 1);

        let right_node = std::mem::replace(&mut self.arena[right], Node::new_leaf());
        let left_node = &mut self.arena[left];
        if left_node.leaf {
            // The separator is a copy of the right node's first key and is
            // simply discarded.
            left_node.keys.extend(right_node.keys);
            left_node.vals.extend(right_node.vals);
            left_node.next = right_node.next;
        } else {
            left_node.keys.push(sep_key);
            left_node.keys.extend(right_node.keys);
            left_node.children.extend(right_node.children);
        }
        self.free.push(right);
    }

    fn collapse_root(&mut self) {
        while !self.arena[self.root].leaf && self.arena[self.root].keys.is_empty() {
            let old = self.root;
            self.root = self.arena[old].children[0];
            self.release(old);
        }
    }

    // =========================================================================
    // Scans
    // =========================================================================

    /// Collects up to `limit` key groups in `[start, end]`, strictly after
    /// `resume` when given. Returns the groups and whether the range is
    /// exhausted.
    #[allow(clippy::type_complexity)]
    fn scan_batch(
        &self,
        start: &IndexKey,
        end: &IndexKey,
        resume: Option<&IndexKey>,
        limit: usize,
    ) -> (Vec<(IndexKey, Vec<String>)>, bool) {
        let seek = resume.unwrap_or(start);
        let mut idx = self.find_leaf(seek);
        let mut out = Vec::new();

        loop {
            let node = &self.arena[idx];
            let from = match resume {
                Some(last) => node.keys.partition_point(|k| k <= last),
                None => node.keys.partition_point(|k| k < start),
            };
            for i in from..node.keys.len() {
                if &node.keys[i] > end {
                    return (out, true);
                }
                out.push((node.keys[i].clone(), node.vals[i].clone()));
                if out.len() >= limit {
                    return (out, false);
                }
            }
            match node.next {
                Some(next) => idx = next,
                None => return (out, true),
            }
        }
    }

    /// Smallest entry with key >= `key`.
    fn seek_ge(&self, key: &IndexKey) -> Option<(IndexKey, String)> {
        let mut idx = self.find_leaf(key);
        loop {
            let node = &self.arena[idx];
            let i = node.keys.partition_point(|k| k < key);
            if i < node.keys.len() {
                return Some((node.keys[i].clone(), node.vals[i][0].clone()));
            }
            idx = node.next?;
        }
    }

    /// Largest entry with key <= `key`, by scanning the leaf chain from the
    /// left.
    fn seek_le(&self, key: &IndexKey) -> Option<(IndexKey, String)> {
        let mut idx = self.leftmost_leaf();
        let mut best: Option<(IndexKey, String)> = None;
        loop {
            let node = &self.arena[idx];
            for (i, k) in node.keys.iter().enumerate() {
                if k > key {
                    return best;
                }
                best = Some((k.clone(), node.vals[i][0].clone()));
            }
            match node.next {
                Some(next) => idx = next,
                None => return best,
            }
        }
    }

    fn min(&self) -> Option<IndexKey> {
        let leaf = &self.arena[self.leftmost_leaf()];
        leaf.keys.first().cloned()
    }

    fn max(&self) -> Option<IndexKey> {
        let mut idx = self.root;
        loop {
            let node = &self.arena[idx];
            if node.leaf {
                return node.keys.last().cloned();
            }
            idx = *node.children.last().expect("internal node has children");
        }
    }
}

/// Sorted key → values index.
///
/// Unique indexes reject duplicate keys; non-unique indexes hold a list of
/// values per key and count total values rather than distinct keys.
pub struct BTreeIndex {
    inner: RwLock<Tree>,
    unique: bool,
}

impl BTreeIndex {
    pub fn new(unique: bool) -> Self {
        Self::with_min_degree(unique, DEFAULT_MIN_DEGREE)
    }

    pub fn with_min_degree(unique: bool, t: usize) -> Self {
        assert!(t >= 2, "minimum degree must be at least 2");
        BTreeIndex {
            inner: RwLock::new(Tree::new(t)),
            unique,
        }
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    /// Inserts a value under `key`. A unique index rejects an existing key
    /// with `AlreadyExists` carrying the key rendering.
    pub fn insert(&self, key: IndexKey, value: impl Into<String>) -> Result<()> {
        self.inner.write().insert(key, value.into(), self.unique)
    }

    /// Unique: replace the value for `key` (insert when missing).
    /// Non-unique: append the value.
    pub fn update(&self, key: IndexKey, value: impl Into<String>) {
        let value = value.into();
        let mut tree = self.inner.write();
        if self.unique {
            if let Some(old) = tree.remove_entry(&key) {
                debug_assert!(old.len() == 1);
            }
        }
        tree.insert(key, value, false)
            .expect("non-unique insert cannot collide");
    }

    /// Removes a key and all its values.
    pub fn remove_key(&self, key: &IndexKey) -> Option<Vec<String>> {
        self.inner.write().remove_entry(key)
    }

    /// Removes one `(key, value)` pair (non-unique mode).
    pub fn remove_value(&self, key: &IndexKey, value: &str) -> bool {
        self.inner.write().remove_value(key, value)
    }

    /// First value stored under `key`.
    pub fn try_get(&self, key: &IndexKey) -> Option<String> {
        self.inner.read().get(key).map(|vals| vals[0].clone())
    }

    /// Every value stored under `key`.
    pub fn get_values(&self, key: &IndexKey) -> Vec<String> {
        self.inner.read().get(key).cloned().unwrap_or_default()
    }

    pub fn contains_key(&self, key: &IndexKey) -> bool {
        self.inner.read().get(key).is_some()
    }

    /// Inclusive range scan yielding `(key, value)` pairs in ascending key
    /// order, lazily in batches.
    pub fn range(&self, start: IndexKey, end: IndexKey) -> RangeScan<'_> {
        RangeScan {
            index: self,
            start,
            end,
            resume: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Smallest entry with key >= `key`.
    pub fn get_ge(&self, key: &IndexKey) -> Option<(IndexKey, String)> {
        self.inner.read().seek_ge(key)
    }

    /// Largest entry with key <= `key`.
    pub fn get_le(&self, key: &IndexKey) -> Option<(IndexKey, String)> {
        self.inner.read().seek_le(key)
    }

    pub fn min_key(&self) -> Option<IndexKey> {
        self.inner.read().min()
    }

    pub fn max_key(&self) -> Option<IndexKey> {
        self.inner.read().max()
    }

    /// Total stored values (not distinct keys).
    pub fn len(&self) -> usize {
        self.inner.read().value_count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut tree = self.inner.write();
        let t = tree.t;
        *tree = Tree::new(t);
    }

    /// Every `(key, value)` pair in ascending key order.
    pub fn get_all(&self) -> Vec<(IndexKey, String)> {
        self.range(IndexKey::MinKey, IndexKey::MaxKey).collect()
    }

    /// Structural validation used by tests: equal leaf depth, key-count
    /// bounds on every non-root node, and a sorted, complete leaf chain.
    #[cfg(test)]
    fn check_invariants(&self) {
        let tree = self.inner.read();
        let mut leaf_depths = Vec::new();
        let mut stack = vec![(tree.root, 0usize)];
        let mut reachable_leaf_keys = 0usize;
        while let Some((idx, depth)) = stack.pop() {
            let node = &tree.arena[idx];
            if idx != tree.root {
                assert!(
                    node.keys.len() >= tree.t - 1 && node.keys.len() <= 2 * tree.t - 1,
                    "node has {} keys outside [{}, {}]",
                    node.keys.len(),
                    tree.t - 1,
                    2 * tree.t - 1
                );
            }
            if node.leaf {
                leaf_depths.push(depth);
                reachable_leaf_keys += node.keys.len();
                assert_eq!(node.keys.len(), node.vals.len());
            } else {
                assert_eq!(node.children.len(), node.keys.len() + 1);
                for &c in &node.children {
                    stack.push((c, depth + 1));
                }
            }
        }
        assert!(
            leaf_depths.windows(2).all(|w| w[0] == w[1]),
            "leaves at unequal depths: {leaf_depths:?}"
        );

        // Leaf chain covers every leaf key, in ascending order.
        let mut chained = 0usize;
        let mut last: Option<IndexKey> = None;
        let mut idx = tree.leftmost_leaf();
        loop {
            let node = &tree.arena[idx];
            for k in &node.keys {
                if let Some(prev) = &last {
                    assert!(prev < k, "leaf chain out of order");
                }
                last = Some(k.clone());
                chained += 1;
            }
            match node.next {
                Some(next) => idx = next,
                None => break,
            }
        }
        assert_eq!(chained, reachable_leaf_keys, "leaf chain misses keys");
    }
}

/// Lazy inclusive range scan.
///
/// Each refill takes the tree's read lock and re-seeks strictly past the
/// last yielded key, so items already yielded stay valid under concurrent
/// mutation and keys present throughout the scan are never missed.
pub struct RangeScan<'a> {
    index: &'a BTreeIndex,
    start: IndexKey,
    end: IndexKey,
    resume: Option<IndexKey>,
    buffer: VecDeque<(IndexKey, String)>,
    exhausted: bool,
}

impl Iterator for RangeScan<'_> {
    type Item = (IndexKey, String);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Some(item);
            }
            if self.exhausted {
                return None;
            }
            let tree = self.index.inner.read();
            let (groups, exhausted) =
                tree.scan_batch(&self.start, &self.end, self.resume.as_ref(), SCAN_BATCH);
            drop(tree);

            self.exhausted = exhausted;
            if let Some((last_key, _)) = groups.last() {
                self.resume = Some(last_key.clone());
            }
            if groups.is_empty() && self.exhausted {
                return None;
            }
            for (key, vals) in groups {
                for val in vals {
                    self.buffer.push_back((key.clone(), val));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_key(i: i64) -> IndexKey {
        IndexKey::Int(i)
    }

    fn filled(unique: bool, n: i64) -> BTreeIndex {
        let index = BTreeIndex::new(unique);
        for i in 1..=n {
            index.insert(int_key(i), format!("doc{i}")).unwrap();
        }
        index
    }

    #[test]
    fn test_insert_and_get() {
        let index = filled(true, 100);
        index.check_invariants();

        assert_eq!(index.try_get(&int_key(37)), Some("doc37".to_string()));
        assert_eq!(index.try_get(&int_key(101)), None);
        assert_eq!(index.len(), 100);
    }

    #[test]
    fn test_unique_rejects_duplicates() {
        let index = filled(true, 10);
        let err = index.insert(int_key(5), "other").unwrap_err();
        assert!(matches!(err, DbError::AlreadyExists { key: Some(_), .. }));
        assert_eq!(index.try_get(&int_key(5)), Some("doc5".to_string()));
    }

    #[test]
    fn test_non_unique_accumulates_values() {
        let index = BTreeIndex::new(false);
        index.insert(int_key(1), "a").unwrap();
        index.insert(int_key(1), "b").unwrap();
        index.insert(int_key(2), "c").unwrap();

        assert_eq!(index.get_values(&int_key(1)), vec!["a", "b"]);
        // Count reflects total values, not distinct keys.
        assert_eq!(index.len(), 3);

        assert!(index.remove_value(&int_key(1), "a"));
        assert_eq!(index.get_values(&int_key(1)), vec!["b"]);
        assert!(index.remove_value(&int_key(1), "b"));
        assert!(!index.contains_key(&int_key(1)));
        assert!(!index.remove_value(&int_key(1), "b"));
    }

    #[test]
    fn test_range_query_inclusive() {
        let index = filled(true, 100);

        let pairs: Vec<_> = index.range(int_key(25), int_key(75)).collect();
        assert_eq!(pairs.len(), 51);
        assert_eq!(pairs[0].0, int_key(25));
        assert_eq!(pairs[50].0, int_key(75));
        assert!(pairs.windows(2).all(|w| w[0].0 < w[1].0));

        index.remove_key(&int_key(50));
        index.check_invariants();
        let pairs: Vec<_> = index.range(int_key(25), int_key(75)).collect();
        assert_eq!(pairs.len(), 50);
        assert!(!pairs.iter().any(|(k, _)| *k == int_key(50)));
    }

    #[test]
    fn test_deletion_rebalances() {
        let index = filled(true, 500);
        // Remove a swath from the middle, then both ends.
        for i in 200..=400 {
            assert!(index.remove_key(&int_key(i)).is_some());
        }
        for i in 1..=50 {
            index.remove_key(&int_key(i));
        }
        for i in 450..=500 {
            index.remove_key(&int_key(i));
        }
        index.check_invariants();

        let remaining: Vec<_> = index.get_all();
        assert_eq!(remaining.len(), (51..=199).count() + (401..=449).count());
        assert_eq!(index.min_key(), Some(int_key(51)));
        assert_eq!(index.max_key(), Some(int_key(449)));
    }

    #[test]
    fn test_delete_everything_and_reuse() {
        let index = filled(true, 64);
        for i in 1..=64 {
            assert!(index.remove_key(&int_key(i)).is_some());
        }
        index.check_invariants();
        assert!(index.is_empty());
        assert_eq!(index.min_key(), None);

        index.insert(int_key(7), "again").unwrap();
        assert_eq!(index.try_get(&int_key(7)), Some("again".to_string()));
    }

    #[test]
    fn test_reverse_and_shuffled_insertion_order() {
        let index = BTreeIndex::new(true);
        // Interleave descending and ascending inserts.
        for i in (0..250).rev() {
            index.insert(int_key(i * 2), format!("d{i}")).unwrap();
        }
        for i in 0..250 {
            index.insert(int_key(i * 2 + 1), format!("o{i}")).unwrap();
        }
        index.check_invariants();
        assert_eq!(index.len(), 500);

        let all = index.get_all();
        assert_eq!(all.len(), 500);
        assert!(all.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn test_get_ge_and_le() {
        let index = BTreeIndex::new(true);
        for i in [10i64, 20, 30, 40] {
            index.insert(int_key(i), format!("d{i}")).unwrap();
        }

        assert_eq!(index.get_ge(&int_key(25)).unwrap().0, int_key(30));
        assert_eq!(index.get_ge(&int_key(30)).unwrap().0, int_key(30));
        assert_eq!(index.get_ge(&int_key(41)), None);

        assert_eq!(index.get_le(&int_key(25)).unwrap().0, int_key(20));
        assert_eq!(index.get_le(&int_key(10)).unwrap().0, int_key(10));
        assert_eq!(index.get_le(&int_key(9)), None);
    }

    #[test]
    fn test_update_semantics() {
        let unique = BTreeIndex::new(true);
        unique.insert(int_key(1), "old").unwrap();
        unique.update(int_key(1), "new");
        assert_eq!(unique.get_values(&int_key(1)), vec!["new"]);

        let multi = BTreeIndex::new(false);
        multi.insert(int_key(1), "a").unwrap();
        multi.update(int_key(1), "b");
        assert_eq!(multi.get_values(&int_key(1)), vec!["a", "b"]);
    }

    #[test]
    fn test_scan_survives_concurrent_deletion() {
        let index = filled(true, 100);
        let mut scan = index.range(int_key(1), int_key(100));

        // Drain one batch, then delete far ahead of the cursor.
        let first: Vec<_> = scan.by_ref().take(10).collect();
        assert_eq!(first.len(), 10);
        for i in 90..=100 {
            index.remove_key(&int_key(i));
        }

        let rest: Vec<_> = scan.collect();
        let yielded = first.len() + rest.len();
        // Keys present throughout the scan (11..=89) are all seen.
        assert!(yielded >= 89 - 10 + 10);
        assert!(rest.iter().all(|(k, _)| *k <= int_key(89)));
    }

    #[test]
    fn test_min_degree_two() {
        let index = BTreeIndex::with_min_degree(true, 2);
        for i in 0..100 {
            index.insert(int_key(i), format!("d{i}")).unwrap();
        }
        for i in (0..100).step_by(3) {
            index.remove_key(&int_key(i));
        }
        index.check_invariants();
    }
}
