//! B-tree nodes and the single-pass insert/delete algorithms.
//!
//! Nodes are exclusively owned top-down (`Box` children), so split and merge
//! move ownership instead of aliasing. Both mutating walks are top-down with no
//! backtracking:
//! - insert splits any full child before descending into it,
//! - delete tops up any child holding only `t-1` keys (borrowing through the
//!   parent or merging with a sibling) before descending into it.

use std::cmp::Ordering;
use std::mem;

use crate::engine::{Key, Value};

#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) keys: Vec<Key>,
    pub(crate) values: Vec<Value>,
    pub(crate) children: Vec<Box<Node>>,
    pub(crate) leaf: bool,
}

impl Node {
    pub fn new(leaf: bool) -> Self {
        Self {
            keys: Vec::new(),
            values: Vec::new(),
            children: Vec::new(),
            leaf,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.leaf
    }

    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    pub(crate) fn is_full(&self, t: usize) -> bool {
        self.keys.len() == 2 * t - 1
    }

    pub fn search(&self, key: Key) -> Option<Value> {
        let mut node = self;
        loop {
            match node.keys.binary_search(&key) {
                Ok(i) => return Some(node.values[i]),
                Err(_) if node.leaf => return None,
                Err(i) => node = &*node.children[i],
            }
        }
    }

    /// Inserts into a node that is not full, splitting full children on the way
    /// down. Returns the previous value when `key` was already present.
    pub(crate) fn insert_non_full(&mut self, key: Key, value: Value, t: usize) -> Option<Value> {
        let mut node = self;
        loop {
            let mut i = match node.keys.binary_search(&key) {
                Ok(i) => return Some(mem::replace(&mut node.values[i], value)),
                Err(i) => i,
            };

            if node.leaf {
                node.keys.insert(i, key);
                node.values.insert(i, value);
                return None;
            }

            if node.children[i].is_full(t) {
                node.split_child(i, t);
                // The promoted median may be the key itself.
                match key.cmp(&node.keys[i]) {
                    Ordering::Equal => return Some(mem::replace(&mut node.values[i], value)),
                    Ordering::Greater => i += 1,
                    Ordering::Less => {}
                }
            }

            node = &mut *node.children[i];
        }
    }

    /// Splits the full child at `i` around its median, which moves up into
    /// `self` at position `i`.
    pub(crate) fn split_child(&mut self, i: usize, t: usize) {
        let child = &mut self.children[i];
        let mut right = Node::new(child.leaf);

        right.keys = child.keys.split_off(t);
        right.values = child.values.split_off(t);
        if !child.leaf {
            right.children = child.children.split_off(t);
        }
        let median_key = child.keys.remove(t - 1);
        let median_value = child.values.remove(t - 1);

        self.keys.insert(i, median_key);
        self.values.insert(i, median_value);
        self.children.insert(i + 1, Box::new(right));
    }

    /// Removes `key` from the subtree rooted here.
    ///
    /// `self` must hold at least `t` keys unless it is the root; every child is
    /// brought up to `t` keys before the walk enters it.
    pub(crate) fn remove(&mut self, key: Key, t: usize) -> Option<Value> {
        match self.keys.binary_search(&key) {
            Ok(i) if self.leaf => {
                self.keys.remove(i);
                Some(self.values.remove(i))
            }
            Ok(i) => {
                if self.children[i].keys.len() >= t {
                    let (k, v) = self.children[i].pop_max(t);
                    self.keys[i] = k;
                    Some(mem::replace(&mut self.values[i], v))
                } else if self.children[i + 1].keys.len() >= t {
                    let (k, v) = self.children[i + 1].pop_min(t);
                    self.keys[i] = k;
                    Some(mem::replace(&mut self.values[i], v))
                } else {
                    // Both neighbours are minimal: pull the key down into the
                    // merged child and delete it there.
                    self.merge_children(i);
                    self.children[i].remove(key, t)
                }
            }
            Err(_) if self.leaf => None,
            Err(i) => {
                let i = self.ensure_child_has_spare(i, t);
                self.children[i].remove(key, t)
            }
        }
    }

    /// Removes and returns the largest entry of this subtree.
    fn pop_max(&mut self, t: usize) -> (Key, Value) {
        if self.leaf {
            let last = self.keys.len() - 1;
            return (self.keys.remove(last), self.values.remove(last));
        }
        let i = self.ensure_child_has_spare(self.children.len() - 1, t);
        self.children[i].pop_max(t)
    }

    /// Removes and returns the smallest entry of this subtree.
    fn pop_min(&mut self, t: usize) -> (Key, Value) {
        if self.leaf {
            return (self.keys.remove(0), self.values.remove(0));
        }
        let i = self.ensure_child_has_spare(0, t);
        self.children[i].pop_min(t)
    }

    /// Makes sure child `i` holds at least `t` keys. Returns the index of the
    /// child that now covers the same key range (it shifts left on a merge with
    /// the left sibling).
    fn ensure_child_has_spare(&mut self, i: usize, t: usize) -> usize {
        if self.children[i].keys.len() >= t {
            return i;
        }

        let has_right = i + 1 < self.children.len();
        if i > 0 && self.children[i - 1].keys.len() >= t {
            self.borrow_from_left(i);
            i
        } else if has_right && self.children[i + 1].keys.len() >= t {
            self.borrow_from_right(i);
            i
        } else if has_right {
            self.merge_children(i);
            i
        } else {
            self.merge_children(i - 1);
            i - 1
        }
    }

    /// Rotates the left sibling's last entry up and the separator down into child `i`.
    fn borrow_from_left(&mut self, i: usize) {
        let (left_slice, right_slice) = self.children.split_at_mut(i);
        let left = &mut left_slice[i - 1];
        let child = &mut right_slice[0];

        let last = left.keys.len() - 1;
        let key = mem::replace(&mut self.keys[i - 1], left.keys.remove(last));
        let value = mem::replace(&mut self.values[i - 1], left.values.remove(last));
        child.keys.insert(0, key);
        child.values.insert(0, value);

        if !left.leaf {
            let moved = left.children.remove(left.children.len() - 1);
            child.children.insert(0, moved);
        }
    }

    /// Rotates the right sibling's first entry up and the separator down into child `i`.
    fn borrow_from_right(&mut self, i: usize) {
        let (left_slice, right_slice) = self.children.split_at_mut(i + 1);
        let child = &mut left_slice[i];
        let right = &mut right_slice[0];

        let key = mem::replace(&mut self.keys[i], right.keys.remove(0));
        let value = mem::replace(&mut self.values[i], right.values.remove(0));
        child.keys.push(key);
        child.values.push(value);

        if !right.leaf {
            child.children.push(right.children.remove(0));
        }
    }

    /// Merges child `i + 1` and the separator at `i` into child `i`.
    fn merge_children(&mut self, i: usize) {
        let right = *self.children.remove(i + 1);
        let separator_key = self.keys.remove(i);
        let separator_value = self.values.remove(i);

        let left = &mut self.children[i];
        left.keys.push(separator_key);
        left.values.push(separator_value);
        left.keys.extend(right.keys);
        left.values.extend(right.values);
        left.children.extend(right.children);
    }
}
