use std::mem;

use super::iter::Keys;
use super::node::Node;
use crate::engine::{Key, Value};
use crate::error::{Error, Result};

/// The unsynchronized multiway tree. [`super::BTree`] wraps it in the engine lock.
#[derive(Debug)]
pub struct Tree {
    root: Box<Node>,
    degree: usize,
    len: usize,
}

impl Tree {
    /// `degree` is the minimum degree `t` and must be at least 2.
    pub fn new(degree: usize) -> Result<Self> {
        if degree < 2 {
            return Err(Error::InvalidConfig(format!(
                "B-tree minimum degree must be at least 2, got {}",
                degree
            )));
        }
        Ok(Self {
            root: Box::new(Node::new(true)),
            degree,
            len: 0,
        })
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Levels from root to leaf; 1 for a lone root leaf.
    pub fn height(&self) -> usize {
        let mut height = 1;
        let mut node = &*self.root;
        while !node.leaf {
            node = &*node.children[0];
            height += 1;
        }
        height
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    pub fn search(&self, key: Key) -> Option<Value> {
        self.root.search(key)
    }

    /// Upserts `key`. Returns the previous value if the key existed.
    pub fn insert(&mut self, key: Key, value: Value) -> Option<Value> {
        let t = self.degree;
        if self.root.is_full(t) {
            let old_root = mem::replace(&mut self.root, Box::new(Node::new(false)));
            self.root.children.push(old_root);
            self.root.split_child(0, t);
            tracing::debug!(height = self.height(), "B-tree root split");
        }

        let previous = self.root.insert_non_full(key, value, t);
        if previous.is_none() {
            self.len += 1;
        }
        previous
    }

    /// Removes `key`, rebalancing on the way down. Missing keys are a no-op.
    pub fn delete(&mut self, key: Key) -> Option<Value> {
        let removed = self.root.remove(key, self.degree);
        if removed.is_some() {
            self.len -= 1;
        }

        if self.root.keys.is_empty() && !self.root.leaf {
            if let Some(child) = self.root.children.pop() {
                self.root = child;
                tracing::debug!(height = self.height(), "B-tree root collapsed");
            }
        }
        removed
    }

    /// Lazy in-order traversal of the keys. Call again to restart.
    pub fn keys(&self) -> Keys<'_> {
        Keys::new(&self.root)
    }

    /// Checks every structural invariant: key-count bounds, child counts,
    /// key ordering against the separators above, and uniform leaf depth.
    pub fn validate(&self) -> Result<()> {
        let mut leaf_depth = None;
        let mut count = 0;
        // (node, depth, exclusive lower bound, exclusive upper bound)
        let mut stack: Vec<(&Node, usize, Option<Key>, Option<Key>)> =
            vec![(&*self.root, 0, None, None)];

        while let Some((node, depth, low, high)) = stack.pop() {
            let is_root = depth == 0;
            let n = node.keys.len();

            if n > 2 * self.degree - 1 {
                return Err(invalid(format!("node at depth {} holds {} keys", depth, n)));
            }
            if !is_root && n < self.degree - 1 {
                return Err(invalid(format!("node at depth {} holds {} keys", depth, n)));
            }
            if node.values.len() != n {
                return Err(invalid(format!(
                    "node at depth {} has {} keys but {} values",
                    depth,
                    n,
                    node.values.len()
                )));
            }
            if node.keys.windows(2).any(|w| w[0] >= w[1]) {
                return Err(invalid(format!("keys out of order at depth {}", depth)));
            }
            if let (Some(low), Some(&first)) = (low, node.keys.first()) {
                if first <= low {
                    return Err(invalid(format!("key {} not above separator {}", first, low)));
                }
            }
            if let (Some(high), Some(&last)) = (high, node.keys.last()) {
                if last >= high {
                    return Err(invalid(format!("key {} not below separator {}", last, high)));
                }
            }
            count += n;

            if node.leaf {
                if !node.children.is_empty() {
                    return Err(invalid(format!("leaf at depth {} has children", depth)));
                }
                match leaf_depth {
                    None => leaf_depth = Some(depth),
                    Some(d) if d != depth => {
                        return Err(invalid(format!(
                            "leaves at depths {} and {}",
                            d, depth
                        )))
                    }
                    Some(_) => {}
                }
                continue;
            }

            if node.children.len() != n + 1 {
                return Err(invalid(format!(
                    "internal node at depth {} has {} keys and {} children",
                    depth,
                    n,
                    node.children.len()
                )));
            }
            for (i, child) in node.children.iter().enumerate() {
                let child_low = if i == 0 { low } else { Some(node.keys[i - 1]) };
                let child_high = if i == n { high } else { Some(node.keys[i]) };
                stack.push((&**child, depth + 1, child_low, child_high));
            }
        }

        if count != self.len {
            return Err(invalid(format!(
                "tree holds {} keys but tracks {}",
                count, self.len
            )));
        }
        Ok(())
    }
}

fn invalid(msg: String) -> Error {
    Error::InvalidState(msg)
}

impl Drop for Tree {
    /// Releases nodes with an explicit stack instead of recursive drops.
    fn drop(&mut self) {
        let mut stack = mem::take(&mut self.root.children);
        while let Some(mut node) = stack.pop() {
            stack.append(&mut node.children);
        }
    }
}
