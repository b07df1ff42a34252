use super::node::Node;
use crate::engine::Key;

/// In-order key iterator driven by an explicit stack of `(node, next key index)`.
///
/// Holds at most one frame per level, so memory is bounded by tree height.
pub struct Keys<'a> {
    stack: Vec<(&'a Node, usize)>,
}

impl<'a> Keys<'a> {
    pub(crate) fn new(root: &'a Node) -> Self {
        let mut keys = Self { stack: Vec::new() };
        keys.descend_leftmost(root);
        keys
    }

    fn descend_leftmost(&mut self, mut node: &'a Node) {
        loop {
            self.stack.push((node, 0));
            if node.leaf {
                break;
            }
            node = &*node.children[0];
        }
    }
}

impl Iterator for Keys<'_> {
    type Item = Key;

    fn next(&mut self) -> Option<Key> {
        loop {
            let (node, idx) = self.stack.last_mut()?;
            let node = *node;
            if *idx < node.keys.len() {
                let i = *idx;
                *idx += 1;
                if !node.leaf {
                    self.descend_leftmost(&*node.children[i + 1]);
                }
                return Some(node.keys[i]);
            }
            self.stack.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::btree::tree::Tree;

    #[test]
    fn test_keys_on_multi_level_tree() {
        let mut tree = Tree::new(2).unwrap();
        for key in (0..64).rev() {
            tree.insert(key, key);
        }
        assert!(tree.height() >= 3);

        let keys: Vec<_> = tree.keys().collect();
        assert_eq!(keys, (0..64).collect::<Vec<_>>());
    }

    #[test]
    fn test_keys_is_lazy() {
        let mut tree = Tree::new(2).unwrap();
        for key in 0..1000 {
            tree.insert(key, key);
        }

        let mut keys = tree.keys();
        assert_eq!(keys.next(), Some(0));
        assert_eq!(keys.next(), Some(1));
        assert_eq!(keys.nth(97), Some(99));
        assert!(keys.stack.len() <= tree.height());
    }
}
