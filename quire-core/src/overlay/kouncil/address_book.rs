use crate::address::Address;
use std::collections::{BTreeSet, HashMap};

/// Which node holds which block, indexed both ways.
#[derive(Debug, Default)]
pub struct AddressBook {
    by_node: HashMap<Address, BTreeSet<Address>>,
    by_block: HashMap<Address, BTreeSet<Address>>,
}

impl AddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, node: Address, block: Address) -> bool {
        let added = self.by_node.entry(node).or_default().insert(block);
        self.by_block.entry(block).or_default().insert(node);
        added
    }

    pub fn remove(&mut self, node: &Address, block: &Address) -> bool {
        let removed = Self::unlink(&mut self.by_node, node, block);
        Self::unlink(&mut self.by_block, block, node);
        removed
    }

    /// Forget everything attributed to `node`; returns how many entries went.
    pub fn remove_node(&mut self, node: &Address) -> usize {
        let Some(blocks) = self.by_node.remove(node) else {
            return 0;
        };
        for block in &blocks {
            Self::unlink(&mut self.by_block, block, node);
        }
        blocks.len()
    }

    pub fn blocks_of(&self, node: &Address) -> BTreeSet<Address> {
        self.by_node.get(node).cloned().unwrap_or_default()
    }

    pub fn holders(&self, block: &Address) -> BTreeSet<Address> {
        self.by_block.get(block).cloned().unwrap_or_default()
    }

    /// Number of (node, block) entries.
    pub fn len(&self) -> usize {
        self.by_node.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_node.is_empty()
    }

    fn unlink(
        index: &mut HashMap<Address, BTreeSet<Address>>,
        key: &Address,
        value: &Address,
    ) -> bool {
        let Some(values) = index.get_mut(key) else {
            return false;
        };
        let removed = values.remove(value);
        if values.is_empty() {
            index.remove(key);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_both_indexes_stay_in_sync() {
        let (n1, n2) = (Address::hash(b"n1"), Address::hash(b"n2"));
        let (b1, b2) = (Address::hash(b"b1"), Address::hash(b"b2"));
        let mut book = AddressBook::new();

        assert!(book.insert(n1, b1));
        assert!(!book.insert(n1, b1));
        book.insert(n1, b2);
        book.insert(n2, b1);
        assert_eq!(book.len(), 3);
        assert_eq!(book.holders(&b1), BTreeSet::from([n1, n2]));

        assert!(book.remove(&n2, &b1));
        assert_eq!(book.holders(&b1), BTreeSet::from([n1]));

        assert_eq!(book.remove_node(&n1), 2);
        assert!(book.holders(&b1).is_empty());
        assert!(book.holders(&b2).is_empty());
        assert!(book.is_empty());
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let mut book = AddressBook::new();
        assert!(!book.remove(&Address::hash(b"n"), &Address::hash(b"b")));
        assert_eq!(book.remove_node(&Address::hash(b"n")), 0);
    }
}
