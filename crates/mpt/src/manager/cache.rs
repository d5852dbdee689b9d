//! The least-recently-used ordering of cache entries.

use crate::NodeId;
use std::collections::HashMap;

/// A doubly-linked LRU list of node ids.
///
/// The list only tracks ordering; ownership of the entries lives in the
/// manager's index. Links are kept in a map rather than intrusively so that
/// entries can be unlinked by id in O(1) without touching the owners.
#[derive(Debug, Default)]
pub(crate) struct LruList {
    links: HashMap<NodeId, Links>,
    /// The most recently used id.
    head: Option<NodeId>,
    /// The least recently used id, next in line for eviction.
    tail: Option<NodeId>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Links {
    prev: Option<NodeId>,
    next: Option<NodeId>,
}

impl LruList {
    /// The number of tracked ids.
    pub(crate) fn len(&self) -> usize {
        self.links.len()
    }

    /// Inserts `id` at the head of the list.
    ///
    /// # Panics
    /// Panics when `id` is already tracked; entries are unlinked before
    /// reinsertion.
    pub(crate) fn push_front(&mut self, id: NodeId) {
        let links = Links { prev: None, next: self.head };
        let replaced = self.links.insert(id, links);
        assert!(replaced.is_none(), "id {id} double-inserted into the lru list");

        if let Some(head) = self.head {
            if let Some(head_links) = self.links.get_mut(&head) {
                head_links.prev = Some(id);
            }
        }
        self.head = Some(id);
        if self.tail.is_none() {
            self.tail = Some(id);
        }
    }

    /// Moves `id` to the head of the list; a no-op for untracked ids.
    pub(crate) fn touch(&mut self, id: NodeId) {
        if self.head == Some(id) || !self.links.contains_key(&id) {
            return;
        }
        self.unlink(id);
        self.push_front(id);
    }

    /// Unlinks `id` from the list. Returns whether it was tracked.
    pub(crate) fn remove(&mut self, id: NodeId) -> bool {
        if !self.links.contains_key(&id) {
            return false;
        }
        self.unlink(id);
        true
    }

    /// Removes and returns the least recently used id.
    pub(crate) fn pop_back(&mut self) -> Option<NodeId> {
        let tail = self.tail?;
        self.unlink(tail);
        Some(tail)
    }

    fn unlink(&mut self, id: NodeId) {
        let Some(links) = self.links.remove(&id) else {
            return;
        };
        match links.prev {
            Some(prev) => {
                if let Some(prev_links) = self.links.get_mut(&prev) {
                    prev_links.next = links.next;
                }
            }
            None => self.head = links.next,
        }
        match links.next {
            Some(next) => {
                if let Some(next_links) = self.links.get_mut(&next) {
                    next_links.prev = links.prev;
                }
            }
            None => self.tail = links.prev,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NodeKind;

    fn id(index: u64) -> NodeId {
        NodeId::new(NodeKind::Value, index)
    }

    #[test]
    fn eviction_order_is_least_recent_first() {
        let mut list = LruList::default();
        list.push_front(id(1));
        list.push_front(id(2));
        list.push_front(id(3));

        assert_eq!(list.pop_back(), Some(id(1)));
        assert_eq!(list.pop_back(), Some(id(2)));
        assert_eq!(list.pop_back(), Some(id(3)));
        assert_eq!(list.pop_back(), None);
    }

    #[test]
    fn touch_moves_to_front() {
        let mut list = LruList::default();
        list.push_front(id(1));
        list.push_front(id(2));
        list.push_front(id(3));

        list.touch(id(1));
        assert_eq!(list.pop_back(), Some(id(2)));
        assert_eq!(list.pop_back(), Some(id(3)));
        assert_eq!(list.pop_back(), Some(id(1)));
    }

    #[test]
    fn remove_unlinks_in_the_middle() {
        let mut list = LruList::default();
        list.push_front(id(1));
        list.push_front(id(2));
        list.push_front(id(3));

        assert!(list.remove(id(2)));
        assert!(!list.remove(id(2)));
        assert_eq!(list.len(), 2);
        assert_eq!(list.pop_back(), Some(id(1)));
        assert_eq!(list.pop_back(), Some(id(3)));
    }

    #[test]
    fn touching_the_head_is_a_noop() {
        let mut list = LruList::default();
        list.push_front(id(1));
        list.push_front(id(2));
        list.touch(id(2));
        assert_eq!(list.len(), 2);
        assert_eq!(list.pop_back(), Some(id(1)));
    }
}
