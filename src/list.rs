//! # Intrusive List
//!
//! Doubly linked list used for every kernel queue. Nodes do not live in the
//! list: they live in a node table owned by whoever embeds them (the
//! scheduler keeps one table for queue membership and one for the thread
//! registry), and the list only records indices into that table. The index
//! of a node is its owner back-reference, so a thread's slot number names
//! both the thread and its node.
//!
//! ```text
//!   first ──► [3] ⇄ [0] ⇄ [7] ◄── last        size = 3
//! ```
//!
//! All operations are O(1) except `insert_sorted` and `contains`, which
//! walk the list. Queue depth is bounded by `MAX_THREADS`.

/// Link state of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Node {
    next: Option<usize>,
    prev: Option<usize>,
    key: u64,
    linked: bool,
}

impl Node {
    pub const fn new() -> Self {
        Self {
            next: None,
            prev: None,
            key: 0,
            linked: false,
        }
    }

    /// Sort key used by `List::insert_sorted` (the wake tick for delayed
    /// threads).
    #[inline]
    pub fn key(&self) -> u64 {
        self.key
    }

    /// Whether the node is currently a member of some list.
    #[inline]
    pub fn is_linked(&self) -> bool {
        self.linked
    }

    #[inline]
    pub fn next(&self) -> Option<usize> {
        self.next
    }

    #[inline]
    pub fn prev(&self) -> Option<usize> {
        self.prev
    }

    fn unlink(&mut self) {
        self.next = None;
        self.prev = None;
        self.linked = false;
    }
}

impl Default for Node {
    fn default() -> Self {
        Self::new()
    }
}

/// Head of a list. `first` is `None` exactly when `size` is zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct List {
    first: Option<usize>,
    last: Option<usize>,
    size: usize,
}

impl List {
    pub const fn new() -> Self {
        Self {
            first: None,
            last: None,
            size: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[inline]
    pub fn first(&self) -> Option<usize> {
        self.first
    }

    #[inline]
    pub fn last(&self) -> Option<usize> {
        self.last
    }

    /// Linear membership search.
    pub fn contains(&self, nodes: &[Node], index: usize) -> bool {
        self.iter(nodes).any(|i| i == index)
    }

    /// Insert at the head.
    ///
    /// # Panics
    /// If the node is already linked into a list.
    pub fn insert_first(&mut self, nodes: &mut [Node], index: usize) {
        Self::claim(nodes, index);

        match self.first {
            None => self.link_only(nodes, index),
            Some(first) => {
                assert!(nodes[first].prev.is_none(), "list head has a predecessor");
                nodes[index].next = Some(first);
                nodes[index].prev = None;
                nodes[first].prev = Some(index);
                self.first = Some(index);
                self.size += 1;
            }
        }
    }

    /// Insert at the tail.
    ///
    /// # Panics
    /// If the node is already linked into a list.
    pub fn insert_last(&mut self, nodes: &mut [Node], index: usize) {
        Self::claim(nodes, index);

        match self.last {
            None => self.link_only(nodes, index),
            Some(last) => {
                assert!(nodes[last].next.is_none(), "list tail has a successor");
                nodes[index].prev = Some(last);
                nodes[index].next = None;
                nodes[last].next = Some(index);
                self.last = Some(index);
                self.size += 1;
            }
        }
    }

    /// Insert keeping keys in ascending order. The node goes in front of the
    /// first node whose key is strictly greater, so equal keys are served in
    /// insertion order.
    ///
    /// # Panics
    /// If the node is already linked into a list.
    pub fn insert_sorted(&mut self, nodes: &mut [Node], index: usize, key: u64) {
        assert!(!nodes[index].linked, "list node {} is already linked", index);
        nodes[index].key = key;

        let mut cursor = self.first;
        while let Some(i) = cursor {
            if nodes[i].key > key {
                break;
            }
            cursor = nodes[i].next;
        }

        match cursor {
            None => self.insert_last(nodes, index),
            Some(i) if Some(i) == self.first => self.insert_first(nodes, index),
            Some(i) => {
                Self::claim(nodes, index);
                let prev = nodes[i].prev.expect("interior node without predecessor");
                nodes[index].prev = Some(prev);
                nodes[index].next = Some(i);
                nodes[prev].next = Some(index);
                nodes[i].prev = Some(index);
                self.size += 1;
            }
        }
    }

    /// Unlink the head. Returns the removed index, `None` when empty.
    pub fn remove_first(&mut self, nodes: &mut [Node]) -> Option<usize> {
        let first = self.first?;

        match nodes[first].next {
            None => {
                self.first = None;
                self.last = None;
            }
            Some(next) => {
                nodes[next].prev = None;
                self.first = Some(next);
            }
        }

        nodes[first].unlink();
        self.size -= 1;
        Some(first)
    }

    /// Unlink the tail. Returns the removed index, `None` when empty.
    pub fn remove_last(&mut self, nodes: &mut [Node]) -> Option<usize> {
        let last = self.last?;

        match nodes[last].prev {
            None => {
                self.first = None;
                self.last = None;
            }
            Some(prev) => {
                nodes[prev].next = None;
                self.last = Some(prev);
            }
        }

        nodes[last].unlink();
        self.size -= 1;
        Some(last)
    }

    /// Unlink an arbitrary node. Returns `false` if the list is empty or the
    /// node is not a member of this list.
    pub fn remove(&mut self, nodes: &mut [Node], index: usize) -> bool {
        if self.is_empty() {
            return false;
        }
        if self.first == Some(index) {
            return self.remove_first(nodes).is_some();
        }
        if self.last == Some(index) {
            return self.remove_last(nodes).is_some();
        }
        if !self.contains(nodes, index) {
            return false;
        }

        let (Some(prev), Some(next)) = (nodes[index].prev, nodes[index].next) else {
            panic!("interior list node {} is missing a link", index);
        };
        nodes[prev].next = Some(next);
        nodes[next].prev = Some(prev);
        nodes[index].unlink();
        self.size -= 1;
        true
    }

    /// Walk from `first` to `last`.
    pub fn iter<'a>(&self, nodes: &'a [Node]) -> Iter<'a> {
        Iter {
            nodes,
            cursor: self.first,
            remaining: self.size,
            forward: true,
        }
    }

    /// Walk from `last` to `first`.
    pub fn iter_rev<'a>(&self, nodes: &'a [Node]) -> Iter<'a> {
        Iter {
            nodes,
            cursor: self.last,
            remaining: self.size,
            forward: false,
        }
    }

    fn claim(nodes: &mut [Node], index: usize) {
        assert!(!nodes[index].linked, "list node {} is already linked", index);
        nodes[index].linked = true;
    }

    fn link_only(&mut self, nodes: &mut [Node], index: usize) {
        nodes[index].next = None;
        nodes[index].prev = None;
        self.first = Some(index);
        self.last = Some(index);
        self.size = 1;
    }
}

/// Index iterator over a list. Bounded by the list size so a corrupted
/// cycle cannot spin forever.
pub struct Iter<'a> {
    nodes: &'a [Node],
    cursor: Option<usize>,
    remaining: usize,
    forward: bool,
}

impl Iterator for Iter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        let current = self.cursor?;
        self.remaining -= 1;
        self.cursor = if self.forward {
            self.nodes[current].next
        } else {
            self.nodes[current].prev
        };
        Some(current)
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
