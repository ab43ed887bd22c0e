// Copyright 2026 flashkv Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Doubly-linked lists threaded through the slab handle table.
//!
//! Nodes are addressed by index instead of pointer, so unlinking from the middle of a list is a pair of table
//! updates.

/// Intrusive link embedded in every node.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    pub prev: Option<usize>,
    pub next: Option<usize>,
    pub is_linked: bool,
}

/// Selector of the all-entries LRU list.
pub const LRU: usize = 0;
/// Selector of the modified-only LRU list.
pub const MODLRU: usize = 1;

/// Node table the lists operate on. A node carries one link per list selector.
pub trait Nodes<const L: usize> {
    fn link(&self, index: usize) -> &Link;

    fn link_mut(&mut self, index: usize) -> &mut Link;
}

#[derive(Debug, Default)]
pub struct IndexList<const L: usize> {
    head: Option<usize>,
    tail: Option<usize>,

    len: usize,
}

impl<const L: usize> IndexList<L> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn head(&self) -> Option<usize> {
        self.head
    }

    pub fn tail(&self) -> Option<usize> {
        self.tail
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push_front(&mut self, nodes: &mut impl Nodes<L>, index: usize) {
        debug_assert!(!nodes.link(index).is_linked);

        let head = self.head;
        *nodes.link_mut(index) = Link {
            prev: None,
            next: head,
            is_linked: true,
        };
        match head {
            Some(head) => nodes.link_mut(head).prev = Some(index),
            None => self.tail = Some(index),
        }
        self.head = Some(index);
        self.len += 1;
    }

    /// Unlink `index`. Unlinking a node that is not linked is a no-op.
    pub fn remove(&mut self, nodes: &mut impl Nodes<L>, index: usize) {
        let link = *nodes.link(index);
        if !link.is_linked {
            return;
        }

        match link.prev {
            Some(prev) => nodes.link_mut(prev).next = link.next,
            None => self.head = link.next,
        }
        match link.next {
            Some(next) => nodes.link_mut(next).prev = link.prev,
            None => self.tail = link.prev,
        }
        *nodes.link_mut(index) = Link::default();
        self.len -= 1;
    }

    /// Move `index` to the head, inserting it if it is not linked yet.
    pub fn move_to_front(&mut self, nodes: &mut impl Nodes<L>, index: usize) {
        if self.head == Some(index) {
            return;
        }
        self.remove(nodes, index);
        self.push_front(nodes, index);
    }

    /// Iterate from head to tail. The walk stops after `limit` nodes to survive a corrupted cycle.
    pub fn iter<'a, N: Nodes<L>>(&self, nodes: &'a N, limit: usize) -> impl Iterator<Item = usize> + 'a {
        std::iter::successors(self.head, move |&i| nodes.link(i).next).take(limit)
    }

    /// Iterate from tail to head. The walk stops after `limit` nodes to survive a corrupted cycle.
    pub fn iter_rev<'a, N: Nodes<L>>(&self, nodes: &'a N, limit: usize) -> impl Iterator<Item = usize> + 'a {
        std::iter::successors(self.tail, move |&i| nodes.link(i).prev).take(limit)
    }
}
