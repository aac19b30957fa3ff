// Copyright 2026 larder Project Authors
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

//! A doubly linked list backed by a slab, addressed with generation-checked tokens.
//!
//! A [`Token`] stays valid while other nodes are inserted or removed. Removing a node invalidates its own token
//! only: a later `remove` with the old token is a no-op, even if the slot has been reused by a new node.

/// Stable handle to a node of an [`EvictionQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct Node<T> {
    val: T,

    prev: Option<u32>,
    next: Option<u32>,
}

#[derive(Debug)]
enum Slot<T> {
    Occupied { node: Node<T>, generation: u32 },
    Vacant { next_free: Option<u32>, generation: u32 },
}

/// LRU order of idle cache elements. The front is the most recently used end.
#[derive(Debug)]
pub struct EvictionQueue<T> {
    slots: Vec<Slot<T>>,
    free: Option<u32>,

    head: Option<u32>,
    tail: Option<u32>,

    len: usize,
}

impl<T> Default for EvictionQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EvictionQueue<T> {
    /// Create an empty queue.
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: None,
            head: None,
            tail: None,
            len: 0,
        }
    }

    /// Create an empty queue with preallocated slots.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            ..Self::new()
        }
    }

    /// Number of linked nodes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if no node is linked.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Link a value at the front (most recently used end).
    pub fn push_front(&mut self, val: T) -> Token {
        let index = self.alloc(val);
        self.link_front(index);
        self.token_of(index)
    }

    /// Link a value at the back (least recently used end).
    pub fn push_back(&mut self, val: T) -> Token {
        let index = self.alloc(val);
        self.link_back(index);
        self.token_of(index)
    }

    /// Unlink the front value.
    pub fn pop_front(&mut self) -> Option<T> {
        let index = self.head?;
        self.unlink(index);
        Some(self.release(index))
    }

    /// Unlink the back value.
    pub fn pop_back(&mut self) -> Option<T> {
        let index = self.tail?;
        self.unlink(index);
        Some(self.release(index))
    }

    /// Reference to the front value.
    pub fn front(&self) -> Option<&T> {
        self.head.map(|index| &self.node(index).val)
    }

    /// Reference to the back value.
    pub fn back(&self) -> Option<&T> {
        self.tail.map(|index| &self.node(index).val)
    }

    /// Reference to the value of a token, `None` if the token has been invalidated.
    pub fn get(&self, token: Token) -> Option<&T> {
        self.resolve(token).map(|index| &self.node(index).val)
    }

    /// Returns `true` if the token still refers to a linked node.
    pub fn contains(&self, token: Token) -> bool {
        self.resolve(token).is_some()
    }

    /// Unlink the node of a token.
    ///
    /// Returns `None` without touching the queue if the token has already been invalidated.
    pub fn remove(&mut self, token: Token) -> Option<T> {
        let index = self.resolve(token)?;
        self.unlink(index);
        Some(self.release(index))
    }

    /// Relink the node of a token at the front. The token stays valid.
    ///
    /// Returns `false` if the token has been invalidated.
    pub fn move_to_front(&mut self, token: Token) -> bool {
        let Some(index) = self.resolve(token) else {
            return false;
        };
        if self.head != Some(index) {
            self.unlink(index);
            self.link_front(index);
        }
        true
    }

    /// Token of the front node.
    pub fn front_token(&self) -> Option<Token> {
        self.head.map(|index| self.token_of(index))
    }

    /// Token of the back node.
    pub fn back_token(&self) -> Option<Token> {
        self.tail.map(|index| self.token_of(index))
    }

    /// Token of the node after the given one, towards the back.
    pub fn next_token(&self, token: Token) -> Option<Token> {
        let index = self.resolve(token)?;
        self.node(index).next.map(|next| self.token_of(next))
    }

    /// Token of the node before the given one, towards the front.
    pub fn prev_token(&self, token: Token) -> Option<Token> {
        let index = self.resolve(token)?;
        self.node(index).prev.map(|prev| self.token_of(prev))
    }

    /// Iterate from the front (most recently used) to the back (least recently used).
    ///
    /// Use `.rev()` for the reverse order.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            queue: self,
            front: self.head,
            back: self.tail,
            remaining: self.len,
        }
    }

    /// Unlink all nodes and reset the slab.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.free = None;
        self.head = None;
        self.tail = None;
        self.len = 0;
    }

    fn alloc(&mut self, val: T) -> u32 {
        let node = Node {
            val,
            prev: None,
            next: None,
        };
        self.len += 1;
        match self.free {
            Some(index) => {
                let generation = match self.slots[index as usize] {
                    Slot::Vacant { next_free, generation } => {
                        self.free = next_free;
                        generation
                    }
                    Slot::Occupied { .. } => unreachable!("free list points to an occupied slot"),
                };
                self.slots[index as usize] = Slot::Occupied { node, generation };
                index
            }
            None => {
                self.slots.push(Slot::Occupied { node, generation: 0 });
                (self.slots.len() - 1) as u32
            }
        }
    }

    fn release(&mut self, index: u32) -> T {
        let generation = match &self.slots[index as usize] {
            Slot::Occupied { generation, .. } => *generation,
            Slot::Vacant { .. } => unreachable!("release a vacant slot"),
        };
        let slot = std::mem::replace(
            &mut self.slots[index as usize],
            Slot::Vacant {
                next_free: self.free,
                generation: generation.wrapping_add(1),
            },
        );
        self.free = Some(index);
        self.len -= 1;
        match slot {
            Slot::Occupied { node, .. } => node.val,
            Slot::Vacant { .. } => unreachable!(),
        }
    }

    fn resolve(&self, token: Token) -> Option<u32> {
        match self.slots.get(token.index as usize) {
            Some(Slot::Occupied { generation, .. }) if *generation == token.generation => Some(token.index),
            _ => None,
        }
    }

    fn token_of(&self, index: u32) -> Token {
        let generation = match &self.slots[index as usize] {
            Slot::Occupied { generation, .. } => *generation,
            Slot::Vacant { .. } => unreachable!("token of a vacant slot"),
        };
        Token { index, generation }
    }

    fn node(&self, index: u32) -> &Node<T> {
        match &self.slots[index as usize] {
            Slot::Occupied { node, .. } => node,
            Slot::Vacant { .. } => unreachable!("access a vacant slot"),
        }
    }

    fn node_mut(&mut self, index: u32) -> &mut Node<T> {
        match &mut self.slots[index as usize] {
            Slot::Occupied { node, .. } => node,
            Slot::Vacant { .. } => unreachable!("access a vacant slot"),
        }
    }

    fn link_front(&mut self, index: u32) {
        let head = self.head;
        {
            let node = self.node_mut(index);
            node.prev = None;
            node.next = head;
        }
        match head {
            Some(head) => self.node_mut(head).prev = Some(index),
            None => self.tail = Some(index),
        }
        self.head = Some(index);
    }

    fn link_back(&mut self, index: u32) {
        let tail = self.tail;
        {
            let node = self.node_mut(index);
            node.prev = tail;
            node.next = None;
        }
        match tail {
            Some(tail) => self.node_mut(tail).next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
    }

    fn unlink(&mut self, index: u32) {
        let (prev, next) = {
            let node = self.node_mut(index);
            (node.prev.take(), node.next.take())
        };
        match prev {
            Some(prev) => self.node_mut(prev).next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.node_mut(next).prev = prev,
            None => self.tail = prev,
        }
    }
}

/// Iterator over an [`EvictionQueue`].
pub struct Iter<'a, T> {
    queue: &'a EvictionQueue<T>,
    front: Option<u32>,
    back: Option<u32>,
    remaining: usize,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let index = self.front?;
        let node = self.queue.node(index);
        self.front = node.next;
        self.remaining -= 1;
        Some(&node.val)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<T> DoubleEndedIterator for Iter<'_, T> {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let index = self.back?;
        let node = self.queue.node(index);
        self.back = node.prev;
        self.remaining -= 1;
        Some(&node.val)
    }
}

impl<T> ExactSizeIterator for Iter<'_, T> {}
