//! Concurrent doubly-linked list used as slot storage by the timing wheel.
//!
//! Nodes live in an arena (`Vec` slab with a free list) and are addressed by
//! stable indices, so relinking on removal is plain index surgery with no
//! ownership ambiguity between the list and its callers.
//!
//! Concurrency contract:
//! - `push_back` may be called by unlimited producers concurrently.
//! - `drain_filter` is single-consumer: at most one traversal-with-removal may
//!   be in flight at a time. This is a precondition, not something the type
//!   arbitrates at runtime; the timing wheel's driver is the sole consumer.

use std::sync::Mutex;

/// Stable index of a node inside a [`BucketList`] arena.
///
/// Valid until the node is removed by a traversal; after that the slot may be
/// reused for a later push.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeHandle(usize);

impl NodeHandle {
    #[inline]
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Visitor verdict for [`BucketList::drain_filter`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Visit {
    Keep,
    Remove,
}

struct Node<T> {
    value: T,
    prev: Option<usize>,
    next: Option<usize>,
}

struct Inner<T> {
    nodes: Vec<Option<Node<T>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl<T> Inner<T> {
    fn unlink(&mut self, index: usize) -> T {
        let node = self.nodes[index].take().unwrap();
        match node.prev {
            Some(prev) => self.nodes[prev].as_mut().unwrap().next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => self.nodes[next].as_mut().unwrap().prev = node.prev,
            None => self.tail = node.prev,
        }
        self.free.push(index);
        self.len -= 1;
        node.value
    }
}

/// Multi-producer, single-consumer doubly-linked list.
pub struct BucketList<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> BucketList<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                nodes: Vec::new(),
                free: Vec::new(),
                head: None,
                tail: None,
                len: 0,
            }),
        }
    }

    /// Append a value at the tail. O(1), safe under unlimited concurrent
    /// producers.
    pub fn push_back(&self, value: T) -> NodeHandle {
        let mut inner = self.inner.lock().unwrap();
        let prev = inner.tail;
        let node = Node {
            value,
            prev,
            next: None,
        };
        let index = match inner.free.pop() {
            Some(index) => {
                inner.nodes[index] = Some(node);
                index
            }
            None => {
                inner.nodes.push(Some(node));
                inner.nodes.len() - 1
            }
        };
        match prev {
            Some(prev) => inner.nodes[prev].as_mut().unwrap().next = Some(index),
            None => inner.head = Some(index),
        }
        inner.tail = Some(index);
        inner.len += 1;
        NodeHandle(index)
    }

    /// Traverse from tail toward head, removing nodes the visitor rejects.
    /// Removed values are returned in visit order.
    ///
    /// The tail is snapshotted up front, so every node present at start of
    /// call is visited exactly once; values pushed during the pass are newer
    /// than the snapshot and are not visited. The lock is reacquired per node
    /// rather than held for the whole pass, so producers can append while a
    /// long traversal is in flight. Walking backward over the snapshot is
    /// sound because producers only touch the tail side and the single
    /// consumer only unlinks the node it is currently visiting, never its
    /// predecessor.
    pub fn drain_filter(&self, mut visit: impl FnMut(&mut T) -> Visit) -> Vec<T> {
        let mut removed = Vec::new();
        let mut cursor = self.inner.lock().unwrap().tail;
        while let Some(index) = cursor {
            let mut inner = self.inner.lock().unwrap();
            let node = inner.nodes[index].as_mut().unwrap();
            let prev = node.prev;
            if let Visit::Remove = visit(&mut node.value) {
                removed.push(inner.unlink(index));
            }
            drop(inner);
            cursor = prev;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for BucketList<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Sharded variant of [`BucketList`].
///
/// Pushes are scattered across independent shards by random index, trading
/// exact FIFO order for reduced lock contention under high fan-in. Draining
/// runs the single-consumer pass over every shard in turn; the same
/// single-consumer discipline applies to the sharded list as a whole.
pub struct ShardedList<T> {
    shards: Box<[BucketList<T>]>,
}

impl<T> ShardedList<T> {
    pub fn new(shard_count: usize) -> Self {
        assert!(shard_count > 0, "shard_count must be positive");
        Self {
            shards: (0..shard_count).map(|_| BucketList::new()).collect(),
        }
    }

    pub fn push_back(&self, value: T) -> NodeHandle {
        use rand::Rng;
        let shard = rand::rng().random_range(0..self.shards.len());
        self.shards[shard].push_back(value)
    }

    pub fn drain_filter(&self, mut visit: impl FnMut(&mut T) -> Visit) -> Vec<T> {
        let mut removed = Vec::new();
        for shard in self.shards.iter() {
            removed.extend(shard.drain_filter(&mut visit));
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(BucketList::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
