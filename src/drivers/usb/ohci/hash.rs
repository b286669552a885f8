//! Completion index
//!
//! The done list the controller writes back holds bare physical addresses.
//! These two hash tables map an address back to the TD or ITD that owns it.
//! Chains are intrusive: the link lives in the node's shadow state.

use super::arena::{Itd, ItdHandle, NodeHandle, NodeKind, Pool, Td, TdHandle};

/// Buckets per table
pub const HASH_SIZE: usize = 128;

#[inline]
fn bucket(phys: u32) -> usize {
    ((phys >> 4) as usize) % HASH_SIZE
}

/// Node kinds that can be found by physical address
pub trait Indexed: NodeKind {
    fn hash_next(soft: &Self::Soft) -> Option<NodeHandle<Self>>;
    fn set_hash_next(soft: &mut Self::Soft, next: Option<NodeHandle<Self>>);
}

impl Indexed for Td {
    fn hash_next(soft: &Self::Soft) -> Option<TdHandle> {
        soft.hash_next
    }

    fn set_hash_next(soft: &mut Self::Soft, next: Option<TdHandle>) {
        soft.hash_next = next;
    }
}

impl Indexed for Itd {
    fn hash_next(soft: &Self::Soft) -> Option<ItdHandle> {
        soft.hash_next
    }

    fn set_hash_next(soft: &mut Self::Soft, next: Option<ItdHandle>) {
        soft.hash_next = next;
    }
}

/// One address table
pub struct HashTable<K: Indexed> {
    buckets: [Option<NodeHandle<K>>; HASH_SIZE],
    len: usize,
}

impl<K: Indexed> HashTable<K> {
    pub const fn new() -> Self {
        Self {
            buckets: [None; HASH_SIZE],
            len: 0,
        }
    }

    /// Register a live node; must happen before it is linked for hardware
    pub fn insert(&mut self, pool: &mut Pool<K>, node: NodeHandle<K>) -> bool {
        let Some(phys) = pool.phys(node) else {
            log::error!("hash: insert of dead {:?}", node);
            return false;
        };
        let b = bucket(phys);
        let head = self.buckets[b];
        let Some(soft) = pool.get_mut(node) else {
            return false;
        };
        K::set_hash_next(soft, head);
        self.buckets[b] = Some(node);
        self.len += 1;
        true
    }

    /// Drop a node from its chain; must happen before it is released
    pub fn remove(&mut self, pool: &mut Pool<K>, node: NodeHandle<K>) -> bool {
        let Some(phys) = pool.phys(node) else {
            log::error!("hash: remove of dead {:?}", node);
            return false;
        };
        let b = bucket(phys);
        let Some(next) = pool.get(node).map(K::hash_next) else {
            return false;
        };

        if self.buckets[b] == Some(node) {
            self.buckets[b] = next;
            self.len -= 1;
            return true;
        }

        let mut cur = self.buckets[b];
        while let Some(h) = cur {
            let link = pool.get(h).and_then(K::hash_next);
            if link == Some(node) {
                if let Some(soft) = pool.get_mut(h) {
                    K::set_hash_next(soft, next);
                }
                self.len -= 1;
                return true;
            }
            cur = link;
        }
        log::warn!("hash: {:?} at {:#010x} was not indexed", node, phys);
        false
    }

    pub fn lookup(&self, pool: &Pool<K>, phys: u32) -> Option<NodeHandle<K>> {
        let mut cur = self.buckets[bucket(phys)];
        while let Some(h) = cur {
            if pool.phys(h) == Some(phys) {
                return Some(h);
            }
            cur = pool.get(h).and_then(K::hash_next);
        }
        None
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Forget every entry (the pool is being drained)
    pub fn clear(&mut self) {
        self.buckets = [None; HASH_SIZE];
        self.len = 0;
    }
}

impl<K: Indexed> Default for HashTable<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// What a done-list address resolved to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneNode {
    Td(TdHandle),
    Itd(ItdHandle),
}

/// TD and ITD address tables of one controller
#[derive(Default)]
pub struct CompletionIndex {
    pub tds: HashTable<Td>,
    pub itds: HashTable<Itd>,
}

impl CompletionIndex {
    pub const fn new() -> Self {
        Self {
            tds: HashTable::new(),
            itds: HashTable::new(),
        }
    }

    /// Resolve a done-list address, TDs first
    pub fn resolve(&self, tds: &Pool<Td>, itds: &Pool<Itd>, phys: u32) -> Option<DoneNode> {
        if let Some(h) = self.tds.lookup(tds, phys) {
            return Some(DoneNode::Td(h));
        }
        self.itds.lookup(itds, phys).map(DoneNode::Itd)
    }

    pub fn len(&self) -> usize {
        self.tds.len() + self.itds.len()
    }
}
