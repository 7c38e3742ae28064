//! Unbalanced external BST with lookup-verification concurrency control
//! (SPEC_FULL.md §4.3). Grounded directly on `bst-cop-external.c`: no
//! rebalancing ever runs, so this is the lookup-verification core in its
//! simplest form -- useful as a baseline for what the COP mechanism itself
//! costs, separate from whatever a rebalancer adds on top.

use std::cell::Cell;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::algebra::Links;
use crate::arena::{is_nil, Arena, Dir, NodeId, NIL};
use crate::htm::run_with_retry;
use crate::map::{ConcurrentOrderedMap, ThreadData};
use crate::spinlock::Spinlock;
use crate::stats::{AbortStats, OpCounts};

use super::cop_common::{self, CopNode};

#[repr(align(64))]
struct Node {
    key: Cell<i32>,
    left: Cell<NodeId>,
    right: Cell<NodeId>,
    parent: Cell<NodeId>,
    prev: Cell<NodeId>,
    succ: Cell<NodeId>,
    live: Cell<bool>,
    value: Cell<usize>,
}

impl Node {
    fn new(key: i32, value: usize) -> Self {
        Node {
            key: Cell::new(key),
            left: Cell::new(NIL),
            right: Cell::new(NIL),
            parent: Cell::new(NIL),
            prev: Cell::new(NIL),
            succ: Cell::new(NIL),
            live: Cell::new(false),
            value: Cell::new(value),
        }
    }
}

impl Links for Node {
    fn child(&self, dir: Dir) -> NodeId {
        match dir {
            Dir::Left => self.left.get(),
            Dir::Right => self.right.get(),
        }
    }
    fn set_child(&self, dir: Dir, id: NodeId) {
        match dir {
            Dir::Left => self.left.set(id),
            Dir::Right => self.right.set(id),
        }
    }
}

impl CopNode for Node {
    fn key(&self) -> i32 {
        self.key.get()
    }
    fn set_key(&self, key: i32) {
        self.key.set(key)
    }
    fn parent(&self) -> NodeId {
        self.parent.get()
    }
    fn set_parent(&self, id: NodeId) {
        self.parent.set(id)
    }
    fn prev(&self) -> NodeId {
        self.prev.get()
    }
    fn set_prev(&self, id: NodeId) {
        self.prev.set(id)
    }
    fn succ(&self) -> NodeId {
        self.succ.get()
    }
    fn set_succ(&self, id: NodeId) {
        self.succ.set(id)
    }
    fn live(&self) -> bool {
        self.live.get()
    }
    fn set_live(&self, live: bool) {
        self.live.set(live)
    }
}

pub struct BstCopExternal {
    arena: Arena<Node>,
    root: AtomicU32,
    global_lock: Spinlock,
}

// SAFETY: the arena is `Sync`, `root`/`global_lock` are atomics; every
// mutation a thread performs on a node is either made under `global_lock`
// (fallback path) or inside a hardware transaction whose effects only
// become visible at commit.
unsafe impl Sync for BstCopExternal {}

pub struct Td {
    pub tid: i32,
    pub ops: OpCounts,
    pub aborts: AbortStats,
}

impl ThreadData for Td {
    fn new(tid: i32) -> Self {
        Td {
            tid,
            ops: OpCounts::default(),
            aborts: AbortStats::default(),
        }
    }

    fn print(&self, out: &mut dyn std::fmt::Write) {
        let _ = writeln!(
            out,
            "TID {:3}: ops={} tx_starts={} aborts={} lock_acqs={}",
            self.tid,
            self.ops.total_performed(),
            self.aborts.tx_starts,
            self.aborts.total_aborts(),
            self.aborts.fallback_lock_acquisitions
        );
    }

    fn merge(&self, other: &Self) -> Self {
        Td {
            tid: -1,
            ops: self.ops.merge(&other.ops),
            aborts: self.aborts.merge(&other.aborts),
        }
    }

    fn op_counts(&self) -> crate::stats::OpCounts {
        self.ops
    }
}

impl BstCopExternal {
    fn lookup_inner(&self, stats: &mut AbortStats, key: i32) -> bool {
        if is_nil(self.root.load(Ordering::Acquire)) {
            return false;
        }
        let tx_body = || -> Option<bool> {
            let root = self.root.load(Ordering::Acquire);
            if is_nil(root) {
                return Some(false);
            }
            let place = cop_common::traverse(&self.arena, root, key);
            cop_common::verify_leaf(&self.arena, place, key)?;
            Some(self.arena.get(place).key() == key)
        };
        let serial_body = || {
            let root = self.root.load(Ordering::Acquire);
            if is_nil(root) {
                return false;
            }
            let place = cop_common::traverse(&self.arena, root, key);
            !is_nil(place) && self.arena.get(place).key() == key
        };
        run_with_retry(&self.global_lock, stats, tx_body, serial_body)
    }

    fn insert_inner(&self, stats: &mut AbortStats, key: i32, value: usize) -> bool {
        let new_left = self.arena.alloc(Node::new(key, value));
        let new_right = self.arena.alloc(Node::new(key, value));

        let do_insert = |place: NodeId| -> bool {
            if is_nil(place) {
                self.root.store(new_left, Ordering::Release);
                self.arena.get(new_left).set_live(true);
                return true;
            }
            if self.arena.get(place).key() == key {
                return false;
            }
            cop_common::replace_external_node(&self.arena, place, new_left, new_right);
            true
        };

        let tx_body = || -> Option<bool> {
            let root = self.root.load(Ordering::Acquire);
            let place = cop_common::traverse(&self.arena, root, key);
            if !is_nil(place) {
                cop_common::verify_leaf(&self.arena, place, key)?;
            }
            Some(do_insert(place))
        };
        let serial_body = || {
            let root = self.root.load(Ordering::Acquire);
            let place = cop_common::traverse(&self.arena, root, key);
            do_insert(place)
        };
        run_with_retry(&self.global_lock, stats, tx_body, serial_body)
    }

    fn delete_inner(&self, stats: &mut AbortStats, key: i32) -> bool {
        let tx_body = || -> Option<bool> {
            let root = self.root.load(Ordering::Acquire);
            if is_nil(root) {
                return Some(false);
            }
            let place = cop_common::traverse(&self.arena, root, key);
            cop_common::verify_leaf(&self.arena, place, key)?;
            Some(cop_common::delete_leaf(&self.arena, &self.root, key, place).is_some())
        };
        let serial_body = || {
            let root = self.root.load(Ordering::Acquire);
            if is_nil(root) {
                return false;
            }
            let place = cop_common::traverse(&self.arena, root, key);
            cop_common::delete_leaf(&self.arena, &self.root, key, place).is_some()
        };
        run_with_retry(&self.global_lock, stats, tx_body, serial_body)
    }
}

impl ConcurrentOrderedMap for BstCopExternal {
    type Td = Td;

    fn new(capacity: usize) -> Self {
        BstCopExternal {
            arena: Arena::with_capacity(capacity),
            root: AtomicU32::new(NIL),
            global_lock: Spinlock::new(),
        }
    }

    fn name() -> &'static str {
        "bst-cop-external"
    }

    fn lookup(&self, td: &mut Self::Td, key: i32) -> bool {
        td.ops.lookup_performed += 1;
        let found = self.lookup_inner(&mut td.aborts, key);
        if found {
            td.ops.lookup_succeeded += 1;
        }
        found
    }

    fn insert(&self, td: &mut Self::Td, key: i32, value: usize) -> bool {
        td.ops.insert_performed += 1;
        let ok = self.insert_inner(&mut td.aborts, key, value);
        if ok {
            td.ops.insert_succeeded += 1;
        }
        ok
    }

    fn delete(&self, td: &mut Self::Td, key: i32) -> bool {
        td.ops.delete_performed += 1;
        let ok = self.delete_inner(&mut td.aborts, key);
        if ok {
            td.ops.delete_succeeded += 1;
        }
        ok
    }

    fn validate(&self) -> bool {
        let root = self.root.load(Ordering::Acquire);
        if is_nil(root) {
            return true;
        }
        validate_bst(&self.arena, root, i32::MIN, i32::MAX)
    }
}

fn validate_bst(arena: &Arena<Node>, id: NodeId, lo: i32, hi: i32) -> bool {
    let n = arena.get(id);
    let left = n.child(Dir::Left);
    let right = n.child(Dir::Right);
    if is_nil(left) != is_nil(right) {
        return false;
    }
    if is_nil(left) {
        return n.key() >= lo && n.key() <= hi;
    }
    validate_bst(arena, left, lo, n.key().saturating_sub(1))
        && validate_bst(arena, right, n.key(), hi)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_threaded_insert_lookup_delete() {
        let tree = BstCopExternal::new(1024);
        let mut td = BstCopExternal::thread_data_new(0);

        assert!(!tree.lookup(&mut td, 10));
        assert!(tree.insert(&mut td, 10, 100));
        assert!(!tree.insert(&mut td, 10, 999));
        assert!(tree.lookup(&mut td, 10));

        for k in [5, 20, 1, 15] {
            assert!(tree.insert(&mut td, k, k as usize));
        }
        assert!(tree.validate());

        assert!(tree.delete(&mut td, 10));
        assert!(!tree.lookup(&mut td, 10));
        assert!(!tree.delete(&mut td, 10));
        assert!(tree.validate());
    }

    #[test]
    fn delete_draining_to_empty_tree_then_reinsert() {
        let tree = BstCopExternal::new(64);
        let mut td = BstCopExternal::thread_data_new(0);
        for k in 0..8 {
            assert!(tree.insert(&mut td, k, k as usize));
        }
        for k in 0..8 {
            assert!(tree.delete(&mut td, k));
        }
        assert!(!tree.lookup(&mut td, 3));
        assert!(tree.insert(&mut td, 3, 3));
        assert!(tree.lookup(&mut td, 3));
    }
}
