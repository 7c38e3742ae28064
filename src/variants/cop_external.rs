//! Balanced external red-black tree on top of the lookup-verification core
//! (SPEC_FULL.md §4.3), grounded on `rbt_links_bu_ext_cop.c`: the same
//! traverse/verify-under-transaction mechanism as [`super::bst_cop_external`],
//! plus a bottom-up CLRS-style insert/delete fixup run once the structural
//! change has been made (still inside the same transaction or, on the
//! fallback path, still under the global lock).

use std::cell::Cell;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::algebra::{is_black, is_red, Color, Links, RbLinks};
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
    color: Cell<Color>,
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
            color: Cell::new(Color::Black),
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

impl RbLinks for Node {
    fn color(&self) -> Color {
        self.color.get()
    }
    fn set_color(&self, c: Color) {
        self.color.set(c)
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

/// Parent-pointer-maintaining left rotation (`rbt_rotate_left`): unlike
/// [`crate::algebra::rotate_single`], this one also re-homes `parent` links
/// and reattaches the result into whichever slot `x` used to occupy.
fn rotate_left(arena: &Arena<Node>, root_cell: &AtomicU32, x: NodeId) {
    let xn = arena.get(x);
    let y = xn.child(Dir::Right);
    let yn = arena.get(y);
    let y_left = yn.child(Dir::Left);

    xn.set_child(Dir::Right, y_left);
    if !is_nil(y_left) {
        arena.get(y_left).set_parent(x);
    }

    let x_parent = xn.parent();
    yn.set_parent(x_parent);
    if is_nil(x_parent) {
        root_cell.store(y, Ordering::Release);
    } else {
        let p = arena.get(x_parent);
        if p.child(Dir::Left) == x {
            p.set_child(Dir::Left, y);
        } else {
            p.set_child(Dir::Right, y);
        }
    }

    yn.set_child(Dir::Left, x);
    xn.set_parent(y);
}

fn rotate_right(arena: &Arena<Node>, root_cell: &AtomicU32, y: NodeId) {
    let yn = arena.get(y);
    let x = yn.child(Dir::Left);
    let xn = arena.get(x);
    let x_right = xn.child(Dir::Right);

    yn.set_child(Dir::Left, x_right);
    if !is_nil(x_right) {
        arena.get(x_right).set_parent(y);
    }

    let y_parent = yn.parent();
    xn.set_parent(y_parent);
    if is_nil(y_parent) {
        root_cell.store(x, Ordering::Release);
    } else {
        let p = arena.get(y_parent);
        if p.child(Dir::Right) == y {
            p.set_child(Dir::Right, x);
        } else {
            p.set_child(Dir::Left, x);
        }
    }

    xn.set_child(Dir::Right, y);
    yn.set_parent(x);
}

/// `rbt_insert_fixup`: `z` is the freshly-created internal (red) node.
fn insert_fixup(arena: &Arena<Node>, root_cell: &AtomicU32, z0: NodeId) {
    let mut z = z0;
    loop {
        let parent = arena.get(z).parent();
        if is_nil(parent) || !is_red(arena, parent) {
            break;
        }
        let grandparent = arena.get(parent).parent();
        if parent == arena.get(grandparent).child(Dir::Left) {
            let y = arena.get(grandparent).child(Dir::Right);
            if is_red(arena, y) {
                arena.get(parent).set_color(Color::Black);
                arena.get(y).set_color(Color::Black);
                arena.get(grandparent).set_color(Color::Red);
                z = grandparent;
            } else {
                if z == arena.get(parent).child(Dir::Right) {
                    z = parent;
                    rotate_left(arena, root_cell, z);
                }
                let parent = arena.get(z).parent();
                let grandparent = arena.get(parent).parent();
                arena.get(parent).set_color(Color::Black);
                arena.get(grandparent).set_color(Color::Red);
                rotate_right(arena, root_cell, grandparent);
            }
        } else {
            let y = arena.get(grandparent).child(Dir::Left);
            if is_red(arena, y) {
                arena.get(parent).set_color(Color::Black);
                arena.get(y).set_color(Color::Black);
                arena.get(grandparent).set_color(Color::Red);
                z = grandparent;
            } else {
                if z == arena.get(parent).child(Dir::Left) {
                    z = parent;
                    rotate_right(arena, root_cell, z);
                }
                let parent = arena.get(z).parent();
                let grandparent = arena.get(parent).parent();
                arena.get(parent).set_color(Color::Black);
                arena.get(grandparent).set_color(Color::Red);
                rotate_left(arena, root_cell, grandparent);
            }
        }
    }
    let root = root_cell.load(Ordering::Acquire);
    if is_red(arena, root) {
        arena.get(root).set_color(Color::Black);
    }
}

/// `rbt_delete_fixup`: `x` is the node that took the removed subtree's
/// place (always a real node here -- external trees never need a sentinel).
fn delete_fixup(arena: &Arena<Node>, root_cell: &AtomicU32, x0: NodeId) {
    let mut x = x0;
    loop {
        let root = root_cell.load(Ordering::Acquire);
        if x == root || is_red(arena, x) {
            break;
        }
        let parent = arena.get(x).parent();
        if x == arena.get(parent).child(Dir::Left) {
            let mut w = arena.get(parent).child(Dir::Right);
            if is_red(arena, w) {
                arena.get(w).set_color(Color::Black);
                arena.get(parent).set_color(Color::Red);
                rotate_left(arena, root_cell, parent);
                w = arena.get(parent).child(Dir::Right);
            }
            if is_black(arena, arena.get(w).child(Dir::Left)) && is_black(arena, arena.get(w).child(Dir::Right))
            {
                arena.get(w).set_color(Color::Red);
                x = parent;
            } else {
                if is_black(arena, arena.get(w).child(Dir::Right)) {
                    arena.get(arena.get(w).child(Dir::Left)).set_color(Color::Black);
                    arena.get(w).set_color(Color::Red);
                    rotate_right(arena, root_cell, w);
                    w = arena.get(parent).child(Dir::Right);
                }
                arena.get(w).set_color(arena.get(parent).color());
                arena.get(parent).set_color(Color::Black);
                arena.get(arena.get(w).child(Dir::Right)).set_color(Color::Black);
                rotate_left(arena, root_cell, parent);
                x = root_cell.load(Ordering::Acquire);
            }
        } else {
            let mut w = arena.get(parent).child(Dir::Left);
            if is_red(arena, w) {
                arena.get(w).set_color(Color::Black);
                arena.get(parent).set_color(Color::Red);
                rotate_right(arena, root_cell, parent);
                w = arena.get(parent).child(Dir::Left);
            }
            if is_black(arena, arena.get(w).child(Dir::Right)) && is_black(arena, arena.get(w).child(Dir::Left))
            {
                arena.get(w).set_color(Color::Red);
                x = parent;
            } else {
                if is_black(arena, arena.get(w).child(Dir::Left)) {
                    arena.get(arena.get(w).child(Dir::Right)).set_color(Color::Black);
                    arena.get(w).set_color(Color::Red);
                    rotate_left(arena, root_cell, w);
                    w = arena.get(parent).child(Dir::Left);
                }
                arena.get(w).set_color(arena.get(parent).color());
                arena.get(parent).set_color(Color::Black);
                arena.get(arena.get(w).child(Dir::Left)).set_color(Color::Black);
                rotate_right(arena, root_cell, parent);
                x = root_cell.load(Ordering::Acquire);
            }
        }
    }
    arena.get(x).set_color(Color::Black);
}

fn replace_external_node_rb(arena: &Arena<Node>, place: NodeId, new_left: NodeId, new_right: NodeId) {
    cop_common::replace_external_node(arena, place, new_left, new_right);
    arena.get(place).set_color(Color::Red);
    arena.get(new_left).set_color(Color::Black);
    arena.get(new_right).set_color(Color::Black);
}

/// Like [`cop_common::delete_leaf`], plus capturing the removed internal
/// node's color and kicking off [`delete_fixup`] when it was black.
fn delete_rb(
    arena: &Arena<Node>,
    root_cell: &AtomicU32,
    key: i32,
    z: NodeId,
) -> Option<(NodeId, NodeId)> {
    if is_nil(z) || arena.get(z).key() != key {
        return None;
    }
    let root = root_cell.load(Ordering::Acquire);
    if z == root {
        root_cell.store(NIL, Ordering::Release);
        arena.get(z).set_live(false);
        return Some((z, NIL));
    }

    let parent = arena.get(z).parent();
    let removed_color = arena.get(parent).color();
    let z_dir = if arena.get(parent).child(Dir::Left) == z {
        Dir::Left
    } else {
        Dir::Right
    };
    let sibling = arena.get(parent).child(z_dir.opp());

    if parent == root {
        root_cell.store(sibling, Ordering::Release);
        arena.get(sibling).set_parent(NIL);
    } else {
        let grandparent = arena.get(parent).parent();
        let parent_dir = if arena.get(grandparent).child(Dir::Left) == parent {
            Dir::Left
        } else {
            Dir::Right
        };
        arena.get(grandparent).set_child(parent_dir, sibling);
        arena.get(sibling).set_parent(grandparent);
    }

    let z_n = arena.get(z);
    let prev = z_n.prev();
    let succ = z_n.succ();
    if !is_nil(prev) {
        arena.get(prev).set_succ(succ);
    }
    if !is_nil(succ) {
        arena.get(succ).set_prev(prev);
    }
    z_n.set_live(false);
    arena.get(parent).set_live(false);

    if removed_color == Color::Black {
        delete_fixup(arena, root_cell, sibling);
    }

    Some((parent, z))
}

pub struct CopExternal {
    arena: Arena<Node>,
    root: AtomicU32,
    global_lock: Spinlock,
}

// SAFETY: same argument as `BstCopExternal` -- all mutation happens either
// inside a committed hardware transaction or under `global_lock`.
unsafe impl Sync for CopExternal {}

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

impl CopExternal {
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
                self.arena.get(new_left).set_color(Color::Black);
                return true;
            }
            if self.arena.get(place).key() == key {
                return false;
            }
            replace_external_node_rb(&self.arena, place, new_left, new_right);
            insert_fixup(&self.arena, &self.root, place);
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
            Some(delete_rb(&self.arena, &self.root, key, place).is_some())
        };
        let serial_body = || {
            let root = self.root.load(Ordering::Acquire);
            if is_nil(root) {
                return false;
            }
            let place = cop_common::traverse(&self.arena, root, key);
            delete_rb(&self.arena, &self.root, key, place).is_some()
        };
        run_with_retry(&self.global_lock, stats, tx_body, serial_body)
    }
}

impl ConcurrentOrderedMap for CopExternal {
    type Td = Td;

    fn new(capacity: usize) -> Self {
        CopExternal {
            arena: Arena::with_capacity(capacity),
            root: AtomicU32::new(NIL),
            global_lock: Spinlock::new(),
        }
    }

    fn name() -> &'static str {
        "rbt-links-bu-ext-cop"
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
        validate_rec(&self.arena, root, i32::MIN, i32::MAX).is_some()
    }
}

/// Returns the black-height of the subtree if it's a valid BST with no two
/// consecutive red nodes, `None` on any violation.
fn validate_rec(arena: &Arena<Node>, id: NodeId, lo: i32, hi: i32) -> Option<u32> {
    let n = arena.get(id);
    let left = n.child(Dir::Left);
    let right = n.child(Dir::Right);
    if is_nil(left) != is_nil(right) {
        return None;
    }
    if is_nil(left) {
        if n.key() < lo || n.key() > hi {
            return None;
        }
        return Some(1);
    }
    if is_red(arena, id) && (is_red(arena, left) || is_red(arena, right)) {
        return None;
    }
    let bh_left = validate_rec(arena, left, lo, n.key().saturating_sub(1))?;
    let bh_right = validate_rec(arena, right, n.key(), hi)?;
    if bh_left != bh_right {
        return None;
    }
    Some(bh_left + if is_black(arena, id) { 1 } else { 0 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_threaded_insert_lookup_delete_stays_balanced() {
        let tree = CopExternal::new(4096);
        let mut td = CopExternal::thread_data_new(0);

        for k in 0..64 {
            assert!(tree.insert(&mut td, k, k as usize));
        }
        assert!(tree.validate());
        for k in 0..64 {
            assert!(tree.lookup(&mut td, k));
        }
        for k in (0..64).step_by(2) {
            assert!(tree.delete(&mut td, k));
        }
        assert!(tree.validate());
        for k in 0..64 {
            assert_eq!(tree.lookup(&mut td, k), k % 2 == 1);
        }
    }

    #[test]
    fn duplicate_insert_rejected() {
        let tree = CopExternal::new(64);
        let mut td = CopExternal::thread_data_new(0);
        assert!(tree.insert(&mut td, 1, 1));
        assert!(!tree.insert(&mut td, 1, 2));
    }
}
