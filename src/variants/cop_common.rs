//! Shared machinery for the lookup-verification (COP) family (SPEC_FULL.md
//! §4.3): an asynchronous top-down traversal to an external leaf, followed
//! by a short transactional (or lock-held) re-validation of just that leaf
//! and its `prev`/`succ` neighbors. Grounded directly on
//! `bst-cop-external.c`'s `_traverse`/`_lookup_verify`/`replace_external_node`
//! and mirrored near-verbatim in `rbt_links_bu_ext_cop.c` -- the two
//! variants in this crate differ only in whether a rebalance runs after the
//! structural change, which is why that step is left to each variant module
//! rather than folded in here.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::algebra::Links;
use crate::arena::{is_nil, Arena, Dir, NodeId, NIL};

/// Node contract shared by both external-tree COP variants. Extends
/// [`Links`] (child/set_child) rather than redeclaring it, so a node type
/// that also needs red-black coloring (`RbLinks`) doesn't end up with two
/// same-named, ambiguous `child` methods. `is_leaf` is derived (both
/// children nil), matching `IS_EXTERNAL_NODE` in the source.
pub trait CopNode: Links {
    fn key(&self) -> i32;
    fn set_key(&self, key: i32);
    fn parent(&self) -> NodeId;
    fn set_parent(&self, id: NodeId);
    fn prev(&self) -> NodeId;
    fn set_prev(&self, id: NodeId);
    fn succ(&self) -> NodeId;
    fn set_succ(&self, id: NodeId);
    fn live(&self) -> bool;
    fn set_live(&self, live: bool);
}

#[inline]
pub fn is_external<T: CopNode>(arena: &Arena<T>, id: NodeId) -> bool {
    let n = arena.get(id);
    is_nil(n.child(Dir::Left)) && is_nil(n.child(Dir::Right))
}

/// Walks from `root` to the leaf that holds `key`, or the leaf whose slot
/// `key` would occupy. Never touches a lock; may observe a torn tree being
/// concurrently mutated, which is exactly what the verification step after
/// this call exists to catch.
pub fn traverse<T: CopNode>(arena: &Arena<T>, root: NodeId, key: i32) -> NodeId {
    let mut curr = root;
    while !is_nil(curr) && !is_external(arena, curr) {
        let n = arena.get(curr);
        curr = if key <= n.key() {
            n.child(Dir::Left)
        } else {
            n.child(Dir::Right)
        };
    }
    curr
}

/// `_lookup_verify`: `None` means "abort, the snapshot is stale" -- either
/// the leaf was concurrently removed/replaced, or `key` has drifted outside
/// the ordering the leaf's neighbors still promise.
pub fn verify_leaf<T: CopNode>(arena: &Arena<T>, place: NodeId, key: i32) -> Option<()> {
    if is_nil(place) {
        return None;
    }
    let n = arena.get(place);
    if !n.live() || !is_external(arena, place) {
        return None;
    }
    if n.key() == key {
        return Some(());
    }
    if key < n.key() {
        let prev = n.prev();
        if !is_nil(prev) && key <= arena.get(prev).key() {
            return None;
        }
    } else {
        let succ = n.succ();
        if !is_nil(succ) && key >= arena.get(succ).key() {
            return None;
        }
    }
    Some(())
}

/// Splits the external node `place` into an internal routing node (reusing
/// `place`'s slot) with two fresh external children `new_left`/`new_right`,
/// both of which the caller must have allocated holding `new_key`. Mirrors
/// `replace_external_node`: whichever of `place`'s old key / `new_key` is
/// smaller ends up on the left, and relinks the ordered-leaf chain.
pub fn replace_external_node<T: CopNode>(
    arena: &Arena<T>,
    place: NodeId,
    new_left: NodeId,
    new_right: NodeId,
) {
    let place_n = arena.get(place);
    let old_key = place_n.key();

    if old_key > arena.get(new_left).key() {
        arena.get(new_right).set_key(old_key);
        place_n.set_key(arena.get(new_left).key());
    } else {
        arena.get(new_left).set_key(old_key);
    }

    arena.get(new_left).set_live(true);
    arena.get(new_right).set_live(true);
    arena.get(new_left).set_parent(place);
    arena.get(new_right).set_parent(place);

    let old_prev = place_n.prev();
    let old_succ = place_n.succ();
    if !is_nil(old_prev) {
        arena.get(old_prev).set_succ(new_left);
    }
    if !is_nil(old_succ) {
        arena.get(old_succ).set_prev(new_right);
    }
    arena.get(new_left).set_prev(old_prev);
    arena.get(new_left).set_succ(new_right);
    arena.get(new_right).set_prev(new_left);
    arena.get(new_right).set_succ(old_succ);
    place_n.set_prev(NIL);
    place_n.set_succ(NIL);

    place_n.set_child(Dir::Left, new_left);
    place_n.set_child(Dir::Right, new_right);
}

/// Unlinks leaf `z` (holding `key`) and its parent, replacing both with `z`'s
/// sibling in the grandparent (or becoming the new root). Returns the ids of
/// the two nodes that left the tree (internal, leaf) so the caller can
/// retire them, or `None` if `z` doesn't actually hold `key` (lost race /
/// already gone). Mirrors `_delete`, unifying its left/right branches.
pub fn delete_leaf<T: CopNode>(
    arena: &Arena<T>,
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
    let parent_n = arena.get(parent);
    let z_dir = if parent_n.child(Dir::Left) == z {
        Dir::Left
    } else {
        Dir::Right
    };
    let sibling = parent_n.child(z_dir.opp());

    if parent == root {
        root_cell.store(sibling, Ordering::Release);
        arena.get(sibling).set_parent(NIL);
    } else {
        let grandparent = parent_n.parent();
        let gp = arena.get(grandparent);
        let parent_dir = if gp.child(Dir::Left) == parent {
            Dir::Left
        } else {
            Dir::Right
        };
        gp.set_child(parent_dir, sibling);
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
    parent_n.set_live(false);

    Some((parent, z))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct N {
        key: Cell<i32>,
        left: Cell<NodeId>,
        right: Cell<NodeId>,
        parent: Cell<NodeId>,
        prev: Cell<NodeId>,
        succ: Cell<NodeId>,
        live: Cell<bool>,
    }

    impl N {
        fn new(key: i32) -> Self {
            N {
                key: Cell::new(key),
                left: Cell::new(NIL),
                right: Cell::new(NIL),
                parent: Cell::new(NIL),
                prev: Cell::new(NIL),
                succ: Cell::new(NIL),
                live: Cell::new(false),
            }
        }
    }

    impl Links for N {
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

    impl CopNode for N {
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

    #[test]
    fn split_then_delete_restores_single_leaf() {
        let arena: Arena<N> = Arena::with_capacity(8);
        let root = arena.alloc(N::new(10));
        arena.get(root).set_live(true);
        let root_cell = AtomicU32::new(root);

        let left = arena.alloc(N::new(20));
        let right = arena.alloc(N::new(20));
        replace_external_node(&arena, root, left, right);
        assert!(is_external(&arena, left));
        assert!(is_external(&arena, right));
        assert_eq!(arena.get(root).key(), 10);
        assert_eq!(arena.get(right).key(), 20);

        let place = traverse(&arena, root_cell.load(Ordering::Acquire), 20);
        assert_eq!(place, right);
        assert!(verify_leaf(&arena, place, 20).is_some());

        let removed = delete_leaf(&arena, &root_cell, 20, right).unwrap();
        assert_eq!(removed, (root, right));
        assert_eq!(root_cell.load(Ordering::Acquire), left);
        assert_eq!(arena.get(left).parent(), NIL);
    }

    #[test]
    fn verify_rejects_dead_leaf() {
        let arena: Arena<N> = Arena::with_capacity(4);
        let n = arena.alloc(N::new(5));
        assert!(verify_leaf(&arena, n, 5).is_none());
    }
}
