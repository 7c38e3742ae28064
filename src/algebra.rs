//! Sequential tree algebra (SPEC_FULL.md §4.1): pure rotation and
//! rebalance primitives shared by every concurrent variant. None of these
//! functions take a lock or start a transaction -- callers must already
//! hold whatever exclusivity their variant provides over the nodes being
//! touched.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::arena::{is_nil, Arena, Dir, NodeId, NIL};

/// Child-link access, implemented by every node type in this crate.
/// Concrete implementations back `child`/`set_child` with atomics so that
/// `&self` is sufficient (the arena only ever hands out shared references).
pub trait Links: Sized {
    fn child(&self, dir: Dir) -> NodeId;
    fn set_child(&self, dir: Dir, id: NodeId);
}

pub trait HasKey {
    fn key(&self) -> i32;
}

pub trait AvlLinks: Links {
    fn height(&self) -> i32;
    fn set_height(&self, h: i32);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Color {
    Red,
    Black,
}

pub trait RbLinks: Links {
    fn color(&self) -> Color;
    fn set_color(&self, c: Color);
    #[inline]
    fn is_red(&self) -> bool {
        self.color() == Color::Red
    }
}

/// `rotate_single(n, dir)` (§4.1): structural rotation only, no
/// height/color bookkeeping -- the AVL/RB wrappers below add that.
/// Precondition: `n.child(dir.opp())` is non-nil.
pub fn rotate_single<T: Links>(arena: &Arena<T>, n: NodeId, dir: Dir) -> NodeId {
    let node = arena.get(n);
    let save_id = node.child(dir.opp());
    let save = arena.get(save_id);
    node.set_child(dir.opp(), save.child(dir));
    save.set_child(dir, n);
    save_id
}

/// `rotate_double(n, dir)` == `rotate_single(n.child(¬dir), ¬dir)` then
/// `rotate_single(n, dir)` (§4.1).
pub fn rotate_double<T: Links>(arena: &Arena<T>, n: NodeId, dir: Dir) -> NodeId {
    let child = arena.get(n).child(dir.opp());
    let new_child = rotate_single(arena, child, dir.opp());
    arena.get(n).set_child(dir.opp(), new_child);
    rotate_single(arena, n, dir)
}

// ---------------------------------------------------------------------
// AVL
// ---------------------------------------------------------------------

#[inline]
pub fn node_height<T: AvlLinks>(arena: &Arena<T>, id: NodeId) -> i32 {
    if is_nil(id) {
        0
    } else {
        arena.get(id).height()
    }
}

pub fn avl_update_height<T: AvlLinks>(arena: &Arena<T>, id: NodeId) {
    if is_nil(id) {
        return;
    }
    let node = arena.get(id);
    let h = 1 + node_height(arena, node.child(Dir::Left)).max(node_height(arena, node.child(Dir::Right)));
    node.set_height(h);
}

/// `height(left) - height(right)`.
pub fn avl_balance<T: AvlLinks>(arena: &Arena<T>, id: NodeId) -> i32 {
    let node = arena.get(id);
    node_height(arena, node.child(Dir::Left)) - node_height(arena, node.child(Dir::Right))
}

pub fn avl_rotate_single<T: AvlLinks>(arena: &Arena<T>, n: NodeId, dir: Dir) -> NodeId {
    let save = rotate_single(arena, n, dir);
    avl_update_height(arena, n);
    avl_update_height(arena, save);
    save
}

pub fn avl_rotate_double<T: AvlLinks>(arena: &Arena<T>, n: NodeId, dir: Dir) -> NodeId {
    let child = arena.get(n).child(dir.opp());
    let new_child = avl_rotate_single(arena, child, dir.opp());
    arena.get(n).set_child(dir.opp(), new_child);
    avl_rotate_single(arena, n, dir)
}

/// Bottom-up AVL fixup after an insert (§4.1): walks `path` (root ..=
/// newly-created internal node) upward, stopping at the first rotation or
/// the first node whose height doesn't change. `key` is the inserted key,
/// used (as the source does) to recompute which child slot of `parent`
/// needs relinking, instead of threading a separate direction stack.
///
/// Returns `Some(new_root)` if the tree's root changed.
pub fn avl_fixup_insert<T: AvlLinks + HasKey>(
    arena: &Arena<T>,
    path: &[NodeId],
    key: i32,
) -> Option<NodeId> {
    avl_fixup(arena, path, key, false)
}

/// Bottom-up AVL fixup after a delete (§4.1): like `avl_fixup_insert` but
/// continues past a rotation instead of stopping, since a deletion can
/// require rebalancing all the way to the root.
pub fn avl_fixup_delete<T: AvlLinks + HasKey>(
    arena: &Arena<T>,
    path: &[NodeId],
    key: i32,
) -> Option<NodeId> {
    avl_fixup(arena, path, key, true)
}

fn avl_fixup<T: AvlLinks + HasKey>(
    arena: &Arena<T>,
    path: &[NodeId],
    key: i32,
    continue_after_rotation: bool,
) -> Option<NodeId> {
    if path.len() < 2 {
        return None;
    }
    let mut top = path.len() - 1;
    if !continue_after_rotation {
        // Ignore the just-created internal node for insert; the delete
        // caller passes a path whose bottom is already the first node that
        // might be unbalanced.
        top -= 1;
    }
    let mut new_root = None;

    while top > 0 {
        let curr = path[top];
        top -= 1;
        let parent = path[top];

        let balance = avl_balance(arena, curr);
        if balance == 2 || balance == -2 {
            let dir_from_parent = Dir::from_cmp(arena.get(parent).key().cmp(&key));
            let replacement = if balance == 2 {
                let l = arena.get(curr).child(Dir::Left);
                let b2 = avl_balance(arena, l);
                let single = if continue_after_rotation { b2 >= 0 } else { b2 >= 0 };
                if single {
                    avl_rotate_single(arena, curr, Dir::Right)
                } else {
                    avl_rotate_double(arena, curr, Dir::Right)
                }
            } else {
                let r = arena.get(curr).child(Dir::Right);
                let b2 = avl_balance(arena, r);
                let single = b2 <= 0;
                if single {
                    avl_rotate_single(arena, curr, Dir::Left)
                } else {
                    avl_rotate_double(arena, curr, Dir::Left)
                }
            };
            arena.get(parent).set_child(dir_from_parent, replacement);
            if top == 0 {
                new_root = Some(replacement);
            }
            if !continue_after_rotation {
                break;
            }
            continue;
        }

        let old_h = arena.get(curr).height();
        let new_h = 1 + node_height(arena, arena.get(curr).child(Dir::Left))
            .max(node_height(arena, arena.get(curr).child(Dir::Right)));
        arena.get(curr).set_height(new_h);
        if old_h == new_h {
            break;
        }
    }
    new_root
}

// ---------------------------------------------------------------------
// Red-Black
// ---------------------------------------------------------------------

#[inline]
pub fn is_red<T: RbLinks>(arena: &Arena<T>, id: NodeId) -> bool {
    !is_nil(id) && arena.get(id).is_red()
}

#[inline]
pub fn is_black<T: RbLinks>(arena: &Arena<T>, id: NodeId) -> bool {
    !is_red(arena, id)
}

/// Single rotation with Tarjan/Sedgewick color maintenance: the incoming
/// subtree root `n` and its replacement `save` swap colors (the classic
/// "rotate and recolor" step used for external-leaf red-black trees).
pub fn rb_rotate_single<T: RbLinks>(arena: &Arena<T>, n: NodeId, dir: Dir) -> NodeId {
    let save = rotate_single(arena, n, dir);
    let n_color = arena.get(n).color();
    arena.get(n).set_color(arena.get(save).color());
    arena.get(save).set_color(n_color);
    save
}

pub fn rb_rotate_double<T: RbLinks>(arena: &Arena<T>, n: NodeId, dir: Dir) -> NodeId {
    let child = arena.get(n).child(dir.opp());
    let new_child = rb_rotate_single(arena, child, dir.opp());
    arena.get(n).set_child(dir.opp(), new_child);
    rb_rotate_single(arena, n, dir)
}

/// Relinks `new` into whichever child slot of `parent_of` used to hold
/// `old`, or updates `root` when `parent_of` is nil. Shared by the
/// path-stack RB fixups below, which have no parent pointers to walk and so
/// must thread this through explicitly.
fn rb_relink<T: Links>(arena: &Arena<T>, root: &AtomicU32, parent_of: NodeId, old: NodeId, new: NodeId) {
    if is_nil(parent_of) {
        root.store(new, Ordering::Release);
    } else {
        let dir = if arena.get(parent_of).child(Dir::Left) == old {
            Dir::Left
        } else {
            Dir::Right
        };
        arena.get(parent_of).set_child(dir, new);
    }
}

/// CLRS red-black insert-fixup ported to a descent-path stack instead of
/// parent pointers (the top-down variants in this crate never store a
/// parent link). `path` is root..=the freshly split internal node, which
/// must already be colored red with two black external children.
///
/// A single rotation always terminates RB insert-fixup, so unlike
/// [`avl_fixup_insert`] this never needs to continue past the first one;
/// it still has to walk up through any number of red-uncle recolorings
/// first.
pub fn rb_fixup_insert<T: RbLinks + HasKey>(arena: &Arena<T>, root: &AtomicU32, path: &[NodeId]) {
    let mut i = path.len() - 1;
    while i >= 2 {
        let z = path[i];
        let parent = path[i - 1];
        if is_black(arena, parent) {
            break;
        }
        let grandparent = path[i - 2];
        let parent_dir = if arena.get(grandparent).child(Dir::Left) == parent {
            Dir::Left
        } else {
            Dir::Right
        };
        let uncle = arena.get(grandparent).child(parent_dir.opp());
        if is_red(arena, uncle) {
            arena.get(parent).set_color(Color::Black);
            arena.get(uncle).set_color(Color::Black);
            arena.get(grandparent).set_color(Color::Red);
            i -= 2;
            continue;
        }

        let z_dir = if arena.get(parent).child(Dir::Left) == z {
            Dir::Left
        } else {
            Dir::Right
        };
        let outer_dir = parent_dir.opp();
        let replacement = if z_dir == parent_dir {
            let r = rotate_single(arena, grandparent, outer_dir);
            arena.get(parent).set_color(Color::Black);
            arena.get(grandparent).set_color(Color::Red);
            r
        } else {
            let r = rotate_double(arena, grandparent, outer_dir);
            arena.get(z).set_color(Color::Black);
            arena.get(grandparent).set_color(Color::Red);
            r
        };
        let great_grandparent = if i >= 3 { path[i - 3] } else { NIL };
        rb_relink(arena, root, great_grandparent, grandparent, replacement);
        break;
    }
    let current_root = root.load(Ordering::Acquire);
    if is_red(arena, current_root) {
        arena.get(current_root).set_color(Color::Black);
    }
}

/// CLRS red-black delete-fixup, path-stack form. `path` is root..=`x`, the
/// node that now occupies the slot a black node was removed from -- always
/// a real node in these external trees, never a sentinel.
pub fn rb_fixup_delete<T: RbLinks + HasKey>(arena: &Arena<T>, root: &AtomicU32, path: &[NodeId]) {
    let mut i = path.len() - 1;
    loop {
        let x = path[i];
        let current_root = root.load(Ordering::Acquire);
        if x == current_root || is_red(arena, x) {
            break;
        }
        let parent = path[i - 1];
        let mut grandparent = if i >= 2 { path[i - 2] } else { NIL };
        let x_dir = if arena.get(parent).child(Dir::Left) == x {
            Dir::Left
        } else {
            Dir::Right
        };
        let sib_dir = x_dir.opp();
        let mut w = arena.get(parent).child(sib_dir);

        if is_red(arena, w) {
            arena.get(w).set_color(Color::Black);
            arena.get(parent).set_color(Color::Red);
            let new_sub = rotate_single(arena, parent, x_dir);
            rb_relink(arena, root, grandparent, parent, new_sub);
            grandparent = w;
            w = arena.get(parent).child(sib_dir);
        }

        if is_black(arena, arena.get(w).child(Dir::Left)) && is_black(arena, arena.get(w).child(Dir::Right)) {
            arena.get(w).set_color(Color::Red);
            i -= 1;
            continue;
        }

        if is_black(arena, arena.get(w).child(sib_dir)) {
            arena.get(arena.get(w).child(x_dir)).set_color(Color::Black);
            arena.get(w).set_color(Color::Red);
            let new_w = rotate_single(arena, w, sib_dir);
            arena.get(parent).set_child(sib_dir, new_w);
            w = new_w;
        }

        arena.get(w).set_color(arena.get(parent).color());
        arena.get(parent).set_color(Color::Black);
        arena.get(arena.get(w).child(sib_dir)).set_color(Color::Black);
        let new_sub = rotate_single(arena, parent, x_dir);
        rb_relink(arena, root, grandparent, parent, new_sub);
        break;
    }
    let current_root = root.load(Ordering::Acquire);
    arena.get(current_root).set_color(Color::Black);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct TestNode {
        key: i32,
        left: Cell<NodeId>,
        right: Cell<NodeId>,
        height: Cell<i32>,
        color: Cell<Color>,
    }

    impl TestNode {
        fn leaf(key: i32) -> Self {
            TestNode {
                key,
                left: Cell::new(crate::arena::NIL),
                right: Cell::new(crate::arena::NIL),
                height: Cell::new(1),
                color: Cell::new(Color::Red),
            }
        }
    }

    impl Links for TestNode {
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

    impl HasKey for TestNode {
        fn key(&self) -> i32 {
            self.key
        }
    }

    impl AvlLinks for TestNode {
        fn height(&self) -> i32 {
            self.height.get()
        }
        fn set_height(&self, h: i32) {
            self.height.set(h)
        }
    }

    impl RbLinks for TestNode {
        fn color(&self) -> Color {
            self.color.get()
        }
        fn set_color(&self, c: Color) {
            self.color.set(c)
        }
    }

    fn build_left_chain(arena: &Arena<TestNode>) -> (NodeId, NodeId, NodeId) {
        // c(key 30) -> b(20) -> a(10), a.left/right nil, heights unbalanced.
        let a = arena.alloc(TestNode::leaf(10));
        let b = arena.alloc(TestNode::leaf(20));
        let c = arena.alloc(TestNode::leaf(30));
        arena.get(b).set_child(Dir::Left, a);
        arena.get(c).set_child(Dir::Left, b);
        arena.get(a).height.set(1);
        arena.get(b).height.set(2);
        arena.get(c).height.set(3);
        (a, b, c)
    }

    #[test]
    fn rotate_single_fixes_left_left_case() {
        let arena: Arena<TestNode> = Arena::with_capacity(8);
        let (_a, b, c) = build_left_chain(&arena);
        let new_root = avl_rotate_single(&arena, c, Dir::Right);
        assert_eq!(new_root, b);
        assert_eq!(arena.get(b).child(Dir::Right), c);
    }

    #[test]
    fn rotate_double_handles_left_right_case() {
        let arena: Arena<TestNode> = Arena::with_capacity(8);
        let a = arena.alloc(TestNode::leaf(10));
        let b = arena.alloc(TestNode::leaf(30));
        let m = arena.alloc(TestNode::leaf(20));
        arena.get(b).set_child(Dir::Left, a);
        arena.get(a).set_child(Dir::Right, m);
        arena.get(a).height.set(2);
        arena.get(b).height.set(3);
        let new_root = avl_rotate_double(&arena, b, Dir::Right);
        assert_eq!(new_root, m);
        assert_eq!(arena.get(m).child(Dir::Left), a);
        assert_eq!(arena.get(m).child(Dir::Right), b);
    }

    #[test]
    fn avl_fixup_insert_rebalances_and_reports_new_root() {
        let arena: Arena<TestNode> = Arena::with_capacity(8);
        let (a, b, c) = build_left_chain(&arena);
        // Simulate descent path root(c) -> b -> a (a is the inserted node).
        let new_root = avl_fixup_insert(&arena, &[c, b, a], 10);
        assert_eq!(new_root, Some(b));
        assert_eq!(avl_balance(&arena, b), 0);
    }

    #[test]
    fn rb_rotate_single_swaps_colors() {
        let arena: Arena<TestNode> = Arena::with_capacity(8);
        let (_a, b, c) = build_left_chain(&arena);
        arena.get(c).color.set(Color::Black);
        arena.get(b).color.set(Color::Red);
        let new_root = rb_rotate_single(&arena, c, Dir::Right);
        assert_eq!(new_root, b);
        assert_eq!(arena.get(b).color(), Color::Black);
        assert_eq!(arena.get(c).color(), Color::Red);
    }
}
