//! The five concurrency schemes under benchmark (SPEC_FULL.md §4), each a
//! self-contained [`crate::map::ConcurrentOrderedMap`] implementation.
//! `cop_common` is shared plumbing, not a variant of its own.

pub mod cop_common;

pub mod bst_cop_external;
pub mod cop_external;
pub mod fg_spinlock_rbt;
pub mod htm_window_avl;
pub mod htm_window_tarjan_rbt;
pub mod relaxed_avl;
