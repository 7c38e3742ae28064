//! A benchmarking laboratory of concurrent ordered-map data structures:
//! fine-grained spinlock trees, optimistic lookup-verification trees,
//! versioned HTM-windowed trees, a top-down Tarjan red-black tree, and a
//! relaxed background-maintainer AVL tree, all behind the same
//! `lookup`/`insert`/`delete` contract (see [`map::ConcurrentOrderedMap`])
//! and driven by one workload harness (`src/bin/bench.rs`).

pub mod algebra;
pub mod arena;
pub mod config;
pub mod htm;
pub mod map;
pub mod spinlock;
pub mod stats;
pub mod variants;
pub mod workload;
