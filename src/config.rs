//! Harness configuration (SPEC_FULL.md §10.3): parsed with `clap`'s derive
//! API, mirroring the shape of `sky-bench`'s `Cli`/`BenchmarkConfig` split
//! in the pack -- a flat `#[derive(Parser)]` struct for argv, validated into
//! a `BenchError` before the harness touches a tree.

use clap::Parser;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BenchError {
    #[error("--lookup-frac + --insert-frac + --delete-frac must sum to 100, got {0}")]
    FractionsDontSumTo100(u8),
    #[error("unknown variant {0:?}; expected one of: {1}")]
    UnknownVariant(String, &'static str),
    #[error("exactly one of --duration-secs or --num-ops must be given")]
    AmbiguousWorkload,
    #[error("--num-threads must be at least 1")]
    NoThreads,
    #[error("failed to write report to {path}: {source}")]
    ReportWrite {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write CSV row: {0}")]
    Csv(#[from] csv::Error),
}

pub const VARIANT_NAMES: &str = "bst-cop-external, rbt-links-bu-ext-cop, rbt-links-td-ext-fg-spinlock, avl-links-bu-ext-fg-htm, rbt-links-td-tarjan-ext-fg-htm, avl-contention-friendly";

/// Command-line configuration for the `bench` binary (SPEC_FULL.md §6's
/// harness contract plus §10.3's ambient options).
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Concurrent ordered-map benchmark harness", long_about = None)]
pub struct Config {
    /// Which tree variant to benchmark (see each variant's `name()`).
    #[arg(long, value_name = "NAME")]
    pub variant: String,

    /// Number of worker threads to pin and run the workload on.
    #[arg(long, default_value_t = 4, value_name = "N")]
    pub num_threads: usize,

    /// Percentage of operations that are lookups.
    #[arg(long, default_value_t = 80, value_name = "PCT")]
    pub lookup_frac: u8,

    /// Percentage of operations that are inserts.
    #[arg(long, default_value_t = 10, value_name = "PCT")]
    pub insert_frac: u8,

    /// Percentage of operations that are deletes. Defaults to
    /// `100 - lookup_frac - insert_frac` when omitted.
    #[arg(long, value_name = "PCT")]
    pub delete_frac: Option<u8>,

    /// Exclusive upper bound on generated keys.
    #[arg(long, default_value_t = 1_000_000, value_name = "N")]
    pub max_key: i32,

    /// Number of distinct keys to insert during warmup.
    #[arg(long, default_value_t = 10_000, value_name = "N")]
    pub init_tree_size: usize,

    /// RNG seed for warmup population.
    #[arg(long, default_value_t = 1, value_name = "SEED")]
    pub init_seed: u64,

    /// RNG seed for the worker threads' workload generation.
    #[arg(long, default_value_t = 2, value_name = "SEED")]
    pub thread_seed: u64,

    /// Run for a fixed wall-clock duration (WORKLOAD_TIME). Mutually
    /// exclusive with `--num-ops`.
    #[arg(long, value_name = "SECS")]
    pub duration_secs: Option<u64>,

    /// Run a fixed total number of operations (WORKLOAD_FIXED). Mutually
    /// exclusive with `--duration-secs`.
    #[arg(long, value_name = "N")]
    pub num_ops: Option<u64>,

    /// Optional path to append a CSV summary row to.
    #[arg(long, value_name = "PATH")]
    pub csv: Option<String>,

    /// Override the node arena's capacity. The arena is a pure bump
    /// allocator that is never reclaimed mid-run (SPEC_FULL.md §9), so a
    /// long insert-heavy run can exhaust a capacity sized only off
    /// `max_key`/`init_tree_size`; set this explicitly for such runs
    /// instead of relying on the harness's generous-but-heuristic default.
    #[arg(long, value_name = "N")]
    pub pool_capacity: Option<usize>,
}

impl Config {
    pub fn delete_frac(&self) -> u8 {
        self.delete_frac
            .unwrap_or(100u8.saturating_sub(self.lookup_frac).saturating_sub(self.insert_frac))
    }

    /// Checks the combinations `clap` can't express on its own: fraction
    /// sums, workload-mode exclusivity, thread count.
    pub fn validate(&self) -> Result<(), BenchError> {
        if self.num_threads == 0 {
            return Err(BenchError::NoThreads);
        }
        let total = self.lookup_frac as u32 + self.insert_frac as u32 + self.delete_frac() as u32;
        if total != 100 {
            return Err(BenchError::FractionsDontSumTo100(total as u8));
        }
        match (self.duration_secs, self.num_ops) {
            (Some(_), None) | (None, Some(_)) => {}
            _ => return Err(BenchError::AmbiguousWorkload),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            variant: "bst-cop-external".into(),
            num_threads: 4,
            lookup_frac: 80,
            insert_frac: 10,
            delete_frac: None,
            max_key: 1024,
            init_tree_size: 512,
            init_seed: 1,
            thread_seed: 2,
            duration_secs: Some(5),
            num_ops: None,
            csv: None,
            pool_capacity: None,
        }
    }

    #[test]
    fn implicit_delete_frac_fills_remainder() {
        let cfg = base_config();
        assert_eq!(cfg.delete_frac(), 10);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn mismatched_fractions_are_rejected() {
        let mut cfg = base_config();
        cfg.delete_frac = Some(50);
        assert!(matches!(cfg.validate(), Err(BenchError::FractionsDontSumTo100(_))));
    }

    #[test]
    fn workload_mode_must_be_unambiguous() {
        let mut cfg = base_config();
        cfg.num_ops = Some(1000);
        assert!(matches!(cfg.validate(), Err(BenchError::AmbiguousWorkload)));

        let mut cfg = base_config();
        cfg.duration_secs = None;
        cfg.num_ops = None;
        assert!(matches!(cfg.validate(), Err(BenchError::AmbiguousWorkload)));
    }

    #[test]
    fn zero_threads_is_rejected() {
        let mut cfg = base_config();
        cfg.num_threads = 0;
        assert!(matches!(cfg.validate(), Err(BenchError::NoThreads)));
    }
}
