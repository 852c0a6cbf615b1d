//! Tuning constants generated at build time from `xfercache.toml`.
//!
//! These are policy knobs, not correctness requirements: capacity budgets,
//! the rebalancing cap, and the sharded-cache thresholds. Edit the TOML
//! (or point `XFERCACHE_CONFIG` at another file) to retune; nothing in the
//! crate hard-codes these values.

include!(concat!(env!("OUT_DIR"), "/config_gen.rs"));
