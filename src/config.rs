//! Layered configuration, following `pageserver/src/config.rs`'s pattern: a `defaults` module of
//! plain constants, a `serde`-deserializable struct for embedders who want to load TOML, and a
//! plain-Rust constructor path for everyone else.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod defaults {
    pub const PAGE_SIZE: u64 = 8192;
    pub const BLOCK_SIZE: u64 = 2 * 1024 * 1024;
    pub const PAGES_PER_BLOCK: u64 = BLOCK_SIZE / PAGE_SIZE;
    pub const MAX_FILE_SIZE: u64 = 4 * 1024 * 1024 * 1024;
    pub const NUMBER_OF_BLOCKS: usize = (MAX_FILE_SIZE / BLOCK_SIZE) as usize;
    pub const NUMBER_OF_ACCESS_GENERATIONS: usize = 4;
    pub const IO_RING_QUEUE_SIZE: u32 = 32;

    pub const DEFAULT_ACCESS_GENERATION_PERIOD: &str = "1s";
}

/// Four independent byte thresholds; effective soft/hard is the max across scopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryLimits {
    pub global_hard: u64,
    pub global_soft: u64,
    pub self_hard: u64,
    pub self_soft: u64,
}

impl MemoryLimits {
    /// Convenience constructor: all four thresholds set to `n` bytes.
    pub fn simple(n: u64) -> Self {
        MemoryLimits {
            global_hard: n,
            global_soft: n,
            self_hard: n,
            self_soft: n,
        }
    }

    /// Effective soft limit: `max(self_soft, global_soft)`. See DESIGN.md for why `max` is
    /// preserved over the more conservative `min`.
    pub fn effective_soft(&self) -> u64 {
        self.self_soft.max(self.global_soft)
    }

    /// Effective hard limit: `max(self_hard, global_hard)`.
    pub fn effective_hard(&self) -> u64 {
        self.self_hard.max(self.global_hard)
    }
}

/// Pager-wide configuration beyond the raw memory thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PagerConfig {
    pub limits: MemoryLimits,

    /// Depth of the submission/completion ring.
    #[serde(default = "default_ring_queue_size")]
    pub io_ring_queue_size: u32,

    /// How often the access-generation clock rotates, driven by a dedicated background thread on
    /// a fixed period (see DESIGN.md).
    #[serde(with = "humantime_serde", default = "default_access_generation_period")]
    pub access_generation_period: Duration,

    /// Largest file this pager will open.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
}

fn default_ring_queue_size() -> u32 {
    defaults::IO_RING_QUEUE_SIZE
}

fn default_access_generation_period() -> Duration {
    humantime::parse_duration(defaults::DEFAULT_ACCESS_GENERATION_PERIOD)
        .expect("default duration literal must parse")
}

fn default_max_file_size() -> u64 {
    defaults::MAX_FILE_SIZE
}

impl PagerConfig {
    pub fn new(limits: MemoryLimits) -> Self {
        PagerConfig {
            limits,
            io_ring_queue_size: default_ring_queue_size(),
            access_generation_period: default_access_generation_period(),
            max_file_size: default_max_file_size(),
        }
    }

    /// Parse a config from a TOML document, the way `PageServerConf::parse_and_validate` does.
    pub fn parse_toml(s: &str) -> anyhow::Result<Self> {
        let doc = s.parse::<toml_edit::Document>()?;
        let config: PagerConfig = toml_edit::de::from_document(doc)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_limits_are_uniform() {
        let limits = MemoryLimits::simple(1024);
        assert_eq!(limits.effective_soft(), 1024);
        assert_eq!(limits.effective_hard(), 1024);
    }

    #[test]
    fn effective_limits_take_the_max() {
        let limits = MemoryLimits {
            global_hard: 100,
            global_soft: 10,
            self_hard: 50,
            self_soft: 80,
        };
        assert_eq!(limits.effective_soft(), 80);
        assert_eq!(limits.effective_hard(), 100);
    }

    #[test]
    fn parse_minimal_toml() {
        let cfg = PagerConfig::parse_toml(
            r#"
            [limits]
            global_hard = 1000
            global_soft = 1000
            self_hard = 1000
            self_soft = 1000
            "#,
        )
        .expect("minimal config should parse");
        assert_eq!(cfg.io_ring_queue_size, defaults::IO_RING_QUEUE_SIZE);
        assert_eq!(
            cfg.access_generation_period,
            default_access_generation_period()
        );
    }
}
