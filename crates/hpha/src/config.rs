//! Allocator configuration.
//!
//! Defaults follow the host: pool pages are one OS page, tree arenas are
//! at least 64 KiB. Every field can be overridden from the environment:
//! - `HPHA_POOL_PAGE_SIZE`: bucket page size (power of two, >= OS page)
//! - `HPHA_TREE_PAGE_SIZE`: minimum tree arena size (power of two, >= pool page)
//! - `HPHA_POOL_ALLOCATIONS`: `off` routes every request to the tree
//! - `HPHA_DEBUG_FILL`: pattern-fill payloads on allocate/free (debug allocator)
//! - `HPHA_CAPTURE_STACKS`: record a backtrace per allocation (debug allocator)
//!
//! Sizes accept decimal or `0x` hex with an optional `k`/`m` suffix.

use serde::Serialize;

use crate::error::ConfigError;
use crate::os;
use crate::page::PAGE_HEADER_SIZE;
use crate::size_class::MIN_ALLOCATION;

pub const ENV_POOL_PAGE_SIZE: &str = "HPHA_POOL_PAGE_SIZE";
pub const ENV_TREE_PAGE_SIZE: &str = "HPHA_TREE_PAGE_SIZE";
pub const ENV_POOL_ALLOCATIONS: &str = "HPHA_POOL_ALLOCATIONS";
pub const ENV_DEBUG_FILL: &str = "HPHA_DEBUG_FILL";
pub const ENV_CAPTURE_STACKS: &str = "HPHA_CAPTURE_STACKS";

/// Default minimum tree arena size.
pub const DEFAULT_TREE_PAGE_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HphaConfig {
    /// Size and alignment of bucket pages. Tree arenas share the alignment.
    pub pool_page_size: usize,
    /// Minimum size of a tree arena.
    pub tree_page_size: usize,
    /// When false every request goes to the tree.
    pub enable_pool_allocations: bool,
    /// Debug allocator only: fill fresh and freed payloads with a NaN pattern.
    pub fill_debug_memory: bool,
    /// Debug allocator only: capture a backtrace per allocation.
    pub capture_call_stacks: bool,
}

impl Default for HphaConfig {
    fn default() -> Self {
        let pool = os::page_size();
        Self {
            pool_page_size: pool,
            tree_page_size: DEFAULT_TREE_PAGE_SIZE.max(pool),
            enable_pool_allocations: true,
            fill_debug_memory: true,
            capture_call_stacks: true,
        }
    }
}

impl HphaConfig {
    /// Check the page geometry.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let os_page = os::page_size();
        for (field, value) in [
            ("pool_page_size", self.pool_page_size),
            ("tree_page_size", self.tree_page_size),
        ] {
            if !value.is_power_of_two() {
                return Err(ConfigError::NotPowerOfTwo { field, value });
            }
            if value < os_page {
                return Err(ConfigError::BelowOsPage { field, value, os_page });
            }
        }
        if self.tree_page_size < self.pool_page_size {
            return Err(ConfigError::TreePageBelowPoolPage {
                tree: self.tree_page_size,
                pool: self.pool_page_size,
            });
        }
        let slots = (self.pool_page_size - PAGE_HEADER_SIZE) / MIN_ALLOCATION;
        if slots > usize::from(u16::MAX) {
            return Err(ConfigError::SlotCountOverflow {
                page: self.pool_page_size,
                slots,
            });
        }
        Ok(())
    }

    /// Defaults overridden by `HPHA_*` environment variables, validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// As [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let size = |var: &'static str, slot: &mut usize| -> Result<(), ConfigError> {
            if let Some(raw) = lookup(var) {
                *slot = parse_size(&raw).ok_or(ConfigError::InvalidEnv { var, value: raw })?;
            }
            Ok(())
        };
        size(ENV_POOL_PAGE_SIZE, &mut config.pool_page_size)?;
        // An explicit pool page larger than the default tree page drags the
        // tree page along unless the tree page is set too.
        config.tree_page_size = config.tree_page_size.max(config.pool_page_size);
        size(ENV_TREE_PAGE_SIZE, &mut config.tree_page_size)?;

        let flag = |var: &'static str, slot: &mut bool| -> Result<(), ConfigError> {
            if let Some(raw) = lookup(var) {
                *slot = parse_bool_loose(&raw).ok_or(ConfigError::InvalidEnv { var, value: raw })?;
            }
            Ok(())
        };
        flag(ENV_POOL_ALLOCATIONS, &mut config.enable_pool_allocations)?;
        flag(ENV_DEBUG_FILL, &mut config.fill_debug_memory)?;
        flag(ENV_CAPTURE_STACKS, &mut config.capture_call_stacks)?;

        config.validate()?;
        Ok(config)
    }
}

/// Parse `4096`, `0x1000`, `64k`, `1m` (case-insensitive, `_` ignored).
#[must_use]
pub fn parse_size(raw: &str) -> Option<usize> {
    let cleaned: String = raw.trim().chars().filter(|&c| c != '_').collect::<String>().to_ascii_lowercase();
    let (digits, scale) = if let Some(rest) = cleaned.strip_suffix('k') {
        (rest, 1024)
    } else if let Some(rest) = cleaned.strip_suffix('m') {
        (rest, 1024 * 1024)
    } else {
        (cleaned.as_str(), 1)
    };
    let value = match digits.strip_prefix("0x") {
        Some(hex) => usize::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<usize>().ok()?,
    };
    value.checked_mul(scale)
}

/// Parse a boolean switch (case-insensitive).
#[must_use]
pub fn parse_bool_loose(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" | "enabled" => Some(true),
        "0" | "false" | "off" | "no" | "disabled" => Some(false),
        _ => None,
    }
}
