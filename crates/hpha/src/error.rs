//! Recoverable errors. Allocation failure is reported as `None` and heap
//! corruption is fatal, so only setting an allocator up can fail here.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{field} = {value} is not a power of two")]
    NotPowerOfTwo { field: &'static str, value: usize },
    #[error("{field} = {value} is smaller than the OS page size {os_page}")]
    BelowOsPage {
        field: &'static str,
        value: usize,
        os_page: usize,
    },
    #[error("tree_page_size = {tree} is smaller than pool_page_size = {pool}")]
    TreePageBelowPoolPage { tree: usize, pool: usize },
    #[error("pool page of {page} bytes holds {slots} minimum-size slots, more than a u16 can count")]
    SlotCountOverflow { page: usize, slots: usize },
    #[error("invalid value {value:?} for {var}")]
    InvalidEnv { var: &'static str, value: String },
    #[error("fixed block at {address:#x} is not aligned to {alignment} bytes")]
    FixedBlockMisaligned { address: usize, alignment: usize },
    #[error("fixed block of {len} bytes is smaller than the {min} byte minimum")]
    FixedBlockTooSmall { len: usize, min: usize },
}
