//! JSON run reports.

use std::io::Write;
use std::path::Path;

use hpha::{DebugPolicy, HeapSnapshot, Hpha, HphaConfig, HphaStats};
use serde::Serialize;

use crate::error::HarnessError;
use crate::workload::{ChurnOutcome, StressOutcome};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Stress(StressOutcome),
    Churn(ChurnOutcome),
    Report { snapshot: HeapSnapshot },
}

/// One harness invocation.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub command: &'static str,
    /// Whether the debug allocator (guards and registry) was used.
    pub debug: bool,
    pub guard_size: usize,
    pub config: HphaConfig,
    /// Counters after the workload finished.
    pub stats: HphaStats,
    pub max_allocation_size: usize,
    pub outcome: Outcome,
}

impl RunReport {
    pub fn new<D: DebugPolicy>(command: &'static str, heap: &Hpha<D>, outcome: Outcome) -> Self {
        Self {
            command,
            debug: D::ENABLED,
            guard_size: D::GUARD_SIZE,
            config: *heap.config(),
            stats: heap.stats(),
            max_allocation_size: heap.max_allocation_size(),
            outcome,
        }
    }

    /// Pretty JSON to `output`, or stdout when `None`.
    pub fn write(&self, output: Option<&Path>) -> Result<(), HarnessError> {
        let body = serde_json::to_string_pretty(self)?;
        match output {
            Some(path) => {
                std::fs::write(path, body + "\n")?;
                log::info!("wrote report to {}", path.display());
            }
            None => {
                let mut out = std::io::stdout().lock();
                writeln!(out, "{body}")?;
            }
        }
        Ok(())
    }
}
