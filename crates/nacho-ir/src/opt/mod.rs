//! IR optimization pipeline.
//!
//! Passes run in a fixed order: DCE, constant folding, CSE, copy propagation. Each pass reports
//! how many rewrites it made; the pipeline repeats until a full round changes nothing (or the
//! iteration cap is reached). Folding a value or propagating a copy usually leaves the defining
//! instruction dead, which the next round's DCE removes.

pub mod const_fold;
pub mod copy_prop;
pub mod cse;
pub mod dce;

use tracing::trace;

use crate::function::IrFunction;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OptStats {
    pub iterations: u32,
    pub dce_removed: usize,
    pub folded: usize,
    pub cse_replaced: usize,
    pub copies_propagated: usize,
}

impl OptStats {
    pub fn total_changes(&self) -> usize {
        self.dce_removed + self.folded + self.cse_replaced + self.copies_propagated
    }
}

#[derive(Clone, Debug)]
pub struct IrOptimizer {
    max_iterations: u32,
}

impl Default for IrOptimizer {
    fn default() -> Self {
        Self { max_iterations: 8 }
    }
}

impl IrOptimizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_iterations(max_iterations: u32) -> Self {
        Self {
            max_iterations: max_iterations.max(1),
        }
    }

    pub fn optimize(&self, func: &mut IrFunction) -> OptStats {
        let mut stats = OptStats::default();
        for _ in 0..self.max_iterations {
            stats.iterations += 1;
            let dce = dce::run(func);
            let folded = const_fold::run(func);
            let cse = cse::run(func);
            let copies = copy_prop::run(func);

            stats.dce_removed += dce;
            stats.folded += folded;
            stats.cse_replaced += cse;
            stats.copies_propagated += copies;
            if dce + folded + cse + copies == 0 {
                break;
            }
        }
        trace!(func = %func.name, ?stats, "optimized");
        stats
    }
}
