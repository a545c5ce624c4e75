//! Builder configuration

use serde::{Deserialize, Serialize};

/// Knobs for the DAG builder. Missing fields take their default when
/// deserialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedOptions {
    /// Input has been register allocated; virtual registers are a bug
    pub post_ra: bool,
    /// Every latency is 1 and operand latencies are not refined
    pub unit_latencies: bool,
    /// How far the builder follows memory edges of a node the alias oracle
    /// ruled out before it gives up and adds a conservative edge
    pub max_chain_depth: usize,
    /// How many ruled-out memory nodes are retained before the builder falls
    /// back to conservative edges
    pub max_rejected: usize,
    /// Look for loop-carried register dependencies
    pub analyze_loops: bool,
}

impl Default for SchedOptions {
    fn default() -> Self {
        Self {
            post_ra: false,
            unit_latencies: false,
            max_chain_depth: 16,
            max_rejected: 64,
            analyze_loops: true,
        }
    }
}

impl SchedOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_post_ra(mut self, post_ra: bool) -> Self {
        self.post_ra = post_ra;
        self
    }

    pub fn with_unit_latencies(mut self, unit: bool) -> Self {
        self.unit_latencies = unit;
        self
    }

    pub fn with_max_chain_depth(mut self, depth: usize) -> Self {
        self.max_chain_depth = depth;
        self
    }

    pub fn with_max_rejected(mut self, max: usize) -> Self {
        self.max_rejected = max;
        self
    }

    pub fn with_analyze_loops(mut self, analyze: bool) -> Self {
        self.analyze_loops = analyze;
        self
    }
}
