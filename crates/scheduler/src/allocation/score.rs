use api_types::PackingPolicy;

use super::packing::ProjectedDevice;

/// Highest node score produced by the engine
pub const MAX_NODE_SCORE: i64 = 100;

/// Relative weight of each resource dimension in the utilization score
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreWeights {
    pub memory: f64,
    pub compute: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            memory: 1.0,
            compute: 1.0,
        }
    }
}

impl ScoreWeights {
    fn normalized(self) -> (f64, f64) {
        let memory = self.memory.max(0.0);
        let compute = self.compute.max(0.0);
        let total = memory + compute;
        if total <= f64::EPSILON {
            (0.5, 0.5)
        } else {
            (memory / total, compute / total)
        }
    }
}

fn ratio(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (used as f64 / total as f64).min(1.0)
    }
}

/// Scores a node by its utilization after the planned placement.
///
/// Utilization is the weighted memory/compute usage averaged over all devices of
/// the node. Binpack rewards high utilization, spread rewards low utilization.
pub(crate) fn score_node(
    devices: &[ProjectedDevice<'_>],
    policy: PackingPolicy,
    weights: ScoreWeights,
) -> i64 {
    if devices.is_empty() {
        return 0;
    }
    let (w_mem, w_compute) = weights.normalized();

    let utilization = devices
        .iter()
        .map(|d| {
            let total = d.record.spec.total;
            w_mem * ratio(d.used.memory, total.memory)
                + w_compute * ratio(u64::from(d.used.compute_share), u64::from(total.compute_share))
        })
        .sum::<f64>()
        / devices.len() as f64;

    let score = match policy {
        PackingPolicy::Binpack => utilization,
        PackingPolicy::Spread => 1.0 - utilization,
    };
    (score * MAX_NODE_SCORE as f64).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_weights_fall_back_to_equal_split() {
        let weights = ScoreWeights {
            memory: 0.0,
            compute: 0.0,
        };
        assert_eq!(weights.normalized(), (0.5, 0.5));
    }

    #[test]
    fn weights_are_normalized() {
        let weights = ScoreWeights {
            memory: 3.0,
            compute: 1.0,
        };
        assert_eq!(weights.normalized(), (0.75, 0.25));
    }

    #[test]
    fn ratio_handles_empty_totals() {
        assert_eq!(ratio(5, 0), 0.0);
        assert_eq!(ratio(5, 10), 0.5);
    }
}
