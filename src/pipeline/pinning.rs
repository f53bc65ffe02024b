//! Thread pinning policies.
//!
//! A policy names how pipeline threads map to cores:
//!
//! - `""` / `"none"`: no pinning.
//! - `"loop"`: pinned threads take cores 0, 1, 2... wrapping around.
//! - explicit: `|` separates stages, `,` separates the threads of a stage,
//!   e.g. `"PU_0|PU_1,PU_2|PU_3"`. The `PU_` prefix is optional.
//!
//! Policies are resolved when the pipeline is built, so an impossible
//! placement fails before any thread starts.

use crate::pipeline::error::{PipelineError, PipelineResult};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PinningPolicy {
    #[default]
    None,
    Loop,
    /// Core ids per stage, then per thread.
    Explicit(Vec<Vec<usize>>),
}

/// Core id per stage, per thread. `None` leaves the thread unpinned.
pub type Placement = Vec<Vec<Option<usize>>>;

impl PinningPolicy {
    pub fn parse(policy: &str) -> PipelineResult<Self> {
        let policy = policy.trim();
        match policy {
            "" | "none" => return Ok(PinningPolicy::None),
            "loop" => return Ok(PinningPolicy::Loop),
            _ => {}
        }

        let error = |message: String| PipelineError::Pinning {
            policy: policy.to_string(),
            message,
        };

        policy
            .split('|')
            .map(|stage| {
                stage
                    .split(',')
                    .map(|pu| {
                        let pu = pu.trim();
                        let id = pu.strip_prefix("PU_").unwrap_or(pu);
                        id.parse::<usize>()
                            .map_err(|_| error(format!("'{}' is not a processing unit", pu)))
                    })
                    .collect::<PipelineResult<Vec<_>>>()
            })
            .collect::<PipelineResult<Vec<_>>>()
            .map(PinningPolicy::Explicit)
    }

    /// Place the threads of every stage.
    ///
    /// * `threads` - Thread count per stage
    /// * `enabled` - Whether each stage is pinned at all
    /// * `n_cores` - Cores available on this machine
    pub fn resolve(
        &self,
        threads: &[usize],
        enabled: &[bool],
        n_cores: usize,
    ) -> PipelineResult<Placement> {
        let error = |message: String| PipelineError::Pinning {
            policy: self.to_string(),
            message,
        };
        if enabled.len() != threads.len() {
            return Err(error(format!(
                "{} pinning flags for {} stages",
                enabled.len(),
                threads.len()
            )));
        }

        let wants_cores = *self != PinningPolicy::None && enabled.iter().any(|&e| e);
        if wants_cores && n_cores == 0 {
            return Err(error("no core is available".to_string()));
        }

        match self {
            PinningPolicy::None => Ok(threads.iter().map(|&t| vec![None; t]).collect()),
            PinningPolicy::Loop => {
                let mut next = 0;
                Ok(threads
                    .iter()
                    .zip(enabled)
                    .map(|(&t, &on)| {
                        (0..t)
                            .map(|_| {
                                on.then(|| {
                                    let core = next % n_cores;
                                    next += 1;
                                    core
                                })
                            })
                            .collect()
                    })
                    .collect())
            }
            PinningPolicy::Explicit(stages) => {
                if stages.len() != threads.len() {
                    return Err(error(format!(
                        "{} stage(s) described for {} stages",
                        stages.len(),
                        threads.len()
                    )));
                }
                let mut placement = Vec::with_capacity(stages.len());
                for (s, ((cores, &t), &on)) in stages.iter().zip(threads).zip(enabled).enumerate() {
                    if !on {
                        placement.push(vec![None; t]);
                        continue;
                    }
                    if cores.len() != t {
                        return Err(error(format!(
                            "stage {} lists {} core(s) for {} thread(s)",
                            s,
                            cores.len(),
                            t
                        )));
                    }
                    if let Some(&bad) = cores.iter().find(|&&c| c >= n_cores) {
                        return Err(error(format!(
                            "core {} does not exist ({} available)",
                            bad, n_cores
                        )));
                    }
                    placement.push(cores.iter().map(|&c| Some(c)).collect());
                }
                Ok(placement)
            }
        }
    }
}

impl fmt::Display for PinningPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PinningPolicy::None => write!(f, "none"),
            PinningPolicy::Loop => write!(f, "loop"),
            PinningPolicy::Explicit(stages) => {
                let text: Vec<String> = stages
                    .iter()
                    .map(|cores| {
                        cores
                            .iter()
                            .map(|c| format!("PU_{}", c))
                            .collect::<Vec<_>>()
                            .join(",")
                    })
                    .collect();
                write!(f, "{}", text.join("|"))
            }
        }
    }
}

/// Number of cores visible to the process.
pub fn available_cores() -> usize {
    core_affinity::get_core_ids().map_or(0, |ids| ids.len())
}

/// Pin the calling thread to `core`, logging when the OS refuses.
pub fn pin_current_thread(core: usize) -> bool {
    let pinned = core_affinity::get_core_ids()
        .and_then(|ids| ids.into_iter().find(|c| c.id == core))
        .is_some_and(core_affinity::set_for_current);
    if !pinned {
        tracing::warn!("Could not pin thread to core {}; running unpinned", core);
    }
    pinned
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_parse() {
        assert_eq!(PinningPolicy::parse("").unwrap(), PinningPolicy::None);
        assert_eq!(PinningPolicy::parse("loop").unwrap(), PinningPolicy::Loop);
        assert_eq!(
            PinningPolicy::parse("PU_0|1, PU_2|3").unwrap(),
            PinningPolicy::Explicit(vec![vec![0], vec![1, 2], vec![3]])
        );
        assert!(matches!(
            PinningPolicy::parse("PU_x|1"),
            Err(PipelineError::Pinning { .. })
        ));
    }

    #[test]
    fn test_display_round_trip() {
        let p = PinningPolicy::parse("0|1,2").unwrap();
        assert_eq!(p.to_string(), "PU_0|PU_1,PU_2");
        assert_eq!(PinningPolicy::parse(&p.to_string()).unwrap(), p);
    }

    #[test]
    fn test_resolve_loop_wraps() {
        let placement = PinningPolicy::Loop
            .resolve(&[1, 3, 1], &[false, true, true], 2)
            .unwrap();
        assert_eq!(
            placement,
            vec![vec![None], vec![Some(0), Some(1), Some(0)], vec![Some(1)]]
        );
    }

    #[test]
    fn test_resolve_explicit() {
        let p = PinningPolicy::parse("0|1,2|3").unwrap();
        let placement = p.resolve(&[1, 2, 1], &[true, true, false], 4).unwrap();
        assert_eq!(placement, vec![vec![Some(0)], vec![Some(1), Some(2)], vec![None]]);

        // Wrong thread count, missing stage, missing core.
        assert!(p.resolve(&[1, 3, 1], &[true, true, true], 4).is_err());
        assert!(p.resolve(&[1, 2], &[true, true], 4).is_err());
        assert!(p.resolve(&[1, 2, 1], &[true, true, true], 2).is_err());
    }

    #[test]
    fn test_resolve_none() {
        let placement = PinningPolicy::None.resolve(&[1, 2], &[true, true], 0).unwrap();
        assert_eq!(placement, vec![vec![None], vec![None, None]]);
        assert!(PinningPolicy::Loop.resolve(&[1], &[true], 0).is_err());
        assert!(PinningPolicy::Loop.resolve(&[1], &[true, false], 4).is_err());
    }

    #[test]
    #[serial]
    fn test_pin_current_thread() {
        let n = available_cores();
        if n > 0 {
            let pinned = std::thread::spawn(|| pin_current_thread(0)).join().unwrap();
            assert!(pinned);
        }
        let refused = std::thread::spawn(move || pin_current_thread(n + 1000))
            .join()
            .unwrap();
        assert!(!refused);
    }
}
