//! Per-task invocation statistics.
//!
//! Every task replica counts its invocations. When statistics are enabled on
//! a task, each invocation is also timed. Reports aggregate replicas of the
//! same task type (module name + task name) across threads.

use serde::Serialize;
use std::time::Duration;

/// Counters of a single task replica.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskStats {
    /// Number of invocations (always counted).
    pub n_calls: u64,
    /// Number of timed invocations (only when stats are enabled).
    pub n_timed: u64,
    pub total: Duration,
    pub min: Option<Duration>,
    pub max: Option<Duration>,
}

impl TaskStats {
    pub fn record_call(&mut self) {
        self.n_calls += 1;
    }

    pub fn record_duration(&mut self, elapsed: Duration) {
        self.n_timed += 1;
        self.total += elapsed;
        self.min = Some(self.min.map_or(elapsed, |m| m.min(elapsed)));
        self.max = Some(self.max.map_or(elapsed, |m| m.max(elapsed)));
    }

    /// Fold another replica's counters into this one.
    pub fn merge(&mut self, other: &TaskStats) {
        self.n_calls += other.n_calls;
        self.n_timed += other.n_timed;
        self.total += other.total;
        self.min = match (self.min, other.min) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max = match (self.max, other.max) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }

    pub fn average(&self) -> Option<Duration> {
        if self.n_timed == 0 {
            None
        } else {
            let nanos = self.total.as_nanos() / u128::from(self.n_timed);
            Some(Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX)))
        }
    }
}

/// Aggregated statistics for one task type.
#[derive(Debug, Clone, Serialize)]
pub struct TaskTypeReport {
    pub module: String,
    pub task: String,
    /// Number of replicas folded into this entry.
    pub replicas: usize,
    pub n_calls: u64,
    pub total_us: f64,
    pub average_us: Option<f64>,
    pub min_us: Option<f64>,
    pub max_us: Option<f64>,
}

/// Fold `(module, task, stats)` triples into one report per task type,
/// keeping first-seen order.
pub fn aggregate<'a, I>(entries: I) -> Vec<TaskTypeReport>
where
    I: IntoIterator<Item = (&'a str, &'a str, &'a TaskStats)>,
{
    let mut keys: Vec<(String, String)> = Vec::new();
    let mut merged: Vec<(usize, TaskStats)> = Vec::new();

    for (module, task, stats) in entries {
        match keys.iter().position(|(m, t)| m == module && t == task) {
            Some(i) => {
                merged[i].0 += 1;
                merged[i].1.merge(stats);
            }
            None => {
                keys.push((module.to_string(), task.to_string()));
                merged.push((1, stats.clone()));
            }
        }
    }

    let micros = |d: Duration| d.as_secs_f64() * 1e6;
    keys.into_iter()
        .zip(merged)
        .map(|((module, task), (replicas, stats))| TaskTypeReport {
            module,
            task,
            replicas,
            n_calls: stats.n_calls,
            total_us: micros(stats.total),
            average_us: stats.average().map(micros),
            min_us: stats.min.map(micros),
            max_us: stats.max.map(micros),
        })
        .collect()
}

/// Render reports as the fixed-width table printed by the benchmark.
pub fn format_table(reports: &[TaskTypeReport]) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "# {:<24} {:>6} {:>12} {:>12} {:>12} {:>12}\n",
        "Task", "Repl.", "Calls", "Avg (us)", "Min (us)", "Max (us)"
    ));
    for r in reports {
        let fmt_opt = |v: Option<f64>| v.map_or_else(|| "-".to_string(), |v| format!("{:.2}", v));
        out.push_str(&format!(
            "# {:<24} {:>6} {:>12} {:>12} {:>12} {:>12}\n",
            format!("{}::{}", r.module, r.task),
            r.replicas,
            r.n_calls,
            fmt_opt(r.average_us),
            fmt_opt(r.min_us),
            fmt_opt(r.max_us),
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_merge() {
        let mut a = TaskStats::default();
        a.record_call();
        a.record_duration(Duration::from_micros(10));
        let mut b = TaskStats::default();
        b.record_call();
        b.record_call();
        b.record_duration(Duration::from_micros(30));

        a.merge(&b);
        assert_eq!(a.n_calls, 3);
        assert_eq!(a.n_timed, 2);
        assert_eq!(a.min, Some(Duration::from_micros(10)));
        assert_eq!(a.max, Some(Duration::from_micros(30)));
        assert_eq!(a.average(), Some(Duration::from_micros(20)));
    }

    #[test]
    fn test_average_with_huge_call_count() {
        let stats = TaskStats {
            n_calls: 1 << 32,
            n_timed: 1 << 32,
            total: Duration::from_secs(1 << 32),
            min: None,
            max: None,
        };
        assert_eq!(stats.average(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_aggregate_groups_by_type() {
        let mut s = TaskStats::default();
        s.record_call();
        let entries = vec![
            ("Relayer", "relay", &s),
            ("Source", "generate", &s),
            ("Relayer", "relay", &s),
        ];
        let reports = aggregate(entries);
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].module, "Relayer");
        assert_eq!(reports[0].replicas, 2);
        assert_eq!(reports[0].n_calls, 2);
        assert_eq!(reports[0].average_us, None);
        assert!(format_table(&reports).contains("Source::generate"));
    }
}
