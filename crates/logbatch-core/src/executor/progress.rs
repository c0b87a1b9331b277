use std::{
    fmt,
    time::{Duration, Instant},
};

use serde::Serialize;

/// 某一时刻的进度快照。
///
/// 纯计算结果：由 `(completed, total, started, now)` 唯一决定，不持有状态。
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ProgressReport {
    pub completed: usize,
    pub total: usize,
    pub percent: f64,
    pub elapsed: Duration,
    /// `completed == 0` 时无法估计，为 `None`；全部完成时为零。
    pub eta: Option<Duration>,
}

impl ProgressReport {
    /// `eta = elapsed / completed * (total - completed)`。
    ///
    /// `completed` 超过 `total` 时按 `total` 截断；`total == 0` 视为已完成。
    pub fn compute(completed: usize, total: usize, started: Instant, now: Instant) -> Self {
        let completed = completed.min(total);
        let elapsed = now.saturating_duration_since(started);
        let percent = if total == 0 {
            100.0
        } else {
            completed as f64 * 100.0 / total as f64
        };
        let eta = (completed > 0).then(|| {
            let nanos = elapsed
                .as_nanos()
                .saturating_mul((total - completed) as u128)
                / completed as u128;
            Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
        });
        Self {
            completed,
            total,
            percent,
            elapsed,
            eta,
        }
    }

    /// 是否已全部完成。
    pub fn is_complete(&self) -> bool {
        self.completed >= self.total
    }
}

impl fmt::Display for ProgressReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} ({:.1}%) elapsed {}",
            self.completed,
            self.total,
            self.percent,
            format_duration(self.elapsed)
        )?;
        match self.eta {
            Some(eta) => write!(f, " eta {}", format_duration(eta)),
            None => f.write_str(" eta --"),
        }
    }
}

/// `1h02m03s` / `2m05s` / `4.2s`。
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    match secs {
        0..=59 => format!("{:.1}s", duration.as_secs_f64()),
        60..=3599 => format!("{}m{:02}s", secs / 60, secs % 60),
        _ => format!("{}h{:02}m{:02}s", secs / 3600, (secs % 3600) / 60, secs % 60),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eta_is_unknown_until_first_completion() {
        let start = Instant::now();
        let report = ProgressReport::compute(0, 10, start, start + Duration::from_secs(5));
        assert_eq!(report.percent, 0.0);
        assert_eq!(report.eta, None);
        assert_eq!(report.to_string(), "0/10 (0.0%) elapsed 5.0s eta --");
    }

    #[test]
    fn eta_scales_with_remaining_jobs() {
        let start = Instant::now();
        let report = ProgressReport::compute(4, 10, start, start + Duration::from_secs(8));
        assert_eq!(report.percent, 40.0);
        assert_eq!(report.eta, Some(Duration::from_secs(12)));
        assert!(!report.is_complete());
    }

    #[test]
    fn finished_and_empty_runs_are_complete() {
        let start = Instant::now();
        let done = ProgressReport::compute(3, 3, start, start + Duration::from_secs(90));
        assert_eq!(done.eta, Some(Duration::ZERO));
        assert_eq!(done.to_string(), "3/3 (100.0%) elapsed 1m30s eta 0.0s");

        let empty = ProgressReport::compute(0, 0, start, start);
        assert!(empty.is_complete());
        assert_eq!(empty.percent, 100.0);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn counts_beyond_u32_keep_an_exact_eta() {
        let start = Instant::now();
        let half = u32::MAX as usize + 1;
        let report = ProgressReport::compute(half, half * 2, start, start + Duration::from_secs(10));
        assert_eq!(report.percent, 50.0);
        assert_eq!(report.eta, Some(Duration::from_secs(10)));
    }

    #[test]
    fn clock_skew_never_panics() {
        let now = Instant::now();
        let report = ProgressReport::compute(7, 5, now + Duration::from_secs(1), now);
        assert_eq!(report.completed, 5);
        assert_eq!(report.elapsed, Duration::ZERO);
    }
}
