//! Human-readable health summaries.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::alerts::RecommendedAction;
use super::monitor::MonitoringSnapshot;

/// Coarse classification of the monitor's current counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Good,
    Warning,
    Critical,
}

impl HealthStatus {
    pub fn from_snapshot(stats: &MonitoringSnapshot) -> Self {
        if stats.success_rate < 60.0 || stats.consecutive_errors > 5 {
            Self::Critical
        } else if stats.success_rate < 80.0 {
            Self::Warning
        } else {
            Self::Good
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Good => write!(f, "GOOD"),
            Self::Warning => write!(f, "WARNING"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub generated_at: DateTime<Utc>,
    pub stats: MonitoringSnapshot,
    pub recommended_action: RecommendedAction,
    pub should_stop: bool,
}

impl HealthReport {
    pub fn new(
        stats: MonitoringSnapshot,
        recommended_action: RecommendedAction,
        should_stop: bool,
        generated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            status: HealthStatus::from_snapshot(&stats),
            generated_at,
            stats,
            recommended_action,
            should_stop,
        }
    }
}

impl fmt::Display for HealthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Health report ({})", self.generated_at.to_rfc3339())?;
        writeln!(f, "  status:              {}", self.status)?;
        writeln!(
            f,
            "  requests:            {} total, {} ok, {} failed, {} rejected",
            self.stats.total_requests,
            self.stats.success_count,
            self.stats.error_count,
            self.stats.rejected_requests
        )?;
        writeln!(f, "  success rate:        {:.1}%", self.stats.success_rate)?;
        writeln!(
            f,
            "  avg response time:   {}ms",
            self.stats.average_response_time.as_millis()
        )?;
        writeln!(f, "  consecutive errors:  {}", self.stats.consecutive_errors)?;
        for (kind, count) in &self.stats.errors_by_kind {
            writeln!(f, "    {kind}: {count}")?;
        }
        writeln!(
            f,
            "  alerts:              {} sent, {} suppressed",
            self.stats.alerts_sent, self.stats.alerts_suppressed
        )?;
        writeln!(f, "  recommended action:  {}", self.recommended_action)?;
        write!(f, "  should stop:         {}", self.should_stop)
    }
}
