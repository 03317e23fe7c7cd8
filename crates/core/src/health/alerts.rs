//! Alerts raised by the health monitor and the sinks that receive them.

use std::fmt;

use bulwark_common::error::{ErrorKind, ErrorSeverity};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::monitor::MonitoringSnapshot;
use crate::endpoint::EndpointKey;

/// Remediation the coordinator can apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecommendedAction {
    Continue,
    RotateIdentity,
    ReduceLoad,
    CooldownMode,
}

impl fmt::Display for RecommendedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Continue => write!(f, "CONTINUE"),
            Self::RotateIdentity => write!(f, "ROTATE_IDENTITY"),
            Self::ReduceLoad => write!(f, "REDUCE_LOAD"),
            Self::CooldownMode => write!(f, "COOLDOWN_MODE"),
        }
    }
}

/// Condition that caused an alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlertTrigger {
    /// A critical error kind repeated on one endpoint inside the time window
    CriticalBurst { kind: ErrorKind, count: usize },
    ConsecutiveErrors { count: u32 },
    LowSuccessRate { success_rate: f64 },
}

impl AlertTrigger {
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::CriticalBurst { kind: ErrorKind::Forbidden, .. } => ErrorSeverity::Critical,
            Self::CriticalBurst { .. } | Self::ConsecutiveErrors { .. } => ErrorSeverity::Error,
            Self::LowSuccessRate { .. } => ErrorSeverity::Warning,
        }
    }

    pub fn action(&self) -> RecommendedAction {
        match self {
            Self::CriticalBurst { kind: ErrorKind::Forbidden, .. } => {
                RecommendedAction::CooldownMode
            }
            Self::CriticalBurst { .. } | Self::LowSuccessRate { .. } => {
                RecommendedAction::ReduceLoad
            }
            Self::ConsecutiveErrors { .. } => RecommendedAction::RotateIdentity,
        }
    }

    pub fn title(&self) -> String {
        match self {
            Self::CriticalBurst { kind, count } => {
                format!("{count} {kind} errors on one endpoint within the monitoring window")
            }
            Self::ConsecutiveErrors { count } => format!("{count} consecutive errors"),
            Self::LowSuccessRate { success_rate } => {
                format!("success rate dropped to {success_rate:.1}%")
            }
        }
    }

    pub fn recommendation(&self) -> &'static str {
        match self {
            Self::CriticalBurst { kind: ErrorKind::Forbidden, .. } => {
                "Access is being blocked. Enable cooldown mode and rotate the client identity \
                 before retrying this endpoint."
            }
            Self::CriticalBurst { kind: ErrorKind::RateLimited, .. } => {
                "Upstream is throttling requests. Lower the global quota and widen request \
                 spacing."
            }
            Self::CriticalBurst { .. } => {
                "Endpoint is unreachable. Reduce load and let the circuit recover before retrying."
            }
            Self::ConsecutiveErrors { .. } => {
                "Requests keep failing with the current identity. Rotate to a fresh identity."
            }
            Self::LowSuccessRate { .. } => {
                "Success rate is below threshold. Reduce request load until it recovers."
            }
        }
    }
}

/// Alert emitted by the health monitor.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: Uuid,
    pub raised_at: DateTime<Utc>,
    pub severity: ErrorSeverity,
    pub trigger: AlertTrigger,
    pub title: String,
    pub recommendation: String,
    pub action: RecommendedAction,
    pub endpoint: EndpointKey,
    pub operation: Option<String>,
    pub stats: MonitoringSnapshot,
}

impl Alert {
    pub(crate) fn new(
        trigger: AlertTrigger,
        raised_at: DateTime<Utc>,
        endpoint: EndpointKey,
        operation: Option<String>,
        stats: MonitoringSnapshot,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            raised_at,
            severity: trigger.severity(),
            title: trigger.title(),
            recommendation: trigger.recommendation().to_string(),
            action: trigger.action(),
            trigger,
            endpoint,
            operation,
            stats,
        }
    }
}

/// Destination for alerts; implementations must not fail or block.
pub trait AlertSink: Send + Sync {
    fn send(&self, alert: &Alert);
}

/// Forwards alerts to `tracing` at a level matching their severity.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn send(&self, alert: &Alert) {
        let id = alert.id.to_string();
        match alert.severity {
            ErrorSeverity::Critical | ErrorSeverity::Error => error!(
                alert_id = %id,
                severity = %alert.severity,
                endpoint = %alert.endpoint,
                action = %alert.action,
                title = %alert.title,
                recommendation = %alert.recommendation,
                "health_alert"
            ),
            ErrorSeverity::Warning => warn!(
                alert_id = %id,
                endpoint = %alert.endpoint,
                action = %alert.action,
                title = %alert.title,
                "health_alert"
            ),
            ErrorSeverity::Info => info!(alert_id = %id, title = %alert.title, "health_alert"),
        }
    }
}

/// Keeps alerts in memory so callers can inspect them.
#[derive(Debug, Default)]
pub struct MemoryAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl MemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.alerts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.lock().is_empty()
    }

    pub fn clear(&self) {
        self.alerts.lock().clear();
    }
}

impl AlertSink for MemoryAlertSink {
    fn send(&self, alert: &Alert) {
        self.alerts.lock().push(alert.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_actions() {
        let forbidden = AlertTrigger::CriticalBurst { kind: ErrorKind::Forbidden, count: 3 };
        let throttled = AlertTrigger::CriticalBurst { kind: ErrorKind::RateLimited, count: 3 };

        assert_eq!(forbidden.action(), RecommendedAction::CooldownMode);
        assert_eq!(forbidden.severity(), ErrorSeverity::Critical);
        assert_eq!(throttled.action(), RecommendedAction::ReduceLoad);
        assert_eq!(
            AlertTrigger::ConsecutiveErrors { count: 5 }.action(),
            RecommendedAction::RotateIdentity
        );
        assert!(!AlertTrigger::LowSuccessRate { success_rate: 40.0 }.recommendation().is_empty());
    }

    #[test]
    fn test_action_display_matches_serde() {
        let json = serde_json::to_string(&RecommendedAction::CooldownMode).ok();
        assert_eq!(json.as_deref(), Some(r#""COOLDOWN_MODE""#));
        assert_eq!(RecommendedAction::RotateIdentity.to_string(), "ROTATE_IDENTITY");
    }
}
