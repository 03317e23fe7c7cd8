//! Request health tracking, alerting and reporting.

pub mod alerts;
pub mod monitor;
pub mod report;

pub use alerts::{
    Alert, AlertSink, AlertTrigger, MemoryAlertSink, RecommendedAction, TracingAlertSink,
};
pub use monitor::{HealthMonitor, MonitorConfig, MonitoringSnapshot};
pub use report::{HealthReport, HealthStatus};
