//! Health check results and failover incidents.

use crate::time::{Timestamp, now_utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

impl CheckStatus {
    /// Score contribution used by the weighted aggregate.
    pub fn score(&self) -> f64 {
        match self {
            CheckStatus::Pass => 100.0,
            CheckStatus::Warn => 50.0,
            CheckStatus::Fail => 0.0,
        }
    }

    /// The worse of two statuses.
    pub fn worst(self, other: CheckStatus) -> CheckStatus {
        if other.score() < self.score() { other } else { self }
    }
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckStatus::Pass => write!(f, "pass"),
            CheckStatus::Warn => write!(f, "warn"),
            CheckStatus::Fail => write!(f, "fail"),
        }
    }
}

/// Outcome of one named check. Never mutated after it is recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResult {
    pub check_name: String,
    pub status: CheckStatus,
    pub score_delta: f64,
    pub timestamp: Timestamp,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
}

impl HealthCheckResult {
    pub fn new(check_name: impl Into<String>, status: CheckStatus, message: impl Into<String>) -> Self {
        Self {
            check_name: check_name.into(),
            status,
            score_delta: status.score() - 100.0,
            timestamp: now_utc(),
            message: message.into(),
            latency_ms: None,
        }
    }

    pub fn with_latency_ms(mut self, latency_ms: f64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateStatus {
    Normal,
    Failover,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentSeverity {
    Minor,
    Major,
    Critical,
}

impl IncidentSeverity {
    /// Severity for an aggregate score that triggered failover.
    pub fn for_score(score: f64) -> Self {
        if score < 20.0 {
            IncidentSeverity::Critical
        } else if score < 40.0 {
            IncidentSeverity::Major
        } else {
            IncidentSeverity::Minor
        }
    }

    fn raised(self) -> Self {
        match self {
            IncidentSeverity::Minor => IncidentSeverity::Major,
            IncidentSeverity::Major | IncidentSeverity::Critical => IncidentSeverity::Critical,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentState {
    Open,
    Escalated,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Incident {
    pub id: Uuid,
    pub opened_at: Timestamp,
    pub closed_at: Option<Timestamp>,
    pub cause: String,
    pub severity: IncidentSeverity,
    pub state: IncidentState,
    pub affected_checks: Vec<String>,
}

impl Incident {
    pub fn open(
        cause: impl Into<String>,
        severity: IncidentSeverity,
        affected_checks: Vec<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            opened_at: now_utc(),
            closed_at: None,
            cause: cause.into(),
            severity,
            state: IncidentState::Open,
            affected_checks,
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self.state, IncidentState::Closed)
    }

    /// Returns `true` if the state changed.
    pub fn escalate(&mut self) -> bool {
        if self.state != IncidentState::Open {
            return false;
        }
        self.state = IncidentState::Escalated;
        self.severity = self.severity.raised();
        true
    }

    /// Returns `true` if the state changed.
    pub fn close(&mut self) -> bool {
        if self.state == IncidentState::Closed {
            return false;
        }
        self.state = IncidentState::Closed;
        self.closed_at = Some(now_utc());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_status_scores() {
        assert_eq!(CheckStatus::Pass.score(), 100.0);
        assert_eq!(CheckStatus::Warn.score(), 50.0);
        assert_eq!(CheckStatus::Fail.score(), 0.0);
        assert_eq!(CheckStatus::Pass.worst(CheckStatus::Warn), CheckStatus::Warn);
        assert_eq!(CheckStatus::Fail.worst(CheckStatus::Warn), CheckStatus::Fail);
    }

    #[test]
    fn test_result_score_delta() {
        let result = HealthCheckResult::new("entry_store", CheckStatus::Fail, "all nodes down");
        assert_eq!(result.score_delta, -100.0);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["checkName"], "entry_store");
        assert_eq!(json["status"], "fail");
        assert!(json.get("latencyMs").is_none());
    }

    #[test]
    fn test_incident_lifecycle() {
        let mut incident = Incident::open(
            "aggregate score 0 below 50",
            IncidentSeverity::for_score(0.0),
            vec!["entry_store".into()],
        );
        assert_eq!(incident.severity, IncidentSeverity::Critical);
        assert!(incident.is_active());

        assert!(incident.escalate());
        assert_eq!(incident.state, IncidentState::Escalated);
        assert!(!incident.escalate());

        assert!(incident.close());
        assert!(incident.closed_at.is_some());
        assert!(!incident.is_active());
        assert!(!incident.close());
    }

    #[test]
    fn test_escalation_raises_severity() {
        let mut incident = Incident::open("slow", IncidentSeverity::Minor, vec![]);
        incident.escalate();
        assert_eq!(incident.severity, IncidentSeverity::Major);
    }
}
