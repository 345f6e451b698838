use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::core::macros::string_enum;
use crate::core::metadata::empty_map;
use crate::core::severity::Severity;
use crate::store::table::entity;

string_enum! {
    pub enum TestType {
        Configuration => "configuration",
        VulnerabilityScan => "vulnerability_scan",
        AccessReview => "access_review",
        LogAnalysis => "log_analysis",
        PolicyCheck => "policy_check",
        EvidenceCheck => "evidence_check",
        ApiCheck => "api_check",
        Custom => "custom",
    }
}

string_enum! {
    pub enum TestStatus {
        Draft => "draft",
        Active => "active",
        Paused => "paused",
        Deprecated => "deprecated",
    }
}

impl TestStatus {
    pub fn can_transition_to(self, next: TestStatus) -> bool {
        use TestStatus::*;
        matches!(
            (self, next),
            (Draft, Active) | (Active, Paused) | (Active, Deprecated) | (Paused, Active) | (Paused, Deprecated)
        )
    }
}

string_enum! {
    pub enum RunStatus {
        Pending => "pending",
        Running => "running",
        Completed => "completed",
        Failed => "failed",
        Cancelled => "cancelled",
    }
}

impl RunStatus {
    pub fn is_in_flight(self) -> bool {
        matches!(self, RunStatus::Pending | RunStatus::Running)
    }
}

string_enum! {
    pub enum TriggerType {
        Manual => "manual",
        Scheduled => "scheduled",
        Api => "api",
    }
}

impl Default for TriggerType {
    fn default() -> Self {
        Self::Manual
    }
}

string_enum! {
    pub enum ResultStatus {
        Pass => "pass",
        Fail => "fail",
        Error => "error",
        Warning => "warning",
        Skipped => "skipped",
    }
}

impl ResultStatus {
    pub fn is_failure(self) -> bool {
        matches!(self, ResultStatus::Fail | ResultStatus::Error)
    }

    /// Results that alert rules are evaluated against.
    pub fn is_alertable(self) -> bool {
        matches!(self, ResultStatus::Fail | ResultStatus::Error | ResultStatus::Warning)
    }
}

/// A scheduled check against one control. Named `ControlTest` to stay clear
/// of the `test` attribute namespace.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = crate::store::schema::tests, check_for_backend(diesel::pg::Pg), treat_none_as_null = true)]
pub struct ControlTest {
    pub id: Uuid,
    pub org_id: Uuid,
    pub identifier: String,
    pub title: String,
    pub description: String,
    pub test_type: TestType,
    pub severity: Severity,
    pub status: TestStatus,
    pub control_id: Uuid,
    pub cron_expression: Option<String>,
    pub interval_minutes: Option<i32>,
    pub timeout_seconds: i32,
    pub retry_count: i32,
    pub retry_delay_seconds: i32,
    pub tags: Vec<String>,
    pub configuration: Value,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_result_status: Option<ResultStatus>,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

entity!(ControlTest => tests, tenant);

impl ControlTest {
    pub fn new(org_id: Uuid, identifier: String, title: String, test_type: TestType, control_id: Uuid, created_by: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            org_id,
            identifier,
            title,
            description: String::new(),
            test_type,
            severity: Severity::Medium,
            status: TestStatus::Draft,
            control_id,
            cron_expression: None,
            interval_minutes: Some(60),
            timeout_seconds: 300,
            retry_count: 0,
            retry_delay_seconds: 60,
            tags: Vec::new(),
            configuration: empty_map(),
            next_run_at: None,
            last_run_at: None,
            last_result_status: None,
            created_by,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = crate::store::schema::test_runs, check_for_backend(diesel::pg::Pg), treat_none_as_null = true)]
pub struct TestRun {
    pub id: Uuid,
    pub org_id: Uuid,
    pub run_number: i64,
    pub status: RunStatus,
    pub trigger_type: TriggerType,
    pub trigger_metadata: Value,
    /// Explicit selection; empty means every active test.
    pub test_ids: Vec<Uuid>,
    pub total_tests: i32,
    pub passed: i32,
    pub failed: i32,
    pub errors: i32,
    pub skipped: i32,
    pub warnings: i32,
    pub worker_id: Option<String>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

entity!(TestRun => test_runs, sequenced "test_runs" => run_number);

impl TestRun {
    pub fn new(org_id: Uuid, trigger_type: TriggerType, created_by: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            org_id,
            run_number: 0,
            status: RunStatus::Pending,
            trigger_type,
            trigger_metadata: empty_map(),
            test_ids: Vec::new(),
            total_tests: 0,
            passed: 0,
            failed: 0,
            errors: 0,
            skipped: 0,
            warnings: 0,
            worker_id: None,
            error_message: None,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            created_by,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn count(&mut self, status: ResultStatus) {
        match status {
            ResultStatus::Pass => self.passed += 1,
            ResultStatus::Fail => self.failed += 1,
            ResultStatus::Error => self.errors += 1,
            ResultStatus::Warning => self.warnings += 1,
            ResultStatus::Skipped => self.skipped += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = crate::store::schema::test_results, check_for_backend(diesel::pg::Pg), treat_none_as_null = true)]
pub struct TestResult {
    pub id: Uuid,
    pub org_id: Uuid,
    pub run_id: Uuid,
    pub test_id: Uuid,
    pub control_id: Uuid,
    pub status: ResultStatus,
    pub severity: Severity,
    pub message: Option<String>,
    pub details: Value,
    pub duration_ms: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub alert_generated: bool,
    pub alert_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

entity!(TestResult => test_results, tenant, { in_run => run_id, of_test => test_id });

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_graph() {
        assert!(TestStatus::Draft.can_transition_to(TestStatus::Active));
        assert!(!TestStatus::Draft.can_transition_to(TestStatus::Paused));
        assert!(TestStatus::Paused.can_transition_to(TestStatus::Active));
        for next in TestStatus::ALL {
            assert!(!TestStatus::Deprecated.can_transition_to(*next));
        }
    }

    #[test]
    fn test_counts_follow_status() {
        let mut run = TestRun::new(Uuid::new_v4(), TriggerType::Api, Uuid::new_v4());
        run.count(ResultStatus::Fail);
        run.count(ResultStatus::Pass);
        run.count(ResultStatus::Warning);
        assert_eq!((run.passed, run.failed, run.warnings, run.errors), (1, 1, 1, 0));
    }
}
