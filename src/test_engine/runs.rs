//! Test runs and the execution-engine interface.
//!
//! At most one run per organization is pending or running; the partial
//! unique index on [`TestRun`] enforces it inside the insert. Results are
//! recorded one at a time by the engine and alert rules are evaluated in the
//! same transaction as the result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashSet;
use uuid::Uuid;

use super::definitions::{compare_results, ListResultsQuery};
use super::schedule::next_run_after;
use super::types::{ResultStatus, RunStatus, TestResult, TestRun, TestStatus, TriggerType};
use crate::alerts::generation::generate_alert;
use crate::alerts::Alert;
use crate::core::error::ApiError;
use crate::core::extract::parse_filter;
use crate::core::metadata::{self, empty_map};
use crate::core::pagination::{ListSpec, Page, PageParams, SortOrder};
use crate::core::severity::Severity;
use crate::security::audit::{record_all, AuditEvent};
use crate::security::auth::{AuthenticatedUser, OPERATIONS};
use crate::security::validation::Validator;
use crate::store::{Store, Tables};

const RUN_LIST: ListSpec = ListSpec {
    default_per_page: 20,
    max_per_page: 100,
    sort_fields: &["run_number", "created_at", "status"],
    default_sort: "run_number",
    default_order: SortOrder::Desc,
};

const RUN_RESULT_LIST: ListSpec = ListSpec {
    default_per_page: 50,
    max_per_page: 200,
    sort_fields: &["created_at", "status"],
    default_sort: "created_at",
    default_order: SortOrder::Asc,
};

const MAX_EXPLICIT_TESTS: usize = 1000;

#[derive(Debug, Default, Deserialize)]
pub struct ListRunsQuery {
    pub status: Option<String>,
    pub trigger_type: Option<String>,
    #[serde(flatten)]
    pub page: PageParams,
}

/// An empty `test_ids` runs every active test.
#[derive(Debug, Default, Deserialize)]
pub struct CreateRunRequest {
    #[serde(default)]
    pub test_ids: Vec<Uuid>,
    #[serde(default)]
    pub trigger_type: TriggerType,
    pub trigger_metadata: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct StartRunRequest {
    pub worker_id: String,
}

#[derive(Debug, Deserialize)]
pub struct RecordResultRequest {
    pub test_id: Uuid,
    pub status: ResultStatus,
    pub severity: Option<Severity>,
    pub message: Option<String>,
    pub details: Option<Value>,
    pub duration_ms: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct FinishRunRequest {
    pub status: RunStatus,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordedResult {
    pub result: TestResult,
    pub alert: Option<Alert>,
}

fn load(tables: &mut Tables, org_id: Uuid, run_id: Uuid) -> Result<TestRun, ApiError> {
    tables
        .test_runs()
        .find(org_id, run_id)?
        .ok_or_else(|| ApiError::not_found("Test run"))
}

fn require_status(run: &TestRun, expected: RunStatus, operation: &str) -> Result<(), ApiError> {
    if run.status == expected {
        Ok(())
    } else {
        Err(ApiError::Unprocessable(format!(
            "Cannot {operation} run #{} in status '{}'",
            run.run_number, run.status
        )))
    }
}

pub fn list_runs(store: &Store, caller: &AuthenticatedUser, query: &ListRunsQuery) -> Result<Page<TestRun>, ApiError> {
    let status: Option<RunStatus> = parse_filter(&query.status, "status")?;
    let trigger_type: Option<TriggerType> = parse_filter(&query.trigger_type, "trigger_type")?;
    let runs: Vec<TestRun> = store
        .read(|tables| tables.test_runs().scan(caller.org_id))?
        .into_iter()
        .filter(|r| status.map_or(true, |s| r.status == s))
        .filter(|r| trigger_type.map_or(true, |t| r.trigger_type == t))
        .collect();
    Ok(query.page.resolve(&RUN_LIST).apply(runs, compare_runs))
}

fn compare_runs(a: &TestRun, b: &TestRun, sort: &str) -> Ordering {
    match sort {
        "created_at" => a.created_at.cmp(&b.created_at),
        "status" => a.status.as_str().cmp(b.status.as_str()),
        _ => a.run_number.cmp(&b.run_number),
    }
}

pub fn get_run(store: &Store, caller: &AuthenticatedUser, run_id: Uuid) -> Result<TestRun, ApiError> {
    store.read(|tables| load(tables, caller.org_id, run_id))
}

pub fn list_run_results(
    store: &Store,
    caller: &AuthenticatedUser,
    run_id: Uuid,
    query: &ListResultsQuery,
) -> Result<Page<TestResult>, ApiError> {
    let status: Option<ResultStatus> = parse_filter(&query.status, "status")?;
    let results = store.read(|tables| {
        load(tables, caller.org_id, run_id)?;
        Ok::<_, ApiError>(
            tables
                .test_results()
                .in_run(run_id)?
                .into_iter()
                .filter(|r| status.map_or(true, |s| r.status == s))
                .collect::<Vec<_>>(),
        )
    })?;
    Ok(query.page.resolve(&RUN_RESULT_LIST).apply(results, compare_results))
}

/// Creates a pending run. Fails with CONFLICT while another run of the
/// organization is pending or running.
pub fn create_run(store: &Store, caller: &AuthenticatedUser, req: CreateRunRequest) -> Result<TestRun, ApiError> {
    caller.require(OPERATIONS)?;
    Validator::new()
        .check(
            req.test_ids.len() <= MAX_EXPLICIT_TESTS,
            "test_ids",
            "must contain at most 1000 ids",
        )
        .validate()?;
    if let Some(meta) = &req.trigger_metadata {
        metadata::check_map(meta, "trigger_metadata")?;
    }

    let mut test_ids = Vec::with_capacity(req.test_ids.len());
    for id in req.test_ids {
        if !test_ids.contains(&id) {
            test_ids.push(id);
        }
    }

    let run = store.transaction(|tables| {
        if tables.test_runs().scan(caller.org_id)?.into_iter().any(|r| r.status.is_in_flight()) {
            return Err(ApiError::Conflict(
                "A test run is already pending or running for this organization".into(),
            ));
        }

        let total = if test_ids.is_empty() {
            tables
                .tests()
                .scan(caller.org_id)?
                .into_iter()
                .filter(|t| t.status == TestStatus::Active)
                .count()
        } else {
            let known: HashSet<Uuid> = tables.tests().scan(caller.org_id)?.into_iter().map(|t| t.id).collect();
            let missing = test_ids.iter().filter(|id| !known.contains(id)).count();
            if missing > 0 {
                return Err(ApiError::field(
                    "test_ids",
                    format!("{missing} test id(s) do not exist in this organization"),
                ));
            }
            test_ids.len()
        };
        if total == 0 {
            return Err(ApiError::BadRequest("No active tests to run".into()));
        }

        let mut run = TestRun::new(caller.org_id, req.trigger_type, caller.user_id);
        run.test_ids = test_ids;
        run.total_tests = i32::try_from(total).unwrap_or(i32::MAX);
        run.trigger_metadata = req.trigger_metadata.unwrap_or_else(empty_map);
        tables
            .test_runs()
            .insert_sequenced(run)
            .map_err(|e| ApiError::conflict_or(e, "A test run is already pending or running for this organization"))
    })?;

    AuditEvent::new(caller, "test_run.created", "test_run", run.id)
        .with_metadata("run_number", run.run_number)
        .with_metadata("total_tests", run.total_tests)
        .with_metadata("trigger_type", run.trigger_type.as_str())
        .record(store);
    Ok(run)
}

pub fn cancel_run(store: &Store, caller: &AuthenticatedUser, run_id: Uuid) -> Result<TestRun, ApiError> {
    caller.require(OPERATIONS)?;
    let (run, previous) = store.transaction(|tables| {
        let mut run = load(tables, caller.org_id, run_id)?;
        let previous = run.status;
        if !previous.is_in_flight() {
            return Err(ApiError::invalid_transition("test run", previous, RunStatus::Cancelled));
        }
        let now = Utc::now();
        run.status = RunStatus::Cancelled;
        run.completed_at = Some(now);
        run.updated_at = now;
        Ok((tables.test_runs().update(run)?, previous))
    })?;

    AuditEvent::new(caller, "test_run.cancelled", "test_run", run.id)
        .with_metadata("from", previous.as_str())
        .with_metadata("run_number", run.run_number)
        .record(store);
    Ok(run)
}

pub fn start_run(store: &Store, caller: &AuthenticatedUser, run_id: Uuid, req: StartRunRequest) -> Result<TestRun, ApiError> {
    caller.require(OPERATIONS)?;
    let worker_id = req.worker_id.trim().to_string();
    Validator::new()
        .required(&worker_id, "worker_id")
        .length(&worker_id, "worker_id", None, Some(255))
        .validate()?;

    let run = store.transaction(|tables| {
        let mut run = load(tables, caller.org_id, run_id)?;
        require_status(&run, RunStatus::Pending, "start")?;
        let now = Utc::now();
        run.status = RunStatus::Running;
        run.worker_id = Some(worker_id);
        run.started_at = Some(now);
        run.updated_at = now;
        Ok::<_, ApiError>(tables.test_runs().update(run)?)
    })?;

    AuditEvent::new(caller, "test_run.started", "test_run", run.id)
        .with_metadata("run_number", run.run_number)
        .with_metadata("worker_id", run.worker_id.clone().unwrap_or_default())
        .record(store);
    Ok(run)
}

/// Stores one result, updates the run counters and the test's last
/// outcome, then evaluates alert rules against it.
pub fn record_result(
    store: &Store,
    caller: &AuthenticatedUser,
    run_id: Uuid,
    req: RecordResultRequest,
) -> Result<RecordedResult, ApiError> {
    caller.require(OPERATIONS)?;
    Validator::new()
        .optional_length(req.message.as_deref(), "message", 10000)
        .check(req.duration_ms.map_or(true, |d| d >= 0), "duration_ms", "must not be negative")
        .validate()?;
    if let Some(details) = &req.details {
        metadata::check_map(details, "details")?;
    }

    let recorded = store.transaction(|tables| {
        let mut run = load(tables, caller.org_id, run_id)?;
        require_status(&run, RunStatus::Running, "record results for")?;
        let mut test = tables
            .tests()
            .find(caller.org_id, req.test_id)?
            .ok_or_else(|| ApiError::field("test_id", "test does not exist in this organization"))?;
        if !run.test_ids.is_empty() && !run.test_ids.contains(&test.id) {
            return Err(ApiError::field("test_id", "test is not part of this run"));
        }

        let now = Utc::now();
        let result = tables
            .test_results()
            .insert(TestResult {
                id: Uuid::new_v4(),
                org_id: caller.org_id,
                run_id,
                test_id: test.id,
                control_id: test.control_id,
                status: req.status,
                severity: req.severity.unwrap_or(test.severity),
                message: req.message,
                details: req.details.unwrap_or_else(empty_map),
                duration_ms: req.duration_ms,
                started_at: req.started_at,
                completed_at: req.completed_at,
                alert_generated: false,
                alert_id: None,
                created_at: now,
            })
            .map_err(|e| ApiError::conflict_or(e, "A result for this test was already recorded in this run"))?;

        run.count(result.status);
        run.updated_at = now;
        tables.test_runs().update(run)?;

        test.last_run_at = Some(result.completed_at.unwrap_or(now));
        test.last_result_status = Some(result.status);
        if test.status == TestStatus::Active {
            test.next_run_at = next_run_after(&test, now);
        }
        test.updated_at = now;
        tables.tests().update(test)?;

        let alert = generate_alert(tables, result.id, now)?;
        let result = match &alert {
            Some(_) => tables.test_results().get(result.id)?.unwrap_or(result),
            None => result,
        };
        Ok::<_, ApiError>(RecordedResult { result, alert })
    })?;

    let mut events = vec![AuditEvent::new(caller, "test_result.recorded", "test_run", run_id)
        .with_metadata("test_id", recorded.result.test_id.to_string())
        .with_metadata("status", recorded.result.status.as_str())];
    if let Some(alert) = &recorded.alert {
        let mut event = AuditEvent::new(caller, "alert.created", "alert", alert.id)
            .with_metadata("alert_number", alert.alert_number)
            .with_metadata("severity", alert.severity.as_str())
            .with_metadata("test_result_id", recorded.result.id.to_string());
        if let Some(rule_id) = alert.rule_id {
            event = event.with_metadata("rule_id", rule_id.to_string());
        }
        events.push(event);
    }
    record_all(store, events);
    Ok(recorded)
}

pub fn finish_run(store: &Store, caller: &AuthenticatedUser, run_id: Uuid, req: FinishRunRequest) -> Result<TestRun, ApiError> {
    caller.require(OPERATIONS)?;
    Validator::new()
        .check(
            matches!(req.status, RunStatus::Completed | RunStatus::Failed),
            "status",
            "must be completed or failed",
        )
        .optional_length(req.error_message.as_deref(), "error_message", 5000)
        .validate()?;

    let run = store.transaction(|tables| {
        let mut run = load(tables, caller.org_id, run_id)?;
        if run.status != RunStatus::Running {
            return Err(ApiError::invalid_transition("test run", run.status, req.status));
        }
        let now = Utc::now();
        run.status = req.status;
        run.error_message = req.error_message;
        run.completed_at = Some(now);
        run.duration_ms = run.started_at.map(|started| (now - started).num_milliseconds());
        run.updated_at = now;
        Ok(tables.test_runs().update(run)?)
    })?;

    AuditEvent::new(caller, "test_run.finished", "test_run", run.id)
        .with_metadata("run_number", run.run_number)
        .with_metadata("status", run.status.as_str())
        .with_metadata("passed", run.passed)
        .with_metadata("failed", run.failed)
        .with_metadata("errors", run.errors)
        .record(store);
    Ok(run)
}
