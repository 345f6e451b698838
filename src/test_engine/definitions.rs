use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use std::cmp::Ordering;
use uuid::Uuid;

use super::schedule::{activation_delay, check_schedule};
use super::types::{ControlTest, ResultStatus, TestResult, TestStatus, TestType};
use crate::compliance::ControlStatus;
use crate::core::error::ApiError;
use crate::core::extract::parse_filter;
use crate::core::metadata;
use crate::core::pagination::{cmp_option, ListSpec, Page, PageParams, SortOrder};
use crate::core::severity::Severity;
use crate::security::audit::AuditEvent;
use crate::security::auth::{AuthenticatedUser, OPERATIONS};
use crate::security::validation::Validator;
use crate::store::{Store, Tables};

const TEST_LIST: ListSpec = ListSpec {
    default_per_page: 50,
    max_per_page: 200,
    sort_fields: &["identifier", "title", "status", "severity", "created_at", "next_run_at"],
    default_sort: "identifier",
    default_order: SortOrder::Asc,
};

const RESULT_LIST: ListSpec = ListSpec {
    default_per_page: 20,
    max_per_page: 100,
    sort_fields: &["created_at", "status"],
    default_sort: "created_at",
    default_order: SortOrder::Desc,
};

const MAX_TAGS: usize = 20;

#[derive(Debug, Default, Deserialize)]
pub struct ListTestsQuery {
    pub status: Option<String>,
    #[serde(rename = "type")]
    pub test_type: Option<String>,
    pub severity: Option<String>,
    pub control_id: Option<String>,
    pub tag: Option<String>,
    #[serde(flatten)]
    pub page: PageParams,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListResultsQuery {
    pub status: Option<String>,
    #[serde(flatten)]
    pub page: PageParams,
}

fn default_timeout() -> i32 {
    300
}

fn default_retry_delay() -> i32 {
    60
}

#[derive(Debug, Deserialize)]
pub struct CreateTestRequest {
    pub identifier: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(alias = "type")]
    pub test_type: TestType,
    pub severity: Severity,
    pub control_id: Uuid,
    pub cron_expression: Option<String>,
    pub interval_minutes: Option<i32>,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: i32,
    #[serde(default)]
    pub retry_count: i32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: i32,
    #[serde(default)]
    pub tags: Vec<String>,
    pub configuration: Option<Value>,
}

/// Setting one schedule kind replaces the other.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateTestRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub severity: Option<Severity>,
    pub cron_expression: Option<String>,
    pub interval_minutes: Option<i32>,
    pub timeout_seconds: Option<i32>,
    pub retry_count: Option<i32>,
    pub retry_delay_seconds: Option<i32>,
    pub tags: Option<Vec<String>>,
    pub configuration: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct TestStatusRequest {
    pub status: TestStatus,
}

fn check_limits(
    validator: Validator,
    timeout: Option<i32>,
    retries: Option<i32>,
    retry_delay: Option<i32>,
    tags: Option<&[String]>,
) -> Validator {
    validator
        .optional_range(timeout, "timeout_seconds", 1, 3600)
        .optional_range(retries, "retry_count", 0, 5)
        .optional_range(retry_delay, "retry_delay_seconds", 1, 3600)
        .check(
            tags.map_or(true, |t| t.len() <= MAX_TAGS),
            "tags",
            "must contain at most 20 entries",
        )
}

fn clean_tags(tags: Vec<String>) -> Vec<String> {
    let mut cleaned: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        let tag = tag.trim().to_string();
        if !tag.is_empty() && !cleaned.contains(&tag) {
            cleaned.push(tag);
        }
    }
    cleaned
}

pub(super) fn load(tables: &mut Tables, org_id: Uuid, test_id: Uuid) -> Result<ControlTest, ApiError> {
    tables
        .tests()
        .find(org_id, test_id)?
        .ok_or_else(|| ApiError::not_found("Test"))
}

pub fn list_tests(store: &Store, caller: &AuthenticatedUser, query: &ListTestsQuery) -> Result<Page<ControlTest>, ApiError> {
    let status: Option<TestStatus> = parse_filter(&query.status, "status")?;
    let test_type: Option<TestType> = parse_filter(&query.test_type, "type")?;
    let severity: Option<Severity> = parse_filter(&query.severity, "severity")?;
    let control_id: Option<Uuid> = parse_filter(&query.control_id, "control_id")?;
    let tag = query.tag.as_deref().map(str::trim).filter(|t| !t.is_empty());

    let tests: Vec<ControlTest> = store
        .read(|tables| tables.tests().scan(caller.org_id))?
        .into_iter()
        .filter(|t| status.map_or(true, |s| t.status == s))
        .filter(|t| test_type.map_or(true, |ty| t.test_type == ty))
        .filter(|t| severity.map_or(true, |s| t.severity == s))
        .filter(|t| control_id.map_or(true, |c| t.control_id == c))
        .filter(|t| tag.map_or(true, |tag| t.tags.iter().any(|x| x == tag)))
        .collect();

    Ok(query.page.resolve(&TEST_LIST).apply(tests, compare_tests))
}

fn compare_tests(a: &ControlTest, b: &ControlTest, sort: &str) -> Ordering {
    match sort {
        "title" => a.title.cmp(&b.title),
        "status" => a.status.as_str().cmp(b.status.as_str()),
        "severity" => a.severity.rank().cmp(&b.severity.rank()),
        "created_at" => a.created_at.cmp(&b.created_at),
        "next_run_at" => cmp_option(&a.next_run_at, &b.next_run_at),
        _ => a.identifier.cmp(&b.identifier),
    }
}

pub fn get_test(store: &Store, caller: &AuthenticatedUser, test_id: Uuid) -> Result<ControlTest, ApiError> {
    store.read(|tables| load(tables, caller.org_id, test_id))
}

pub fn create_test(store: &Store, caller: &AuthenticatedUser, req: CreateTestRequest) -> Result<ControlTest, ApiError> {
    caller.require(OPERATIONS)?;

    let identifier = req.identifier.trim().to_string();
    let title = req.title.trim().to_string();
    let validator = Validator::new()
        .identifier(&identifier, "identifier")
        .required(&title, "title")
        .length(&title, "title", None, Some(500))
        .length(&req.description, "description", None, Some(10000));
    check_limits(
        validator,
        Some(req.timeout_seconds),
        Some(req.retry_count),
        Some(req.retry_delay_seconds),
        Some(&req.tags),
    )
    .validate()?;
    let cron_expression = req.cron_expression.map(|c| c.trim().to_string()).filter(|c| !c.is_empty());
    check_schedule(cron_expression.as_deref(), req.interval_minutes)?;
    if let Some(configuration) = &req.configuration {
        metadata::check_map(configuration, "configuration")?;
    }

    let test = store.transaction(|tables| {
        let control = tables
            .controls()
            .find(caller.org_id, req.control_id)?
            .ok_or_else(|| ApiError::field("control_id", "control does not exist in this organization"))?;
        if control.status != ControlStatus::Active {
            return Err(ApiError::Unprocessable(format!(
                "Tests can only be created for active controls; control '{}' is {}",
                control.identifier, control.status
            )));
        }

        let mut test = ControlTest::new(caller.org_id, identifier, title, req.test_type, req.control_id, caller.user_id);
        test.description = req.description.trim().to_string();
        test.severity = req.severity;
        test.cron_expression = cron_expression;
        test.interval_minutes = req.interval_minutes;
        test.timeout_seconds = req.timeout_seconds;
        test.retry_count = req.retry_count;
        test.retry_delay_seconds = req.retry_delay_seconds;
        test.tags = clean_tags(req.tags);
        if let Some(configuration) = req.configuration {
            test.configuration = configuration;
        }
        tables
            .tests()
            .insert(test)
            .map_err(|e| ApiError::conflict_or(e, "A test with this identifier already exists"))
    })?;

    AuditEvent::new(caller, "test.created", "test", test.id)
        .with_metadata("identifier", test.identifier.clone())
        .with_metadata("control_id", test.control_id.to_string())
        .record(store);
    Ok(test)
}

pub fn update_test(
    store: &Store,
    caller: &AuthenticatedUser,
    test_id: Uuid,
    req: UpdateTestRequest,
) -> Result<ControlTest, ApiError> {
    caller.require(OPERATIONS)?;

    let mut validator = Validator::new();
    if let Some(title) = &req.title {
        validator = validator.required(title, "title").length(title, "title", None, Some(500));
    }
    validator = validator.optional_length(req.description.as_deref(), "description", 10000);
    check_limits(
        validator,
        req.timeout_seconds,
        req.retry_count,
        req.retry_delay_seconds,
        req.tags.as_deref(),
    )
    .validate()?;
    if let Some(configuration) = &req.configuration {
        metadata::check_map(configuration, "configuration")?;
    }

    let test = store.transaction(|tables| {
        let mut test = load(tables, caller.org_id, test_id)?;
        if test.status == TestStatus::Deprecated {
            return Err(ApiError::Unprocessable("Deprecated tests cannot be modified".into()));
        }

        if let Some(title) = req.title {
            test.title = title.trim().to_string();
        }
        if let Some(description) = req.description {
            test.description = description.trim().to_string();
        }
        if let Some(severity) = req.severity {
            test.severity = severity;
        }
        match (req.cron_expression, req.interval_minutes) {
            (Some(_), Some(_)) => {
                return Err(ApiError::field(
                    "cron_expression",
                    "cron_expression and interval_minutes are mutually exclusive",
                ));
            }
            (Some(cron), None) => {
                test.cron_expression = Some(cron.trim().to_string());
                test.interval_minutes = None;
            }
            (None, Some(minutes)) => {
                test.cron_expression = None;
                test.interval_minutes = Some(minutes);
            }
            (None, None) => {}
        }
        check_schedule(test.cron_expression.as_deref(), test.interval_minutes)?;
        if let Some(timeout) = req.timeout_seconds {
            test.timeout_seconds = timeout;
        }
        if let Some(retries) = req.retry_count {
            test.retry_count = retries;
        }
        if let Some(delay) = req.retry_delay_seconds {
            test.retry_delay_seconds = delay;
        }
        if let Some(tags) = req.tags {
            test.tags = clean_tags(tags);
        }
        if let Some(patch) = req.configuration {
            metadata::merge(&mut test.configuration, patch);
            metadata::check_map(&test.configuration, "configuration")?;
        }
        test.updated_at = Utc::now();
        Ok::<_, ApiError>(tables.tests().update(test)?)
    })?;

    AuditEvent::new(caller, "test.updated", "test", test.id).record(store);
    Ok(test)
}

/// Activation schedules the first run shortly after now; pausing and
/// deprecation take the test off the schedule.
pub fn change_status(
    store: &Store,
    caller: &AuthenticatedUser,
    test_id: Uuid,
    req: TestStatusRequest,
) -> Result<ControlTest, ApiError> {
    caller.require(OPERATIONS)?;
    let next = req.status;

    let (test, previous) = store.transaction(|tables| {
        let mut test = load(tables, caller.org_id, test_id)?;
        let previous = test.status;
        if !previous.can_transition_to(next) {
            return Err(ApiError::invalid_transition("test", previous, next));
        }
        let now = Utc::now();
        test.status = next;
        test.next_run_at = match next {
            TestStatus::Active => Some(now + activation_delay()),
            _ => None,
        };
        test.updated_at = now;
        Ok((tables.tests().update(test)?, previous))
    })?;

    let action = if test.status == TestStatus::Deprecated {
        "test.deprecated"
    } else {
        "test.status_changed"
    };
    AuditEvent::new(caller, action, "test", test.id)
        .with_metadata("from", previous.as_str())
        .with_metadata("to", test.status.as_str())
        .record(store);
    Ok(test)
}

pub fn deprecate_test(store: &Store, caller: &AuthenticatedUser, test_id: Uuid) -> Result<ControlTest, ApiError> {
    change_status(
        store,
        caller,
        test_id,
        TestStatusRequest {
            status: TestStatus::Deprecated,
        },
    )
}

pub fn list_test_results(
    store: &Store,
    caller: &AuthenticatedUser,
    test_id: Uuid,
    query: &ListResultsQuery,
) -> Result<Page<TestResult>, ApiError> {
    let status: Option<ResultStatus> = parse_filter(&query.status, "status")?;
    let results = store.read(|tables| {
        load(tables, caller.org_id, test_id)?;
        Ok::<_, ApiError>(
            tables
                .test_results()
                .of_test(test_id)?
                .into_iter()
                .filter(|r| status.map_or(true, |s| r.status == s))
                .collect::<Vec<_>>(),
        )
    })?;

    Ok(query.page.resolve(&RESULT_LIST).apply(results, compare_results))
}

pub(super) fn compare_results(a: &TestResult, b: &TestResult, sort: &str) -> Ordering {
    match sort {
        "status" => a.status.as_str().cmp(b.status.as_str()),
        _ => a.created_at.cmp(&b.created_at),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compliance::types::{Control, ControlCategory};
    use crate::security::auth::Role;
    use crate::tests::test_util::{audit_actions, Tenant};
    use crate::{assert_err, assert_ok};
    use serde_json::json;

    fn seed_control(tenant: &Tenant, status: ControlStatus) -> Control {
        let mut control = Control::new(tenant.org_id, "CTRL-AC-001".into(), "MFA enforced".into(), ControlCategory::Technical, Uuid::new_v4());
        control.status = status;
        assert_ok!(tenant.store.transaction(|t| t.controls().insert(control)))
    }

    fn request(control_id: Uuid) -> CreateTestRequest {
        CreateTestRequest {
            identifier: "TST-AC-001".into(),
            title: "MFA is enforced for admins".into(),
            description: String::new(),
            test_type: TestType::Configuration,
            severity: Severity::High,
            control_id,
            cron_expression: None,
            interval_minutes: Some(60),
            timeout_seconds: 300,
            retry_count: 1,
            retry_delay_seconds: 30,
            tags: vec!["iam".into(), "iam".into()],
            configuration: Some(json!({"provider": "okta"})),
        }
    }

    #[test]
    fn test_create_requires_active_control() {
        let tenant = Tenant::new();
        let engineer = tenant.caller(Role::ItAdmin);
        let draft = seed_control(&tenant, ControlStatus::Draft);

        let err = assert_err!(create_test(&tenant.store, &engineer, request(draft.id)));
        assert_eq!(err.error_code(), "UNPROCESSABLE");

        assert_ok!(tenant.store.transaction(|t| {
            let mut control = t.controls().get(draft.id)?.ok_or(crate::store::StoreError::MissingRow(draft.id))?;
            control.status = ControlStatus::Active;
            t.controls().update(control)
        }));
        let test = assert_ok!(create_test(&tenant.store, &engineer, request(draft.id)));
        assert_eq!(test.status, TestStatus::Draft);
        assert_eq!(test.tags, vec!["iam".to_string()]);
        assert!(test.next_run_at.is_none());

        let err = assert_err!(create_test(&tenant.store, &engineer, request(draft.id)));
        assert_eq!(err.error_code(), "CONFLICT");
    }

    #[test]
    fn test_bounds_and_schedule_rules() {
        let tenant = Tenant::new();
        let engineer = tenant.caller(Role::SecurityEngineer);
        let control = seed_control(&tenant, ControlStatus::Active);

        let mut req = request(control.id);
        req.timeout_seconds = 3601;
        req.retry_count = 6;
        let err = assert_err!(create_test(&tenant.store, &engineer, req));
        match err {
            ApiError::Validation { details, .. } => assert_eq!(details.len(), 2),
            other => panic!("unexpected error: {other:?}"),
        }

        let mut req = request(control.id);
        req.cron_expression = Some("*/5 * * * *".into());
        let err = assert_err!(create_test(&tenant.store, &engineer, req));
        assert_eq!(err.error_code(), "VALIDATION_ERROR");

        let mut req = request(control.id);
        req.cron_expression = Some("*/5 * * * *".into());
        req.interval_minutes = None;
        let test = assert_ok!(create_test(&tenant.store, &engineer, req));

        let updated = assert_ok!(update_test(
            &tenant.store,
            &engineer,
            test.id,
            UpdateTestRequest {
                interval_minutes: Some(15),
                ..UpdateTestRequest::default()
            }
        ));
        assert_eq!(updated.cron_expression, None);
        assert_eq!(updated.interval_minutes, Some(15));
    }

    #[test]
    fn test_lifecycle_schedules_and_unschedules() {
        let tenant = Tenant::new();
        let engineer = tenant.caller(Role::Ciso);
        let control = seed_control(&tenant, ControlStatus::Active);
        let test = assert_ok!(create_test(&tenant.store, &engineer, request(control.id)));

        let before = Utc::now();
        let active = assert_ok!(change_status(&tenant.store, &engineer, test.id, TestStatusRequest { status: TestStatus::Active }));
        let next = active.next_run_at.expect("scheduled");
        assert!(next >= before + activation_delay());

        let paused = assert_ok!(change_status(&tenant.store, &engineer, test.id, TestStatusRequest { status: TestStatus::Paused }));
        assert!(paused.next_run_at.is_none());

        let deprecated = assert_ok!(deprecate_test(&tenant.store, &engineer, test.id));
        assert_eq!(deprecated.status, TestStatus::Deprecated);

        let err = assert_err!(change_status(&tenant.store, &engineer, test.id, TestStatusRequest { status: TestStatus::Active }));
        assert_eq!(err.error_code(), "UNPROCESSABLE");

        let actions = audit_actions(&tenant.store, tenant.org_id);
        assert_eq!(
            actions,
            vec!["test.created", "test.status_changed", "test.status_changed", "test.deprecated"]
        );
    }

    #[test]
    fn test_viewer_reads_but_cannot_write() {
        let tenant = Tenant::new();
        let control = seed_control(&tenant, ControlStatus::Active);
        let viewer = tenant.caller(Role::Viewer);
        let err = assert_err!(create_test(&tenant.store, &viewer, request(control.id)));
        assert_eq!(err.error_code(), "FORBIDDEN");

        let engineer = tenant.caller(Role::SecurityEngineer);
        assert_ok!(create_test(&tenant.store, &engineer, request(control.id)));
        let page = assert_ok!(list_tests(
            &tenant.store,
            &viewer,
            &ListTestsQuery {
                tag: Some("iam".into()),
                ..ListTestsQuery::default()
            }
        ));
        assert_eq!(page.total, 1);
    }
}
