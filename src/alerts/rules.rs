use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use std::cmp::Ordering;
use uuid::Uuid;

use super::types::{AlertRule, Channel};
use crate::core::error::ApiError;
use crate::core::extract::parse_filter;
use crate::core::metadata;
use crate::core::pagination::{ListSpec, Page, PageParams, SortOrder};
use crate::core::severity::Severity;
use crate::directory::ensure_active_member;
use crate::security::audit::AuditEvent;
use crate::security::auth::{AuthenticatedUser, OPERATIONS};
use crate::security::validation::Validator;
use crate::store::{Store, Tables};
use crate::test_engine::types::{ResultStatus, TestType};

const RULE_LIST: ListSpec = ListSpec {
    default_per_page: 50,
    max_per_page: 100,
    sort_fields: &["priority", "name", "created_at"],
    default_sort: "priority",
    default_order: SortOrder::Asc,
};

const MAX_RECIPIENTS: usize = 50;
const MAX_MATCHERS: usize = 50;

#[derive(Debug, Default, Deserialize)]
pub struct ListRulesQuery {
    pub enabled: Option<String>,
    #[serde(flatten)]
    pub page: PageParams,
}

fn default_enabled() -> bool {
    true
}

fn default_priority() -> i32 {
    100
}

fn default_threshold() -> i32 {
    1
}

#[derive(Debug, Deserialize)]
pub struct CreateRuleRequest {
    pub name: String,
    pub description: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub match_test_types: Vec<TestType>,
    #[serde(default)]
    pub match_severities: Vec<Severity>,
    #[serde(default)]
    pub match_result_statuses: Vec<ResultStatus>,
    #[serde(default)]
    pub match_control_ids: Vec<Uuid>,
    #[serde(default)]
    pub match_tags: Vec<String>,
    #[serde(default = "default_threshold")]
    pub consecutive_failures: i32,
    #[serde(default)]
    pub cooldown_minutes: i32,
    pub alert_severity: Severity,
    pub title_template: Option<String>,
    pub auto_assign_to: Option<Uuid>,
    pub sla_hours: Option<i32>,
    #[serde(default)]
    pub channels: Vec<Channel>,
    pub slack_webhook_url: Option<String>,
    #[serde(default)]
    pub email_recipients: Vec<String>,
    pub webhook_url: Option<String>,
    pub webhook_headers: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateRuleRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub enabled: Option<bool>,
    pub priority: Option<i32>,
    pub match_test_types: Option<Vec<TestType>>,
    pub match_severities: Option<Vec<Severity>>,
    pub match_result_statuses: Option<Vec<ResultStatus>>,
    pub match_control_ids: Option<Vec<Uuid>>,
    pub match_tags: Option<Vec<String>>,
    pub consecutive_failures: Option<i32>,
    pub cooldown_minutes: Option<i32>,
    pub alert_severity: Option<Severity>,
    pub title_template: Option<String>,
    pub auto_assign_to: Option<Uuid>,
    pub sla_hours: Option<i32>,
    pub channels: Option<Vec<Channel>>,
    pub slack_webhook_url: Option<String>,
    pub email_recipients: Option<Vec<String>>,
    pub webhook_url: Option<String>,
    pub webhook_headers: Option<Value>,
}

/// Checks a complete rule, so creates and merged updates share one set of
/// rules.
pub fn validate_rule(rule: &AlertRule) -> Result<(), ApiError> {
    let mut validator = Validator::new()
        .required(&rule.name, "name")
        .length(&rule.name, "name", None, Some(255))
        .optional_length(rule.description.as_deref(), "description", 2000)
        .range(rule.priority, "priority", 0, 10000)
        .range(rule.consecutive_failures, "consecutive_failures", 1, 100)
        .range(rule.cooldown_minutes, "cooldown_minutes", 0, 10080)
        .optional_range(rule.sla_hours, "sla_hours", 1, 8760)
        .optional_length(rule.title_template.as_deref(), "title_template", 500)
        .check(
            rule.match_control_ids.len() <= MAX_MATCHERS && rule.match_tags.len() <= MAX_MATCHERS,
            "match_tags",
            "matcher lists must contain at most 50 entries",
        )
        .check(
            rule.email_recipients.len() <= MAX_RECIPIENTS,
            "email_recipients",
            "must contain at most 50 addresses",
        );
    if let Some(url) = &rule.slack_webhook_url {
        validator = validator.https_url(url, "slack_webhook_url");
    }
    if let Some(url) = &rule.webhook_url {
        validator = validator.https_url(url, "webhook_url");
    }
    for recipient in &rule.email_recipients {
        validator = validator.email(recipient, "email_recipients");
    }
    for channel in &rule.channels {
        let field = match channel {
            Channel::Slack => "slack_webhook_url",
            Channel::Email => "email_recipients",
            Channel::Webhook => "webhook_url",
        };
        validator = validator.check(
            rule.is_configured(*channel),
            field,
            &format!("is required when the {channel} channel is enabled"),
        );
    }
    let headers_are_strings = rule
        .webhook_headers
        .as_object()
        .map_or(false, |h| h.values().all(Value::is_string));
    validator
        .check(headers_are_strings, "webhook_headers", "must be an object of string values")
        .validate()?;
    metadata::check_map(&rule.webhook_headers, "webhook_headers")
}

fn dedup<T: PartialEq>(items: Vec<T>) -> Vec<T> {
    let mut unique = Vec::with_capacity(items.len());
    for item in items {
        if !unique.contains(&item) {
            unique.push(item);
        }
    }
    unique
}

fn load(tables: &mut Tables, org_id: Uuid, rule_id: Uuid) -> Result<AlertRule, ApiError> {
    tables
        .alert_rules()
        .find(org_id, rule_id)?
        .ok_or_else(|| ApiError::not_found("Alert rule"))
}

pub fn list_rules(store: &Store, caller: &AuthenticatedUser, query: &ListRulesQuery) -> Result<Page<AlertRule>, ApiError> {
    let enabled: Option<bool> = parse_filter(&query.enabled, "enabled")?;
    let rules: Vec<AlertRule> = store
        .read(|tables| tables.alert_rules().scan(caller.org_id))?
        .into_iter()
        .filter(|r| enabled.map_or(true, |e| r.enabled == e))
        .collect();
    Ok(query.page.resolve(&RULE_LIST).apply(rules, compare_rules))
}

fn compare_rules(a: &AlertRule, b: &AlertRule, sort: &str) -> Ordering {
    match sort {
        "name" => a.name.cmp(&b.name),
        "created_at" => a.created_at.cmp(&b.created_at),
        _ => a.priority.cmp(&b.priority).then(a.created_at.cmp(&b.created_at)),
    }
}

pub fn get_rule(store: &Store, caller: &AuthenticatedUser, rule_id: Uuid) -> Result<AlertRule, ApiError> {
    store.read(|tables| load(tables, caller.org_id, rule_id))
}

pub fn create_rule(store: &Store, caller: &AuthenticatedUser, req: CreateRuleRequest) -> Result<AlertRule, ApiError> {
    caller.require(OPERATIONS)?;

    let mut rule = AlertRule::new(caller.org_id, req.name.trim().to_string(), req.alert_severity, caller.user_id);
    rule.description = req.description;
    rule.enabled = req.enabled;
    rule.priority = req.priority;
    rule.match_test_types = dedup(req.match_test_types);
    rule.match_severities = dedup(req.match_severities);
    rule.match_result_statuses = dedup(req.match_result_statuses);
    rule.match_control_ids = dedup(req.match_control_ids);
    rule.match_tags = dedup(req.match_tags);
    rule.consecutive_failures = req.consecutive_failures;
    rule.cooldown_minutes = req.cooldown_minutes;
    rule.title_template = req.title_template;
    rule.auto_assign_to = req.auto_assign_to;
    rule.sla_hours = req.sla_hours;
    rule.channels = dedup(req.channels);
    rule.slack_webhook_url = req.slack_webhook_url;
    rule.email_recipients = req.email_recipients;
    rule.webhook_url = req.webhook_url;
    if let Some(headers) = req.webhook_headers {
        rule.webhook_headers = headers;
    }
    validate_rule(&rule)?;

    let rule = store.transaction(|tables| {
        if let Some(assignee) = rule.auto_assign_to {
            ensure_active_member(tables, caller.org_id, assignee, "auto_assign_to")?;
        }
        tables
            .alert_rules()
            .insert(rule)
            .map_err(|e| ApiError::conflict_or(e, "An alert rule with this name already exists"))
    })?;

    AuditEvent::new(caller, "alert_rule.created", "alert_rule", rule.id)
        .with_metadata("name", rule.name.clone())
        .with_metadata("priority", rule.priority)
        .record(store);
    Ok(rule)
}

pub fn update_rule(
    store: &Store,
    caller: &AuthenticatedUser,
    rule_id: Uuid,
    req: UpdateRuleRequest,
) -> Result<AlertRule, ApiError> {
    caller.require(OPERATIONS)?;

    let rule = store.transaction(|tables| {
        let mut rule = load(tables, caller.org_id, rule_id)?;
        if let Some(name) = req.name {
            rule.name = name.trim().to_string();
        }
        if let Some(description) = req.description {
            rule.description = Some(description);
        }
        if let Some(enabled) = req.enabled {
            rule.enabled = enabled;
        }
        if let Some(priority) = req.priority {
            rule.priority = priority;
        }
        if let Some(types) = req.match_test_types {
            rule.match_test_types = dedup(types);
        }
        if let Some(severities) = req.match_severities {
            rule.match_severities = dedup(severities);
        }
        if let Some(statuses) = req.match_result_statuses {
            rule.match_result_statuses = dedup(statuses);
        }
        if let Some(controls) = req.match_control_ids {
            rule.match_control_ids = dedup(controls);
        }
        if let Some(tags) = req.match_tags {
            rule.match_tags = dedup(tags);
        }
        if let Some(threshold) = req.consecutive_failures {
            rule.consecutive_failures = threshold;
        }
        if let Some(cooldown) = req.cooldown_minutes {
            rule.cooldown_minutes = cooldown;
        }
        if let Some(severity) = req.alert_severity {
            rule.alert_severity = severity;
        }
        if let Some(template) = req.title_template {
            rule.title_template = Some(template);
        }
        if let Some(assignee) = req.auto_assign_to {
            ensure_active_member(tables, caller.org_id, assignee, "auto_assign_to")?;
            rule.auto_assign_to = Some(assignee);
        }
        if let Some(hours) = req.sla_hours {
            rule.sla_hours = Some(hours);
        }
        if let Some(channels) = req.channels {
            rule.channels = dedup(channels);
        }
        if let Some(url) = req.slack_webhook_url {
            rule.slack_webhook_url = Some(url);
        }
        if let Some(recipients) = req.email_recipients {
            rule.email_recipients = recipients;
        }
        if let Some(url) = req.webhook_url {
            rule.webhook_url = Some(url);
        }
        if let Some(patch) = req.webhook_headers {
            metadata::merge(&mut rule.webhook_headers, patch);
        }
        validate_rule(&rule)?;
        rule.updated_at = Utc::now();
        tables
            .alert_rules()
            .update(rule)
            .map_err(|e| ApiError::conflict_or(e, "An alert rule with this name already exists"))
    })?;

    AuditEvent::new(caller, "alert_rule.updated", "alert_rule", rule.id).record(store);
    Ok(rule)
}

/// Hard delete. Alerts it produced keep the dangling rule id.
pub fn delete_rule(store: &Store, caller: &AuthenticatedUser, rule_id: Uuid) -> Result<AlertRule, ApiError> {
    caller.require(OPERATIONS)?;
    let rule = store.transaction(|tables| {
        let rule = load(tables, caller.org_id, rule_id)?;
        if !tables.alert_rules().remove(rule_id)? {
            return Err(ApiError::not_found("Alert rule"));
        }
        Ok(rule)
    })?;

    AuditEvent::new(caller, "alert_rule.deleted", "alert_rule", rule.id)
        .with_metadata("name", rule.name.clone())
        .record(store);
    Ok(rule)
}

/// Loads a rule for a test delivery after checking it has a channel.
pub fn prepare_test_delivery(store: &Store, caller: &AuthenticatedUser, rule_id: Uuid) -> Result<AlertRule, ApiError> {
    caller.require(OPERATIONS)?;
    let rule = get_rule(store, caller, rule_id)?;
    if rule.channels.is_empty() {
        return Err(ApiError::Unprocessable(
            "The alert rule has no delivery channels configured".into(),
        ));
    }
    Ok(rule)
}
