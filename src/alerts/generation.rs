//! Turns failing test results into alerts.
//!
//! Only fail, error and warning results are evaluated. Enabled rules are
//! tried in ascending priority and the first rule that matches, meets its
//! consecutive-failure threshold and is outside its cooldown produces the
//! alert. Everything runs inside the caller's transaction.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::types::{Alert, AlertRule};
use crate::compliance::Control;
use crate::store::{StoreError, Tables};
use crate::test_engine::types::{ControlTest, TestResult};

pub const DEFAULT_TITLE_TEMPLATE: &str = "{{test_name}} {{status}}";

/// What a rule is matched and rendered against.
pub struct AlertContext<'a> {
    pub test: &'a ControlTest,
    pub control: Option<&'a Control>,
    pub result: &'a TestResult,
}

pub fn rule_matches(rule: &AlertRule, ctx: &AlertContext<'_>) -> bool {
    fn agrees<T: PartialEq>(matcher: &[T], value: &T) -> bool {
        matcher.is_empty() || matcher.contains(value)
    }

    agrees(&rule.match_test_types, &ctx.test.test_type)
        && agrees(&rule.match_severities, &ctx.result.severity)
        && agrees(&rule.match_result_statuses, &ctx.result.status)
        && agrees(&rule.match_control_ids, &ctx.result.control_id)
        && (rule.match_tags.is_empty() || rule.match_tags.iter().any(|t| ctx.test.tags.contains(t)))
}

/// Expands the known placeholders; anything else is left as written.
pub fn render_title(template: &str, ctx: &AlertContext<'_>) -> String {
    let control_identifier = ctx.control.map(|c| c.identifier.as_str()).unwrap_or_default();
    let control_title = ctx.control.map(|c| c.title.as_str()).unwrap_or_default();
    let message = ctx.result.message.as_deref().unwrap_or_default();

    [
        ("{{test_name}}", ctx.test.title.as_str()),
        ("{{test_identifier}}", ctx.test.identifier.as_str()),
        ("{{control_identifier}}", control_identifier),
        ("{{control_title}}", control_title),
        ("{{severity}}", ctx.result.severity.as_str()),
        ("{{status}}", ctx.result.status.as_str()),
        ("{{message}}", message),
    ]
    .iter()
    .fold(template.to_string(), |title, (placeholder, value)| title.replace(placeholder, value))
}

/// Length of the failure streak ending at `current`. The current result
/// always counts; earlier results extend the streak while they failed or
/// errored.
pub fn failure_streak(tables: &mut Tables, current: &TestResult) -> Result<i32, StoreError> {
    let mut previous: Vec<TestResult> = tables
        .test_results()
        .of_test(current.test_id)?
        .into_iter()
        .filter(|r| r.id != current.id && r.created_at <= current.created_at)
        .collect();
    previous.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    let earlier = previous.iter().take_while(|r| r.status.is_failure()).count();
    Ok(1 + i32::try_from(earlier).unwrap_or(i32::MAX - 1))
}

pub fn in_cooldown(tables: &mut Tables, rule: &AlertRule, control_id: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError> {
    if rule.cooldown_minutes <= 0 {
        return Ok(false);
    }
    let since = now - Duration::minutes(i64::from(rule.cooldown_minutes));
    Ok(tables.alerts().of_rule(rule.id)?.into_iter().any(|a| {
        a.control_id == Some(control_id) && !a.status.is_settled() && a.created_at >= since
    }))
}

/// Picks the rule that should fire for `ctx`, if any.
pub fn select_rule(tables: &mut Tables, ctx: &AlertContext<'_>, now: DateTime<Utc>) -> Result<Option<AlertRule>, StoreError> {
    if !ctx.result.status.is_alertable() {
        return Ok(None);
    }
    let mut rules: Vec<AlertRule> = tables
        .alert_rules()
        .scan(ctx.result.org_id)?
        .into_iter()
        .filter(|r| r.enabled && rule_matches(r, ctx))
        .collect();
    rules.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.created_at.cmp(&b.created_at)));

    let streak = failure_streak(tables, ctx.result)?;
    for rule in rules {
        if streak >= rule.consecutive_failures.max(1) && !in_cooldown(tables, &rule, ctx.result.control_id, now)? {
            return Ok(Some(rule));
        }
    }
    Ok(None)
}

pub fn build_alert(rule: &AlertRule, ctx: &AlertContext<'_>, now: DateTime<Utc>) -> Alert {
    let template = rule.title_template.as_deref().unwrap_or(DEFAULT_TITLE_TEMPLATE);
    let mut alert = Alert::new(rule.org_id, render_title(template, ctx), rule.alert_severity);
    alert.description = ctx.result.message.clone();
    alert.control_id = Some(ctx.result.control_id);
    alert.test_id = Some(ctx.test.id);
    alert.test_result_id = Some(ctx.result.id);
    alert.rule_id = Some(rule.id);
    if let Some(assignee) = rule.auto_assign_to {
        alert.assigned_to = Some(assignee);
        alert.assigned_at = Some(now);
    }
    alert.sla_deadline = rule.sla_hours.map(|h| now + Duration::hours(i64::from(h)));
    alert.channels = rule.channels.clone();
    alert.created_at = now;
    alert.updated_at = now;
    alert
}

/// Evaluates rules for a stored result and, when one fires, inserts the
/// alert and links it back onto the result.
pub fn generate_alert(tables: &mut Tables, result_id: Uuid, now: DateTime<Utc>) -> Result<Option<Alert>, StoreError> {
    let Some(mut result) = tables.test_results().get(result_id)? else {
        return Err(StoreError::MissingRow(result_id));
    };
    let Some(test) = tables.tests().get(result.test_id)? else {
        return Ok(None);
    };
    let control = tables.controls().get(result.control_id)?;

    let alert = {
        let ctx = AlertContext {
            test: &test,
            control: control.as_ref(),
            result: &result,
        };
        match select_rule(tables, &ctx, now)? {
            Some(rule) => build_alert(&rule, &ctx, now),
            None => return Ok(None),
        }
    };

    let alert = tables.alerts().insert_sequenced(alert)?;
    result.alert_generated = true;
    result.alert_id = Some(alert.id);
    tables.test_results().update(result)?;
    Ok(Some(alert))
}
