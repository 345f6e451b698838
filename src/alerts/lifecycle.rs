use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use uuid::Uuid;

use super::types::{Alert, AlertStatus, Channel};
use crate::core::error::ApiError;
use crate::core::extract::parse_filter;
use crate::core::pagination::{cmp_option, ListSpec, Page, PageParams, SortOrder};
use crate::core::severity::Severity;
use crate::directory::ensure_active_member;
use crate::security::audit::AuditEvent;
use crate::security::auth::{AuthenticatedUser, OPERATIONS};
use crate::security::validation::Validator;
use crate::store::{Store, Tables};

const ALERT_LIST: ListSpec = ListSpec {
    default_per_page: 50,
    max_per_page: 200,
    sort_fields: &["alert_number", "severity", "status", "created_at", "sla_deadline"],
    default_sort: "created_at",
    default_order: SortOrder::Desc,
};

pub const MAX_SUPPRESSION_DAYS: i64 = 90;
const MAX_RESOLUTION_NOTE: usize = 10000;

#[derive(Debug, Default, Deserialize)]
pub struct ListAlertsQuery {
    pub status: Option<String>,
    pub severity: Option<String>,
    pub control_id: Option<String>,
    pub test_id: Option<String>,
    pub assigned_to: Option<String>,
    pub sla_breached: Option<String>,
    #[serde(flatten)]
    pub page: PageParams,
}

/// A plain status change. Moving to `resolved` or `suppressed` here needs
/// the same fields as the dedicated endpoints.
#[derive(Debug, Deserialize)]
pub struct AlertStatusRequest {
    pub status: AlertStatus,
    pub note: Option<String>,
    pub suppressed_until: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AssignRequest {
    pub assigned_to: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    pub note: String,
}

#[derive(Debug, Deserialize)]
pub struct SuppressRequest {
    pub suppressed_until: DateTime<Utc>,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct RedeliverRequest {
    pub channels: Vec<Channel>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RedeliveryPlan {
    pub org_id: Uuid,
    pub alert_id: Uuid,
    pub channels: Vec<Channel>,
}

fn load(tables: &mut Tables, org_id: Uuid, alert_id: Uuid) -> Result<Alert, ApiError> {
    tables
        .alerts()
        .find(org_id, alert_id)?
        .ok_or_else(|| ApiError::not_found("Alert"))
}

fn check_note(note: &str) -> Result<(), ApiError> {
    Validator::new()
        .required(note, "note")
        .length(note, "note", None, Some(MAX_RESOLUTION_NOTE))
        .validate()
}

fn check_suppression(until: DateTime<Utc>, reason: &str, now: DateTime<Utc>) -> Result<(), ApiError> {
    Validator::new()
        .check(until > now, "suppressed_until", "must be in the future")
        .check(
            until <= now + Duration::days(MAX_SUPPRESSION_DAYS),
            "suppressed_until",
            "must be at most 90 days ahead",
        )
        .length(reason.trim(), "reason", Some(20), Some(5000))
        .validate()
}

/// Extra fields a transition writes.
enum Effect {
    None,
    Resolve(String),
    Suppress { until: DateTime<Utc>, reason: String },
}

/// Applies a status change and its field side effects.
fn apply(alert: &mut Alert, next: AlertStatus, effect: Effect, actor: Uuid, now: DateTime<Utc>) -> Result<AlertStatus, ApiError> {
    let previous = alert.status;
    if previous == AlertStatus::Closed && next == AlertStatus::Suppressed {
        return Err(ApiError::Unprocessable("Closed alerts cannot be suppressed".into()));
    }
    if !previous.can_transition_to(next) {
        return Err(ApiError::invalid_transition("alert", previous, next));
    }

    match (next, effect) {
        (AlertStatus::Acknowledged, _) => {
            alert.acknowledged_at = Some(now);
            alert.acknowledged_by = Some(actor);
        }
        (AlertStatus::Resolved, Effect::Resolve(note)) => {
            alert.resolved_at = Some(now);
            alert.resolved_by = Some(actor);
            alert.resolution_note = Some(note.trim().to_string());
        }
        (AlertStatus::Suppressed, Effect::Suppress { until, reason }) => {
            alert.suppressed_until = Some(until);
            alert.suppressed_by = Some(actor);
            alert.suppression_reason = Some(reason.trim().to_string());
        }
        (AlertStatus::Resolved, _) => return Err(ApiError::field("note", "is required to resolve an alert")),
        (AlertStatus::Suppressed, _) => {
            return Err(ApiError::field("suppressed_until", "suppressed_until and reason are required"))
        }
        (AlertStatus::Open, _) => {
            alert.clear_resolution();
            alert.clear_suppression();
        }
        _ => {}
    }
    alert.status = next;
    alert.updated_at = now;
    Ok(previous)
}

fn transition(
    store: &Store,
    caller: &AuthenticatedUser,
    alert_id: Uuid,
    next: AlertStatus,
    effect: Effect,
) -> Result<Alert, ApiError> {
    let (alert, previous) = store.transaction(|tables| {
        let mut alert = load(tables, caller.org_id, alert_id)?;
        let previous = apply(&mut alert, next, effect, caller.user_id, Utc::now())?;
        Ok::<_, ApiError>((tables.alerts().update(alert)?, previous))
    })?;

    let action = match alert.status {
        AlertStatus::Resolved => "alert.resolved",
        AlertStatus::Suppressed => "alert.suppressed",
        AlertStatus::Open => "alert.reopened",
        _ => "alert.status_changed",
    };
    AuditEvent::new(caller, action, "alert", alert.id)
        .with_metadata("from", previous.as_str())
        .with_metadata("to", alert.status.as_str())
        .with_metadata("alert_number", alert.alert_number)
        .record(store);
    Ok(alert)
}

pub fn list_alerts(store: &Store, caller: &AuthenticatedUser, query: &ListAlertsQuery) -> Result<Page<Alert>, ApiError> {
    let status: Option<AlertStatus> = parse_filter(&query.status, "status")?;
    let severity: Option<Severity> = parse_filter(&query.severity, "severity")?;
    let control_id: Option<Uuid> = parse_filter(&query.control_id, "control_id")?;
    let test_id: Option<Uuid> = parse_filter(&query.test_id, "test_id")?;
    let assigned_to: Option<Uuid> = parse_filter(&query.assigned_to, "assigned_to")?;
    let sla_breached: Option<bool> = parse_filter(&query.sla_breached, "sla_breached")?;

    let alerts: Vec<Alert> = store
        .read(|tables| tables.alerts().scan(caller.org_id))?
        .into_iter()
        .filter(|a| status.map_or(true, |s| a.status == s))
        .filter(|a| severity.map_or(true, |s| a.severity == s))
        .filter(|a| control_id.map_or(true, |c| a.control_id == Some(c)))
        .filter(|a| test_id.map_or(true, |t| a.test_id == Some(t)))
        .filter(|a| assigned_to.map_or(true, |u| a.assigned_to == Some(u)))
        .filter(|a| sla_breached.map_or(true, |b| a.sla_breached == b))
        .collect();

    Ok(query.page.resolve(&ALERT_LIST).apply(alerts, compare_alerts))
}

fn compare_alerts(a: &Alert, b: &Alert, sort: &str) -> Ordering {
    match sort {
        "alert_number" => a.alert_number.cmp(&b.alert_number),
        "severity" => a.severity.rank().cmp(&b.severity.rank()),
        "status" => a.status.as_str().cmp(b.status.as_str()),
        "sla_deadline" => cmp_option(&a.sla_deadline, &b.sla_deadline),
        _ => a.created_at.cmp(&b.created_at),
    }
}

pub fn get_alert(store: &Store, caller: &AuthenticatedUser, alert_id: Uuid) -> Result<Alert, ApiError> {
    store.read(|tables| load(tables, caller.org_id, alert_id))
}

pub fn change_status(
    store: &Store,
    caller: &AuthenticatedUser,
    alert_id: Uuid,
    req: AlertStatusRequest,
) -> Result<Alert, ApiError> {
    caller.require(OPERATIONS)?;
    let effect = match req.status {
        AlertStatus::Resolved => match req.note {
            Some(note) => {
                check_note(&note)?;
                Effect::Resolve(note)
            }
            None => Effect::None,
        },
        AlertStatus::Suppressed => match (req.suppressed_until, req.reason) {
            (Some(until), Some(reason)) => {
                check_suppression(until, &reason, Utc::now())?;
                Effect::Suppress { until, reason }
            }
            _ => Effect::None,
        },
        _ => Effect::None,
    };
    transition(store, caller, alert_id, req.status, effect)
}

pub fn resolve(store: &Store, caller: &AuthenticatedUser, alert_id: Uuid, req: ResolveRequest) -> Result<Alert, ApiError> {
    caller.require(OPERATIONS)?;
    check_note(&req.note)?;
    transition(store, caller, alert_id, AlertStatus::Resolved, Effect::Resolve(req.note))
}

pub fn suppress(store: &Store, caller: &AuthenticatedUser, alert_id: Uuid, req: SuppressRequest) -> Result<Alert, ApiError> {
    caller.require(OPERATIONS)?;
    check_suppression(req.suppressed_until, &req.reason, Utc::now())?;
    transition(
        store,
        caller,
        alert_id,
        AlertStatus::Suppressed,
        Effect::Suppress {
            until: req.suppressed_until,
            reason: req.reason,
        },
    )
}

/// Assigning an open alert also acknowledges it.
pub fn assign(store: &Store, caller: &AuthenticatedUser, alert_id: Uuid, req: AssignRequest) -> Result<Alert, ApiError> {
    caller.require(OPERATIONS)?;

    let (alert, acknowledged) = store.transaction(|tables| {
        ensure_active_member(tables, caller.org_id, req.assigned_to, "assigned_to")?;
        let mut alert = load(tables, caller.org_id, alert_id)?;
        if alert.status.is_settled() {
            return Err(ApiError::Unprocessable(format!(
                "Alerts in status '{}' cannot be assigned",
                alert.status
            )));
        }
        let now = Utc::now();
        alert.assigned_to = Some(req.assigned_to);
        alert.assigned_at = Some(now);
        let acknowledged = alert.status == AlertStatus::Open;
        if acknowledged {
            apply(&mut alert, AlertStatus::Acknowledged, Effect::None, caller.user_id, now)?;
        }
        alert.updated_at = now;
        Ok((tables.alerts().update(alert)?, acknowledged))
    })?;

    let mut event = AuditEvent::new(caller, "alert.assigned", "alert", alert.id)
        .with_metadata("assigned_to", req.assigned_to.to_string());
    if acknowledged {
        event = event.with_metadata("auto_acknowledged", true);
    }
    event.record(store);
    Ok(alert)
}

/// Checks a redelivery request. The deliveries themselves are made by the
/// notifier once this returns.
pub fn plan_redelivery(
    store: &Store,
    caller: &AuthenticatedUser,
    alert_id: Uuid,
    req: RedeliverRequest,
) -> Result<RedeliveryPlan, ApiError> {
    caller.require(OPERATIONS)?;
    let mut channels = Vec::new();
    for channel in req.channels {
        if !channels.contains(&channel) {
            channels.push(channel);
        }
    }
    if channels.is_empty() {
        return Err(ApiError::field("channels", "must name at least one channel"));
    }

    store.read(|tables| {
        let alert = load(tables, caller.org_id, alert_id)?;
        let rule = match alert.rule_id {
            Some(id) => tables.alert_rules().find(caller.org_id, id)?,
            None => None,
        }
        .ok_or_else(|| ApiError::Unprocessable("The alert's rule no longer exists".into()))?;
        if let Some(missing) = channels.iter().find(|c| !rule.is_configured(**c)) {
            return Err(ApiError::field(
                "channels",
                format!("{missing} is not configured on the alert rule"),
            ));
        }
        Ok(())
    })?;

    AuditEvent::new(caller, "alert.redelivered", "alert", alert_id)
        .with_metadata(
            "channels",
            channels.iter().map(|c| c.as_str()).collect::<Vec<_>>().join(","),
        )
        .record(store);
    Ok(RedeliveryPlan {
        org_id: caller.org_id,
        alert_id,
        channels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::types::AlertRule;
    use crate::security::auth::Role;
    use crate::tests::test_util::{audit_actions, Tenant};
    use crate::{assert_err, assert_ok};

    fn seed_alert(tenant: &Tenant, status: AlertStatus) -> Alert {
        let mut alert = Alert::new(tenant.org_id, "Admin MFA fail".into(), Severity::High);
        alert.status = status;
        assert_ok!(tenant.store.transaction(|t| t.alerts().insert_sequenced(alert)))
    }

    fn status(status: AlertStatus) -> AlertStatusRequest {
        AlertStatusRequest {
            status,
            note: None,
            suppressed_until: None,
            reason: None,
        }
    }

    fn suppression(days: i64) -> SuppressRequest {
        SuppressRequest {
            suppressed_until: Utc::now() + Duration::days(days),
            reason: "Maintenance window agreed with the platform team".into(),
        }
    }

    #[test]
    fn test_open_to_resolved_is_rejected() {
        let tenant = Tenant::new();
        let engineer = tenant.caller(Role::SecurityEngineer);
        let alert = seed_alert(&tenant, AlertStatus::Open);

        let mut req = status(AlertStatus::Resolved);
        req.note = Some("Fixed".into());
        let err = assert_err!(change_status(&tenant.store, &engineer, alert.id, req));
        assert_eq!(err.error_code(), "UNPROCESSABLE");
        let message = err.public_message();
        assert!(message.contains("'open'") && message.contains("'resolved'"));
    }

    #[test]
    fn test_suppress_close_reopen_clears_suppression() {
        let tenant = Tenant::new();
        let engineer = tenant.caller(Role::ItAdmin);
        let alert = seed_alert(&tenant, AlertStatus::Open);

        let suppressed = assert_ok!(suppress(&tenant.store, &engineer, alert.id, suppression(7)));
        assert_eq!(suppressed.status, AlertStatus::Suppressed);
        let closed = assert_ok!(change_status(&tenant.store, &engineer, alert.id, status(AlertStatus::Closed)));
        assert!(closed.suppression_reason.is_some());

        let err = assert_err!(suppress(&tenant.store, &engineer, alert.id, suppression(7)));
        assert_eq!(err.error_code(), "UNPROCESSABLE");

        let reopened = assert_ok!(change_status(&tenant.store, &engineer, alert.id, status(AlertStatus::Open)));
        assert_eq!(reopened.status, AlertStatus::Open);
        assert!(reopened.suppressed_until.is_none());
        assert!(reopened.suppressed_by.is_none());
        assert!(reopened.suppression_reason.is_none());

        assert_eq!(
            audit_actions(&tenant.store, tenant.org_id),
            vec!["alert.suppressed", "alert.status_changed", "alert.reopened"]
        );
    }

    #[test]
    fn test_suppression_window_bounds() {
        let tenant = Tenant::new();
        let engineer = tenant.caller(Role::Ciso);
        let alert = seed_alert(&tenant, AlertStatus::Open);

        let err = assert_err!(suppress(&tenant.store, &engineer, alert.id, suppression(91)));
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
        let err = assert_err!(suppress(&tenant.store, &engineer, alert.id, suppression(-1)));
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
        let mut short = suppression(3);
        short.reason = "too short".into();
        let err = assert_err!(suppress(&tenant.store, &engineer, alert.id, short));
        assert_eq!(err.error_code(), "VALIDATION_ERROR");

        let mut edge = suppression(90);
        edge.suppressed_until -= Duration::seconds(5);
        assert_ok!(suppress(&tenant.store, &engineer, alert.id, edge));
    }

    #[test]
    fn test_assign_acknowledges_and_resolve_needs_note() {
        let tenant = Tenant::new();
        let engineer = tenant.caller(Role::SecurityEngineer);
        let alert = seed_alert(&tenant, AlertStatus::Open);

        let assigned = assert_ok!(assign(
            &tenant.store,
            &engineer,
            alert.id,
            AssignRequest {
                assigned_to: engineer.user_id
            }
        ));
        assert_eq!(assigned.status, AlertStatus::Acknowledged);
        assert_eq!(assigned.acknowledged_by, Some(engineer.user_id));

        assert_ok!(change_status(&tenant.store, &engineer, alert.id, status(AlertStatus::InProgress)));
        let err = assert_err!(change_status(&tenant.store, &engineer, alert.id, status(AlertStatus::Resolved)));
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
        let err = assert_err!(resolve(&tenant.store, &engineer, alert.id, ResolveRequest { note: "  ".into() }));
        assert_eq!(err.error_code(), "VALIDATION_ERROR");

        let resolved = assert_ok!(resolve(
            &tenant.store,
            &engineer,
            alert.id,
            ResolveRequest {
                note: "Enforced MFA on the two admin accounts".into()
            }
        ));
        assert_eq!(resolved.status, AlertStatus::Resolved);
        assert!(resolved.resolved_at.is_some());

        let reopened = assert_ok!(change_status(&tenant.store, &engineer, alert.id, status(AlertStatus::Open)));
        assert!(reopened.resolution_note.is_none());
    }

    #[test]
    fn test_redelivery_checks_channels() {
        let tenant = Tenant::new();
        let engineer = tenant.caller(Role::SecurityEngineer);
        let mut rule = AlertRule::new(tenant.org_id, "r".into(), Severity::High, engineer.user_id);
        rule.slack_webhook_url = Some("https://hooks.slack.com/services/T000/B000/XXX".into());
        let rule = assert_ok!(tenant.store.transaction(|t| t.alert_rules().insert(rule)));
        let mut alert = Alert::new(tenant.org_id, "x".into(), Severity::High);
        alert.rule_id = Some(rule.id);
        let alert = assert_ok!(tenant.store.transaction(|t| t.alerts().insert_sequenced(alert)));

        let err = assert_err!(plan_redelivery(
            &tenant.store,
            &engineer,
            alert.id,
            RedeliverRequest {
                channels: vec![Channel::Webhook]
            }
        ));
        assert_eq!(err.error_code(), "VALIDATION_ERROR");

        let plan = assert_ok!(plan_redelivery(
            &tenant.store,
            &engineer,
            alert.id,
            RedeliverRequest {
                channels: vec![Channel::Slack, Channel::Slack]
            }
        ));
        assert_eq!(plan.channels, vec![Channel::Slack]);

        let viewer = tenant.caller(Role::Viewer);
        let err = assert_err!(plan_redelivery(
            &tenant.store,
            &viewer,
            alert.id,
            RedeliverRequest {
                channels: vec![Channel::Slack]
            }
        ));
        assert_eq!(err.error_code(), "FORBIDDEN");
    }
}
