use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::core::macros::string_enum;
use crate::core::metadata::empty_map;
use crate::core::severity::Severity;
use crate::store::table::entity;
use crate::test_engine::types::{ResultStatus, TestType};

string_enum! {
    pub enum AlertStatus {
        Open => "open",
        Acknowledged => "acknowledged",
        InProgress => "in_progress",
        Suppressed => "suppressed",
        Resolved => "resolved",
        Closed => "closed",
    }
}

impl AlertStatus {
    pub fn can_transition_to(self, next: AlertStatus) -> bool {
        use AlertStatus::*;
        matches!(
            (self, next),
            (Open, Acknowledged)
                | (Open, InProgress)
                | (Open, Suppressed)
                | (Open, Closed)
                | (Acknowledged, InProgress)
                | (Acknowledged, Suppressed)
                | (Acknowledged, Closed)
                | (InProgress, Resolved)
                | (InProgress, Suppressed)
                | (InProgress, Closed)
                | (Resolved, Closed)
                | (Resolved, Open)
                | (Suppressed, Open)
                | (Suppressed, Closed)
                | (Closed, Open)
        )
    }

    /// Resolved and closed alerts no longer count against SLAs or cooldowns.
    pub fn is_settled(self) -> bool {
        matches!(self, AlertStatus::Resolved | AlertStatus::Closed)
    }
}

string_enum! {
    pub enum Channel {
        Slack => "slack",
        Email => "email",
        Webhook => "webhook",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = crate::store::schema::alerts, check_for_backend(diesel::pg::Pg), treat_none_as_null = true)]
pub struct Alert {
    pub id: Uuid,
    pub org_id: Uuid,
    pub alert_number: i64,
    pub title: String,
    pub description: Option<String>,
    pub severity: Severity,
    pub status: AlertStatus,
    pub control_id: Option<Uuid>,
    pub test_id: Option<Uuid>,
    pub test_result_id: Option<Uuid>,
    pub rule_id: Option<Uuid>,
    pub assigned_to: Option<Uuid>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<Uuid>,
    pub sla_deadline: Option<DateTime<Utc>>,
    pub sla_breached: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<Uuid>,
    pub resolution_note: Option<String>,
    pub suppressed_until: Option<DateTime<Utc>>,
    pub suppressed_by: Option<Uuid>,
    pub suppression_reason: Option<String>,
    pub channels: Vec<Channel>,
    /// Channel name to last successful delivery time.
    pub delivered_at: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

entity!(Alert => alerts, sequenced "alerts" => alert_number, { of_rule => rule_id });

impl Alert {
    pub fn new(org_id: Uuid, title: String, severity: Severity) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            org_id,
            alert_number: 0,
            title,
            description: None,
            severity,
            status: AlertStatus::Open,
            control_id: None,
            test_id: None,
            test_result_id: None,
            rule_id: None,
            assigned_to: None,
            assigned_at: None,
            acknowledged_at: None,
            acknowledged_by: None,
            sla_deadline: None,
            sla_breached: false,
            resolved_at: None,
            resolved_by: None,
            resolution_note: None,
            suppressed_until: None,
            suppressed_by: None,
            suppression_reason: None,
            channels: Vec::new(),
            delivered_at: empty_map(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn clear_resolution(&mut self) {
        self.resolved_at = None;
        self.resolved_by = None;
        self.resolution_note = None;
    }

    pub fn clear_suppression(&mut self) {
        self.suppressed_until = None;
        self.suppressed_by = None;
        self.suppression_reason = None;
    }
}

/// Matchers decide which results raise an alert; empty matchers match
/// anything. The remaining fields shape the alert and its delivery.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = crate::store::schema::alert_rules, check_for_backend(diesel::pg::Pg), treat_none_as_null = true)]
pub struct AlertRule {
    pub id: Uuid,
    pub org_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub enabled: bool,
    pub priority: i32,
    pub match_test_types: Vec<TestType>,
    pub match_severities: Vec<Severity>,
    pub match_result_statuses: Vec<ResultStatus>,
    pub match_control_ids: Vec<Uuid>,
    pub match_tags: Vec<String>,
    pub consecutive_failures: i32,
    pub cooldown_minutes: i32,
    pub alert_severity: Severity,
    pub title_template: Option<String>,
    pub auto_assign_to: Option<Uuid>,
    pub sla_hours: Option<i32>,
    pub channels: Vec<Channel>,
    pub slack_webhook_url: Option<String>,
    pub email_recipients: Vec<String>,
    pub webhook_url: Option<String>,
    pub webhook_headers: Value,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

entity!(AlertRule => alert_rules, tenant);

impl AlertRule {
    pub fn new(org_id: Uuid, name: String, alert_severity: Severity, created_by: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            org_id,
            name,
            description: None,
            enabled: true,
            priority: 100,
            match_test_types: Vec::new(),
            match_severities: Vec::new(),
            match_result_statuses: Vec::new(),
            match_control_ids: Vec::new(),
            match_tags: Vec::new(),
            consecutive_failures: 1,
            cooldown_minutes: 0,
            alert_severity,
            title_template: None,
            auto_assign_to: None,
            sla_hours: None,
            channels: Vec::new(),
            slack_webhook_url: None,
            email_recipients: Vec::new(),
            webhook_url: None,
            webhook_headers: empty_map(),
            created_by,
            created_at: now,
            updated_at: now,
        }
    }

    /// True when the channel has somewhere to deliver to.
    pub fn is_configured(&self, channel: Channel) -> bool {
        match channel {
            Channel::Slack => self.slack_webhook_url.is_some(),
            Channel::Email => !self.email_recipients.is_empty(),
            Channel::Webhook => self.webhook_url.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_cannot_jump_to_resolved() {
        assert!(!AlertStatus::Open.can_transition_to(AlertStatus::Resolved));
        assert!(!AlertStatus::Closed.can_transition_to(AlertStatus::Resolved));
        assert!(!AlertStatus::Closed.can_transition_to(AlertStatus::Suppressed));
        assert!(AlertStatus::Closed.can_transition_to(AlertStatus::Open));
        assert!(AlertStatus::InProgress.can_transition_to(AlertStatus::Resolved));
    }

    #[test]
    fn test_channel_configuration() {
        let mut rule = AlertRule::new(Uuid::new_v4(), "Critical".into(), Severity::High, Uuid::new_v4());
        assert!(!rule.is_configured(Channel::Slack));
        rule.email_recipients.push("secops@example.com".into());
        assert!(rule.is_configured(Channel::Email));
    }
}
