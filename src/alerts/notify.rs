//! Outbound alert delivery over Slack, generic webhooks and email.

use anyhow::Result;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::types::{Alert, AlertRule, AlertStatus, Channel};
use crate::config::NotificationConfig;
use crate::core::error::ApiError;
use crate::core::metadata;
use crate::core::severity::Severity;
use crate::store::Store;

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("{channel} delivery timed out after {seconds}s")]
    Timeout { channel: Channel, seconds: u64 },
    #[error("{channel} endpoint answered HTTP {status}")]
    Status { channel: Channel, status: u16 },
    #[error("{channel} delivery failed: {message}")]
    Transport { channel: Channel, message: String },
    #[error("{0} is not configured on the alert rule")]
    NotConfigured(Channel),
}

/// Hand-off point for email. Rendering and SMTP live behind this trait.
pub trait EmailTransport: Send + Sync {
    fn send(&self, recipients: &[String], subject: &str, body: &str) -> Result<(), String>;
}

/// Default transport: records the hand-off in the log.
#[derive(Debug, Default)]
pub struct LogTransport;

impl EmailTransport for LogTransport {
    fn send(&self, recipients: &[String], subject: &str, _body: &str) -> Result<(), String> {
        info!(recipients = recipients.len(), subject, "alert email handed to transport");
        Ok(())
    }
}

/// The JSON body sent to webhooks.
#[derive(Debug, Clone, Serialize)]
pub struct AlertPayload {
    pub alert_id: Uuid,
    pub alert_number: i64,
    pub org_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub severity: Severity,
    pub status: AlertStatus,
    pub control_id: Option<Uuid>,
    pub test_id: Option<Uuid>,
    pub sla_deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub test: bool,
}

impl AlertPayload {
    pub fn from_alert(alert: &Alert) -> Self {
        Self {
            alert_id: alert.id,
            alert_number: alert.alert_number,
            org_id: alert.org_id,
            title: alert.title.clone(),
            description: alert.description.clone(),
            severity: alert.severity,
            status: alert.status,
            control_id: alert.control_id,
            test_id: alert.test_id,
            sla_deadline: alert.sla_deadline,
            created_at: alert.created_at,
            test: false,
        }
    }

    /// Synthetic payload used to check a rule's endpoints.
    pub fn test_message(rule: &AlertRule) -> Self {
        let now = Utc::now();
        Self {
            alert_id: Uuid::nil(),
            alert_number: 0,
            org_id: rule.org_id,
            title: format!("Test delivery for alert rule '{}'", rule.name),
            description: Some("This is a test notification.".into()),
            severity: rule.alert_severity,
            status: AlertStatus::Open,
            control_id: None,
            test_id: None,
            sla_deadline: None,
            created_at: now,
            test: true,
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "[{}] Alert #{}: {}",
            self.severity.as_str().to_uppercase(),
            self.alert_number,
            self.title
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelOutcome {
    pub channel: Channel,
    pub delivered: bool,
    pub delivered_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct Notifier {
    client: reqwest::Client,
    timeout_seconds: u64,
    email: Arc<dyn EmailTransport>,
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("timeout_seconds", &self.timeout_seconds)
            .finish_non_exhaustive()
    }
}

impl Notifier {
    pub fn new(config: &NotificationConfig) -> Result<Self> {
        Self::with_transport(config, Arc::new(LogTransport))
    }

    pub fn with_transport(config: &NotificationConfig, email: Arc<dyn EmailTransport>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;
        Ok(Self {
            client,
            timeout_seconds: config.timeout_seconds,
            email,
        })
    }

    fn transport_error(&self, channel: Channel, err: reqwest::Error) -> DeliveryError {
        if err.is_timeout() {
            DeliveryError::Timeout {
                channel,
                seconds: self.timeout_seconds,
            }
        } else {
            DeliveryError::Transport {
                channel,
                message: err.to_string(),
            }
        }
    }

    pub async fn send_slack(&self, url: &str, payload: &AlertPayload) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(url)
            .json(&json!({ "text": payload.summary() }))
            .send()
            .await
            .map_err(|e| self.transport_error(Channel::Slack, e))?;
        if response.status() != reqwest::StatusCode::OK {
            return Err(DeliveryError::Status {
                channel: Channel::Slack,
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }

    pub async fn send_webhook(&self, url: &str, headers: &Value, payload: &AlertPayload) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(url)
            .headers(header_map(headers))
            .json(payload)
            .send()
            .await
            .map_err(|e| self.transport_error(Channel::Webhook, e))?;
        if !response.status().is_success() {
            return Err(DeliveryError::Status {
                channel: Channel::Webhook,
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }

    pub fn send_email(&self, recipients: &[String], payload: &AlertPayload) -> Result<(), DeliveryError> {
        let body = payload.description.clone().unwrap_or_default();
        self.email
            .send(recipients, &payload.summary(), &body)
            .map_err(|message| DeliveryError::Transport {
                channel: Channel::Email,
                message,
            })
    }

    /// Sends `payload` on one channel using the endpoints stored on `rule`.
    pub async fn send(&self, rule: &AlertRule, channel: Channel, payload: &AlertPayload) -> Result<(), DeliveryError> {
        match channel {
            Channel::Slack => match &rule.slack_webhook_url {
                Some(url) => self.send_slack(url, payload).await,
                None => Err(DeliveryError::NotConfigured(channel)),
            },
            Channel::Webhook => match &rule.webhook_url {
                Some(url) => self.send_webhook(url, &rule.webhook_headers, payload).await,
                None => Err(DeliveryError::NotConfigured(channel)),
            },
            Channel::Email if rule.email_recipients.is_empty() => Err(DeliveryError::NotConfigured(channel)),
            Channel::Email => self.send_email(&rule.email_recipients, payload),
        }
    }

    /// Delivers an alert on `channels` and merges the successful delivery
    /// times into the alert. Failures are reported per channel, never
    /// returned as an error. Store access runs on the blocking pool.
    pub async fn deliver(
        &self,
        store: &Arc<Store>,
        org_id: Uuid,
        alert_id: Uuid,
        channels: &[Channel],
    ) -> Result<Vec<ChannelOutcome>, ApiError> {
        let (alert, rule) = off_runtime(store, move |store| {
            store.read(|tables| {
                let alert = tables
                    .alerts()
                    .find(org_id, alert_id)?
                    .ok_or_else(|| ApiError::not_found("Alert"))?;
                let rule = match alert.rule_id {
                    Some(id) => tables.alert_rules().find(org_id, id)?,
                    None => None,
                }
                .ok_or_else(|| ApiError::Unprocessable("The alert's rule no longer exists".into()))?;
                Ok((alert, rule))
            })
        })
        .await?;

        let payload = AlertPayload::from_alert(&alert);
        let mut outcomes = Vec::with_capacity(channels.len());
        for &channel in channels {
            match self.send(&rule, channel, &payload).await {
                Ok(()) => outcomes.push(ChannelOutcome {
                    channel,
                    delivered: true,
                    delivered_at: Some(Utc::now()),
                    error: None,
                }),
                Err(e) => {
                    error!(alert_id = %alert.id, channel = %channel, error = %e, "alert delivery failed");
                    outcomes.push(ChannelOutcome {
                        channel,
                        delivered: false,
                        delivered_at: None,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        let mut patch = Map::new();
        for outcome in &outcomes {
            if let Some(at) = outcome.delivered_at {
                patch.insert(outcome.channel.as_str().to_string(), Value::String(at.to_rfc3339()));
            }
        }
        if !patch.is_empty() {
            off_runtime(store, move |store| {
                store.transaction(|tables| {
                    let mut alert = tables
                        .alerts()
                        .find(org_id, alert_id)?
                        .ok_or_else(|| ApiError::not_found("Alert"))?;
                    metadata::merge(&mut alert.delivered_at, Value::Object(patch));
                    Ok(tables.alerts().update(alert)?)
                })
            })
            .await?;
        }
        Ok(outcomes)
    }

    /// Delivers a freshly generated alert in the background. The mutation
    /// that created it has already committed.
    pub fn dispatch(self: &Arc<Self>, store: Arc<Store>, alert: &Alert) {
        if alert.channels.is_empty() {
            return;
        }
        let notifier = Arc::clone(self);
        let (org_id, alert_id, channels) = (alert.org_id, alert.id, alert.channels.clone());
        tokio::spawn(async move {
            match notifier.deliver(&store, org_id, alert_id, &channels).await {
                Ok(outcomes) => {
                    let delivered = outcomes.iter().filter(|o| o.delivered).count();
                    info!(%alert_id, delivered, attempted = outcomes.len(), "alert delivery finished");
                }
                Err(e) => error!(%alert_id, error = %e, "alert delivery aborted"),
            }
        });
    }

    /// Sends a synthetic message on each configured channel of the rule and
    /// stops at the first failure.
    pub async fn test_delivery(&self, rule: &AlertRule) -> Result<Vec<Channel>, DeliveryError> {
        let payload = AlertPayload::test_message(rule);
        let mut delivered = Vec::new();
        for &channel in &rule.channels {
            self.send(rule, channel, &payload).await?;
            delivered.push(channel);
        }
        Ok(delivered)
    }
}

/// Runs synchronous store work on the blocking pool.
async fn off_runtime<T, F>(store: &Arc<Store>, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&Store) -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|e| ApiError::Internal(format!("blocking task failed: {e}")))?
}

fn header_map(headers: &Value) -> HeaderMap {
    let mut map = HeaderMap::new();
    let Some(entries) = headers.as_object() else {
        return map;
    };
    for (name, value) in entries {
        let parsed = (
            HeaderName::from_bytes(name.as_bytes()),
            value.as_str().map(HeaderValue::from_str),
        );
        match parsed {
            (Ok(name), Some(Ok(value))) => {
                map.insert(name, value);
            }
            _ => warn!(header = %name, "skipping invalid webhook header"),
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::types::AlertRule;
    use crate::store::StoreError;
    use crate::tests::test_util::Tenant;
    use std::sync::Mutex;

    fn notifier() -> Notifier {
        Notifier::new(&NotificationConfig::default()).expect("client builds")
    }

    fn rule() -> AlertRule {
        AlertRule::new(Uuid::new_v4(), "Critical failures".into(), Severity::Critical, Uuid::new_v4())
    }

    #[derive(Default)]
    struct Outbox(Mutex<Vec<String>>);

    impl EmailTransport for Outbox {
        fn send(&self, recipients: &[String], subject: &str, _body: &str) -> Result<(), String> {
            self.0
                .lock()
                .map_err(|e| e.to_string())?
                .push(format!("{} -> {subject}", recipients.join(",")));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_slack_requires_ok() {
        let mut server = mockito::Server::new_async().await;
        let ok = server
            .mock("POST", "/slack")
            .match_body(mockito::Matcher::PartialJson(json!({"text": "[CRITICAL] Alert #0: Test delivery for alert rule 'Critical failures'"})))
            .with_status(200)
            .with_body("ok")
            .create_async()
            .await;

        let mut rule = rule();
        rule.slack_webhook_url = Some(format!("{}/slack", server.url()));
        rule.channels = vec![Channel::Slack];
        let delivered = notifier().test_delivery(&rule).await.expect("delivered");
        assert_eq!(delivered, vec![Channel::Slack]);
        ok.assert_async().await;

        server
            .mock("POST", "/broken")
            .with_status(500)
            .create_async()
            .await;
        rule.slack_webhook_url = Some(format!("{}/broken", server.url()));
        let err = notifier().test_delivery(&rule).await.expect_err("500 fails");
        assert!(matches!(err, DeliveryError::Status { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_webhook_sends_headers_and_payload() {
        let mut server = mockito::Server::new_async().await;
        let hook = server
            .mock("POST", "/hook")
            .match_header("x-api-key", "secret")
            .match_header("content-type", "application/json")
            .match_body(mockito::Matcher::PartialJson(json!({"test": true, "severity": "critical"})))
            .with_status(204)
            .create_async()
            .await;

        let mut rule = rule();
        rule.webhook_url = Some(format!("{}/hook", server.url()));
        rule.webhook_headers = json!({"X-Api-Key": "secret"});
        rule.channels = vec![Channel::Webhook];
        notifier().test_delivery(&rule).await.expect("delivered");
        hook.assert_async().await;
    }

    #[tokio::test]
    async fn test_unconfigured_channel_and_email_transport() {
        let outbox = Arc::new(Outbox::default());
        let notifier = Notifier::with_transport(&NotificationConfig::default(), outbox.clone()).expect("client");
        let mut rule = rule();
        rule.channels = vec![Channel::Email];
        let err = notifier.test_delivery(&rule).await.expect_err("no recipients");
        assert!(matches!(err, DeliveryError::NotConfigured(Channel::Email)));

        rule.email_recipients = vec!["secops@example.com".into()];
        notifier.test_delivery(&rule).await.expect("handed off");
        let sent = outbox.0.lock().expect("lock").clone();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with("secops@example.com -> [CRITICAL]"));
    }

    fn seed_alert(store: &Store, org_id: Uuid, slack_url: String) -> Alert {
        let mut rule = AlertRule::new(org_id, "r".into(), Severity::High, Uuid::new_v4());
        rule.slack_webhook_url = Some(slack_url);
        let mut alert = Alert::new(org_id, "Disk encryption fail".into(), Severity::High);
        alert.rule_id = Some(rule.id);
        alert.delivered_at = json!({"email": "2026-01-01T00:00:00+00:00"});
        store
            .transaction(|t| {
                t.alert_rules().insert(rule)?;
                t.alerts().insert_sequenced(alert)
            })
            .expect("seed")
    }

    #[tokio::test]
    async fn test_deliver_merges_timestamps() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/slack")
            .with_status(200)
            .with_body("ok")
            .create_async()
            .await;

        let Tenant { store, org_id } = Tenant::new();
        let store = Arc::new(store);
        let alert = seed_alert(&store, org_id, format!("{}/slack", server.url()));

        let outcomes = notifier()
            .deliver(&store, org_id, alert.id, &[Channel::Slack, Channel::Webhook])
            .await
            .expect("deliver");
        assert!(outcomes[0].delivered);
        assert!(!outcomes[1].delivered);

        let stored = store.read(|t| t.alerts().get(alert.id)).expect("read").expect("alert");
        assert!(stored.delivered_at.get("slack").is_some());
        assert_eq!(stored.delivered_at["email"], "2026-01-01T00:00:00+00:00");
        assert!(stored.delivered_at.get("webhook").is_none());
    }

    /// The store's only connection is released by a task on this
    /// current-thread runtime, so a delivery that waited for it on the
    /// runtime thread would stall until the pool timed out.
    #[tokio::test]
    async fn test_deliver_leaves_runtime_free_while_waiting_for_store() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/slack")
            .with_status(200)
            .with_body("ok")
            .create_async()
            .await;

        let Tenant { store, org_id } = Tenant::new();
        let store = Arc::new(store);
        let alert = seed_alert(&store, org_id, format!("{}/slack", server.url()));

        let (acquired_tx, acquired) = tokio::sync::oneshot::channel();
        let (release, released) = tokio::sync::oneshot::channel::<()>();
        let holder = Arc::clone(&store);
        let hold = tokio::task::spawn_blocking(move || {
            holder.read(|_| {
                let _ = acquired_tx.send(());
                let _ = released.blocking_recv();
                Ok::<_, StoreError>(())
            })
        });
        acquired.await.expect("connection held");
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = release.send(());
        });

        let outcomes = tokio::time::timeout(
            Duration::from_secs(5),
            notifier().deliver(&store, org_id, alert.id, &[Channel::Slack]),
        )
        .await
        .expect("delivery finished")
        .expect("deliver");
        assert!(outcomes[0].delivered);
        hold.await.expect("holder joined").expect("holder read");

        let stored = store.read(|t| t.alerts().get(alert.id)).expect("read").expect("alert");
        assert!(stored.delivered_at.get("slack").is_some());
    }
}
