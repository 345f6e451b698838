use chrono::{DateTime, Utc};
use diesel::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

use super::types::{Alert, AlertStatus};
use crate::security::audit::{record_all, AuditEvent};
use crate::store::{Store, StoreError};

/// Flags every unsettled alert whose deadline has passed. Returns how many
/// alerts changed.
pub fn sweep(store: &Store, now: DateTime<Utc>) -> Result<usize, StoreError> {
    let breached = store.transaction(|tables| {
        let due = overdue(tables.conn(), now)?;
        let mut breached = Vec::with_capacity(due.len());
        for mut alert in due {
            alert.sla_breached = true;
            alert.updated_at = now;
            breached.push(tables.alerts().update(alert)?);
        }
        Ok::<_, StoreError>(breached)
    })?;

    record_all(
        store,
        breached
            .iter()
            .map(|a| {
                AuditEvent::system(a.org_id, "alert.sla_breached", "alert", a.id)
                    .with_metadata("alert_number", a.alert_number)
                    .with_metadata("severity", a.severity.as_str())
            })
            .collect(),
    );
    Ok(breached.len())
}

/// Unsettled, unflagged alerts past their deadline, locked so concurrent
/// sweepers skip them.
fn overdue(conn: &mut PgConnection, now: DateTime<Utc>) -> Result<Vec<Alert>, StoreError> {
    use crate::store::schema::alerts::dsl;

    Ok(dsl::alerts
        .filter(dsl::sla_breached.eq(false))
        .filter(dsl::status.ne_all(vec![AlertStatus::Resolved, AlertStatus::Closed]))
        .filter(dsl::sla_deadline.lt(now))
        .select(Alert::as_select())
        .order(dsl::sla_deadline.asc())
        .for_update()
        .skip_locked()
        .load(conn)?)
}

/// Runs [`sweep`] every `interval` until `shutdown` flips to true.
pub async fn run_sweeper(store: Arc<Store>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(interval_secs = interval.as_secs(), "SLA sweeper started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let store = Arc::clone(&store);
                match tokio::task::spawn_blocking(move || sweep(&store, Utc::now())).await {
                    Ok(Ok(0)) => debug!("SLA sweep found nothing overdue"),
                    Ok(Ok(count)) => info!(count, "alerts marked as SLA breached"),
                    Ok(Err(e)) => error!("SLA sweep failed: {e}"),
                    Err(e) => error!("SLA sweep task panicked: {e}"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("SLA sweeper stopping");
                    break;
                }
            }
        }
    }
}
