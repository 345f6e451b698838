use axum::{
    extract::{Query, State},
    Extension, Json,
};
use chrono::{DateTime, Utc};
use diesel::pg::Pg;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::error;
use uuid::Uuid;

use super::auth::{AuthenticatedUser, AUDIT_READERS};
use crate::core::error::ApiError;
use crate::core::extract::parse_filter;
use crate::core::pagination::{ListSpec, Page, PageParams, SortOrder};
use crate::core::response::{self, ListResponse};
use crate::core::state::AppState;
use crate::store::schema::audit_logs;
use crate::store::Store;

/// Immutable journal row. Never updated or deleted once appended.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Insertable)]
#[diesel(table_name = audit_logs, check_for_backend(diesel::pg::Pg))]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub org_id: Uuid,
    pub actor_id: Option<Uuid>,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<Uuid>,
    pub metadata: Value,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Builder for one audit record. `record` appends it best effort.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    org_id: Uuid,
    actor_id: Option<Uuid>,
    action: String,
    resource_type: String,
    resource_id: Option<Uuid>,
    metadata: Map<String, Value>,
    ip_address: Option<String>,
    user_agent: Option<String>,
    request_id: Option<String>,
}

impl AuditEvent {
    pub fn new(caller: &AuthenticatedUser, action: &str, resource_type: &str, resource_id: Uuid) -> Self {
        Self {
            org_id: caller.org_id,
            actor_id: Some(caller.user_id),
            action: action.to_string(),
            resource_type: resource_type.to_string(),
            resource_id: Some(resource_id),
            metadata: Map::new(),
            ip_address: caller.ip_address.clone(),
            user_agent: caller.user_agent.clone(),
            request_id: Some(caller.request_id.clone()),
        }
    }

    /// Event raised by the service itself rather than by a caller.
    pub fn system(org_id: Uuid, action: &str, resource_type: &str, resource_id: Uuid) -> Self {
        Self {
            org_id,
            actor_id: None,
            action: action.to_string(),
            resource_type: resource_type.to_string(),
            resource_id: Some(resource_id),
            metadata: Map::new(),
            ip_address: None,
            user_agent: None,
            request_id: None,
        }
    }

    pub fn with_actor(mut self, actor_id: Uuid) -> Self {
        self.actor_id = Some(actor_id);
        self
    }

    pub fn with_client(mut self, ip_address: Option<String>, user_agent: Option<String>) -> Self {
        self.ip_address = ip_address;
        self.user_agent = user_agent;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn into_entry(self) -> AuditLogEntry {
        AuditLogEntry {
            id: Uuid::new_v4(),
            org_id: self.org_id,
            actor_id: self.actor_id,
            action: self.action,
            resource_type: self.resource_type,
            resource_id: self.resource_id,
            metadata: Value::Object(self.metadata),
            ip_address: self.ip_address,
            user_agent: self.user_agent,
            created_at: Utc::now(),
        }
    }

    /// Appends the entry in its own journal transaction. A failure is logged
    /// and swallowed; it never fails the operation being audited.
    pub fn record(self, store: &Store) {
        let request_id = self.request_id.clone().unwrap_or_default();
        let action = self.action.clone();
        if let Err(e) = store.append_audit(self.into_entry()) {
            error!(request_id = %request_id, action = %action, "failed to write audit entry: {e}");
        }
    }
}

/// Appends every event of a finished operation, in order.
pub fn record_all(store: &Store, events: Vec<AuditEvent>) {
    for event in events {
        event.record(store);
    }
}

#[derive(Debug, Clone)]
pub struct AuditQuery {
    pub org_id: Uuid,
    pub action: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<Uuid>,
    pub actor_id: Option<Uuid>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl AuditQuery {
    pub fn for_org(org_id: Uuid) -> Self {
        Self {
            org_id,
            action: None,
            resource_type: None,
            resource_id: None,
            actor_id: None,
            from: None,
            to: None,
        }
    }

    /// The tenant's rows narrowed by every filter that is set.
    pub fn filtered(&self) -> audit_logs::BoxedQuery<'static, Pg> {
        let mut query = audit_logs::table
            .filter(audit_logs::org_id.eq(self.org_id))
            .into_boxed();
        if let Some(action) = &self.action {
            query = query.filter(audit_logs::action.eq(action.clone()));
        }
        if let Some(resource_type) = &self.resource_type {
            query = query.filter(audit_logs::resource_type.eq(resource_type.clone()));
        }
        if let Some(resource_id) = self.resource_id {
            query = query.filter(audit_logs::resource_id.eq(resource_id));
        }
        if let Some(actor_id) = self.actor_id {
            query = query.filter(audit_logs::actor_id.eq(actor_id));
        }
        if let Some(from) = self.from {
            query = query.filter(audit_logs::created_at.ge(from));
        }
        if let Some(to) = self.to {
            query = query.filter(audit_logs::created_at.le(to));
        }
        query
    }
}

const AUDIT_LIST: ListSpec = ListSpec {
    default_per_page: 50,
    max_per_page: 200,
    sort_fields: &["created_at"],
    default_sort: "created_at",
    default_order: SortOrder::Desc,
};

#[derive(Debug, Default, Deserialize)]
pub struct AuditLogParams {
    pub action: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub actor_id: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    #[serde(flatten)]
    pub page: PageParams,
}

pub fn list_entries(
    store: &Store,
    caller: &AuthenticatedUser,
    params: &AuditLogParams,
) -> Result<Page<AuditLogEntry>, ApiError> {
    caller.require(AUDIT_READERS)?;

    let query = AuditQuery {
        action: params.action.clone().filter(|a| !a.is_empty()),
        resource_type: params.resource_type.clone().filter(|r| !r.is_empty()),
        resource_id: parse_filter(&params.resource_id, "resource_id")?,
        actor_id: parse_filter(&params.actor_id, "actor_id")?,
        from: parse_filter(&params.from, "from")?,
        to: parse_filter(&params.to, "to")?,
        ..AuditQuery::for_org(caller.org_id)
    };

    let request = params.page.resolve(&AUDIT_LIST);
    Ok(store.query_audit(&query, &request)?)
}

pub async fn handle_list_audit_logs(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Query(params): Query<AuditLogParams>,
) -> Result<Json<ListResponse<AuditLogEntry>>, ApiError> {
    let request_id = caller.request_id.clone();
    let page = state
        .blocking(move |state| list_entries(&state.store, &caller, &params))
        .await?;
    Ok(response::list(request_id, page))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::auth::Role;
    use crate::tests::test_util::test_store;

    fn caller(org_id: Uuid, role: Role) -> AuthenticatedUser {
        AuthenticatedUser {
            user_id: Uuid::new_v4(),
            org_id,
            email: "ana@example.com".into(),
            role,
            request_id: "req-1".into(),
            ip_address: Some("10.0.0.1".into()),
            user_agent: Some("tests".into()),
        }
    }

    #[test]
    fn test_event_carries_caller_context() {
        let org = Uuid::new_v4();
        let who = caller(org, Role::Ciso);
        let resource = Uuid::new_v4();
        let entry = AuditEvent::new(&who, "control.created", "control", resource)
            .with_metadata("identifier", "CTRL-1")
            .into_entry();

        assert_eq!(entry.org_id, org);
        assert_eq!(entry.actor_id, Some(who.user_id));
        assert_eq!(entry.resource_id, Some(resource));
        assert_eq!(entry.ip_address.as_deref(), Some("10.0.0.1"));
        assert_eq!(entry.metadata["identifier"], "CTRL-1");
    }

    #[test]
    fn test_query_is_tenant_scoped_and_newest_first() {
        let store = test_store();
        let org = Uuid::new_v4();
        let who = caller(org, Role::Auditor);
        AuditEvent::new(&who, "risk.created", "risk", Uuid::new_v4()).record(&store);
        AuditEvent::new(&who, "risk.updated", "risk", Uuid::new_v4()).record(&store);
        AuditEvent::system(Uuid::new_v4(), "risk.created", "risk", Uuid::new_v4()).record(&store);

        let page = list_entries(&store, &who, &AuditLogParams::default()).expect("list");
        assert_eq!(page.total, 2);
        assert_eq!(page.items[0].action, "risk.updated");

        let params = AuditLogParams {
            page: PageParams {
                order: Some("asc".into()),
                per_page: Some("1".into()),
                ..PageParams::default()
            },
            ..AuditLogParams::default()
        };
        let page = list_entries(&store, &who, &params).expect("list");
        assert_eq!(page.total, 2);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].action, "risk.created");
    }

    #[test]
    fn test_filter_by_action() {
        let store = test_store();
        let org = Uuid::new_v4();
        let who = caller(org, Role::ComplianceManager);
        AuditEvent::new(&who, "risk.created", "risk", Uuid::new_v4()).record(&store);
        AuditEvent::new(&who, "control.created", "control", Uuid::new_v4()).record(&store);

        let params = AuditLogParams {
            action: Some("control.created".into()),
            ..AuditLogParams::default()
        };
        let page = list_entries(&store, &who, &params).expect("list");
        assert_eq!(page.total, 1);
    }

    #[test]
    fn test_viewer_cannot_read_audit_log() {
        let store = test_store();
        let who = caller(Uuid::new_v4(), Role::Viewer);
        let err = list_entries(&store, &who, &AuditLogParams::default()).unwrap_err();
        assert_eq!(err.error_code(), "FORBIDDEN");
    }

    #[test]
    fn test_bad_uuid_filter_is_validation_error() {
        let store = test_store();
        let who = caller(Uuid::new_v4(), Role::Ciso);
        let params = AuditLogParams {
            actor_id: Some("not-a-uuid".into()),
            ..AuditLogParams::default()
        };
        let err = list_entries(&store, &who, &params).unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }
}
