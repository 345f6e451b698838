use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::risks::load as load_risk;
use super::types::{Effectiveness, RiskControl};
use crate::core::error::ApiError;
use crate::core::pagination::{ListSpec, Page, PageParams, SortOrder};
use crate::security::audit::AuditEvent;
use crate::security::auth::{AuthenticatedUser, COMPLIANCE_EDITORS};
use crate::security::validation::Validator;
use crate::store::{Store, StoreError, Tables};

const LINK_LIST: ListSpec = ListSpec {
    default_per_page: 50,
    max_per_page: 200,
    sort_fields: &["created_at", "mitigation_percentage"],
    default_sort: "created_at",
    default_order: SortOrder::Asc,
};

#[derive(Debug, Deserialize)]
pub struct LinkControlRequest {
    pub control_id: Uuid,
    #[serde(default)]
    pub effectiveness: Effectiveness,
    #[serde(default)]
    pub mitigation_percentage: i32,
    pub notes: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateLinkRequest {
    pub effectiveness: Option<Effectiveness>,
    pub mitigation_percentage: Option<i32>,
    pub notes: Option<String>,
}

/// A link together with the identifying fields of its control.
#[derive(Debug, Clone, Serialize)]
pub struct RiskControlView {
    #[serde(flatten)]
    pub link: RiskControl,
    pub control_identifier: Option<String>,
    pub control_title: Option<String>,
}

fn view(tables: &mut Tables, link: RiskControl) -> Result<RiskControlView, StoreError> {
    let control = tables.controls().find(link.org_id, link.control_id)?;
    Ok(RiskControlView {
        control_identifier: control.as_ref().map(|c| c.identifier.clone()),
        control_title: control.map(|c| c.title),
        link,
    })
}

fn load(tables: &mut Tables, org_id: Uuid, link_id: Uuid) -> Result<RiskControl, ApiError> {
    tables
        .risk_controls()
        .find(org_id, link_id)?
        .ok_or_else(|| ApiError::not_found("Risk control link"))
}

pub fn list_risk_controls(
    store: &Store,
    caller: &AuthenticatedUser,
    risk_id: Uuid,
    page: &PageParams,
) -> Result<Page<RiskControlView>, ApiError> {
    let links = store.read(|tables| {
        load_risk(tables, caller.org_id, risk_id)?;
        let mut views = Vec::new();
        for link in tables.risk_controls().of_risk(risk_id)? {
            views.push(view(tables, link)?);
        }
        Ok::<_, ApiError>(views)
    })?;

    Ok(page.resolve(&LINK_LIST).apply(links, |a, b, sort| match sort {
        "mitigation_percentage" => a.link.mitigation_percentage.cmp(&b.link.mitigation_percentage),
        _ => a.link.created_at.cmp(&b.link.created_at),
    }))
}

pub fn link_control(
    store: &Store,
    caller: &AuthenticatedUser,
    risk_id: Uuid,
    req: LinkControlRequest,
) -> Result<RiskControlView, ApiError> {
    caller.require(COMPLIANCE_EDITORS)?;
    Validator::new()
        .range(req.mitigation_percentage, "mitigation_percentage", 0, 100)
        .optional_length(req.notes.as_deref(), "notes", 2000)
        .validate()?;

    let link = store.transaction(|tables| {
        load_risk(tables, caller.org_id, risk_id)?;
        if tables.controls().find(caller.org_id, req.control_id)?.is_none() {
            return Err(ApiError::field("control_id", "control does not exist in this organization"));
        }
        let now = Utc::now();
        let reviewed = req.effectiveness != Effectiveness::NotAssessed;
        let link = tables
            .risk_controls()
            .insert(RiskControl {
                id: Uuid::new_v4(),
                org_id: caller.org_id,
                risk_id,
                control_id: req.control_id,
                effectiveness: req.effectiveness,
                mitigation_percentage: req.mitigation_percentage,
                notes: req.notes,
                last_effectiveness_review: reviewed.then_some(now),
                reviewed_by: reviewed.then_some(caller.user_id),
                created_by: caller.user_id,
                created_at: now,
                updated_at: now,
            })
            .map_err(|e| ApiError::conflict_or(e, "This control is already linked to the risk"))?;
        Ok(view(tables, link)?)
    })?;

    AuditEvent::new(caller, "risk_control.linked", "risk", risk_id)
        .with_metadata("control_id", link.link.control_id.to_string())
        .with_metadata("effectiveness", link.link.effectiveness.as_str())
        .record(store);
    Ok(link)
}

/// Changing effectiveness stamps the review time and reviewer.
pub fn update_link(
    store: &Store,
    caller: &AuthenticatedUser,
    link_id: Uuid,
    req: UpdateLinkRequest,
) -> Result<RiskControlView, ApiError> {
    caller.require(COMPLIANCE_EDITORS)?;
    Validator::new()
        .optional_range(req.mitigation_percentage, "mitigation_percentage", 0, 100)
        .optional_length(req.notes.as_deref(), "notes", 2000)
        .validate()?;

    let link = store.transaction(|tables| {
        let mut link = load(tables, caller.org_id, link_id)?;
        let now = Utc::now();
        if let Some(effectiveness) = req.effectiveness {
            link.effectiveness = effectiveness;
            link.last_effectiveness_review = Some(now);
            link.reviewed_by = Some(caller.user_id);
        }
        if let Some(pct) = req.mitigation_percentage {
            link.mitigation_percentage = pct;
        }
        if let Some(notes) = req.notes {
            link.notes = Some(notes);
        }
        link.updated_at = now;
        let link = tables.risk_controls().update(link)?;
        Ok::<_, ApiError>(view(tables, link)?)
    })?;

    AuditEvent::new(caller, "risk_control.updated", "risk", link.link.risk_id)
        .with_metadata("control_id", link.link.control_id.to_string())
        .with_metadata("effectiveness", link.link.effectiveness.as_str())
        .record(store);
    Ok(link)
}

/// Removes the link only; the risk and control are untouched.
pub fn unlink_control(store: &Store, caller: &AuthenticatedUser, link_id: Uuid) -> Result<RiskControl, ApiError> {
    caller.require(COMPLIANCE_EDITORS)?;
    let link = store.transaction(|tables| {
        let link = load(tables, caller.org_id, link_id)?;
        if !tables.risk_controls().remove(link_id)? {
            return Err(ApiError::not_found("Risk control link"));
        }
        Ok(link)
    })?;

    AuditEvent::new(caller, "risk_control.unlinked", "risk", link.risk_id)
        .with_metadata("control_id", link.control_id.to_string())
        .record(store);
    Ok(link)
}
