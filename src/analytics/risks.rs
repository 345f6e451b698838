//! Risk heat-map and the gap list for the risk register.

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use uuid::Uuid;

use crate::core::error::ApiError;
use crate::core::extract::parse_filter;
use crate::core::macros::string_enum;
use crate::core::severity::Severity;
use crate::risk::scoring::{score, severity_for};
use crate::risk::types::{Impact, Likelihood, Risk, RiskStatus, TreatmentStatus};
use crate::security::auth::AuthenticatedUser;
use crate::store::{Store, StoreError, Tables};

string_enum! {
    pub enum HeatmapBasis {
        Inherent => "inherent",
        Residual => "residual",
    }
}

string_enum! {
    pub enum RiskGapType {
        MissingTreatment => "missing_treatment",
        MissingControls => "missing_controls",
        OverdueAssessment => "overdue_assessment",
        ExpiredAcceptance => "expired_acceptance",
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct HeatmapQuery {
    pub basis: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HeatmapCell {
    pub likelihood: Likelihood,
    pub impact: Impact,
    pub score: i32,
    pub severity: Severity,
    pub count: usize,
    pub risk_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskHeatmap {
    pub basis: HeatmapBasis,
    pub cells: Vec<HeatmapCell>,
    pub scored: usize,
    pub unscored: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskGap {
    pub risk_id: Uuid,
    pub identifier: String,
    pub title: String,
    pub status: RiskStatus,
    pub severity: Option<Severity>,
    pub gap_type: RiskGapType,
    pub recommendation: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskGapReport {
    pub total: usize,
    pub risks_affected: usize,
    pub gaps: Vec<RiskGap>,
}

/// Register entries that still need attention: no templates, nothing closed or archived.
fn live_risks(tables: &mut Tables, org_id: Uuid) -> Result<Vec<Risk>, StoreError> {
    Ok(tables
        .risks()
        .scan(org_id)?
        .into_iter()
        .filter(|r| !r.is_template && !matches!(r.status, RiskStatus::Closed | RiskStatus::Archived))
        .collect())
}

pub fn build_heatmap(tables: &mut Tables, org_id: Uuid, basis: HeatmapBasis) -> Result<RiskHeatmap, StoreError> {
    let mut cells: Vec<HeatmapCell> = Likelihood::ALL
        .iter()
        .flat_map(|l| Impact::ALL.iter().map(move |i| (*l, *i)))
        .map(|(likelihood, impact)| {
            let score = score(likelihood, impact);
            HeatmapCell {
                likelihood,
                impact,
                score,
                severity: severity_for(score),
                count: 0,
                risk_ids: Vec::new(),
            }
        })
        .collect();

    let mut unscored = 0;
    for risk in live_risks(tables, org_id)? {
        let pair = match basis {
            HeatmapBasis::Inherent => risk.inherent_likelihood.zip(risk.inherent_impact),
            HeatmapBasis::Residual => risk.residual_likelihood.zip(risk.residual_impact),
        };
        let Some((likelihood, impact)) = pair else {
            unscored += 1;
            continue;
        };
        if let Some(cell) = cells.iter_mut().find(|c| c.likelihood == likelihood && c.impact == impact) {
            cell.count += 1;
            cell.risk_ids.push(risk.id);
        }
    }

    let scored = cells.iter().map(|c| c.count).sum();
    Ok(RiskHeatmap {
        basis,
        cells,
        scored,
        unscored,
    })
}

fn gap(risk: &Risk, gap_type: RiskGapType, recommendation: String) -> RiskGap {
    RiskGap {
        risk_id: risk.id,
        identifier: risk.identifier.clone(),
        title: risk.title.clone(),
        status: risk.status,
        severity: risk.residual_score.or(risk.inherent_score).map(severity_for),
        gap_type,
        recommendation,
    }
}

pub fn build_risk_gaps(tables: &mut Tables, org_id: Uuid, today: NaiveDate) -> Result<RiskGapReport, StoreError> {
    let treated: HashSet<Uuid> = tables
        .risk_treatments()
        .scan(org_id)?
        .into_iter()
        .filter(|t| !matches!(t.status, TreatmentStatus::Cancelled | TreatmentStatus::Ineffective))
        .map(|t| t.risk_id)
        .collect();
    let controlled: HashSet<Uuid> = tables
        .risk_controls()
        .scan(org_id)?
        .into_iter()
        .map(|l| l.risk_id)
        .collect();

    let mut gaps = Vec::new();
    for risk in live_risks(tables, org_id)? {
        let risk = &risk;
        let accepted = risk.status == RiskStatus::Accepted;
        if !accepted && !treated.contains(&risk.id) {
            gaps.push(gap(
                risk,
                RiskGapType::MissingTreatment,
                "Plan a treatment or formally accept the risk".into(),
            ));
        }
        if !controlled.contains(&risk.id) {
            gaps.push(gap(
                risk,
                RiskGapType::MissingControls,
                "Link the controls that mitigate this risk so their test results inform it".into(),
            ));
        }
        if let Some(due) = risk.next_assessment_at.filter(|due| *due < today) {
            gaps.push(gap(
                risk,
                RiskGapType::OverdueAssessment,
                format!("Assessment was due on {due}; reassess likelihood and impact"),
            ));
        }
        if let Some(expiry) = risk.acceptance_expiry.filter(|expiry| accepted && *expiry < today) {
            gaps.push(gap(
                risk,
                RiskGapType::ExpiredAcceptance,
                format!("Acceptance expired on {expiry}; renew the acceptance or start treatment"),
            ));
        }
    }

    gaps.sort_by(|a, b| compare_gaps(a, b));
    let risks_affected = gaps.iter().map(|g| g.risk_id).collect::<HashSet<_>>().len();
    Ok(RiskGapReport {
        total: gaps.len(),
        risks_affected,
        gaps,
    })
}

/// Worst severity first, unscored risks last.
fn compare_gaps(a: &RiskGap, b: &RiskGap) -> Ordering {
    let rank = |g: &RiskGap| g.severity.map_or(0, Severity::rank);
    rank(b)
        .cmp(&rank(a))
        .then_with(|| a.identifier.cmp(&b.identifier))
        .then_with(|| a.gap_type.as_str().cmp(b.gap_type.as_str()))
}

pub fn risk_heatmap(store: &Store, caller: &AuthenticatedUser, query: &HeatmapQuery) -> Result<RiskHeatmap, ApiError> {
    let basis = parse_filter(&query.basis, "basis")?.unwrap_or(HeatmapBasis::Inherent);
    Ok(store.read(|tables| build_heatmap(tables, caller.org_id, basis))?)
}

pub fn risk_gaps(store: &Store, caller: &AuthenticatedUser) -> Result<RiskGapReport, ApiError> {
    let today = Utc::now().date_naive();
    Ok(store.read(|tables| build_risk_gaps(tables, caller.org_id, today))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compliance::types::{Control, ControlCategory};
    use crate::risk::types::{Effectiveness, RiskCategory, RiskControl, RiskTreatment, TreatmentType};
    use crate::security::auth::Role;
    use crate::tests::test_util::Tenant;
    use crate::{assert_err, assert_ok};

    fn risk(tenant: &Tenant, identifier: &str, edit: impl FnOnce(&mut Risk)) -> Risk {
        let mut risk = Risk::new(tenant.org_id, identifier.into(), format!("Risk {identifier}"), RiskCategory::Security, Uuid::new_v4());
        edit(&mut risk);
        assert_ok!(tenant.store.transaction(|t| t.risks().insert(risk)))
    }

    fn treat_and_link(tenant: &Tenant, risk: &Risk) {
        let now = Utc::now();
        assert_ok!(tenant.store.transaction(|t| {
            let control = t.controls().insert(Control::new(
                tenant.org_id,
                format!("CTRL-{}", risk.identifier),
                "MFA enforced".into(),
                ControlCategory::Technical,
                risk.created_by,
            ))?;
            t.risk_treatments().insert(RiskTreatment {
                id: Uuid::new_v4(),
                org_id: tenant.org_id,
                risk_id: risk.id,
                treatment_type: TreatmentType::Mitigate,
                title: "Enforce MFA".into(),
                description: String::new(),
                status: TreatmentStatus::InProgress,
                owner_id: None,
                target_control_id: None,
                due_date: None,
                expected_residual_likelihood: None,
                expected_residual_impact: None,
                expected_residual_score: None,
                effectiveness: None,
                completion_notes: None,
                completed_at: None,
                created_by: risk.created_by,
                created_at: now,
                updated_at: now,
            })?;
            t.risk_controls().insert(RiskControl {
                id: Uuid::new_v4(),
                org_id: tenant.org_id,
                risk_id: risk.id,
                control_id: control.id,
                effectiveness: Effectiveness::NotAssessed,
                mitigation_percentage: 50,
                notes: None,
                last_effectiveness_review: None,
                reviewed_by: None,
                created_by: risk.created_by,
                created_at: now,
                updated_at: now,
            })?;
            Ok::<_, StoreError>(())
        }));
    }

    #[test]
    fn test_heatmap_places_risks_by_basis() {
        let tenant = Tenant::new();
        risk(&tenant, "RSK-001", |r| {
            r.inherent_likelihood = Some(Likelihood::High);
            r.inherent_impact = Some(Impact::Major);
            r.residual_likelihood = Some(Likelihood::Low);
            r.residual_impact = Some(Impact::Moderate);
        });
        risk(&tenant, "RSK-002", |r| {
            r.inherent_likelihood = Some(Likelihood::High);
            r.inherent_impact = Some(Impact::Major);
        });
        risk(&tenant, "RSK-003", |r| {
            r.inherent_likelihood = Some(Likelihood::VeryHigh);
            r.inherent_impact = Some(Impact::Catastrophic);
            r.status = RiskStatus::Archived;
        });

        let inherent = assert_ok!(tenant.store.read(|t| build_heatmap(t, tenant.org_id, HeatmapBasis::Inherent)));
        assert_eq!(inherent.cells.len(), 25);
        let cell = |map: &RiskHeatmap, l: Likelihood, i: Impact| {
            map.cells
                .iter()
                .find(|c| c.likelihood == l && c.impact == i)
                .map(|c| (c.count, c.score, c.severity))
        };
        assert_eq!(cell(&inherent, Likelihood::High, Impact::Major), Some((2, 16, Severity::High)));
        assert_eq!(cell(&inherent, Likelihood::VeryHigh, Impact::Catastrophic), Some((0, 25, Severity::Critical)));
        assert_eq!((inherent.scored, inherent.unscored), (2, 0));

        let residual = assert_ok!(tenant.store.read(|t| build_heatmap(t, tenant.org_id, HeatmapBasis::Residual)));
        assert_eq!(cell(&residual, Likelihood::Low, Impact::Moderate), Some((1, 6, Severity::Medium)));
        assert_eq!((residual.scored, residual.unscored), (1, 1));
    }

    #[test]
    fn test_unknown_basis_is_rejected() {
        let tenant = Tenant::new();
        let viewer = tenant.caller(Role::Viewer);
        let err = assert_err!(risk_heatmap(
            &tenant.store,
            &viewer,
            &HeatmapQuery {
                basis: Some("target".into())
            }
        ));
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_gaps_cover_each_kind() {
        let tenant = Tenant::new();
        let today = Utc::now().date_naive();
        let yesterday = today.pred_opt().unwrap_or(today);

        let covered = risk(&tenant, "RSK-010", |r| r.status = RiskStatus::Treating);
        treat_and_link(&tenant, &covered);
        let bare = risk(&tenant, "RSK-011", |r| {
            r.inherent_score = Some(20);
            r.next_assessment_at = Some(yesterday);
        });
        let accepted = risk(&tenant, "RSK-012", |r| {
            r.status = RiskStatus::Accepted;
            r.acceptance_expiry = Some(yesterday);
        });
        treat_and_link(&tenant, &accepted);

        let report = assert_ok!(tenant.store.read(|t| build_risk_gaps(t, tenant.org_id, today)));
        assert!(report.gaps.iter().all(|g| g.risk_id != covered.id));
        let kinds: Vec<_> = report
            .gaps
            .iter()
            .map(|g| (g.identifier.as_str(), g.gap_type))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("RSK-011", RiskGapType::MissingControls),
                ("RSK-011", RiskGapType::MissingTreatment),
                ("RSK-011", RiskGapType::OverdueAssessment),
                ("RSK-012", RiskGapType::ExpiredAcceptance),
            ]
        );
        assert_eq!(report.gaps[0].severity, Some(Severity::Critical));
        assert_eq!(report.risks_affected, 2);
        assert_eq!(bare.status, RiskStatus::Identified);
    }
}
