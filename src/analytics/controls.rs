//! Control health and framework posture, derived from the latest test results.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::alerts::AlertStatus;
use crate::compliance::frameworks::{compute_coverage, view, CoverageStats, OrgFrameworkView};
use crate::compliance::types::{Control, ControlStatus, OrgFrameworkStatus};
use crate::core::error::ApiError;
use crate::core::macros::string_enum;
use crate::security::auth::AuthenticatedUser;
use crate::store::{Store, StoreError, Tables};
use crate::test_engine::types::{ResultStatus, TestResult};

string_enum! {
    /// Declared worst first; reports sort in this order.
    pub enum HealthState {
        Failing => "failing",
        Error => "error",
        Warning => "warning",
        Untested => "untested",
        Healthy => "healthy",
    }
}

impl HealthState {
    fn from_result(status: Option<ResultStatus>) -> Self {
        match status {
            Some(ResultStatus::Pass) => Self::Healthy,
            Some(ResultStatus::Fail) => Self::Failing,
            Some(ResultStatus::Error) => Self::Error,
            Some(ResultStatus::Warning) => Self::Warning,
            Some(ResultStatus::Skipped) | None => Self::Untested,
        }
    }

    fn rank(self) -> usize {
        Self::ALL.iter().position(|s| *s == self).unwrap_or(Self::ALL.len())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ControlHealth {
    pub control_id: Uuid,
    pub identifier: String,
    pub title: String,
    pub status: ControlStatus,
    pub health: HealthState,
    pub last_result_status: Option<ResultStatus>,
    pub last_tested_at: Option<DateTime<Utc>>,
    pub test_count: usize,
    pub open_alerts: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub failing: usize,
    pub error: usize,
    pub warning: usize,
    pub untested: usize,
}

impl HealthSummary {
    fn add(&mut self, health: HealthState) {
        self.total += 1;
        match health {
            HealthState::Healthy => self.healthy += 1,
            HealthState::Failing => self.failing += 1,
            HealthState::Error => self.error += 1,
            HealthState::Warning => self.warning += 1,
            HealthState::Untested => self.untested += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ControlHealthReport {
    pub summary: HealthSummary,
    pub controls: Vec<ControlHealth>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FrameworkPosture {
    pub org_framework_id: Uuid,
    pub framework_version_id: Uuid,
    pub framework_code: String,
    pub framework_name: String,
    pub version: String,
    pub mapped_controls: usize,
    pub passing_controls: usize,
    pub posture_pct: f64,
    pub coverage: CoverageStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct PostureReport {
    pub overall_pct: f64,
    pub frameworks: Vec<FrameworkPosture>,
}

string_enum! {
    pub enum RequirementGapType {
        Unmapped => "unmapped",
        ControlsFailing => "controls_failing",
        ControlsUntested => "controls_untested",
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RequirementGap {
    pub framework_code: String,
    pub version: String,
    pub requirement_id: Uuid,
    pub reference: String,
    pub title: String,
    pub gap_type: RequirementGapType,
    pub control_ids: Vec<Uuid>,
    pub recommendation: String,
}

/// Latest non-skipped result per control.
fn latest_results(tables: &mut Tables, org_id: Uuid) -> Result<HashMap<Uuid, TestResult>, StoreError> {
    let mut latest: HashMap<Uuid, TestResult> = HashMap::new();
    for result in tables.test_results().scan(org_id)? {
        if result.status == ResultStatus::Skipped {
            continue;
        }
        match latest.get(&result.control_id) {
            Some(current) if current.created_at >= result.created_at => {}
            _ => {
                latest.insert(result.control_id, result);
            }
        }
    }
    Ok(latest)
}

fn tracked_controls(tables: &mut Tables, org_id: Uuid) -> Result<Vec<Control>, StoreError> {
    Ok(tables
        .controls()
        .scan(org_id)?
        .into_iter()
        .filter(|c| c.status != ControlStatus::Deprecated)
        .collect())
}

fn health_by_control(tables: &mut Tables, org_id: Uuid) -> Result<HashMap<Uuid, HealthState>, StoreError> {
    let latest = latest_results(tables, org_id)?;
    Ok(tracked_controls(tables, org_id)?
        .into_iter()
        .map(|c| (c.id, HealthState::from_result(latest.get(&c.id).map(|r| r.status))))
        .collect())
}

fn active_frameworks(tables: &mut Tables, org_id: Uuid) -> Result<Vec<OrgFrameworkView>, StoreError> {
    let mut views = Vec::new();
    for framework in tables.org_frameworks().scan(org_id)? {
        if framework.status != OrgFrameworkStatus::Active {
            continue;
        }
        if let Some(v) = view(tables, framework)? {
            views.push(v);
        }
    }
    Ok(views)
}

fn percentage(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        (part as f64 / whole as f64 * 10000.0).round() / 100.0
    }
}

pub fn build_control_health(tables: &mut Tables, org_id: Uuid) -> Result<ControlHealthReport, StoreError> {
    let latest = latest_results(tables, org_id)?;
    let mut test_counts: HashMap<Uuid, usize> = HashMap::new();
    for test in tables.tests().scan(org_id)? {
        *test_counts.entry(test.control_id).or_default() += 1;
    }
    let mut open_alerts: HashMap<Uuid, usize> = HashMap::new();
    for alert in tables.alerts().scan(org_id)? {
        if alert.status.is_settled() || alert.status == AlertStatus::Suppressed {
            continue;
        }
        if let Some(control_id) = alert.control_id {
            *open_alerts.entry(control_id).or_default() += 1;
        }
    }

    let mut summary = HealthSummary::default();
    let mut controls: Vec<ControlHealth> = tracked_controls(tables, org_id)?
        .into_iter()
        .map(|c| {
            let last = latest.get(&c.id);
            let health = HealthState::from_result(last.map(|r| r.status));
            summary.add(health);
            ControlHealth {
                control_id: c.id,
                identifier: c.identifier,
                title: c.title,
                status: c.status,
                health,
                last_result_status: last.map(|r| r.status),
                last_tested_at: last.map(|r| r.completed_at.unwrap_or(r.created_at)),
                test_count: test_counts.get(&c.id).copied().unwrap_or(0),
                open_alerts: open_alerts.get(&c.id).copied().unwrap_or(0),
            }
        })
        .collect();
    controls.sort_by(|a, b| {
        a.health
            .rank()
            .cmp(&b.health.rank())
            .then_with(|| a.identifier.cmp(&b.identifier))
    });

    Ok(ControlHealthReport { summary, controls })
}

/// Distinct non-deprecated controls mapped into one framework version.
fn mapped_controls(
    tables: &mut Tables,
    org_id: Uuid,
    version_id: Uuid,
    health: &HashMap<Uuid, HealthState>,
) -> Result<HashSet<Uuid>, StoreError> {
    let in_version: HashSet<Uuid> = tables
        .requirements()
        .in_version(version_id)?
        .into_iter()
        .map(|r| r.id)
        .collect();
    Ok(tables
        .control_mappings()
        .scan(org_id)?
        .into_iter()
        .filter(|m| in_version.contains(&m.requirement_id))
        .map(|m| m.control_id)
        .filter(|id| health.contains_key(id))
        .collect())
}

pub fn build_posture(tables: &mut Tables, org_id: Uuid) -> Result<PostureReport, StoreError> {
    let health = health_by_control(tables, org_id)?;
    let passing = |id: &Uuid| health.get(id) == Some(&HealthState::Healthy);

    let mut all_mapped = HashSet::new();
    let mut frameworks = Vec::new();
    for v in active_frameworks(tables, org_id)? {
        let version_id = v.org_framework.framework_version_id;
        let mapped = mapped_controls(tables, org_id, version_id, &health)?;
        let passing_controls = mapped.iter().filter(|id| passing(id)).count();
        frameworks.push(FrameworkPosture {
            org_framework_id: v.org_framework.id,
            framework_version_id: version_id,
            framework_code: v.framework_code,
            framework_name: v.framework_name,
            version: v.version,
            mapped_controls: mapped.len(),
            passing_controls,
            posture_pct: percentage(passing_controls, mapped.len()),
            coverage: compute_coverage(tables, org_id, version_id)?,
        });
        all_mapped.extend(mapped);
    }
    frameworks.sort_by(|a, b| a.framework_name.cmp(&b.framework_name).then(a.version.cmp(&b.version)));

    let overall_passing = all_mapped.iter().filter(|id| passing(id)).count();
    Ok(PostureReport {
        overall_pct: percentage(overall_passing, all_mapped.len()),
        frameworks,
    })
}

pub fn build_requirement_gaps(tables: &mut Tables, org_id: Uuid) -> Result<Vec<RequirementGap>, StoreError> {
    let health = health_by_control(tables, org_id)?;
    let excluded: HashSet<Uuid> = tables
        .requirement_scopes()
        .scan(org_id)?
        .into_iter()
        .filter(|s| !s.in_scope)
        .map(|s| s.requirement_id)
        .collect();
    let mut controls_by_requirement: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for mapping in tables.control_mappings().scan(org_id)? {
        if health.contains_key(&mapping.control_id) {
            controls_by_requirement
                .entry(mapping.requirement_id)
                .or_default()
                .push(mapping.control_id);
        }
    }

    let mut gaps = Vec::new();
    for framework in active_frameworks(tables, org_id)? {
        let mut requirements: Vec<_> = tables
            .requirements()
            .in_version(framework.org_framework.framework_version_id)?
            .into_iter()
            .filter(|r| r.is_assessable && !excluded.contains(&r.id))
            .collect();
        requirements.sort_by_key(|r| (r.depth, r.section_order));

        for requirement in requirements {
            let control_ids = controls_by_requirement.get(&requirement.id).cloned().unwrap_or_default();
            let states: Vec<HealthState> = control_ids.iter().filter_map(|id| health.get(id).copied()).collect();
            let (gap_type, recommendation) = if control_ids.is_empty() {
                (
                    RequirementGapType::Unmapped,
                    format!("Map at least one control to {} or mark it out of scope", requirement.reference),
                )
            } else if states.iter().all(|s| matches!(s, HealthState::Failing | HealthState::Error)) {
                (
                    RequirementGapType::ControlsFailing,
                    format!("Every control mapped to {} is failing its tests; remediate before the next audit", requirement.reference),
                )
            } else if states.iter().all(|s| *s == HealthState::Untested) {
                (
                    RequirementGapType::ControlsUntested,
                    format!("Controls mapped to {} have no test results; add automated tests", requirement.reference),
                )
            } else {
                continue;
            };
            gaps.push(RequirementGap {
                framework_code: framework.framework_code.clone(),
                version: framework.version.clone(),
                requirement_id: requirement.id,
                reference: requirement.reference,
                title: requirement.title,
                gap_type,
                control_ids,
                recommendation,
            });
        }
    }
    Ok(gaps)
}

pub fn control_health(store: &Store, caller: &AuthenticatedUser) -> Result<ControlHealthReport, ApiError> {
    Ok(store.read(|tables| build_control_health(tables, caller.org_id))?)
}

pub fn compliance_posture(store: &Store, caller: &AuthenticatedUser) -> Result<PostureReport, ApiError> {
    Ok(store.read(|tables| build_posture(tables, caller.org_id))?)
}

pub fn requirement_gaps(store: &Store, caller: &AuthenticatedUser) -> Result<Vec<RequirementGap>, ApiError> {
    Ok(store.read(|tables| build_requirement_gaps(tables, caller.org_id))?)
}
