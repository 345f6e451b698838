use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::macros::string_enum;
use crate::core::severity::Severity;
use crate::store::table::entity;

string_enum! {
    pub enum Likelihood {
        VeryLow => "very_low",
        Low => "low",
        Medium => "medium",
        High => "high",
        VeryHigh => "very_high",
    }
}

impl Likelihood {
    pub fn score(self) -> i32 {
        match self {
            Self::VeryLow => 1,
            Self::Low => 2,
            Self::Medium => 3,
            Self::High => 4,
            Self::VeryHigh => 5,
        }
    }
}

string_enum! {
    pub enum Impact {
        Negligible => "negligible",
        Minor => "minor",
        Moderate => "moderate",
        Major => "major",
        Catastrophic => "catastrophic",
    }
}

impl Impact {
    pub fn score(self) -> i32 {
        match self {
            Self::Negligible => 1,
            Self::Minor => 2,
            Self::Moderate => 3,
            Self::Major => 4,
            Self::Catastrophic => 5,
        }
    }
}

string_enum! {
    pub enum RiskCategory {
        Strategic => "strategic",
        Operational => "operational",
        Financial => "financial",
        Compliance => "compliance",
        Security => "security",
        Reputational => "reputational",
        Technical => "technical",
        Legal => "legal",
    }
}

string_enum! {
    pub enum RiskStatus {
        Identified => "identified",
        Open => "open",
        Treating => "treating",
        Monitoring => "monitoring",
        Accepted => "accepted",
        Closed => "closed",
        Archived => "archived",
    }
}

impl RiskStatus {
    pub fn can_transition_to(self, next: RiskStatus) -> bool {
        use RiskStatus::*;
        matches!(
            (self, next),
            (Identified, Open | Treating | Accepted | Archived)
                | (Open, Treating | Accepted | Closed | Archived)
                | (Treating, Monitoring | Open | Accepted | Archived)
                | (Monitoring, Treating | Closed | Archived)
                | (Accepted, Open | Treating | Archived)
                | (Closed, Open | Archived)
        )
    }
}

string_enum! {
    pub enum AssessmentType {
        Inherent => "inherent",
        Residual => "residual",
    }
}

string_enum! {
    pub enum TreatmentType {
        Mitigate => "mitigate",
        Accept => "accept",
        Transfer => "transfer",
        Avoid => "avoid",
    }
}

string_enum! {
    pub enum TreatmentStatus {
        Planned => "planned",
        InProgress => "in_progress",
        Implemented => "implemented",
        Verified => "verified",
        Ineffective => "ineffective",
        Cancelled => "cancelled",
    }
}

impl TreatmentStatus {
    pub fn can_transition_to(self, next: TreatmentStatus) -> bool {
        use TreatmentStatus::*;
        matches!(
            (self, next),
            (Planned, InProgress | Cancelled)
                | (InProgress, Implemented | Verified | Ineffective | Cancelled)
                | (Implemented, Verified | Ineffective)
                | (Ineffective, InProgress | Cancelled)
        )
    }

    /// Treatments in these states keep a risk in `treating`.
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Planned | Self::InProgress | Self::Implemented)
    }
}

string_enum! {
    pub enum Effectiveness {
        NotAssessed => "not_assessed",
        Ineffective => "ineffective",
        PartiallyEffective => "partially_effective",
        LargelyEffective => "largely_effective",
        FullyEffective => "fully_effective",
    }
}

impl Default for Effectiveness {
    fn default() -> Self {
        Self::NotAssessed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = crate::store::schema::risks, check_for_backend(diesel::pg::Pg), treat_none_as_null = true)]
pub struct Risk {
    pub id: Uuid,
    pub org_id: Uuid,
    pub identifier: String,
    pub title: String,
    pub description: String,
    pub category: RiskCategory,
    pub status: RiskStatus,
    pub owner_id: Option<Uuid>,
    pub secondary_owner_id: Option<Uuid>,
    pub inherent_likelihood: Option<Likelihood>,
    pub inherent_impact: Option<Impact>,
    pub inherent_score: Option<i32>,
    pub residual_likelihood: Option<Likelihood>,
    pub residual_impact: Option<Impact>,
    pub residual_score: Option<i32>,
    pub appetite_threshold: Option<i32>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub accepted_by: Option<Uuid>,
    pub acceptance_justification: Option<String>,
    pub acceptance_expiry: Option<NaiveDate>,
    pub assessment_frequency_days: Option<i32>,
    pub next_assessment_at: Option<NaiveDate>,
    pub last_assessed_at: Option<NaiveDate>,
    pub source: Option<String>,
    pub affected_assets: Vec<String>,
    pub tags: Vec<String>,
    pub is_template: bool,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

entity!(Risk => risks, tenant);

impl Risk {
    pub fn new(org_id: Uuid, identifier: String, title: String, category: RiskCategory, created_by: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            org_id,
            identifier,
            title,
            description: String::new(),
            category,
            status: RiskStatus::Identified,
            owner_id: None,
            secondary_owner_id: None,
            inherent_likelihood: None,
            inherent_impact: None,
            inherent_score: None,
            residual_likelihood: None,
            residual_impact: None,
            residual_score: None,
            appetite_threshold: None,
            accepted_at: None,
            accepted_by: None,
            acceptance_justification: None,
            acceptance_expiry: None,
            assessment_frequency_days: None,
            next_assessment_at: None,
            last_assessed_at: None,
            source: None,
            affected_assets: Vec::new(),
            tags: Vec::new(),
            is_template: false,
            created_by,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn clear_acceptance(&mut self) {
        self.accepted_at = None;
        self.accepted_by = None;
        self.acceptance_justification = None;
        self.acceptance_expiry = None;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = crate::store::schema::risk_assessments, check_for_backend(diesel::pg::Pg), treat_none_as_null = true)]
pub struct RiskAssessment {
    pub id: Uuid,
    pub org_id: Uuid,
    pub risk_id: Uuid,
    pub assessment_type: AssessmentType,
    pub likelihood: Likelihood,
    pub impact: Impact,
    pub score: i32,
    pub severity: Severity,
    pub is_current: bool,
    pub supersedes_id: Option<Uuid>,
    pub superseded_by_id: Option<Uuid>,
    pub assessed_on: NaiveDate,
    pub justification: String,
    pub assumptions: Option<String>,
    pub data_sources: Vec<String>,
    pub assessor_id: Uuid,
    pub created_at: DateTime<Utc>,
}

entity!(RiskAssessment => risk_assessments, tenant, { of_risk => risk_id });

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = crate::store::schema::risk_treatments, check_for_backend(diesel::pg::Pg), treat_none_as_null = true)]
pub struct RiskTreatment {
    pub id: Uuid,
    pub org_id: Uuid,
    pub risk_id: Uuid,
    pub treatment_type: TreatmentType,
    pub title: String,
    pub description: String,
    pub status: TreatmentStatus,
    pub owner_id: Option<Uuid>,
    pub target_control_id: Option<Uuid>,
    pub due_date: Option<NaiveDate>,
    pub expected_residual_likelihood: Option<Likelihood>,
    pub expected_residual_impact: Option<Impact>,
    pub expected_residual_score: Option<i32>,
    pub effectiveness: Option<Effectiveness>,
    pub completion_notes: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

entity!(RiskTreatment => risk_treatments, tenant, { of_risk => risk_id });

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = crate::store::schema::risk_controls, check_for_backend(diesel::pg::Pg), treat_none_as_null = true)]
pub struct RiskControl {
    pub id: Uuid,
    pub org_id: Uuid,
    pub risk_id: Uuid,
    pub control_id: Uuid,
    pub effectiveness: Effectiveness,
    pub mitigation_percentage: i32,
    pub notes: Option<String>,
    pub last_effectiveness_review: Option<DateTime<Utc>>,
    pub reviewed_by: Option<Uuid>,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

entity!(RiskControl => risk_controls, tenant, { of_risk => risk_id, of_control => control_id });

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;
    use crate::tests::test_util::Tenant;

    #[test]
    fn test_risk_graph() {
        use RiskStatus::*;
        assert!(Identified.can_transition_to(Treating));
        assert!(Treating.can_transition_to(Monitoring));
        assert!(Closed.can_transition_to(Open));
        assert!(!Identified.can_transition_to(Closed));
        assert!(!Monitoring.can_transition_to(Accepted));
        for next in RiskStatus::ALL {
            assert!(!Archived.can_transition_to(*next));
        }
    }

    #[test]
    fn test_treatment_graph() {
        use TreatmentStatus::*;
        assert!(Planned.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Verified));
        assert!(Ineffective.can_transition_to(InProgress));
        assert!(!Planned.can_transition_to(Implemented));
        assert!(!Implemented.can_transition_to(Cancelled));
        for next in TreatmentStatus::ALL {
            assert!(!Verified.can_transition_to(*next));
            assert!(!Cancelled.can_transition_to(*next));
        }
    }

    #[test]
    fn test_scales() {
        assert_eq!(Likelihood::VeryLow.score(), 1);
        assert_eq!(Likelihood::VeryHigh.score(), 5);
        assert_eq!(Impact::Major.score(), 4);
        assert_eq!("catastrophic".parse::<Impact>(), Ok(Impact::Catastrophic));
    }

    #[test]
    fn test_one_current_assessment_per_type() {
        let t = Tenant::new();
        let assessment = |risk_id: Uuid, is_current: bool| RiskAssessment {
            id: Uuid::new_v4(),
            org_id: t.org_id,
            risk_id,
            assessment_type: AssessmentType::Residual,
            likelihood: Likelihood::Low,
            impact: Impact::Minor,
            score: 4,
            severity: Severity::Low,
            is_current,
            supersedes_id: None,
            superseded_by_id: None,
            assessed_on: Utc::now().date_naive(),
            justification: "baseline".into(),
            assumptions: None,
            data_sources: vec!["cmdb".into()],
            assessor_id: Uuid::new_v4(),
            created_at: Utc::now(),
        };
        let err = t
            .store
            .transaction(|tables| {
                let risk = tables
                    .risks()
                    .insert(Risk::new(t.org_id, "RISK-1".into(), "Outage".into(), RiskCategory::Operational, Uuid::new_v4()))?;
                tables.risk_assessments().insert(assessment(risk.id, false))?;
                tables.risk_assessments().insert(assessment(risk.id, true))?;
                let stored = tables.risk_assessments().of_risk(risk.id)?;
                assert_eq!(stored.len(), 2);
                assert_eq!(stored[0].data_sources, vec!["cmdb".to_string()]);
                tables.risk_assessments().insert(assessment(risk.id, true))
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation { ref constraint } if constraint == "risk_assessments_one_current"));
    }
}
