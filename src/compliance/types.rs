use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::core::macros::string_enum;
use crate::core::metadata::empty_map;
use crate::store::table::entity;

string_enum! {
    pub enum ControlStatus {
        Draft => "draft",
        Active => "active",
        UnderReview => "under_review",
        Deprecated => "deprecated",
    }
}

impl ControlStatus {
    pub fn can_transition_to(self, next: ControlStatus) -> bool {
        use ControlStatus::*;
        matches!(
            (self, next),
            (Draft, Active)
                | (Draft, Deprecated)
                | (Active, UnderReview)
                | (Active, Deprecated)
                | (UnderReview, Active)
                | (UnderReview, Deprecated)
                | (Deprecated, Draft)
        )
    }
}

string_enum! {
    pub enum ControlCategory {
        Technical => "technical",
        Administrative => "administrative",
        Physical => "physical",
        Operational => "operational",
    }
}

string_enum! {
    pub enum MappingStrength {
        Primary => "primary",
        Supporting => "supporting",
        Compensating => "compensating",
    }
}

impl Default for MappingStrength {
    fn default() -> Self {
        Self::Primary
    }
}

string_enum! {
    pub enum OrgFrameworkStatus {
        Active => "active",
        Inactive => "inactive",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = crate::store::schema::frameworks, check_for_backend(diesel::pg::Pg), treat_none_as_null = true)]
pub struct Framework {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub description: String,
    pub publisher: String,
    pub created_at: DateTime<Utc>,
}

entity!(Framework => frameworks);

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = crate::store::schema::framework_versions, check_for_backend(diesel::pg::Pg), treat_none_as_null = true)]
pub struct FrameworkVersion {
    pub id: Uuid,
    pub framework_id: Uuid,
    pub version: String,
    pub effective_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
}

entity!(FrameworkVersion => framework_versions, { of_framework => framework_id });

/// One node of a version's requirement tree. Only assessable requirements
/// can be mapped or scoped.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = crate::store::schema::requirements, check_for_backend(diesel::pg::Pg), treat_none_as_null = true)]
pub struct Requirement {
    pub id: Uuid,
    pub framework_version_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub reference: String,
    pub title: String,
    pub description: String,
    pub depth: i32,
    pub section_order: i32,
    pub is_assessable: bool,
}

entity!(Requirement => requirements, { in_version => framework_version_id });

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = crate::store::schema::org_frameworks, check_for_backend(diesel::pg::Pg), treat_none_as_null = true)]
pub struct OrgFramework {
    pub id: Uuid,
    pub org_id: Uuid,
    pub framework_version_id: Uuid,
    pub status: OrgFrameworkStatus,
    pub activated_by: Option<Uuid>,
    pub activated_at: DateTime<Utc>,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

entity!(OrgFramework => org_frameworks, tenant);

/// Tenant override of a requirement's scope. No row means in scope.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = crate::store::schema::requirement_scopes, check_for_backend(diesel::pg::Pg), treat_none_as_null = true)]
pub struct RequirementScope {
    pub id: Uuid,
    pub org_id: Uuid,
    pub requirement_id: Uuid,
    pub in_scope: bool,
    pub justification: Option<String>,
    pub set_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

entity!(RequirementScope => requirement_scopes, tenant);

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = crate::store::schema::controls, check_for_backend(diesel::pg::Pg), treat_none_as_null = true)]
pub struct Control {
    pub id: Uuid,
    pub org_id: Uuid,
    pub identifier: String,
    pub title: String,
    pub description: String,
    pub category: ControlCategory,
    pub status: ControlStatus,
    pub owner_id: Option<Uuid>,
    pub secondary_owner_id: Option<Uuid>,
    pub is_custom: bool,
    pub metadata: Value,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

entity!(Control => controls, tenant);

impl Control {
    pub fn new(org_id: Uuid, identifier: String, title: String, category: ControlCategory, created_by: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            org_id,
            identifier,
            title,
            description: String::new(),
            category,
            status: ControlStatus::Draft,
            owner_id: None,
            secondary_owner_id: None,
            is_custom: true,
            metadata: empty_map(),
            created_by,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = crate::store::schema::control_mappings, check_for_backend(diesel::pg::Pg), treat_none_as_null = true)]
pub struct ControlMapping {
    pub id: Uuid,
    pub org_id: Uuid,
    pub control_id: Uuid,
    pub requirement_id: Uuid,
    pub strength: MappingStrength,
    pub notes: Option<String>,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

entity!(ControlMapping => control_mappings, tenant);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_transitions() {
        use ControlStatus::*;
        assert!(Draft.can_transition_to(Active));
        assert!(Active.can_transition_to(UnderReview));
        assert!(UnderReview.can_transition_to(Active));
        assert!(Deprecated.can_transition_to(Draft));

        assert!(!Draft.can_transition_to(UnderReview));
        assert!(!Deprecated.can_transition_to(Active));
        assert!(!Active.can_transition_to(Draft));
        assert!(!Active.can_transition_to(Active));
    }

    #[test]
    fn test_wire_spellings() {
        assert_eq!(ControlStatus::UnderReview.as_str(), "under_review");
        assert_eq!("compensating".parse::<MappingStrength>(), Ok(MappingStrength::Compensating));
        assert_eq!(MappingStrength::default(), MappingStrength::Primary);
    }
}
