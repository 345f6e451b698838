//! Shared framework catalog: built-in seed data and read-only views.

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::info;
use uuid::Uuid;

use super::types::{Framework, FrameworkVersion, Requirement};
use crate::core::error::ApiError;
use crate::core::pagination::{ListSpec, Page, PageParams, SortOrder};
use crate::store::{Store, StoreError, Tables};

pub struct SectionSeed {
    pub reference: &'static str,
    pub title: &'static str,
    /// Assessable children. A section without children is itself assessable.
    pub children: &'static [(&'static str, &'static str)],
}

pub struct FrameworkSeed {
    pub code: &'static str,
    pub name: &'static str,
    pub publisher: &'static str,
    pub description: &'static str,
    pub version: &'static str,
    pub effective: (i32, u32, u32),
    pub sections: &'static [SectionSeed],
}

pub const SOC2_2017: FrameworkSeed = FrameworkSeed {
    code: "soc2",
    name: "SOC 2",
    publisher: "AICPA",
    description: "Trust Services Criteria for security, availability, processing integrity, confidentiality and privacy",
    version: "2017",
    effective: (2017, 12, 15),
    sections: &[
        SectionSeed {
            reference: "CC1",
            title: "Control Environment",
            children: &[
                ("CC1.1", "The entity demonstrates a commitment to integrity and ethical values"),
                ("CC1.2", "The board of directors demonstrates independence from management"),
                ("CC1.3", "Management establishes structures, reporting lines and authorities"),
                ("CC1.4", "The entity demonstrates a commitment to attract and retain competent individuals"),
            ],
        },
        SectionSeed {
            reference: "CC2",
            title: "Communication and Information",
            children: &[
                ("CC2.1", "The entity obtains or generates relevant, quality information"),
                ("CC2.2", "The entity internally communicates information necessary to support internal control"),
            ],
        },
        SectionSeed {
            reference: "CC3",
            title: "Risk Assessment",
            children: &[
                ("CC3.1", "The entity specifies objectives with sufficient clarity to identify risks"),
                ("CC3.2", "The entity identifies and analyzes risks to the achievement of its objectives"),
                ("CC3.4", "The entity identifies and assesses changes that could impact internal control"),
            ],
        },
        SectionSeed {
            reference: "CC6",
            title: "Logical and Physical Access Controls",
            children: &[
                ("CC6.1", "Logical access security software, infrastructure and architectures are implemented"),
                ("CC6.2", "New internal and external users are registered and authorized before access is issued"),
                ("CC6.3", "Access to data, software and functions is authorized, modified or removed based on roles"),
                ("CC6.6", "Logical access security measures protect against threats from outside system boundaries"),
                ("CC6.7", "Transmission, movement and removal of information is restricted to authorized parties"),
                ("CC6.8", "Controls prevent or detect the introduction of unauthorized or malicious software"),
            ],
        },
        SectionSeed {
            reference: "CC7",
            title: "System Operations",
            children: &[
                ("CC7.1", "Detection and monitoring procedures identify configuration changes and vulnerabilities"),
                ("CC7.2", "System components are monitored for anomalies indicative of malicious acts"),
                ("CC7.3", "Security events are evaluated to determine whether they are incidents"),
                ("CC7.4", "Identified security incidents are responded to by executing a defined program"),
            ],
        },
        SectionSeed {
            reference: "CC8",
            title: "Change Management",
            children: &[(
                "CC8.1",
                "Changes to infrastructure, data and software are authorized, tested and approved",
            )],
        },
    ],
};

pub const PCI_DSS_4_0: FrameworkSeed = FrameworkSeed {
    code: "pci_dss",
    name: "PCI DSS",
    publisher: "PCI Security Standards Council",
    description: "Payment Card Industry Data Security Standard",
    version: "4.0",
    effective: (2022, 3, 31),
    sections: &[
        SectionSeed {
            reference: "1",
            title: "Install and Maintain Network Security Controls",
            children: &[
                ("1.2.1", "Configuration standards for network security controls are defined and maintained"),
                ("1.3.1", "Inbound traffic to the cardholder data environment is restricted"),
            ],
        },
        SectionSeed {
            reference: "2",
            title: "Apply Secure Configurations to All System Components",
            children: &[("2.2.1", "Configuration standards are developed, implemented and maintained")],
        },
        SectionSeed {
            reference: "3",
            title: "Protect Stored Account Data",
            children: &[
                ("3.4.1", "PAN is masked when displayed"),
                ("3.5.1", "PAN is rendered unreadable anywhere it is stored"),
            ],
        },
        SectionSeed {
            reference: "6",
            title: "Develop and Maintain Secure Systems and Software",
            children: &[
                ("6.3.1", "Security vulnerabilities are identified and managed"),
                ("6.3.3", "System components are protected from known vulnerabilities by installing patches"),
            ],
        },
        SectionSeed {
            reference: "8",
            title: "Identify Users and Authenticate Access to System Components",
            children: &[
                ("8.3.6", "Passwords meet minimum complexity requirements"),
                ("8.4.2", "MFA is implemented for all access into the cardholder data environment"),
            ],
        },
        SectionSeed {
            reference: "10",
            title: "Log and Monitor All Access to System Components and Cardholder Data",
            children: &[
                ("10.2.1", "Audit logs are enabled and active for all system components"),
                ("10.4.1", "Audit logs are reviewed at least once daily"),
            ],
        },
        SectionSeed {
            reference: "11",
            title: "Test Security of Systems and Networks Regularly",
            children: &[("11.3.1", "Internal vulnerability scans are performed at least once every three months")],
        },
    ],
};

/// Inserts one framework, its version and the requirement tree.
pub fn install(tables: &mut Tables, seed: &FrameworkSeed) -> Result<FrameworkVersion, StoreError> {
    let now = Utc::now();
    let framework = tables.frameworks().insert(Framework {
        id: Uuid::new_v4(),
        code: seed.code.to_string(),
        name: seed.name.to_string(),
        description: seed.description.to_string(),
        publisher: seed.publisher.to_string(),
        created_at: now,
    })?;

    let (y, m, d) = seed.effective;
    let version = tables.framework_versions().insert(FrameworkVersion {
        id: Uuid::new_v4(),
        framework_id: framework.id,
        version: seed.version.to_string(),
        effective_date: NaiveDate::from_ymd_opt(y, m, d),
        created_at: now,
    })?;

    for (section_order, section) in (1..).zip(seed.sections) {
        let parent = tables.requirements().insert(Requirement {
            id: Uuid::new_v4(),
            framework_version_id: version.id,
            parent_id: None,
            reference: section.reference.to_string(),
            title: section.title.to_string(),
            description: String::new(),
            depth: 0,
            section_order,
            is_assessable: section.children.is_empty(),
        })?;

        for (child_order, (reference, title)) in (1..).zip(section.children) {
            tables.requirements().insert(Requirement {
                id: Uuid::new_v4(),
                framework_version_id: version.id,
                parent_id: Some(parent.id),
                reference: reference.to_string(),
                title: title.to_string(),
                description: String::new(),
                depth: 1,
                section_order: child_order,
                is_assessable: true,
            })?;
        }
    }

    Ok(version)
}

/// Seeds the built-in frameworks when the catalog is empty. Returns how many
/// frameworks were installed.
pub fn seed_builtin(store: &Store) -> Result<usize, StoreError> {
    store.transaction(|tables| {
        if !tables.frameworks().all()?.is_empty() {
            return Ok(0);
        }
        let seeds = [&SOC2_2017, &PCI_DSS_4_0];
        for seed in seeds {
            install(tables, seed)?;
            info!(framework = seed.code, version = seed.version, "seeded framework catalog");
        }
        Ok(seeds.len())
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct FrameworkSummary {
    #[serde(flatten)]
    pub framework: Framework,
    pub versions: Vec<FrameworkVersion>,
}

fn summarize(tables: &mut Tables, framework: Framework) -> Result<FrameworkSummary, StoreError> {
    let mut versions = tables.framework_versions().of_framework(framework.id)?;
    versions.sort_by(|a, b| a.version.cmp(&b.version));
    Ok(FrameworkSummary { framework, versions })
}

pub fn list_frameworks(store: &Store) -> Result<Vec<FrameworkSummary>, ApiError> {
    let mut frameworks: Vec<FrameworkSummary> = store.read(|tables| {
        tables
            .frameworks()
            .all()?
            .into_iter()
            .map(|f| summarize(tables, f))
            .collect::<Result<Vec<_>, StoreError>>()
    })?;
    frameworks.sort_by(|a, b| a.framework.name.cmp(&b.framework.name));
    Ok(frameworks)
}

pub fn get_framework(store: &Store, framework_id: Uuid) -> Result<FrameworkSummary, ApiError> {
    store
        .read(|tables| {
            tables
                .frameworks()
                .get(framework_id)?
                .map(|f| summarize(tables, f))
                .transpose()
        })?
        .ok_or_else(|| ApiError::not_found("Framework"))
}

const REQUIREMENT_LIST: ListSpec = ListSpec {
    default_per_page: 50,
    max_per_page: 200,
    sort_fields: &["depth"],
    default_sort: "depth",
    default_order: SortOrder::Asc,
};

#[derive(Debug, Default, Deserialize)]
pub struct RequirementQuery {
    pub view: Option<String>,
    #[serde(flatten)]
    pub page: PageParams,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequirementNode {
    #[serde(flatten)]
    pub requirement: Requirement,
    pub children: Vec<RequirementNode>,
}

pub enum RequirementListing {
    Flat(Page<Requirement>),
    Tree(Vec<RequirementNode>),
}

pub fn list_requirements(
    store: &Store,
    version_id: Uuid,
    query: &RequirementQuery,
) -> Result<RequirementListing, ApiError> {
    let requirements = store.read(|tables| {
        if tables.framework_versions().get(version_id)?.is_none() {
            return Ok::<_, StoreError>(None);
        }
        Ok(Some(tables.requirements().in_version(version_id)?))
    })?;
    let requirements = requirements.ok_or_else(|| ApiError::not_found("Framework version"))?;

    match query.view.as_deref().unwrap_or("flat") {
        "flat" => Ok(RequirementListing::Flat(
            query
                .page
                .resolve(&REQUIREMENT_LIST)
                .apply(requirements, |a, b, _| (a.depth, a.section_order).cmp(&(b.depth, b.section_order))),
        )),
        "tree" => Ok(RequirementListing::Tree(build_tree(requirements))),
        other => Err(ApiError::field("view", format!("must be 'flat' or 'tree', got '{other}'"))),
    }
}

/// Assembles the flat rows into a forest without recursion. Rows are visited
/// deepest first so every child is complete before its parent is built.
/// Rows whose parent is missing become roots.
pub fn build_tree(mut requirements: Vec<Requirement>) -> Vec<RequirementNode> {
    requirements.sort_by_key(|r| (r.depth, r.section_order));
    let known: HashSet<Uuid> = requirements.iter().map(|r| r.id).collect();

    let mut pending: HashMap<Uuid, Vec<RequirementNode>> = HashMap::new();
    let mut roots = Vec::new();

    for requirement in requirements.into_iter().rev() {
        let mut children = pending.remove(&requirement.id).unwrap_or_default();
        children.reverse();
        let parent = requirement.parent_id.filter(|p| known.contains(p));
        let node = RequirementNode {
            requirement,
            children,
        };
        match parent {
            Some(parent_id) => pending.entry(parent_id).or_default().push(node),
            None => roots.push(node),
        }
    }

    // Children whose denormalized depth was not below their parent's.
    for (_, mut stranded) in pending.drain() {
        stranded.reverse();
        roots.extend(stranded);
    }

    roots.reverse();
    roots
}
