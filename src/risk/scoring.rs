use serde::Serialize;

use super::types::{Impact, Likelihood, Risk};
use crate::core::severity::Severity;

pub fn score(likelihood: Likelihood, impact: Impact) -> i32 {
    likelihood.score() * impact.score()
}

/// Maps a 1..=25 score onto its severity band.
pub fn severity_for(score: i32) -> Severity {
    match score {
        s if s >= 20 => Severity::Critical,
        s if s >= 12 => Severity::High,
        s if s >= 6 => Severity::Medium,
        _ => Severity::Low,
    }
}

pub fn appetite_breached(residual_score: Option<i32>, appetite_threshold: Option<i32>) -> bool {
    match (residual_score, appetite_threshold) {
        (Some(score), Some(threshold)) => score > threshold,
        _ => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScoreSummary {
    pub likelihood: Likelihood,
    pub impact: Impact,
    pub score: i32,
    pub severity: Severity,
}

impl ScoreSummary {
    pub fn from_pair(likelihood: Option<Likelihood>, impact: Option<Impact>) -> Option<Self> {
        let (likelihood, impact) = (likelihood?, impact?);
        let score = score(likelihood, impact);
        Some(Self {
            likelihood,
            impact,
            score,
            severity: severity_for(score),
        })
    }
}

/// A risk with its derived scores, as returned by the API.
#[derive(Debug, Clone, Serialize)]
pub struct RiskView {
    #[serde(flatten)]
    pub risk: Risk,
    pub inherent: Option<ScoreSummary>,
    pub residual: Option<ScoreSummary>,
    pub appetite_breached: bool,
}

impl RiskView {
    pub fn new(risk: Risk) -> Self {
        let inherent = ScoreSummary::from_pair(risk.inherent_likelihood, risk.inherent_impact);
        let residual = ScoreSummary::from_pair(risk.residual_likelihood, risk.residual_impact);
        let appetite_breached = appetite_breached(risk.residual_score, risk.appetite_threshold);
        Self {
            risk,
            inherent,
            residual,
            appetite_breached,
        }
    }

    /// Residual severity when assessed, otherwise inherent.
    pub fn effective_severity(&self) -> Option<Severity> {
        self.residual.or(self.inherent).map(|s| s.severity)
    }
}
