//! Risk register: scoring, assessments, treatments and control links.

pub mod assessments;
pub mod handlers;
pub mod links;
pub mod risks;
pub mod scoring;
pub mod treatments;
pub mod types;
