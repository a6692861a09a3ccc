//! Status and role vocabulary
//!
//! Work-item status labels are caller-supplied text. The hub only interprets
//! them in a handful of places: deciding who gets a targeted notification,
//! whether a release keeps the current status, and what counts as completed
//! for epic progress. Matching is done on a normalised form (lowercase,
//! `-`/`_` folded to spaces) against configurable regular expressions.

use regex::Regex;

use crate::config::{TransitionConfig, VocabularyConfig};

/// What a status label means to the hub
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusSignal {
    ReadyForReview,
    NeedsChanges,
    Approved,
    Other,
}

/// Coarse role buckets used for targeted notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleClass {
    Reviewer,
    Developer,
    Other,
}

pub fn normalize(label: &str) -> String {
    label
        .trim()
        .to_lowercase()
        .replace(['-', '_'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone)]
pub struct StatusVocabulary {
    pub available: String,
    pub claimed: String,
    pub in_review: String,
    pub done: String,
    pub approved: String,
    pub needs_changes: String,
    pub rejected: String,
    pub reviewed: String,
    ready_for_review_pattern: Regex,
    needs_changes_pattern: Regex,
    approved_pattern: Regex,
    in_review_pattern: Regex,
    completed_pattern: Regex,
    reviewer_role_pattern: Regex,
    developer_role_pattern: Regex,
}

impl StatusVocabulary {
    pub fn from_config(config: &VocabularyConfig) -> Result<Self, regex::Error> {
        Ok(Self {
            available: config.available.clone(),
            claimed: config.claimed.clone(),
            in_review: config.in_review.clone(),
            done: config.done.clone(),
            approved: config.approved.clone(),
            needs_changes: config.needs_changes.clone(),
            rejected: config.rejected.clone(),
            reviewed: config.reviewed.clone(),
            ready_for_review_pattern: Regex::new(&config.ready_for_review_pattern)?,
            needs_changes_pattern: Regex::new(&config.needs_changes_pattern)?,
            approved_pattern: Regex::new(&config.approved_pattern)?,
            in_review_pattern: Regex::new(&config.in_review_pattern)?,
            completed_pattern: Regex::new(&config.completed_pattern)?,
            reviewer_role_pattern: Regex::new(&config.reviewer_role_pattern)?,
            developer_role_pattern: Regex::new(&config.developer_role_pattern)?,
        })
    }

    pub fn signal(&self, status: &str) -> StatusSignal {
        let status = normalize(status);
        if self.ready_for_review_pattern.is_match(&status) {
            StatusSignal::ReadyForReview
        } else if self.needs_changes_pattern.is_match(&status) {
            StatusSignal::NeedsChanges
        } else if self.approved_pattern.is_match(&status) {
            StatusSignal::Approved
        } else {
            StatusSignal::Other
        }
    }

    pub fn role_class(&self, role: &str) -> RoleClass {
        let role = normalize(role);
        if self.reviewer_role_pattern.is_match(&role) {
            RoleClass::Reviewer
        } else if self.developer_role_pattern.is_match(&role) {
            RoleClass::Developer
        } else {
            RoleClass::Other
        }
    }

    /// Labels that survive `release_work` untouched: review in progress or
    /// waiting for one
    pub fn is_review_state(&self, status: &str) -> bool {
        let status = normalize(status);
        self.in_review_pattern.is_match(&status) || self.ready_for_review_pattern.is_match(&status)
    }

    pub fn is_completed(&self, status: &str) -> bool {
        self.completed_pattern.is_match(&normalize(status))
    }

    /// Label a finished review maps onto
    pub fn review_label(&self, outcome: &crate::hub::types::ReviewOutcome) -> String {
        use crate::hub::types::ReviewOutcome;
        match outcome {
            ReviewOutcome::Approved => self.approved.clone(),
            ReviewOutcome::NeedsChanges => self.needs_changes.clone(),
            ReviewOutcome::Rejected => self.rejected.clone(),
            ReviewOutcome::Other(_) => self.reviewed.clone(),
        }
    }
}

/// Whether published transitions are checked against an allow-list
#[derive(Debug, Clone)]
pub enum TransitionPolicy {
    Permissive,
    Strict(Vec<(String, String)>),
}

impl TransitionPolicy {
    pub fn from_config(config: &TransitionConfig) -> Self {
        if !config.strict {
            return TransitionPolicy::Permissive;
        }
        TransitionPolicy::Strict(
            config
                .allowed
                .iter()
                .map(|rule| (normalize(&rule.from), normalize(&rule.to)))
                .collect(),
        )
    }

    pub fn allows(&self, from: &str, to: &str) -> bool {
        match self {
            TransitionPolicy::Permissive => true,
            TransitionPolicy::Strict(rules) => {
                let (from, to) = (normalize(from), normalize(to));
                rules.iter().any(|(rule_from, rule_to)| {
                    (rule_from == "*" || *rule_from == from) && (rule_to == "*" || *rule_to == to)
                })
            }
        }
    }
}
