//! Status conditions shared by every Forklift resource
//!
//! Conditions carry a category in addition to the usual type/status pair.
//! `Critical` and `Error` categories block readiness.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// Well-known condition types
// =============================================================================

pub const READY: &str = "Ready";
pub const EXECUTING: &str = "Executing";
pub const SUCCEEDED: &str = "Succeeded";
pub const FAILED: &str = "Failed";
pub const CANCELED: &str = "Canceled";
pub const VALIDATION_FAILED: &str = "ValidationFailed";
pub const SOURCE_NOT_READY: &str = "SourceProviderNotReady";
pub const DESTINATION_NOT_READY: &str = "DestinationProviderNotReady";
pub const CONNECTION_TEST_FAILED: &str = "ConnectionTestFailed";
pub const INVENTORY_CREATED: &str = "InventoryCreated";
pub const CONNECTION_TEST_SUCCEEDED: &str = "ConnectionTestSucceeded";

/// Condition status
pub const TRUE: &str = "True";
pub const FALSE: &str = "False";

// =============================================================================
// Category
// =============================================================================

/// Severity category of a condition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum Category {
    Critical,
    Error,
    Warn,
    #[default]
    Advisory,
    Required,
}

impl Category {
    /// Whether a condition of this category blocks readiness
    pub fn is_blocking(self) -> bool {
        matches!(self, Category::Critical | Category::Error)
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Category::Critical => write!(f, "Critical"),
            Category::Error => write!(f, "Error"),
            Category::Warn => write!(f, "Warn"),
            Category::Advisory => write!(f, "Advisory"),
            Category::Required => write!(f, "Required"),
        }
    }
}

// =============================================================================
// Condition
// =============================================================================

/// A single status condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    pub r#type: String,
    /// Status: True, False
    pub status: String,
    /// Severity
    #[serde(default)]
    pub category: Category,
    /// Machine readable reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Human readable message
    #[serde(default)]
    pub message: String,
    /// Items the condition refers to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<String>,
    /// Last transition time
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    /// Build a `True` condition.
    pub fn new(r#type: impl Into<String>, category: Category, message: impl Into<String>) -> Self {
        Self {
            r#type: r#type.into(),
            status: TRUE.to_string(),
            category,
            reason: None,
            message: message.into(),
            items: Vec::new(),
            last_transition_time: Some(Utc::now()),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_items(mut self, items: Vec<String>) -> Self {
        self.items = items;
        self
    }

    pub fn is_true(&self) -> bool {
        self.status == TRUE
    }
}

/// A list of conditions keyed by type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct Conditions(pub Vec<Condition>);

impl Conditions {
    /// Set (insert or replace) a condition. The transition time is kept when
    /// the status is unchanged.
    pub fn set(&mut self, mut condition: Condition) {
        if let Some(existing) = self.0.iter_mut().find(|c| c.r#type == condition.r#type) {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            *existing = condition;
        } else {
            self.0.push(condition);
        }
    }

    /// Remove a condition by type.
    pub fn delete(&mut self, r#type: &str) {
        self.0.retain(|c| c.r#type != r#type);
    }

    pub fn find(&self, r#type: &str) -> Option<&Condition> {
        self.0.iter().find(|c| c.r#type == r#type)
    }

    /// Whether a condition of the given type is present and `True`.
    pub fn has(&self, r#type: &str) -> bool {
        self.find(r#type).map(|c| c.is_true()).unwrap_or(false)
    }

    /// Whether any `True` condition has a blocking category.
    pub fn has_blocker(&self) -> bool {
        self.0.iter().any(|c| c.is_true() && c.category.is_blocking())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_replaces_by_type() {
        let mut conds = Conditions::default();
        conds.set(Condition::new(READY, Category::Required, "ready"));
        conds.set(Condition::new(READY, Category::Required, "still ready"));
        assert_eq!(conds.0.len(), 1);
        assert_eq!(conds.find(READY).unwrap().message, "still ready");
    }

    #[test]
    fn test_blocker_detection() {
        let mut conds = Conditions::default();
        conds.set(Condition::new("Advice", Category::Warn, "meh"));
        assert!(!conds.has_blocker());
        conds.set(Condition::new(VALIDATION_FAILED, Category::Critical, "bad"));
        assert!(conds.has_blocker());
        conds.delete(VALIDATION_FAILED);
        assert!(!conds.has_blocker());
    }

    #[test]
    fn test_category_serialization() {
        let c = Condition::new(FAILED, Category::Error, "boom");
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["category"], "Error");
        assert_eq!(json["status"], "True");
    }
}
