// crates/replica-judge-core/src/core/rse.rs
// ============================================================================
// Module: Storage Resources
// Description: Storage resource (RSE) records and their attribute values.
// Purpose: Model the read-only resource catalog view used for placement.
// Dependencies: crate::core::identifiers, serde
// ============================================================================

//! ## Overview
//! A resource is an identifier plus a tag→value attribute map. Attribute
//! values are booleans, numbers, or text. Boolean tags drive expression
//! eligibility; numeric attributes double as placement weights.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::core::identifiers::RseId;

// ============================================================================
// SECTION: Attribute Values
// ============================================================================

/// Resource attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// Boolean tag.
    Bool(bool),
    /// Numeric attribute (weights, capacities).
    Number(f64),
    /// Free-form text attribute.
    Text(String),
}

impl AttributeValue {
    /// Returns true when the attribute counts as present for a bare tag term.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Bool(value) => *value,
            Self::Number(value) => *value != 0.0,
            Self::Text(value) => {
                let trimmed = value.trim();
                !trimmed.is_empty() && !trimmed.eq_ignore_ascii_case("false")
            }
        }
    }

    /// Returns the numeric interpretation of the attribute, if any.
    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            Self::Bool(_) => None,
            Self::Text(value) => value.trim().parse::<f64>().ok(),
        }
    }

    /// Compares the attribute against an expression literal.
    #[must_use]
    pub fn matches_literal(&self, literal: &str) -> bool {
        match self {
            Self::Bool(value) => parse_bool_literal(literal) == Some(*value),
            Self::Number(value) => literal.parse::<f64>().is_ok_and(|parsed| parsed == *value),
            Self::Text(value) => value == literal,
        }
    }
}

/// Parses the boolean spellings accepted in expressions.
fn parse_bool_literal(literal: &str) -> Option<bool> {
    if literal.eq_ignore_ascii_case("true") || literal == "1" {
        Some(true)
    } else if literal.eq_ignore_ascii_case("false") || literal == "0" {
        Some(false)
    } else {
        None
    }
}

// ============================================================================
// SECTION: Resource Record
// ============================================================================

/// Storage resource with its attribute map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rse {
    /// Resource identifier.
    pub id: RseId,
    /// Attribute map.
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeValue>,
}

impl Rse {
    /// Creates a resource without attributes.
    #[must_use]
    pub fn new(id: impl Into<RseId>) -> Self {
        Self {
            id: id.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Adds or replaces an attribute, returning the updated resource.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: AttributeValue) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Returns the attribute value for `key`.
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }

    /// Returns true when the resource carries `key` as a truthy tag.
    ///
    /// Every resource implicitly carries its own identifier as a true tag so
    /// expressions can name resources directly.
    #[must_use]
    pub fn has_tag(&self, key: &str) -> bool {
        if key == self.id.as_str() {
            return true;
        }
        self.attributes.get(key).is_some_and(AttributeValue::is_truthy)
    }

    /// Returns the placement weight for the named attribute.
    ///
    /// Missing, non-numeric, negative, or non-finite values weigh zero.
    #[must_use]
    pub fn weight(&self, attribute: &str) -> f64 {
        self.attributes
            .get(attribute)
            .and_then(AttributeValue::as_number)
            .filter(|value| value.is_finite() && *value > 0.0)
            .unwrap_or(0.0)
    }
}
