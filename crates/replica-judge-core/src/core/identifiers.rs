// crates/replica-judge-core/src/core/identifiers.rs
// ============================================================================
// Module: Replica Judge Identifiers
// Description: Canonical opaque identifiers for identifiers, rules, and resources.
// Purpose: Provide strongly typed, serializable IDs with stable string forms.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! This module defines the identifier newtypes used throughout the evaluator.
//! String identifiers are opaque and serialize transparently. Validation is
//! handled at rule-creation or inventory boundaries rather than within these
//! wrappers. [`DidKey`] is the `(scope, name)` key of the identifier hierarchy.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;
use std::num::NonZeroU64;

use serde::Deserialize;
use serde::Serialize;

// ============================================================================
// SECTION: String Identifiers
// ============================================================================

/// Declares a transparent string identifier with the shared helper surface.
macro_rules! string_identifier {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }
    };
}

string_identifier! {
    /// Namespace half of an identifier key.
    Scope
}

string_identifier! {
    /// Storage resource (RSE) identifier.
    RseId
}

string_identifier! {
    /// Account that owns a rule and is charged for its locks.
    AccountId
}

string_identifier! {
    /// Opaque provenance tag linking a rule to the subscription that created it.
    SubscriptionId
}

string_identifier! {
    /// Label of an evaluator worker holding backlog claims.
    WorkerId
}

// ============================================================================
// SECTION: Identifier Key
// ============================================================================

/// Unique `(scope, name)` key of a file, dataset, or container.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DidKey {
    /// Identifier scope.
    pub scope: Scope,
    /// Identifier name, unique within the scope.
    pub name: String,
}

impl DidKey {
    /// Creates a new identifier key.
    #[must_use]
    pub fn new(scope: impl Into<Scope>, name: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for DidKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope, self.name)
    }
}

// ============================================================================
// SECTION: Rule Identifier
// ============================================================================

/// Store-assigned rule identifier.
///
/// # Invariants
/// - Always non-zero; stores allocate monotonically increasing values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(NonZeroU64);

impl RuleId {
    /// Creates a rule identifier from a known non-zero value.
    #[must_use]
    pub const fn new(id: NonZeroU64) -> Self {
        Self(id)
    }

    /// Attempts to create a rule identifier, returning `None` when the raw value is zero.
    #[must_use]
    pub fn from_raw(id: u64) -> Option<Self> {
        NonZeroU64::new(id).map(Self::new)
    }

    /// Returns the raw identifier value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
