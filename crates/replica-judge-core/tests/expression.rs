// crates/replica-judge-core/tests/expression.rs
// ============================================================================
// Module: RSE Expression Tests
// Description: Parsing, evaluation, and limit handling for rse expressions.
// Purpose: Pin the grammar and the set semantics of the operators.
// ============================================================================

//! Unit and property tests for rse expressions.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    clippy::missing_docs_in_private_items,
    reason = "Test-only assertions and helpers are permitted."
)]

use proptest::prelude::*;
use replica_judge_core::AttributeValue;
use replica_judge_core::ExpressionError;
use replica_judge_core::Rse;
use replica_judge_core::RseExpression;
use replica_judge_core::RseTerm;
use replica_judge_core::core::expression::MAX_EXPRESSION_BYTES;
use replica_judge_core::core::expression::MAX_EXPRESSION_NESTING;

fn catalog() -> Vec<Rse> {
    vec![
        Rse::new("CERN")
            .with_attribute("tier1", AttributeValue::Bool(true))
            .with_attribute("country", AttributeValue::Text("ch".to_string()))
            .with_attribute("freespace", AttributeValue::Number(500.0)),
        Rse::new("DESY")
            .with_attribute("tier1", AttributeValue::Bool(true))
            .with_attribute("country", AttributeValue::Text("de".to_string()))
            .with_attribute("freespace", AttributeValue::Number(20.0)),
        Rse::new("LRZ")
            .with_attribute("tier1", AttributeValue::Bool(false))
            .with_attribute("country", AttributeValue::Text("de".to_string())),
        Rse::new("TAPE").with_attribute("istape", AttributeValue::Text("true".to_string())),
    ]
}

fn resolve(input: &str) -> Vec<String> {
    let rses = catalog();
    RseExpression::parse(input)
        .unwrap()
        .resolve(&rses)
        .into_iter()
        .map(|rse| rse.id.as_str().to_string())
        .collect()
}

// ============================================================================
// SECTION: Evaluation
// ============================================================================

#[test]
fn bare_tag_requires_truthy_attribute() {
    assert_eq!(resolve("tier1"), ["CERN", "DESY"]);
    assert_eq!(resolve("istape"), ["TAPE"]);
}

#[test]
fn resource_id_is_an_implicit_tag() {
    assert_eq!(resolve("LRZ"), ["LRZ"]);
    assert_eq!(resolve("CERN|LRZ"), ["CERN", "LRZ"]);
}

#[test]
fn comparisons_cover_text_and_numbers() {
    assert_eq!(resolve("country=de"), ["DESY", "LRZ"]);
    assert_eq!(resolve("country!=de"), ["CERN", "TAPE"]);
    assert_eq!(resolve("freespace>100"), ["CERN"]);
    assert_eq!(resolve("freespace<100"), ["DESY"]);
}

#[test]
fn difference_and_precedence() {
    assert_eq!(resolve("country=de\\tier1"), ["LRZ"]);
    assert_eq!(resolve("TAPE|tier1&country=de"), ["DESY", "TAPE"]);
    assert_eq!(resolve("(TAPE|tier1)&country=de"), ["DESY"]);
    assert_eq!(resolve("*\\tier1"), ["LRZ", "TAPE"]);
    assert_eq!(resolve("!tier1&!istape"), ["LRZ"]);
}

#[test]
fn resolve_preserves_catalog_order() {
    assert_eq!(resolve("TAPE|LRZ|CERN"), ["CERN", "LRZ", "TAPE"]);
}

#[test]
fn parse_builds_expected_tree() {
    let parsed = RseExpression::parse("a\\b").unwrap();
    let expected = RseExpression::and(vec![
        RseExpression::Term(RseTerm::Tag("a".to_string())),
        RseExpression::negate(RseExpression::Term(RseTerm::Tag("b".to_string()))),
    ]);
    assert_eq!(parsed, expected);
}

// ============================================================================
// SECTION: Errors
// ============================================================================

#[test]
fn malformed_input_is_rejected() {
    assert_eq!(RseExpression::parse("   "), Err(ExpressionError::EmptyInput));
    assert!(matches!(
        RseExpression::parse("tier1&"),
        Err(ExpressionError::UnexpectedToken { position: 6, .. })
    ));
    assert!(matches!(
        RseExpression::parse("(tier1"),
        Err(ExpressionError::UnexpectedToken { expected: "`)`", .. })
    ));
    assert!(matches!(
        RseExpression::parse("tier1 tier2"),
        Err(ExpressionError::UnexpectedToken { .. })
    ));
    assert!(matches!(
        RseExpression::parse("freespace>lots"),
        Err(ExpressionError::InvalidNumber { .. })
    ));
    assert!(matches!(RseExpression::parse("tier1#"), Err(ExpressionError::UnexpectedToken { .. })));
}

#[test]
fn limits_are_enforced() {
    let long = "a".repeat(MAX_EXPRESSION_BYTES + 1);
    assert!(matches!(RseExpression::parse(&long), Err(ExpressionError::InputTooLarge { .. })));

    let depth = MAX_EXPRESSION_NESTING + 1;
    let nested = format!("{}a{}", "(".repeat(depth), ")".repeat(depth));
    assert!(matches!(RseExpression::parse(&nested), Err(ExpressionError::NestingTooDeep { .. })));

    let allowed = format!(
        "{}a{}",
        "(".repeat(MAX_EXPRESSION_NESTING),
        ")".repeat(MAX_EXPRESSION_NESTING)
    );
    assert!(RseExpression::parse(&allowed).is_ok());
}

#[test]
fn negation_counts_against_nesting_limit() {
    let negated = format!("{}a", "!".repeat(100));
    assert_eq!(
        RseExpression::parse(&negated),
        Err(ExpressionError::NestingTooDeep {
            max_depth: MAX_EXPRESSION_NESTING,
            position: MAX_EXPRESSION_NESTING,
        })
    );

    let half = MAX_EXPRESSION_NESTING / 2 + 1;
    let mixed = format!("{}a{}", "!(".repeat(half), ")".repeat(half));
    assert!(matches!(RseExpression::parse(&mixed), Err(ExpressionError::NestingTooDeep { .. })));

    let allowed = format!("{}tier1", "!".repeat(MAX_EXPRESSION_NESTING));
    assert_eq!(resolve(&allowed), vec!["CERN", "DESY"]);
}

// ============================================================================
// SECTION: Properties
// ============================================================================

fn rse_with_tags(a: bool, b: bool) -> Rse {
    Rse::new("X")
        .with_attribute("a", AttributeValue::Bool(a))
        .with_attribute("b", AttributeValue::Bool(b))
}

proptest! {
    #[test]
    fn operators_follow_set_semantics(a in any::<bool>(), b in any::<bool>()) {
        let rse = rse_with_tags(a, b);
        prop_assert_eq!(RseExpression::parse("a|b").unwrap().matches(&rse), a || b);
        prop_assert_eq!(RseExpression::parse("a&b").unwrap().matches(&rse), a && b);
        prop_assert_eq!(RseExpression::parse("a\\b").unwrap().matches(&rse), a && !b);
        prop_assert_eq!(RseExpression::parse("!(a|b)").unwrap().matches(&rse), !(a || b));
    }

    #[test]
    fn parser_never_panics(input in "[a-z01=<>!&|\\\\()* ]{0,64}") {
        let _ = RseExpression::parse(&input);
    }
}
