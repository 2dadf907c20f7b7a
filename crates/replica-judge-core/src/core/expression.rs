// crates/replica-judge-core/src/core/expression.rs
// ============================================================================
// Module: RSE Expression Parser
// Description: Boolean tag expressions over resource attributes.
// Purpose: Parse `rse_expression` strings once into an AST that is evaluated
//          per resource.
// Dependencies: crate::core::rse, smallvec, thiserror
// ============================================================================

//! ## Overview
//!
//! Rules select storage through a compact boolean expression over resource
//! attributes. Parsing happens once per rule evaluation; the resulting
//! [`RseExpression`] tree is then evaluated against each resource's attribute
//! map without further string handling. Expression input is untrusted; size
//! and nesting limits are enforced while parsing.
//!
//! ### Grammar (informal)
//! - **Terms**: `tier1` (tag present and truthy), `country=de`,
//!   `country!=de`, `freespace>100`, `freespace<5`, `*` (every resource)
//! - **Operators**: `a&b` (and), `a|b` (or), `a\b` (difference, `a` and not
//!   `b`), `!a` (not)
//! - **Precedence**: `!` binds tightest, then `&` and `\` (left-assoc), then `|`
//! - **Parentheses**: `( ... )` for explicit grouping
//!
//! ### Example
//!
//! ```
//! use replica_judge_core::AttributeValue;
//! use replica_judge_core::Rse;
//! use replica_judge_core::RseExpression;
//!
//! let expression = RseExpression::parse("tier1&country=de").unwrap();
//! let rse = Rse::new("DESY")
//!     .with_attribute("tier1", AttributeValue::Bool(true))
//!     .with_attribute("country", AttributeValue::Text("de".to_string()));
//! assert!(expression.matches(&rse));
//! ```

// ============================================================================
// SECTION: Imports
// ============================================================================

use smallvec::SmallVec;
use thiserror::Error;

use crate::core::rse::Rse;

// ============================================================================
// SECTION: Limits
// ============================================================================

/// Maximum allowed expression input size in bytes.
pub const MAX_EXPRESSION_BYTES: usize = 4 * 1024;
/// Maximum supported nesting depth for parentheses and negations combined.
pub const MAX_EXPRESSION_NESTING: usize = 32;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors produced while parsing an RSE expression.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpressionError {
    /// Input was empty or contained only whitespace.
    #[error("rse expression is empty")]
    EmptyInput,
    /// Input exceeded the size limit.
    #[error("rse expression exceeds size limit: {actual_bytes} bytes (max {max_bytes})")]
    InputTooLarge {
        /// Maximum allowed bytes.
        max_bytes: usize,
        /// Actual input length in bytes.
        actual_bytes: usize,
    },
    /// Input exceeded the nesting limit.
    #[error("rse expression nesting exceeds limit {max_depth} at {position}")]
    NestingTooDeep {
        /// Maximum allowed nesting depth.
        max_depth: usize,
        /// Byte offset in the original input.
        position: usize,
    },
    /// Unexpected token encountered during parsing.
    #[error("unexpected token `{found}` at {position}, expected {expected}")]
    UnexpectedToken {
        /// Human-friendly expectation summary.
        expected: &'static str,
        /// The token that was actually seen.
        found: String,
        /// Byte offset in the original input.
        position: usize,
    },
    /// Numeric comparison operand failed to parse.
    #[error("invalid number `{raw}` at {position}")]
    InvalidNumber {
        /// The raw operand text.
        raw: String,
        /// Byte offset in the original input.
        position: usize,
    },
}

// ============================================================================
// SECTION: Expression Tree
// ============================================================================

/// Atomic predicate over one resource attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum RseTerm {
    /// Matches every resource (`*`).
    Any,
    /// Attribute present and truthy (bare `key`).
    Tag(String),
    /// Attribute equals the literal (`key=value`).
    Equals {
        /// Attribute name.
        key: String,
        /// Literal compared against the attribute.
        value: String,
    },
    /// Attribute missing or different from the literal (`key!=value`).
    NotEquals {
        /// Attribute name.
        key: String,
        /// Literal compared against the attribute.
        value: String,
    },
    /// Numeric attribute strictly below the bound (`key<value`).
    LessThan {
        /// Attribute name.
        key: String,
        /// Upper bound.
        bound: f64,
    },
    /// Numeric attribute strictly above the bound (`key>value`).
    GreaterThan {
        /// Attribute name.
        key: String,
        /// Lower bound.
        bound: f64,
    },
}

impl RseTerm {
    /// Evaluates the term against a resource.
    #[must_use]
    pub fn matches(&self, rse: &Rse) -> bool {
        match self {
            Self::Any => true,
            Self::Tag(key) => rse.has_tag(key),
            Self::Equals {
                key,
                value,
            } => rse.attribute(key).is_some_and(|attr| attr.matches_literal(value)),
            Self::NotEquals {
                key,
                value,
            } => !rse.attribute(key).is_some_and(|attr| attr.matches_literal(value)),
            Self::LessThan {
                key,
                bound,
            } => rse.attribute(key).and_then(|attr| attr.as_number()).is_some_and(|n| n < *bound),
            Self::GreaterThan {
                key,
                bound,
            } => rse.attribute(key).and_then(|attr| attr.as_number()).is_some_and(|n| n > *bound),
        }
    }
}

/// Parsed boolean expression over [`RseTerm`] leaves.
#[derive(Debug, Clone, PartialEq)]
pub enum RseExpression {
    /// All children must match. Empty `And` matches everything.
    And(SmallVec<[Box<Self>; 4]>),
    /// At least one child must match. Empty `Or` matches nothing.
    Or(SmallVec<[Box<Self>; 4]>),
    /// Inverts the child.
    Not(Box<Self>),
    /// Attribute predicate.
    Term(RseTerm),
}

impl RseExpression {
    /// Parses an expression string.
    ///
    /// # Errors
    ///
    /// Returns [`ExpressionError`] for empty or oversized input, syntax errors,
    /// invalid numeric operands, or excessive nesting.
    pub fn parse(input: &str) -> Result<Self, ExpressionError> {
        if input.len() > MAX_EXPRESSION_BYTES {
            return Err(ExpressionError::InputTooLarge {
                max_bytes: MAX_EXPRESSION_BYTES,
                actual_bytes: input.len(),
            });
        }
        let tokens = Lexer::new(input).lex()?;
        let mut parser = Parser::new(tokens);
        let expression = parser.parse_or()?;
        parser.expect_eof()?;
        Ok(expression)
    }

    /// Builds a conjunction of child expressions.
    #[must_use]
    pub fn and(children: Vec<Self>) -> Self {
        Self::And(children.into_iter().map(Box::new).collect())
    }

    /// Builds a disjunction of child expressions.
    #[must_use]
    pub fn or(children: Vec<Self>) -> Self {
        Self::Or(children.into_iter().map(Box::new).collect())
    }

    /// Builds a negation.
    #[must_use]
    pub fn negate(child: Self) -> Self {
        Self::Not(Box::new(child))
    }

    /// Evaluates the expression against a resource with short-circuiting.
    #[must_use]
    pub fn matches(&self, rse: &Rse) -> bool {
        match self {
            Self::Term(term) => term.matches(rse),
            Self::Not(child) => !child.matches(rse),
            Self::And(children) => children.iter().all(|child| child.matches(rse)),
            Self::Or(children) => children.iter().any(|child| child.matches(rse)),
        }
    }

    /// Returns the resources matching the expression, preserving catalog order.
    #[must_use]
    pub fn resolve<'a>(&self, rses: &'a [Rse]) -> Vec<&'a Rse> {
        rses.iter().filter(|rse| self.matches(rse)).collect()
    }
}

// ============================================================================
// SECTION: Lexer
// ============================================================================

/// Lexer token produced from the expression input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token<'a> {
    /// Attribute name, value, or resource identifier.
    Ident(&'a str),
    /// `=` comparison.
    Eq,
    /// `!=` comparison.
    NotEq,
    /// `<` comparison.
    Lt,
    /// `>` comparison.
    Gt,
    /// `&` conjunction.
    And,
    /// `|` disjunction.
    Or,
    /// `\` difference.
    Diff,
    /// `!` negation.
    Not,
    /// `*` wildcard.
    Star,
    /// Left parenthesis.
    LParen,
    /// Right parenthesis.
    RParen,
    /// End-of-input marker.
    Eof,
}

/// Token paired with its byte offset.
#[derive(Debug, Clone, Copy)]
struct SpannedToken<'a> {
    /// Token value.
    token: Token<'a>,
    /// Byte offset into the input.
    position: usize,
}

/// Lexer for RSE expressions.
struct Lexer<'a> {
    /// Source input being tokenized.
    input: &'a str,
    /// Current byte offset into the input.
    offset: usize,
}

impl<'a> Lexer<'a> {
    /// Creates a new lexer for the given input.
    const fn new(input: &'a str) -> Self {
        Self {
            input,
            offset: 0,
        }
    }

    /// Lexes the input into a sequence of tokens.
    fn lex(mut self) -> Result<Vec<SpannedToken<'a>>, ExpressionError> {
        let mut tokens = Vec::new();
        let bytes = self.input.as_bytes();

        while let Some(&ch) = bytes.get(self.offset) {
            let single = match ch {
                b' ' | b'\t' | b'\n' | b'\r' => {
                    self.offset += 1;
                    continue;
                }
                b'=' => Some(Token::Eq),
                b'<' => Some(Token::Lt),
                b'>' => Some(Token::Gt),
                b'&' => Some(Token::And),
                b'|' => Some(Token::Or),
                b'\\' => Some(Token::Diff),
                b'*' => Some(Token::Star),
                b'(' => Some(Token::LParen),
                b')' => Some(Token::RParen),
                b'!' => {
                    if bytes.get(self.offset + 1) == Some(&b'=') {
                        tokens.push(self.spanned(Token::NotEq));
                        self.offset += 2;
                        continue;
                    }
                    Some(Token::Not)
                }
                _ if is_ident_byte(ch) => None,
                _ => {
                    return Err(ExpressionError::UnexpectedToken {
                        expected: "attribute, value, or operator",
                        found: self.input[self.offset ..].chars().next().map_or_else(
                            || char::from(ch).to_string(),
                            |found| found.to_string(),
                        ),
                        position: self.offset,
                    });
                }
            };
            if let Some(token) = single {
                tokens.push(self.spanned(token));
                self.offset += 1;
            } else {
                let start = self.offset;
                while bytes.get(self.offset).is_some_and(|b| is_ident_byte(*b)) {
                    self.offset += 1;
                }
                tokens.push(SpannedToken {
                    token: Token::Ident(&self.input[start .. self.offset]),
                    position: start,
                });
            }
        }

        if tokens.is_empty() {
            return Err(ExpressionError::EmptyInput);
        }
        tokens.push(self.spanned(Token::Eof));
        Ok(tokens)
    }

    /// Builds a token at the current offset.
    const fn spanned(&self, token: Token<'a>) -> SpannedToken<'a> {
        SpannedToken {
            token,
            position: self.offset,
        }
    }
}

/// Returns true for bytes allowed inside attribute names and values.
const fn is_ident_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'_' | b'.' | b':' | b'-')
}

// ============================================================================
// SECTION: Parser
// ============================================================================

/// Recursive-descent parser for RSE expressions.
struct Parser<'a> {
    /// Token stream with source positions.
    tokens: Vec<SpannedToken<'a>>,
    /// Current token index.
    index: usize,
    /// Current depth of open parentheses and pending negations.
    nesting: usize,
}

impl<'a> Parser<'a> {
    /// Creates a parser over the token stream.
    const fn new(tokens: Vec<SpannedToken<'a>>) -> Self {
        Self {
            tokens,
            index: 0,
            nesting: 0,
        }
    }

    /// Parses `|`-separated alternatives.
    fn parse_or(&mut self) -> Result<RseExpression, ExpressionError> {
        let mut parts = vec![self.parse_and()?];
        while self.matches(Token::Or) {
            parts.push(self.parse_and()?);
        }
        Ok(collapse(parts, RseExpression::or))
    }

    /// Parses `&` conjunctions and `\` differences, left-associative.
    fn parse_and(&mut self) -> Result<RseExpression, ExpressionError> {
        let mut parts = vec![self.parse_unary()?];
        loop {
            if self.matches(Token::And) {
                parts.push(self.parse_unary()?);
            } else if self.matches(Token::Diff) {
                let subtrahend = self.parse_unary()?;
                parts.push(RseExpression::negate(subtrahend));
            } else {
                break;
            }
        }
        Ok(collapse(parts, RseExpression::and))
    }

    /// Parses prefix negation.
    fn parse_unary(&mut self) -> Result<RseExpression, ExpressionError> {
        let position = self.current().position;
        if !self.matches(Token::Not) {
            return self.parse_primary();
        }
        self.enter(position)?;
        let operand = self.parse_unary()?;
        self.nesting -= 1;
        Ok(RseExpression::negate(operand))
    }

    /// Opens one nesting level, failing past [`MAX_EXPRESSION_NESTING`].
    const fn enter(&mut self, position: usize) -> Result<(), ExpressionError> {
        if self.nesting >= MAX_EXPRESSION_NESTING {
            return Err(ExpressionError::NestingTooDeep {
                max_depth: MAX_EXPRESSION_NESTING,
                position,
            });
        }
        self.nesting += 1;
        Ok(())
    }

    /// Parses a term, wildcard, or parenthesized expression.
    fn parse_primary(&mut self) -> Result<RseExpression, ExpressionError> {
        let SpannedToken {
            token,
            position,
        } = self.current();
        match token {
            Token::Star => {
                self.advance();
                Ok(RseExpression::Term(RseTerm::Any))
            }
            Token::LParen => {
                self.advance();
                self.enter(position)?;
                let inner = self.parse_or()?;
                self.expect(Token::RParen, "`)`")?;
                self.nesting -= 1;
                Ok(inner)
            }
            Token::Ident(key) => {
                self.advance();
                self.parse_comparison(key).map(RseExpression::Term)
            }
            _ => Err(ExpressionError::UnexpectedToken {
                expected: "attribute, `*`, `!`, or `(`",
                found: describe(token),
                position,
            }),
        }
    }

    /// Parses an optional comparison following an attribute name.
    fn parse_comparison(&mut self, key: &str) -> Result<RseTerm, ExpressionError> {
        let operator = self.current().token;
        if !matches!(operator, Token::Eq | Token::NotEq | Token::Lt | Token::Gt) {
            return Ok(RseTerm::Tag(key.to_string()));
        }
        self.advance();
        let SpannedToken {
            token,
            position,
        } = self.current();
        let Token::Ident(value) = token else {
            return Err(ExpressionError::UnexpectedToken {
                expected: "attribute value",
                found: describe(token),
                position,
            });
        };
        self.advance();
        let key = key.to_string();
        let term = match operator {
            Token::Eq => RseTerm::Equals {
                key,
                value: value.to_string(),
            },
            Token::NotEq => RseTerm::NotEquals {
                key,
                value: value.to_string(),
            },
            Token::Lt => RseTerm::LessThan {
                key,
                bound: parse_bound(value, position)?,
            },
            _ => RseTerm::GreaterThan {
                key,
                bound: parse_bound(value, position)?,
            },
        };
        Ok(term)
    }

    /// Consumes the expected token or returns an error.
    fn expect(&mut self, token: Token<'_>, expected: &'static str) -> Result<(), ExpressionError> {
        if self.matches(token) {
            Ok(())
        } else {
            let current = self.current();
            Err(ExpressionError::UnexpectedToken {
                expected,
                found: describe(current.token),
                position: current.position,
            })
        }
    }

    /// Ensures the parser is at end-of-input.
    fn expect_eof(&self) -> Result<(), ExpressionError> {
        let current = self.current();
        if current.token == Token::Eof {
            Ok(())
        } else {
            Err(ExpressionError::UnexpectedToken {
                expected: "end of expression",
                found: describe(current.token),
                position: current.position,
            })
        }
    }

    /// Consumes the token if it matches the expected kind.
    fn matches(&mut self, kind: Token<'_>) -> bool {
        if std::mem::discriminant(&self.current().token) == std::mem::discriminant(&kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Returns the current token; the stream always ends with `Eof`.
    fn current(&self) -> SpannedToken<'a> {
        self.tokens.get(self.index).or_else(|| self.tokens.last()).copied().unwrap_or(
            SpannedToken {
                token: Token::Eof,
                position: 0,
            },
        )
    }

    /// Advances to the next token, stopping at `Eof`.
    const fn advance(&mut self) {
        if self.index + 1 < self.tokens.len() {
            self.index += 1;
        }
    }
}

/// Collapses a single-element list to its element, else builds a node.
fn collapse(
    mut parts: Vec<RseExpression>,
    build: fn(Vec<RseExpression>) -> RseExpression,
) -> RseExpression {
    if parts.len() == 1 { parts.remove(0) } else { build(parts) }
}

/// Parses a numeric comparison operand.
fn parse_bound(raw: &str, position: usize) -> Result<f64, ExpressionError> {
    raw.parse::<f64>().ok().filter(|value| value.is_finite()).ok_or_else(|| {
        ExpressionError::InvalidNumber {
            raw: raw.to_string(),
            position,
        }
    })
}

/// Formats a token for diagnostics.
fn describe(token: Token<'_>) -> String {
    match token {
        Token::Ident(value) => value.to_string(),
        Token::Eq => "=".to_string(),
        Token::NotEq => "!=".to_string(),
        Token::Lt => "<".to_string(),
        Token::Gt => ">".to_string(),
        Token::And => "&".to_string(),
        Token::Or => "|".to_string(),
        Token::Diff => "\\".to_string(),
        Token::Not => "!".to_string(),
        Token::Star => "*".to_string(),
        Token::LParen => "(".to_string(),
        Token::RParen => ")".to_string(),
        Token::Eof => "end of input".to_string(),
    }
}
