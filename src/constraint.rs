//! Constraint builder: translates caller matchers into engine predicates.
//!
//! Every matcher maps to one [`Constraint`], except a matcher that provably matches
//! every value (`=~".*"`), which is dropped. Regexes are fully anchored and `.` also
//! matches `\n`, so `.*` and `.+` shortcuts agree with the compiled pattern. Patterns
//! that are plain literals, or alternations of plain literals, are rewritten to
//! equality or set membership so that row-group statistics can still prune them.

use crate::error::QueryError;
use crate::matcher::{MatchType, Matcher};

use regex::Regex;
use std::collections::BTreeSet;
use std::fmt;

/// Default maximum accepted regex pattern length.
pub const DEFAULT_MAX_REGEX_LEN: usize = 4096;

/// Value predicate of a constraint, before negation.
#[derive(Clone)]
pub enum Predicate {
    /// `value == v`. `Equal("")` matches absent labels.
    Equal(String),
    /// `value ∈ set`.
    In(BTreeSet<String>),
    /// Anchored regex match over the decoded value (absent ≡ "").
    Regex(Regex),
    /// `value != ""`, i.e. the label is present.
    Present,
}

impl Predicate {
    #[inline]
    pub fn matches(&self, value: &str) -> bool {
        match self {
            Predicate::Equal(v) => v == value,
            Predicate::In(set) => set.contains(value),
            Predicate::Regex(re) => re.is_match(value),
            Predicate::Present => !value.is_empty(),
        }
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Equal(v) => f.debug_tuple("Equal").field(v).finish(),
            Predicate::In(set) => f.debug_tuple("In").field(set).finish(),
            Predicate::Regex(re) => f.debug_tuple("Regex").field(&re.as_str()).finish(),
            Predicate::Present => f.write_str("Present"),
        }
    }
}

/// An unbound predicate over one label.
#[derive(Debug, Clone)]
pub struct Constraint {
    pub label: String,
    pub predicate: Predicate,
    pub negated: bool,
}

impl Constraint {
    /// Evaluates the constraint against a decoded value; pass `""` for an absent label.
    #[inline]
    pub fn matches(&self, value: &str) -> bool {
        self.predicate.matches(value) != self.negated
    }

    /// Relative I/O cost rank; lower ranks are evaluated first.
    ///
    /// Positive equality and set membership can be pruned from statistics and
    /// dictionaries, presence from null counts; everything else needs decoded values.
    pub fn cost(&self) -> u8 {
        match (&self.predicate, self.negated) {
            (Predicate::Equal(_), false) => 1,
            (Predicate::In(_), false) => 2,
            (Predicate::Present, _) => 3,
            (Predicate::Equal(_), true) | (Predicate::In(_), true) => 4,
            (Predicate::Regex(_), _) => 5,
        }
    }
}

/// Translates matchers into constraints.
#[derive(Debug, Clone)]
pub struct ConstraintBuilder {
    max_regex_len: usize,
}

impl Default for ConstraintBuilder {
    fn default() -> Self {
        Self {
            max_regex_len: DEFAULT_MAX_REGEX_LEN,
        }
    }
}

impl ConstraintBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects regex patterns longer than `len` bytes. `0` disables the check.
    pub fn with_max_regex_len(mut self, len: usize) -> Self {
        self.max_regex_len = len;
        self
    }

    /// Builds one constraint per matcher. Fails before any I/O on an invalid pattern.
    pub fn build(&self, matchers: &[Matcher]) -> Result<Vec<Constraint>, QueryError> {
        let mut out = Vec::with_capacity(matchers.len());
        for m in matchers {
            if let Some(c) = self.translate(m)? {
                out.push(c);
            }
        }
        Ok(out)
    }

    fn translate(&self, m: &Matcher) -> Result<Option<Constraint>, QueryError> {
        let constraint = |predicate, negated| {
            Some(Constraint {
                label: m.name.clone(),
                predicate,
                negated,
            })
        };

        match m.match_type {
            MatchType::Equal => Ok(constraint(Predicate::Equal(m.value.clone()), false)),
            MatchType::NotEqual if m.value.is_empty() => Ok(constraint(Predicate::Present, false)),
            MatchType::NotEqual => Ok(constraint(Predicate::Equal(m.value.clone()), true)),
            MatchType::Regex | MatchType::NotRegex => {
                let negated = m.match_type.is_negative();
                if m.value == ".*" && !negated {
                    return Ok(None);
                }
                let predicate = self.regex_predicate(m)?;
                Ok(constraint(predicate, negated))
            }
        }
    }

    fn regex_predicate(&self, m: &Matcher) -> Result<Predicate, QueryError> {
        let pattern = m.value.as_str();
        if self.max_regex_len > 0 && pattern.len() > self.max_regex_len {
            return Err(QueryError::InvalidMatcher {
                label: m.name.clone(),
                details: format!(
                    "regex pattern exceeds maximum length of {} bytes",
                    self.max_regex_len
                ),
            });
        }

        if pattern == ".+" {
            return Ok(Predicate::Present);
        }
        if is_literal(pattern) {
            return Ok(Predicate::Equal(pattern.to_string()));
        }
        if let Some(set) = literal_alternation(pattern) {
            return Ok(Predicate::In(set));
        }

        let anchored = format!("^(?s:{})$", pattern);
        let re = Regex::new(&anchored).map_err(|e| QueryError::InvalidMatcher {
            label: m.name.clone(),
            details: format!("invalid regex {:?}: {}", pattern, e),
        })?;
        Ok(Predicate::Regex(re))
    }
}

/// Translates matchers with default limits.
pub fn matchers_to_constraints(matchers: &[Matcher]) -> Result<Vec<Constraint>, QueryError> {
    ConstraintBuilder::default().build(matchers)
}

const REGEX_META: &[char] = &[
    '\\', '.', '+', '*', '?', '(', ')', '|', '[', ']', '{', '}', '^', '$',
];

fn is_literal(pattern: &str) -> bool {
    !pattern.contains(REGEX_META)
}

/// `a|b|c` where every branch is a literal.
fn literal_alternation(pattern: &str) -> Option<BTreeSet<String>> {
    if !pattern.contains('|') {
        return None;
    }
    let mut set = BTreeSet::new();
    for branch in pattern.split('|') {
        if !is_literal(branch) {
            return None;
        }
        set.insert(branch.to_string());
    }
    Some(set)
}
