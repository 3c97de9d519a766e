//! Predicate types and evaluation for entry conditions and condition steps.
//!
//! Unknown or missing fields never raise: a clause over an absent field
//! evaluates to `false` (except `IsNotSet`), so the step graph always has a
//! total transition function.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredicateGroup {
    pub operator: LogicalOperator,
    pub clauses: Vec<Clause>,
    #[serde(default)]
    pub groups: Vec<PredicateGroup>,
}

impl Default for PredicateGroup {
    fn default() -> Self {
        Self {
            operator: LogicalOperator::And,
            clauses: Vec::new(),
            groups: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalOperator {
    And,
    Or,
}

/// A single field/operator/value comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Clause {
    pub field: String,
    pub operator: ComparisonOperator,
    #[serde(default)]
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOperator {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    IsSet,
    IsNotSet,
    InList,
    NotInList,
}

impl PredicateGroup {
    pub fn single(field: &str, operator: ComparisonOperator, value: serde_json::Value) -> Self {
        Self {
            operator: LogicalOperator::And,
            clauses: vec![Clause {
                field: field.to_string(),
                operator,
                value,
            }],
            groups: Vec::new(),
        }
    }

    /// Evaluates the group against a flat JSON context object.
    pub fn evaluate(&self, context: &serde_json::Value) -> bool {
        let clause_results = self.clauses.iter().map(|c| c.evaluate(context));
        let group_results = self.groups.iter().map(|g| g.evaluate(context));
        let mut all = clause_results.chain(group_results).peekable();

        // An empty group matches everything.
        if all.peek().is_none() {
            return true;
        }
        match self.operator {
            LogicalOperator::And => all.all(|r| r),
            LogicalOperator::Or => all.any(|r| r),
        }
    }
}

impl Clause {
    pub fn evaluate(&self, context: &serde_json::Value) -> bool {
        let actual = context.as_object().and_then(|obj| obj.get(&self.field));
        match actual {
            Some(actual) => compare_values(actual, &self.operator, &self.value),
            // Missing field: only "is not set" holds.
            None => self.operator == ComparisonOperator::IsNotSet,
        }
    }
}

#[allow(clippy::unnecessary_map_or)]
pub fn compare_values(
    actual: &serde_json::Value,
    operator: &ComparisonOperator,
    expected: &serde_json::Value,
) -> bool {
    match operator {
        ComparisonOperator::Equals => actual == expected,
        ComparisonOperator::NotEquals => actual != expected,
        ComparisonOperator::GreaterThan => {
            numeric_cmp(actual, expected).map_or(false, |o| o == std::cmp::Ordering::Greater)
        }
        ComparisonOperator::GreaterThanOrEqual => {
            numeric_cmp(actual, expected).map_or(false, |o| o != std::cmp::Ordering::Less)
        }
        ComparisonOperator::LessThan => {
            numeric_cmp(actual, expected).map_or(false, |o| o == std::cmp::Ordering::Less)
        }
        ComparisonOperator::LessThanOrEqual => {
            numeric_cmp(actual, expected).map_or(false, |o| o != std::cmp::Ordering::Greater)
        }
        ComparisonOperator::Contains => actual
            .as_str()
            .zip(expected.as_str())
            .map_or(false, |(a, e)| a.contains(e)),
        ComparisonOperator::NotContains => actual
            .as_str()
            .zip(expected.as_str())
            .map_or(true, |(a, e)| !a.contains(e)),
        ComparisonOperator::StartsWith => actual
            .as_str()
            .zip(expected.as_str())
            .map_or(false, |(a, e)| a.starts_with(e)),
        ComparisonOperator::EndsWith => actual
            .as_str()
            .zip(expected.as_str())
            .map_or(false, |(a, e)| a.ends_with(e)),
        ComparisonOperator::IsSet => !actual.is_null(),
        ComparisonOperator::IsNotSet => actual.is_null(),
        ComparisonOperator::InList => expected
            .as_array()
            .map_or(false, |list| list.contains(actual)),
        ComparisonOperator::NotInList => expected
            .as_array()
            .map_or(true, |list| !list.contains(actual)),
    }
}

fn numeric_cmp(a: &serde_json::Value, b: &serde_json::Value) -> Option<std::cmp::Ordering> {
    let a_num = a.as_f64()?;
    let b_num = b.as_f64()?;
    a_num.partial_cmp(&b_num)
}
