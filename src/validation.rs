use serde::Serialize;

use crate::attribute_value::AttributeValue;
use crate::percentage::MAX_PERCENTAGE;
use crate::strategy::{FieldType, RolloutStrategy, RolloutStrategyAttribute};

const MAX_NAME_LENGTH: usize = 200;

/// A problem with a single strategy or one of its attributes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationType {
    NoName,
    NameTooLong,
    /// Neither attributes nor a percentage, so the strategy can never match.
    EmptyMatchCriteria,
    NegativePercentage,
    #[serde(rename = "PERCENTAGE_OVER_100_PERCENT")]
    PercentageOver100Percent,
    ArrayAttributeNoValues,
    AttrMissingConditional,
    AttrMissingFieldName,
    AttrMissingFieldType,
    AttrValNotSemanticVersion,
    AttrValNotNumber,
    AttrValNotDate,
    AttrValNotDateTime,
    AttrValNotCidr,
}

/// A problem with a strategy list as a whole.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CollectionViolationType {
    #[serde(rename = "PERCENTAGE_ADDS_OVER_100_PERCENT")]
    PercentageAddsOver100Percent,
}

#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyViolation {
    pub strategy_index: usize,
    pub strategy_id: Option<String>,
    pub violation: ViolationType,
    /// Set when the violation concerns one attribute of the strategy.
    pub attribute_id: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationFailure {
    pub violations: Vec<StrategyViolation>,
    pub collection_violations: Vec<CollectionViolationType>,
}

impl ValidationFailure {
    pub fn is_empty(&self) -> bool {
        self.violations.is_empty() && self.collection_violations.is_empty()
    }

    pub fn has(&self, violation: ViolationType) -> bool {
        self.violations.iter().any(|v| v.violation == violation)
    }

    pub fn has_collection(&self, violation: CollectionViolationType) -> bool {
        self.collection_violations.contains(&violation)
    }

    fn add(&mut self, index: usize, strategy: &RolloutStrategy, violation: ViolationType) {
        self.violations.push(StrategyViolation {
            strategy_index: index,
            strategy_id: strategy.id.clone(),
            violation,
            attribute_id: None,
        });
    }

    fn add_attribute(
        &mut self,
        index: usize,
        strategy: &RolloutStrategy,
        attribute: &RolloutStrategyAttribute,
        violation: ViolationType,
    ) {
        self.violations.push(StrategyViolation {
            strategy_index: index,
            strategy_id: strategy.id.clone(),
            violation,
            attribute_id: attribute.id.clone(),
        });
    }
}

/// Checks the structural rules a feature's strategy list must satisfy before it is accepted.
///
/// Evaluation never relies on these holding: a strategy that breaks them simply fails to match.
pub fn validate_strategies(strategies: &[RolloutStrategy]) -> ValidationFailure {
    let mut failure = ValidationFailure::default();

    for (index, strategy) in strategies.iter().enumerate() {
        match strategy.name.as_deref().map(str::trim) {
            None | Some("") => failure.add(index, strategy, ViolationType::NoName),
            Some(name) if name.chars().count() > MAX_NAME_LENGTH => {
                failure.add(index, strategy, ViolationType::NameTooLong)
            }
            Some(_) => {}
        }

        match strategy.percentage {
            Some(p) if p < 0 => failure.add(index, strategy, ViolationType::NegativePercentage),
            Some(p) if p > MAX_PERCENTAGE as i64 => {
                failure.add(index, strategy, ViolationType::PercentageOver100Percent)
            }
            None if !strategy.has_attributes() => {
                failure.add(index, strategy, ViolationType::EmptyMatchCriteria)
            }
            _ => {}
        }

        for attribute in &strategy.attributes {
            validate_attribute(&mut failure, index, strategy, attribute);
        }
    }

    let total: i64 = strategies
        .iter()
        .filter(|s| !s.has_attributes())
        .filter_map(|s| s.percentage)
        .sum();
    if total > MAX_PERCENTAGE as i64 {
        failure
            .collection_violations
            .push(CollectionViolationType::PercentageAddsOver100Percent);
    }

    failure
}

fn validate_attribute(
    failure: &mut ValidationFailure,
    index: usize,
    strategy: &RolloutStrategy,
    attribute: &RolloutStrategyAttribute,
) {
    let mut report = |violation| failure.add_attribute(index, strategy, attribute, violation);

    if attribute.conditional.is_none() {
        report(ViolationType::AttrMissingConditional);
    }
    if attribute.field_name.is_none() {
        report(ViolationType::AttrMissingFieldName);
    }

    let has_nulls = attribute.values.iter().any(AttributeValue::is_null);
    let comparands: Vec<&AttributeValue> = attribute.comparands().collect();
    if comparands.is_empty() {
        report(ViolationType::ArrayAttributeNoValues);
    }

    let (valid, violation): (fn(&AttributeValue) -> bool, ViolationType) = match attribute.field_type {
        None => {
            report(ViolationType::AttrMissingFieldType);
            return;
        }
        Some(FieldType::SemanticVersion) => (is_semver, ViolationType::AttrValNotSemanticVersion),
        Some(FieldType::Number) => (is_number, ViolationType::AttrValNotNumber),
        Some(FieldType::Date) => (is_date, ViolationType::AttrValNotDate),
        Some(FieldType::Datetime) => (is_datetime, ViolationType::AttrValNotDateTime),
        Some(FieldType::IpAddress) => (is_cidr, ViolationType::AttrValNotCidr),
        Some(FieldType::String) | Some(FieldType::Boolean) | Some(FieldType::Unknown) => return,
    };

    if has_nulls || !comparands.into_iter().all(valid) {
        report(violation);
    }
}

// strict semver here; evaluation also accepts short forms like "1.2"
fn is_semver(v: &AttributeValue) -> bool {
    v.as_str()
        .map(|s| semver::Version::parse(s.trim()).is_ok())
        .unwrap_or(false)
}

fn is_number(v: &AttributeValue) -> bool {
    v.to_f64().is_some()
}

fn is_date(v: &AttributeValue) -> bool {
    v.to_date().is_some()
}

fn is_datetime(v: &AttributeValue) -> bool {
    v.to_datetime().is_some()
}

fn is_cidr(v: &AttributeValue) -> bool {
    v.to_ip_network().is_some()
}
