use chrono::{NaiveDate, Utc};
use itertools::Itertools;
use log::{debug, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::attribute_value::{
    parse_bool, parse_date, parse_datetime, parse_number, parse_semver, AttributeValue, IpNetwork,
};
use crate::context::ContextAttributes;
use crate::util::{is_false, null_as_default};

const DATE_FORMAT: &str = "%Y-%m-%d";
const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";
const NOW_ATTRIBUTE: &str = "now";
const MISSING_PERCENTAGE_ATTRIBUTE: &str = "<none>";

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Conditional {
    Equals,
    EndsWith,
    StartsWith,
    Greater,
    GreaterEquals,
    Less,
    LessEquals,
    NotEquals,
    Includes,
    Excludes,
    Regex,
    #[serde(other)]
    Unknown,
}

/// How both sides of a predicate are interpreted before comparing.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldType {
    String,
    SemanticVersion,
    Number,
    Date,
    Datetime,
    Boolean,
    IpAddress,
    #[serde(other)]
    Unknown,
}

/// One predicate of a strategy: `fieldName <conditional> values` under a declared field type.
#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RolloutStrategyAttribute {
    pub id: Option<String>,
    pub conditional: Option<Conditional>,
    pub field_name: Option<String>,
    #[serde(rename = "type")]
    pub field_type: Option<FieldType>,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub values: Vec<AttributeValue>,
    pub value: Option<AttributeValue>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub array: bool,
}

#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RolloutStrategy {
    pub id: Option<String>,
    pub name: Option<String>,
    /// Share of the population in millionths; absent for attribute-only strategies.
    pub percentage: Option<i64>,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub percentage_attributes: Vec<String>,
    pub value: Option<Value>,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub attributes: Vec<RolloutStrategyAttribute>,
}

impl RolloutStrategy {
    pub fn has_attributes(&self) -> bool {
        !self.attributes.is_empty()
    }

    /// The percentage, if this strategy participates in bucketing at all. Zero counts as absent.
    pub fn effective_percentage(&self) -> Option<i64> {
        self.percentage.filter(|p| *p != 0)
    }

    pub fn is_percentage_only(&self) -> bool {
        !self.has_attributes() && self.effective_percentage().is_some()
    }

    /// Rules match if _all_ of their attributes do.
    pub fn matches_attributes(&self, context: &ContextAttributes) -> bool {
        self.attributes.iter().all(|attr| attr.matches(context))
    }

    /// The key this strategy buckets on: either the `$`-joined values of its percentage
    /// attributes, or the context's default percentage key.
    pub fn percentage_key(&self, context: &ContextAttributes) -> Option<String> {
        if self.percentage_attributes.is_empty() {
            return context.percentage_key().map(str::to_owned);
        }
        Some(
            self.percentage_attributes
                .iter()
                .map(|name| context.first(name).unwrap_or(MISSING_PERCENTAGE_ATTRIBUTE))
                .join("$"),
        )
    }
}

impl Conditional {
    /// Splits a conditional into the positive operator to evaluate and whether to negate it.
    fn positive(self) -> (Conditional, bool) {
        match self {
            Conditional::NotEquals => (Conditional::Equals, true),
            Conditional::Excludes => (Conditional::Includes, true),
            op => (op, false),
        }
    }
}

fn maybe_negate(negate: bool, v: bool) -> bool {
    if negate {
        !v
    } else {
        v
    }
}

impl RolloutStrategyAttribute {
    /// The comparands to test against: the value list when present, otherwise the single value.
    /// Nulls are skipped and nested arrays flattened.
    pub fn comparands(&self) -> impl Iterator<Item = &AttributeValue> {
        let values = match &self.value {
            Some(value) if self.values.is_empty() => std::slice::from_ref(value),
            _ => self.values.as_slice(),
        };
        values
            .iter()
            .flat_map(|v| match v {
                AttributeValue::Array(inner) => inner.as_slice(),
                other => std::slice::from_ref(other),
            })
            .filter(|v| !v.is_null())
    }

    /// A predicate holds when any supplied context value matches any comparand. A missing context
    /// attribute fails the predicate whatever the operator.
    pub fn matches(&self, context: &ContextAttributes) -> bool {
        let (conditional, field_name, field_type) =
            match (self.conditional, &self.field_name, self.field_type) {
                (Some(c), Some(f), Some(t)) => (c, f, t),
                _ => {
                    debug!("strategy attribute {:?} is incomplete, not matching", self.id);
                    return false;
                }
            };

        let now: [String; 1];
        let supplied: &[String] = match context.get(field_name) {
            Some(values) if !values.is_empty() => values,
            _ => match now_value(field_name, field_type) {
                Some(v) => {
                    now = [v];
                    &now
                }
                None => return false,
            },
        };

        let (op, negate) = conditional.positive();
        if op == Conditional::Unknown || field_type == FieldType::Unknown {
            return false;
        }

        let any_match = supplied.iter().any(|supplied_v| {
            self.comparands()
                .any(|comparand| field_type.matches(op, supplied_v, comparand))
        });
        maybe_negate(negate, any_match)
    }
}

/// `now` is a virtual attribute for date comparisons when the context does not supply one.
fn now_value(field_name: &str, field_type: FieldType) -> Option<String> {
    if !field_name.eq_ignore_ascii_case(NOW_ATTRIBUTE) {
        return None;
    }
    match field_type {
        FieldType::Date => Some(Utc::now().format(DATE_FORMAT).to_string()),
        FieldType::Datetime => Some(Utc::now().format(DATETIME_FORMAT).to_string()),
        _ => None,
    }
}

impl FieldType {
    fn matches(&self, op: Conditional, supplied: &str, comparand: &AttributeValue) -> bool {
        match self {
            FieldType::String => comparand
                .to_text()
                .map(|c| string_op(op, supplied, &c))
                .unwrap_or(false),
            FieldType::Number => number_op(op, supplied, comparand),
            FieldType::Date => normalized_op(op, supplied, comparand, date_text),
            FieldType::Datetime => normalized_op(op, supplied, comparand, datetime_text),
            FieldType::SemanticVersion => semver_op(op, supplied, comparand),
            FieldType::Boolean => match op {
                Conditional::Equals => comparand
                    .to_bool()
                    .map(|c| parse_bool(supplied) == c)
                    .unwrap_or(false),
                _ => false,
            },
            FieldType::IpAddress => match op {
                Conditional::Equals | Conditional::Includes => {
                    match (
                        comparand.to_text().as_deref().and_then(IpNetwork::parse),
                        IpNetwork::parse(supplied),
                    ) {
                        (Some(network), Some(ip)) => network.contains(&ip),
                        _ => false,
                    }
                }
                _ => false,
            },
            FieldType::Unknown => false,
        }
    }
}

fn string_op(op: Conditional, supplied: &str, comparand: &str) -> bool {
    match op {
        Conditional::Equals => supplied == comparand,
        Conditional::EndsWith => supplied.ends_with(comparand),
        Conditional::StartsWith => supplied.starts_with(comparand),
        Conditional::Greater => supplied > comparand,
        Conditional::GreaterEquals => supplied >= comparand,
        Conditional::Less => supplied < comparand,
        Conditional::LessEquals => supplied <= comparand,
        Conditional::Includes => supplied.contains(comparand),
        Conditional::Regex => match Regex::new(comparand) {
            Ok(re) => re.is_match(supplied),
            Err(e) => {
                warn!("Invalid regex for REGEX conditional ({}): {}", e, comparand);
                false
            }
        },
        // negated operators are resolved before dispatch
        Conditional::NotEquals | Conditional::Excludes | Conditional::Unknown => false,
    }
}

fn number_op(op: Conditional, supplied: &str, comparand: &AttributeValue) -> bool {
    let ordering = |f: fn(f64, f64) -> bool| match (parse_number(supplied), comparand.to_f64()) {
        (Some(l), Some(r)) => f(l, r),
        _ => false,
    };
    match op {
        Conditional::Equals => ordering(|l, r| l == r),
        Conditional::Greater => ordering(|l, r| l > r),
        Conditional::GreaterEquals => ordering(|l, r| l >= r),
        Conditional::Less => ordering(|l, r| l < r),
        Conditional::LessEquals => ordering(|l, r| l <= r),
        Conditional::EndsWith
        | Conditional::StartsWith
        | Conditional::Includes
        | Conditional::Regex => comparand
            .to_text()
            .map(|c| string_op(op, supplied, &c))
            .unwrap_or(false),
        Conditional::NotEquals | Conditional::Excludes | Conditional::Unknown => false,
    }
}

fn date_text(s: &str) -> Option<String> {
    parse_date(s).map(|d: NaiveDate| d.format(DATE_FORMAT).to_string())
}

fn datetime_text(s: &str) -> Option<String> {
    parse_datetime(s).map(|dt| dt.format(DATETIME_FORMAT).to_string())
}

/// Dates compare as their canonical text, which orders the same way as the dates themselves.
/// A comparand that does not parse is compared as written.
fn normalized_op(
    op: Conditional,
    supplied: &str,
    comparand: &AttributeValue,
    normalize: fn(&str) -> Option<String>,
) -> bool {
    let Some(supplied) = normalize(supplied) else {
        return false;
    };
    match comparand.to_text() {
        Some(c) => {
            let c = normalize(&c).unwrap_or_else(|| c.into_owned());
            string_op(op, &supplied, &c)
        }
        None => false,
    }
}

fn semver_op(op: Conditional, supplied: &str, comparand: &AttributeValue) -> bool {
    let (Some(l), Some(r)) = (
        parse_semver(supplied),
        comparand.to_text().as_deref().and_then(parse_semver),
    ) else {
        return false;
    };
    match op {
        Conditional::Equals | Conditional::Includes => l == r,
        Conditional::Greater => l > r,
        Conditional::GreaterEquals => l >= r,
        Conditional::Less => l < r,
        Conditional::LessEquals => l <= r,
        _ => false,
    }
}
