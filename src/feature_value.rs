use std::fmt;

use log::warn;
use serde::Serialize;

use crate::feature::FeatureValueType;
use crate::util::{f64_to_i64_safe, number_to_string};

/// The resolved value of a feature, tagged with the type the server declared for it.
///
/// JSON features keep their raw text: the server delivers them as a string and the caller picks
/// the type to decode into with [crate::FeatureState::get_json].
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Bool(bool),
    Str(String),
    Number(f64),
    Json(String),
}

impl From<bool> for FeatureValue {
    fn from(b: bool) -> FeatureValue {
        FeatureValue::Bool(b)
    }
}

impl From<String> for FeatureValue {
    fn from(s: String) -> FeatureValue {
        FeatureValue::Str(s)
    }
}

impl From<&str> for FeatureValue {
    fn from(s: &str) -> FeatureValue {
        FeatureValue::Str(s.to_owned())
    }
}

impl From<f64> for FeatureValue {
    fn from(f: f64) -> FeatureValue {
        FeatureValue::Number(f)
    }
}

impl From<i64> for FeatureValue {
    fn from(i: i64) -> FeatureValue {
        FeatureValue::Number(i as f64)
    }
}

impl fmt::Display for FeatureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureValue::Bool(b) => write!(f, "{}", b),
            FeatureValue::Str(s) | FeatureValue::Json(s) => f.write_str(s),
            FeatureValue::Number(n) => f.write_str(&number_to_string(*n)),
        }
    }
}

impl FeatureValue {
    /// Parses the textual form of a value into the requested type. Used for values supplied by
    /// interceptors, which are always strings.
    pub fn parse(value_type: FeatureValueType, text: &str) -> Option<FeatureValue> {
        match value_type {
            FeatureValueType::Boolean => Some(FeatureValue::Bool(text.eq_ignore_ascii_case("true"))),
            FeatureValueType::String => Some(FeatureValue::Str(text.to_owned())),
            FeatureValueType::Number => match text.trim().parse::<f64>() {
                Ok(n) if n.is_finite() => Some(FeatureValue::Number(n)),
                _ => {
                    warn!("unable to interpret '{}' as a number", text);
                    None
                }
            },
            FeatureValueType::Json => Some(FeatureValue::Json(text.to_owned())),
        }
    }

    pub fn value_type(&self) -> FeatureValueType {
        match self {
            FeatureValue::Bool(_) => FeatureValueType::Boolean,
            FeatureValue::Str(_) => FeatureValueType::String,
            FeatureValue::Number(_) => FeatureValueType::Number,
            FeatureValue::Json(_) => FeatureValueType::Json,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FeatureValue::Bool(b) => Some(*b),
            _ => {
                warn!("feature type is not boolean but {:?}", self);
                None
            }
        }
    }

    pub fn as_string(&self) -> Option<String> {
        match self {
            FeatureValue::Str(s) => Some(s.clone()),
            _ => {
                warn!("feature type is not string but {:?}", self);
                None
            }
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FeatureValue::Number(f) => Some(*f),
            _ => {
                warn!("feature type is not number but {:?}", self);
                None
            }
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FeatureValue::Number(f) => f64_to_i64_safe(*f),
            _ => None,
        }
    }

    pub fn as_raw_json(&self) -> Option<&str> {
        match self {
            FeatureValue::Json(s) => Some(s),
            _ => {
                warn!("feature type is not json but {:?}", self);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spectral::prelude::*;

    #[test]
    fn float_bounds() {
        let test_cases = vec![
            (1.99, Some(1)),
            (9007199254740990.0, Some(9007199254740990)),
            (9007199254740991.0, Some(9007199254740991)),
            (9007199254740992.0, None),
            (-1.99, Some(-1)),
            (-9007199254740991.0, Some(-9007199254740991)),
            (-9007199254740992.0, None),
        ];
        for (have, expect) in test_cases {
            assert_that!(FeatureValue::Number(have).as_i64()).is_equal_to(expect);
        }
    }

    #[test]
    fn wrong_type_accessors_are_unset() {
        let value = FeatureValue::Str("on".into());
        assert_that!(value.as_bool()).is_none();
        assert_that!(value.as_f64()).is_none();
        assert_that!(value.as_raw_json()).is_none();
        assert_that!(value.as_string()).contains_value("on".to_string());
    }

    #[test]
    fn parses_interceptor_text() {
        assert_that!(FeatureValue::parse(FeatureValueType::Boolean, "TRUE"))
            .contains_value(FeatureValue::Bool(true));
        assert_that!(FeatureValue::parse(FeatureValueType::Boolean, "yes"))
            .contains_value(FeatureValue::Bool(false));
        assert_that!(FeatureValue::parse(FeatureValueType::Number, " 12.5 "))
            .contains_value(FeatureValue::Number(12.5));
        assert_that!(FeatureValue::parse(FeatureValueType::Number, "twelve")).is_none();
        assert_that!(FeatureValue::parse(FeatureValueType::Json, r#"{"a":1}"#))
            .contains_value(FeatureValue::Json(r#"{"a":1}"#.into()));
    }

    #[test]
    fn display_matches_wire_text() {
        assert_eq!(FeatureValue::Number(3.0).to_string(), "3");
        assert_eq!(FeatureValue::Number(3.25).to_string(), "3.25");
        assert_eq!(FeatureValue::Bool(false).to_string(), "false");
        assert_eq!(FeatureValue::Json("[1]".into()).to_string(), "[1]");
    }
}
