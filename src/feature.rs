use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::feature_value::FeatureValue;
use crate::strategy::RolloutStrategy;
use crate::util::is_false;

/// The type the server declared for a feature. It never changes over the life of a feature, and
/// is the sole authority on which typed getter can read it.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeatureValueType {
    Boolean,
    String,
    Number,
    Json,
}

/// A feature as delivered by the update stream.
#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FeatureDefinition {
    pub id: Option<String>,
    pub key: String,
    #[serde(rename = "type")]
    pub value_type: FeatureValueType,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub version: i64,
    #[serde(default, rename = "l", skip_serializing_if = "is_false")]
    pub locked: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub strategies: Vec<RolloutStrategy>,
}

/// Returned when a wire value cannot be read as the feature's declared type.
#[derive(Clone, Debug, PartialEq)]
pub struct MalformedValue {
    pub value_type: FeatureValueType,
    pub value: Value,
}

impl FeatureDefinition {
    pub fn new(key: impl Into<String>, value_type: FeatureValueType) -> Self {
        FeatureDefinition {
            id: None,
            key: key.into(),
            value_type,
            value: None,
            version: 0,
            locked: false,
            strategies: Vec::new(),
        }
    }

    /// The identifier mixed into percentage bucketing. Definitions without an id bucket on their
    /// key instead.
    pub fn feature_value_id(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.key)
    }

    /// Reads the base value as the declared type. A null or absent value is unset, which is not an
    /// error.
    pub fn resolved_value(&self) -> Result<Option<FeatureValue>, MalformedValue> {
        match &self.value {
            None | Some(Value::Null) => Ok(None),
            Some(v) => resolve_value(self.value_type, v).map(Some),
        }
    }
}

/// Converts a JSON wire value into a [FeatureValue] of the given type.
///
/// The server is lenient about scalar encodings, so booleans and numbers may also arrive as their
/// string forms. JSON features normally arrive as a string holding the document, but an inline
/// object or array is accepted and kept as its serialized text.
pub(crate) fn resolve_value(
    value_type: FeatureValueType,
    value: &Value,
) -> Result<FeatureValue, MalformedValue> {
    let malformed = || MalformedValue {
        value_type,
        value: value.clone(),
    };
    match (value_type, value) {
        (FeatureValueType::Boolean, Value::Bool(b)) => Ok(FeatureValue::Bool(*b)),
        (FeatureValueType::Boolean, Value::String(s)) => match s.as_str() {
            "true" => Ok(FeatureValue::Bool(true)),
            "false" => Ok(FeatureValue::Bool(false)),
            _ => Err(malformed()),
        },
        (FeatureValueType::String, Value::String(s)) => Ok(FeatureValue::Str(s.clone())),
        (FeatureValueType::String, Value::Number(n)) => Ok(FeatureValue::Str(n.to_string())),
        (FeatureValueType::String, Value::Bool(b)) => Ok(FeatureValue::Str(b.to_string())),
        (FeatureValueType::Number, Value::Number(n)) => {
            n.as_f64().map(FeatureValue::Number).ok_or_else(malformed)
        }
        (FeatureValueType::Number, Value::String(s)) => match s.trim().parse::<f64>() {
            Ok(f) if f.is_finite() => Ok(FeatureValue::Number(f)),
            _ => Err(malformed()),
        },
        (FeatureValueType::Json, Value::String(s)) => Ok(FeatureValue::Json(s.clone())),
        (FeatureValueType::Json, v @ (Value::Object(_) | Value::Array(_))) => {
            Ok(FeatureValue::Json(v.to_string()))
        }
        _ => Err(malformed()),
    }
}

/// A strategy override value after resolution against the declared type.
#[derive(Clone, Debug, PartialEq)]
pub enum StrategyValue {
    Override(FeatureValue),
    /// The strategy carries no value of its own, so a match yields the base value.
    Inherit,
    /// The strategy value could not be read as the declared type; the strategy never matches.
    Malformed,
}

/// A definition together with its values resolved once at apply time, so reads never reparse.
#[derive(Clone, Debug)]
pub struct ResolvedFeature {
    pub definition: FeatureDefinition,
    pub value: Option<FeatureValue>,
    pub(crate) strategy_values: Vec<StrategyValue>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ResolvedFeature {
    /// Resolves the base value and every strategy override. A malformed base value rejects the
    /// whole definition; a malformed strategy value only disables that strategy.
    pub fn resolve(definition: FeatureDefinition) -> Result<ResolvedFeature, MalformedValue> {
        let value = definition.resolved_value()?;
        let strategy_values = definition
            .strategies
            .iter()
            .map(|strategy| match &strategy.value {
                None | Some(Value::Null) => StrategyValue::Inherit,
                Some(v) => match resolve_value(definition.value_type, v) {
                    Ok(v) => StrategyValue::Override(v),
                    Err(_) => {
                        warn!(
                            "strategy {:?} of feature {} has a value that is not {:?}, ignoring it",
                            strategy.name, definition.key, definition.value_type
                        );
                        StrategyValue::Malformed
                    }
                },
            })
            .collect();

        Ok(ResolvedFeature {
            definition,
            value,
            strategy_values,
            deleted_at: None,
        })
    }

    /// Builds the tombstone left behind by a delete: the same definition with no value.
    pub(crate) fn tombstone(mut definition: FeatureDefinition, at: DateTime<Utc>) -> ResolvedFeature {
        definition.value = None;
        let strategy_values = vec![StrategyValue::Inherit; definition.strategies.len()];
        ResolvedFeature {
            definition,
            value: None,
            strategy_values,
            deleted_at: Some(at),
        }
    }

    pub fn key(&self) -> &str {
        &self.definition.key
    }

    pub fn version(&self) -> i64 {
        self.definition.version
    }

    pub fn value_type(&self) -> FeatureValueType {
        self.definition.value_type
    }

    pub fn is_locked(&self) -> bool {
        self.definition.locked
    }

    pub fn strategies(&self) -> &[RolloutStrategy] {
        &self.definition.strategies
    }

    pub(crate) fn strategy_value(&self, index: usize) -> Option<&StrategyValue> {
        self.strategy_values.get(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_common;
    use assert_json_diff::assert_json_eq;
    use serde_json::json;
    use spectral::prelude::*;
    use test_case::test_case;

    #[test]
    fn parse_wire_definition() {
        let def: FeatureDefinition = serde_json::from_str(test_common::F1_FEATURE).unwrap();
        assert_eq!(def.key, "f1");
        assert_eq!(def.value_type, FeatureValueType::Boolean);
        assert_eq!(def.version, 1);
        assert_that!(def.locked).is_false();
        assert_that!(def.strategies).is_empty();
        assert_that!(def.resolved_value()).is_ok_containing(Some(FeatureValue::Bool(false)));
    }

    #[test]
    fn locked_flag_uses_short_name() {
        let def: FeatureDefinition = serde_json::from_value(json!({
            "id": "abc",
            "key": "banner",
            "type": "STRING",
            "value": "hello",
            "version": 4,
            "l": true
        }))
        .unwrap();
        assert_that!(def.locked).is_true();
        assert_eq!(def.feature_value_id(), "abc");

        assert_json_eq!(
            serde_json::to_value(&def).unwrap(),
            json!({"id": "abc", "key": "banner", "type": "STRING", "value": "hello", "version": 4, "l": true})
        );
    }

    #[test]
    fn id_falls_back_to_key() {
        let def = FeatureDefinition::new("plain", FeatureValueType::String);
        assert_eq!(def.feature_value_id(), "plain");
    }

    #[test_case(FeatureValueType::Boolean, json!(true), FeatureValue::Bool(true))]
    #[test_case(FeatureValueType::Boolean, json!("false"), FeatureValue::Bool(false))]
    #[test_case(FeatureValueType::String, json!("x"), FeatureValue::Str("x".into()))]
    #[test_case(FeatureValueType::String, json!(12), FeatureValue::Str("12".into()))]
    #[test_case(FeatureValueType::Number, json!(12.5), FeatureValue::Number(12.5))]
    #[test_case(FeatureValueType::Number, json!("7"), FeatureValue::Number(7.0))]
    #[test_case(FeatureValueType::Json, json!("{\"a\":1}"), FeatureValue::Json("{\"a\":1}".into()))]
    #[test_case(FeatureValueType::Json, json!([1,2]), FeatureValue::Json("[1,2]".into()))]
    fn resolves_declared_type(value_type: FeatureValueType, wire: Value, expect: FeatureValue) {
        assert_that!(resolve_value(value_type, &wire)).is_ok_containing(expect);
    }

    #[test_case(FeatureValueType::Boolean, json!("yes"))]
    #[test_case(FeatureValueType::Boolean, json!(1))]
    #[test_case(FeatureValueType::Number, json!("seven"))]
    #[test_case(FeatureValueType::Number, json!(true))]
    #[test_case(FeatureValueType::String, json!({"a": 1}))]
    #[test_case(FeatureValueType::Json, json!(3))]
    fn rejects_malformed_values(value_type: FeatureValueType, wire: Value) {
        assert_that!(resolve_value(value_type, &wire)).is_err();
    }

    #[test]
    fn null_value_is_unset() {
        let mut def = FeatureDefinition::new("n", FeatureValueType::Number);
        def.value = Some(Value::Null);
        assert_that!(def.resolved_value()).is_ok_containing(None);
    }

    #[test]
    fn malformed_strategy_value_only_disables_that_strategy() {
        let def: FeatureDefinition = serde_json::from_value(json!({
            "key": "n",
            "type": "NUMBER",
            "value": 1,
            "version": 1,
            "strategies": [
                {"id": "s1", "name": "bad", "percentage": 1000, "value": "lots"},
                {"id": "s2", "name": "good", "percentage": 1000, "value": 2},
                {"id": "s3", "name": "inherit", "percentage": 1000}
            ]
        }))
        .unwrap();
        let resolved = ResolvedFeature::resolve(def).unwrap();
        assert_eq!(resolved.value, Some(FeatureValue::Number(1.0)));
        assert_eq!(resolved.strategy_value(0), Some(&StrategyValue::Malformed));
        assert_eq!(
            resolved.strategy_value(1),
            Some(&StrategyValue::Override(FeatureValue::Number(2.0)))
        );
        assert_eq!(resolved.strategy_value(2), Some(&StrategyValue::Inherit));
    }

    #[test]
    fn malformed_base_value_rejects_definition() {
        let mut def = FeatureDefinition::new("b", FeatureValueType::Boolean);
        def.value = Some(json!("perhaps"));
        assert_that!(ResolvedFeature::resolve(def)).is_err();
    }

    #[test]
    fn tombstone_has_no_value() {
        let def: FeatureDefinition = serde_json::from_str(test_common::F1_FEATURE).unwrap();
        let now = Utc::now();
        let tombstone = ResolvedFeature::tombstone(def, now);
        assert_that!(tombstone.value).is_none();
        assert_that!(tombstone.definition.value).is_none();
        assert_eq!(tombstone.deleted_at, Some(now));
    }
}
