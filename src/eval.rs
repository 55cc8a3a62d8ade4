use std::collections::HashMap;

use log::trace;
use serde::Serialize;

use crate::context::ContextAttributes;
use crate::feature::{ResolvedFeature, StrategyValue};
use crate::feature_value::FeatureValue;
use crate::percentage::{PercentageCalculator, MAX_PERCENTAGE};
use crate::strategy::RolloutStrategy;

/// Evaluate a feature's rollout strategies for the given context attributes.
///
/// Strategies are tried in declaration order and the first match wins. Percentage-only strategies
/// sharing a percentage key claim consecutive, non-overlapping slices of the bucket range; a
/// strategy that also carries attributes matches when every attribute holds and the bucket falls
/// below its own percentage. When nothing matches, the feature's base value is returned.
///
/// This is a pure function of its inputs. Malformed strategies never match and never panic.
pub fn evaluate<'a>(
    feature: &'a ResolvedFeature,
    context: &ContextAttributes,
    calculator: &dyn PercentageCalculator,
) -> Detail<&'a FeatureValue> {
    let strategies = feature.strategies();
    if strategies.is_empty() {
        return Detail::base(feature);
    }

    let mut buckets = Buckets::new(feature.definition.feature_value_id(), calculator);

    for (index, strategy) in strategies.iter().enumerate() {
        if !buckets.strategy_matches(strategy, context) {
            continue;
        }

        let reason = Reason::StrategyMatch {
            strategy_index: index,
            strategy_id: strategy.id.clone(),
        };
        match feature.strategy_value(index) {
            Some(StrategyValue::Override(value)) => {
                trace!("feature {} matched strategy {}", feature.key(), index);
                return Detail {
                    value: Some(value),
                    reason,
                };
            }
            Some(StrategyValue::Inherit) | None => {
                return Detail {
                    value: feature.value.as_ref(),
                    reason,
                };
            }
            Some(StrategyValue::Malformed) => {
                trace!(
                    "feature {} matched strategy {} but its value is unusable",
                    feature.key(),
                    index
                );
            }
        }
    }

    Detail::base(feature)
}

/// Per-evaluation bucketing state: each distinct percentage key is hashed once, and tracks how
/// much of its range earlier percentage-only strategies have claimed.
struct Buckets<'a> {
    feature_value_id: &'a str,
    calculator: &'a dyn PercentageCalculator,
    by_key: HashMap<String, KeyBucket>,
}

struct KeyBucket {
    bucket: u32,
    claimed: u32,
}

impl<'a> Buckets<'a> {
    fn new(feature_value_id: &'a str, calculator: &'a dyn PercentageCalculator) -> Self {
        Buckets {
            feature_value_id,
            calculator,
            by_key: HashMap::new(),
        }
    }

    fn strategy_matches(&mut self, strategy: &RolloutStrategy, context: &ContextAttributes) -> bool {
        let Some(percentage) = strategy.effective_percentage() else {
            return strategy.has_attributes() && strategy.matches_attributes(context);
        };
        // out of range percentages are clamped rather than rejected
        let percentage = percentage.clamp(0, MAX_PERCENTAGE as i64) as u32;

        let Some(key) = strategy.percentage_key(context) else {
            trace!("no percentage key in context, skipping strategy {:?}", strategy.name);
            return false;
        };
        let feature_value_id = self.feature_value_id;
        let calculator = self.calculator;
        let slot = self.by_key.entry(key).or_insert_with_key(|key| KeyBucket {
            bucket: calculator.determine_client_percentage(key, feature_value_id),
            claimed: 0,
        });

        if strategy.has_attributes() {
            return slot.bucket < percentage && strategy.matches_attributes(context);
        }

        let lower = slot.claimed;
        let upper = lower.saturating_add(percentage);
        slot.claimed = upper;
        lower <= slot.bucket && slot.bucket < upper
    }
}

/// The result of evaluating a feature: the value (if any) and why it was chosen.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Detail<T> {
    /// The resolved value, or None if the feature has no value for this evaluation.
    pub value: Option<T>,

    /// A reason describing the main factor that influenced the value.
    pub reason: Reason,
}

impl<'a> Detail<&'a FeatureValue> {
    fn base(feature: &'a ResolvedFeature) -> Self {
        Detail {
            value: feature.value.as_ref(),
            reason: Reason::Default,
        }
    }
}

impl<T> Detail<T> {
    /// Returns a detail with value of None.
    pub fn empty(reason: Reason) -> Detail<T> {
        Detail {
            value: None,
            reason,
        }
    }

    /// Returns a detail response using the provided error as the [Detail::reason].
    pub fn err(error: EvalError) -> Detail<T> {
        Detail::empty(Reason::Error { error })
    }

    /// Returns a new instance of this detail with the provided function `f` applied to
    /// [Detail::value].
    pub fn map<U, F>(self, f: F) -> Detail<U>
    where
        F: FnOnce(T) -> U,
    {
        Detail {
            value: self.value.map(f),
            reason: self.reason,
        }
    }

    /// Applies `f` to the value if there is one. If `f` rejects the value, the result carries no
    /// value and the reason becomes the error `e`.
    pub fn try_map<U, F>(self, f: F, e: EvalError) -> Detail<U>
    where
        F: FnOnce(T) -> Option<U>,
    {
        match self.value {
            None => Detail::empty(self.reason),
            Some(v) => match f(v) {
                Some(v) => Detail {
                    value: Some(v),
                    reason: self.reason,
                },
                None => Detail::err(e),
            },
        }
    }

    /// Sets the [Detail::reason] to the provided error if the current detail instance does not
    /// have a value set.
    pub fn should_have_value(mut self, e: EvalError) -> Detail<T> {
        if self.value.is_none() {
            self.reason = Reason::Error { error: e };
        }
        self
    }
}

/// Reason describes why an evaluation produced a particular value.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "kind")]
pub enum Reason {
    /// No strategy matched, or there was no context to match against; the base value was used.
    Default,
    /// The context matched one of the feature's rollout strategies.
    #[serde(rename_all = "camelCase")]
    StrategyMatch {
        /// Zero-based index of the matched [crate::RolloutStrategy].
        strategy_index: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        strategy_id: Option<String>,
    },
    /// A registered value interceptor supplied the value.
    Intercepted,
    /// The feature could not be read; the value is unset.
    Error {
        #[serde(rename = "errorKind")]
        error: EvalError,
    },
}

/// Explains a [Reason::Error].
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvalError {
    /// The key has never been delivered by the server, or has been deleted.
    FeatureNotFound,
    /// The value was not of the requested type, e.g. a string was read from a boolean feature.
    WrongType,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::FeatureDefinition;
    use crate::feature_value::FeatureValue::{Bool, Str};
    use crate::percentage::Murmur3PercentageCalculator;
    use crate::strategy::{Conditional, FieldType, RolloutStrategyAttribute};
    use crate::test_common;
    use assert_json_diff::assert_json_eq;
    use proptest::prelude::*;
    use serde_json::json;
    use spectral::prelude::*;
    use test_case::test_case;

    struct FixedBucket(u32);

    impl PercentageCalculator for FixedBucket {
        fn determine_client_percentage(&self, _percentage_key: &str, _feature_value_id: &str) -> u32 {
            self.0
        }
    }

    fn resolved(json: &str) -> ResolvedFeature {
        let def: FeatureDefinition = serde_json::from_str(json).unwrap();
        ResolvedFeature::resolve(def).unwrap()
    }

    fn user(key: &str) -> ContextAttributes {
        let mut ctx = ContextAttributes::default();
        ctx.set("userkey", key);
        ctx
    }

    #[test]
    fn no_strategies_returns_base() {
        let feature = resolved(test_common::F1_FEATURE);
        let detail = evaluate(&feature, &ContextAttributes::default(), &Murmur3PercentageCalculator);
        assert_that!(detail.value).contains_value(&Bool(false));
        assert_that!(detail.reason).is_equal_to(&Reason::Default);
    }

    #[test_case(250_000, "A-value", Some(0))]
    #[test_case(299_999, "A-value", Some(0))]
    #[test_case(300_000, "B-value", Some(1))]
    #[test_case(950_000, "B-value", Some(1))]
    fn contiguous_percentage_slices(bucket: u32, expect: &str, index: Option<usize>) {
        let feature = resolved(test_common::F2_FEATURE);
        let detail = evaluate(&feature, &user("u1"), &FixedBucket(bucket));
        assert_that!(detail.value).contains_value(&Str(expect.into()));
        assert_eq!(
            detail.reason,
            Reason::StrategyMatch {
                strategy_index: index.unwrap(),
                strategy_id: Some(if index == Some(0) { "sA" } else { "sB" }.to_string()),
            }
        );
    }

    #[test_case(250_000, "A-value")]
    #[test_case(899_999, "B-value")]
    #[test_case(900_000, "base")]
    #[test_case(950_000, "base")]
    fn gap_after_slices_returns_base(bucket: u32, expect: &str) {
        let feature = resolved(test_common::F2_GAP_FEATURE);
        let detail = evaluate(&feature, &user("u1"), &FixedBucket(bucket));
        assert_that!(detail.value).contains_value(&Str(expect.into()));
    }

    #[test]
    fn percentage_strategies_need_a_key() {
        let feature = resolved(test_common::F2_FEATURE);
        let detail = evaluate(&feature, &ContextAttributes::default(), &FixedBucket(0));
        assert_that!(detail.value).contains_value(&Str("base".into()));
        assert_that!(detail.reason).is_equal_to(&Reason::Default);
    }

    #[test]
    fn country_strategy() {
        let feature = resolved(test_common::F3_FEATURE);
        let calc = Murmur3PercentageCalculator;

        let mut nz = ContextAttributes::default();
        nz.set("country", "NZ");
        let mut au = ContextAttributes::default();
        au.set("country", "AU");

        assert_that!(evaluate(&feature, &nz, &calc).value).contains_value(&Str("kiwi".into()));
        assert_that!(evaluate(&feature, &au, &calc).value).contains_value(&Str("base".into()));
        assert_that!(evaluate(&feature, &ContextAttributes::default(), &calc).value)
            .contains_value(&Str("base".into()));
    }

    #[test]
    fn attributes_with_percentage_do_not_claim_slices() {
        let mut def: FeatureDefinition = serde_json::from_str(test_common::F2_GAP_FEATURE).unwrap();
        // an attribute strategy at the front must not shift the percentage-only slices
        def.strategies.insert(
            0,
            RolloutStrategy {
                id: Some("sNZ".into()),
                percentage: Some(500_000),
                value: Some(json!("nz-half")),
                attributes: vec![RolloutStrategyAttribute {
                    conditional: Some(Conditional::Equals),
                    field_name: Some("country".into()),
                    field_type: Some(FieldType::String),
                    values: vec!["NZ".into()],
                    ..Default::default()
                }],
                ..Default::default()
            },
        );
        let feature = ResolvedFeature::resolve(def).unwrap();

        let mut nz = user("u1");
        nz.set("country", "NZ");
        assert_that!(evaluate(&feature, &nz, &FixedBucket(100_000)).value)
            .contains_value(&Str("nz-half".into()));
        assert_that!(evaluate(&feature, &nz, &FixedBucket(600_000)).value)
            .contains_value(&Str("B-value".into()));
        assert_that!(evaluate(&feature, &user("u1"), &FixedBucket(100_000)).value)
            .contains_value(&Str("A-value".into()));
    }

    #[test]
    fn matched_strategy_without_value_inherits_base() {
        let mut def: FeatureDefinition = serde_json::from_str(test_common::F3_FEATURE).unwrap();
        def.strategies[0].value = None;
        let feature = ResolvedFeature::resolve(def).unwrap();
        let mut nz = ContextAttributes::default();
        nz.set("country", "NZ");

        let detail = evaluate(&feature, &nz, &Murmur3PercentageCalculator);
        assert_that!(detail.value).contains_value(&Str("base".into()));
        assert_eq!(
            detail.reason,
            Reason::StrategyMatch {
                strategy_index: 0,
                strategy_id: Some("sNZ".into())
            }
        );
    }

    #[test]
    fn malformed_strategy_consumes_slice_but_never_matches() {
        let def: FeatureDefinition = serde_json::from_value(json!({
            "key": "flag",
            "type": "BOOLEAN",
            "value": false,
            "version": 1,
            "strategies": [
                {"id": "bad", "percentage": 500000, "value": "maybe"},
                {"id": "good", "percentage": 500000, "value": true}
            ]
        }))
        .unwrap();
        let feature = ResolvedFeature::resolve(def).unwrap();

        assert_that!(evaluate(&feature, &user("u"), &FixedBucket(10)).value)
            .contains_value(&Bool(false));
        assert_that!(evaluate(&feature, &user("u"), &FixedBucket(700_000)).value)
            .contains_value(&Bool(true));
    }

    #[test]
    fn strategy_with_neither_percentage_nor_attributes_never_matches() {
        let mut def = FeatureDefinition::new("x", crate::FeatureValueType::Boolean);
        def.value = Some(json!(false));
        def.strategies.push(RolloutStrategy {
            value: Some(json!(true)),
            percentage: Some(0),
            ..Default::default()
        });
        let feature = ResolvedFeature::resolve(def).unwrap();
        assert_that!(evaluate(&feature, &user("u"), &FixedBucket(0)).value)
            .contains_value(&Bool(false));
    }

    #[test]
    fn reason_serialization() {
        assert_json_eq!(
            serde_json::to_value(Reason::StrategyMatch {
                strategy_index: 2,
                strategy_id: Some("s".into())
            })
            .unwrap(),
            json!({"kind": "STRATEGY_MATCH", "strategyIndex": 2, "strategyId": "s"})
        );
        assert_json_eq!(
            serde_json::to_value(Reason::Error {
                error: EvalError::WrongType
            })
            .unwrap(),
            json!({"kind": "ERROR", "errorKind": "WRONG_TYPE"})
        );
    }

    #[test]
    fn detail_helpers() {
        let detail: Detail<i32> = Detail {
            value: Some(4),
            reason: Reason::Default,
        };
        assert_that!(detail.clone().map(|v| v * 2).value).contains_value(8);
        let rejected = detail.try_map(|_| None::<i32>, EvalError::WrongType);
        assert_that!(rejected.value).is_none();
        assert_eq!(
            rejected.reason,
            Reason::Error {
                error: EvalError::WrongType
            }
        );
        let unset: Detail<i32> = Detail::empty(Reason::Default);
        assert_eq!(
            unset.should_have_value(EvalError::FeatureNotFound).reason,
            Reason::Error {
                error: EvalError::FeatureNotFound
            }
        );
    }

    prop_compose! {
        // sorted cut points split the range into consecutive percentage-only slices
        fn slices()(mut cuts in prop::collection::vec(0..=MAX_PERCENTAGE, 1..6)) -> Vec<(u32, u32)> {
            cuts.sort_unstable();
            let mut lower = 0;
            cuts.into_iter()
                .map(|upper| {
                    let slice = (lower, upper);
                    lower = upper;
                    slice
                })
                .collect()
        }
    }

    fn sliced_feature(slices: &[(u32, u32)]) -> ResolvedFeature {
        let strategies: Vec<_> = slices
            .iter()
            .enumerate()
            .map(|(i, (lower, upper))| {
                json!({"id": format!("s{}", i), "percentage": upper - lower, "value": format!("v{}", i)})
            })
            .collect();
        let def: FeatureDefinition = serde_json::from_value(json!({
            "key": "sliced",
            "type": "STRING",
            "value": "base",
            "version": 1,
            "strategies": strategies
        }))
        .unwrap();
        ResolvedFeature::resolve(def).unwrap()
    }

    proptest! {
        #[test]
        fn every_bucket_lands_in_at_most_one_slice(
            slices in slices(),
            bucket in 0..MAX_PERCENTAGE,
        ) {
            let feature = sliced_feature(&slices);
            let detail = evaluate(&feature, &user("u"), &FixedBucket(bucket));

            let owners: Vec<usize> = slices
                .iter()
                .enumerate()
                .filter(|(_, (lower, upper))| *lower <= bucket && bucket < *upper)
                .map(|(i, _)| i)
                .collect();
            prop_assert!(owners.len() <= 1);

            match owners.first() {
                Some(i) => prop_assert_eq!(detail.value.cloned(), Some(Str(format!("v{}", i)))),
                None => prop_assert_eq!(detail.value.cloned(), Some(Str("base".into()))),
            }
        }

        #[test]
        fn evaluation_is_deterministic(key in "[a-zA-Z0-9]{1,20}", country in "[A-Z]{2}") {
            let feature = resolved(test_common::F2_GAP_FEATURE);
            let mut ctx = user(&key);
            ctx.set("country", country);
            let first = evaluate(&feature, &ctx, &Murmur3PercentageCalculator);
            let second = evaluate(&feature, &ctx, &Murmur3PercentageCalculator);
            prop_assert_eq!(first, second);
        }
    }
}
