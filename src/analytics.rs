use std::collections::HashMap;

use serde::Serialize;

use crate::feature::FeatureValueType;
use crate::feature_value::FeatureValue;

/// A feature's value as seen at the moment an analytics event was logged.
#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureSnapshot {
    pub id: Option<String>,
    pub key: String,
    #[serde(rename = "type")]
    pub value_type: FeatureValueType,
    pub value: Option<FeatureValue>,
    pub version: i64,
    #[serde(rename = "l")]
    pub locked: bool,
}

/// Receives analytics events along with a point-in-time snapshot of every set feature.
///
/// Collectors run on the repository's worker pool, after the snapshot has been taken.
pub trait AnalyticsCollector: Send + Sync {
    fn log_event(&self, action: &str, other: &HashMap<String, String>, features: &[FeatureSnapshot]);
}

impl<F> AnalyticsCollector for F
where
    F: Fn(&str, &HashMap<String, String>, &[FeatureSnapshot]) + Send + Sync,
{
    fn log_event(&self, action: &str, other: &HashMap<String, String>, features: &[FeatureSnapshot]) {
        self(action, other, features)
    }
}
