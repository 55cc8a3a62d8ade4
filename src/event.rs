use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::feature::FeatureDefinition;

/// The event types the edge sends down the update stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SseResultState {
    Ack,
    Bye,
    Failure,
    Features,
    Feature,
    DeleteFeature,
}

impl FromStr for SseResultState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ack" => Ok(SseResultState::Ack),
            "bye" => Ok(SseResultState::Bye),
            "failure" => Ok(SseResultState::Failure),
            "features" => Ok(SseResultState::Features),
            "feature" => Ok(SseResultState::Feature),
            "delete_feature" => Ok(SseResultState::DeleteFeature),
            _ => Err(Error::UnknownEvent(s.to_string())),
        }
    }
}

impl fmt::Display for SseResultState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SseResultState::Ack => "ack",
            SseResultState::Bye => "bye",
            SseResultState::Failure => "failure",
            SseResultState::Features => "features",
            SseResultState::Feature => "feature",
            SseResultState::DeleteFeature => "delete_feature",
        };
        f.write_str(name)
    }
}

/// Identifies the feature a delete event removes. The edge sends the whole feature, but only these
/// fields matter.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureRemoval {
    #[serde(default)]
    pub id: Option<String>,
    pub key: String,
    #[serde(default)]
    pub version: Option<i64>,
}

impl From<&str> for FeatureRemoval {
    fn from(key: &str) -> Self {
        FeatureRemoval {
            id: None,
            key: key.to_string(),
            version: None,
        }
    }
}

impl From<&FeatureDefinition> for FeatureRemoval {
    fn from(definition: &FeatureDefinition) -> Self {
        FeatureRemoval {
            id: definition.id.clone(),
            key: definition.key.clone(),
            version: Some(definition.version),
        }
    }
}

impl From<FeatureDefinition> for FeatureRemoval {
    fn from(definition: FeatureDefinition) -> Self {
        FeatureRemoval {
            id: definition.id,
            key: definition.key,
            version: Some(definition.version),
        }
    }
}

/// A decoded update event.
#[derive(Clone, Debug, PartialEq)]
pub enum UpdateEvent {
    Ack,
    Bye,
    Failure,
    /// A complete feature set.
    Features(Vec<FeatureDefinition>),
    Feature(FeatureDefinition),
    DeleteFeature(FeatureRemoval),
}

impl UpdateEvent {
    /// Decodes an event's JSON payload according to its type. Payloads of ack, bye and failure
    /// events are ignored.
    pub fn decode(state: SseResultState, data: &str) -> Result<UpdateEvent> {
        let malformed = |source| Error::MalformedEvent {
            state: state.to_string(),
            source,
        };
        Ok(match state {
            SseResultState::Ack => UpdateEvent::Ack,
            SseResultState::Bye => UpdateEvent::Bye,
            SseResultState::Failure => UpdateEvent::Failure,
            SseResultState::Features => {
                UpdateEvent::Features(serde_json::from_str(data).map_err(malformed)?)
            }
            SseResultState::Feature => {
                UpdateEvent::Feature(serde_json::from_str(data).map_err(malformed)?)
            }
            SseResultState::DeleteFeature => {
                UpdateEvent::DeleteFeature(serde_json::from_str(data).map_err(malformed)?)
            }
        })
    }

    pub fn state(&self) -> SseResultState {
        match self {
            UpdateEvent::Ack => SseResultState::Ack,
            UpdateEvent::Bye => SseResultState::Bye,
            UpdateEvent::Failure => SseResultState::Failure,
            UpdateEvent::Features(_) => SseResultState::Features,
            UpdateEvent::Feature(_) => SseResultState::Feature,
            UpdateEvent::DeleteFeature(_) => SseResultState::DeleteFeature,
        }
    }
}
