//! The runtime core of a FeatureHub client: a thread-safe feature repository fed by an edge
//! connection, and the rollout strategy evaluation that decides which value a context sees.

mod analytics;
mod attribute_value;
mod config;
mod context;
mod edge;
mod error;
mod eval;
mod event;
mod executor;
mod feature;
mod feature_value;
mod holder;
mod interceptor;
mod listeners;
mod percentage;
mod readiness;
mod repository;
mod strategy;
mod test_common;
mod util;
mod validation;

pub use analytics::*;
pub use attribute_value::*;
pub use config::*;
pub use context::*;
pub use edge::*;
pub use error::{Error, Result};
pub use eval::*;
pub use event::*;
pub use executor::Executor;
pub use feature::*;
pub use feature_value::*;
pub use holder::*;
pub use interceptor::*;
pub use listeners::ListenerHandle;
pub use percentage::*;
pub use readiness::*;
pub use repository::*;
pub use strategy::*;
pub use validation::*;
