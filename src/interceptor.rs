use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

/// What an interceptor says about a key: the value to use in textual form, or `None` to force the
/// feature to read as unset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValueMatch {
    pub value: Option<String>,
}

impl ValueMatch {
    pub fn new(value: impl Into<String>) -> Self {
        ValueMatch {
            value: Some(value.into()),
        }
    }

    pub fn unset() -> Self {
        ValueMatch { value: None }
    }
}

/// A local override consulted before server-delivered values, e.g. for testing or forcing a
/// feature on in development.
///
/// The text returned is interpreted as the feature's type: `"true"` (ignoring case) for booleans,
/// a decimal for numbers, and the document itself for JSON.
pub trait ValueInterceptor: Send + Sync {
    /// Returns `None` when this interceptor has no opinion about `key`.
    fn intercept(&self, key: &str) -> Option<ValueMatch>;
}

impl<F> ValueInterceptor for F
where
    F: Fn(&str) -> Option<ValueMatch> + Send + Sync,
{
    fn intercept(&self, key: &str) -> Option<ValueMatch> {
        self(key)
    }
}

/// A registered interceptor. Locked features ignore interceptors unless `allow_lock_override`.
pub(crate) struct InterceptorRegistration {
    pub(crate) allow_lock_override: bool,
    pub(crate) interceptor: Arc<dyn ValueInterceptor>,
}

/// An interceptor backed by an in-memory map. Cloning shares the map.
#[derive(Clone, Default)]
pub struct MapInterceptor {
    values: Arc<RwLock<HashMap<String, Option<String>>>>,
}

impl MapInterceptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) -> &Self {
        self.values.write().insert(key.into(), Some(value.into()));
        self
    }

    /// Forces `key` to read as unset.
    pub fn set_unset(&self, key: impl Into<String>) -> &Self {
        self.values.write().insert(key.into(), None);
        self
    }

    pub fn remove(&self, key: &str) -> bool {
        self.values.write().remove(key).is_some()
    }

    pub fn clear(&self) {
        self.values.write().clear();
    }
}

impl ValueInterceptor for MapInterceptor {
    fn intercept(&self, key: &str) -> Option<ValueMatch> {
        self.values
            .read()
            .get(key)
            .map(|value| ValueMatch { value: value.clone() })
    }
}
