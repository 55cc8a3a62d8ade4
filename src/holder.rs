use std::sync::Arc;

use log::warn;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;

use crate::analytics::FeatureSnapshot;
use crate::context::ContextAttributes;
use crate::error::{Error, Result};
use crate::eval::{self, Detail, EvalError, Reason};
use crate::feature::{FeatureValueType, ResolvedFeature};
use crate::feature_value::FeatureValue;
use crate::interceptor::{InterceptorRegistration, ValueMatch};
use crate::listeners::{ListenerHandle, ListenerList};
use crate::percentage::PercentageCalculator;

/// Called when a feature's value changes. Listeners registered through a context-bound
/// [FeatureState] receive a view bound to that context.
pub trait FeatureListener: Send + Sync {
    fn notify(&self, feature: &FeatureState<'_>);
}

impl<F> FeatureListener for F
where
    F: Fn(&FeatureState<'_>) + Send + Sync,
{
    fn notify(&self, feature: &FeatureState<'_>) {
        self(feature)
    }
}

/// The repository's record for one feature key. Created on first lookup or first update and kept
/// for the life of the repository; a delete only clears its value.
pub(crate) struct FeatureHolder {
    key: String,
    state: RwLock<Option<Arc<ResolvedFeature>>>,
    pub(crate) listeners: Arc<ListenerList<dyn FeatureListener>>,
}

impl FeatureHolder {
    pub(crate) fn new(key: impl Into<String>) -> Self {
        FeatureHolder {
            key: key.into(),
            state: RwLock::new(None),
            listeners: ListenerList::new(),
        }
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn current(&self) -> Option<Arc<ResolvedFeature>> {
        self.state.read().clone()
    }

    /// Replaces the held definition if `incoming` supersedes it. A lower version is stale; an
    /// equal version with the same wire value is a duplicate. `force` skips both checks.
    ///
    /// `on_change` runs while the write lock is still held, so notifications for one key are
    /// queued in the order updates were applied. Returns whether the update was taken.
    pub(crate) fn apply<F>(&self, incoming: ResolvedFeature, force: bool, on_change: F) -> bool
    where
        F: FnOnce(),
    {
        let mut state = self.state.write();
        if let Some(held) = state.as_ref() {
            if !force
                && (incoming.version() < held.version()
                    || (incoming.version() == held.version()
                        && incoming.definition.value == held.definition.value))
            {
                return false;
            }
        }

        let changed = match state.as_ref() {
            Some(held) => held.value != incoming.value || held.is_locked() != incoming.is_locked(),
            None => incoming.value.is_some(),
        };
        *state = Some(Arc::new(incoming));
        if changed {
            on_change();
        }
        true
    }

    /// Forgets the held definition, returning the holder to an unconfirmed placeholder.
    pub(crate) fn clear(&self) {
        *self.state.write() = None;
    }
}

/// Shared by every [FeatureState]: the interceptors and bucketing used to resolve values.
pub(crate) struct ValueResolver {
    pub(crate) interceptors: Arc<ListenerList<InterceptorRegistration>>,
    pub(crate) calculator: Arc<dyn PercentageCalculator>,
}

impl ValueResolver {
    pub(crate) fn new(calculator: Arc<dyn PercentageCalculator>) -> Self {
        ValueResolver {
            interceptors: ListenerList::new(),
            calculator,
        }
    }

    /// The first interceptor with an opinion wins. Locked features skip interceptors that may not
    /// override a lock.
    fn intercept(&self, key: &str, locked: bool) -> Option<ValueMatch> {
        if self.interceptors.is_empty() {
            return None;
        }
        self.interceptors
            .snapshot()
            .iter()
            .filter(|registration| !locked || registration.allow_lock_override)
            .find_map(|registration| registration.interceptor.intercept(key))
    }
}

/// A read-only view of one feature, optionally bound to a context's attributes.
///
/// Views are cheap, hold no lock, and are meant to be used and dropped; every read observes the
/// feature's latest applied state.
#[derive(Clone)]
pub struct FeatureState<'a> {
    holder: Arc<FeatureHolder>,
    resolver: Arc<ValueResolver>,
    context: Option<&'a ContextAttributes>,
}

impl<'a> FeatureState<'a> {
    pub(crate) fn new(
        holder: Arc<FeatureHolder>,
        resolver: Arc<ValueResolver>,
        context: Option<&'a ContextAttributes>,
    ) -> Self {
        FeatureState {
            holder,
            resolver,
            context,
        }
    }

    /// Returns a view of the same feature bound to `context`. The original view is unaffected and
    /// both share the feature's listeners.
    pub fn with_context<'b>(&self, context: &'b ContextAttributes) -> FeatureState<'b> {
        FeatureState {
            holder: self.holder.clone(),
            resolver: self.resolver.clone(),
            context: Some(context),
        }
    }

    pub fn key(&self) -> &str {
        self.holder.key()
    }

    pub fn context(&self) -> Option<&'a ContextAttributes> {
        self.context
    }

    /// True once the server has delivered this feature, even if it was later deleted.
    pub fn exists(&self) -> bool {
        self.holder.current().is_some()
    }

    /// True if the feature has a value for this view.
    pub fn is_set(&self) -> bool {
        self.value().is_some()
    }

    pub fn is_locked(&self) -> bool {
        self.holder
            .current()
            .map(|state| state.is_locked())
            .unwrap_or(false)
    }

    pub fn value_type(&self) -> Option<FeatureValueType> {
        self.holder.current().map(|state| state.value_type())
    }

    pub fn version(&self) -> Option<i64> {
        self.holder.current().map(|state| state.version())
    }

    pub fn id(&self) -> Option<String> {
        self.holder
            .current()
            .and_then(|state| state.definition.id.clone())
    }

    /// Resolves the value as the feature's own declared type.
    pub fn detail(&self) -> Detail<FeatureValue> {
        self.resolve(None)
    }

    pub fn value(&self) -> Option<FeatureValue> {
        self.detail().value
    }

    /// Resolves the value as `requested`. A feature of another declared type reads as unset.
    pub fn typed_detail(&self, requested: FeatureValueType) -> Detail<FeatureValue> {
        self.resolve(Some(requested))
    }

    pub fn get_boolean(&self) -> Option<bool> {
        self.typed_detail(FeatureValueType::Boolean)
            .value
            .and_then(|v| v.as_bool())
    }

    /// Same as [FeatureState::get_boolean].
    pub fn get_flag(&self) -> Option<bool> {
        self.get_boolean()
    }

    /// True only for a boolean feature whose value is true.
    pub fn is_enabled(&self) -> bool {
        self.get_boolean() == Some(true)
    }

    pub fn get_string(&self) -> Option<String> {
        self.typed_detail(FeatureValueType::String)
            .value
            .and_then(|v| v.as_string())
    }

    pub fn get_number(&self) -> Option<f64> {
        self.typed_detail(FeatureValueType::Number)
            .value
            .and_then(|v| v.as_f64())
    }

    pub fn get_raw_json(&self) -> Option<String> {
        self.typed_detail(FeatureValueType::Json)
            .value
            .and_then(|v| v.as_raw_json().map(str::to_owned))
    }

    /// Decodes a JSON feature into `T`. An unset feature is `Ok(None)`; a document that does not
    /// decode as `T` is an error.
    pub fn get_json<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match self.get_raw_json() {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|source| Error::JsonDecode {
                    key: self.key().to_string(),
                    source,
                }),
        }
    }

    /// Registers a listener for value changes of this feature. On a context-bound view the
    /// listener sees values resolved against a copy of this context's attributes.
    pub fn add_listener<L>(&self, listener: L) -> ListenerHandle
    where
        L: FeatureListener + 'static,
    {
        match self.context {
            None => self.holder.listeners.add(Arc::new(listener)),
            Some(context) => {
                let context = context.clone();
                self.holder
                    .listeners
                    .add(Arc::new(move |feature: &FeatureState<'_>| {
                        listener.notify(&feature.with_context(&context))
                    }))
            }
        }
    }

    /// The value as seen by this view, for analytics. None when the feature is unset.
    pub fn snapshot(&self) -> Option<FeatureSnapshot> {
        let state = self.holder.current()?;
        let value = self.value()?;
        Some(FeatureSnapshot {
            id: state.definition.id.clone(),
            key: self.key().to_string(),
            value_type: state.value_type(),
            value: Some(value),
            version: state.version(),
            locked: state.is_locked(),
        })
    }

    fn resolve(&self, requested: Option<FeatureValueType>) -> Detail<FeatureValue> {
        let state = self.holder.current();

        let value_type = match (state.as_ref().map(|s| s.value_type()), requested) {
            (Some(declared), Some(requested)) if declared != requested => {
                warn!(
                    "feature {} is {:?}, not {:?}; reading as unset",
                    self.key(),
                    declared,
                    requested
                );
                return Detail::err(EvalError::WrongType);
            }
            (Some(declared), _) => Some(declared),
            (None, requested) => requested,
        };

        if let Some(value_type) = value_type {
            let locked = state.as_ref().map(|s| s.is_locked()).unwrap_or(false);
            if let Some(intercepted) = self.resolver.intercept(self.key(), locked) {
                match intercepted.value {
                    None => return Detail::empty(Reason::Intercepted),
                    Some(text) => match FeatureValue::parse(value_type, &text) {
                        Some(value) => {
                            return Detail {
                                value: Some(value),
                                reason: Reason::Intercepted,
                            }
                        }
                        None => warn!(
                            "ignoring intercepted value for {}: {:?} is not {:?}",
                            self.key(),
                            text,
                            value_type
                        ),
                    },
                }
            }
        }

        let Some(state) = state else {
            return Detail::err(EvalError::FeatureNotFound);
        };
        if state.deleted_at.is_some() {
            return Detail::err(EvalError::FeatureNotFound);
        }

        let detail = match self.context {
            Some(context) => eval::evaluate(&state, context, self.resolver.calculator.as_ref()),
            None => Detail {
                value: state.value.as_ref(),
                reason: Reason::Default,
            },
        };
        detail.map(FeatureValue::clone)
    }
}

impl std::fmt::Debug for FeatureState<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureState")
            .field("key", &self.key())
            .field("context", &self.context)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::FeatureDefinition;
    use crate::interceptor::MapInterceptor;
    use crate::percentage::Murmur3PercentageCalculator;
    use crate::test_common::{self, feature, feature_at};
    use serde::Deserialize;
    use serde_json::json;
    use spectral::prelude::*;

    fn resolver() -> Arc<ValueResolver> {
        Arc::new(ValueResolver::new(Arc::new(Murmur3PercentageCalculator)))
    }

    fn holder_with(def: FeatureDefinition) -> Arc<FeatureHolder> {
        let holder = Arc::new(FeatureHolder::new(def.key.clone()));
        holder.apply(ResolvedFeature::resolve(def).unwrap(), false, || {});
        holder
    }

    fn intercept(resolver: &Arc<ValueResolver>, allow_lock_override: bool, map: &MapInterceptor) {
        resolver.interceptors.add(Arc::new(InterceptorRegistration {
            allow_lock_override,
            interceptor: Arc::new(map.clone()),
        }));
    }

    #[test]
    fn version_rules() {
        let holder = Arc::new(FeatureHolder::new("f1"));
        let resolved = |v, value| {
            ResolvedFeature::resolve(feature_at(test_common::F1_FEATURE, v, value)).unwrap()
        };
        let mut changes = 0;

        assert_that!(holder.apply(resolved(2, json!(true)), false, || changes += 1)).is_true();
        // stale
        assert_that!(holder.apply(resolved(1, json!(false)), false, || changes += 1)).is_false();
        // duplicate
        assert_that!(holder.apply(resolved(2, json!(true)), false, || changes += 1)).is_false();
        // same version, new value
        assert_that!(holder.apply(resolved(2, json!(false)), false, || changes += 1)).is_true();
        // forced stale
        assert_that!(holder.apply(resolved(1, json!(true)), true, || changes += 1)).is_true();

        assert_eq!(changes, 3);
        assert_eq!(holder.current().unwrap().version(), 1);
    }

    #[test]
    fn newer_version_with_same_value_does_not_notify() {
        let holder = holder_with(feature(test_common::F1_FEATURE));
        let mut changes = 0;
        let taken = holder.apply(
            ResolvedFeature::resolve(feature_at(test_common::F1_FEATURE, 5, json!(false))).unwrap(),
            false,
            || changes += 1,
        );
        assert_that!(taken).is_true();
        assert_eq!(changes, 0);
    }

    #[test]
    fn lock_toggle_notifies() {
        let holder = holder_with(feature(test_common::F1_FEATURE));
        let mut changes = 0;

        let mut locked = feature_at(test_common::F1_FEATURE, 2, json!(false));
        locked.locked = true;
        let taken = holder.apply(ResolvedFeature::resolve(locked).unwrap(), false, || changes += 1);
        assert_that!(taken).is_true();
        assert_eq!(changes, 1);
        assert_that!(holder.current().unwrap().is_locked()).is_true();

        let unlocked = feature_at(test_common::F1_FEATURE, 3, json!(false));
        holder.apply(ResolvedFeature::resolve(unlocked).unwrap(), false, || changes += 1);
        assert_eq!(changes, 2);
    }

    #[test]
    fn typed_getters() {
        let state = FeatureState::new(holder_with(feature(test_common::F1_FEATURE)), resolver(), None);
        assert_that!(state.get_boolean()).contains_value(false);
        assert_that!(state.is_enabled()).is_false();
        assert_that!(state.is_set()).is_true();
        assert_that!(state.exists()).is_true();
        // wrong type reads as unset
        assert_that!(state.get_string()).is_none();
        assert_that!(state.get_number()).is_none();
        assert_eq!(
            state.typed_detail(FeatureValueType::String).reason,
            Reason::Error {
                error: EvalError::WrongType
            }
        );
    }

    #[test]
    fn placeholder_is_unset() {
        let state = FeatureState::new(Arc::new(FeatureHolder::new("nope")), resolver(), None);
        assert_that!(state.exists()).is_false();
        assert_that!(state.is_set()).is_false();
        assert_that!(state.get_boolean()).is_none();
        assert_that!(state.value_type()).is_none();
        assert_eq!(
            state.detail().reason,
            Reason::Error {
                error: EvalError::FeatureNotFound
            }
        );
    }

    #[test]
    fn context_binding_does_not_affect_parent() {
        let holder = holder_with(feature(test_common::F3_FEATURE));
        let parent = FeatureState::new(holder, resolver(), None);

        let mut nz = ContextAttributes::default();
        nz.set("country", "NZ");
        let bound = parent.with_context(&nz);

        assert_that!(bound.get_string()).contains_value("kiwi".to_string());
        assert_that!(parent.get_string()).contains_value("base".to_string());
    }

    #[test]
    fn json_values() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Banner {
            text: String,
        }

        let def: FeatureDefinition = serde_json::from_value(json!({
            "key": "banner", "type": "JSON", "value": "{\"text\":\"hi\"}", "version": 1
        }))
        .unwrap();
        let state = FeatureState::new(holder_with(def), resolver(), None);
        assert_that!(state.get_raw_json()).contains_value("{\"text\":\"hi\"}".to_string());
        assert_eq!(
            state.get_json::<Banner>().unwrap(),
            Some(Banner { text: "hi".into() })
        );
        assert!(matches!(
            state.get_json::<Vec<u8>>(),
            Err(Error::JsonDecode { .. })
        ));

        let unset = FeatureState::new(Arc::new(FeatureHolder::new("x")), resolver(), None);
        assert_that!(unset.get_json::<Banner>().unwrap()).is_none();
    }

    #[test]
    fn interceptor_overrides_unlocked_feature() {
        let resolver = resolver();
        let map = MapInterceptor::new();
        map.set("f1", "TRUE");
        intercept(&resolver, false, &map);

        let state = FeatureState::new(holder_with(feature(test_common::F1_FEATURE)), resolver, None);
        assert_that!(state.is_enabled()).is_true();
        assert_eq!(state.detail().reason, Reason::Intercepted);
    }

    #[test]
    fn locked_feature_ignores_interceptor_without_override() {
        let mut def = feature(test_common::F1_FEATURE);
        def.locked = true;
        let holder = holder_with(def);

        let map = MapInterceptor::new();
        map.set("f1", "true");

        let strict = resolver();
        intercept(&strict, false, &map);
        let state = FeatureState::new(holder.clone(), strict, None);
        assert_that!(state.is_enabled()).is_false();

        let overriding = resolver();
        intercept(&overriding, true, &map);
        let state = FeatureState::new(holder, overriding, None);
        assert_that!(state.is_enabled()).is_true();
    }

    #[test]
    fn interceptor_can_force_unset_and_serve_unknown_keys() {
        let resolver = resolver();
        let map = MapInterceptor::new();
        map.set_unset("f1").set("later", "12.5");
        intercept(&resolver, false, &map);

        let known = FeatureState::new(holder_with(feature(test_common::F1_FEATURE)), resolver.clone(), None);
        assert_that!(known.get_boolean()).is_none();

        let unknown = FeatureState::new(Arc::new(FeatureHolder::new("later")), resolver, None);
        assert_that!(unknown.get_number()).contains_value(12.5);
    }

    #[test]
    fn unparseable_intercepted_value_falls_back() {
        let resolver = resolver();
        let map = MapInterceptor::new();
        map.set("n", "lots");
        intercept(&resolver, false, &map);

        let def: FeatureDefinition = serde_json::from_value(json!({
            "key": "n", "type": "NUMBER", "value": 3, "version": 1
        }))
        .unwrap();
        let state = FeatureState::new(holder_with(def), resolver, None);
        assert_that!(state.get_number()).contains_value(3.0);
    }

    #[test]
    fn deleted_feature_reads_unset() {
        let holder = holder_with(feature(test_common::F1_FEATURE));
        let tombstone = ResolvedFeature::tombstone(feature(test_common::F1_FEATURE), chrono::Utc::now());
        holder.apply(tombstone, true, || {});
        let state = FeatureState::new(holder, resolver(), None);
        assert_that!(state.exists()).is_true();
        assert_that!(state.is_set()).is_false();
    }

    #[test]
    fn snapshot_uses_bound_value() {
        let holder = holder_with(feature(test_common::F3_FEATURE));
        let mut nz = ContextAttributes::default();
        nz.set("country", "NZ");
        let state = FeatureState::new(holder, resolver(), Some(&nz));
        let snapshot = state.snapshot().unwrap();
        assert_eq!(snapshot.value, Some(FeatureValue::Str("kiwi".into())));
        assert_eq!(snapshot.id.as_deref(), Some("f3-id"));
    }
}
