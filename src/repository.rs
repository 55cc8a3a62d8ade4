use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use log::{debug, error, trace, warn};
use parking_lot::Mutex;

use crate::analytics::{AnalyticsCollector, FeatureSnapshot};
use crate::context::ContextAttributes;
use crate::error::Result;
use crate::event::{FeatureRemoval, SseResultState, UpdateEvent};
use crate::executor::Executor;
use crate::feature::{FeatureDefinition, ResolvedFeature};
use crate::holder::{FeatureHolder, FeatureListener, FeatureState, ValueResolver};
use crate::interceptor::{InterceptorRegistration, ValueInterceptor};
use crate::listeners::{ListenerHandle, ListenerList};
use crate::percentage::{Murmur3PercentageCalculator, PercentageCalculator};
use crate::readiness::{NewStateAvailableListener, Readiness, ReadinessListener};

const DEFAULT_POOL_NAME: &str = "featurehub";
// readiness broadcasts share one lane so listeners see transitions in order
const READINESS_LANE: &str = "\u{0}readiness";

struct ReadinessState {
    readiness: Readiness,
    received_initial_state: bool,
}

/// The process-local cache of feature definitions, fed by an edge connection and read by any
/// number of threads.
///
/// Listener callbacks never run on the thread applying an update; they are queued on the
/// repository's [Executor]. Callbacks for the same feature run in the order its updates were
/// applied.
pub struct FeatureRepository {
    features: DashMap<String, Arc<FeatureHolder>>,
    resolver: Arc<ValueResolver>,
    state: Mutex<ReadinessState>,
    readiness_listeners: Arc<ListenerList<dyn ReadinessListener>>,
    new_state_listeners: Arc<ListenerList<dyn NewStateAvailableListener>>,
    analytics_collectors: Arc<ListenerList<dyn AnalyticsCollector>>,
    catch_and_release: AtomicBool,
    caught: Mutex<HashMap<String, FeatureDefinition>>,
    executor: Arc<Executor>,
    owns_executor: bool,
    closed: AtomicBool,
}

impl FeatureRepository {
    /// A repository with a private single-threaded worker pool.
    pub fn new() -> Result<FeatureRepository> {
        Self::with_pool_size(1)
    }

    pub fn with_pool_size(size: usize) -> Result<FeatureRepository> {
        let executor = Executor::new(DEFAULT_POOL_NAME, size)?;
        Ok(Self::create(Arc::new(executor), true))
    }

    /// A repository dispatching on a pool shared with others. Closing the repository leaves the
    /// pool running.
    pub fn with_executor(executor: Arc<Executor>) -> FeatureRepository {
        Self::create(executor, false)
    }

    fn create(executor: Arc<Executor>, owns_executor: bool) -> FeatureRepository {
        FeatureRepository {
            features: DashMap::new(),
            resolver: Arc::new(ValueResolver::new(Arc::new(Murmur3PercentageCalculator))),
            state: Mutex::new(ReadinessState {
                readiness: Readiness::NotReady,
                received_initial_state: false,
            }),
            readiness_listeners: ListenerList::new(),
            new_state_listeners: ListenerList::new(),
            analytics_collectors: ListenerList::new(),
            catch_and_release: AtomicBool::new(false),
            caught: Mutex::new(HashMap::new()),
            executor,
            owns_executor,
            closed: AtomicBool::new(false),
        }
    }

    /// Replaces the bucketing used for percentage rollouts.
    pub fn with_percentage_calculator(mut self, calculator: Arc<dyn PercentageCalculator>) -> Self {
        self.resolver = Arc::new(ValueResolver {
            interceptors: self.resolver.interceptors.clone(),
            calculator,
        });
        self
    }

    pub fn readiness(&self) -> Readiness {
        self.state.lock().readiness
    }

    pub fn is_ready(&self) -> bool {
        self.readiness() == Readiness::Ready
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    /// Applies a complete feature set. Each definition replaces the held one if it is newer, or
    /// always when `force` is set.
    ///
    /// A not ready repository becomes ready. After the first set, a set that changed anything
    /// tells the new state listeners.
    pub fn apply(&self, definitions: Vec<FeatureDefinition>, force: bool) {
        if self.is_closed() {
            debug!("repository closed, ignoring {} features", definitions.len());
            return;
        }

        let mut confirmed = HashSet::with_capacity(definitions.len());
        let mut updated = false;
        for definition in definitions {
            confirmed.insert(definition.key.clone());
            updated |= self.update(definition, force);
        }

        let first = {
            let mut state = self.state.lock();
            let first = !state.received_initial_state;
            state.received_initial_state = true;
            if state.readiness == Readiness::NotReady {
                self.transition(&mut state, Readiness::Ready);
            }
            first
        };

        if first {
            self.sweep_unconfirmed(&confirmed);
        } else if updated {
            self.trigger_new_state_available();
        }
    }

    /// Applies a single definition. Returns whether it was taken.
    pub fn apply_feature(&self, definition: FeatureDefinition, force: bool) -> bool {
        if self.is_closed() {
            debug!("repository closed, ignoring feature {}", definition.key);
            return false;
        }
        self.update(definition, force)
    }

    /// Clears a feature's value, keeping its holder so readers see it as unset. Does nothing for a
    /// feature that was never delivered, or when the removal is older than the held version.
    pub fn delete(&self, removal: impl Into<FeatureRemoval>) -> bool {
        let removal = removal.into();
        let Some(holder) = self.features.get(&removal.key).map(|h| h.value().clone()) else {
            trace!("delete of unknown feature {}", removal.key);
            return false;
        };
        let Some(held) = holder.current() else {
            return false;
        };

        let mut definition = held.definition.clone();
        if let Some(version) = removal.version {
            if version < held.version() {
                debug!(
                    "ignoring delete of {} at version {}, holding version {}",
                    removal.key,
                    version,
                    held.version()
                );
                return false;
            }
            definition.version = version;
        }
        debug!("deleting feature {} at version {}", definition.key, definition.version);
        holder.apply(ResolvedFeature::tombstone(definition, Utc::now()), false, || {
            self.schedule_feature_listeners(&holder)
        })
    }

    /// Applies a decoded update event.
    pub fn notify_event(&self, event: UpdateEvent) {
        match event {
            UpdateEvent::Ack => trace!("ack"),
            UpdateEvent::Bye => trace!("edge said bye"),
            UpdateEvent::Failure => self.mark_failed(),
            UpdateEvent::Features(definitions) => {
                if self.is_catch_and_release() && self.has_received_initial_state() {
                    self.catch(definitions);
                } else {
                    self.apply(definitions, false);
                }
            }
            UpdateEvent::Feature(definition) => {
                if self.is_catch_and_release() {
                    self.catch(vec![definition]);
                } else if self.apply_feature(definition, false) {
                    self.trigger_new_state_available();
                }
            }
            UpdateEvent::DeleteFeature(removal) => {
                self.delete(removal);
            }
        }
    }

    /// Decodes and applies a raw event. Events that fail to decode are logged and dropped, and the
    /// error is returned for the transport's benefit.
    pub fn notify(&self, state: &str, data: &str) -> Result<()> {
        let decoded = state
            .parse::<SseResultState>()
            .and_then(|state| UpdateEvent::decode(state, data));
        match decoded {
            Ok(event) => {
                self.notify_event(event);
                Ok(())
            }
            Err(e) => {
                warn!("dropping update event: {}", e);
                Err(e)
            }
        }
    }

    /// The feature with `key`. An unknown key gets a placeholder that reads as unset until the
    /// server delivers it.
    pub fn feature(&self, key: &str) -> FeatureState<'static> {
        FeatureState::new(self.holder(key, true), self.resolver.clone(), None)
    }

    /// The feature with `key`, only if it has been delivered or looked up before.
    pub fn get(&self, key: &str) -> Option<FeatureState<'static>> {
        self.features
            .get(key)
            .map(|holder| FeatureState::new(holder.value().clone(), self.resolver.clone(), None))
    }

    pub fn has_feature(&self, key: &str) -> bool {
        self.features
            .get(key)
            .map(|holder| holder.current().is_some())
            .unwrap_or(false)
    }

    pub fn mark_ready(&self) {
        self.transition(&mut self.state.lock(), Readiness::Ready);
    }

    pub fn mark_not_ready(&self) {
        self.transition(&mut self.state.lock(), Readiness::NotReady);
    }

    pub fn mark_failed(&self) {
        self.transition(&mut self.state.lock(), Readiness::Failed);
    }

    /// Registers a readiness listener. It is told the current readiness straight away.
    pub fn add_readiness_listener<L>(&self, listener: L) -> ListenerHandle
    where
        L: ReadinessListener + 'static,
    {
        let listener: Arc<dyn ReadinessListener> = Arc::new(listener);
        let state = self.state.lock();
        let handle = self.readiness_listeners.add(listener.clone());
        self.dispatch_readiness(listener, state.readiness);
        handle
    }

    pub fn add_feature_listener<L>(&self, key: &str, listener: L) -> ListenerHandle
    where
        L: FeatureListener + 'static,
    {
        self.feature(key).add_listener(listener)
    }

    /// Registers an interceptor consulted before server values. Locked features ignore it unless
    /// `allow_lock_override` is set.
    pub fn register_value_interceptor<I>(&self, allow_lock_override: bool, interceptor: I) -> ListenerHandle
    where
        I: ValueInterceptor + 'static,
    {
        self.resolver
            .interceptors
            .add(Arc::new(InterceptorRegistration {
                allow_lock_override,
                interceptor: Arc::new(interceptor),
            }))
    }

    pub fn add_analytics_collector<C>(&self, collector: C) -> ListenerHandle
    where
        C: AnalyticsCollector + 'static,
    {
        self.analytics_collectors.add(Arc::new(collector))
    }

    /// Registers a listener for updates arriving after the initial load. If updates are already
    /// being held, it is told straight away.
    pub fn add_new_state_available_listener<L>(&self, listener: L) -> ListenerHandle
    where
        L: NewStateAvailableListener + 'static,
    {
        let listener: Arc<dyn NewStateAvailableListener> = Arc::new(listener);
        let handle = self.new_state_listeners.add(listener.clone());
        if !self.caught.lock().is_empty() {
            self.dispatch(move || listener.new_state_available());
        }
        handle
    }

    pub fn is_catch_and_release(&self) -> bool {
        self.catch_and_release.load(Ordering::SeqCst)
    }

    /// While enabled, updates after the initial load are held until [FeatureRepository::release].
    /// Disabling releases anything held.
    pub fn set_catch_and_release(&self, enabled: bool) {
        let was = self.catch_and_release.swap(enabled, Ordering::SeqCst);
        if was && !enabled {
            self.release();
        }
    }

    /// Applies the held updates, including any caught while releasing.
    pub fn release(&self) {
        loop {
            let held: Vec<FeatureDefinition> = self.caught.lock().drain().map(|(_, def)| def).collect();
            if held.is_empty() {
                break;
            }
            debug!("releasing {} held features", held.len());
            for definition in held {
                self.update(definition, false);
            }
        }
    }

    /// Snapshots every set feature, resolved against `context` when given, and hands the snapshot
    /// to the analytics collectors on the worker pool.
    pub fn log_analytics_event(
        &self,
        action: &str,
        other: HashMap<String, String>,
        context: Option<&ContextAttributes>,
    ) {
        if self.analytics_collectors.is_empty() {
            return;
        }
        let features: Vec<FeatureSnapshot> = self
            .holders()
            .into_iter()
            .filter_map(|holder| FeatureState::new(holder, self.resolver.clone(), context).snapshot())
            .collect();

        let event = Arc::new((action.to_string(), other, features));
        for collector in self.analytics_collectors.snapshot() {
            let event = event.clone();
            self.dispatch(move || collector.log_event(&event.0, &event.1, &event.2));
        }
    }

    /// Every delivered feature's current value in text form, unset features mapping to `None`.
    pub fn simple_features(&self) -> BTreeMap<String, Option<String>> {
        self.holders()
            .into_iter()
            .filter(|holder| holder.current().is_some())
            .map(|holder| {
                let key = holder.key().to_string();
                let value = FeatureState::new(holder, self.resolver.clone(), None)
                    .value()
                    .map(|v| v.to_string());
                (key, value)
            })
            .collect()
    }

    /// Makes the repository not ready, drops all feature state and stops a private worker pool.
    /// Safe to call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("closing feature repository");
        self.mark_not_ready();
        for holder in self.holders() {
            holder.clear();
        }
        self.features.clear();
        self.caught.lock().clear();
        self.readiness_listeners.clear();
        self.new_state_listeners.clear();
        self.analytics_collectors.clear();
        if self.owns_executor {
            self.executor.shutdown();
        }
    }

    fn holders(&self) -> Vec<Arc<FeatureHolder>> {
        self.features.iter().map(|entry| entry.value().clone()).collect()
    }

    fn holder(&self, key: &str, lookup: bool) -> Arc<FeatureHolder> {
        if let Some(holder) = self.features.get(key) {
            return holder.value().clone();
        }
        let complain = lookup && self.has_received_initial_state();
        self.features
            .entry(key.to_string())
            .or_insert_with(|| {
                if complain {
                    error!("feature {} was requested but the server does not know it", key);
                }
                Arc::new(FeatureHolder::new(key))
            })
            .value()
            .clone()
    }

    fn has_received_initial_state(&self) -> bool {
        self.state.lock().received_initial_state
    }

    fn update(&self, definition: FeatureDefinition, force: bool) -> bool {
        let key = definition.key.clone();
        let resolved = match ResolvedFeature::resolve(definition) {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(
                    "discarding update of {}: {} is not a {:?} value",
                    key, e.value, e.value_type
                );
                return false;
            }
        };
        let holder = self.holder(resolved.key(), false);
        holder.apply(resolved, force, || self.schedule_feature_listeners(&holder))
    }

    fn schedule_feature_listeners(&self, holder: &Arc<FeatureHolder>) {
        for listener in holder.listeners.snapshot() {
            let feature = FeatureState::new(holder.clone(), self.resolver.clone(), None);
            let job = move || listener.notify(&feature);
            if let Err(e) = self.executor.execute_keyed(holder.key(), job) {
                debug!("not notifying listeners of {}: {}", holder.key(), e);
            }
        }
    }

    fn transition(&self, state: &mut ReadinessState, to: Readiness) {
        if state.readiness == to {
            return;
        }
        debug!("readiness {:?} -> {:?}", state.readiness, to);
        state.readiness = to;
        for listener in self.readiness_listeners.snapshot() {
            self.dispatch_readiness(listener, to);
        }
    }

    fn dispatch_readiness(&self, listener: Arc<dyn ReadinessListener>, readiness: Readiness) {
        if let Err(e) = self
            .executor
            .execute_keyed(READINESS_LANE, move || listener.notify(readiness))
        {
            debug!("not notifying readiness {:?}: {}", readiness, e);
        }
    }

    fn dispatch<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Err(e) = self.executor.execute(job) {
            debug!("dropping listener callback: {}", e);
        }
    }

    fn sweep_unconfirmed(&self, confirmed: &HashSet<String>) {
        for holder in self.holders() {
            if holder.current().is_none() && !confirmed.contains(holder.key()) {
                error!(
                    "feature {} was requested but is not in the feature set; it will stay unset",
                    holder.key()
                );
            }
        }
    }

    fn catch(&self, definitions: Vec<FeatureDefinition>) {
        let mut caught_any = false;
        {
            let mut caught = self.caught.lock();
            for definition in definitions {
                let newer = match self.features.get(&definition.key).and_then(|h| h.current()) {
                    None => true,
                    Some(held) => definition.version > held.version(),
                };
                if !newer {
                    continue;
                }
                let id = definition.feature_value_id().to_string();
                let replaces = caught
                    .get(&id)
                    .map(|held| definition.version > held.version)
                    .unwrap_or(true);
                if replaces {
                    caught.insert(id, definition);
                    caught_any = true;
                }
            }
        }
        if caught_any {
            self.trigger_new_state_available();
        }
    }

    fn trigger_new_state_available(&self) {
        if self.is_catch_and_release() && self.caught.lock().is_empty() {
            return;
        }
        for listener in self.new_state_listeners.snapshot() {
            self.dispatch(move || listener.new_state_available());
        }
    }
}

impl Drop for FeatureRepository {
    fn drop(&mut self) {
        self.close();
    }
}
