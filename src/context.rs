use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::channel::oneshot;
use itertools::Itertools;
use log::{debug, error};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::edge::EdgeService;
use crate::error::{Error, Result};
use crate::holder::FeatureState;
use crate::repository::FeatureRepository;

pub const USER_KEY: &str = "userkey";
pub const SESSION: &str = "session";
pub const COUNTRY: &str = "country";
pub const DEVICE: &str = "device";
pub const PLATFORM: &str = "platform";
pub const VERSION: &str = "version";

/// Analytics events carry the context's user key under this name.
const ANALYTICS_USER: &str = "cid";

/// The targeting attributes of a context. Every attribute holds an ordered list of values;
/// single-valued setters store a one-element list.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContextAttributes {
    values: BTreeMap<String, Vec<String>>,
}

impl ContextAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.values.insert(name.into(), vec![value.into()]);
        self
    }

    pub fn set_values(&mut self, name: impl Into<String>, values: Vec<String>) -> &mut Self {
        self.values.insert(name.into(), values);
        self
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        self.values.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.values.get(name).map(Vec::as_slice)
    }

    pub fn first(&self, name: &str) -> Option<&str> {
        self.get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// The key used for percentage bucketing: the session if set, else the user key.
    pub fn percentage_key(&self) -> Option<&str> {
        self.first(SESSION).or_else(|| self.first(USER_KEY))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.values
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    /// The canonical form sent to the edge when attributes change: `name=values` pairs with the
    /// values comma-joined and url-encoded, sorted and comma-joined. None when there are no
    /// attributes.
    pub fn header(&self) -> Option<String> {
        if self.values.is_empty() {
            return None;
        }
        Some(
            self.values
                .iter()
                .map(|(name, values)| format!("{}={}", name, urlencoding::encode(&values.join(","))))
                .sorted()
                .join(","),
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Browser,
    Mobile,
    Desktop,
    Server,
    Watch,
    Embedded,
}

impl Device {
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Browser => "browser",
            Device::Mobile => "mobile",
            Device::Desktop => "desktop",
            Device::Server => "server",
            Device::Watch => "watch",
            Device::Embedded => "embedded",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    Windows,
    Macos,
    Android,
    Ios,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Linux => "linux",
            Platform::Windows => "windows",
            Platform::Macos => "macos",
            Platform::Android => "android",
            Platform::Ios => "ios",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Completes when the edge has acknowledged a [ClientContext::build].
#[must_use = "a build handle does nothing unless awaited or waited on"]
pub struct BuildHandle {
    state: BuildState,
}

enum BuildState {
    Done(Option<Result<()>>),
    Pending(oneshot::Receiver<Result<()>>),
}

impl BuildHandle {
    fn done(result: Result<()>) -> Self {
        BuildHandle {
            state: BuildState::Done(Some(result)),
        }
    }

    /// Blocks the calling thread until the build completes.
    pub fn wait(self) -> Result<()> {
        futures::executor::block_on(self)
    }
}

impl Future for BuildHandle {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            BuildState::Done(result) => Poll::Ready(result.take().unwrap_or(Ok(()))),
            BuildState::Pending(rx) => Pin::new(rx)
                .poll(cx)
                .map(|received| received.unwrap_or(Err(Error::ExecutorShutdown))),
        }
    }
}

impl fmt::Debug for BuildHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pending = matches!(self.state, BuildState::Pending(_));
        f.debug_struct("BuildHandle").field("pending", &pending).finish()
    }
}

/// A set of targeting attributes bound to a repository and its edge connection.
///
/// Reads through a context evaluate rollout strategies against its attributes, unless the key is
/// server evaluated, in which case the edge has already applied them. Attribute changes only reach
/// the edge on [ClientContext::build].
///
/// An owning context closes its repository and edge when it is closed or dropped; a borrowing one
/// leaves them to their owner.
pub struct ClientContext {
    attributes: ContextAttributes,
    repository: Arc<FeatureRepository>,
    edge: Arc<dyn EdgeService>,
    owns_connection: bool,
    server_evaluation: bool,
    sent_header: Option<Option<String>>,
    closed: bool,
}

impl ClientContext {
    /// A context that owns `repository` and `edge`.
    pub fn new(
        repository: Arc<FeatureRepository>,
        edge: Arc<dyn EdgeService>,
        server_evaluation: bool,
    ) -> Self {
        Self::create(repository, edge, server_evaluation, true)
    }

    /// A context sharing a repository and edge owned elsewhere.
    pub fn borrowing(
        repository: Arc<FeatureRepository>,
        edge: Arc<dyn EdgeService>,
        server_evaluation: bool,
    ) -> Self {
        Self::create(repository, edge, server_evaluation, false)
    }

    fn create(
        repository: Arc<FeatureRepository>,
        edge: Arc<dyn EdgeService>,
        server_evaluation: bool,
        owns_connection: bool,
    ) -> Self {
        ClientContext {
            attributes: ContextAttributes::default(),
            repository,
            edge,
            owns_connection,
            server_evaluation,
            sent_header: None,
            closed: false,
        }
    }

    pub fn user_key(&mut self, key: impl Into<String>) -> &mut Self {
        self.attr(USER_KEY, key)
    }

    pub fn session_key(&mut self, key: impl Into<String>) -> &mut Self {
        self.attr(SESSION, key)
    }

    pub fn country(&mut self, country: impl Into<String>) -> &mut Self {
        self.attr(COUNTRY, country)
    }

    pub fn device(&mut self, device: Device) -> &mut Self {
        self.attr(DEVICE, device.as_str())
    }

    pub fn platform(&mut self, platform: Platform) -> &mut Self {
        self.attr(PLATFORM, platform.as_str())
    }

    pub fn version(&mut self, version: impl Into<String>) -> &mut Self {
        self.attr(VERSION, version)
    }

    pub fn attr(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.attributes.set(name, value);
        self
    }

    pub fn attrs(&mut self, name: impl Into<String>, values: Vec<String>) -> &mut Self {
        self.attributes.set_values(name, values);
        self
    }

    pub fn clear(&mut self) -> &mut Self {
        self.attributes.clear();
        self
    }

    pub fn attributes(&self) -> &ContextAttributes {
        &self.attributes
    }

    pub fn get_attr(&self, name: &str) -> Option<&str> {
        self.attributes.first(name)
    }

    pub fn default_percentage_key(&self) -> Option<&str> {
        self.attributes.percentage_key()
    }

    pub fn repository(&self) -> &Arc<FeatureRepository> {
        &self.repository
    }

    pub fn is_server_evaluation(&self) -> bool {
        self.server_evaluation
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Sends the attribute header to the edge if it changed since the last build.
    ///
    /// After the first build, a changed header makes the repository not ready when the edge
    /// evaluates the context itself or has to reopen its stream.
    pub fn build(&mut self) -> BuildHandle {
        if self.closed {
            return BuildHandle::done(Err(Error::Closed("context")));
        }

        let header = self.attributes.header();
        if self.sent_header.as_ref() == Some(&header) {
            debug!("context header unchanged, nothing to send");
            return BuildHandle::done(Ok(()));
        }
        let first = self.sent_header.is_none();
        self.sent_header = Some(header.clone());

        if !first && (self.server_evaluation || self.edge.requires_replacement_on_header_change()) {
            self.repository.mark_not_ready();
        }

        let (tx, rx) = oneshot::channel();
        let edge = self.edge.clone();
        let job = move || {
            let result = edge.context_change(header.as_deref());
            if let Err(e) = &result {
                error!("failed to update the edge with the new context: {}", e);
            }
            let _ = tx.send(result);
        };
        match self.repository.executor().execute(job) {
            Ok(()) => BuildHandle {
                state: BuildState::Pending(rx),
            },
            Err(e) => BuildHandle::done(Err(e)),
        }
    }

    /// The feature as seen by this context.
    pub fn feature(&self, key: &str) -> FeatureState<'_> {
        let state = self.repository.feature(key);
        if self.server_evaluation {
            state
        } else {
            state.with_context(&self.attributes)
        }
    }

    pub fn exists(&self, key: &str) -> bool {
        self.feature(key).exists()
    }

    pub fn is_set(&self, key: &str) -> bool {
        self.feature(key).is_set()
    }

    pub fn is_enabled(&self, key: &str) -> bool {
        self.feature(key).is_enabled()
    }

    pub fn get_boolean(&self, key: &str) -> Option<bool> {
        self.feature(key).get_boolean()
    }

    pub fn get_flag(&self, key: &str) -> Option<bool> {
        self.feature(key).get_flag()
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.feature(key).get_string()
    }

    pub fn get_number(&self, key: &str) -> Option<f64> {
        self.feature(key).get_number()
    }

    pub fn get_raw_json(&self, key: &str) -> Option<String> {
        self.feature(key).get_raw_json()
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.feature(key).get_json()
    }

    /// Logs an analytics event with features resolved for this context. The user key, if any, is
    /// added to `other` as `cid`.
    pub fn log_analytics_event(&self, action: &str, mut other: HashMap<String, String>) {
        if let Some(user) = self.attributes.first(USER_KEY) {
            other
                .entry(ANALYTICS_USER.to_string())
                .or_insert_with(|| user.to_string());
        }
        let context = (!self.server_evaluation).then_some(&self.attributes);
        self.repository.log_analytics_event(action, other, context);
    }

    /// Releases what this context owns. Safe to call more than once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self.owns_connection {
            self.edge.close();
            self.repository.close();
        }
    }
}

impl Drop for ClientContext {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for ClientContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientContext")
            .field("attributes", &self.attributes)
            .field("server_evaluation", &self.server_evaluation)
            .field("owns_connection", &self.owns_connection)
            .field("closed", &self.closed)
            .finish()
    }
}
