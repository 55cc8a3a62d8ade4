use std::sync::Arc;

use log::debug;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::context::ClientContext;
use crate::edge::EdgeService;
use crate::error::{Error, Result};
use crate::readiness::Readiness;
use crate::repository::FeatureRepository;

const FEATURES_SEGMENT: &str = "features";

fn default_thread_pool_size() -> usize {
    1
}

/// Where to find the edge server and which environment to read.
///
/// Keys containing `*` are evaluated by the client; any other key is evaluated by the edge, which
/// applies each context's attributes itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    edge_url: Url,
    api_key: String,
    thread_pool_size: usize,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConfig {
    edge_url: String,
    api_key: String,
    #[serde(default = "default_thread_pool_size")]
    thread_pool_size: usize,
}

impl<'de> Deserialize<'de> for Config {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = RawConfig::deserialize(deserializer)?;
        Config::new(&raw.edge_url, &raw.api_key)
            .map(|config| config.with_thread_pool_size(raw.thread_pool_size))
            .map_err(serde::de::Error::custom)
    }
}

impl Config {
    /// Normalizes `edge_url`, dropping a trailing `/` or `/features`. The url must be an
    /// absolute http or https url with a host.
    pub fn new(edge_url: &str, api_key: &str) -> Result<Config> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(Error::MissingApiKey);
        }

        let invalid = || Error::InvalidEdgeUrl(edge_url.to_string());
        let mut base = Url::parse(edge_url.trim()).map_err(|_| invalid())?;
        if !matches!(base.scheme(), "http" | "https")
            || base.host_str().map_or(true, str::is_empty)
            || base.cannot_be_a_base()
        {
            return Err(invalid());
        }

        let path = base.path().trim_end_matches('/');
        let path = path
            .strip_suffix(FEATURES_SEGMENT)
            .and_then(|p| p.strip_suffix('/'))
            .unwrap_or(path)
            .to_string();
        base.set_path(&path);
        base.set_query(None);
        base.set_fragment(None);

        Ok(Config {
            edge_url: base,
            api_key: api_key.to_string(),
            thread_pool_size: default_thread_pool_size(),
        })
    }

    pub fn from_json_str(json: &str) -> Result<Config> {
        serde_json::from_str(json).map_err(Error::InvalidConfig)
    }

    /// Sets the number of worker threads used for listener callbacks. At least one is used.
    pub fn with_thread_pool_size(mut self, size: usize) -> Self {
        self.thread_pool_size = size.max(1);
        self
    }

    /// The normalized base url, without a trailing `/`.
    pub fn edge_url(&self) -> &str {
        self.edge_url.as_str().trim_end_matches('/')
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn thread_pool_size(&self) -> usize {
        self.thread_pool_size
    }

    /// The url of the environment's update stream.
    pub fn realtime_url(&self) -> String {
        let mut url = self.edge_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .push(FEATURES_SEGMENT)
                .extend(self.api_key.split('/'));
        }
        url.into()
    }

    pub fn is_server_evaluation(&self) -> bool {
        !self.api_key.contains('*')
    }
}

/// Ties a [Config] to one repository and edge connection for the whole application, handing out
/// contexts that borrow them.
pub struct FeatureHub {
    config: Config,
    repository: Arc<FeatureRepository>,
    edge: Arc<dyn EdgeService>,
}

impl FeatureHub {
    /// Creates the repository and asks `edge_factory` for a connection feeding it.
    pub fn new<F, E>(config: Config, edge_factory: F) -> Result<FeatureHub>
    where
        F: FnOnce(&Config, Arc<FeatureRepository>) -> Arc<E>,
        E: EdgeService + 'static,
    {
        let repository = Arc::new(FeatureRepository::with_pool_size(config.thread_pool_size())?);
        let edge = edge_factory(&config, repository.clone());
        debug!("connecting to {}", config.edge_url());
        Ok(FeatureHub {
            config,
            repository,
            edge,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn repository(&self) -> &Arc<FeatureRepository> {
        &self.repository
    }

    pub fn edge(&self) -> &Arc<dyn EdgeService> {
        &self.edge
    }

    pub fn readiness(&self) -> Readiness {
        self.repository.readiness()
    }

    /// A new context sharing this hub's repository and edge. Closing it leaves both open.
    pub fn new_context(&self) -> ClientContext {
        ClientContext::borrowing(
            self.repository.clone(),
            self.edge.clone(),
            self.config.is_server_evaluation(),
        )
    }

    pub fn close(&self) {
        self.edge.close();
        self.repository.close();
    }
}

impl Drop for FeatureHub {
    fn drop(&mut self) {
        self.close();
    }
}
