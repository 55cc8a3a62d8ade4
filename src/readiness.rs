use serde::Serialize;

/// Whether the repository holds enough state to serve reliable reads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Readiness {
    /// No complete feature set has arrived yet, or the context is resubscribing.
    #[default]
    NotReady,
    Ready,
    /// The edge reported an unrecoverable failure. Only an explicit transition leaves this state.
    Failed,
}

/// Told about every readiness transition, and about the current state when registered.
pub trait ReadinessListener: Send + Sync {
    fn notify(&self, readiness: Readiness);
}

impl<F> ReadinessListener for F
where
    F: Fn(Readiness) + Send + Sync,
{
    fn notify(&self, readiness: Readiness) {
        self(readiness)
    }
}

/// Told when updates arrive after the initial load. In catch-and-release mode this means updates
/// are waiting for [crate::FeatureRepository::release].
pub trait NewStateAvailableListener: Send + Sync {
    fn new_state_available(&self);
}

impl<F> NewStateAvailableListener for F
where
    F: Fn() + Send + Sync,
{
    fn new_state_available(&self) {
        self()
    }
}
