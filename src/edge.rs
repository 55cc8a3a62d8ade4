use crate::error::Result;

/// The connection to a FeatureHub edge server that delivers update events to a repository.
///
/// The core never opens connections itself; an implementation is handed in by the application and
/// feeds the repository through [crate::FeatureRepository::notify_event] or
/// [crate::FeatureRepository::notify].
pub trait EdgeService: Send + Sync {
    /// Called when a context's attribute header changes, or with `None` when it has no
    /// attributes. Returns once the edge has taken the new header on board.
    fn context_change(&self, header: Option<&str>) -> Result<()>;

    /// True if a header change means the stream must be reopened, in which case the repository is
    /// marked not ready until the new feature set arrives.
    fn requires_replacement_on_header_change(&self) -> bool {
        false
    }

    /// Releases the connection. Must be safe to call more than once.
    fn close(&self);
}
