//! Priority-ordered backend collection.

use std::sync::Arc;

use tracing::debug;

use super::Backend;
use crate::playlist::Track;

/// A backend together with its chain rank.
#[derive(Clone)]
pub struct RegisteredBackend {
    backend: Arc<dyn Backend>,
    priority: u32,
}

impl RegisteredBackend {
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.backend.name()
    }

    #[must_use]
    pub fn priority(&self) -> u32 {
        self.priority
    }
}

impl std::fmt::Debug for RegisteredBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredBackend")
            .field("name", &self.backend.name())
            .field("priority", &self.priority)
            .finish()
    }
}

/// Backends sorted by ascending priority; ties keep registration order.
#[derive(Debug, Default, Clone)]
pub struct BackendRegistry {
    backends: Vec<RegisteredBackend>,
}

impl BackendRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a backend. A backend with the same name is replaced.
    #[tracing::instrument(skip(self, backend), fields(backend = backend.name()))]
    pub fn register(&mut self, backend: Arc<dyn Backend>, priority: u32) {
        self.backends.retain(|b| b.name() != backend.name());
        debug!(priority, "registering backend");
        self.backends.push(RegisteredBackend { backend, priority });
        // stable sort keeps registration order within a priority
        self.backends.sort_by_key(|b| b.priority);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// All backends in chain order.
    #[must_use]
    pub fn ordered(&self) -> &[RegisteredBackend] {
        &self.backends
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&RegisteredBackend> {
        self.backends.iter().find(|b| b.name().eq_ignore_ascii_case(name))
    }

    /// The chain for `track`: supporting backends in priority order, with
    /// `preferred` (if registered and supporting) moved to the front, cut to
    /// `max_depth` entries.
    #[must_use]
    pub fn chain_for(
        &self,
        track: &Track,
        preferred: Option<&str>,
        max_depth: Option<usize>,
    ) -> Vec<&RegisteredBackend> {
        let mut chain: Vec<&RegisteredBackend> = self
            .backends
            .iter()
            .filter(|b| b.backend.supports(track))
            .collect();
        if let Some(preferred) = preferred
            && let Some(index) = chain
                .iter()
                .position(|b| b.name().eq_ignore_ascii_case(preferred))
        {
            let first = chain.remove(index);
            chain.insert(0, first);
        }
        if let Some(depth) = max_depth {
            chain.truncate(depth.max(1));
        }
        chain
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::backend::{BackendError, Capabilities, FetchRequest, FetchedFile};

    struct Named {
        name: &'static str,
        supports: bool,
    }

    #[async_trait]
    impl Backend for Named {
        fn name(&self) -> &str {
            self.name
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::default()
        }

        fn supports(&self, _track: &Track) -> bool {
            self.supports
        }

        async fn fetch(&self, _request: FetchRequest<'_>) -> Result<FetchedFile, BackendError> {
            Err(BackendError::no_output(self.name))
        }
    }

    fn named(name: &'static str, supports: bool) -> Arc<dyn Backend> {
        Arc::new(Named { name, supports })
    }

    fn track() -> Track {
        Track::new("id", "t", "a", "/x.mp3")
    }

    #[test]
    fn test_ordered_by_priority_then_registration() {
        let mut registry = BackendRegistry::new();
        registry.register(named("c", true), 2);
        registry.register(named("a", true), 0);
        registry.register(named("b1", true), 1);
        registry.register(named("b2", true), 1);
        let names: Vec<&str> = registry.ordered().iter().map(RegisteredBackend::name).collect();
        assert_eq!(names, vec!["a", "b1", "b2", "c"]);
    }

    #[test]
    fn test_register_replaces_same_name() {
        let mut registry = BackendRegistry::new();
        registry.register(named("a", true), 5);
        registry.register(named("a", true), 0);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("A").unwrap().priority(), 0);
    }

    #[test]
    fn test_chain_skips_unsupported_and_honors_preference_and_depth() {
        let mut registry = BackendRegistry::new();
        registry.register(named("a", true), 0);
        registry.register(named("b", false), 1);
        registry.register(named("c", true), 2);
        registry.register(named("d", true), 3);

        let names = |chain: Vec<&RegisteredBackend>| -> Vec<String> {
            chain.iter().map(|b| b.name().to_string()).collect()
        };
        assert_eq!(names(registry.chain_for(&track(), None, None)), vec!["a", "c", "d"]);
        assert_eq!(
            names(registry.chain_for(&track(), Some("d"), None)),
            vec!["d", "a", "c"]
        );
        assert_eq!(names(registry.chain_for(&track(), Some("d"), Some(1))), vec!["d"]);
        // unsupported preference is ignored
        assert_eq!(
            names(registry.chain_for(&track(), Some("b"), Some(2))),
            vec!["a", "c"]
        );
    }
}
