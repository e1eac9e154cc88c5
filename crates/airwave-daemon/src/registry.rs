use std::collections::HashMap;

use tracing::{debug, info};

use crate::source::{OpId, SignalSender, SourceHandle, StreamFactory};

/// Owns one source handle per station URL.
///
/// Handles are created lazily and never removed until `teardown_all`.  The
/// registry is also the only issuer of load op ids.
pub struct SourceRegistry<F: StreamFactory> {
    factory: F,
    handles: HashMap<String, SourceHandle<F::Stream>>,
    signals: SignalSender,
    next_op: OpId,
}

impl<F: StreamFactory> SourceRegistry<F> {
    pub fn new(factory: F, signals: SignalSender) -> Self {
        Self {
            factory,
            handles: HashMap::new(),
            signals,
            next_op: 1,
        }
    }

    pub fn contains(&self, url: &str) -> bool {
        self.handles.contains_key(url)
    }

    /// Return the handle for `url`, creating an `Unloaded` one if needed.
    /// No network I/O happens here.
    pub fn get_or_create(&mut self, url: &str) -> &mut SourceHandle<F::Stream> {
        let factory = &self.factory;
        self.handles.entry(url.to_string()).or_insert_with(|| {
            debug!("registry: new source for {}", url);
            SourceHandle::new(url, factory.create(url))
        })
    }

    pub fn get(&self, url: &str) -> Option<&SourceHandle<F::Stream>> {
        self.handles.get(url)
    }

    pub fn get_mut(&mut self, url: &str) -> Option<&mut SourceHandle<F::Stream>> {
        self.handles.get_mut(url)
    }

    /// Start (or restart) buffering `url` under a fresh op id.
    pub fn load(&mut self, url: &str) -> OpId {
        let op = self.next_op;
        self.next_op += 1;
        let signals = self.signals.clone();
        self.get_or_create(url).begin_load(op, signals);
        debug!("registry: load {} op={}", url, op);
        op
    }

    /// Create and begin buffering a handle for every URL that has none.
    /// Nothing starts playing.  Returns how many loads were started.
    pub fn preload_all<'a, I>(&mut self, urls: I) -> usize
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut started = 0;
        for url in urls {
            if self.contains(url) {
                continue;
            }
            self.load(url);
            started += 1;
        }
        info!("registry: preloading {} stations", started);
        started
    }

    #[cfg(test)]
    pub fn count_in_phase(&self, phase: crate::source::SourcePhase) -> usize {
        self.handles.values().filter(|h| h.phase() == phase).count()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Stop and release every stream.  Called once, at shutdown.
    pub fn teardown_all(&mut self) {
        for (url, handle) in self.handles.iter_mut() {
            debug!("registry: closing {}", url);
            handle.close();
        }
        self.handles.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::testing::FakeFactory;
    use crate::source::SourcePhase;
    use tokio::sync::mpsc;

    fn registry() -> (SourceRegistry<FakeFactory>, FakeFactory) {
        let factory = FakeFactory::default();
        let (tx, _rx) = mpsc::channel(16);
        (SourceRegistry::new(factory.clone(), tx), factory)
    }

    #[test]
    fn test_get_or_create_is_lazy_and_unique() {
        let (mut registry, factory) = registry();
        assert!(!registry.contains("http://a"));

        assert_eq!(registry.get_or_create("http://a").phase(), SourcePhase::Unloaded);
        registry.get_or_create("http://a");
        assert_eq!(registry.len(), 1);
        // construction alone starts no load
        assert!(factory.log.lock().unwrap().loads.is_empty());
    }

    #[test]
    fn test_load_issues_increasing_ops() {
        let (mut registry, _) = registry();
        let first = registry.load("http://a");
        let second = registry.load("http://a");
        let third = registry.load("http://b");
        assert!(first < second && second < third);
        assert_eq!(registry.get("http://a").unwrap().current_op(), Some(second));
        assert_eq!(registry.get("http://a").unwrap().phase(), SourcePhase::Loading);
    }

    #[test]
    fn test_preload_skips_existing_handles() {
        let (mut registry, factory) = registry();
        registry.get_or_create("http://a");
        let started = registry.preload_all(["http://a", "http://b", "http://c"]);
        assert_eq!(started, 2);
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.get("http://a").unwrap().phase(), SourcePhase::Unloaded);
        assert_eq!(registry.count_in_phase(SourcePhase::Loading), 2);
        assert!(factory.log.lock().unwrap().plays.is_empty());
    }

    #[test]
    fn test_teardown_closes_everything() {
        let (mut registry, factory) = registry();
        registry.load("http://a");
        registry.load("http://b");
        registry.teardown_all();
        assert_eq!(registry.len(), 0);
        assert_eq!(factory.log.lock().unwrap().closes.len(), 2);
    }
}
