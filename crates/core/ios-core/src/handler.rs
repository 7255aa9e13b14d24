//! Handler registry, naming-convention catalog, and the dispatcher.
//!
//! A [`HandlerRegistry`] maps topic patterns to handler factories and resolves
//! an inbound topic in a fixed priority order:
//!
//! 1. a registration whose pattern is byte-equal to the topic
//! 2. the first wildcard registration that matches, in registration order
//! 3. the default handler
//!
//! [`HandlerCatalog`] builds a registry from configuration by naming
//! convention, and [`Dispatcher`] runs the resolved handler with error and
//! panic isolation so one bad message never takes down a stage.

use crate::topic::{validate_pattern, TopicPattern, MULTI_LEVEL_WILDCARD, SEPARATOR};
use crate::{IosError, IosResult};
use async_trait::async_trait;
use futures::FutureExt;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Longest payload excerpt written to failure logs
const PAYLOAD_LOG_LIMIT: usize = 512;

/// A unit of business logic bound to one or more topic patterns.
///
/// Handlers receive their collaborators at construction; they never reach for
/// process globals.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handler name used in logs and by the catalog
    fn name(&self) -> &str;

    /// Patterns this handler is meant to serve
    fn supported_topics(&self) -> Vec<TopicPattern>;

    /// Whether any supported pattern matches `topic`
    fn can_handle(&self, topic: &str) -> bool {
        self.supported_topics().iter().any(|p| p.matches(topic))
    }

    /// Process one inbound message
    async fn process_message(&self, topic: &str, payload: &str) -> IosResult<()>;
}

/// Creates a handler for one dispatch
pub type HandlerFactory = Arc<dyn Fn() -> Arc<dyn MessageHandler> + Send + Sync>;

/// Wrap a closure as a [`HandlerFactory`]
pub fn factory<F>(f: F) -> HandlerFactory
where
    F: Fn() -> Arc<dyn MessageHandler> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Fallback for topics nothing else claims; logs and accepts.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHandler;

#[async_trait]
impl MessageHandler for DefaultHandler {
    fn name(&self) -> &str {
        "DefaultHandler"
    }

    fn supported_topics(&self) -> Vec<TopicPattern> {
        TopicPattern::parse(MULTI_LEVEL_WILDCARD).into_iter().collect()
    }

    async fn process_message(&self, topic: &str, payload: &str) -> IosResult<()> {
        warn!(topic = %topic, payload = %preview(payload), "No handler registered for topic");
        Ok(())
    }
}

struct Registration {
    pattern: TopicPattern,
    factory: HandlerFactory,
}

/// How a topic was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution<'a> {
    /// Byte-equal registration
    Exact(&'a TopicPattern),
    /// First matching wildcard registration
    Pattern(&'a TopicPattern),
    /// Nothing matched
    Default,
}

impl Resolution<'_> {
    /// Whether a registration (rather than the default) was chosen
    #[must_use]
    pub fn is_matched(&self) -> bool {
        !matches!(self, Self::Default)
    }
}

/// Topic pattern to handler factory table
pub struct HandlerRegistry {
    registrations: Vec<Registration>,
    exact: HashMap<String, usize>,
    default: HandlerFactory,
}

impl HandlerRegistry {
    /// Create an empty registry with the given fallback
    #[must_use]
    pub fn new(default: HandlerFactory) -> Self {
        Self {
            registrations: Vec::new(),
            exact: HashMap::new(),
            default,
        }
    }

    /// Register `factory` for `pattern`.
    ///
    /// Malformed patterns are rejected with a topic error, and a second
    /// registration of the same pattern with a configuration error.
    pub fn register(&mut self, pattern: &str, factory: HandlerFactory) -> IosResult<()> {
        let pattern = TopicPattern::parse(pattern)?;
        if self.registrations.iter().any(|r| r.pattern == pattern) {
            return Err(IosError::config(format!(
                "Pattern '{pattern}' is already registered"
            )));
        }

        let index = self.registrations.len();
        // every pattern can be hit by a byte-equal topic, wildcards included
        self.exact.insert(pattern.as_str().to_string(), index);
        debug!(pattern = %pattern, "Registered handler");
        self.registrations.push(Registration { pattern, factory });
        Ok(())
    }

    /// Register a shared handler under each of its supported topics
    pub fn register_handler(&mut self, handler: Arc<dyn MessageHandler>) -> IosResult<()> {
        for pattern in handler.supported_topics() {
            let shared = Arc::clone(&handler);
            self.register(pattern.as_str(), Arc::new(move || Arc::clone(&shared)))?;
        }
        Ok(())
    }

    /// Resolve `topic` without creating a handler
    #[must_use]
    pub fn resolve(&self, topic: &str) -> Resolution<'_> {
        if let Some(&index) = self.exact.get(topic) {
            return Resolution::Exact(&self.registrations[index].pattern);
        }

        self.registrations
            .iter()
            .find(|r| r.pattern.is_wildcard() && r.pattern.matches(topic))
            .map_or(Resolution::Default, |r| Resolution::Pattern(&r.pattern))
    }

    /// Create the handler for `topic`; falls back to the default handler
    #[must_use]
    pub fn create_handler(&self, topic: &str) -> Arc<dyn MessageHandler> {
        let factory = match self.resolve(topic) {
            Resolution::Exact(pattern) | Resolution::Pattern(pattern) => self
                .registrations
                .iter()
                .find(|r| &r.pattern == pattern)
                .map_or(&self.default, |r| &r.factory),
            Resolution::Default => &self.default,
        };
        factory()
    }

    /// Registered patterns in registration order
    pub fn patterns(&self) -> impl Iterator<Item = &TopicPattern> {
        self.registrations.iter().map(|r| &r.pattern)
    }

    /// Number of registrations
    #[must_use]
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// Whether nothing is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new(factory(|| Arc::new(DefaultHandler)))
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("patterns", &self.patterns().map(TopicPattern::as_str).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Topic keywords used for naming-convention lookup.
///
/// Segments are PascalCased; the `ios` prefix and version segments such as
/// `v1` are dropped.
#[must_use]
pub fn topic_keywords(topic: &str) -> Vec<String> {
    topic
        .split(SEPARATOR)
        .filter(|segment| !segment.is_empty())
        .filter(|segment| !segment.eq_ignore_ascii_case("ios"))
        .filter(|segment| !is_version_segment(segment))
        .filter(|segment| *segment != "+" && *segment != "#")
        .map(pascal_case)
        .collect()
}

fn is_version_segment(segment: &str) -> bool {
    let mut chars = segment.chars();
    matches!(chars.next(), Some('v' | 'V'))
        && segment.len() > 1
        && chars.all(|c| c.is_ascii_digit())
}

fn pascal_case(segment: &str) -> String {
    segment
        .split(['-', '_'])
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            chars.next().map_or_else(String::new, |first| {
                first.to_uppercase().chain(chars).collect()
            })
        })
        .collect()
}

struct CatalogEntry {
    name: String,
    factory: HandlerFactory,
}

/// Named handler factories, bound to configured topics by naming convention.
///
/// A handler named `CameraResultHandler` serves the configured subscribe entry
/// whose key is `CameraResult`, or failing that, a topic whose keywords it
/// shares: at least half of them (and at least one), ignoring case. The best
/// score wins and ties go to the earlier entry.
#[derive(Default)]
pub struct HandlerCatalog {
    entries: Vec<CatalogEntry>,
}

impl HandlerCatalog {
    /// Create an empty catalog
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a named factory
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, factory: HandlerFactory) -> Self {
        self.entries.push(CatalogEntry {
            name: name.into(),
            factory,
        });
        self
    }

    /// Names in catalog order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    /// Find the handler for a configured subscribe entry
    #[must_use]
    pub fn lookup(&self, key: &str, topic: &str) -> Option<&str> {
        self.find(key, topic).map(|e| e.name.as_str())
    }

    fn find(&self, key: &str, topic: &str) -> Option<&CatalogEntry> {
        if let Some(entry) = self
            .entries
            .iter()
            .find(|e| base_name(&e.name).eq_ignore_ascii_case(base_name(key)))
        {
            return Some(entry);
        }

        let keywords = topic_keywords(topic);
        let required = (keywords.len() / 2).max(1);

        let mut best: Option<(usize, &CatalogEntry)> = None;
        for entry in &self.entries {
            let name = base_name(&entry.name).to_ascii_lowercase();
            let score = keywords
                .iter()
                .filter(|k| name.contains(&k.to_ascii_lowercase()))
                .count();
            if score >= required && best.map_or(true, |(top, _)| score > top) {
                best = Some((score, entry));
            }
        }
        best.map(|(_, entry)| entry)
    }

    /// Check that every configured subscribe entry maps to a handler
    pub fn validate(&self, subscribe: &BTreeMap<String, String>) -> IosResult<()> {
        for (key, topic) in subscribe {
            validate_pattern(topic)?;
            if self.find(key, topic).is_none() {
                return Err(IosError::config(format!(
                    "No handler found for subscribe entry '{key}' ({topic})"
                )));
            }
        }
        Ok(())
    }

    /// Build a registry from configuration.
    ///
    /// Entries without a handler, or with a malformed or duplicate topic, are
    /// logged and left unmapped; they fall through to `default` at dispatch.
    #[must_use]
    pub fn bind(
        &self,
        subscribe: &BTreeMap<String, String>,
        default: HandlerFactory,
    ) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new(default);
        for (key, topic) in subscribe {
            let Some(entry) = self.find(key, topic) else {
                warn!(key = %key, topic = %topic, "No handler found for subscribe entry");
                continue;
            };
            match registry.register(topic, Arc::clone(&entry.factory)) {
                Ok(()) => debug!(key = %key, topic = %topic, handler = %entry.name, "Bound handler"),
                Err(e) => warn!(key = %key, topic = %topic, error = %e, "Skipping subscribe entry"),
            }
        }
        registry
    }
}

impl fmt::Debug for HandlerCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

fn base_name(name: &str) -> &str {
    name.strip_suffix("Handler").unwrap_or(name)
}

/// Outcome of one dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The handler completed
    Handled,
    /// The handler returned an error
    Failed(IosError),
    /// The handler panicked
    Panicked(String),
}

impl DispatchOutcome {
    /// Whether the handler completed
    #[must_use]
    pub fn is_handled(&self) -> bool {
        matches!(self, Self::Handled)
    }
}

/// Dispatch counters
#[derive(Debug, Default)]
pub struct DispatchStats {
    dispatched: AtomicU64,
    handled: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
    unmatched: AtomicU64,
}

impl DispatchStats {
    /// Record a dispatch
    pub fn record_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful handler run
    pub fn record_handled(&self) {
        self.handled.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a handler error
    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a handler panic
    pub fn record_panicked(&self) {
        self.panicked.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a topic that fell through to the default handler
    pub fn record_unmatched(&self) {
        self.unmatched.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters
    #[must_use]
    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            handled: self.handled.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
            unmatched: self.unmatched.load(Ordering::Relaxed),
        }
    }
}

/// Copy of [`DispatchStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchStatsSnapshot {
    /// Messages dispatched
    pub dispatched: u64,
    /// Handler runs that completed
    pub handled: u64,
    /// Handler runs that returned an error
    pub failed: u64,
    /// Handler runs that panicked
    pub panicked: u64,
    /// Messages routed to the default handler
    pub unmatched: u64,
}

type RegistryBuilder = Box<dyn Fn() -> HandlerRegistry + Send + Sync>;

/// Resolves and runs handlers for inbound messages.
///
/// `dispatch` never fails: handler errors and panics are logged with the
/// topic and payload, counted, and reported in the returned outcome.
pub struct Dispatcher {
    registry: OnceCell<HandlerRegistry>,
    builder: Option<RegistryBuilder>,
    stats: DispatchStats,
}

impl Dispatcher {
    /// Dispatch through an already built registry
    #[must_use]
    pub fn new(registry: HandlerRegistry) -> Self {
        Self {
            registry: OnceCell::with_value(registry),
            builder: None,
            stats: DispatchStats::default(),
        }
    }

    /// Build the registry on first dispatch. Concurrent first dispatches
    /// build it once.
    #[must_use]
    pub fn lazy<F>(builder: F) -> Self
    where
        F: Fn() -> HandlerRegistry + Send + Sync + 'static,
    {
        Self {
            registry: OnceCell::new(),
            builder: Some(Box::new(builder)),
            stats: DispatchStats::default(),
        }
    }

    /// The registry, building it if needed
    pub fn registry(&self) -> &HandlerRegistry {
        self.registry.get_or_init(|| {
            let registry = self
                .builder
                .as_ref()
                .map_or_else(HandlerRegistry::default, |build| build());
            debug!(registrations = registry.len(), "Handler registry built");
            registry
        })
    }

    /// Whether the registry has been built
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.registry.get().is_some()
    }

    /// Route one message to its handler
    pub async fn dispatch(&self, topic: &str, payload: &str) -> DispatchOutcome {
        self.stats.record_dispatched();

        let registry = self.registry();
        if !registry.resolve(topic).is_matched() {
            self.stats.record_unmatched();
        }
        let handler = registry.create_handler(topic);

        let run = AssertUnwindSafe(handler.process_message(topic, payload)).catch_unwind();
        match run.await {
            Ok(Ok(())) => {
                self.stats.record_handled();
                DispatchOutcome::Handled
            }
            Ok(Err(e)) => {
                self.stats.record_failed();
                error!(
                    handler = %handler.name(),
                    topic = %topic,
                    payload = %preview(payload),
                    error = %e,
                    "Handler failed"
                );
                DispatchOutcome::Failed(e)
            }
            Err(panic) => {
                self.stats.record_panicked();
                let message = panic_message(panic.as_ref());
                error!(
                    handler = %handler.name(),
                    topic = %topic,
                    payload = %preview(payload),
                    panic = %message,
                    "Handler panicked"
                );
                DispatchOutcome::Panicked(message)
            }
        }
    }

    /// Dispatch counters
    #[must_use]
    pub fn stats(&self) -> DispatchStatsSnapshot {
        self.stats.snapshot()
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("initialized", &self.is_initialized())
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn preview(payload: &str) -> &str {
    if payload.len() <= PAYLOAD_LOG_LIMIT {
        return payload;
    }
    let mut end = PAYLOAD_LOG_LIMIT;
    while !payload.is_char_boundary(end) {
        end -= 1;
    }
    &payload[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    struct Recording {
        name: &'static str,
        seen: Arc<Mutex<Vec<(String, String)>>>,
    }

    #[async_trait]
    impl MessageHandler for Recording {
        fn name(&self) -> &str {
            self.name
        }

        fn supported_topics(&self) -> Vec<TopicPattern> {
            Vec::new()
        }

        async fn process_message(&self, topic: &str, payload: &str) -> IosResult<()> {
            self.seen.lock().push((self.name.to_string(), format!("{topic}:{payload}")));
            Ok(())
        }
    }

    fn recording(name: &'static str, seen: &Arc<Mutex<Vec<(String, String)>>>) -> HandlerFactory {
        let seen = Arc::clone(seen);
        factory(move || {
            Arc::new(Recording {
                name,
                seen: Arc::clone(&seen),
            })
        })
    }

    struct Failing;

    #[async_trait]
    impl MessageHandler for Failing {
        fn name(&self) -> &str {
            "Failing"
        }

        fn supported_topics(&self) -> Vec<TopicPattern> {
            Vec::new()
        }

        async fn process_message(&self, _topic: &str, _payload: &str) -> IosResult<()> {
            Err(IosError::handler("boom"))
        }
    }

    struct Panicking;

    #[async_trait]
    impl MessageHandler for Panicking {
        fn name(&self) -> &str {
            "Panicking"
        }

        fn supported_topics(&self) -> Vec<TopicPattern> {
            Vec::new()
        }

        async fn process_message(&self, _topic: &str, _payload: &str) -> IosResult<()> {
            panic!("handler exploded");
        }
    }

    #[test]
    fn test_exact_beats_earlier_wildcard() {
        let seen = Arc::default();
        let mut registry = HandlerRegistry::default();
        registry.register("ios/v1/+/camera/result", recording("wild", &seen)).unwrap();
        registry.register("ios/v1/vision/camera/result", recording("exact", &seen)).unwrap();

        assert_eq!(registry.create_handler("ios/v1/vision/camera/result").name(), "exact");
        assert_eq!(registry.create_handler("ios/v1/other/camera/result").name(), "wild");
    }

    #[test]
    fn test_first_wildcard_wins() {
        let seen = Arc::default();
        let mut registry = HandlerRegistry::default();
        registry.register("ios/#", recording("broad", &seen)).unwrap();
        registry.register("ios/v1/+/result", recording("narrow", &seen)).unwrap();

        assert!(matches!(registry.resolve("ios/v1/x/result"), Resolution::Pattern(p) if p.as_str() == "ios/#"));
    }

    #[test]
    fn test_unmapped_topic_uses_default() {
        let registry = HandlerRegistry::default();
        assert_eq!(registry.resolve("nowhere"), Resolution::Default);
        assert_eq!(registry.create_handler("nowhere").name(), "DefaultHandler");
    }

    #[test]
    fn test_register_rejects_bad_and_duplicate_patterns() {
        let seen = Arc::default();
        let mut registry = HandlerRegistry::default();

        let err = registry.register("ios/#/bad", recording("a", &seen)).unwrap_err();
        assert!(matches!(err, IosError::Topic(_)));

        registry.register("ios/a", recording("a", &seen)).unwrap();
        let err = registry.register("ios/a", recording("b", &seen)).unwrap_err();
        assert!(matches!(err, IosError::Configuration(_)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_topic_keywords() {
        assert_eq!(
            topic_keywords("ios/v1/sensor/grating/trigger"),
            vec!["Sensor", "Grating", "Trigger"]
        );
        // "vision" starts with a v but is not a version segment
        assert_eq!(
            topic_keywords("ios/v12/vision/camera/result"),
            vec!["Vision", "Camera", "Result"]
        );
        assert_eq!(topic_keywords("plant/coder_service/+"), vec!["Plant", "CoderService"]);
    }

    fn catalog(seen: &Arc<Mutex<Vec<(String, String)>>>) -> HandlerCatalog {
        HandlerCatalog::new()
            .with("CameraResultHandler", recording("camera", seen))
            .with("HeightResultHandler", recording("height", seen))
            .with("MotionCompleteHandler", recording("motion", seen))
    }

    #[test]
    fn test_catalog_picks_best_score() {
        let seen = Arc::default();
        let catalog = catalog(&seen);
        assert_eq!(
            catalog.lookup("Anything", "ios/v1/vision/height/result"),
            Some("HeightResultHandler")
        );
        assert_eq!(
            catalog.lookup("Anything", "ios/v1/vision/camera/result"),
            Some("CameraResultHandler")
        );
        assert_eq!(catalog.lookup("Anything", "ios/v1/coder/service/start"), None);
    }

    #[test]
    fn test_catalog_key_match_wins() {
        let seen = Arc::default();
        let catalog = catalog(&seen);
        assert_eq!(
            catalog.lookup("MotionComplete", "plant/line-3/done"),
            Some("MotionCompleteHandler")
        );
    }

    #[test]
    fn test_catalog_validate_is_eager() {
        let seen = Arc::default();
        let catalog = catalog(&seen);

        let mut subscribe = BTreeMap::new();
        subscribe.insert("CameraResult".to_string(), "ios/v1/vision/camera/result".to_string());
        assert!(catalog.validate(&subscribe).is_ok());

        subscribe.insert("Orphan".to_string(), "ios/v1/orphan/topic".to_string());
        let err = catalog.validate(&subscribe).unwrap_err();
        assert!(err.to_string().contains("Orphan"));
    }

    #[test]
    fn test_catalog_bind_skips_unmapped() {
        let seen = Arc::default();
        let catalog = catalog(&seen);

        let mut subscribe = BTreeMap::new();
        subscribe.insert("CameraResult".to_string(), "ios/v1/vision/camera/result".to_string());
        subscribe.insert("Orphan".to_string(), "ios/v1/orphan/topic".to_string());

        let registry = catalog.bind(&subscribe, factory(|| Arc::new(DefaultHandler)));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.create_handler("ios/v1/orphan/topic").name(), "DefaultHandler");
    }

    #[tokio::test]
    async fn test_dispatch_routes_payload() {
        let seen: Arc<Mutex<Vec<(String, String)>>> = Arc::default();
        let mut registry = HandlerRegistry::default();
        registry.register("ios/v1/sensor/+/trigger", recording("trigger", &seen)).unwrap();

        let dispatcher = Dispatcher::new(registry);
        let outcome = dispatcher.dispatch("ios/v1/sensor/grating/trigger", "forward").await;

        assert!(outcome.is_handled());
        assert_eq!(
            seen.lock().as_slice(),
            &[("trigger".to_string(), "ios/v1/sensor/grating/trigger:forward".to_string())]
        );
    }

    #[tokio::test]
    async fn test_dispatch_isolates_errors_and_panics() {
        let mut registry = HandlerRegistry::default();
        registry.register("fail", factory(|| Arc::new(Failing))).unwrap();
        registry.register("panic", factory(|| Arc::new(Panicking))).unwrap();
        let dispatcher = Dispatcher::new(registry);

        assert!(matches!(dispatcher.dispatch("fail", "{}").await, DispatchOutcome::Failed(_)));
        assert_eq!(
            dispatcher.dispatch("panic", "{}").await,
            DispatchOutcome::Panicked("handler exploded".to_string())
        );
        assert!(dispatcher.dispatch("other", "{}").await.is_handled());

        let stats = dispatcher.stats();
        assert_eq!(stats.dispatched, 3);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.panicked, 1);
        assert_eq!(stats.handled, 1);
        assert_eq!(stats.unmatched, 1);
    }

    #[tokio::test]
    async fn test_lazy_registry_builds_once() {
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&builds);
        let dispatcher = Arc::new(Dispatcher::lazy(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            HandlerRegistry::default()
        }));
        assert!(!dispatcher.is_initialized());

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let dispatcher = Arc::clone(&dispatcher);
                tokio::spawn(async move { dispatcher.dispatch(&format!("t/{i}"), "").await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert!(dispatcher.is_initialized());
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_preview_respects_char_boundaries() {
        let long = "é".repeat(PAYLOAD_LOG_LIMIT);
        let cut = preview(&long);
        assert!(cut.len() <= PAYLOAD_LOG_LIMIT);
        assert!(long.starts_with(cut));
    }
}
