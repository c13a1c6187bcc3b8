//! Stream registry & matching (§4.7): map event values to streams by type
//! hierarchy; collect handlers/reactors.
//!
//! Polymorphic event hierarchies are modeled as a tagged sum type with a
//! persisted `event_type` discriminator (§9): a stream's "base type" is a set
//! of `event_type` tags, and `matches` is membership in that set rather than
//! a runtime type query.

use crate::error::StoreError;
use crate::ids::StreamName;
use crate::processor::Handler;
use crate::reactor::{Reactor, ReactorId};
use crate::retention::RetentionPolicy;
use std::collections::HashSet;
use std::sync::Arc;

/// A single stream's declaration (§4.7): name, matched event-type tags,
/// handlers, reactors, and retention policy.
pub struct StreamDef<E, P> {
    /// Logical stream name.
    pub name: StreamName,
    /// The tag set an event's `event_type` must belong to for this stream to
    /// match it (the "base event type," §4.7).
    pub event_types: HashSet<&'static str>,
    /// Handlers, invoked in registration order for every matching event.
    pub handlers: Vec<Arc<dyn Handler<E, P>>>,
    /// Reactors, dispatched at-least-once for every matching event.
    pub reactors: Vec<Arc<dyn Reactor<E, P>>>,
    /// This stream's retention policy.
    pub retention_policy: RetentionPolicy,
}

impl<E, P> StreamDef<E, P> {
    /// Start declaring a stream.
    #[must_use]
    pub fn new(name: StreamName, event_types: HashSet<&'static str>) -> Self {
        Self {
            name,
            event_types,
            handlers: Vec::new(),
            reactors: Vec::new(),
            retention_policy: RetentionPolicy::none(),
        }
    }

    /// Append a handler, to run after any already registered (§4.7 "handler
    /// invocation order equals registration order").
    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn Handler<E, P>>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Register a reactor.
    #[must_use]
    pub fn with_reactor(mut self, reactor: Arc<dyn Reactor<E, P>>) -> Self {
        self.reactors.push(reactor);
        self
    }

    /// Set this stream's retention policy.
    #[must_use]
    pub fn with_retention(mut self, policy: RetentionPolicy) -> Self {
        self.retention_policy = policy;
        self
    }

    /// Whether `event_type` is in this stream's tag set.
    #[must_use]
    pub fn matches_type(&self, event_type: &str) -> bool {
        self.event_types.contains(event_type)
    }
}

/// An entity type's immutable, built-once configuration surface (§4.7, §6
/// "Configuration surface"): every declared stream plus its handlers,
/// reactors, and retention policy.
pub struct StreamRegistry<E, P> {
    streams: Vec<StreamDef<E, P>>,
}

impl<E, P> StreamRegistry<E, P> {
    /// Every stream whose tag set contains `event_type` (§4.7 "when multiple
    /// streams match, all are applied").
    #[must_use]
    pub fn matching_streams(&self, event_type: &str) -> Vec<&StreamDef<E, P>> {
        self.streams
            .iter()
            .filter(|s| s.matches_type(event_type))
            .collect()
    }

    /// All declared streams.
    #[must_use]
    pub fn streams(&self) -> &[StreamDef<E, P>] {
        &self.streams
    }
}

/// Builder for [`StreamRegistry`] (§4.7, §6 "per-entity configuration
/// surface").
#[derive(Default)]
pub struct StreamRegistryBuilder<E, P> {
    streams: Vec<StreamDef<E, P>>,
}

impl<E, P> StreamRegistryBuilder<E, P> {
    /// Start with no streams declared.
    #[must_use]
    pub fn new() -> Self {
        Self { streams: Vec::new() }
    }

    /// Declare a stream.
    #[must_use]
    pub fn stream(mut self, def: StreamDef<E, P>) -> Self {
        self.streams.push(def);
        self
    }

    /// Validate and construct the registry.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ConfigInvalid`] if two streams share a name, if
    /// a reactor id repeats across streams, or if two streams whose tag sets
    /// overlap disagree on `until_processed`/`max_age` (§4.7 "ambiguity here
    /// is a configuration error").
    pub fn build(self) -> Result<StreamRegistry<E, P>, StoreError> {
        let mut seen_names = HashSet::new();
        for def in &self.streams {
            if !seen_names.insert(def.name.clone()) {
                return Err(StoreError::ConfigInvalid(format!(
                    "duplicate stream name {}",
                    def.name
                )));
            }
        }

        let mut seen_reactor_ids: HashSet<&ReactorId> = HashSet::new();
        for def in &self.streams {
            for reactor in &def.reactors {
                if !seen_reactor_ids.insert(reactor.id()) {
                    return Err(StoreError::ConfigInvalid(format!(
                        "duplicate reactor id {} across streams",
                        reactor.id()
                    )));
                }
            }
        }

        for (i, a) in self.streams.iter().enumerate() {
            for b in &self.streams[i + 1..] {
                let overlaps = a.event_types.intersection(&b.event_types).next().is_some();
                if overlaps && a.retention_policy.signature() != b.retention_policy.signature() {
                    return Err(StoreError::ConfigInvalid(format!(
                        "streams {} and {} overlap on event types but disagree on retention",
                        a.name, b.name
                    )));
                }
            }
        }

        Ok(StreamRegistry {
            streams: self.streams,
        })
    }
}
