//! Grain orchestration surface (§4.8): `activate(grain_id) -> handle` and
//! `handle.submit(events)`, the two operations external collaborators use to
//! observe the core.
//!
//! Activation loads the projection and retries transient backend failures
//! with bounded backoff ([`retry::retry_with_predicate`]); fatal failures
//! fail activation outright and no handle is issued. A handle owns a single
//! in-flight save — concurrent `submit` calls on the same handle serialize
//! through an internal lock (§5).
//!
//! Reactor dispatch is out of `grainstore-core`'s scope (§4.5 describes the
//! state machine, not a dispatcher); this crate supplies one, guarded per
//! reactor by a [`circuit_breaker::CircuitBreaker`] so a reactor that keeps
//! failing across different events gets a cooldown instead of being hammered
//! on every `submit`.

pub mod circuit_breaker;
pub mod dispatch;
pub mod retry;

use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use grainstore_core::backend::RowStore;
use grainstore_core::error::StoreError;
use grainstore_core::event::Event;
use grainstore_core::ids::GrainId;
use grainstore_core::processor::{self, ProjectionWriteIntent};
use grainstore_core::projection::ProjectionMeta;
use grainstore_core::reactor::ReactorId;
use grainstore_core::registry::StreamRegistry;
use retry::RetryPolicy;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Per-engine configuration (§6 "Configuration surface"): the backend
/// handle, the save coordinator's batch size override, and the activation
/// retry policy.
#[derive(Clone)]
pub struct EngineConfig {
    /// Passed through to every [`grainstore_core::save::SaveOperation`]
    /// (§4.3, default [`grainstore_core::backend::DEFAULT_MAX_BATCH_SIZE`]).
    pub max_batch_size: usize,
    /// Bounded-backoff policy for activation-time projection loads (§4.8).
    pub activation_retry: RetryPolicy,
    /// Circuit breaker configuration applied independently to each reactor
    /// id dispatched by [`GrainHandle::submit`].
    pub reactor_breaker: CircuitBreakerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_batch_size: grainstore_core::backend::DEFAULT_MAX_BATCH_SIZE,
            activation_retry: RetryPolicy::default(),
            reactor_breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Orchestrates activation for one entity type: a fixed `RowStore`,
/// `StreamRegistry`, and [`EngineConfig`], shared across every grain of that
/// type (§6 "built once, held behind an `Arc`").
pub struct GrainEngine<E, P> {
    store: Arc<dyn RowStore>,
    registry: Arc<StreamRegistry<E, P>>,
    config: EngineConfig,
    breakers: Mutex<HashMap<ReactorId, CircuitBreaker>>,
}

impl<E, P> GrainEngine<E, P>
where
    E: Event + Serialize + Clone + Send + Sync + 'static,
    P: Serialize + DeserializeOwned + Default + Send + Sync + 'static,
{
    /// Build an engine over `store`, bound to `registry`.
    #[must_use]
    pub fn new(store: Arc<dyn RowStore>, registry: Arc<StreamRegistry<E, P>>, config: EngineConfig) -> Self {
        Self {
            store,
            registry,
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Activate a grain: load its projection, retrying transient backend
    /// failures with bounded backoff (§4.8). Fatal failures are returned
    /// immediately and no handle is issued.
    ///
    /// # Errors
    ///
    /// Returns the last [`StoreError`] once the activation retry budget is
    /// exhausted, or immediately for any non-retryable error.
    #[tracing::instrument(skip(self), fields(grain_id = %grain_id))]
    pub async fn activate(&self, grain_id: GrainId) -> Result<GrainHandle<E, P>, StoreError> {
        let policy = self.config.activation_retry.clone();
        let projection = retry::retry_with_predicate(
            policy,
            || processor::load::<P>(self.store.as_ref(), &grain_id),
            StoreError::is_retryable,
        )
        .await?;

        Ok(GrainHandle {
            grain_id,
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            max_batch_size: self.config.max_batch_size,
            state: Mutex::new(projection),
        })
    }

    async fn breaker_for(&self, reactor_id: &ReactorId) -> CircuitBreaker {
        let mut breakers = self.breakers.lock().await;
        breakers
            .entry(reactor_id.clone())
            .or_insert_with(|| CircuitBreaker::new(self.config.reactor_breaker.clone()))
            .clone()
    }
}

/// A handle to one activated grain (§4.8): owns the single in-flight save
/// slot for that grain. Concurrent `submit` calls on the same handle
/// serialize through `state`'s lock.
pub struct GrainHandle<E, P> {
    grain_id: GrainId,
    store: Arc<dyn RowStore>,
    registry: Arc<StreamRegistry<E, P>>,
    max_batch_size: usize,
    state: Mutex<ProjectionMeta<P>>,
}

impl<E, P> GrainHandle<E, P>
where
    E: Event + Serialize + Clone,
    P: Serialize + Clone,
{
    /// This handle's grain identity.
    #[must_use]
    pub const fn grain_id(&self) -> &GrainId {
        &self.grain_id
    }

    /// A snapshot of the current projection (after the most recent
    /// successful `submit`, or as loaded at activation).
    pub async fn projection(&self) -> ProjectionMeta<P> {
        self.state.lock().await.clone()
    }

    /// Fold `events` into the projection and persist the result (§4.6, §4.3).
    ///
    /// On [`StoreError::ConcurrencyConflict`] the caller should re-activate
    /// and retry (§4.8 "the core does not loop internally" — this handle
    /// does not retry conflicts itself, only the activation load).
    ///
    /// # Errors
    ///
    /// Returns whatever [`processor::apply`] returns.
    #[tracing::instrument(skip(self, events), fields(grain_id = %self.grain_id, event_count = events.len()))]
    pub async fn submit(&self, events: Vec<E>) -> Result<ProjectionMeta<P>, StoreError> {
        let mut guard = self.state.lock().await;

        let write_intent = if guard.next_sequence.value() == 0 && guard.event_count == 0 {
            ProjectionWriteIntent::Insert
        } else {
            ProjectionWriteIntent::Cas(guard.version_token.clone())
        };

        let mut projection_data = guard.data.clone();
        let outcome = processor::apply(
            self.store.as_ref(),
            &self.grain_id,
            self.registry.as_ref(),
            &mut projection_data,
            guard.next_sequence,
            guard.event_count,
            write_intent,
            events,
            self.max_batch_size,
        )
        .await?;

        let updated = ProjectionMeta {
            data: projection_data,
            next_sequence: outcome.final_next_sequence,
            event_count: outcome.final_event_count,
            timestamp: chrono::Utc::now(),
            version_token: outcome.projection_version_token,
        };
        *guard = updated.clone();
        Ok(updated)
    }
}

/// Guard reactor dispatch with a per-reactor circuit breaker (supplemented
/// feature: see `DESIGN.md`). `react` is only invoked while the breaker for
/// `reactor_id` is closed or half-open; an open breaker fails fast with
/// [`circuit_breaker::CircuitBreakerError::Open`], leaving the event's
/// reactor status untouched for a later attempt.
///
/// # Errors
///
/// Propagates the breaker's rejection or `react`'s own error.
pub async fn dispatch_guarded<E, P, F, Fut, T, Err>(
    engine: &GrainEngine<E, P>,
    reactor_id: &ReactorId,
    react: F,
) -> Result<T, circuit_breaker::CircuitBreakerError<Err>>
where
    E: Event + Serialize + Clone + Send + Sync + 'static,
    P: Serialize + DeserializeOwned + Default + Send + Sync + 'static,
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T, Err>>,
{
    let breaker = engine.breaker_for(reactor_id).await;
    breaker.call(react).await
}
