//! The engine: request identity, the live-context registry, and the event
//! surface a framework adapter drives.
//!
//! One [`Engine`] serves a whole process. It mints [`RequestId`]s, creates
//! a [`RequestContext`] per inbound request, keeps every live context in a
//! registry until finalization, and hands each
//! [`FinishedTrace`](crate::FinishedTrace) to the configured [`TraceSink`].
//!
//! An adapter maps its framework's moments onto five calls:
//!
//! ```text
//! framework moment              engine call
//! ───────────────────────────   ──────────────────────────────────────────
//! request arrives               on_request_start → RequestContext
//! middleware dispatch           Chain::run, or Exchange::invoke per step
//! response body/status write    on_response_mutation
//!                               (implicit when using Exchange::set_*)
//! error escapes the dispatch    on_unhandled_error
//! response sent, or aborted     on_request_end
//! ```
//!
//! An adapter that misses `on_request_end` for some request — a dropped
//! connection path it never wired — would leak that context forever. The
//! registry is the safety net: [`Engine::finish_stale`] reaps contexts
//! older than a cutoff, and [`Engine::reap_every`] runs that sweep on a
//! timer.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::context::RequestContext;
use crate::error::BoxError;
use crate::exchange::RequestParts;
use crate::name::MutationKind;
use crate::trace::{LogSink, TraceSink};

/// Default cap on concurrently open detailed segments per request.
pub const DEFAULT_SEGMENT_BUDGET: usize = 64;

// ── RequestId ─────────────────────────────────────────────────────────────────

/// Opaque per-request identity, unique within its engine.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct RequestId(u64);

impl RequestId {
    pub(crate) const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Engine ────────────────────────────────────────────────────────────────────

struct EngineInner {
    clock: Arc<dyn Clock>,
    sink: Arc<dyn TraceSink>,
    budget: usize,
    next_id: AtomicU64,
    active: Mutex<HashMap<RequestId, RequestContext>>,
}

/// Process-wide handle. Clones share the registry, the clock, and the sink;
/// keep one per process and clone it into whatever owns your connections.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// An engine with defaults: real clock, [`LogSink`], segment budget
    /// [`DEFAULT_SEGMENT_BUDGET`].
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Admits a request: mints an id, creates its context with an open root
    /// segment named `"METHOD path"`, and registers it as live.
    pub fn on_request_start(&self, request: RequestParts) -> RequestContext {
        let id = RequestId::new(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let context =
            RequestContext::new(id, request, Arc::clone(&self.inner.clock), self.inner.budget);
        self.inner.active.lock().insert(id, context.clone());
        debug!(
            %id,
            method = %context.request().method(),
            path = context.request().path(),
            "request started"
        );
        context
    }

    /// Name trigger for adapters whose framework owns the real response
    /// object: call it when the framework observes a body or status write.
    /// [`Exchange::set_body`]/[`Exchange::set_status`] fire it implicitly.
    ///
    /// [`Exchange::set_body`]: crate::Exchange::set_body
    /// [`Exchange::set_status`]: crate::Exchange::set_status
    pub fn on_response_mutation(&self, context: &RequestContext, kind: MutationKind) {
        context.claim_name(kind);
    }

    /// Records an error that escaped the adapter's dispatch. [`Chain::run`]
    /// does this itself; only raw adapters need to call it.
    ///
    /// [`Chain::run`]: crate::Chain::run
    pub fn on_unhandled_error(&self, context: &RequestContext, error: &BoxError) {
        context.record_failure(error);
    }

    /// Finalizes a request: detaches it from the registry, captures its
    /// name, closes dangling segments as truncated, and delivers the
    /// finished trace to the sink. A second call for the same context is a
    /// no-op; the sink sees each trace exactly once.
    pub fn on_request_end(&self, context: &RequestContext) {
        self.inner.active.lock().remove(&context.id());
        // Consume outside the registry lock; sinks may block.
        if let Some(trace) = context.finish() {
            self.inner.sink.consume(trace);
        }
    }

    /// Number of requests currently live.
    pub fn active_requests(&self) -> usize {
        self.inner.active.lock().len()
    }

    /// Reaps every live context at least `max_age` old: finalizes it (its
    /// still-open segments come out truncated) and delivers the trace.
    /// Returns how many were reaped.
    pub fn finish_stale(&self, max_age: Duration) -> usize {
        let now = self.inner.clock.now();
        let stale: Vec<RequestContext> = {
            let mut active = self.inner.active.lock();
            let ids: Vec<RequestId> = active
                .iter()
                .filter(|(_, context)| context.age(now) >= max_age)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| active.remove(&id)).collect()
        };
        let mut reaped = 0;
        for context in stale {
            warn!(
                id = %context.id(),
                age_ms = context.age(now).as_millis() as u64,
                "request never finished; reaping"
            );
            if let Some(trace) = context.finish() {
                self.inner.sink.consume(trace);
                reaped += 1;
            }
        }
        reaped
    }

    /// Spawns a background task that runs [`finish_stale`] with `max_age`
    /// every `interval`. Requires a tokio runtime. Dropping the handle
    /// detaches the task; abort it at shutdown if you need it gone.
    ///
    /// [`finish_stale`]: Engine::finish_stale
    pub fn reap_every(&self, interval: Duration, max_age: Duration) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick of an interval completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let reaped = engine.finish_stale(max_age);
                if reaped > 0 {
                    debug!(reaped, "stale contexts reaped");
                }
            }
        })
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

// ── EngineBuilder ─────────────────────────────────────────────────────────────

/// Configuration for an [`Engine`]. All knobs have defaults; override what
/// you need and call [`build`](EngineBuilder::build).
///
/// ```
/// use spoor::Engine;
///
/// let engine = Engine::builder().segment_budget(128).build();
/// ```
pub struct EngineBuilder {
    clock: Arc<dyn Clock>,
    sink: Arc<dyn TraceSink>,
    budget: usize,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            sink: Arc::new(LogSink),
            budget: DEFAULT_SEGMENT_BUDGET,
        }
    }
}

impl EngineBuilder {
    /// Replaces the time source. Tests install a
    /// [`ManualClock`](crate::ManualClock) here.
    pub fn clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Replaces the trace sink.
    pub fn sink(mut self, sink: impl TraceSink) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    /// Caps concurrently open detailed segments per request. Clamped to at
    /// least 1 so a tree always keeps some detail.
    pub fn segment_budget(mut self, budget: usize) -> Self {
        self.budget = budget.max(1);
        self
    }

    pub fn build(self) -> Engine {
        Engine {
            inner: Arc::new(EngineInner {
                clock: self.clock,
                sink: self.sink,
                budget: self.budget,
                next_id: AtomicU64::new(1),
                active: Mutex::new(HashMap::new()),
            }),
        }
    }
}
