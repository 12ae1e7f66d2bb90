//! Per-request context: lifecycle, segment tree, name state, failures.
//!
//! [`RequestContext`] is a cheap-clone handle. All mutable state for one
//! request — the segment tree, the path stack, the response descriptor, the
//! recorded failures — sits behind one mutex inside it. Wrapper futures,
//! [`Exchange`](crate::Exchange) clones, and [`Deferral`]s each own a
//! handle, so whichever task or thread resumes them mutates the right
//! request. Contexts share nothing with each other.
//!
//! # Lifecycle
//!
//! ```text
//! Created ──first invocation──▶ Active ──finalization──▶ Finalizing ─▶ Done
//! ```
//!
//! Finalization (request end, abort, or the stale reaper) captures the
//! claimed name, closes every still-open segment as truncated, snapshots
//! the tree, and moves to `Done`. After `Done` every mutating entry point
//! is a silent no-op: a late timer firing against a finished request must
//! not corrupt a tree that already left the engine.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::StatusCode;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::clock::Clock;
use crate::engine::RequestId;
use crate::error::{BoxError, TraceError};
use crate::exchange::{Exchange, RequestParts, ResponseParts};
use crate::name::{MutationKind, NameState};
use crate::segment::{SegmentId, SegmentTree};
use crate::trace::FinishedTrace;

/// Where a context is in its life. See the module docs for the transitions.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Lifecycle {
    /// Root segment open, nothing invoked yet.
    Created,
    /// At least one middleware invocation has run.
    Active,
    /// Finalization in progress: name captured, segments closing.
    Finalizing,
    /// Trace handed off. The context is inert; mutations are no-ops.
    Done,
}

struct State {
    lifecycle: Lifecycle,
    tree: SegmentTree,
    name: NameState,
    response: ResponseParts,
    errors: Vec<TraceError>,
}

struct Inner {
    id: RequestId,
    request: RequestParts,
    clock: Arc<dyn Clock>,
    created: Instant,
    state: Mutex<State>,
}

/// Handle to one request's tracing state.
#[derive(Clone)]
pub struct RequestContext {
    inner: Arc<Inner>,
}

impl RequestContext {
    pub(crate) fn new(
        id: RequestId,
        request: RequestParts,
        clock: Arc<dyn Clock>,
        budget: usize,
    ) -> Self {
        let now = clock.now();
        let root_name = format!("{} {}", request.method(), request.path());
        Self {
            inner: Arc::new(Inner {
                id,
                request,
                clock,
                created: now,
                state: Mutex::new(State {
                    lifecycle: Lifecycle::Created,
                    tree: SegmentTree::new(root_name, now, budget),
                    name: NameState::new(),
                    response: ResponseParts::default(),
                    errors: Vec::new(),
                }),
            }),
        }
    }

    pub fn id(&self) -> RequestId { self.inner.id }

    /// The request descriptor captured at start.
    pub fn request(&self) -> &RequestParts { &self.inner.request }

    /// Snapshot of the response descriptor as assigned so far.
    pub fn response(&self) -> ResponseParts { self.inner.state.lock().response.clone() }

    /// Current lifecycle state.
    pub fn state(&self) -> Lifecycle { self.inner.state.lock().lifecycle }

    /// True once the finished trace has been handed off.
    pub fn is_done(&self) -> bool { self.state() == Lifecycle::Done }

    /// A view rooted at the request's root segment — the entry point for
    /// adapters driving [`Exchange::invoke`] themselves.
    pub fn exchange(&self) -> Exchange {
        Exchange::new(self.clone(), SegmentId::ROOT)
    }

    pub(crate) fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.inner.created)
    }

    pub(crate) fn activate(&self) {
        let mut state = self.inner.state.lock();
        if state.lifecycle == Lifecycle::Created {
            state.lifecycle = Lifecycle::Active;
        }
    }

    pub(crate) fn open_segment(&self, parent: SegmentId, name: &str) -> SegmentId {
        let now = self.inner.clock.now();
        let mut state = self.inner.state.lock();
        if state.lifecycle == Lifecycle::Done {
            return parent;
        }
        state.tree.open(parent, name, now)
    }

    pub(crate) fn close_segment(&self, id: SegmentId) {
        let now = self.inner.clock.now();
        let mut state = self.inner.state.lock();
        if state.lifecycle == Lifecycle::Done {
            return;
        }
        state.tree.close(id, now);
    }

    pub(crate) fn append_path(&self, component: &str) {
        let mut state = self.inner.state.lock();
        if state.lifecycle == Lifecycle::Done {
            return;
        }
        state.name.append(component);
    }

    /// Name trigger without a descriptor assignment — for adapters whose
    /// framework owns the real response object.
    pub(crate) fn claim_name(&self, kind: MutationKind) {
        self.mutate_response(kind, |_| {});
    }

    pub(crate) fn set_status(&self, status: StatusCode) {
        self.mutate_response(MutationKind::Status, |response| response.set_status(status));
    }

    pub(crate) fn set_body(&self, body: Bytes) {
        self.mutate_response(MutationKind::Body, |response| response.set_body(body));
    }

    /// Assignment and claim happen under one lock hold so a concurrent
    /// finalization observes either both or neither.
    fn mutate_response(&self, kind: MutationKind, assign: impl FnOnce(&mut ResponseParts)) {
        let mut state = self.inner.state.lock();
        if state.lifecycle == Lifecycle::Done {
            return;
        }
        assign(&mut state.response);
        state.name.claim();
        drop(state);
        trace!(id = %self.inner.id, kind = %kind, "response mutation claimed the name");
    }

    pub(crate) fn insert_header(&self, name: &str, value: &str) {
        let mut state = self.inner.state.lock();
        if state.lifecycle == Lifecycle::Done {
            return;
        }
        state.response.push_header(name, value);
    }

    /// Records a failure that escaped the top of the chain. The error
    /// itself already went back to the application; the trace keeps its
    /// message.
    pub(crate) fn record_failure(&self, error: &BoxError) {
        let mut state = self.inner.state.lock();
        if state.lifecycle == Lifecycle::Done {
            return;
        }
        state.errors.push(TraceError::new(error.to_string()));
        drop(state);
        debug!(id = %self.inner.id, %error, "failure recorded on the trace");
    }

    /// Finalizes the context: captures the claimed name, closes every
    /// still-open segment as truncated, and produces the finished trace.
    /// Returns `None` if the context already finished — late and duplicate
    /// finalization signals are ignored.
    pub(crate) fn finish(&self) -> Option<FinishedTrace> {
        let now = self.inner.clock.now();
        let mut state = self.inner.state.lock();
        if matches!(state.lifecycle, Lifecycle::Finalizing | Lifecycle::Done) {
            return None;
        }
        state.lifecycle = Lifecycle::Finalizing;
        let name = state
            .name
            .resolve()
            .unwrap_or_else(|| state.tree.root_name().to_owned());
        state.tree.close_all(now);
        let root = state.tree.snapshot();
        let finished = FinishedTrace {
            request_id: self.inner.id,
            name,
            duration: root.duration,
            status: state.response.status(),
            errors: std::mem::take(&mut state.errors),
            root,
        };
        state.lifecycle = Lifecycle::Done;
        Some(finished)
    }
}

// ── Deferral ──────────────────────────────────────────────────────────────────

/// Capture of (context, segment) taken when deferred work was scheduled.
///
/// A middleware that hands work to a spawned task, a timer, or any
/// continuation outside its own future captures a `Deferral` first
/// ([`Exchange::deferral`](crate::Exchange::deferral)). Whenever that work
/// resumes — on any task, on any thread — it operates on the captured
/// pair, not on whatever request happens to be in flight by then. Once the
/// context is done, every method here is a silent no-op.
#[derive(Clone)]
pub struct Deferral {
    context: RequestContext,
    anchor: SegmentId,
}

impl Deferral {
    pub(crate) fn new(context: RequestContext, anchor: SegmentId) -> Self {
        Self { context, anchor }
    }

    /// The captured context handle.
    pub fn context(&self) -> &RequestContext { &self.context }

    /// Opens a segment under the captured anchor. If the anchor closed
    /// while the work waited, the segment attaches to its nearest open
    /// ancestor instead.
    pub fn open(&self, name: &str) -> SegmentGuard {
        let id = self.context.open_segment(self.anchor, name);
        SegmentGuard::new(self.context.clone(), id)
    }

    /// Appends a path component, ordered after everything appended so far.
    pub fn append_path(&self, component: &str) {
        self.context.append_path(component);
    }

    /// Assigns the response status. Fires the name trigger.
    pub fn set_status(&self, status: StatusCode) {
        self.context.set_status(status);
    }

    /// Assigns the response body. Fires the name trigger.
    pub fn set_body(&self, body: impl Into<Bytes>) {
        self.context.set_body(body.into());
    }
}

// ── SegmentGuard ──────────────────────────────────────────────────────────────

/// An open custom segment. Dropping the guard closes the segment;
/// [`close`](SegmentGuard::close) just drops it at a point you choose.
pub struct SegmentGuard {
    context: RequestContext,
    id: SegmentId,
}

impl SegmentGuard {
    pub(crate) fn new(context: RequestContext, id: SegmentId) -> Self {
        Self { context, id }
    }

    /// Closes the segment now instead of at the end of scope.
    pub fn close(self) {}
}

impl Drop for SegmentGuard {
    fn drop(&mut self) {
        self.context.close_segment(self.id);
    }
}
