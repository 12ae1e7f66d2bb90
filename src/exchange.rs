//! Per-request view handed to middleware.
//!
//! An [`Exchange`] is a cheap clone: a context handle plus the segment its
//! holder runs under. Everything a middleware may touch goes through it —
//! the request descriptor, the response descriptor, the path stack, custom
//! segments. Cloning one into a spawned task (or capturing a
//! [`Deferral`](crate::Deferral)) is what keeps later work attached to the
//! request that scheduled it, no matter which task or thread resumes it.

use std::future::Future;

use bytes::Bytes;
use http::{Method, StatusCode};
use tracing::trace;

use crate::context::{Deferral, RequestContext, SegmentGuard};
use crate::middleware::Completion;
use crate::segment::SegmentId;

// ── RequestParts ──────────────────────────────────────────────────────────────

/// The read-only request descriptor the adapter captured at request start.
pub struct RequestParts {
    method: Method,
    path: String,
    headers: Vec<(String, String)>,
}

impl RequestParts {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self { method, path: path.into(), headers: Vec::new() }
    }

    /// Adds a header. Returns `self` so the adapter can chain while copying
    /// the inbound request over.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    pub fn method(&self) -> &Method { &self.method }
    pub fn path(&self) -> &str { &self.path }
    pub fn headers(&self) -> &[(String, String)] { &self.headers }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

// ── ResponseParts ─────────────────────────────────────────────────────────────

/// The mutable response descriptor.
///
/// Middleware assign into it through [`Exchange::set_status`] /
/// [`Exchange::set_body`]; the adapter snapshots it after the chain to write
/// the real response. Body and status assignments double as the name
/// trigger: each one re-claims the transaction name at the current path
/// stack. Headers do not.
#[derive(Clone, Debug, Default)]
pub struct ResponseParts {
    status: Option<StatusCode>,
    headers: Vec<(String, String)>,
    body: Option<Bytes>,
}

impl ResponseParts {
    pub fn status(&self) -> Option<StatusCode> { self.status }
    pub fn body(&self) -> Option<&Bytes> { self.body.as_ref() }
    pub fn headers(&self) -> &[(String, String)] { &self.headers }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// True once a body or status has been assigned — once some middleware
    /// has determined the response.
    pub fn is_set(&self) -> bool {
        self.status.is_some() || self.body.is_some()
    }

    pub(crate) fn set_status(&mut self, status: StatusCode) {
        self.status = Some(status);
    }

    pub(crate) fn set_body(&mut self, body: Bytes) {
        self.body = Some(body);
    }

    pub(crate) fn push_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_owned(), value.to_owned()));
    }
}

// ── Exchange ──────────────────────────────────────────────────────────────────

/// One middleware's view of one request.
///
/// Holds the context handle and the segment the holder runs under. Clones
/// are cheap (one Arc bump) and keep working after the middleware returns,
/// which is how work in continuations stays attached to the right request.
/// Once the context finishes, every mutation here is a silent no-op.
#[derive(Clone)]
pub struct Exchange {
    context: RequestContext,
    segment: SegmentId,
}

impl Exchange {
    pub(crate) fn new(context: RequestContext, segment: SegmentId) -> Self {
        Self { context, segment }
    }

    /// The owning context handle.
    pub fn context(&self) -> &RequestContext { &self.context }

    /// The request descriptor.
    pub fn request(&self) -> &RequestParts { self.context.request() }

    /// Snapshot of the response descriptor as assigned so far.
    pub fn response(&self) -> ResponseParts { self.context.response() }

    /// Assigns the response status. Fires the name trigger.
    pub fn set_status(&self, status: StatusCode) {
        self.context.set_status(status);
    }

    /// Assigns the response body. Fires the name trigger.
    pub fn set_body(&self, body: impl Into<Bytes>) {
        self.context.set_body(body.into());
    }

    /// Adds a response header. Headers are not a name trigger.
    pub fn insert_header(&self, name: &str, value: &str) {
        self.context.insert_header(name, value);
    }

    /// Appends a component to the path stack, ordered after every append
    /// made on this request so far.
    pub fn append_path(&self, component: &str) {
        self.context.append_path(component);
    }

    /// Opens a custom segment under the holder's segment — a datastore
    /// call, a template render. It closes when the guard drops, or earlier
    /// through [`SegmentGuard::close`].
    pub fn open_segment(&self, name: &str) -> SegmentGuard {
        let id = self.context.open_segment(self.segment, name);
        SegmentGuard::new(self.context.clone(), id)
    }

    /// Captures the context and the holder's segment for work that resumes
    /// later, outside this middleware's own future.
    pub fn deferral(&self) -> Deferral {
        Deferral::new(self.context.clone(), self.segment)
    }

    /// Runs `real` as one instrumented middleware invocation: opens a
    /// segment named `name` under the holder's segment, appends `name` to
    /// the path stack, hands `real` a view rooted at the new segment, and
    /// closes the segment exactly once when `real`'s future completes.
    /// Success or error, the result is relayed unchanged.
    ///
    /// This is the raw form of what [`Chain`](crate::Chain) does per step;
    /// adapters that drive a framework's own dispatch loop call it
    /// directly.
    pub async fn invoke<F, Fut>(&self, name: &str, real: F) -> Completion
    where
        F: FnOnce(Exchange) -> Fut,
        Fut: Future<Output = Completion>,
    {
        self.context.activate();
        let segment = self.context.open_segment(self.segment, name);
        trace!(id = %self.context.id(), segment = name, "middleware invoked");
        self.context.append_path(name);
        let result = real(Exchange::new(self.context.clone(), segment)).await;
        self.context.close_segment(segment);
        result
    }
}
