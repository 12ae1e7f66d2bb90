//! The finished trace and where it goes.
//!
//! Finalization produces exactly one [`FinishedTrace`] per request and
//! hands it to the engine's [`TraceSink`]. The sink is the integration
//! point for whatever backend collects traces; [`LogSink`], the default,
//! writes one structured log line per request. The engine always calls
//! [`TraceSink::consume`] outside its own locks, so a sink may block or
//! take locks of its own without wedging request handling.

use std::time::Duration;

use http::StatusCode;
use tracing::{info, warn};

use crate::engine::RequestId;
use crate::error::TraceError;
use crate::segment::SegmentRecord;

/// Everything the engine captured about one completed request.
#[derive(Clone, Debug)]
pub struct FinishedTrace {
    pub request_id: RequestId,
    /// The transaction name: the claimed slice of the path stack, or the
    /// root segment's name if nothing ever claimed.
    pub name: String,
    /// Wall time from request start to finalization.
    pub duration: Duration,
    /// Response status, if one was assigned.
    pub status: Option<StatusCode>,
    /// Failures that escaped the chain, in arrival order.
    pub errors: Vec<TraceError>,
    /// Root of the segment tree. Its children are the outermost
    /// invocations.
    pub root: SegmentRecord,
}

impl FinishedTrace {
    /// True when at least one failure escaped the chain.
    pub fn is_error(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Pre-order walk of the segment tree as `(depth, segment)` pairs, for
    /// sinks that render flat lists instead of trees.
    pub fn flatten(&self) -> Vec<(usize, &SegmentRecord)> {
        fn walk<'a>(
            segment: &'a SegmentRecord,
            depth: usize,
            out: &mut Vec<(usize, &'a SegmentRecord)>,
        ) {
            out.push((depth, segment));
            for child in &segment.children {
                walk(child, depth + 1, out);
            }
        }
        let mut out = Vec::with_capacity(self.root.count());
        walk(&self.root, 0, &mut out);
        out
    }
}

// ── Sinks ─────────────────────────────────────────────────────────────────────

/// Consumer of finished traces.
///
/// Implementations receive each trace exactly once, by value, after the
/// owning context reached `Done`. Called from whichever task finalized the
/// request.
pub trait TraceSink: Send + Sync + 'static {
    fn consume(&self, trace: FinishedTrace);
}

/// The default sink: one `tracing` event per finished trace.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl TraceSink for LogSink {
    fn consume(&self, trace: FinishedTrace) {
        let status = trace.status.map(|s| s.as_u16());
        let duration_ms = trace.duration.as_millis() as u64;
        if trace.is_error() {
            warn!(
                id = %trace.request_id,
                name = %trace.name,
                duration_ms,
                status,
                segments = trace.root.count(),
                error = %trace.errors[0],
                "trace finished with failure"
            );
        } else {
            info!(
                id = %trace.request_id,
                name = %trace.name,
                duration_ms,
                status,
                segments = trace.root.count(),
                "trace finished"
            );
        }
    }
}
