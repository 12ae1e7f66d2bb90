//! # spoor
//!
//! Per-request tracing for middleware-chain web services: who ran, how
//! long, and which middleware earned the transaction its name.
//!
//! ## The contract
//!
//! spoor is the engine inside an APM agent, not the agent. A framework
//! adapter owns the sockets and calls spoor at five moments (request
//! start, middleware dispatch, response mutation, unhandled error,
//! request end — see [`Engine`]); spoor owns everything in between. The
//! collector wire protocol stays on the far side of [`TraceSink`].
//!
//! What the adapter and collector own — spoor intentionally ignores:
//!
//! - **HTTP serving** — hyper, or the framework's own listener
//! - **Routing** — the framework
//! - **Trace export** — whatever [`TraceSink`] you plug in
//! - **Sampling, cross-process propagation** — agent policy layers
//!
//! What's left for spoor — the part every agent rebuilds:
//!
//! - A segment tree per request whose shape is deterministic however the
//!   async runtime interleaves the work
//! - A transaction name derived from which middleware actually claimed
//!   the response, not merely which ones delegated
//! - A lifecycle that makes late timers, duplicate completions, and
//!   leaked contexts harmless
//!
//! ## Quick start
//!
//! ```rust
//! use http::{Method, StatusCode};
//! use spoor::{Chain, Completion, Engine, Exchange, Next, RequestParts};
//!
//! async fn logger(_ex: Exchange, next: Next) -> Completion {
//!     next.run().await
//! }
//!
//! async fn users(ex: Exchange, _next: Next) -> Completion {
//!     let db = ex.open_segment("db-lookup");
//!     // ... the actual work ...
//!     db.close();
//!     ex.set_status(StatusCode::OK);
//!     ex.set_body(r#"["ada","grace"]"#);
//!     Ok(())
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let engine = Engine::new();
//!     let chain = Chain::new().with("logger", logger).with("users", users);
//!
//!     // Per request, driven by your framework adapter:
//!     let context = engine.on_request_start(RequestParts::new(Method::GET, "/users"));
//!     chain.run(&context).await.unwrap();
//!     engine.on_request_end(&context); // trace delivered to the sink
//! }
//! ```
//!
//! The trace for that request names the transaction `logger/users` (the
//! `users` step claimed the response), nests `db-lookup` under `users`
//! under `logger`, and reaches the sink exactly once.

mod chain;
mod clock;
mod context;
mod engine;
mod error;
mod exchange;
mod middleware;
mod name;
mod segment;
mod trace;

pub use chain::{Chain, Next};
pub use clock::{Clock, ManualClock, SystemClock};
pub use context::{Deferral, Lifecycle, RequestContext, SegmentGuard};
pub use engine::{DEFAULT_SEGMENT_BUDGET, Engine, EngineBuilder, RequestId};
pub use error::{BoxError, TraceError};
pub use exchange::{Exchange, RequestParts, ResponseParts};
pub use middleware::{Completion, Middleware};
pub use name::MutationKind;
pub use segment::{SegmentId, SegmentRecord, TRUNCATED_PREFIX};
pub use trace::{FinishedTrace, LogSink, TraceSink};
