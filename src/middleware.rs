//! Middleware trait and type erasure.
//!
//! # How async middleware are stored
//!
//! A chain holds middleware of *different* concrete types in one ordered
//! list. Rust collections can only hold one concrete type, so we use
//! **trait objects** (`dyn ErasedMiddleware`) to hide each concrete type
//! behind a common interface and store everything uniformly.
//!
//! The chain from user code to vtable call is:
//!
//! ```text
//! async fn auth(ex: Exchange, next: Next) -> Completion { … }  ← user writes this
//!        ↓ chain.with("auth", auth)
//! auth.into_boxed_middleware()                  ← Middleware blanket impl
//!        ↓
//! Arc::new(FnMiddleware(auth))                  ← heap-allocated wrapper
//!        ↓  stored as BoxedMiddleware = Arc<dyn ErasedMiddleware>
//! middleware.call(exchange, next)  per request  ← one vtable dispatch
//!        ↓
//! Box::pin(auth(exchange, next))                ← BoxFuture
//! ```
//!
//! The only per-invocation cost is **one Arc clone** (atomic inc) +
//! **one virtual call** — noise next to the work the middleware awaits.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::chain::Next;
use crate::error::BoxError;
use crate::exchange::Exchange;

/// What a middleware's future resolves to: `Ok(())` when it completed, or
/// the error it threw. The engine relays it to the caller unchanged.
pub type Completion = Result<(), BoxError>;

// ── Internal types ────────────────────────────────────────────────────────────

/// A heap-allocated, type-erased middleware future.
///
/// `Pin<Box<…>>` because the runtime polls the future in-place; it cannot
/// move in memory after the first poll. `Send + 'static` let tokio move it
/// across worker threads.
pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = Completion> + Send + 'static>>;

/// Internal dispatch interface.
///
/// `#[doc(hidden)] pub` rather than `pub(crate)` because it appears in the
/// return type of the public `Middleware` trait's `into_boxed_middleware`
/// method. External crates cannot usefully interact with this trait.
#[doc(hidden)]
pub trait ErasedMiddleware {
    fn call(&self, exchange: Exchange, next: Next) -> BoxFuture;
}

/// A heap-allocated, type-erased middleware shared across concurrent
/// requests.
///
/// `Arc` gives cheap, thread-safe shared ownership (one atomic reference
/// count increment per invocation) without copying the middleware.
#[doc(hidden)]
pub type BoxedMiddleware = Arc<dyn ErasedMiddleware + Send + Sync + 'static>;

// ── Public Middleware trait ───────────────────────────────────────────────────

/// Implemented for every valid middleware.
///
/// You never implement this yourself. It is automatically satisfied for any
/// `async fn` with the signature:
///
/// ```text
/// async fn name(exchange: Exchange, next: Next) -> Completion
/// ```
///
/// Call `next.run().await` to delegate to the rest of the chain; skip it to
/// end the chain here (an auth rejection, a cache hit). `Next` is consumed
/// by the call, so running the remainder twice is unrepresentable.
///
/// The trait is **sealed** (via the private `Sealed` supertrait): only the
/// blanket impl below can satisfy it. This prevents accidental misuse and
/// keeps the API surface stable across versions.
pub trait Middleware: private::Sealed + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_middleware(self) -> BoxedMiddleware;
}

/// The sealing module. Because `Sealed` is private, external crates cannot
/// name it and therefore cannot implement `Middleware` on their own types.
mod private {
    pub trait Sealed {}
}

// ── Blanket implementations ───────────────────────────────────────────────────

/// Implement the sealing trait for any function with the right signature.
///
/// `Fn(Exchange, Next) -> Fut` covers:
///   - named `async fn` items
///   - closures returning `async move` blocks
///   - any struct that implements `Fn`
impl<F, Fut> private::Sealed for F
where
    F: Fn(Exchange, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Completion> + Send + 'static,
{
}

/// Implement `Middleware` for any function with the right signature.
impl<F, Fut> Middleware for F
where
    F: Fn(Exchange, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Completion> + Send + 'static,
{
    fn into_boxed_middleware(self) -> BoxedMiddleware {
        Arc::new(FnMiddleware(self))
    }
}

// ── Concrete wrapper ──────────────────────────────────────────────────────────

/// Newtype wrapper that holds a concrete middleware `F` and implements
/// [`ErasedMiddleware`], bridging the typed world to the trait-object world.
struct FnMiddleware<F>(F);

impl<F, Fut> ErasedMiddleware for FnMiddleware<F>
where
    F: Fn(Exchange, Next) -> Fut + Send + Sync,
    Fut: Future<Output = Completion> + Send + 'static,
{
    fn call(&self, exchange: Exchange, next: Next) -> BoxFuture {
        // Call the wrapped function — this returns the concrete `Fut` —
        // and box the whole thing so the return type matches the trait
        // signature.
        Box::pin((self.0)(exchange, next))
    }
}
