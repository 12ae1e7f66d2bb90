//! Ordered middleware chain and the cursor that drives it.
//!
//! A [`Chain`] is registration-ordered: the first middleware registered is
//! the outermost. Running a chain nests each step's segment under the
//! previous one and appends each step's name to the path stack, so a
//! request that flows `logger → auth → users` produces both the segment
//! chain `root → logger → auth → users` and the name `logger/auth/users`.
//!
//! Delegation goes through [`Next`], a cursor over the remaining steps.
//! `Next::run` consumes the cursor, so a middleware can delegate at most
//! once; not calling it ends the chain early (an auth rejection, a cache
//! hit) and that is not an error.

use std::sync::Arc;

use crate::context::RequestContext;
use crate::exchange::Exchange;
use crate::middleware::{BoxedMiddleware, Completion, Middleware};

#[derive(Clone)]
struct Step {
    name: Arc<str>,
    middleware: BoxedMiddleware,
}

// ── Chain ─────────────────────────────────────────────────────────────────────

/// An immutable, shareable middleware pipeline.
///
/// Built once at startup, cloned freely afterwards: the step list lives in
/// an `Arc`, so a clone per connection or per worker costs one reference
/// count bump. Registration methods take `self` and return the extended
/// chain, same as the builder pattern everywhere else in this crate:
///
/// ```
/// use spoor::{Chain, Completion, Exchange, Next};
///
/// async fn logger(_ex: Exchange, next: Next) -> Completion {
///     next.run().await
/// }
/// async fn users(ex: Exchange, _next: Next) -> Completion {
///     ex.set_body("[]");
///     Ok(())
/// }
///
/// let chain = Chain::new().with("logger", logger).with("users", users);
/// assert_eq!(chain.len(), 2);
/// ```
#[derive(Clone)]
pub struct Chain {
    steps: Arc<[Step]>,
}

impl Chain {
    pub fn new() -> Self {
        Self { steps: Vec::new().into() }
    }

    /// Registers `middleware` under `name` as the new innermost step. The
    /// name becomes the step's segment name and its path-stack component.
    pub fn with(self, name: impl Into<String>, middleware: impl Middleware) -> Self {
        let mut steps = self.steps.to_vec();
        steps.push(Step {
            name: name.into().into(),
            middleware: middleware.into_boxed_middleware(),
        });
        Self { steps: steps.into() }
    }

    /// Registers `middleware` under an ordinal name (`middleware-0`,
    /// `middleware-1`, …). Prefer [`with`](Chain::with); named steps make
    /// for readable traces.
    pub fn push(self, middleware: impl Middleware) -> Self {
        let name = format!("middleware-{}", self.steps.len());
        self.with(name, middleware)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Runs the whole chain against `context`.
    ///
    /// The outcome is relayed to the caller unchanged. An error that
    /// escapes the outermost step is additionally recorded on the context
    /// — once, here, not per step — so the finished trace carries it.
    pub async fn run(&self, context: &RequestContext) -> Completion {
        let next = Next {
            steps: Arc::clone(&self.steps),
            index: 0,
            exchange: context.exchange(),
        };
        let result = next.run().await;
        if let Err(error) = &result {
            context.record_failure(error);
        }
        result
    }
}

impl Default for Chain {
    fn default() -> Self {
        Self::new()
    }
}

// ── Next ──────────────────────────────────────────────────────────────────────

/// Cursor over the remaining steps of a running chain.
///
/// Handed to each middleware alongside its [`Exchange`]. Calling
/// [`run`](Next::run) executes the rest of the chain nested under the
/// caller's segment; the cursor is consumed by the call, so the remainder
/// cannot run twice.
pub struct Next {
    steps: Arc<[Step]>,
    index: usize,
    exchange: Exchange,
}

impl Next {
    /// Runs the remaining steps. Past the last step this resolves `Ok(())`
    /// immediately, so the innermost middleware can always delegate without
    /// caring whether anything follows it.
    pub async fn run(self) -> Completion {
        let Next { steps, index, exchange } = self;
        let Some(Step { name, middleware }) = steps.get(index).cloned() else {
            return Ok(());
        };
        exchange
            .invoke(&name, move |child| {
                let next = Next { steps, index: index + 1, exchange: child.clone() };
                middleware.call(child, next)
            })
            .await
    }

    /// A cursor with no steps left, for exercising middleware in isolation.
    #[cfg(test)]
    pub(crate) fn terminal(exchange: Exchange) -> Self {
        Self { steps: Vec::new().into(), index: 0, exchange }
    }
}
