//! spoor wired into a hyper server by hand — the adapter role.
//!
//! Run with:
//!   RUST_LOG=debug cargo run --example hello
//!
//! Try:
//!   curl -i http://localhost:3000/users
//!   curl -i http://localhost:3000/healthz
//!   curl -i http://localhost:3000/nope
//!
//! Watch the log: each response is followed by a "trace finished" line from
//! the default sink, carrying the transaction name (`logger/health/users`
//! for the first curl) and the segment count.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;
use http_body_util::Full;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use spoor::{Chain, Completion, Engine, Exchange, Next, RequestParts};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let engine = Engine::new();
    // Safety net for connections this adapter loses track of.
    let _reaper = engine.reap_every(Duration::from_secs(30), Duration::from_secs(60));

    let chain = Chain::new()
        .with("logger", logger)
        .with("health", health)
        .with("users", users)
        .with("not-found", not_found);

    let addr: SocketAddr = ([0, 0, 0, 0], 3000).into();
    let listener = TcpListener::bind(addr).await.expect("bind failed");
    info!(%addr, "listening");

    loop {
        let (stream, _) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(error) => {
                warn!(%error, "accept failed");
                continue;
            }
        };
        let engine = engine.clone();
        let chain = chain.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| handle(engine.clone(), chain.clone(), req));
            if let Err(error) = ConnBuilder::new(TokioExecutor::new())
                .serve_connection(io, service)
                .await
            {
                debug!(%error, "connection closed with error");
            }
        });
    }
}

/// The whole adapter: request in, engine events around the chain, response
/// out of the context's snapshot.
async fn handle(
    engine: Engine,
    chain: Chain,
    req: hyper::Request<hyper::body::Incoming>,
) -> Result<hyper::Response<Full<Bytes>>, Infallible> {
    let mut parts = RequestParts::new(req.method().clone(), req.uri().path());
    for (name, value) in req.headers() {
        if let Ok(value) = value.to_str() {
            parts = parts.with_header(name.as_str(), value);
        }
    }

    let context = engine.on_request_start(parts);
    let outcome = chain.run(&context).await;

    let snapshot = context.response();
    let status = snapshot.status().unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = hyper::Response::builder().status(status);
    for (name, value) in snapshot.headers() {
        response = response.header(name.as_str(), value.as_str());
    }
    let body = snapshot.body().cloned().unwrap_or_else(Bytes::new);

    // Finalize after the snapshot; the sink logs the finished trace.
    engine.on_request_end(&context);
    if let Err(error) = outcome {
        warn!(%error, "request failed");
    }

    Ok(response.body(Full::new(body)).expect("response assembly"))
}

// Outermost: one log line per request, after everything below ran.
async fn logger(ex: Exchange, next: Next) -> Completion {
    let result = next.run().await;
    let status = ex.response().status().map(|s| s.as_u16());
    info!(method = %ex.request().method(), path = ex.request().path(), status, "handled");
    result
}

// GET /healthz ends the chain here; the trace is named logger/health.
async fn health(ex: Exchange, next: Next) -> Completion {
    if ex.request().path() == "/healthz" {
        ex.set_status(StatusCode::NO_CONTENT);
        return Ok(());
    }
    next.run().await
}

// GET /users owns its route. The db-lookup segment shows up nested under
// `users` in the finished trace, with the sleep as its duration.
async fn users(ex: Exchange, next: Next) -> Completion {
    if ex.request().path() != "/users" {
        return next.run().await;
    }
    let db = ex.open_segment("db-lookup");
    tokio::time::sleep(Duration::from_millis(25)).await;
    db.close();
    ex.insert_header("content-type", "application/json");
    ex.set_status(StatusCode::OK);
    ex.set_body(r#"[{"id":"1","name":"alice"}]"#);
    Ok(())
}

// Innermost: anything nobody claimed is a 404.
async fn not_found(ex: Exchange, _next: Next) -> Completion {
    ex.set_status(StatusCode::NOT_FOUND);
    ex.set_body(r#"{"error":"no such route"}"#);
    Ok(())
}
