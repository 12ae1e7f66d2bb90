//! End-to-end behavior through the public API: transaction naming, tree
//! shape, error accounting, truncation, deferred work, reaping, timing.

use std::sync::Arc;
use std::time::Duration;

use http::{Method, StatusCode};
use parking_lot::Mutex;

use spoor::{
    BoxError, Chain, Completion, Deferral, Engine, Exchange, FinishedTrace, ManualClock,
    MutationKind, Next, RequestParts, TRUNCATED_PREFIX, TraceSink,
};

#[derive(Clone, Default)]
struct CollectingSink {
    traces: Arc<Mutex<Vec<FinishedTrace>>>,
}

impl CollectingSink {
    fn count(&self) -> usize {
        self.traces.lock().len()
    }

    fn all(&self) -> Vec<FinishedTrace> {
        self.traces.lock().clone()
    }

    fn single(&self) -> FinishedTrace {
        let traces = self.traces.lock();
        assert_eq!(traces.len(), 1, "expected exactly one finished trace");
        traces[0].clone()
    }
}

impl TraceSink for CollectingSink {
    fn consume(&self, trace: FinishedTrace) {
        self.traces.lock().push(trace);
    }
}

fn engine_with_sink() -> (Engine, CollectingSink) {
    let sink = CollectingSink::default();
    (Engine::builder().sink(sink.clone()).build(), sink)
}

fn get(path: &str) -> RequestParts {
    RequestParts::new(Method::GET, path)
}

async fn pass_through(_ex: Exchange, next: Next) -> Completion {
    next.run().await
}

async fn respond_ok(ex: Exchange, _next: Next) -> Completion {
    ex.set_status(StatusCode::OK);
    ex.set_body("done");
    Ok(())
}

// ── Transaction naming ────────────────────────────────────────────────────────

#[tokio::test]
async fn name_concatenates_every_append_in_causal_order() {
    let (engine, sink) = engine_with_sink();
    let chain = Chain::new()
        .with("logger", pass_through)
        .with("auth", |ex: Exchange, next: Next| async move {
            ex.append_path("admin");
            next.run().await
        })
        .with("users", respond_ok);

    let context = engine.on_request_start(get("/admin/users"));
    chain.run(&context).await.unwrap();
    engine.on_request_end(&context);

    assert_eq!(sink.single().name, "logger/auth/admin/users");
}

#[tokio::test]
async fn late_appends_count_when_a_trigger_follows_them() {
    let (engine, sink) = engine_with_sink();
    let chain = Chain::new()
        .with("a", |ex: Exchange, next: Next| async move {
            next.run().await?;
            ex.append_path("a-late");
            ex.set_status(StatusCode::NO_CONTENT);
            Ok(())
        })
        .with("b", |ex: Exchange, _next: Next| async move {
            ex.set_body("payload");
            Ok(())
        });

    let context = engine.on_request_start(get("/late"));
    chain.run(&context).await.unwrap();
    engine.on_request_end(&context);

    let trace = sink.single();
    assert_eq!(trace.name, "a/b/a-late");
    assert_eq!(trace.status, Some(StatusCode::NO_CONTENT));
}

#[tokio::test]
async fn status_after_body_keeps_the_name_without_new_appends() {
    let (engine, sink) = engine_with_sink();
    let chain = Chain::new()
        .with("a", |ex: Exchange, next: Next| async move {
            next.run().await?;
            ex.set_status(StatusCode::OK);
            Ok(())
        })
        .with("b", |ex: Exchange, _next: Next| async move {
            ex.set_body("payload");
            Ok(())
        });

    let context = engine.on_request_start(get("/stable"));
    chain.run(&context).await.unwrap();
    engine.on_request_end(&context);

    let trace = sink.single();
    assert_eq!(trace.name, "a/b");
    assert_eq!(trace.status, Some(StatusCode::OK));
}

#[tokio::test]
async fn delegating_chain_names_by_the_claiming_middleware() {
    let (engine, sink) = engine_with_sink();
    let chain = Chain::new()
        .with("a", |ex: Exchange, next: Next| async move {
            next.run().await?;
            // Work after delegation with no response mutation following it:
            // the component lands on the stack but never in the name.
            ex.append_path("a-end");
            Ok(())
        })
        .with("b", pass_through)
        .with("c", |ex: Exchange, _next: Next| async move {
            ex.set_body("c owns this");
            Ok(())
        });

    let context = engine.on_request_start(get("/abc"));
    chain.run(&context).await.unwrap();
    engine.on_request_end(&context);

    let trace = sink.single();
    assert_eq!(trace.name, "a/b/c");
    let a = trace.root.child("a").expect("a under root");
    let b = a.child("b").expect("b under a");
    let c = b.child("c").expect("c under b");
    assert!(c.children.is_empty());
    assert_eq!(trace.root.count(), 4, "single chain, no stray segments");
}

#[tokio::test]
async fn headers_are_not_a_name_trigger() {
    let (engine, sink) = engine_with_sink();
    let chain = Chain::new()
        .with("cors", |ex: Exchange, next: Next| async move {
            ex.insert_header("access-control-allow-origin", "*");
            next.run().await
        })
        .with("tail", |_ex: Exchange, _next: Next| async move { Ok(()) });

    let context = engine.on_request_start(get("/preflight"));
    chain.run(&context).await.unwrap();
    engine.on_request_end(&context);

    let trace = sink.single();
    assert_eq!(trace.name, "cors/tail", "nothing claimed, whole stack");
    assert_eq!(trace.status, None);
}

#[tokio::test]
async fn empty_chain_falls_back_to_the_root_segment_name() {
    let (engine, sink) = engine_with_sink();
    let context = engine.on_request_start(get("/bare"));
    Chain::new().run(&context).await.unwrap();
    engine.on_request_end(&context);

    let trace = sink.single();
    assert_eq!(trace.name, "GET /bare");
    assert_eq!(trace.root.count(), 1);
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn error_caught_in_chain_reports_no_failure() {
    let (engine, sink) = engine_with_sink();
    let chain = Chain::new()
        .with("rescue", |ex: Exchange, next: Next| async move {
            if next.run().await.is_err() {
                ex.set_status(StatusCode::SERVICE_UNAVAILABLE);
            }
            Ok(())
        })
        .with("flaky", |_ex: Exchange, _next: Next| async move {
            Err::<(), BoxError>("db offline".into())
        });

    let context = engine.on_request_start(get("/flaky"));
    chain.run(&context).await.unwrap();
    engine.on_request_end(&context);

    let trace = sink.single();
    assert!(!trace.is_error());
    assert_eq!(trace.status, Some(StatusCode::SERVICE_UNAVAILABLE));
    let rescue = trace.root.child("rescue").expect("rescue under root");
    assert!(rescue.child("flaky").is_some(), "failed step still traced");
}

#[tokio::test]
async fn error_escaping_the_chain_reports_exactly_one_failure() {
    let (engine, sink) = engine_with_sink();
    let chain = Chain::new()
        .with("outer", pass_through)
        .with("boom", |_ex: Exchange, _next: Next| async move {
            Err::<(), BoxError>("boom".into())
        });

    let context = engine.on_request_start(get("/boom"));
    let error = chain.run(&context).await.unwrap_err();
    assert_eq!(error.to_string(), "boom", "error relayed unchanged");
    engine.on_request_end(&context);

    let trace = sink.single();
    assert_eq!(trace.errors.len(), 1);
    assert_eq!(trace.errors[0].message, "boom");
}

#[tokio::test]
async fn raw_adapter_records_unhandled_errors_itself() {
    let (engine, sink) = engine_with_sink();
    let context = engine.on_request_start(get("/broken"));

    let error = context
        .exchange()
        .invoke("handler", |_inner| async move {
            Err::<(), BoxError>("wires crossed".into())
        })
        .await
        .unwrap_err();
    engine.on_unhandled_error(&context, &error);
    engine.on_request_end(&context);

    let trace = sink.single();
    assert!(trace.is_error());
    assert_eq!(trace.errors[0].message, "wires crossed");
    let handler = trace.root.child("handler").expect("handler under root");
    assert!(!handler.truncated, "closed by the invocation, not the sweep");
}

// ── Tree shape ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn sequential_middleware_nest_one_under_the_previous() {
    let (engine, sink) = engine_with_sink();
    let chain = Chain::new()
        .with("m1", pass_through)
        .with("m2", pass_through)
        .with("m3", pass_through)
        .with("m4", respond_ok);

    let context = engine.on_request_start(get("/deep"));
    chain.run(&context).await.unwrap();
    engine.on_request_end(&context);

    let trace = sink.single();
    let mut level = &trace.root;
    for name in ["m1", "m2", "m3", "m4"] {
        assert_eq!(level.children.len(), 1, "single chain at {}", level.name);
        level = &level.children[0];
        assert_eq!(level.name, name);
    }
    assert!(level.children.is_empty());
}

#[tokio::test]
async fn opens_past_the_budget_collapse_into_one_placeholder() {
    let sink = CollectingSink::default();
    let engine = Engine::builder().segment_budget(2).sink(sink.clone()).build();
    let chain = Chain::new()
        .with("m1", pass_through)
        .with("m2", pass_through)
        .with("m3", pass_through)
        .with("m4", pass_through)
        .with("m5", respond_ok);

    let context = engine.on_request_start(get("/overflow"));
    chain.run(&context).await.unwrap();
    engine.on_request_end(&context);

    let trace = sink.single();
    assert_eq!(trace.name, "m1/m2/m3/m4/m5", "appends are never refused");
    let m2 = trace.root.child("m1").expect("m1").child("m2").expect("m2");
    assert_eq!(m2.children.len(), 1, "one placeholder, not three children");
    let placeholder = &m2.children[0];
    assert_eq!(placeholder.name, format!("{TRUNCATED_PREFIX}m3"));
    assert!(placeholder.truncated);
    assert_eq!(placeholder.collapsed, 3);
    assert!(placeholder.children.is_empty());
}

#[tokio::test]
async fn raw_adapters_drive_invocations_without_a_chain() {
    let (engine, sink) = engine_with_sink();
    let context = engine.on_request_start(get("/widgets/7"));

    context
        .exchange()
        .invoke("guard", |inner| async move {
            inner
                .invoke("handler", |leaf| async move {
                    leaf.append_path("widget");
                    Ok(())
                })
                .await
        })
        .await
        .unwrap();

    engine.on_response_mutation(&context, MutationKind::Status);
    engine.on_request_end(&context);

    let trace = sink.single();
    assert_eq!(trace.name, "guard/handler/widget");
    let guard = trace.root.child("guard").expect("guard under root");
    assert!(guard.child("handler").is_some());
}

// ── Concurrency and deferred work ─────────────────────────────────────────────

#[tokio::test]
async fn concurrent_requests_keep_their_trees_apart() {
    let (engine, sink) = engine_with_sink();
    let gate = Arc::new(tokio::sync::Notify::new());

    let slow_chain = {
        let gate = Arc::clone(&gate);
        Chain::new().with("slow", move |ex: Exchange, _next: Next| {
            let gate = Arc::clone(&gate);
            async move {
                gate.notified().await;
                ex.set_body("slow done");
                Ok(())
            }
        })
    };
    let fast_chain = Chain::new().with("fast", respond_ok);

    let slow_ctx = engine.on_request_start(get("/slow"));
    let fast_ctx = engine.on_request_start(get("/fast"));

    let slow_task = tokio::spawn({
        let engine = engine.clone();
        let slow_ctx = slow_ctx.clone();
        async move {
            slow_chain.run(&slow_ctx).await.unwrap();
            engine.on_request_end(&slow_ctx);
        }
    });

    // The fast request starts later and finishes first.
    fast_chain.run(&fast_ctx).await.unwrap();
    engine.on_request_end(&fast_ctx);

    gate.notify_one();
    slow_task.await.unwrap();

    let traces = sink.all();
    assert_eq!(traces.len(), 2);
    let fast = traces.iter().find(|t| t.name == "fast").expect("fast trace");
    let slow = traces.iter().find(|t| t.name == "slow").expect("slow trace");
    assert_eq!(fast.root.name, "GET /fast");
    assert_eq!(slow.root.name, "GET /slow");
    assert!(fast.root.child("slow").is_none());
    assert!(slow.root.child("fast").is_none());
}

#[tokio::test]
async fn deferred_work_lands_in_its_own_request() {
    let (engine, sink) = engine_with_sink();
    let chain = Chain::new()
        .with("spawner", |ex: Exchange, next: Next| async move {
            let deferral = ex.deferral();
            let worker = tokio::spawn(async move {
                let flush = deferral.open("background-flush");
                deferral.append_path("flushed");
                flush.close();
            });
            worker.await?;
            next.run().await
        })
        .with("respond", respond_ok);

    let context = engine.on_request_start(get("/spawn"));
    chain.run(&context).await.unwrap();
    engine.on_request_end(&context);

    let trace = sink.single();
    assert_eq!(trace.name, "spawner/flushed/respond");
    let spawner = trace.root.child("spawner").expect("spawner under root");
    assert!(spawner.child("background-flush").is_some(), "attached at the anchor");
    assert!(spawner.child("respond").is_some());
}

#[tokio::test]
async fn deferral_after_finish_is_a_silent_no_op() {
    let (engine, sink) = engine_with_sink();
    let stash: Arc<Mutex<Option<Deferral>>> = Arc::new(Mutex::new(None));

    let chain = {
        let stash = Arc::clone(&stash);
        Chain::new().with("worker", move |ex: Exchange, _next: Next| {
            let stash = Arc::clone(&stash);
            async move {
                *stash.lock() = Some(ex.deferral());
                ex.set_body("queued");
                Ok(())
            }
        })
    };

    let context = engine.on_request_start(get("/jobs"));
    chain.run(&context).await.unwrap();
    engine.on_request_end(&context);

    let deferral = stash.lock().take().expect("captured during the request");
    assert!(deferral.context().is_done());
    deferral.append_path("ghost");
    deferral.set_status(StatusCode::ACCEPTED);
    deferral.open("late-segment").close();

    let trace = sink.single();
    assert_eq!(trace.name, "worker");
    assert_eq!(trace.status, None, "late status never landed");
    assert_eq!(trace.root.count(), 2, "root plus worker, nothing late");
}

// ── Reaping and timing ────────────────────────────────────────────────────────

#[test]
fn stale_contexts_are_reaped_with_truncated_segments() {
    let clock = ManualClock::new();
    let sink = CollectingSink::default();
    let engine = Engine::builder()
        .clock(clock.clone())
        .sink(sink.clone())
        .build();

    let context = engine.on_request_start(get("/hung"));
    let dangling = context.exchange().open_segment("never-finishes");
    clock.advance(Duration::from_secs(40));

    assert_eq!(engine.finish_stale(Duration::from_secs(30)), 1);
    assert_eq!(engine.active_requests(), 0);

    let trace = sink.single();
    assert_eq!(trace.name, "GET /hung");
    assert_eq!(trace.duration, Duration::from_secs(40));
    let hung = trace.root.child("never-finishes").expect("dangling segment");
    assert!(hung.truncated);
    assert_eq!(hung.duration, Duration::from_secs(40));

    drop(dangling);
    assert_eq!(sink.count(), 1, "late close after the reap changed nothing");
}

#[tokio::test]
async fn segment_timing_comes_from_the_installed_clock() {
    let clock = ManualClock::new();
    let sink = CollectingSink::default();
    let engine = Engine::builder()
        .clock(clock.clone())
        .sink(sink.clone())
        .build();

    let outer_clock = clock.clone();
    let inner_clock = clock.clone();
    let chain = Chain::new()
        .with("outer", move |_ex: Exchange, next: Next| {
            let clock = outer_clock.clone();
            async move {
                clock.advance(Duration::from_millis(5));
                let result = next.run().await;
                clock.advance(Duration::from_millis(3));
                result
            }
        })
        .with("inner", move |ex: Exchange, _next: Next| {
            let clock = inner_clock.clone();
            async move {
                clock.advance(Duration::from_millis(7));
                ex.set_status(StatusCode::OK);
                Ok(())
            }
        });

    let context = engine.on_request_start(get("/timed"));
    chain.run(&context).await.unwrap();
    engine.on_request_end(&context);

    let trace = sink.single();
    assert_eq!(trace.duration, Duration::from_millis(15));
    let outer = trace.root.child("outer").expect("outer under root");
    assert_eq!(outer.start_offset, Duration::ZERO);
    assert_eq!(outer.duration, Duration::from_millis(15));
    let inner = outer.child("inner").expect("inner under outer");
    assert_eq!(inner.start_offset, Duration::from_millis(5));
    assert_eq!(inner.duration, Duration::from_millis(7));
    assert_eq!(outer.self_time(), Duration::from_millis(8));
}
