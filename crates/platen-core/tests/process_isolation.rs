//! Integration tests for worker-process isolation.
//!
//! These run the real worker binary hosting the stub engine, so they are
//! ignored unless `platen-worker` has been built:
//!
//! ```sh
//! cargo build -p platen-worker
//! PLATEN_WORKER_PATH=target/debug/platen-worker cargo test -- --ignored
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use platen_core::document::Document;
use platen_core::toolset::EngineSpec;
use platen_core::{ConversionFrontend, IsolationBoundary};

#[test]
#[ignore = "requires the platen-worker binary"]
fn test_boundary_load_convert_unload() {
    let boundary = Arc::new(IsolationBoundary::new(EngineSpec::Stub { latency_ms: 0 }));
    let frontend = ConversionFrontend::isolated(boundary.clone());

    let out = frontend.convert(&Document::from_html("<p>hello</p>")).unwrap();
    assert!(out.starts_with(b"%PDF"));
    assert!(boundary.is_loaded());

    frontend.dispose();
    assert!(!boundary.is_loaded());
}

#[test]
#[ignore = "requires the platen-worker binary"]
fn test_reload_serves_a_distinguishable_fresh_instance() {
    let boundary = Arc::new(IsolationBoundary::new(EngineSpec::Stub { latency_ms: 0 }));

    boundary.load().unwrap();
    let first = boundary.instance_id().unwrap();

    boundary.unload();
    assert!(boundary.instance_id().is_none());

    boundary.load().unwrap();
    let second = boundary.instance_id().unwrap();
    assert_ne!(first, second);

    // The fresh instance actually serves conversions.
    let frontend = ConversionFrontend::isolated(boundary.clone());
    let out = frontend.convert(&Document::from_html("<p>again</p>")).unwrap();
    assert!(out.starts_with(b"%PDF"));
}

#[test]
#[ignore = "requires the platen-worker binary"]
fn test_unloaded_fires_once_per_unload() {
    let boundary = Arc::new(IsolationBoundary::new(EngineSpec::Stub { latency_ms: 0 }));
    let fired = Arc::new(AtomicUsize::new(0));
    let fired_clone = fired.clone();
    boundary.on_unloaded(move || {
        fired_clone.fetch_add(1, Ordering::SeqCst);
    });

    boundary.load().unwrap();
    boundary.unload();
    boundary.unload(); // idempotent: no second event
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    boundary.load().unwrap();
    boundary.unload();
    assert_eq!(fired.load(Ordering::SeqCst), 2);
}

#[test]
#[ignore = "requires the platen-worker binary"]
fn test_abort_kills_a_stuck_conversion_and_recovers() {
    // Every conversion on this boundary takes two seconds in the worker.
    let boundary = Arc::new(IsolationBoundary::new(EngineSpec::Stub { latency_ms: 2_000 }));
    let frontend = ConversionFrontend::isolated(boundary.clone());

    let stuck = frontend
        .convert_async(&Document::from_html("<p>slow</p>"), None)
        .unwrap();

    // Let the request reach the worker, then pull the plug.
    let aborter = {
        let frontend = frontend.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            frontend.abort();
        })
    };

    let start = Instant::now();
    let result = stuck.wait();
    let elapsed = start.elapsed();
    aborter.join().unwrap();

    assert!(result.is_err(), "expected the stuck conversion to fail");
    assert!(
        elapsed < Duration::from_secs(1),
        "abort did not unblock the pipeline: {:?}",
        elapsed
    );

    // The next conversion rebuilds a fresh worker and succeeds.
    let out = frontend.convert(&Document::from_html("<p>alive</p>")).unwrap();
    assert!(out.starts_with(b"%PDF"));
}
