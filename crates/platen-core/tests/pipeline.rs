//! Integration tests for the conversion pipeline.
//!
//! Everything here runs against the in-memory stub engine, so the suite
//! needs neither the native library nor the worker binary.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use platen_core::document::Document;
use platen_core::error::Error;
use platen_core::toolset::{ConversionEvent, StubProbe, StubToolset};
use platen_core::{CancelToken, ConversionFrontend, Outcome};

fn stub_frontend(latency: Duration, probe: StubProbe) -> ConversionFrontend<StubToolset> {
    ConversionFrontend::new(move || Ok(StubToolset::with_probe(latency, probe.clone())))
}

fn document(objects: usize) -> Document {
    let mut doc = Document::default();
    for i in 0..objects {
        doc.add_object(platen_core::DocumentObject::from_html(format!("<p>{}</p>", i)));
    }
    doc
}

#[test]
fn test_results_arrive_in_submission_order_and_never_overlap() {
    let probe = StubProbe::new();
    let frontend = stub_frontend(Duration::from_millis(5), probe.clone());

    let begins = Arc::new(Mutex::new(Vec::new()));
    let begins_clone = begins.clone();
    frontend.on_event(move |event| {
        if let ConversionEvent::Begin { objects } = event {
            begins_clone.lock().unwrap().push(*objects);
        }
    });

    let handles: Vec<_> = (1..=6)
        .map(|n| frontend.convert_async(&document(n), None).unwrap())
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        let out = handle.wait().unwrap();
        // The stub's output names each object; the last one is ours.
        let text = String::from_utf8_lossy(&out).into_owned();
        assert!(text.contains(&format!("object {}", i)));
    }

    assert_eq!(*begins.lock().unwrap(), vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(probe.executed(), 6);
    // At no point were two payloads inside the simulated native call.
    assert_eq!(probe.max_active(), 1);
}

#[test]
fn test_empty_document_resolves_immediately_without_touching_the_queue() {
    let probe = StubProbe::new();
    let frontend = stub_frontend(Duration::from_millis(5), probe.clone());

    let handle = frontend.convert_async(&Document::default(), None).unwrap();
    assert_eq!(handle.wait().unwrap(), Vec::<u8>::new());

    assert_eq!(probe.executed(), 0);
    // The dedicated thread was never even created.
    assert!(!frontend.is_running());
}

#[test]
fn test_dispose_drains_queued_items_before_teardown() {
    let probe = StubProbe::new();
    let frontend = stub_frontend(Duration::from_millis(10), probe.clone());

    let handles: Vec<_> = (0..5)
        .map(|_| frontend.convert_async(&document(1), None).unwrap())
        .collect();

    frontend.dispose();

    for handle in handles {
        handle.wait().unwrap();
    }
    assert_eq!(probe.executed(), 5);
}

#[test]
fn test_convert_after_dispose_fails_closed_never_queues() {
    let probe = StubProbe::new();
    let frontend = stub_frontend(Duration::ZERO, probe.clone());
    frontend.convert(&document(1)).unwrap();
    frontend.dispose();

    for _ in 0..3 {
        assert!(matches!(
            frontend.convert_async(&document(1), None),
            Err(Error::Closed)
        ));
    }
    assert_eq!(probe.executed(), 1);
}

#[test]
fn test_abort_discards_queued_items_and_rebuilds_lazily() {
    let probe = StubProbe::new();
    let frontend = stub_frontend(Duration::from_millis(30), probe.clone());

    // One item in flight, four queued behind it.
    let in_flight = frontend.convert_async(&document(1), None).unwrap();
    while probe.active() == 0 {
        std::thread::sleep(Duration::from_millis(1));
    }
    let queued: Vec<_> = (0..4)
        .map(|_| frontend.convert_async(&document(1), None).unwrap())
        .collect();

    frontend.abort();

    for handle in queued {
        assert!(matches!(handle.wait(), Err(Error::Closed)));
    }
    // Only the in-flight item may have executed.
    let _ = in_flight.wait();
    assert_eq!(probe.executed(), 1);

    // The frontend recycles: the next request builds a fresh pipeline with
    // a distinguishable fresh instance.
    let out = frontend.convert(&document(1)).unwrap();
    assert!(out.starts_with(b"%PDF"));
    assert_eq!(probe.instances(), 2);
}

#[test]
fn test_cancel_before_start_prevents_execution() {
    let probe = StubProbe::new();
    let frontend = stub_frontend(Duration::from_millis(40), probe.clone());

    let in_flight = frontend.convert_async(&document(1), None).unwrap();
    while probe.active() == 0 {
        std::thread::sleep(Duration::from_millis(1));
    }

    let token = CancelToken::new();
    let queued = frontend.convert_async(&document(1), Some(&token)).unwrap();
    token.cancel();

    assert!(matches!(queued.wait(), Err(Error::Cancelled)));
    let _ = in_flight.wait();

    // Give the pipeline a moment to wind down, then verify the cancelled
    // item never entered the simulated native call.
    std::thread::sleep(Duration::from_millis(80));
    assert_eq!(probe.executed(), 1);
}

#[test]
fn test_pre_cancelled_token_short_circuits() {
    let probe = StubProbe::new();
    let frontend = stub_frontend(Duration::ZERO, probe.clone());

    let token = CancelToken::new();
    token.cancel();

    let handle = frontend.convert_async(&document(1), Some(&token)).unwrap();
    assert!(matches!(handle.wait_outcome(), Outcome::Cancelled));
    assert_eq!(probe.executed(), 0);
}

#[test]
fn test_cancellation_is_pipeline_wide() {
    let probe = StubProbe::new();
    let frontend = stub_frontend(Duration::from_millis(50), probe.clone());

    let token = CancelToken::new();
    let cancelled = frontend.convert_async(&document(1), Some(&token)).unwrap();
    while probe.active() == 0 {
        std::thread::sleep(Duration::from_millis(1));
    }
    let bystander = frontend.convert_async(&document(1), None).unwrap();

    // Cancelling one in-flight request tears the whole pipeline down.
    token.cancel();

    assert!(matches!(cancelled.wait(), Err(Error::Cancelled)));
    assert!(matches!(bystander.wait(), Err(Error::Closed)));

    // But a new request rebuilds a fresh pipeline.
    frontend.convert(&document(1)).unwrap();
    assert_eq!(probe.instances(), 2);
}

#[test]
fn test_three_conversions_serialize_on_one_thread() {
    let probe = StubProbe::new();
    let frontend = stub_frontend(Duration::from_millis(50), probe.clone());

    // Warm up so thread/toolset construction stays out of the measurement.
    frontend.convert(&document(1)).unwrap();

    let start = Instant::now();
    let handles: Vec<_> = (0..3)
        .map(|_| frontend.convert_async(&document(1), None).unwrap())
        .collect();
    for handle in handles {
        handle.wait().unwrap();
    }
    let elapsed = start.elapsed();

    // Serialized: ~150ms, not ~50ms. Generous upper bound for slow CI.
    assert!(
        elapsed >= Duration::from_millis(140),
        "conversions overlapped: {:?}",
        elapsed
    );
    assert!(
        elapsed < Duration::from_millis(1000),
        "conversions took too long: {:?}",
        elapsed
    );
    assert_eq!(probe.max_active(), 1);
}

#[test]
fn test_construction_fault_surfaces_synchronously() {
    let frontend: ConversionFrontend<StubToolset> = ConversionFrontend::new(|| {
        Err(Error::Construction("deployment directory missing".to_string()))
    });
    assert!(matches!(
        frontend.convert_async(&document(1), None),
        Err(Error::Construction(_))
    ));
}

#[test]
fn test_fault_does_not_poison_the_pipeline() {
    let probe = StubProbe::new();
    let frontend = stub_frontend(Duration::ZERO, probe.clone());

    let mut failing = Document::default();
    failing.add_object(platen_core::DocumentObject::from_html(
        String::from_utf8_lossy(platen_core::toolset::FAIL_MARKER).into_owned(),
    ));

    assert!(matches!(frontend.convert(&failing), Err(Error::Conversion(_))));

    // The executor survives an item-level fault: the next request runs on
    // the same instance.
    frontend.convert(&document(1)).unwrap();
    assert_eq!(probe.executed(), 2);
    assert_eq!(probe.instances(), 1);
}

#[test]
fn test_events_fan_out_to_subscribers() {
    let frontend = stub_frontend(Duration::ZERO, StubProbe::new());
    let finishes = Arc::new(AtomicUsize::new(0));
    let finishes_clone = finishes.clone();
    frontend.on_event(move |event| {
        if matches!(event, ConversionEvent::Finish { success: true }) {
            finishes_clone.fetch_add(1, Ordering::SeqCst);
        }
    });

    frontend.convert(&document(1)).unwrap();
    frontend.convert(&document(2)).unwrap();
    assert_eq!(finishes.load(Ordering::SeqCst), 2);
}

#[test]
fn test_independent_pipelines_run_in_parallel() {
    let shared_probe = StubProbe::new();
    let first = stub_frontend(Duration::from_millis(60), shared_probe.clone());
    let second = stub_frontend(Duration::from_millis(60), shared_probe.clone());

    let start = Instant::now();
    let a = first.convert_async(&document(1), None).unwrap();
    let b = second.convert_async(&document(1), None).unwrap();
    a.wait().unwrap();
    b.wait().unwrap();
    let elapsed = start.elapsed();

    // Two pipelines, two threads: the conversions overlap.
    assert!(
        elapsed < Duration::from_millis(115),
        "independent pipelines serialized: {:?}",
        elapsed
    );
    assert_eq!(shared_probe.max_active(), 2);
}
