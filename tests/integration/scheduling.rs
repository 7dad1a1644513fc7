//! Scheduler behavior under real time: interval re-firing, stop semantics,
//! and overlap of slow iterations.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use healthwatch::registry::{CheckConstructor, Registry};
use healthwatch::sinks::Emitter;
use healthwatch::{CheckFn, CheckResult, Outcome};

mod helpers;
use helpers::*;

fn counting_constructor(calls: Arc<AtomicUsize>, delay: Duration) -> CheckConstructor {
    Box::new(move |_args| {
        let calls = Arc::clone(&calls);
        let check: CheckFn = Arc::new(move || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                CheckResult::new(Outcome::Success, delay)
            }
            .boxed()
        });
        Ok(check)
    })
}

fn spawn_registry(registry: Registry) -> (Arc<Registry>, tokio::task::JoinHandle<()>) {
    let registry = Arc::new(registry);
    let runner = Arc::clone(&registry);
    let handle = tokio::spawn(async move { runner.start_running().await });
    (registry, handle)
}

#[tokio::test]
async fn one_interval_of_waiting_yields_at_least_two_runs() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = Registry::new();
    registry.register_check_constructor("counting", counting_constructor(calls.clone(), Duration::ZERO));
    registry
        .add_check("ticker", "counting", &HashMap::new(), Duration::from_millis(100), vec![])
        .unwrap();

    let (registry, handle) = spawn_registry(registry);

    // immediate first run plus at least one tick
    tokio::time::sleep(Duration::from_millis(250)).await;
    registry.stop_running();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("loops exit after stop")
        .unwrap();

    assert!(calls.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn every_task_ticks_independently() {
    let fast_calls = Arc::new(AtomicUsize::new(0));
    let slow_calls = Arc::new(AtomicUsize::new(0));

    let mut registry = Registry::new();
    registry.register_check_constructor("fast", counting_constructor(fast_calls.clone(), Duration::ZERO));
    registry.register_check_constructor("slow", counting_constructor(slow_calls.clone(), Duration::ZERO));
    registry
        .add_check("fast one", "fast", &HashMap::new(), Duration::from_millis(50), vec![])
        .unwrap();
    registry
        .add_check("slow one", "slow", &HashMap::new(), Duration::from_millis(200), vec![])
        .unwrap();

    let (registry, handle) = spawn_registry(registry);

    tokio::time::sleep(Duration::from_millis(320)).await;
    registry.stop_running();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("loops exit after stop")
        .unwrap();

    let fast = fast_calls.load(Ordering::SeqCst);
    let slow = slow_calls.load(Ordering::SeqCst);
    assert!(fast >= 4, "fast task should have run repeatedly, got {fast}");
    assert!(slow <= 2, "slow task should not be dragged along, got {slow}");
}

#[tokio::test]
async fn stop_is_observed_at_the_next_tick() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = Registry::new();
    registry.register_check_constructor("counting", counting_constructor(calls.clone(), Duration::ZERO));
    registry
        .add_check("ticker", "counting", &HashMap::new(), Duration::from_millis(50), vec![])
        .unwrap();

    let (registry, handle) = spawn_registry(registry);

    tokio::time::sleep(Duration::from_millis(80)).await;
    registry.stop_running();

    // stop returns immediately; give in-flight work time to drain
    tokio::time::sleep(Duration::from_millis(150)).await;
    let settled = calls.load(Ordering::SeqCst);

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(calls.load(Ordering::SeqCst), settled, "no new iterations after stop");

    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("loops exit after stop")
        .unwrap();
}

#[tokio::test]
async fn in_flight_iteration_completes_after_stop() {
    let sink = RecordingSink::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let mut registry = Registry::new();
    registry.register_check_constructor(
        "lagging",
        counting_constructor(calls.clone(), Duration::from_millis(150)),
    );
    registry
        .add_check(
            "laggard",
            "lagging",
            &HashMap::new(),
            Duration::from_millis(500),
            vec![Arc::clone(&sink) as Arc<dyn Emitter>],
        )
        .unwrap();

    let (registry, handle) = spawn_registry(registry);

    // the first iteration is still sleeping when we stop
    tokio::time::sleep(Duration::from_millis(50)).await;
    registry.stop_running();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        sink.emitted().await.len(),
        1,
        "the in-flight iteration still delivers its result"
    );

    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("loops exit after stop")
        .unwrap();
}
