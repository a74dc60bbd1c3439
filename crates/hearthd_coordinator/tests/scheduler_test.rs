use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use hearthd_coordinator::Coordinator;
use hearthd_coordinator::Entry;
use hearthd_coordinator::Scheduler;
use hearthd_coordinator::SchedulerOptions;
use hearthd_coordinator::UpdateFailed;
use hearthd_coordinator::fetch_fn;

fn secs(s: f64) -> Duration {
    Duration::from_secs_f64(s)
}

/// Coordinator whose fetches take `delay` and count themselves.
fn coordinator(interval: Option<Duration>, delay: Duration) -> (Arc<AtomicUsize>, Coordinator<usize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let coordinator = Coordinator::builder(
        "meter",
        fetch_fn(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                tokio::time::sleep(delay).await;
                Ok(n)
            }
        }),
    )
    .update_interval(interval)
    .build();
    (calls, coordinator)
}

#[tokio::test(start_paused = true)]
async fn test_entry_polls_on_interval() {
    let (calls, coordinator) = coordinator(Some(secs(30.0)), Duration::ZERO);
    let entry = Entry::setup("meter", coordinator, SchedulerOptions::default())
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::sleep(secs(31.0)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    tokio::time::sleep(secs(30.0)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(entry.coordinator().data().as_deref(), Some(&3));

    entry.unload();
    tokio::time::sleep(secs(120.0)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_reschedule_measures_from_now() {
    let (calls, coordinator) = coordinator(Some(secs(30.0)), Duration::ZERO);
    let scheduler = Scheduler::new(coordinator.clone(), SchedulerOptions::default());
    scheduler.start();

    // Two thirds into the old interval; the next poll is 5s from here, not 10s.
    tokio::time::sleep(secs(20.0)).await;
    scheduler.reschedule(Some(secs(5.0)));
    assert_eq!(coordinator.update_interval(), Some(secs(5.0)));

    tokio::time::sleep(secs(4.9)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    tokio::time::sleep(secs(0.2)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::sleep(secs(5.0)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_slow_fetch_does_not_stack_ticks() {
    // Each fetch outlasts the interval; overlapping ticks join the running fetch.
    let (calls, coordinator) = coordinator(Some(secs(1.0)), secs(2.5));
    let scheduler = Scheduler::new(coordinator.clone(), SchedulerOptions::default());
    scheduler.start();

    tokio::time::sleep(secs(3.2)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(coordinator.data().as_deref(), None);

    tokio::time::sleep(secs(0.5)).await;
    assert_eq!(coordinator.data().as_deref(), Some(&1));
    scheduler.stop();
}

#[tokio::test(start_paused = true)]
async fn test_polling_continues_after_failures() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let coordinator: Coordinator<usize> = Coordinator::builder(
        "flaky",
        fetch_fn(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow::Error::new(UpdateFailed::new("timeout talking to hub"))) }
        }),
    )
    .update_interval(Some(secs(10.0)))
    .build();

    let scheduler = Scheduler::new(coordinator.clone(), SchedulerOptions::default());
    scheduler.start();

    tokio::time::sleep(secs(35.0)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(!coordinator.last_update_success());
    scheduler.stop();
}

#[tokio::test(start_paused = true)]
async fn test_request_refresh_cooldown() {
    let (calls, coordinator) = coordinator(None, Duration::ZERO);
    let scheduler = Scheduler::new(
        coordinator,
        SchedulerOptions {
            refresh_on_start: false,
            request_refresh_cooldown: secs(2.0),
        },
    );
    scheduler.start();

    scheduler.request_refresh();
    tokio::time::sleep(secs(0.1)).await;
    scheduler.request_refresh();
    scheduler.request_refresh();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::sleep(secs(2.0)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // Past the cooldown a request runs immediately again.
    tokio::time::sleep(secs(5.0)).await;
    scheduler.request_refresh();
    tokio::time::sleep(secs(0.1)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}
