use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracebus::channel::{handler_fn, EventChannel};
use tracebus::PushError;

fn collect(log: Arc<Mutex<Vec<u64>>>) -> impl tracebus::Handler<u64> {
    handler_fn(move |n: Arc<u64>| {
        let log = Arc::clone(&log);
        async move {
            log.lock().unwrap().push(*n);
            Ok(())
        }
    })
}

#[tokio::test]
async fn every_subscriber_sees_events_in_push_order() {
    let channel = EventChannel::<u64>::new("ordered", 4096);
    let first = Arc::new(Mutex::new(Vec::new()));
    let second = Arc::new(Mutex::new(Vec::new()));
    channel.subscribe("first", collect(first.clone()));
    channel.subscribe("second", collect(second.clone()));
    channel.start();

    for n in 0..1000 {
        channel.push(n);
    }
    channel.stop(Duration::from_secs(5)).await;

    let expected: Vec<u64> = (0..1000).collect();
    assert_eq!(*first.lock().unwrap(), expected);
    assert_eq!(*second.lock().unwrap(), expected);
    assert_eq!(channel.stats().delivered, 2000);
}

#[tokio::test]
async fn failing_subscriber_does_not_starve_the_others() {
    let channel = EventChannel::<u64>::new("isolated", 128);
    let attempts = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let counter = attempts.clone();
    channel.subscribe(
        "broken",
        handler_fn(move |_n: Arc<u64>| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err("backend down".into()) }
        }),
    );
    channel.subscribe("healthy", collect(seen.clone()));
    channel.start();

    for n in 0..50 {
        channel.push(n);
    }
    channel.stop(Duration::from_secs(5)).await;

    assert_eq!(attempts.load(Ordering::SeqCst), 50);
    assert_eq!(seen.lock().unwrap().len(), 50);
    let stats = channel.stats();
    assert_eq!((stats.failed, stats.delivered), (50, 50));
}

#[tokio::test]
async fn push_never_blocks_when_nobody_drains() {
    let channel = EventChannel::<u64>::new("bounded", 8);
    let refused = (0..20).filter(|n| channel.try_push(*n).is_err()).count();

    assert_eq!(refused, 12);
    assert_eq!(channel.stats().dropped, 12);
    assert_eq!(channel.stats().queued, 8);
    assert_eq!(channel.try_push(99), Err(PushError::Full("bounded")));
}

#[tokio::test]
async fn unsubscribed_handler_stops_receiving() {
    let channel = EventChannel::<u64>::new("dynamic", 64);
    let kept = Arc::new(Mutex::new(Vec::new()));
    let removed = Arc::new(Mutex::new(Vec::new()));
    channel.subscribe("kept", collect(kept.clone()));
    channel.subscribe("removed", collect(removed.clone()));

    assert!(channel.unsubscribe("removed"));
    assert!(!channel.unsubscribe("removed"));
    assert_eq!(channel.receivers(), vec!["kept".to_string()]);

    channel.start();
    channel.push(1);
    channel.stop(Duration::from_secs(1)).await;
    assert_eq!(*kept.lock().unwrap(), vec![1]);
    assert!(removed.lock().unwrap().is_empty());
}
