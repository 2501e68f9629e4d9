//! Event bus tests

use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use stackd::events::bus::{EventBus, Subscription};
use stackd::models::operation::{
    Operation, OperationAction, OperationEvent, OperationEventType, OperationRequest,
};

fn event(operation_id: &str, event_type: OperationEventType, progress: u8) -> OperationEvent {
    let mut operation = Operation::new(
        operation_id.to_string(),
        "whoami",
        OperationAction::Install,
        &OperationRequest::default(),
    );
    operation.progress_percent = progress;
    OperationEvent::from_operation(event_type, &operation)
}

fn collector() -> (Arc<Mutex<Vec<u8>>>, impl Fn(&OperationEvent) + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (seen, move |e: &OperationEvent| sink.lock().unwrap().push(e.progress_percent))
}

#[test]
fn test_late_subscriber_gets_latest_only() {
    let bus = EventBus::new(10);
    bus.publish(event("op-1", OperationEventType::Started, 1));
    bus.publish(event("op-1", OperationEventType::Step, 8));

    let (seen, callback) = collector();
    let _subscription = bus.subscribe("op-1", callback);
    assert_eq!(*seen.lock().unwrap(), vec![8]);

    bus.publish(event("op-1", OperationEventType::Step, 15));
    assert_eq!(*seen.lock().unwrap(), vec![8, 15]);
}

#[test]
fn test_events_are_scoped_to_operation() {
    let bus = EventBus::new(10);
    let (seen, callback) = collector();
    let _subscription = bus.subscribe("op-1", callback);

    bus.publish(event("op-2", OperationEventType::Step, 50));
    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(bus.latest("op-2").map(|e| e.progress_percent), Some(50));
}

#[test]
fn test_unsubscribe_and_drop_remove_subscriber() {
    let bus = EventBus::new(10);
    let (seen, callback) = collector();

    let subscription = bus.subscribe("op-1", callback);
    let (_, other) = collector();
    let second = bus.subscribe("op-1", other);
    assert_eq!(bus.subscriber_count("op-1"), 2);

    subscription.unsubscribe();
    assert_eq!(bus.subscriber_count("op-1"), 1);
    bus.publish(event("op-1", OperationEventType::Step, 20));
    assert!(seen.lock().unwrap().is_empty());

    drop(second);
    assert_eq!(bus.subscriber_count("op-1"), 0);
}

#[test]
fn test_latest_cache_is_bounded() {
    let bus = EventBus::new(2);
    bus.publish(event("op-1", OperationEventType::Completed, 100));
    bus.publish(event("op-2", OperationEventType::Completed, 100));
    bus.publish(event("op-1", OperationEventType::Completed, 100));
    bus.publish(event("op-3", OperationEventType::Started, 1));

    assert_eq!(bus.retained_count(), 2);
    // op-2 is the least recently published
    assert!(bus.latest("op-2").is_none());
    assert!(bus.latest("op-1").is_some());
    assert!(bus.latest("op-3").is_some());
}

#[tokio::test]
async fn test_subscribe_channel() {
    let bus = EventBus::new(10);
    bus.publish(event("op-1", OperationEventType::Started, 1));

    let (subscription, mut rx) = bus.subscribe_channel("op-1");
    bus.publish(event("op-1", OperationEventType::Completed, 100));

    assert_eq!(rx.recv().await.unwrap().event_type, OperationEventType::Started);
    assert_eq!(rx.recv().await.unwrap().event_type, OperationEventType::Completed);

    drop(subscription);
    assert!(rx.recv().await.is_none());
}

/// Run `f` on another thread, failing if it does not return in time
fn within_timeout(f: impl FnOnce() + Send + 'static) {
    let (done_tx, done_rx) = mpsc::channel();
    thread::spawn(move || {
        f();
        let _ = done_tx.send(());
    });
    done_rx
        .recv_timeout(Duration::from_secs(3))
        .expect("publish did not return");
}

#[test]
fn test_callback_drops_own_subscription_on_terminal_event() {
    let bus = Arc::new(EventBus::new(10));
    let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let (own, sink) = (slot.clone(), seen.clone());
    let subscription = bus.subscribe("op-1", move |e: &OperationEvent| {
        sink.lock().unwrap().push(e.progress_percent);
        if e.event_type.is_terminal() {
            own.lock().unwrap().take();
        }
    });
    *slot.lock().unwrap() = Some(subscription);

    let publisher = bus.clone();
    within_timeout(move || {
        publisher.publish(event("op-1", OperationEventType::Step, 50));
        publisher.publish(event("op-1", OperationEventType::Completed, 100));
        publisher.publish(event("op-1", OperationEventType::Step, 7));
    });

    assert_eq!(*seen.lock().unwrap(), vec![50, 100]);
    assert_eq!(bus.subscriber_count("op-1"), 0);
}

#[test]
fn test_callback_can_read_bus() {
    let bus = Arc::new(EventBus::new(10));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let (reader, sink) = (bus.clone(), seen.clone());
    let _subscription = bus.subscribe("op-1", move |e: &OperationEvent| {
        let latest = reader.latest(&e.operation_id).map(|l| l.progress_percent);
        sink.lock()
            .unwrap()
            .push((reader.subscriber_count(&e.operation_id), latest));
    });

    let publisher = bus.clone();
    within_timeout(move || publisher.publish(event("op-1", OperationEventType::Step, 30)));

    assert_eq!(*seen.lock().unwrap(), vec![(1, Some(30))]);
}

#[test]
fn test_publish_from_callback_keeps_order() {
    let bus = Arc::new(EventBus::new(10));
    let (seen, callback) = collector();
    let _first = bus.subscribe("op-1", callback);

    let publisher = bus.clone();
    let _second = bus.subscribe("op-1", move |e: &OperationEvent| {
        if e.event_type == OperationEventType::Started {
            publisher.publish(event("op-1", OperationEventType::Completed, 100));
        }
    });

    let outer = bus.clone();
    within_timeout(move || outer.publish(event("op-1", OperationEventType::Started, 1)));

    // The nested event waits until every subscriber saw the outer one
    assert_eq!(*seen.lock().unwrap(), vec![1, 100]);
    assert_eq!(bus.latest("op-1").map(|e| e.progress_percent), Some(100));
}
