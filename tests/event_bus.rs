//! Integration tests for the event bus and the shutdown barrier
//!
//! Exercises delivery isolation between subscribers and the stop-everything barrier
//! with running, already stopped and unresponsive modules.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use aether::error::{ProtocolError, Result};
use aether::events::{types, Event, EventBus, ShutdownBarrier};
use aether::modules::{Module, ModuleLifecycle, ModuleRegistry};

/// Module that records the kinds it handles and can be slowed down.
struct Worker {
    lifecycle: ModuleLifecycle,
    delay: Duration,
    seen: Mutex<Vec<String>>,
    stops: AtomicUsize,
}

impl Worker {
    fn new(name: &str, bus: &EventBus) -> Arc<Self> {
        Self::slow(name, bus, Duration::ZERO)
    }

    fn slow(name: &str, bus: &EventBus, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            lifecycle: ModuleLifecycle::new(name, bus.clone()),
            delay,
            seen: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
        })
    }

    fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

impl Module for Worker {
    fn name(&self) -> &str {
        self.lifecycle.name()
    }

    fn start(&self) -> Result<()> {
        self.lifecycle.start();
        Ok(())
    }

    fn stop(&self) {
        thread::sleep(self.delay);
        self.lifecycle.stop_with(|| {
            self.stops.fetch_add(1, Ordering::SeqCst);
        });
    }

    fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }

    fn handle_event(&self, event: &Event) {
        thread::sleep(self.delay);
        self.seen.lock().unwrap().push(event.kind.clone());
    }
}

/// Module that acknowledges `core.stop` but never confirms.
struct Stubborn {
    running: std::sync::atomic::AtomicBool,
}

impl Module for Stubborn {
    fn name(&self) -> &str {
        "stubborn"
    }

    fn start(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {}

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn test_barrier_waits_for_every_module() {
    let bus = EventBus::new();
    let mut registry = ModuleRegistry::new(bus.clone());

    let workers: Vec<_> = (0..8)
        .map(|i| Worker::slow(&format!("worker-{i}"), &bus, Duration::from_millis(10 * i)))
        .collect();
    for worker in &workers {
        registry.add_module(worker.clone()).unwrap();
    }

    registry.start_all().unwrap();
    registry.stop_all().unwrap();

    for worker in &workers {
        assert!(!worker.is_running(), "{} still running", worker.name());
        assert_eq!(worker.stops.load(Ordering::SeqCst), 1);
    }
    registry.detach();
}

#[test]
fn test_barrier_counts_already_stopped_modules() {
    let bus = EventBus::new();
    let mut registry = ModuleRegistry::new(bus.clone());

    let running = Worker::new("running", &bus);
    let idle = Worker::new("idle", &bus);
    registry.add_module(running.clone()).unwrap();
    registry.add_module(idle.clone()).unwrap();

    registry.start_all().unwrap();
    idle.stop();
    assert!(!idle.is_running());

    registry
        .stop_all_within(Duration::from_secs(5))
        .expect("barrier should not wait for an already stopped module");

    assert!(!running.is_running());
    assert_eq!(idle.stops.load(Ordering::SeqCst), 1);
    registry.detach();
}

#[test]
fn test_barrier_with_nothing_running_returns_immediately() {
    let bus = EventBus::new();
    let modules: Vec<Arc<dyn Module>> = vec![Worker::new("a", &bus), Worker::new("b", &bus)];

    let started = Instant::now();
    ShutdownBarrier::new(bus.clone()).stop_all(&modules).unwrap();

    assert!(started.elapsed() < Duration::from_secs(1));
    // The barrier's own listener is gone again
    assert_eq!(bus.subscriber_count(), 0);
}

#[test]
fn test_stop_all_within_reports_unresponsive_module() {
    let bus = EventBus::new();
    let stubborn = Arc::new(Stubborn {
        running: std::sync::atomic::AtomicBool::new(false),
    });
    let polite = Worker::new("polite", &bus);

    let mut registry = ModuleRegistry::new(bus.clone());
    registry.add_module(stubborn.clone()).unwrap();
    registry.add_module(polite.clone()).unwrap();
    registry.start_all().unwrap();

    let started = Instant::now();
    let result = registry.stop_all_within(Duration::from_millis(200));

    match result {
        Err(ProtocolError::Timeout(message)) => {
            assert!(message.contains("stubborn"));
            assert!(!message.contains("polite"));
        }
        other => panic!("expected a timeout, got {other:?}"),
    }
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(!polite.is_running());
    assert!(stubborn.is_running());
    registry.detach();
}

#[test]
fn test_slow_subscriber_does_not_block_others() {
    let bus = EventBus::new();
    let slow = Worker::slow("slow", &bus, Duration::from_millis(300));
    let fast = Worker::new("fast", &bus);
    slow.start().unwrap();
    fast.start().unwrap();
    bus.subscribe(slow.clone()).unwrap();
    bus.subscribe(fast.clone()).unwrap();

    let started = Instant::now();
    for _ in 0..3 {
        assert_eq!(bus.publish(Event::new("test", "tick")), 2);
    }
    assert!(started.elapsed() < Duration::from_millis(100), "publish waited on a subscriber");

    assert!(wait_until(Duration::from_millis(200), || fast.seen().len() == 3));
    assert!(slow.seen().len() < 3);

    assert!(wait_until(Duration::from_secs(3), || slow.seen().len() == 3));
    bus.unsubscribe_all();
}

#[test]
fn test_targeted_events_reach_only_their_module() {
    let bus = EventBus::new();
    let alpha = Worker::new("alpha", &bus);
    let beta = Worker::new("beta", &bus);
    alpha.start().unwrap();
    beta.start().unwrap();
    bus.subscribe(alpha.clone()).unwrap();
    bus.subscribe(beta.clone()).unwrap();

    assert_eq!(bus.publish(Event::new("test", "ping").to("beta")), 1);
    assert_eq!(bus.publish(Event::new("test", "ping").to("nobody")), 0);
    assert_eq!(bus.publish(Event::new("test", types::CORE_STOP).to("alpha")), 1);

    assert!(wait_until(Duration::from_secs(1), || beta.seen() == vec!["ping"]));
    assert!(wait_until(Duration::from_secs(1), || !alpha.is_running()));
    assert!(alpha.seen().is_empty());
    assert!(beta.is_running());
    bus.unsubscribe_all();
}

#[test]
fn test_events_arrive_in_publish_order() {
    let bus = EventBus::new();
    let worker = Worker::new("ordered", &bus);
    worker.start().unwrap();
    bus.subscribe(worker.clone()).unwrap();

    let kinds: Vec<String> = (0..50).map(|i| format!("step-{i}")).collect();
    for kind in &kinds {
        bus.publish(Event::new("test", kind.as_str()));
    }

    assert!(wait_until(Duration::from_secs(2), || worker.seen().len() == kinds.len()));
    assert_eq!(worker.seen(), kinds);
    bus.unsubscribe_all();
}

#[test]
fn test_restart_through_bus() {
    let bus = EventBus::new();
    let mut registry = ModuleRegistry::new(bus.clone());
    let worker = Worker::new("phoenix", &bus);
    registry.add_module(worker.clone()).unwrap();

    registry.start_all().unwrap();
    registry.stop_all().unwrap();
    assert!(!worker.is_running());

    bus.publish(Event::new("CLI", types::CORE_START).to("phoenix"));
    assert!(wait_until(Duration::from_secs(1), || worker.is_running()));

    registry.stop_all().unwrap();
    assert_eq!(worker.stops.load(Ordering::SeqCst), 2);
    registry.detach();
}

#[test]
fn test_barrier_reports_unsubscribed_running_module() {
    let bus = EventBus::new();
    let listed = Worker::new("listed", &bus);
    let orphan = Worker::new("orphan", &bus);
    listed.start().unwrap();
    orphan.start().unwrap();
    bus.subscribe(listed.clone()).unwrap();

    let modules: Vec<Arc<dyn Module>> = vec![listed.clone(), orphan.clone()];
    let (done_tx, done_rx) = std::sync::mpsc::channel();
    let barrier = ShutdownBarrier::new(bus.clone());
    thread::spawn(move || {
        let _ = done_tx.send(barrier.stop_all(&modules));
    });

    // Unbounded wait must still return instead of waiting on a module it cannot reach
    let result = done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("barrier hung on an unsubscribed module");
    match result {
        Err(ProtocolError::Custom(message)) => {
            assert!(message.contains("orphan"));
            assert!(!message.contains("listed"));
        }
        other => panic!("expected an error naming the orphan, got {other:?}"),
    }

    assert!(!listed.is_running());
    assert!(orphan.is_running());
    bus.unsubscribe_all();
}

#[test]
fn test_subscribe_twice_is_not_an_error() {
    let bus = EventBus::new();
    let mut registry = ModuleRegistry::new(bus.clone());
    let worker = Worker::new("twice", &bus);
    registry.add_module(worker.clone()).unwrap();

    // start_all subscribes again after a restart without failing
    registry.start_all().unwrap();
    registry.stop_all().unwrap();
    registry.start_all().unwrap();
    assert!(!bus.subscribe(worker.clone()).unwrap());
    assert_eq!(bus.subscriber_count(), 1);

    registry.stop_all().unwrap();
    registry.detach();
}
