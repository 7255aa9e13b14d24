//! Stage lifecycle supervision.
//!
//! [`LifecycleSupervisor`] wraps bus plumbing around a [`Stage`]:
//!
//! - start: register observer, connect, subscribe every pattern, run the
//!   stage's start hook, then launch the event pump and background loop
//! - stop: the mirror order (stop hook, unsubscribe, deregister, disconnect),
//!   then cancel the background loop and drain in-flight handlers
//!
//! A failed connect aborts startup. A failed start hook rolls the bus side
//! back before the error is returned, so no stage ever runs degraded.

use crate::bus::{BusClient, BusEvent, ObserverId};
use crate::handler::Dispatcher;
use crate::shutdown::wait_for_shutdown_signal;
use crate::traits::{Lifecycle, LifecycleState};
use crate::{IosError, IosResult};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Default bound on draining in-flight handlers during stop
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-stage business logic driven by a [`LifecycleSupervisor`]
#[async_trait]
pub trait Stage: Send + Sync + 'static {
    /// Stage name used in logs
    fn name(&self) -> &str;

    /// Topic patterns to subscribe to on start
    fn subscriptions(&self) -> Vec<String>;

    /// Runs after the bus is connected and subscribed
    async fn on_starting(&self) -> IosResult<()> {
        Ok(())
    }

    /// Runs first during stop, while the bus is still connected
    async fn on_stopping(&self) -> IosResult<()> {
        Ok(())
    }

    /// Bus connection went up or down
    async fn on_connection_changed(&self, connected: bool) {
        if connected {
            info!(stage = %self.name(), "Bus connected");
        } else {
            warn!(stage = %self.name(), "Bus disconnected, waiting for reconnect");
        }
    }

    /// Background work loop; must return promptly once `cancel` fires
    async fn run(&self, cancel: CancellationToken) -> IosResult<()> {
        cancel.cancelled().await;
        Ok(())
    }
}

struct Running {
    observer: ObserverId,
    subscribed: Vec<String>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    pump: JoinHandle<()>,
    background: JoinHandle<()>,
}

/// Drives a [`Stage`] over a [`BusClient`] and a [`Dispatcher`]
pub struct LifecycleSupervisor {
    bus: Arc<dyn BusClient>,
    dispatcher: Arc<Dispatcher>,
    stage: Arc<dyn Stage>,
    state: LifecycleState,
    drain_timeout: Duration,
    running: Option<Running>,
}

impl LifecycleSupervisor {
    /// Create a stopped supervisor
    pub fn new(bus: Arc<dyn BusClient>, dispatcher: Arc<Dispatcher>, stage: Arc<dyn Stage>) -> Self {
        Self {
            bus,
            dispatcher,
            stage,
            state: LifecycleState::Stopped,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            running: None,
        }
    }

    /// Override the drain bound used by stop
    #[must_use]
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// The stage's dispatcher
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// The stage's bus client
    #[must_use]
    pub fn bus(&self) -> &Arc<dyn BusClient> {
        &self.bus
    }

    /// Stage name
    #[must_use]
    pub fn stage_name(&self) -> &str {
        self.stage.name()
    }

    /// Start, wait for `shutdown` to complete, then stop
    pub async fn run_until<F>(&mut self, shutdown: F) -> IosResult<()>
    where
        F: Future<Output = ()> + Send,
    {
        self.start().await?;
        shutdown.await;
        self.stop().await
    }

    /// Start, wait for SIGINT/SIGTERM/Ctrl-C, then stop
    pub async fn run_until_shutdown(&mut self) -> IosResult<()> {
        self.run_until(async {
            if let Err(e) = wait_for_shutdown_signal().await {
                error!(error = %e, "Cannot listen for shutdown signals, stopping");
            }
        })
        .await
    }

    async fn rollback(&self, observer: ObserverId, subscribed: &[String]) {
        for pattern in subscribed.iter().rev() {
            if let Err(e) = self.bus.unsubscribe(pattern).await {
                warn!(pattern = %pattern, error = %e, "Rollback unsubscribe failed");
            }
        }
        self.bus.remove_observer(observer);
        if let Err(e) = self.bus.disconnect().await {
            warn!(error = %e, "Rollback disconnect failed");
        }
    }
}

#[async_trait]
impl Lifecycle for LifecycleSupervisor {
    async fn start(&mut self) -> IosResult<()> {
        match self.state {
            LifecycleState::Stopped => {}
            LifecycleState::Running => return Ok(()),
            other => {
                return Err(IosError::internal(format!(
                    "Cannot start stage '{}' while {other}",
                    self.stage.name()
                )))
            }
        }

        let stage = self.stage.name().to_string();
        info!(stage = %stage, "Starting stage");
        self.state = LifecycleState::Starting;

        // 1. observer
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let observer = self.bus.add_observer(events_tx);

        // 2. connect; failure is fatal
        if let Err(e) = self.bus.connect().await {
            self.bus.remove_observer(observer);
            self.state = LifecycleState::Stopped;
            error!(stage = %stage, error = %e, "Bus connect failed, aborting startup");
            return Err(e);
        }

        // 3. subscribe
        let mut subscribed = Vec::new();
        for pattern in self.stage.subscriptions() {
            match self.bus.subscribe(&pattern).await {
                Ok(()) => {
                    debug!(stage = %stage, pattern = %pattern, "Subscribed");
                    subscribed.push(pattern);
                }
                Err(e) => error!(stage = %stage, pattern = %pattern, error = %e, "Subscribe failed"),
            }
        }

        // 4. stage hook
        if let Err(e) = self.stage.on_starting().await {
            error!(stage = %stage, error = %e, "Start hook failed, rolling back");
            self.rollback(observer, &subscribed).await;
            self.state = LifecycleState::Stopped;
            return Err(e);
        }

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let pump = tokio::spawn(pump_events(
            events_rx,
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.stage),
            tracker.clone(),
            cancel.child_token(),
        ));

        let background_stage = Arc::clone(&self.stage);
        let background_cancel = cancel.child_token();
        let background = tokio::spawn(async move {
            if let Err(e) = background_stage.run(background_cancel).await {
                error!(stage = %background_stage.name(), error = %e, "Background loop failed");
            }
        });

        self.running = Some(Running {
            observer,
            subscribed,
            cancel,
            tracker,
            pump,
            background,
        });
        self.state = LifecycleState::Running;
        info!(stage = %stage, "Stage running");
        Ok(())
    }

    async fn stop(&mut self) -> IosResult<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };

        let stage = self.stage.name().to_string();
        info!(stage = %stage, "Stopping stage");
        self.state = LifecycleState::Stopping;

        // 1. stage hook
        if let Err(e) = self.stage.on_stopping().await {
            error!(stage = %stage, error = %e, "Stop hook failed");
        }

        // 2. unsubscribe
        for pattern in &running.subscribed {
            if let Err(e) = self.bus.unsubscribe(pattern).await {
                warn!(stage = %stage, pattern = %pattern, error = %e, "Unsubscribe failed");
            }
        }

        // 3. observer
        self.bus.remove_observer(running.observer);

        // 4. disconnect
        let disconnected = self.bus.disconnect().await;
        if let Err(e) = &disconnected {
            error!(stage = %stage, error = %e, "Bus disconnect failed");
        }

        running.cancel.cancel();
        if let Err(e) = running.pump.await {
            warn!(stage = %stage, error = %e, "Event pump ended abnormally");
        }
        let mut background = running.background;
        match tokio::time::timeout(self.drain_timeout, &mut background).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(stage = %stage, error = %e, "Background loop ended abnormally"),
            Err(_) => {
                warn!(stage = %stage, "Background loop ignored cancellation, aborting it");
                background.abort();
            }
        }

        running.tracker.close();
        if tokio::time::timeout(self.drain_timeout, running.tracker.wait()).await.is_err() {
            warn!(
                stage = %stage,
                in_flight = running.tracker.len(),
                "Handlers still running after drain timeout"
            );
        }

        self.state = LifecycleState::Stopped;
        info!(stage = %stage, "Stage stopped");
        disconnected
    }

    fn lifecycle_state(&self) -> LifecycleState {
        self.state
    }
}

async fn pump_events(
    mut events: mpsc::UnboundedReceiver<BusEvent>,
    dispatcher: Arc<Dispatcher>,
    stage: Arc<dyn Stage>,
    tracker: TaskTracker,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            BusEvent::Message { topic, payload } => {
                let dispatcher = Arc::clone(&dispatcher);
                tracker.spawn(async move {
                    dispatcher.dispatch(&topic, &payload).await;
                });
            }
            BusEvent::ConnectionChanged(connected) => {
                let stage = Arc::clone(&stage);
                tracker.spawn(async move {
                    stage.on_connection_changed(connected).await;
                });
            }
        }
    }
    debug!("Event pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{InMemoryBus, MemoryBroker};
    use crate::handler::{factory, HandlerRegistry, MessageHandler};
    use crate::topic::TopicPattern;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Counting {
        hits: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl MessageHandler for Counting {
        fn name(&self) -> &str {
            "Counting"
        }

        fn supported_topics(&self) -> Vec<TopicPattern> {
            Vec::new()
        }

        async fn process_message(&self, _topic: &str, _payload: &str) -> IosResult<()> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct TestStage {
        fail_start: bool,
        connection_changes: Mutex<Vec<bool>>,
        loop_stopped: AtomicBool,
    }

    #[async_trait]
    impl Stage for TestStage {
        fn name(&self) -> &str {
            "test-stage"
        }

        fn subscriptions(&self) -> Vec<String> {
            vec!["ios/v1/test/+".to_string()]
        }

        async fn on_starting(&self) -> IosResult<()> {
            if self.fail_start {
                Err(IosError::internal("hook failed"))
            } else {
                Ok(())
            }
        }

        async fn on_connection_changed(&self, connected: bool) {
            self.connection_changes.lock().push(connected);
        }

        async fn run(&self, cancel: CancellationToken) -> IosResult<()> {
            cancel.cancelled().await;
            self.loop_stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn supervisor(broker: &MemoryBroker, stage: Arc<TestStage>, hits: &Arc<AtomicUsize>) -> LifecycleSupervisor {
        let hits = Arc::clone(hits);
        let mut registry = HandlerRegistry::default();
        registry
            .register(
                "ios/v1/test/+",
                factory(move || Arc::new(Counting { hits: Arc::clone(&hits) })),
            )
            .unwrap();

        LifecycleSupervisor::new(
            Arc::new(InMemoryBus::new(broker, "stage")),
            Arc::new(Dispatcher::new(registry)),
            stage,
        )
    }

    async fn wait_for(hits: &AtomicUsize, expected: usize) {
        for _ in 0..100 {
            if hits.load(Ordering::SeqCst) >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_start_dispatch_stop() {
        let broker = MemoryBroker::new();
        let stage = Arc::new(TestStage::default());
        let hits = Arc::new(AtomicUsize::new(0));
        let mut supervisor = supervisor(&broker, Arc::clone(&stage), &hits);

        supervisor.start().await.unwrap();
        assert!(supervisor.is_running());
        assert!(supervisor.bus().is_connected());

        let sensor = InMemoryBus::new(&broker, "sensor");
        sensor.connect().await.unwrap();
        sensor.publish("ios/v1/test/a", "1".into()).await.unwrap();
        sensor.publish("ios/v1/other/a", "2".into()).await.unwrap();
        wait_for(&hits, 1).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        supervisor.stop().await.unwrap();
        assert_eq!(supervisor.lifecycle_state(), LifecycleState::Stopped);
        assert!(!supervisor.bus().is_connected());
        assert!(stage.loop_stopped.load(Ordering::SeqCst));
        assert_eq!(stage.connection_changes.lock().as_slice(), &[true]);

        sensor.publish("ios/v1/test/a", "3".into()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_without_start_is_ok() {
        let broker = MemoryBroker::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let mut supervisor = supervisor(&broker, Arc::new(TestStage::default()), &hits);

        assert!(supervisor.stop().await.is_ok());
        supervisor.start().await.unwrap();
        supervisor.start().await.unwrap();
        supervisor.restart().await.unwrap();
        assert!(supervisor.is_running());
        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_start_hook_rolls_back() {
        let broker = MemoryBroker::new();
        let stage = Arc::new(TestStage {
            fail_start: true,
            ..TestStage::default()
        });
        let hits = Arc::new(AtomicUsize::new(0));
        let mut supervisor = supervisor(&broker, stage, &hits);

        let err = supervisor.start().await.unwrap_err();
        assert_eq!(err, IosError::internal("hook failed"));
        assert_eq!(supervisor.lifecycle_state(), LifecycleState::Stopped);
        assert!(!supervisor.bus().is_connected());
    }

    struct SetOnDrop(Arc<AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    /// Background loop that never looks at its cancellation token
    struct Stubborn {
        dropped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Stage for Stubborn {
        fn name(&self) -> &str {
            "stubborn"
        }

        fn subscriptions(&self) -> Vec<String> {
            Vec::new()
        }

        async fn run(&self, _cancel: CancellationToken) -> IosResult<()> {
            let _guard = SetOnDrop(Arc::clone(&self.dropped));
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_stop_aborts_background_loop_that_ignores_cancel() {
        let broker = MemoryBroker::new();
        let dropped = Arc::new(AtomicBool::new(false));
        let mut supervisor = LifecycleSupervisor::new(
            Arc::new(InMemoryBus::new(&broker, "stage")),
            Arc::new(Dispatcher::new(HandlerRegistry::default())),
            Arc::new(Stubborn {
                dropped: Arc::clone(&dropped),
            }),
        )
        .with_drain_timeout(Duration::from_millis(50));

        supervisor.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        supervisor.stop().await.unwrap();
        assert_eq!(supervisor.lifecycle_state(), LifecycleState::Stopped);

        for _ in 0..100 {
            if dropped.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_run_until() {
        let broker = MemoryBroker::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let mut supervisor = supervisor(&broker, Arc::new(TestStage::default()), &hits);

        supervisor
            .run_until(tokio::time::sleep(Duration::from_millis(10)))
            .await
            .unwrap();
        assert!(!supervisor.is_running());
    }
}
