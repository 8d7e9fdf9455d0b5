//! Watcher
//!
//! Drives the poll loop: query the diagnostic source, diff the snapshot
//! against the previous one and fan the resulting transitions out to every
//! event processor. Each processor runs on its own worker task behind a
//! bounded queue, so a slow connector never holds up the poll loop or the
//! other processors.
//!
//! When a queue is full the tick's NEW and CLEARED transitions are held back
//! and retried on the next tick; ONGOING transitions are dropped and counted,
//! since the next poll reports them again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::condition::{ConditionDiff, ConditionKey, HealthCondition, LifecycleState, NODE_DEVICE_ID};
use crate::metrics::MetricsRegistry;
use crate::processor::{EventProcessor, ProcessError};
use crate::source::{DiagnosticSource, SourceError};

/// Error code of the synthetic condition raised while the source is unreachable
pub const SOURCE_UNREACHABLE_CODE: &str = "GPU_HEALTH_SOURCE_UNREACHABLE";

/// Group of the synthetic connectivity condition
pub const SOURCE_SYSTEM: &str = "SOURCE";

type Transitions = Vec<(HealthCondition, LifecycleState)>;

/// Watcher configuration
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Time between polls
    pub poll_interval: Duration,
    /// Upper bound for one source query
    pub query_timeout: Duration,
    /// How long to wait for processors after shutdown
    pub drain_timeout: Duration,
    /// Raise a node-level condition while the source is unreachable
    pub report_connectivity: bool,
    /// Batches each processor may have queued
    pub queue_capacity: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            query_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(10),
            report_connectivity: true,
            queue_capacity: 16,
        }
    }
}

/// Snapshot bookkeeping between polls
pub struct Tracker {
    node_name: String,
    previous: HashMap<ConditionKey, HealthCondition>,
    report_connectivity: bool,
    source_unreachable: bool,
}

impl Tracker {
    /// Start from the conditions known to be active, e.g. from persisted state
    pub fn new(
        node_name: impl Into<String>,
        initial: Vec<HealthCondition>,
        report_connectivity: bool,
    ) -> Self {
        let connectivity_key = connectivity_key();
        let mut source_unreachable = false;
        let mut previous = HashMap::new();

        for condition in initial {
            let key = condition.key();
            if key == connectivity_key {
                source_unreachable = true;
            } else {
                previous.insert(key, condition);
            }
        }

        Self {
            node_name: node_name.into(),
            previous,
            report_connectivity,
            source_unreachable,
        }
    }

    /// Diff a successful snapshot; also clears the connectivity condition
    pub fn observe_snapshot(&mut self, current: Vec<HealthCondition>) -> Transitions {
        let connectivity_key = connectivity_key();
        let current: Vec<HealthCondition> = current
            .into_iter()
            .filter(|c| c.key() != connectivity_key)
            .collect();

        let mut transitions = Vec::new();
        if self.source_unreachable {
            self.source_unreachable = false;
            if self.report_connectivity {
                info!("Diagnostic source reachable again");
                transitions.push((
                    self.connectivity_condition("Diagnostic source reachable"),
                    LifecycleState::Cleared,
                ));
            }
        }

        let diff = ConditionDiff::compute(&self.previous, &current);
        if !diff.new.is_empty() || !diff.cleared.is_empty() {
            info!(
                new = diff.new.len(),
                ongoing = diff.ongoing.len(),
                cleared = diff.cleared.len(),
                "Health conditions changed"
            );
        }

        self.previous = current.into_iter().map(|c| (c.key(), c)).collect();
        transitions.extend(diff.into_transitions());
        transitions
    }

    /// Record a failed query; the previous snapshot is kept
    pub fn observe_failure(&mut self, error: &SourceError) -> Transitions {
        if self.source_unreachable {
            return Vec::new();
        }
        self.source_unreachable = true;

        if !self.report_connectivity {
            return Vec::new();
        }
        vec![(
            self.connectivity_condition(&format!("Diagnostic source unreachable: {}", error)),
            LifecycleState::New,
        )]
    }

    /// Number of conditions in the last successful snapshot
    pub fn active(&self) -> usize {
        self.previous.len()
    }

    pub fn source_unreachable(&self) -> bool {
        self.source_unreachable
    }

    fn connectivity_condition(&self, message: &str) -> HealthCondition {
        HealthCondition::new(
            self.node_name.as_str(),
            NODE_DEVICE_ID,
            SOURCE_UNREACHABLE_CODE,
            SOURCE_SYSTEM,
            message,
        )
    }
}

fn connectivity_key() -> ConditionKey {
    ConditionKey::new(NODE_DEVICE_ID, SOURCE_UNREACHABLE_CODE)
}

/// Queue feeding one processor's worker
struct Lane {
    name: String,
    tx: mpsc::Sender<Transitions>,
    /// State changes that did not fit in the queue
    backlog: Transitions,
}

/// Poll loop driver
pub struct Watcher {
    source: Arc<dyn DiagnosticSource>,
    processors: Vec<Arc<dyn EventProcessor>>,
    config: WatcherConfig,
    node_name: String,
    metrics: MetricsRegistry,
    shutdown: CancellationToken,
}

impl Watcher {
    /// Create a new watcher
    pub fn new(
        source: Arc<dyn DiagnosticSource>,
        processors: Vec<Arc<dyn EventProcessor>>,
        config: WatcherConfig,
        node_name: impl Into<String>,
        metrics: MetricsRegistry,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            source,
            processors,
            config,
            node_name: node_name.into(),
            metrics,
            shutdown,
        }
    }

    /// Run until shutdown.
    ///
    /// `initial` seeds the previous snapshot, so conditions that went away
    /// while the process was down are reported cleared on the first poll.
    pub async fn start(&self, initial: Vec<HealthCondition>) {
        info!(
            source = %self.source.describe(),
            processors = self.processors.len(),
            poll_interval = ?self.config.poll_interval,
            seeded = initial.len(),
            queue_capacity = self.config.queue_capacity,
            "Starting watcher"
        );

        let mut tracker = Tracker::new(
            self.node_name.as_str(),
            initial,
            self.config.report_connectivity,
        );
        let (mut lanes, workers) = self.spawn_workers();

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let result = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                result = self.poll() => result,
            };

            let transitions = match result {
                Ok(current) => {
                    let transitions = tracker.observe_snapshot(current);
                    self.metrics.set_active_conditions(tracker.active());
                    transitions
                }
                Err(e) => {
                    warn!(source = %self.source.describe(), error = %e, "Diagnostic query failed, skipping tick");
                    tracker.observe_failure(&e)
                }
            };

            self.dispatch(&mut lanes, transitions);
        }

        info!("Shutdown signal received, draining event processors");
        for lane in &lanes {
            if !lane.backlog.is_empty() {
                warn!(processor = %lane.name, transitions = lane.backlog.len(), "Abandoning transitions held back by a full queue");
            }
        }
        drop(lanes);
        self.drain(workers).await;
    }

    /// Query the source once, bounded by the query timeout
    pub async fn poll(&self) -> Result<Vec<HealthCondition>, SourceError> {
        let start = Instant::now();
        let result = match tokio::time::timeout(self.config.query_timeout, self.source.query()).await {
            Ok(result) => result,
            Err(_) => Err(SourceError::Timeout("query", self.config.query_timeout)),
        };
        let elapsed = start.elapsed();

        self.metrics.observe_poll(elapsed.as_secs_f64());
        match &result {
            Ok(conditions) => debug!(count = conditions.len(), duration = ?elapsed, "Poll complete"),
            Err(e) => self.metrics.inc_poll_failure(e.kind()),
        }
        result
    }

    fn spawn_workers(&self) -> (Vec<Lane>, Vec<JoinHandle<()>>) {
        let mut lanes = Vec::with_capacity(self.processors.len());
        let mut workers = Vec::with_capacity(self.processors.len());

        for processor in &self.processors {
            let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
            lanes.push(Lane {
                name: processor.name().to_string(),
                tx,
                backlog: Vec::new(),
            });
            workers.push(tokio::spawn(run_worker(
                Arc::clone(processor),
                rx,
                self.metrics,
            )));
        }
        (lanes, workers)
    }

    /// Hand one tick's transitions, after any held-back ones, to every processor
    fn dispatch(&self, lanes: &mut [Lane], transitions: Transitions) {
        for lane in lanes.iter_mut() {
            if transitions.is_empty() && lane.backlog.is_empty() {
                continue;
            }

            let mut batch = std::mem::take(&mut lane.backlog);
            batch.extend(transitions.iter().cloned());

            match lane.tx.try_send(batch) {
                Ok(()) => {}
                Err(TrySendError::Full(batch)) => {
                    let (kept, dropped): (Transitions, Transitions) = batch
                        .into_iter()
                        .partition(|(_, state)| *state != LifecycleState::Ongoing);
                    warn!(
                        processor = %lane.name,
                        dropped = dropped.len(),
                        held_back = kept.len(),
                        "Event processor queue full"
                    );
                    if !dropped.is_empty() {
                        self.metrics.inc_dropped_events(&lane.name, dropped.len());
                    }
                    lane.backlog = kept;
                }
                Err(TrySendError::Closed(_)) => {
                    // Worker is gone (panicked); the others keep running
                    error!(processor = %lane.name, "Event processor worker stopped, dropping batch");
                    self.metrics.inc_dispatch_failure(&lane.name);
                }
            }
        }
    }

    async fn drain(&self, workers: Vec<JoinHandle<()>>) {
        match tokio::time::timeout(self.config.drain_timeout, join_all(workers)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        error!(error = %e, "Event processor worker failed");
                    }
                }
                info!("Watcher stopped");
            }
            Err(_) => warn!(
                timeout = ?self.config.drain_timeout,
                "Event processors did not drain in time, abandoning in-flight events"
            ),
        }
    }
}

async fn run_worker(
    processor: Arc<dyn EventProcessor>,
    mut rx: mpsc::Receiver<Transitions>,
    metrics: MetricsRegistry,
) {
    while let Some(batch) = rx.recv().await {
        for (condition, transition) in &batch {
            match processor.process(condition, *transition).await {
                Ok(_) => {}
                // Already logged and counted by the processor
                Err(ProcessError::Transmission(_)) => {}
                Err(e) => {
                    warn!(
                        processor = %processor.name(),
                        condition = %condition.key(),
                        transition = %transition,
                        error = %e,
                        "Event processor failed"
                    );
                    metrics.inc_dispatch_failure(processor.name());
                }
            }
        }
    }
    debug!(processor = %processor.name(), "Event processor worker finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::TransmissionError;
    use crate::processor::ProcessOutcome;
    use crate::source::MockSource;
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    struct RecordingProcessor {
        name: String,
        seen: Mutex<Vec<(String, LifecycleState)>>,
        delay: Duration,
    }

    impl RecordingProcessor {
        fn new(name: &str) -> Arc<Self> {
            Self::slow(name, Duration::ZERO)
        }

        fn slow(name: &str, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                seen: Mutex::new(Vec::new()),
                delay,
            })
        }

        async fn seen(&self) -> Vec<(String, LifecycleState)> {
            self.seen.lock().await.clone()
        }
    }

    #[async_trait]
    impl EventProcessor for RecordingProcessor {
        fn name(&self) -> &str {
            &self.name
        }

        async fn process(
            &self,
            condition: &HealthCondition,
            transition: LifecycleState,
        ) -> Result<ProcessOutcome, ProcessError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.seen
                .lock()
                .await
                .push((condition.error_code.clone(), transition));
            Ok(ProcessOutcome::Delivered)
        }
    }

    struct FailingProcessor;

    #[async_trait]
    impl EventProcessor for FailingProcessor {
        fn name(&self) -> &str {
            "watcher-test-failing"
        }

        async fn process(
            &self,
            _condition: &HealthCondition,
            _transition: LifecycleState,
        ) -> Result<ProcessOutcome, ProcessError> {
            Err(ProcessError::Other("boom".to_string()))
        }
    }

    struct UndeliverableProcessor;

    #[async_trait]
    impl EventProcessor for UndeliverableProcessor {
        fn name(&self) -> &str {
            "watcher-test-undeliverable"
        }

        async fn process(
            &self,
            _condition: &HealthCondition,
            _transition: LifecycleState,
        ) -> Result<ProcessOutcome, ProcessError> {
            Err(TransmissionError::Rejected { sent: 1, accepted: 0 }.into())
        }
    }

    fn condition(device: &str, code: &str) -> HealthCondition {
        HealthCondition::new("node-a", device, code, "PCIE", "test")
    }

    fn codes(transitions: &Transitions) -> Vec<(String, LifecycleState)> {
        transitions
            .iter()
            .map(|(c, s)| (c.error_code.clone(), *s))
            .collect()
    }

    fn fast_config() -> WatcherConfig {
        WatcherConfig {
            poll_interval: Duration::from_millis(20),
            query_timeout: Duration::from_millis(200),
            drain_timeout: Duration::from_secs(2),
            report_connectivity: true,
            queue_capacity: 16,
        }
    }

    #[test]
    fn test_tracker_lifecycle() {
        let mut tracker = Tracker::new("node-a", Vec::new(), true);

        let t = tracker.observe_snapshot(vec![condition("0", "A")]);
        assert_eq!(codes(&t), vec![("A".to_string(), LifecycleState::New)]);

        let t = tracker.observe_snapshot(vec![condition("0", "A")]);
        assert_eq!(codes(&t), vec![("A".to_string(), LifecycleState::Ongoing)]);

        let t = tracker.observe_snapshot(Vec::new());
        assert_eq!(codes(&t), vec![("A".to_string(), LifecycleState::Cleared)]);

        assert!(tracker.observe_snapshot(Vec::new()).is_empty());
    }

    #[test]
    fn test_tracker_seeded_clear() {
        let mut tracker = Tracker::new("node-a", vec![condition("0", "A"), condition("1", "B")], true);
        let t = tracker.observe_snapshot(vec![condition("1", "B")]);
        assert_eq!(
            codes(&t),
            vec![
                ("B".to_string(), LifecycleState::Ongoing),
                ("A".to_string(), LifecycleState::Cleared),
            ]
        );
    }

    #[test]
    fn test_tracker_connectivity_condition() {
        let mut tracker = Tracker::new("node-a", vec![condition("0", "A")], true);
        let err = SourceError::Other("refused".to_string());

        let t = tracker.observe_failure(&err);
        assert_eq!(t.len(), 1);
        assert_eq!(t[0].0.device_id, NODE_DEVICE_ID);
        assert_eq!(t[0].0.error_code, SOURCE_UNREACHABLE_CODE);
        assert_eq!(t[0].0.system, SOURCE_SYSTEM);
        assert_eq!(t[0].1, LifecycleState::New);

        // Still failing: nothing new, previous snapshot untouched
        assert!(tracker.observe_failure(&err).is_empty());
        assert_eq!(tracker.active(), 1);

        let t = tracker.observe_snapshot(vec![condition("0", "A")]);
        assert_eq!(
            codes(&t),
            vec![
                (SOURCE_UNREACHABLE_CODE.to_string(), LifecycleState::Cleared),
                ("A".to_string(), LifecycleState::Ongoing),
            ]
        );
        assert!(!tracker.source_unreachable());
    }

    #[test]
    fn test_tracker_connectivity_disabled() {
        let mut tracker = Tracker::new("node-a", Vec::new(), false);
        assert!(tracker.observe_failure(&SourceError::Other("x".to_string())).is_empty());
        assert!(tracker.observe_snapshot(Vec::new()).is_empty());
    }

    #[test]
    fn test_tracker_seeded_connectivity_is_cleared() {
        let seeded = HealthCondition::new(
            "node-a",
            NODE_DEVICE_ID,
            SOURCE_UNREACHABLE_CODE,
            SOURCE_SYSTEM,
            "unreachable",
        );
        let mut tracker = Tracker::new("node-a", vec![seeded], true);
        assert_eq!(tracker.active(), 0);

        let t = tracker.observe_snapshot(Vec::new());
        assert_eq!(
            codes(&t),
            vec![(SOURCE_UNREACHABLE_CODE.to_string(), LifecycleState::Cleared)]
        );
    }

    #[tokio::test]
    async fn test_failing_processor_does_not_block_others() {
        let source = Arc::new(MockSource::new("node-a"));
        source.add("0", "79", "XID").await;

        let recorder = RecordingProcessor::new("watcher-test-recorder");
        let processors: Vec<Arc<dyn EventProcessor>> = vec![
            Arc::new(FailingProcessor) as Arc<dyn EventProcessor>,
            recorder.clone() as Arc<dyn EventProcessor>,
        ];

        let shutdown = CancellationToken::new();
        let metrics = MetricsRegistry::new();
        let watcher = Watcher::new(
            source.clone(),
            processors,
            fast_config(),
            "node-a",
            metrics,
            shutdown.clone(),
        );

        let handle = tokio::spawn(async move { watcher.start(Vec::new()).await });
        tokio::time::sleep(Duration::from_millis(60)).await;
        source.clear().await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        shutdown.cancel();
        handle.await.unwrap();

        let seen = recorder.seen().await;
        let news = seen.iter().filter(|(_, s)| *s == LifecycleState::New).count();
        let clears = seen.iter().filter(|(_, s)| *s == LifecycleState::Cleared).count();
        assert_eq!(news, 1);
        assert_eq!(clears, 1);
        assert!(metrics.dispatch_failures("watcher-test-failing") >= 2);
    }

    #[tokio::test]
    async fn test_transmission_failure_not_counted_as_dispatch_failure() {
        let source = Arc::new(MockSource::new("node-a"));
        source.add("0", "79", "XID").await;

        let shutdown = CancellationToken::new();
        let metrics = MetricsRegistry::new();
        let watcher = Watcher::new(
            source.clone(),
            vec![Arc::new(UndeliverableProcessor) as Arc<dyn EventProcessor>],
            fast_config(),
            "node-a",
            metrics,
            shutdown.clone(),
        );

        let handle = tokio::spawn(async move { watcher.start(Vec::new()).await });
        tokio::time::sleep(Duration::from_millis(80)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert!(source.query_count() >= 2);
        assert_eq!(metrics.dispatch_failures("watcher-test-undeliverable"), 0);
    }

    #[tokio::test]
    async fn test_full_queue_drops_ongoing_and_holds_back_changes() {
        let source = Arc::new(MockSource::new("node-a"));
        source.add("0", "A", "PCIE").await;

        let name = "watcher-test-backpressure";
        let slow = RecordingProcessor::slow(name, Duration::from_millis(100));
        let shutdown = CancellationToken::new();
        let metrics = MetricsRegistry::new();
        let mut config = fast_config();
        config.queue_capacity = 1;
        let watcher = Watcher::new(
            source.clone(),
            vec![slow.clone() as Arc<dyn EventProcessor>],
            config,
            "node-a",
            metrics,
            shutdown.clone(),
        );

        let handle = tokio::spawn(async move { watcher.start(Vec::new()).await });
        tokio::time::sleep(Duration::from_millis(150)).await;
        source.clear().await;

        let deadline = Instant::now() + Duration::from_secs(3);
        while !slow
            .seen()
            .await
            .iter()
            .any(|(_, state)| *state == LifecycleState::Cleared)
        {
            assert!(Instant::now() < deadline, "held-back CLEARED never delivered");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        shutdown.cancel();
        handle.await.unwrap();

        let seen = slow.seen().await;
        assert_eq!(seen.first(), Some(&("A".to_string(), LifecycleState::New)));
        assert_eq!(seen.last(), Some(&("A".to_string(), LifecycleState::Cleared)));
        assert_eq!(
            seen.iter().filter(|(_, s)| *s == LifecycleState::Cleared).count(),
            1
        );
        assert!(metrics.dropped_events(name) >= 1);
    }

    #[tokio::test]
    async fn test_source_failure_keeps_polling() {
        let source = Arc::new(MockSource::new("node-a"));
        source.set_fail_query(true);

        let recorder = RecordingProcessor::new("watcher-test-unreachable");
        let shutdown = CancellationToken::new();
        let watcher = Watcher::new(
            source.clone(),
            vec![recorder.clone() as Arc<dyn EventProcessor>],
            fast_config(),
            "node-a",
            MetricsRegistry::new(),
            shutdown.clone(),
        );

        let handle = tokio::spawn(async move { watcher.start(Vec::new()).await });
        tokio::time::sleep(Duration::from_millis(80)).await;
        source.set_fail_query(false);
        tokio::time::sleep(Duration::from_millis(60)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert!(source.query_count() >= 3);
        let seen = recorder.seen().await;
        assert_eq!(
            seen,
            vec![
                (SOURCE_UNREACHABLE_CODE.to_string(), LifecycleState::New),
                (SOURCE_UNREACHABLE_CODE.to_string(), LifecycleState::Cleared),
            ]
        );
    }

    #[tokio::test]
    async fn test_query_timeout_counted() {
        let source = Arc::new(MockSource::new("node-a"));
        source.set_delay(Duration::from_secs(5)).await;
        let metrics = MetricsRegistry::new();
        let watcher = Watcher::new(
            source,
            Vec::new(),
            fast_config(),
            "node-a",
            metrics,
            CancellationToken::new(),
        );

        let before = metrics.poll_failures("timeout");
        let err = watcher.poll().await.unwrap_err();
        assert_eq!(err.kind(), "timeout");
        assert!(metrics.poll_failures("timeout") > before);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_slow_query() {
        let source = Arc::new(MockSource::new("node-a"));
        source.set_delay(Duration::from_secs(30)).await;

        let shutdown = CancellationToken::new();
        let mut config = fast_config();
        config.query_timeout = Duration::from_secs(60);
        let watcher = Watcher::new(
            source,
            vec![RecordingProcessor::new("watcher-test-shutdown") as Arc<dyn EventProcessor>],
            config,
            "node-a",
            MetricsRegistry::new(),
            shutdown.clone(),
        );

        let handle = tokio::spawn(async move { watcher.start(Vec::new()).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("watcher did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_slow_processor_drained_within_timeout() {
        let source = Arc::new(MockSource::new("node-a"));
        for code in ["A", "B", "C"] {
            source.add("0", code, "PCIE").await;
        }

        let slow = RecordingProcessor::slow("watcher-test-slow", Duration::from_secs(10));
        let shutdown = CancellationToken::new();
        let mut config = fast_config();
        config.drain_timeout = Duration::from_millis(100);
        let watcher = Watcher::new(
            source,
            vec![slow as Arc<dyn EventProcessor>],
            config,
            "node-a",
            MetricsRegistry::new(),
            shutdown.clone(),
        );

        let handle = tokio::spawn(async move { watcher.start(Vec::new()).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("drain timeout not honored")
            .unwrap();
    }
}
