//! Flush triggers.
//!
//! The scheduler owns exactly one trigger task for the active
//! [`FlushingMode`]. Triggers start flushes as detached tasks, so tearing a
//! trigger down never cancels a flush already in progress.

use crate::flush::{FlushCoordinator, FlushStatus, FlushingMode};
use crate::lifecycle::{LifecycleBus, LifecycleSignal};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Poll interval while an immediate flush waits for a foreign flush to finish.
const BUSY_RETRY: Duration = Duration::from_millis(50);

/// Used in place of a zero periodic interval.
const MIN_PERIODIC_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct SchedulerState {
    mode: FlushingMode,
    trigger: Option<JoinHandle<()>>,
    /// An immediate trigger is sleeping or flushing.
    immediate_pending: bool,
    /// A record was tracked after the pending immediate flush took its snapshot.
    rerun: bool,
    /// Bumped on every mode switch; stale triggers exit when it changes.
    generation: u64,
}

fn lock(state: &Mutex<SchedulerState>) -> MutexGuard<'_, SchedulerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Installs and tears down flush triggers.
pub struct FlushScheduler {
    coordinator: FlushCoordinator,
    bus: LifecycleBus,
    runtime: Handle,
    state: Arc<Mutex<SchedulerState>>,
}

impl FlushScheduler {
    /// Create a scheduler in [`FlushingMode::Manual`]; call [`set_mode`](Self::set_mode)
    /// to install a trigger.
    pub fn new(coordinator: FlushCoordinator, bus: LifecycleBus, runtime: Handle) -> Self {
        Self {
            coordinator,
            bus,
            runtime,
            state: Arc::new(Mutex::new(SchedulerState {
                mode: FlushingMode::Manual,
                trigger: None,
                immediate_pending: false,
                rerun: false,
                generation: 0,
            })),
        }
    }

    pub fn mode(&self) -> FlushingMode {
        lock(&self.state).mode
    }

    /// Tear down the active trigger and install the one for `mode`.
    pub fn set_mode(&self, mode: FlushingMode) {
        let mut state = lock(&self.state);
        if let Some(trigger) = state.trigger.take() {
            trigger.abort();
        }
        state.generation += 1;
        state.immediate_pending = false;
        state.rerun = false;
        state.mode = mode;

        let generation = state.generation;
        state.trigger = match mode {
            FlushingMode::Manual => None,
            FlushingMode::Immediate { delay } => {
                state.immediate_pending = true;
                Some(self.spawn_immediate(delay, generation))
            }
            FlushingMode::Periodic { interval } => Some(self.spawn_periodic(interval)),
            FlushingMode::Automatic => Some(self.spawn_automatic()),
        };
        tracing::info!(%mode, "flushing mode set");
    }

    /// Called after every successfully queued record.
    pub fn notify_tracked(&self) {
        let mut state = lock(&self.state);
        let FlushingMode::Immediate { delay } = state.mode else {
            return;
        };

        if state.immediate_pending {
            state.rerun = true;
            return;
        }
        state.immediate_pending = true;
        let generation = state.generation;
        state.trigger = Some(self.spawn_immediate(delay, generation));
    }

    /// Abort the active trigger. In-flight flushes are not affected.
    pub fn shutdown(&self) {
        let mut state = lock(&self.state);
        if let Some(trigger) = state.trigger.take() {
            trigger.abort();
        }
        state.generation += 1;
        state.immediate_pending = false;
    }

    fn spawn_immediate(&self, delay: Duration, generation: u64) -> JoinHandle<()> {
        let coordinator = self.coordinator.clone();
        let state = Arc::clone(&self.state);

        self.runtime.spawn(async move {
            let mut wait = delay;
            loop {
                tokio::time::sleep(wait).await;
                {
                    let mut s = lock(&state);
                    if s.generation != generation {
                        return;
                    }
                    s.rerun = false;
                }

                let flush = {
                    let coordinator = coordinator.clone();
                    tokio::spawn(async move { coordinator.request_flush().await })
                };
                let status = match flush.await {
                    Ok(report) => report.status,
                    Err(e) => {
                        tracing::error!(error = %e, "immediate flush task failed");
                        FlushStatus::Completed
                    }
                };

                let mut s = lock(&state);
                if s.generation != generation {
                    return;
                }
                if status == FlushStatus::AlreadyInProgress {
                    // The running flush may have snapshotted before our record landed.
                    wait = BUSY_RETRY;
                    continue;
                }
                if s.rerun {
                    wait = delay;
                    continue;
                }
                s.immediate_pending = false;
                return;
            }
        })
    }

    fn spawn_periodic(&self, interval: Duration) -> JoinHandle<()> {
        let interval = if interval.is_zero() {
            tracing::warn!(
                fallback_secs = MIN_PERIODIC_INTERVAL.as_secs(),
                "periodic interval of zero; using fallback"
            );
            MIN_PERIODIC_INTERVAL
        } else {
            interval
        };
        let coordinator = self.coordinator.clone();

        self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                tracing::debug!("periodic flush");
                let coordinator = coordinator.clone();
                tokio::spawn(async move {
                    coordinator.request_flush().await;
                });
            }
        })
    }

    fn spawn_automatic(&self) -> JoinHandle<()> {
        // Subscribe before spawning so no signal published after set_mode is missed.
        let mut signals = self.bus.subscribe();
        tracing::debug!(
            subscribers = self.bus.subscriber_count(),
            "listening for background signals"
        );
        let coordinator = self.coordinator.clone();

        self.runtime.spawn(async move {
            loop {
                match signals.recv().await {
                    Ok(LifecycleSignal::BackgroundEntered) => {
                        tracing::debug!("background flush");
                        let coordinator = coordinator.clone();
                        tokio::spawn(async move {
                            coordinator.request_flush().await;
                        });
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "lifecycle listener lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Drop for FlushScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{DurableQueue, LocalQueue};
    use crate::record::{event_payload, Payload};
    use crate::test_support::ScriptedTransport;
    use crate::transparency::{create_shared_log, SharedDeliveryLog};
    use crate::transport::{StaticConnectivity, UploadOutcome};
    use chrono::Utc;

    struct Fixture {
        queue: Arc<LocalQueue>,
        transport: Arc<ScriptedTransport>,
        log: SharedDeliveryLog,
        bus: LifecycleBus,
        scheduler: FlushScheduler,
    }

    fn fixture_with(transport: ScriptedTransport) -> Fixture {
        let queue = Arc::new(LocalQueue::new());
        let transport = Arc::new(transport);
        let log = create_shared_log();
        let bus = LifecycleBus::new();
        let coordinator = FlushCoordinator::new(
            queue.clone(),
            transport.clone(),
            Arc::new(StaticConnectivity::new(true)),
            log.clone(),
            3,
        );
        let scheduler = FlushScheduler::new(coordinator, bus.clone(), Handle::current());
        Fixture {
            queue,
            transport,
            log,
            bus,
            scheduler,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(ScriptedTransport::new(UploadOutcome::Success))
    }

    fn track(f: &Fixture, name: &str) {
        f.queue
            .append_event(event_payload("tok", name, Utc::now(), Payload::new()))
            .unwrap();
        f.scheduler.notify_tracked();
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_zero_delay_persists_before_upload() {
        let f = fixture();
        f.scheduler.set_mode(FlushingMode::Immediate {
            delay: Duration::ZERO,
        });
        track(&f, "signup");

        assert_eq!(f.queue.pending_count().unwrap(), 1);
        assert_eq!(f.transport.upload_count(), 0);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.transport.upload_count(), 1);
        assert_eq!(f.queue.pending_count().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_waits_for_delay_and_coalesces() {
        let f = fixture();
        f.scheduler.set_mode(FlushingMode::Immediate {
            delay: Duration::from_secs(5),
        });
        track(&f, "a");
        track(&f, "b");
        track(&f, "c");

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(f.transport.upload_count(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(f.transport.upload_count(), 3);
        assert_eq!(f.log.stats().flushes_completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_tracked_during_flush_gets_rerun() {
        let (transport, gate) = ScriptedTransport::gated(UploadOutcome::Success);
        let f = fixture_with(transport);
        f.scheduler.set_mode(FlushingMode::Immediate {
            delay: Duration::ZERO,
        });
        track(&f, "first");

        while f.transport.in_flight() < 1 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        track(&f, "second");
        gate.add_permits(10);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.transport.uploads(), vec!["first", "second"]);
        assert_eq!(f.queue.pending_count().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_flushes_on_interval() {
        let f = fixture();
        f.scheduler.set_mode(FlushingMode::Periodic {
            interval: Duration::from_secs(10),
        });
        track(&f, "a");

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(f.transport.upload_count(), 0);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(f.transport.upload_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_automatic_flushes_on_background_only() {
        let f = fixture();
        f.scheduler.set_mode(FlushingMode::Automatic);
        track(&f, "a");

        f.bus.publish(LifecycleSignal::ForegroundEntered);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.transport.upload_count(), 0);

        f.bus.publish(LifecycleSignal::BackgroundEntered);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.transport.upload_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_switching_to_manual_cancels_timer() {
        let f = fixture();
        f.scheduler.set_mode(FlushingMode::Periodic {
            interval: Duration::from_secs(10),
        });
        track(&f, "a");
        f.scheduler.set_mode(FlushingMode::Manual);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(f.transport.upload_count(), 0);
        assert_eq!(f.queue.pending_count().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mode_switch_does_not_cancel_inflight_flush() {
        let (transport, gate) = ScriptedTransport::gated(UploadOutcome::Success);
        let f = fixture_with(transport);
        f.scheduler.set_mode(FlushingMode::Automatic);
        track(&f, "a");

        f.bus.publish(LifecycleSignal::BackgroundEntered);
        while f.transport.in_flight() < 1 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        f.scheduler.set_mode(FlushingMode::Manual);
        gate.add_permits(1);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(f.queue.pending_count().unwrap(), 0);
        assert_eq!(f.log.stats().flushes_completed, 1);
    }
}
