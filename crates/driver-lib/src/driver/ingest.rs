//! Ingestion loop: reads generated events and issues clock ticks

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{DriverShared, TickWindow};
use crate::clock::TickTrigger;
use crate::error::DriverError;
use crate::models::Event;
use crate::workload::WorkloadState;

/// How often the queue is checked while an external party issues ticks
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Issues ticks towards a target timestamp, honouring pauses and pacing
struct TickIssuer {
    shared: Arc<DriverShared>,
    trigger: TickTrigger,
    window: TickWindow,
    paused: watch::Receiver<bool>,
    shutdown: broadcast::Receiver<()>,
    /// Set once shutdown has been observed
    stopped: bool,
}

impl TickIssuer {
    fn new(shared: Arc<DriverShared>, trigger: TickTrigger) -> Self {
        let window = TickWindow::new(shared.config.tick_window_size);
        let paused = shared.paused.subscribe();
        let shutdown = shared.shutdown.subscribe();
        Self {
            shared,
            trigger,
            window,
            paused,
            shutdown,
            stopped: false,
        }
    }

    /// Issue every whole tick between the current tick and `target`
    async fn issue_clock_ticks(&mut self, target: DateTime<Utc>) -> Result<(), DriverError> {
        let shared = Arc::clone(&self.shared);
        let tick_duration = shared.config.tick_duration;
        let start = shared.current_tick.now();
        let expected =
            ((target - start).num_milliseconds() / tick_duration.num_milliseconds()).max(0);
        let factor = shared.config.timescale_adjustment_factor.max(0.0);

        let mut issued = 0i64;
        while shared.workload.is_in_progress()
            && shared.current_tick.now() + tick_duration <= target
        {
            if !self.handle_pause().await || !shared.workload.is_in_progress() {
                break;
            }

            let tick_started = Instant::now();
            let tick = shared.current_tick.increment_clock_by(tick_duration)?;

            if let Err(closed) = self.trigger.trigger(tick).await {
                if shared.workload.is_in_progress() {
                    return Err(closed.into());
                }
                self.stopped = true;
                break;
            }
            issued += 1;

            let elapsed = tick_started.elapsed();
            match tick_duration.to_std() {
                Ok(budget) if elapsed < budget => {
                    let pacing = (budget - elapsed).mul_f64(factor);
                    tokio::select! {
                        _ = tokio::time::sleep(pacing) => {}
                        _ = self.shutdown.recv() => {
                            self.stopped = true;
                            break;
                        }
                    }
                }
                _ => {
                    error!(
                        workload_id = %shared.workload_id(),
                        tick = %tick,
                        elapsed_ms = elapsed.as_millis() as u64,
                        budget_ms = tick_duration.num_milliseconds(),
                        "Tick overran its wall-clock budget"
                    );
                }
            }

            let duration = tick_started.elapsed();
            shared.workload.record_tick_duration(duration);
            shared
                .metrics
                .observe_tick_duration(shared.workload_id(), duration.as_secs_f64());
            if let Some(average) = self.window.record(duration) {
                warn!(
                    workload_id = %shared.workload_id(),
                    tick = %tick,
                    duration_ms = duration.as_millis() as u64,
                    average_ms = (average * 1000.0) as u64,
                    "Tick took much longer than recent ticks"
                );
            }
        }

        if issued != expected {
            if shared.workload.is_in_progress() {
                error!(
                    workload_id = %shared.workload_id(),
                    expected,
                    issued,
                    target = %target,
                    "Issued an unexpected number of ticks"
                );
            } else {
                warn!(
                    workload_id = %shared.workload_id(),
                    expected,
                    issued,
                    state = %shared.workload.state(),
                    "Tick issuing interrupted"
                );
            }
        }

        Ok(())
    }

    /// Block while the workload is paused; false once shutdown is observed
    async fn handle_pause(&mut self) -> bool {
        if !*self.paused.borrow() {
            return true;
        }

        let shared = Arc::clone(&self.shared);
        if let Err(e) = shared.workload.set_paused() {
            // unpaused before the pause took effect
            debug!(workload_id = %shared.workload_id(), error = %e, "Pause not applied");
            return true;
        }
        shared.record_transition(WorkloadState::Paused);
        shared.logger.log_paused(&shared.current_tick.now().to_string());

        tokio::select! {
            _ = self.paused.wait_for(|paused| !*paused) => {}
            _ = self.shutdown.recv() => {
                self.stopped = true;
                return false;
            }
        }

        match shared.workload.unpause() {
            Ok(()) => {
                shared.record_transition(WorkloadState::Running);
                shared
                    .logger
                    .log_unpaused(shared.workload.get_statistics().time_spent_paused_millis);
            }
            Err(e) => {
                warn!(workload_id = %shared.workload_id(), error = %e, "Failed to resume workload");
            }
        }
        true
    }
}

/// Start both clocks at the timestamp of the first event
fn bootstrap_clocks(shared: &DriverShared, timestamp: DateTime<Utc>) -> Result<(), DriverError> {
    shared.current_tick.increase_clock_time_to(timestamp)?;
    shared.clock_time.increase_clock_time_to(timestamp)?;
    info!(
        workload_id = %shared.workload_id(),
        start = %timestamp,
        "Initialized logical clocks from first event"
    );
    Ok(())
}

/// Read events until the generator is done, then drain the queue and
/// signal execution complete
pub(super) async fn drive_workload(
    shared: Arc<DriverShared>,
    mut events: mpsc::Receiver<Event>,
    mut generator_done: oneshot::Receiver<()>,
    trigger: TickTrigger,
    execution_done: oneshot::Sender<()>,
) {
    let mut issuer = TickIssuer::new(Arc::clone(&shared), trigger);
    let mut bootstrapped = false;

    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = issuer.shutdown.recv() => {
                debug!(workload_id = %shared.workload_id(), "Ingestion loop shutting down");
                return;
            }
        };
        let Some(event) = event else { break };

        if !bootstrapped {
            if let Err(e) = bootstrap_clocks(&shared, event.timestamp) {
                shared.report_error(e);
                return;
            }
            bootstrapped = true;
        } else if shared.config.perform_clock_ticks
            && event.timestamp >= shared.current_tick.now() + shared.config.tick_duration
        {
            if let Err(e) = issuer.issue_clock_ticks(event.timestamp).await {
                shared.report_error(e);
                return;
            }
            if issuer.stopped {
                return;
            }
        }

        shared.event_queue.enqueue_event(event);
    }

    match generator_done.try_recv() {
        Ok(()) => info!(
            workload_id = %shared.workload_id(),
            pending_events = shared.event_queue.len(),
            "Event generation complete, draining event queue"
        ),
        Err(_) => warn!(
            workload_id = %shared.workload_id(),
            "Event stream closed without a completion signal"
        ),
    }

    while !shared.event_queue.is_empty() && shared.workload.is_in_progress() {
        if shared.config.perform_clock_ticks {
            let target = shared.current_tick.now() + shared.config.tick_duration;
            if let Err(e) = issuer.issue_clock_ticks(target).await {
                shared.report_error(e);
                return;
            }
            if issuer.stopped {
                return;
            }
        } else {
            tokio::select! {
                _ = tokio::time::sleep(DRAIN_POLL_INTERVAL) => {}
                _ = issuer.shutdown.recv() => return,
            }
        }
    }

    debug!(workload_id = %shared.workload_id(), "Signalling workload execution complete");
    let _ = execution_done.send(());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DriverConfig, WorkloadDriver};
    use crate::kernel::SimulatedKernel;
    use crate::workload::{TemplateWorkload, Workload, WorkloadKind};
    use chrono::TimeZone;

    fn driver(factor: f64) -> WorkloadDriver {
        let workload = Workload::new(
            "wl-ticks",
            "ticks",
            1,
            1.0,
            WorkloadKind::Template(TemplateWorkload { sessions: vec![] }),
        )
        .unwrap();
        WorkloadDriver::builder()
            .workload(Arc::new(workload))
            .kernel(Arc::new(SimulatedKernel::default()))
            .config(DriverConfig {
                timescale_adjustment_factor: factor,
                ..Default::default()
            })
            .build()
            .unwrap()
    }

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    /// Acknowledge every tick, recording its timestamp
    fn spawn_tick_sink(
        mut ticker: crate::clock::Ticker,
    ) -> tokio::task::JoinHandle<Vec<DateTime<Utc>>> {
        tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(tick) = ticker.recv().await {
                seen.push(tick.timestamp);
                tick.done();
            }
            seen
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_issues_floor_of_elapsed_ticks() {
        let driver = driver(0.0);
        let shared = Arc::clone(&driver.shared);
        shared.workload.start_workload().unwrap();
        bootstrap_clocks(&shared, t0()).unwrap();

        let (trigger, ticker) = crate::clock::sync_ticker();
        let sink = spawn_tick_sink(ticker);

        let mut issuer = TickIssuer::new(Arc::clone(&shared), trigger);
        issuer
            .issue_clock_ticks(t0() + chrono::Duration::seconds(185))
            .await
            .unwrap();
        drop(issuer);

        let ticks = sink.await.unwrap();
        assert_eq!(
            ticks,
            vec![
                t0() + chrono::Duration::seconds(60),
                t0() + chrono::Duration::seconds(120),
                t0() + chrono::Duration::seconds(180),
            ]
        );
        assert_eq!(shared.current_tick.now(), t0() + chrono::Duration::seconds(180));
        assert_eq!(shared.workload.get_statistics().tick_durations_millis.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_are_paced_against_wall_clock() {
        let driver = driver(0.5);
        let shared = Arc::clone(&driver.shared);
        shared.workload.start_workload().unwrap();
        bootstrap_clocks(&shared, t0()).unwrap();

        let (trigger, ticker) = crate::clock::sync_ticker();
        let sink = spawn_tick_sink(ticker);

        let started = Instant::now();
        let mut issuer = TickIssuer::new(Arc::clone(&shared), trigger);
        issuer
            .issue_clock_ticks(t0() + chrono::Duration::seconds(120))
            .await
            .unwrap();
        drop(issuer);

        assert_eq!(sink.await.unwrap().len(), 2);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(60) && elapsed < Duration::from_secs(61));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_ticks_once_workload_stopped() {
        let driver = driver(0.0);
        let shared = Arc::clone(&driver.shared);
        shared.workload.start_workload().unwrap();
        shared.workload.terminate_workload_prematurely().unwrap();
        bootstrap_clocks(&shared, t0()).unwrap();

        let (trigger, ticker) = crate::clock::sync_ticker();
        let sink = spawn_tick_sink(ticker);

        let mut issuer = TickIssuer::new(Arc::clone(&shared), trigger);
        issuer
            .issue_clock_ticks(t0() + chrono::Duration::seconds(600))
            .await
            .unwrap();
        drop(issuer);

        assert!(sink.await.unwrap().is_empty());
        assert_eq!(shared.current_tick.now(), t0());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_blocks_ticks_until_resumed() {
        let driver = driver(0.0);
        let shared = Arc::clone(&driver.shared);
        shared.workload.start_workload().unwrap();
        bootstrap_clocks(&shared, t0()).unwrap();
        driver.pause().unwrap();

        let (trigger, ticker) = crate::clock::sync_ticker();
        let sink = spawn_tick_sink(ticker);

        let issuing = {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                let mut issuer = TickIssuer::new(shared, trigger);
                issuer
                    .issue_clock_ticks(t0() + chrono::Duration::seconds(120))
                    .await
                    .unwrap();
            })
        };

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(shared.workload.state(), WorkloadState::Paused);
        assert_eq!(shared.current_tick.now(), t0());

        driver.unpause().unwrap();
        issuing.await.unwrap();

        assert_eq!(sink.await.unwrap().len(), 2);
        let stats = shared.workload.get_statistics();
        assert_eq!(stats.workload_state, WorkloadState::Running);
        assert_eq!(stats.time_spent_paused_millis, 5000);
    }
}
