//! Workload driver
//!
//! Drives one [`Workload`] from its event stream to a terminal state. Three
//! kinds of task cooperate:
//!
//! - the ingestion loop reads events from the generator, issues clock ticks
//!   and paces them against wall-clock time
//! - the processing loop receives each tick, dispatches due events to
//!   session clients and owns the terminal state transitions
//! - one session client per admitted session talks to the kernel backend

mod client;
mod config;
mod ingest;
mod process;
mod tick_window;


pub use config::DriverConfig;
pub use tick_window::TickWindow;

use chrono::{DateTime, Timelike, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{error, info, warn};

use crate::clock::{sync_ticker, LogicalClock, TickTrigger, Ticker};
use crate::error::{DriverError, WorkloadError};
use crate::event_queue::EventQueue;
use crate::generator::{EventSink, TemplateGenerator, WorkloadGenerator};
use crate::kernel::KernelSessionManager;
use crate::models::Event;
use crate::observability::{MetricsPort, NoopMetrics, StructuredLogger};
use crate::workload::{Statistics, Workload, WorkloadKind, WorkloadState};

/// Callback receiving the workload id and the error
pub type ErrorHandler = Arc<dyn Fn(&str, DriverError) + Send + Sync>;

/// Handlers notified of errors; each call runs in its own task
#[derive(Clone)]
pub struct ErrorHandlers {
    pub on_critical: ErrorHandler,
    pub on_non_critical: ErrorHandler,
}

impl Default for ErrorHandlers {
    fn default() -> Self {
        Self {
            on_critical: Arc::new(|workload_id: &str, err: DriverError| {
                error!(workload_id = %workload_id, error = %err, "Critical workload error");
            }),
            on_non_critical: Arc::new(|workload_id: &str, err: DriverError| {
                warn!(workload_id = %workload_id, error = %err, "Non-critical workload error");
            }),
        }
    }
}

/// Registry entry for a running session client
pub(crate) struct ClientHandle {
    sender: mpsc::Sender<Event>,
    /// Distinguishes successive clients of the same session
    generation: u64,
}

/// State shared by the driver loops and every session client
pub(crate) struct DriverShared {
    config: DriverConfig,
    workload: Arc<Workload>,
    event_queue: EventQueue,
    /// Last tick boundary reached
    current_tick: LogicalClock,
    /// Fine-grained time within the current tick
    clock_time: LogicalClock,
    clients: DashMap<String, ClientHandle>,
    kernel: Arc<dyn KernelSessionManager>,
    metrics: Arc<dyn MetricsPort>,
    handlers: ErrorHandlers,
    logger: StructuredLogger,
    paused: watch::Sender<bool>,
    shutdown: broadcast::Sender<()>,
    errors: mpsc::UnboundedSender<DriverError>,
    finished: watch::Sender<bool>,
}

impl DriverShared {
    fn workload_id(&self) -> &str {
        self.workload.id()
    }

    /// Route an error to the abort path or the non-critical handler
    pub(crate) fn report_error(&self, err: DriverError) {
        if err.is_critical() {
            error!(
                workload_id = %self.workload_id(),
                error = %err,
                "Critical error reported"
            );
            let _ = self.errors.send(err);
        } else {
            warn!(
                workload_id = %self.workload_id(),
                error = %err,
                "Non-critical error reported"
            );
            let handler = Arc::clone(&self.handlers.on_non_critical);
            let workload_id = self.workload_id().to_string();
            tokio::spawn(async move { handler(&workload_id, err) });
        }
    }

    fn record_transition(&self, state: WorkloadState) {
        self.metrics.record_state_transition(self.workload_id(), state);
    }

    fn publish_gauges(&self) {
        let stats = self.workload.get_statistics();
        self.metrics
            .set_active_sessions(self.workload_id(), stats.num_active_sessions);
        self.metrics
            .set_active_trainings(self.workload_id(), stats.num_active_trainings);
    }
}

/// Receivers consumed by the loops on start
struct LoopChannels {
    ticker: Ticker,
    errors: mpsc::UnboundedReceiver<DriverError>,
    stop: mpsc::Receiver<()>,
}

/// Drives a single workload
pub struct WorkloadDriver {
    shared: Arc<DriverShared>,
    generator: Arc<dyn WorkloadGenerator>,
    trigger: TickTrigger,
    stop: mpsc::Sender<()>,
    channels: Mutex<Option<LoopChannels>>,
}

impl WorkloadDriver {
    pub fn builder() -> WorkloadDriverBuilder {
        WorkloadDriverBuilder::new()
    }

    pub fn workload(&self) -> &Arc<Workload> {
        &self.shared.workload
    }

    pub fn config(&self) -> &DriverConfig {
        &self.shared.config
    }

    /// Start the workload and spawn the driver loops
    pub fn start(&self) -> Result<(), DriverError> {
        let mut slot = self.channels.lock();
        let channels = slot.take().ok_or(DriverError::AlreadyStarted)?;
        if let Err(e) = self.shared.workload.start_workload() {
            *slot = Some(channels);
            return Err(e.into());
        }
        drop(slot);

        let shared = Arc::clone(&self.shared);
        shared.record_transition(WorkloadState::Running);
        shared.logger.log_started(
            shared.config.tick_duration.num_milliseconds(),
            shared.config.timescale_adjustment_factor,
        );

        let (event_tx, event_rx) = mpsc::channel(shared.config.client_channel_capacity);
        let (generator_done_tx, generator_done_rx) = tokio::sync::oneshot::channel();
        let (execution_done_tx, execution_done_rx) = tokio::sync::oneshot::channel();

        let sink = EventSink::new(event_tx, generator_done_tx, Arc::clone(&shared.workload));
        let generator = Arc::clone(&self.generator);
        let generator_shared = Arc::clone(&shared);
        let generator_task = tokio::spawn(async move {
            if let Err(e) = generator.generate(sink).await {
                if generator_shared.workload.is_in_progress() {
                    generator_shared.report_error(e);
                }
            }
        });

        tokio::spawn(ingest::drive_workload(
            Arc::clone(&shared),
            event_rx,
            generator_done_rx,
            self.trigger.clone(),
            execution_done_tx,
        ));
        tokio::spawn(process::process_workload_events(
            shared,
            process::ProcessChannels {
                ticker: channels.ticker,
                errors: channels.errors,
                stop: channels.stop,
                execution_done: execution_done_rx,
            },
            generator_task,
        ));

        Ok(())
    }

    /// Request a pause; ticking halts before the next tick
    pub fn pause(&self) -> Result<(), DriverError> {
        if *self.shared.paused.borrow() {
            return Err(WorkloadError::AlreadyPaused.into());
        }
        self.shared.workload.set_pausing()?;
        self.shared.record_transition(WorkloadState::Pausing);
        self.shared.paused.send_replace(true);
        Ok(())
    }

    pub fn unpause(&self) -> Result<(), DriverError> {
        if !*self.shared.paused.borrow() {
            return Err(WorkloadError::AlreadyUnpaused.into());
        }
        self.shared.paused.send_replace(false);

        // The ticking loop never got to observe the pause.
        if self.shared.workload.cancel_pausing() {
            self.shared.record_transition(WorkloadState::Running);
        }
        Ok(())
    }

    /// Terminate the workload early
    pub fn stop(&self) -> Result<(), DriverError> {
        self.shared.workload.terminate_workload_prematurely()?;
        self.shared.record_transition(WorkloadState::Terminated);
        let _ = self.stop.try_send(());
        Ok(())
    }

    /// Wait until the processing loop has exited
    pub async fn wait_until_done(&self) -> WorkloadState {
        let mut finished = self.shared.finished.subscribe();
        let _ = finished.wait_for(|done| *done).await;
        self.shared.workload.state()
    }

    pub fn is_done(&self) -> bool {
        *self.shared.finished.borrow()
    }

    pub fn statistics(&self) -> Statistics {
        self.shared.workload.get_statistics()
    }

    /// Current tick boundary
    pub fn current_tick(&self) -> DateTime<Utc> {
        self.shared.current_tick.now()
    }

    /// Fine-grained clock time
    pub fn clock_time(&self) -> DateTime<Utc> {
        self.shared.clock_time.now()
    }

    /// Trigger for issuing ticks from outside when the driver does not
    /// issue its own
    pub fn tick_trigger(&self) -> TickTrigger {
        self.trigger.clone()
    }

    pub fn num_pending_events(&self) -> usize {
        self.shared.event_queue.len()
    }

    pub fn num_active_clients(&self) -> usize {
        self.shared.clients.len()
    }
}

/// Builder for a [`WorkloadDriver`]
pub struct WorkloadDriverBuilder {
    workload: Option<Arc<Workload>>,
    kernel: Option<Arc<dyn KernelSessionManager>>,
    generator: Option<Arc<dyn WorkloadGenerator>>,
    metrics: Arc<dyn MetricsPort>,
    handlers: ErrorHandlers,
    config: DriverConfig,
}

impl WorkloadDriverBuilder {
    pub fn new() -> Self {
        Self {
            workload: None,
            kernel: None,
            generator: None,
            metrics: Arc::new(NoopMetrics),
            handlers: ErrorHandlers::default(),
            config: DriverConfig::default(),
        }
    }

    pub fn workload(mut self, workload: Arc<Workload>) -> Self {
        self.workload = Some(workload);
        self
    }

    pub fn kernel(mut self, kernel: Arc<dyn KernelSessionManager>) -> Self {
        self.kernel = Some(kernel);
        self
    }

    /// Event source; required for preset workloads
    pub fn generator(mut self, generator: Arc<dyn WorkloadGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsPort>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn error_handlers(mut self, handlers: ErrorHandlers) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn config(mut self, config: DriverConfig) -> Self {
        self.config = config;
        self
    }

    pub fn tick_duration(mut self, tick_duration: chrono::Duration) -> Self {
        self.config.tick_duration = tick_duration;
        self
    }

    pub fn timescale_adjustment_factor(mut self, factor: f64) -> Self {
        self.config.timescale_adjustment_factor = factor;
        self
    }

    pub fn build(self) -> Result<WorkloadDriver, DriverError> {
        let workload = self
            .workload
            .ok_or(DriverError::MissingComponent("workload"))?;
        let kernel = self.kernel.ok_or(DriverError::MissingComponent("kernel"))?;

        let generator = match (self.generator, workload.kind()) {
            (Some(generator), _) => generator,
            (None, WorkloadKind::Template(template)) => {
                let now = Utc::now();
                let base = now.with_nanosecond(0).unwrap_or(now);
                Arc::new(TemplateGenerator::new(
                    template.sessions.clone(),
                    base,
                    self.config.tick_duration,
                )) as Arc<dyn WorkloadGenerator>
            }
            (None, WorkloadKind::Preset(_)) => {
                return Err(DriverError::MissingComponent("generator"))
            }
        };

        let (trigger, ticker) = sync_ticker();
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let (shutdown, _) = broadcast::channel(4);

        let logger = StructuredLogger::new(workload.id());
        logger.log_registered(
            workload.name(),
            workload.kind().label(),
            workload.get_statistics().total_num_sessions,
        );
        info!(
            workload_id = %workload.id(),
            tick_duration_secs = self.config.tick_duration.num_seconds(),
            perform_clock_ticks = self.config.perform_clock_ticks,
            "Built workload driver"
        );

        let shared = Arc::new(DriverShared {
            config: self.config,
            workload,
            event_queue: EventQueue::new(),
            current_tick: LogicalClock::default(),
            clock_time: LogicalClock::default(),
            clients: DashMap::new(),
            kernel,
            metrics: self.metrics,
            handlers: self.handlers,
            logger,
            paused: watch::Sender::new(false),
            shutdown,
            errors: errors_tx,
            finished: watch::Sender::new(false),
        });

        Ok(WorkloadDriver {
            shared,
            generator,
            trigger,
            stop: stop_tx,
            channels: Mutex::new(Some(LoopChannels {
                ticker,
                errors: errors_rx,
                stop: stop_rx,
            })),
        })
    }
}

impl Default for WorkloadDriverBuilder {
    fn default() -> Self {
        Self::new()
    }
}
