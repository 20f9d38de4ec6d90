//! Processing loop: dispatches due events on every tick and owns the
//! terminal transitions of the workload

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::client::SessionClient;
use super::{ClientHandle, DriverShared};
use crate::clock::{Tick, Ticker};
use crate::error::DriverError;
use crate::models::EventName;
use crate::workload::WorkloadState;

pub(super) struct ProcessChannels {
    pub ticker: Ticker,
    pub errors: mpsc::UnboundedReceiver<DriverError>,
    pub stop: mpsc::Receiver<()>,
    pub execution_done: oneshot::Receiver<()>,
}

/// Why the processing loop gave up on the workload
enum Abort {
    Critical(DriverError),
    Stopped,
}

pub(super) async fn process_workload_events(
    shared: Arc<DriverShared>,
    channels: ProcessChannels,
    generator: JoinHandle<()>,
) {
    let ProcessChannels {
        mut ticker,
        mut errors,
        mut stop,
        mut execution_done,
    } = channels;
    let mut clients = JoinSet::new();
    let mut tick_number = 0u64;

    loop {
        tokio::select! {
            biased;

            Some(err) = errors.recv() => {
                abort(&shared, &generator, &mut clients, Abort::Critical(err));
                break;
            }
            Some(()) = stop.recv() => {
                abort(&shared, &generator, &mut clients, Abort::Stopped);
                break;
            }
            Some(tick) = ticker.recv() => {
                tick_number += 1;
                handle_tick(&shared, tick, tick_number, &mut clients).await;
            }
            done = &mut execution_done => {
                match done {
                    Ok(()) => match drain_clients(&shared, &mut clients, &mut errors, &mut stop).await {
                        Some(reason) => abort(&shared, &generator, &mut clients, reason),
                        None => complete(&shared),
                    },
                    Err(_) => match errors.try_recv() {
                        Ok(err) => abort(&shared, &generator, &mut clients, Abort::Critical(err)),
                        Err(_) => warn!(
                            workload_id = %shared.workload_id(),
                            state = %shared.workload.state(),
                            "Ingestion loop exited without completing"
                        ),
                    },
                }
                break;
            }
            Some(joined) = clients.join_next(), if !clients.is_empty() => {
                if let Err(e) = joined {
                    warn!(workload_id = %shared.workload_id(), error = %e, "Session client task failed");
                }
            }
        }
    }

    shared.publish_gauges();
    shared.finished.send_replace(true);
    debug!(workload_id = %shared.workload_id(), "Processing loop exited");
}

async fn handle_tick(
    shared: &Arc<DriverShared>,
    tick: Tick,
    tick_number: u64,
    clients: &mut JoinSet<()>,
) {
    let tick_start = tick.timestamp - shared.config.tick_duration;
    if shared.clock_time.now() < tick_start {
        if let Err(e) = shared.clock_time.increase_clock_time_to(tick_start) {
            shared.report_error(e.into());
        }
    }

    if let Err(e) = enqueue_events_for_tick(shared, tick.timestamp, clients).await {
        shared.report_error(e);
    }

    shared.workload.tick_completed(tick_number);
    shared.publish_gauges();
    debug!(
        workload_id = %shared.workload_id(),
        tick = %tick.timestamp,
        tick_number,
        pending_events = shared.event_queue.len(),
        "Processed tick"
    );
    tick.done();
}

/// Hand every event due by `tick` to its session client
pub(super) async fn enqueue_events_for_tick(
    shared: &Arc<DriverShared>,
    tick: DateTime<Utc>,
    clients: &mut JoinSet<()>,
) -> Result<(), DriverError> {
    while shared.event_queue.has_events_for_tick(tick) {
        let Some(event) = shared.event_queue.pop(tick) else {
            break;
        };

        if event.timestamp > shared.clock_time.now() {
            shared.clock_time.increase_clock_time_to(event.timestamp)?;
        }

        let session_id = event.session_id.clone();
        match event.name {
            EventName::SessionReady => {
                if shared.clients.contains_key(&session_id) {
                    warn!(
                        workload_id = %shared.workload_id(),
                        session_id = %session_id,
                        "Session already has a client, discarding duplicate SessionReady"
                    );
                    shared.workload.event_discarded(&session_id);
                    continue;
                }

                shared.event_queue.hold_events_for_session(&session_id);
                let (sender, receiver) = mpsc::channel(shared.config.client_channel_capacity);
                let generation = event.global_index;
                shared
                    .clients
                    .insert(session_id.clone(), ClientHandle { sender, generation });

                let client =
                    SessionClient::new(Arc::clone(shared), session_id, generation, receiver);
                clients.spawn(client.run(event));
            }
            name => {
                let sender = shared
                    .clients
                    .get(&session_id)
                    .map(|handle| handle.sender.clone());
                let Some(sender) = sender else {
                    debug!(
                        workload_id = %shared.workload_id(),
                        session_id = %session_id,
                        event_name = %name,
                        "No client for session, discarding event"
                    );
                    shared.workload.event_discarded(&session_id);
                    continue;
                };

                let holds = matches!(name, EventName::TrainingStarted | EventName::TrainingEnded);
                if holds {
                    shared.event_queue.hold_events_for_session(&session_id);
                }
                if sender.send(event).await.is_err() {
                    if holds {
                        shared.event_queue.release_event_hold_for_session(&session_id);
                    }
                    shared.workload.event_discarded(&session_id);
                }
            }
        }
    }

    shared.workload.update_time_elapsed();
    Ok(())
}

/// Wait for every client to finish its backlog. An error or stop request
/// that shows up in the meantime wins over completion.
async fn drain_clients(
    shared: &Arc<DriverShared>,
    clients: &mut JoinSet<()>,
    errors: &mut mpsc::UnboundedReceiver<DriverError>,
    stop: &mut mpsc::Receiver<()>,
) -> Option<Abort> {
    info!(
        workload_id = %shared.workload_id(),
        active_clients = clients.len(),
        "Workload execution complete, waiting for session clients"
    );

    // Dropping the senders lets each client finish its backlog and exit.
    shared.clients.clear();
    loop {
        tokio::select! {
            biased;

            Some(err) = errors.recv() => return Some(Abort::Critical(err)),
            Some(()) = stop.recv() => return Some(Abort::Stopped),
            joined = clients.join_next() => match joined {
                Some(Err(e)) => {
                    warn!(workload_id = %shared.workload_id(), error = %e, "Session client task failed");
                }
                Some(Ok(())) => {}
                None => break,
            },
        }
    }

    if let Ok(err) = errors.try_recv() {
        return Some(Abort::Critical(err));
    }
    // stopped before the stop signal reached this loop
    if !shared.workload.is_in_progress() {
        return Some(Abort::Stopped);
    }
    None
}

fn complete(shared: &Arc<DriverShared>) {
    match shared.workload.set_workload_completed() {
        Ok(()) => {
            shared.record_transition(WorkloadState::Finished);
            let stats = shared.workload.get_statistics();
            shared.logger.log_finished(
                stats.total_num_ticks,
                stats.num_events_processed,
                stats.workload_duration_millis.unwrap_or_default(),
            );
        }
        Err(e) => {
            warn!(workload_id = %shared.workload_id(), error = %e, "Could not mark workload finished");
        }
    }
}

fn abort(
    shared: &Arc<DriverShared>,
    generator: &JoinHandle<()>,
    clients: &mut JoinSet<()>,
    reason: Abort,
) {
    generator.abort();
    let _ = shared.shutdown.send(());

    // in-flight clients keep running but receive nothing more
    shared.clients.clear();
    clients.detach_all();

    match reason {
        Abort::Critical(err) => {
            let message = err.to_string();
            shared.workload.set_erred(message.clone());
            shared.record_transition(WorkloadState::Erred);
            shared.logger.log_erred(&message);

            let handler = Arc::clone(&shared.handlers.on_critical);
            let workload_id = shared.workload_id().to_string();
            tokio::spawn(async move { handler(&workload_id, err) });
        }
        Abort::Stopped => {
            shared.logger.log_stopped("stop requested");
        }
    }
}
