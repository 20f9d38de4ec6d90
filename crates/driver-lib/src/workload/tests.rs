use super::*;
use crate::error::WorkloadError;
use crate::models::ResourceSpec;

fn template_session(id: &str, start: u64, stop: u64) -> TemplateSession {
    TemplateSession {
        id: id.into(),
        start_tick: start,
        stop_tick: stop,
        trainings: vec![TrainingEvent {
            index: 0,
            millicpus: 500.0,
            mem_mb: 1024.0,
            vram_gb: 2.0,
            gpu_utilizations: vec![80.0],
            start_tick: start + 1,
            duration_in_ticks: 1,
        }],
        max_resource_request: Some(ResourceSpec::new(1000.0, 2048.0, 1, 4.0)),
    }
}

fn template_workload(sessions: Vec<TemplateSession>, pct: f64) -> Workload {
    Workload::new(
        "wl-1",
        "test workload",
        7,
        pct,
        WorkloadKind::Template(TemplateWorkload { sessions }),
    )
    .unwrap()
}

#[test]
fn test_full_lifecycle() {
    let workload = template_workload(vec![template_session("s1", 0, 4)], 1.0);
    assert_eq!(workload.state(), WorkloadState::Ready);

    workload.start_workload().unwrap();
    assert!(workload.is_in_progress());

    workload.set_pausing().unwrap();
    workload.set_paused().unwrap();
    workload.unpause().unwrap();
    assert_eq!(workload.state(), WorkloadState::Running);

    workload.set_workload_completed().unwrap();
    assert_eq!(workload.state(), WorkloadState::Finished);

    let stats = workload.get_statistics();
    assert_eq!(stats.workload_state, WorkloadState::Finished);
    assert!(stats.end_time.is_some());
    assert!(stats.workload_duration_millis.is_some());
}

#[test]
fn test_start_requires_ready() {
    let workload = template_workload(vec![], 1.0);
    workload.start_workload().unwrap();
    assert_eq!(
        workload.start_workload(),
        Err(WorkloadError::NotReady(WorkloadState::Running))
    );
}

#[test]
fn test_completion_is_idempotent() {
    let workload = template_workload(vec![], 1.0);
    workload.start_workload().unwrap();
    workload.set_workload_completed().unwrap();
    let end_time = workload.get_statistics().end_time;

    assert_eq!(
        workload.set_workload_completed(),
        Err(WorkloadError::AlreadyCompleted)
    );
    assert_eq!(workload.state(), WorkloadState::Finished);
    assert_eq!(workload.get_statistics().end_time, end_time);
}

#[test]
fn test_pause_transitions_are_checked() {
    let workload = template_workload(vec![], 1.0);
    assert!(matches!(
        workload.set_pausing(),
        Err(WorkloadError::NotRunning(WorkloadState::Ready))
    ));

    workload.start_workload().unwrap();
    assert!(workload.set_paused().is_err());
    assert!(matches!(
        workload.unpause(),
        Err(WorkloadError::NotPaused(WorkloadState::Running))
    ));

    workload.set_pausing().unwrap();
    assert!(workload.cancel_pausing());
    assert_eq!(workload.state(), WorkloadState::Running);
    assert!(!workload.cancel_pausing());
}

#[test]
fn test_terminate_only_when_in_progress() {
    let workload = template_workload(vec![], 1.0);
    assert!(workload.terminate_workload_prematurely().is_err());

    workload.start_workload().unwrap();
    workload.terminate_workload_prematurely().unwrap();
    assert_eq!(workload.state(), WorkloadState::Terminated);

    // a terminated workload cannot then finish
    assert!(matches!(
        workload.set_workload_completed(),
        Err(WorkloadError::InvalidTransition { .. })
    ));
}

#[test]
fn test_set_erred_records_message() {
    let workload = template_workload(vec![], 1.0);
    workload.start_workload().unwrap();
    workload.set_erred("kernel backend went away");

    assert_eq!(workload.state(), WorkloadState::Erred);
    assert_eq!(
        workload.error_message().as_deref(),
        Some("kernel backend went away")
    );
}

#[tokio::test(start_paused = true)]
async fn test_time_spent_paused_is_tracked() {
    let workload = template_workload(vec![], 1.0);
    workload.start_workload().unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;
    workload.set_pausing().unwrap();
    workload.set_paused().unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    workload.update_time_elapsed();
    let paused_elapsed = workload.get_statistics().time_elapsed_millis;

    workload.unpause().unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    workload.update_time_elapsed();

    let stats = workload.get_statistics();
    assert_eq!(stats.time_spent_paused_millis, 5000);
    assert_eq!(stats.time_elapsed_millis, 3000);
    // elapsed time does not advance while paused
    assert!(paused_elapsed <= 2000);
}

#[test]
fn test_sampling_is_stable_and_seeded() {
    let sessions: Vec<_> = (0..50)
        .map(|i| template_session(&format!("s{i}"), 0, 4))
        .collect();

    let a = template_workload(sessions.clone(), 0.5);
    let b = template_workload(sessions, 0.5);

    let stats = a.get_statistics();
    assert_eq!(stats.total_num_sessions, 50);
    assert_eq!(stats.num_sampled_sessions + stats.num_discarded_sessions, 50);
    assert!(stats.num_sampled_sessions > 0);
    assert!(stats.num_discarded_sessions > 0);

    for i in 0..50 {
        let id = format!("s{i}");
        let first = a.is_session_being_sampled(&id);
        assert_eq!(a.is_session_being_sampled(&id), first);
        assert_eq!(b.is_session_being_sampled(&id), first);

        let expected_state = if first {
            SessionState::AwaitingStart
        } else {
            SessionState::Discarded
        };
        assert_eq!(a.session(&id).unwrap().state, expected_state);
    }
}

#[test]
fn test_sampling_extremes() {
    let all = template_workload(vec![template_session("s1", 0, 4)], 1.0);
    assert!(all.is_session_being_sampled("s1"));
    assert!(all.is_session_being_sampled("late-arrival"));

    let none = template_workload(vec![template_session("s1", 0, 4)], 0.0);
    assert!(!none.is_session_being_sampled("s1"));
    assert_eq!(none.get_statistics().num_discarded_sessions, 1);
}

#[test]
fn test_invalid_template_rejected() {
    let mut bad = template_session("s1", 5, 4);
    bad.trainings.clear();
    let result = Workload::new(
        "wl",
        "bad",
        1,
        1.0,
        WorkloadKind::Template(TemplateWorkload {
            sessions: vec![bad],
        }),
    );
    assert!(matches!(result, Err(WorkloadError::InvalidTemplate(_))));

    let dup = Workload::new(
        "wl",
        "dup",
        1,
        1.0,
        WorkloadKind::Template(TemplateWorkload {
            sessions: vec![template_session("s1", 0, 4), template_session("s1", 0, 4)],
        }),
    );
    assert!(matches!(dup, Err(WorkloadError::InvalidTemplate(_))));
}

#[test]
fn test_session_statistics_hooks() {
    let workload = template_workload(vec![template_session("s1", 0, 4)], 1.0);
    workload.start_workload().unwrap();

    let metadata = SessionMetadata {
        max_resources: ResourceSpec::new(1000.0, 2048.0, 1, 4.0),
        ..Default::default()
    };
    workload.session_created("s1", &metadata, Duration::from_millis(12));
    workload.training_submitted("s1", Duration::from_millis(3));
    workload.training_started("s1", Duration::from_millis(8));
    assert_eq!(workload.session("s1").unwrap().state, SessionState::Training);

    let stats = workload.get_statistics();
    assert_eq!(stats.num_active_sessions, 1);
    assert_eq!(stats.num_active_trainings, 1);
    assert_eq!(stats.num_submitted_trainings, 0);

    workload.training_submitted("s1", Duration::from_millis(3));
    workload.training_start_timed_out("s1");
    assert_eq!(workload.get_statistics().num_submitted_trainings, 0);

    workload.training_stopped("s1", 1, Duration::from_millis(20));
    workload.session_delayed("s1", chrono::Duration::seconds(10));
    workload.session_output("s1", OutputStream::Stdout, "epoch 1 done");
    workload.session_stopped("s1", Duration::from_millis(5));

    let stats = workload.get_statistics();
    assert_eq!(stats.num_sessions_created, 1);
    assert_eq!(stats.num_tasks_executed, 1);
    assert_eq!(stats.num_active_sessions, 0);
    assert_eq!(stats.num_active_trainings, 0);
    assert_eq!(stats.cumulative_training_time_ticks, 1);
    assert_eq!(stats.aggregate_session_delay_millis, 10_000);
    assert_eq!(stats.num_times_session_delayed_resource_contention, 1);
    assert_eq!(stats.session_creation_latencies_millis, vec![12]);

    let session = workload.session("s1").unwrap();
    assert_eq!(session.state, SessionState::Stopped);
    assert_eq!(session.trainings_completed, 1);
    assert_eq!(session.total_delay_millis, 10_000);
    assert_eq!(session.stdout, vec!["epoch 1 done".to_string()]);
}

#[test]
fn test_processed_event_log_is_capped() {
    use crate::models::{Event, EventName, WorkloadEvent};

    let workload = template_workload(vec![], 1.0);
    let event = Event::new(EventName::UpdateGpuUtil, "s1", chrono::Utc::now());
    for _ in 0..(MAX_PROCESSED_EVENT_RECORDS + 10) {
        workload.processed_event(WorkloadEvent::processed(&event, event.name, None));
    }

    let stats = workload.get_statistics();
    assert_eq!(stats.num_events_processed as usize, MAX_PROCESSED_EVENT_RECORDS + 10);
    assert_eq!(stats.events_processed.len(), MAX_PROCESSED_EVENT_RECORDS);
}

#[test]
fn test_tick_counters() {
    let workload = template_workload(vec![], 1.0);
    workload.tick_completed(1);
    workload.record_tick_duration(Duration::from_millis(40));
    workload.tick_completed(2);
    workload.record_tick_duration(Duration::from_millis(55));

    let stats = workload.get_statistics();
    assert_eq!(stats.total_num_ticks, 2);
    assert_eq!(stats.current_tick, 2);
    assert_eq!(stats.tick_durations_millis, vec![40, 55]);
}
