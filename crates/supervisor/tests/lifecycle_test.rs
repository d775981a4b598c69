//! Deployment lifecycle behaviour.
//!
//! **Scenario:** GIVEN a supervised deployment WHEN its process starts,
//! becomes ready, is stopped or dies THEN transitions fire once, in order,
//! and the task handles follow the process.

mod common;

use std::sync::Arc;

use common::{Fleet, start_ready, unwrap_result};
use supervisor::memory::InMemoryProcessServer;
use supervisor::{
    DeploymentArguments, DeploymentError, DeploymentEvent, DeploymentSpec, DeploymentState,
    DeploymentSupervisor, ExclusionPolicy, PollOutcome, PortDecl, ProcessExit, TaskActivity,
    TaskModel, Termination,
};

#[test]
fn given_slow_process_when_polled_then_ready_fires_on_fourth_poll() {
    // Given: a process reporting not-running three times
    let fleet = Fleet::with(
        InMemoryProcessServer::new().with_ready_after(3),
        Arc::new(supervisor::NoLogging),
    );
    fleet.task("nav", Vec::new());
    let mut supervisor = fleet.supervisor("nav_deployment", &["nav"]);
    let mut events = supervisor.subscribe();

    // When
    unwrap_result(supervisor.start(), "start should succeed");
    let outcomes: Vec<PollOutcome> = (0..4)
        .map(|_| unwrap_result(supervisor.poll(), "poll should succeed"))
        .collect();

    // Then
    assert_eq!(
        outcomes,
        vec![
            PollOutcome::Pending,
            PollOutcome::Pending,
            PollOutcome::Pending,
            PollOutcome::BecameReady
        ]
    );
    assert!(supervisor.is_ready());
    assert!(supervisor.task_handles().contains("nav"));
    assert_eq!(fleet.process("nav_deployment").readiness_polls(), 4);

    // Ready fires once
    assert_eq!(
        unwrap_result(supervisor.poll(), "poll should succeed"),
        PollOutcome::Idle
    );
    let ready_events = std::iter::from_fn(|| events.try_recv().ok())
        .filter(|e| matches!(e, DeploymentEvent::Ready { .. }))
        .count();
    assert_eq!(ready_events, 1);
}

#[test]
fn given_deployment_never_ready_when_stopped_then_nothing_is_reaped() {
    // Given
    let fleet = Fleet::with(
        InMemoryProcessServer::new().with_ready_after(u32::MAX),
        Arc::new(supervisor::NoLogging),
    );
    fleet.task("nav", Vec::new());
    let mut supervisor = fleet.supervisor("nav_deployment", &["nav"]);
    unwrap_result(supervisor.start(), "start should succeed");
    assert_eq!(
        unwrap_result(supervisor.poll(), "poll should succeed"),
        PollOutcome::Pending
    );

    // When
    unwrap_result(supervisor.stop(), "stop should succeed");
    let process = fleet.process("nav_deployment");
    assert_eq!(process.kills(), vec![false]);
    process.exit(ProcessExit::Signaled { signal: 15 });
    let outcome = unwrap_result(supervisor.poll(), "poll should succeed");

    // Then
    assert_eq!(
        outcome,
        PollOutcome::Died(Termination::Signaled { signal: 15 })
    );
    assert!(supervisor.ready_to_die());
    assert!(supervisor.task_handles().is_empty());
    assert_eq!(fleet.discovery.lookups(), 0);
    assert!(fleet.context.dataflow.lock().actual().is_empty());
    assert!(fleet.context.registry.is_empty());
}

#[test]
fn given_ready_deployment_when_asking_for_missing_task_then_not_found_names_it() {
    let fleet = Fleet::new();
    fleet.task("nav", Vec::new());
    let mut supervisor = fleet.supervisor("nav_deployment", &["nav"]);
    start_ready(&mut supervisor);

    let result = supervisor.task("missing");

    assert!(matches!(result, Err(DeploymentError::TaskNotFound { .. })));
    if let Err(e) = result {
        assert!(e.to_string().contains("missing"));
    }
}

#[test]
fn given_dead_deployment_when_death_is_reported_again_then_nothing_happens() {
    // Given
    let fleet = Fleet::new();
    fleet.task("nav", Vec::new());
    let mut supervisor = fleet.supervisor("nav_deployment", &["nav"]);
    let mut events = supervisor.subscribe();
    start_ready(&mut supervisor);
    let handle = unwrap_result(supervisor.task("nav"), "nav is declared")
        .handle()
        .map(|h| h.is_valid());
    assert_eq!(handle, Some(true));

    // When
    fleet
        .process("nav_deployment")
        .exit(ProcessExit::Exited { code: 1 });
    let first = unwrap_result(supervisor.poll(), "poll should succeed");
    let second = unwrap_result(supervisor.poll(), "poll should succeed");
    let third = supervisor.dead(None);

    // Then
    assert_eq!(
        first,
        PollOutcome::Died(Termination::Failed {
            exit: Some(ProcessExit::Exited { code: 1 })
        })
    );
    assert_eq!(second, PollOutcome::Idle);
    assert_eq!(third, None);
    assert_eq!(supervisor.state(), DeploymentState::Dead);
    assert!(!supervisor.ready_to_die());
    assert!(fleet.context.registry.is_empty());

    let terminated = std::iter::from_fn(|| events.try_recv().ok())
        .filter(|e| matches!(e, DeploymentEvent::Terminated { requested: false, .. }))
        .count();
    assert_eq!(terminated, 1);
}

#[test]
fn given_task_binding_when_deployment_lives_and_dies_then_handle_follows() {
    // Given: a binding requested before the deployment is ready
    let fleet = Fleet::new();
    fleet.task("camA", Vec::new());
    fleet.task("camB", Vec::new());
    let mut supervisor = fleet.supervisor("cameras", &["camA", "camB"]);
    let bindings = unwrap_result(supervisor.task_all(), "every task is declared");
    assert_eq!(bindings.len(), 2);
    assert!(bindings.iter().all(|b| !b.is_bound()));

    // When: ready
    start_ready(&mut supervisor);

    // Then
    assert!(bindings.iter().all(supervisor::TaskBinding::is_bound));
    let handle = bindings[0].handle();
    assert_eq!(
        handle.as_ref().and_then(|h| h.deployment()),
        Some("cameras")
    );

    // When: dead
    supervisor.dead(Some(ProcessExit::Exited { code: 0 }));

    // Then
    assert!(bindings.iter().all(|b| !b.is_bound()));
    assert_eq!(handle.map(|h| h.is_valid()), Some(false));
    assert_eq!(supervisor.termination(), Some(Termination::Succeeded));
}

#[test]
fn given_configured_tasks_when_deployment_dies_then_markers_are_cleared() {
    let fleet = Fleet::new();
    fleet.task("nav", Vec::new());
    let mut supervisor = fleet.supervisor("nav_deployment", &["nav"]);
    start_ready(&mut supervisor);
    fleet.context.configured.mark("nav");
    fleet.context.configured.mark("other");

    supervisor.dead(Some(ProcessExit::Signaled { signal: 9 }));

    assert!(!fleet.context.configured.is_configured("nav"));
    assert!(fleet.context.configured.is_configured("other"));
}

#[test]
fn given_exclusion_policy_when_ready_then_only_allowed_output_ports_are_logged() {
    // Given
    let policy = ExclusionPolicy::new().exclude_port("camA:state");
    let fleet = Fleet::with(InMemoryProcessServer::new(), Arc::new(policy));
    fleet.task(
        "camA",
        vec![
            PortDecl::output("frame_out", "/base/Frame"),
            PortDecl::output("state", "int"),
            PortDecl::input("command", "int"),
        ],
    );
    let mut supervisor = fleet.supervisor("cameras", &["camA"]);

    // When
    start_ready(&mut supervisor);

    // Then
    let expected = vec![("camA".to_string(), "frame_out".to_string())];
    assert_eq!(supervisor.logged_ports(), expected.as_slice());
    assert_eq!(fleet.process("cameras").logged_ports(), expected);
}

#[test]
fn given_unreachable_port_listing_when_ready_then_declared_model_ports_are_logged() {
    // Given: the task cannot list its ports, its model declares them
    let fleet = Fleet::with(InMemoryProcessServer::new(), Arc::new(ExclusionPolicy::new()));
    fleet.failing_task("camA");
    let model = Arc::new(
        TaskModel::new("camera::Task")
            .with_port(PortDecl::output("frame_out", "/base/Frame"))
            .with_port(PortDecl::input("command", "int")),
    );
    let spec = DeploymentSpec::new("cameras").with_activity(TaskActivity::new("camA", model));
    let mut supervisor = DeploymentSupervisor::new(Arc::new(spec), Arc::clone(&fleet.context));

    // When
    start_ready(&mut supervisor);

    // Then
    let expected = vec![("camA".to_string(), "frame_out".to_string())];
    assert_eq!(supervisor.logged_ports(), expected.as_slice());
    assert_eq!(fleet.process("cameras").logged_ports(), expected);
}

#[test]
fn given_logging_disabled_for_deployment_when_ready_then_no_port_is_logged() {
    let policy = ExclusionPolicy::new().exclude_deployment("diagnostics");
    let fleet = Fleet::with(InMemoryProcessServer::new(), Arc::new(policy));
    fleet.task("probe", vec![PortDecl::output("out", "int")]);
    fleet.task("camA", vec![PortDecl::output("frame_out", "/base/Frame")]);

    let mut excluded = fleet.supervisor("diagnostics", &["probe"]);
    start_ready(&mut excluded);
    assert!(excluded.logged_ports().is_empty());

    let mut opted_out = fleet
        .supervisor("cameras", &["camA"])
        .with_arguments(DeploymentArguments::default().with_log(false));
    start_ready(&mut opted_out);
    assert!(opted_out.logged_ports().is_empty());
    assert!(fleet.process("cameras").logged_ports().is_empty());
}

#[test]
fn given_task_not_discoverable_when_process_runs_then_deployment_stays_starting() {
    // Given: discovery does not know "nav" yet
    let fleet = Fleet::new();
    let mut supervisor = fleet.supervisor("nav_deployment", &["nav"]);
    unwrap_result(supervisor.start(), "start should succeed");

    // When
    let result = supervisor.poll();

    // Then
    assert!(matches!(result, Err(DeploymentError::DiscoveryFailed(_))));
    assert_eq!(supervisor.state(), DeploymentState::Starting);
    assert!(supervisor.task_handles().is_empty());

    // And the next poll recovers once the task is reachable
    fleet.task("nav", Vec::new());
    assert_eq!(
        unwrap_result(supervisor.poll(), "poll should succeed"),
        PollOutcome::BecameReady
    );
}

#[test]
fn given_stopping_deployment_when_stopped_again_then_no_second_kill() {
    let fleet = Fleet::new();
    fleet.task("nav", Vec::new());
    let mut supervisor = fleet.supervisor("nav_deployment", &["nav"]);
    assert!(matches!(
        supervisor.stop(),
        Err(DeploymentError::InvalidStateTransition { .. })
    ));
    start_ready(&mut supervisor);

    unwrap_result(supervisor.stop(), "first stop");
    unwrap_result(supervisor.stop(), "second stop is a no-op");

    assert_eq!(fleet.process("nav_deployment").kills(), vec![false]);
    assert_eq!(supervisor.state(), DeploymentState::Stopping);
}

#[test]
fn given_remote_machine_without_server_when_started_then_deployment_stays_created() {
    let fleet = Fleet::new();
    let mut supervisor = fleet
        .supervisor("arm_deployment", &["arm"])
        .with_arguments(DeploymentArguments::default().on("robot-arm"));

    let result = supervisor.start();

    assert!(matches!(
        result,
        Err(DeploymentError::UnknownProcessServer { ref host }) if host == "robot-arm"
    ));
    assert_eq!(supervisor.state(), DeploymentState::Created);
    assert_eq!(supervisor.machine(), "robot-arm");
}
