//! End-to-end tests for the onflow-workflow engine.

use async_trait::async_trait;
use chrono::NaiveDate;
use onflow_core::{
    Actor, CoreError, CoreResult, EmployeeId, EngineConfig, Event, EventPublisher, FixedClock,
    InMemoryEventPublisher, UserId,
};
use onflow_workflow::{
    ExceptionType, InMemoryTemplateStore, InMemoryWorkflowRepository, InstanceFilter,
    InstanceRecord, InstanceStatus, InstantiationRequest, IntegrationStatus, RetryOutcome,
    Severity, SkipPolicy, StepDefinition, StepStatus, StepType, TemplateLibrary, TemplateStore,
    WorkflowEngine, WorkflowError, WorkflowException, WorkflowRepository, WorkflowTemplate,
    WorkflowType,
};
use std::sync::Arc;

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

struct TestEnv {
    engine: Arc<WorkflowEngine>,
    repository: Arc<InMemoryWorkflowRepository>,
    templates: Arc<InMemoryTemplateStore>,
    events: Arc<InMemoryEventPublisher>,
    clock: Arc<FixedClock>,
}

fn env_with(config: EngineConfig) -> TestEnv {
    let repository = Arc::new(InMemoryWorkflowRepository::new());
    let templates = Arc::new(InMemoryTemplateStore::new());
    let events = Arc::new(InMemoryEventPublisher::new());
    let clock = Arc::new(FixedClock::at_date(date(2024, 1, 1)));
    let engine = Arc::new(WorkflowEngine::new(
        repository.clone(),
        templates.clone(),
        events.clone(),
        clock.clone(),
        config,
    ));
    TestEnv {
        engine,
        repository,
        templates,
        events,
        clock,
    }
}

fn env() -> TestEnv {
    env_with(EngineConfig::default())
}

/// Three required steps and one optional orientation, no ordering constraints
fn basic_onboarding() -> WorkflowTemplate {
    WorkflowTemplate::new("Onboarding", WorkflowType::Onboarding)
        .add_step(StepDefinition::new(0, "Orientation", StepType::Meeting).optional())
        .add_step(StepDefinition::new(1, "Document Submission", StepType::Document).due_in_days(1))
        .add_step(
            StepDefinition::new(2, "Background Check", StepType::BackgroundCheck)
                .auto_trigger()
                .due_in_days(7),
        )
        .add_step(StepDefinition::new(3, "System Access", StepType::SystemAccess).due_in_days(1))
        .activate()
}

fn request_for(employee: EmployeeId) -> InstantiationRequest {
    InstantiationRequest::new(employee, date(2024, 1, 1))
}

fn hr() -> Actor {
    Actor::user(UserId::new())
}

fn step_id(record: &InstanceRecord, name: &str) -> onflow_workflow::StepInstanceId {
    record
        .steps
        .iter()
        .find(|s| s.step_name == name)
        .map(|s| s.id)
        .unwrap()
}

#[tokio::test]
async fn test_due_dates_and_completion_in_any_order() {
    let env = env();
    let record = env
        .engine
        .instantiate(&basic_onboarding(), request_for(EmployeeId::new()))
        .await
        .unwrap();

    let due: Vec<(String, NaiveDate)> = record
        .steps
        .iter()
        .map(|s| (s.step_name.clone(), s.due_date))
        .collect();
    assert_eq!(
        due,
        vec![
            ("Orientation".to_string(), date(2024, 1, 1)),
            ("Document Submission".to_string(), date(2024, 1, 2)),
            ("Background Check".to_string(), date(2024, 1, 8)),
            ("System Access".to_string(), date(2024, 1, 2)),
        ]
    );
    assert_eq!(record.instance.expected_completion_date, date(2024, 1, 8));

    for name in ["System Access", "Background Check", "Document Submission"] {
        env.engine
            .complete_step(step_id(&record, name), &hr(), None)
            .await
            .unwrap();
    }

    let done = env.engine.get_instance(record.instance.id).await.unwrap();
    assert_eq!(done.instance.overall_progress, 100);
    assert_eq!(done.instance.status, InstanceStatus::Completed);
    assert_eq!(done.instance.actual_completion_date, Some(date(2024, 1, 1)));
    assert_eq!(
        done.steps
            .iter()
            .find(|s| s.step_name == "Orientation")
            .unwrap()
            .status,
        StepStatus::NotStarted
    );
    assert_eq!(env.events.events_matching("workflow.completed").len(), 1);
}

#[tokio::test]
async fn test_integration_exhaustion_raises_single_exception() {
    let env = env();
    let record = env
        .engine
        .instantiate(&basic_onboarding(), request_for(EmployeeId::new()))
        .await
        .unwrap();
    let integration = record.integrations[0].clone();
    assert_eq!(integration.integration_type, "background_check");
    assert_eq!(integration.max_retries, 3);

    let mut outcomes = Vec::new();
    for _ in 0..3 {
        outcomes.push(
            env.engine
                .record_integration_result(
                    integration.id,
                    false,
                    None,
                    Some("provider timeout".to_string()),
                )
                .await
                .unwrap(),
        );
    }
    assert_eq!(
        outcomes,
        vec![
            RetryOutcome::RetryAllowed { remaining: 2 },
            RetryOutcome::RetryAllowed { remaining: 1 },
            RetryOutcome::Exhausted,
        ]
    );

    let fourth = env
        .engine
        .record_integration_result(integration.id, false, None, None)
        .await;
    assert!(matches!(fourth, Err(WorkflowError::IntegrationExhausted(id)) if id == integration.id));

    let integrations = env.engine.list_integrations(record.instance.id).await.unwrap();
    assert_eq!(integrations[0].status, IntegrationStatus::Failed);
    assert_eq!(integrations[0].retry_count, 3);
    assert_eq!(integrations[0].attempts.len(), 3);

    let exceptions = env
        .engine
        .list_exceptions(record.instance.id, true)
        .await
        .unwrap();
    assert_eq!(exceptions.len(), 1);
    assert_eq!(exceptions[0].exception_type, ExceptionType::IntegrationFailed);
    assert_eq!(exceptions[0].severity, Severity::High);
    assert_eq!(exceptions[0].integration_id, Some(integration.id));

    assert_eq!(env.events.events_matching("integration.failed").len(), 2);
    assert_eq!(env.events.events_matching("integration.exhausted").len(), 1);
    assert_eq!(env.events.events_matching("exception.raised").len(), 1);
}

async fn exhaust(env: &TestEnv, integration_id: onflow_workflow::IntegrationId) {
    loop {
        let outcome = env
            .engine
            .record_integration_result(integration_id, false, None, Some("provider down".to_string()))
            .await
            .unwrap();
        if outcome == RetryOutcome::Exhausted {
            return;
        }
    }
}

fn high_failures_for(record: &InstanceRecord, step: onflow_workflow::StepInstanceId) -> usize {
    record
        .exceptions
        .iter()
        .filter(|e| {
            e.step_id == Some(step)
                && e.exception_type == ExceptionType::IntegrationFailed
                && e.severity == Severity::High
        })
        .count()
}

#[tokio::test]
async fn test_exhausted_integration_cannot_be_requested_again() {
    let env = env();
    let record = env
        .engine
        .instantiate(&basic_onboarding(), request_for(EmployeeId::new()))
        .await
        .unwrap();
    let background = step_id(&record, "Background Check");
    let integration = record.integrations[0].clone();
    exhaust(&env, integration.id).await;

    for _ in 0..2 {
        let again = env
            .engine
            .trigger_integration(record.instance.id, Some(background), "background_check", None)
            .await;
        assert!(matches!(again, Err(WorkflowError::IntegrationExhausted(id)) if id == integration.id));
    }

    let after = env.engine.get_instance(record.instance.id).await.unwrap();
    let for_step: Vec<_> = after
        .integrations
        .iter()
        .filter(|i| i.step_id == Some(background))
        .collect();
    assert_eq!(for_step.len(), 1);
    assert_eq!(for_step[0].attempts.len(), 3);
    assert_eq!(high_failures_for(&after, background), 1);
    assert_eq!(env.events.events_matching("integration.requested").len(), 1);
}

#[tokio::test]
async fn test_second_provider_exhaustion_keeps_one_step_exception() {
    let env = env();
    let record = env
        .engine
        .instantiate(&basic_onboarding(), request_for(EmployeeId::new()))
        .await
        .unwrap();
    let background = step_id(&record, "Background Check");
    exhaust(&env, record.integrations[0].id).await;

    let fallback = env
        .engine
        .trigger_integration(
            record.instance.id,
            Some(background),
            "background_check_fallback",
            Some(serde_json::json!({"provider": "secondary"})),
        )
        .await
        .unwrap();
    assert_eq!(fallback.retry_count, 0);
    exhaust(&env, fallback.id).await;

    let after = env.engine.get_instance(record.instance.id).await.unwrap();
    assert_eq!(high_failures_for(&after, background), 1);
    assert_eq!(env.events.events_matching("integration.exhausted").len(), 2);
    assert_eq!(env.events.events_matching("exception.raised").len(), 1);
}

#[tokio::test]
async fn test_instance_level_integration_without_step() {
    let env = env();
    let record = env
        .engine
        .instantiate(&basic_onboarding(), request_for(EmployeeId::new()))
        .await
        .unwrap();
    let instance_id = record.instance.id;

    let welcome = env
        .engine
        .trigger_integration(
            instance_id,
            None,
            "welcome_email",
            Some(serde_json::json!({"template": "day_one"})),
        )
        .await
        .unwrap();
    assert_eq!(welcome.step_id, None);
    assert_eq!(welcome.status, IntegrationStatus::Pending);
    assert_eq!(welcome.max_retries, 3);

    let same = env
        .engine
        .trigger_integration(instance_id, None, "welcome_email", None)
        .await
        .unwrap();
    assert_eq!(same.id, welcome.id);

    let outcome = env
        .engine
        .record_integration_result(welcome.id, true, Some(serde_json::json!({"sent": true})), None)
        .await
        .unwrap();
    assert_eq!(outcome, RetryOutcome::Succeeded);

    let resend = env
        .engine
        .trigger_integration(instance_id, None, "welcome_email", None)
        .await
        .unwrap_err();
    assert!(resend.is_idempotent_noop());

    let payroll = env
        .engine
        .trigger_integration(instance_id, None, "payroll_enrollment", None)
        .await
        .unwrap();
    exhaust(&env, payroll.id).await;

    let after = env.engine.get_instance(instance_id).await.unwrap();
    assert_eq!(after.instance.status, InstanceStatus::Active);
    assert!(after.steps.iter().all(|s| s.status == StepStatus::NotStarted));
    let raised: Vec<_> = after
        .exceptions
        .iter()
        .filter(|e| e.integration_id == Some(payroll.id))
        .collect();
    assert_eq!(raised.len(), 1);
    assert_eq!(raised[0].step_id, None);
    assert_eq!(raised[0].severity, Severity::High);
}

#[tokio::test]
async fn test_retry_cap_is_configurable_per_integration_type() {
    let env = env_with(EngineConfig::default().with_integration_max_retries("background_check", 5));
    let record = env
        .engine
        .instantiate(&basic_onboarding(), request_for(EmployeeId::new()))
        .await
        .unwrap();
    assert_eq!(record.integrations[0].max_retries, 5);
}

#[tokio::test]
async fn test_integration_success_completes_auto_step() {
    let env = env();
    let record = env
        .engine
        .instantiate(
            &TemplateLibrary::standard_onboarding(),
            request_for(EmployeeId::new()),
        )
        .await
        .unwrap();
    let background = step_id(&record, "Background Check");
    let integration = record
        .integrations
        .iter()
        .find(|i| i.step_id == Some(background))
        .unwrap()
        .clone();

    env.engine
        .mark_integration_in_progress(integration.id, Some("chk_123".to_string()))
        .await
        .unwrap();
    env.engine
        .record_integration_result(integration.id, false, None, Some("503".to_string()))
        .await
        .unwrap();
    let retried = env.engine.retrigger_integration(integration.id).await.unwrap();
    assert_eq!(retried.status, IntegrationStatus::Pending);
    assert_eq!(retried.external_id.as_deref(), Some("chk_123"));

    let outcome = env
        .engine
        .record_integration_result(
            integration.id,
            true,
            Some(serde_json::json!({"result": "clear"})),
            None,
        )
        .await
        .unwrap();
    assert_eq!(outcome, RetryOutcome::Succeeded);

    // Duplicate callbacks are harmless
    let again = env
        .engine
        .record_integration_result(integration.id, true, None, None)
        .await
        .unwrap();
    assert_eq!(again, RetryOutcome::Unchanged);

    let after = env.engine.get_instance(record.instance.id).await.unwrap();
    let step = after.steps.iter().find(|s| s.id == background).unwrap();
    assert_eq!(step.status, StepStatus::Completed);
    assert_eq!(step.completed_by, Some(Actor::system("onflow-engine")));
    assert!(after.exceptions.is_empty());
}

#[tokio::test]
async fn test_progress_never_decreases_without_reopen() {
    let env = env();
    let record = env
        .engine
        .instantiate(
            &TemplateLibrary::standard_onboarding(),
            request_for(EmployeeId::new()),
        )
        .await
        .unwrap();

    let order = [
        "Submit Employment Documents",
        "Equipment Setup",
        "Background Check",
        "System Access",
        "Welcome Orientation",
        "Security Training",
    ];

    let mut last = 0;
    for name in order {
        env.engine
            .complete_step(step_id(&record, name), &hr(), None)
            .await
            .unwrap();
        let progress = env
            .engine
            .get_instance(record.instance.id)
            .await
            .unwrap()
            .instance
            .overall_progress;
        assert!(progress >= last, "{} dropped progress to {}", name, progress);
        last = progress;
    }
    assert_eq!(last, 100);
}

#[tokio::test]
async fn test_dependency_blocks_completion() {
    let env = env();
    let record = env
        .engine
        .instantiate(
            &TemplateLibrary::standard_onboarding(),
            request_for(EmployeeId::new()),
        )
        .await
        .unwrap();

    let training = step_id(&record, "Security Training");
    let access = step_id(&record, "System Access");

    let err = env
        .engine
        .start_step(training, &hr())
        .await
        .unwrap_err();
    match err {
        WorkflowError::DependencyNotSatisfied { step_id, pending } => {
            assert_eq!(step_id, training);
            assert_eq!(pending, vec![access]);
        }
        other => panic!("unexpected error: {other}"),
    }

    let unchanged = env.engine.get_instance(record.instance.id).await.unwrap();
    assert_eq!(unchanged.instance.version, record.instance.version);
}

#[tokio::test]
async fn test_explicit_start_required_when_configured() {
    let env = env_with(EngineConfig::default().with_explicit_start(true));
    let record = env
        .engine
        .instantiate(&basic_onboarding(), request_for(EmployeeId::new()))
        .await
        .unwrap();
    let docs = step_id(&record, "Document Submission");

    assert!(matches!(
        env.engine.complete_step(docs, &hr(), None).await,
        Err(WorkflowError::InvalidTransition(_))
    ));

    env.engine.start_step(docs, &hr()).await.unwrap();
    let done = env.engine.complete_step(docs, &hr(), None).await.unwrap();
    assert_eq!(done.status, StepStatus::Completed);
}

#[tokio::test]
async fn test_one_open_instance_per_employee_and_type() {
    let env = env();
    let employee = EmployeeId::new();
    let first = env
        .engine
        .instantiate(&basic_onboarding(), request_for(employee))
        .await
        .unwrap();

    let second = env
        .engine
        .instantiate(&basic_onboarding(), request_for(employee))
        .await;
    assert!(matches!(
        second,
        Err(WorkflowError::ActiveInstanceExists { instance_id, .. }) if instance_id == first.instance.id
    ));

    // A different workflow type is unaffected
    env.engine
        .instantiate(&TemplateLibrary::standard_offboarding(), request_for(employee))
        .await
        .unwrap();

    for name in ["Document Submission", "Background Check", "System Access"] {
        env.engine
            .complete_step(step_id(&first, name), &hr(), None)
            .await
            .unwrap();
    }
    env.engine
        .instantiate(&basic_onboarding(), request_for(employee))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_concurrent_instances_allowed_by_config() {
    let env = env_with(EngineConfig::default().with_concurrent_instances(true));
    let employee = EmployeeId::new();
    for _ in 0..2 {
        env.engine
            .instantiate(&basic_onboarding(), request_for(employee))
            .await
            .unwrap();
    }
    let open = env
        .engine
        .list_instances(&InstanceFilter::new().employee(employee).open_only())
        .await
        .unwrap();
    assert_eq!(open.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_instantiation_yields_one_open_instance() {
    let env = env();
    let employee = EmployeeId::new();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = env.engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .instantiate(&basic_onboarding(), request_for(employee))
                .await
        }));
    }

    let mut created = 0;
    let mut refused = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => created += 1,
            Err(WorkflowError::ActiveInstanceExists { .. }) => refused += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!((created, refused), (1, 7));
    assert_eq!(env.repository.len(), 1);
}

#[tokio::test]
async fn test_stale_write_is_rejected() {
    let env = env();
    let record = env
        .engine
        .instantiate(&basic_onboarding(), request_for(EmployeeId::new()))
        .await
        .unwrap();
    let stale = env.repository.load(record.instance.id).await.unwrap().unwrap();

    env.engine
        .complete_step(step_id(&record, "System Access"), &hr(), None)
        .await
        .unwrap();

    let err = env
        .repository
        .save(&stale, stale.instance.version)
        .await
        .unwrap_err();
    assert!(err.is_retryable());

    let current = env.engine.get_instance(record.instance.id).await.unwrap();
    assert_eq!(current.instance.version, 1);
    assert!(current.instance.overall_progress > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_completions_converge() {
    let env = env();
    let record = env
        .engine
        .instantiate(&basic_onboarding(), request_for(EmployeeId::new()))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for name in ["Document Submission", "Background Check", "System Access"] {
        let engine = env.engine.clone();
        let id = step_id(&record, name);
        handles.push(tokio::spawn(async move {
            loop {
                match engine.complete_step(id, &hr(), None).await {
                    Ok(step) => return step,
                    Err(e) if e.is_retryable() => tokio::task::yield_now().await,
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let done = env.engine.get_instance(record.instance.id).await.unwrap();
    assert_eq!(done.instance.status, InstanceStatus::Completed);
    assert_eq!(done.instance.version, 3);
}

#[tokio::test]
async fn test_exception_lifecycle() {
    let env = env();
    let record = env
        .engine
        .instantiate(&basic_onboarding(), request_for(EmployeeId::new()))
        .await
        .unwrap();
    let docs = step_id(&record, "Document Submission");

    let raised = env
        .engine
        .raise_exception(WorkflowException::new(
            record.instance.id,
            Some(docs),
            ExceptionType::DocumentIssue,
            Severity::Medium,
            "W-4 missing",
            "Employee uploaded an empty file",
            hr(),
            chrono::Utc::now(),
        ))
        .await
        .unwrap();

    let resolver = hr();
    let resolved = env
        .engine
        .resolve_exception(raised.id, &resolver, "Re-uploaded")
        .await
        .unwrap();
    assert_eq!(resolved.resolved_by, Some(resolver.clone()));

    let again = env
        .engine
        .resolve_exception(raised.id, &resolver, "Re-uploaded")
        .await;
    assert!(matches!(again, Err(WorkflowError::AlreadyResolved(_))));
    assert!(again.unwrap_err().is_idempotent_noop());

    assert!(env
        .engine
        .list_exceptions(record.instance.id, true)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        env.engine
            .list_exceptions(record.instance.id, false)
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn test_instantiate_from_store_and_statistics() {
    let env = env();
    let template = basic_onboarding();
    env.templates.create(&template).await.unwrap();

    let a = env
        .engine
        .instantiate_from_store(template.id, request_for(EmployeeId::new()))
        .await
        .unwrap();
    env.engine
        .instantiate_from_store(template.id, request_for(EmployeeId::new()))
        .await
        .unwrap();

    for name in ["Document Submission", "Background Check", "System Access"] {
        env.engine
            .complete_step(step_id(&a, name), &hr(), None)
            .await
            .unwrap();
    }

    env.clock.advance(chrono::Duration::days(10));

    let stats = env.engine.statistics(&InstanceFilter::new()).await.unwrap();
    assert_eq!(stats.total_instances, 2);
    assert_eq!(stats.by_status.get(&InstanceStatus::Completed), Some(&1));
    assert_eq!(stats.average_progress, 50.0);
    assert_eq!(stats.overdue_steps, 5);
    assert_eq!(stats.pending_integrations, 2);

    let missing = env
        .engine
        .instantiate_from_store(onflow_workflow::TemplateId::new(), request_for(EmployeeId::new()))
        .await;
    assert!(matches!(missing, Err(WorkflowError::NotFound(_))));
}

#[tokio::test]
async fn test_delete_cascades() {
    let env = env();
    let record = env
        .engine
        .instantiate(&basic_onboarding(), request_for(EmployeeId::new()))
        .await
        .unwrap();
    let docs = step_id(&record, "Document Submission");

    env.engine.delete_instance(record.instance.id).await.unwrap();

    assert!(matches!(
        env.engine.get_instance(record.instance.id).await,
        Err(WorkflowError::NotFound(_))
    ));
    assert!(matches!(
        env.engine.complete_step(docs, &hr(), None).await,
        Err(WorkflowError::NotFound(_))
    ));
    assert!(env.repository.is_empty());
}

struct FailingPublisher;

#[async_trait]
impl EventPublisher for FailingPublisher {
    async fn publish(&self, _event: Event) -> CoreResult<()> {
        Err(CoreError::Publish("broker unavailable".to_string()))
    }
}

#[tokio::test]
async fn test_publish_failures_do_not_fail_operations() {
    let engine = WorkflowEngine::new(
        Arc::new(InMemoryWorkflowRepository::new()),
        Arc::new(InMemoryTemplateStore::new()),
        Arc::new(FailingPublisher),
        Arc::new(FixedClock::at_date(date(2024, 1, 1))),
        EngineConfig::default(),
    );

    let record = engine
        .instantiate(&basic_onboarding(), request_for(EmployeeId::new()))
        .await
        .unwrap();
    let step = engine
        .skip_step(
            step_id(&record, "Orientation"),
            &hr(),
            "Remote hire",
            SkipPolicy::Standard,
        )
        .await
        .unwrap();
    assert_eq!(step.status, StepStatus::Skipped);
}
