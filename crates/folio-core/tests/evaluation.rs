//! Integration tests for the evaluation service.
//!
//! Every test runs against an in-process execution context so no worker
//! binary is needed.

use std::sync::Arc;
use std::time::Duration;

use folio_core::eval::remote_context_factory;
use folio_core::resolve::MemoryPackageSource;
use folio_core::{
    CellId, CellStatus, CompletionKind, DependencyResolver, Error, EvaluationEvent,
    EvaluationService, EvaluationStatus, OutputStream, Position, SessionState, WorkbookConfig,
};

// =============================================================================
// Test Helpers
// =============================================================================

fn config() -> WorkbookConfig {
    WorkbookConfig {
        abort_grace: Duration::from_millis(500),
        ..WorkbookConfig::default()
    }
    .in_process()
}

fn packages() -> Arc<MemoryPackageSource> {
    let source = MemoryPackageSource::new();
    source
        .add_toml("name = \"mathx\"\nversion = \"1.2.0\"\n[exports]\npi = 3\nunit = \"radian\"\n")
        .unwrap();
    Arc::new(source)
}

fn service_with(source: Arc<MemoryPackageSource>) -> Arc<EvaluationService> {
    EvaluationService::new(DependencyResolver::new(source), remote_context_factory(config()))
}

fn service() -> Arc<EvaluationService> {
    service_with(packages())
}

fn add(service: &EvaluationService, buffer: &str) -> CellId {
    service.insert_cell(buffer, None, false).unwrap()
}

async fn run(service: &Arc<EvaluationService>, target: CellId, all: bool) -> Vec<EvaluationEvent> {
    let (events, _) = service.evaluate(target, all).unwrap().collect().await;
    events
}

fn status_of(events: &[EvaluationEvent], cell: CellId) -> Option<EvaluationStatus> {
    events.iter().find_map(|event| match event {
        EvaluationEvent::Finished {
            cell: c, status, ..
        } if *c == cell => Some(*status),
        _ => None,
    })
}

fn results(events: &[EvaluationEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            EvaluationEvent::Result { value, .. } => Some(value.text.clone()),
            _ => None,
        })
        .collect()
}

/// Each cell's events are contiguous, open with `started` and close with
/// exactly one `finished`.
fn assert_well_formed(events: &[EvaluationEvent]) {
    let mut open: Option<CellId> = None;
    for event in events {
        match (open, event) {
            (None, EvaluationEvent::Started { cell }) => open = Some(*cell),
            (Some(cell), EvaluationEvent::Finished { cell: c, .. }) if cell == *c => open = None,
            (Some(cell), other) if other.cell() == cell && !matches!(other, EvaluationEvent::Started { .. }) => {}
            (state, other) => panic!("unexpected {:?} while {:?} open", other, state),
        }
    }
    assert!(open.is_none(), "run ended with an open cell");
}

// =============================================================================
// Ordering and state
// =============================================================================

#[tokio::test]
async fn test_cells_share_state_in_link_order() {
    let service = service();
    let a = add(&service, "var x = 20");
    let b = add(&service, "print(\"x is\", x)\nx + 22");

    let events = run(&service, b, true).await;
    assert_well_formed(&events);
    assert_eq!(status_of(&events, a), Some(EvaluationStatus::Success));
    assert_eq!(status_of(&events, b), Some(EvaluationStatus::Success));
    assert_eq!(results(&events), vec!["42"]);
    assert!(events.iter().any(|event| matches!(
        event,
        EvaluationEvent::CapturedOutput { stream: OutputStream::Stdout, text, .. } if text == "x is 20\n"
    )));

    let globals = service.globals().await.unwrap();
    assert_eq!(globals.len(), 1);
    assert_eq!(globals[0].name, "x");
    assert_eq!(globals[0].value.text, "20");
}

#[tokio::test]
async fn test_insert_before_reorders_evaluation() {
    let service = service();
    let b = add(&service, "x * 2");
    let a = service.insert_cell("var x = 5", Some(b), true).unwrap();

    let events = run(&service, b, true).await;
    let started: Vec<CellId> = events
        .iter()
        .filter_map(|event| match event {
            EvaluationEvent::Started { cell } => Some(*cell),
            _ => None,
        })
        .collect();
    assert_eq!(started, vec![a, b]);
    assert_eq!(results(&events), vec!["10"]);
}

#[tokio::test]
async fn test_edit_marks_later_cells_stale() {
    let service = service();
    let a = add(&service, "var x = 1");
    let b = add(&service, "x + 1");
    run(&service, b, true).await;
    assert!(service.cell(b).unwrap().status.is_success());

    service.update_cell(a, "var x = 10").unwrap();
    assert_eq!(service.cell(a).unwrap().status, CellStatus::Stale);
    assert_eq!(service.cell(b).unwrap().status, CellStatus::Stale);

    let err = service.evaluate(b, false).unwrap_err();
    assert!(matches!(
        err,
        Error::PrerequisiteNotEvaluated { cell, prerequisite } if cell == b && prerequisite == a
    ));

    let events = run(&service, b, true).await;
    assert_eq!(results(&events), vec!["11"]);
    assert!(service.cells().iter().all(|cell| cell.status.is_success()));
}

#[tokio::test]
async fn test_delete_marks_later_cells_stale() {
    let service = service();
    let a = add(&service, "var x = 1");
    let b = add(&service, "var y = 2");
    let c = add(&service, "y");
    run(&service, c, true).await;

    service.delete_cell(b).unwrap();
    assert!(service.cell(a).unwrap().status.is_success());
    assert_eq!(service.cell(c).unwrap().status, CellStatus::Stale);
    assert!(matches!(service.cell(b), Err(Error::NotFound(_))));
}

#[tokio::test]
async fn test_evaluate_all_skips_fresh_cells() {
    let service = service();
    let a = add(&service, "var x = 1");
    let b = add(&service, "var y = x + 1");
    run(&service, b, true).await;

    let c = add(&service, "y * 3");
    let events = run(&service, c, true).await;
    assert_eq!(status_of(&events, a), None);
    assert_eq!(status_of(&events, b), None);
    assert_eq!(results(&events), vec!["6"]);

    // Everything is fresh: nothing to do.
    let (events, summary) = service.evaluate(c, true).unwrap().collect().await;
    assert!(events.is_empty());
    assert!(summary.finished.is_empty());
    assert_eq!(service.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_single_cell_reevaluation_keeps_state() {
    let service = service();
    let a = add(&service, "var n = 0");
    let b = add(&service, "n = n + 1\nn");
    run(&service, b, true).await;

    let events = run(&service, b, false).await;
    assert_eq!(results(&events), vec!["2"]);
    assert_eq!(status_of(&events, a), None);
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test]
async fn test_compile_error_stops_the_run() {
    let service = service();
    let a = add(&service, "var x = (1 +");
    let b = add(&service, "print(\"never\")");

    let (events, summary) = service.evaluate(b, true).unwrap().collect().await;
    assert_well_formed(&events);
    assert_eq!(status_of(&events, a), Some(EvaluationStatus::Error));
    assert_eq!(status_of(&events, b), None);
    assert!(!summary.all_succeeded());

    let cell = service.cell(a).unwrap();
    assert_eq!(cell.status, CellStatus::Evaluated(folio_core::CellOutcome::Error));
    assert!(!cell.diagnostics.is_empty());
    assert_eq!(service.cell(b).unwrap().status, CellStatus::Unevaluated);
}

#[tokio::test]
async fn test_runtime_fault_reports_line() {
    let service = service();
    let a = add(&service, "var x = 1\nx / 0");

    let events = run(&service, a, false).await;
    let fault = events.iter().find_map(|event| match event {
        EvaluationEvent::Finished { fault, .. } => fault.clone(),
        _ => None,
    });
    let fault = fault.expect("finished carries the fault");
    assert_eq!(fault.kind, folio_core::FaultKind::DivideByZero);
    assert_eq!(fault.line, Some(2));
}

#[tokio::test]
async fn test_input_errors_change_nothing() {
    let service = service();
    let a = add(&service, "1");
    service.delete_cell(a).unwrap();

    assert!(matches!(service.evaluate(a, false), Err(Error::NotFound(_))));
    assert!(matches!(service.update_cell(a, "2"), Err(Error::NotFound(_))));
    assert!(service.cells().is_empty());
    assert_eq!(service.context_id(), None);
}

#[tokio::test]
async fn test_unresolvable_reference_fails_cell() {
    let service = service();
    let a = add(&service, "#r \"nosuch\"\n1");

    let events = run(&service, a, false).await;
    assert_eq!(status_of(&events, a), Some(EvaluationStatus::Error));
    assert!(results(&events).is_empty());
}

// =============================================================================
// Packages
// =============================================================================

#[tokio::test]
async fn test_package_exports_are_visible() {
    let service = service();
    let a = add(&service, "#r \"mathx@^1.0\"\nmathx.pi * 2");
    let b = add(&service, "mathx.unit");

    let events = run(&service, b, true).await;
    assert_eq!(status_of(&events, a), Some(EvaluationStatus::Success));
    assert_eq!(results(&events), vec!["6", "\"radian\""]);
    assert_eq!(service.resolver().resolved_count(), 1);
}

#[tokio::test]
async fn test_concurrent_resolution_is_coalesced() {
    let source = MemoryPackageSource::new().with_delay(Duration::from_millis(200));
    source
        .add_toml("name = \"mathx\"\nversion = \"1.0.0\"\n[exports]\npi = 3\n")
        .unwrap();
    let source = Arc::new(source);
    let resolver = DependencyResolver::new(source.clone());

    let first = EvaluationService::new(resolver.clone(), remote_context_factory(config()));
    let second = EvaluationService::new(resolver, remote_context_factory(config()));
    let a = add(&first, "#r \"mathx\"\nmathx.pi");
    let b = add(&second, "#r \"mathx\"\nmathx.pi + 1");

    let (one, two) = tokio::join!(run(&first, a, false), run(&second, b, false));
    assert_eq!(results(&one), vec!["3"]);
    assert_eq!(results(&two), vec!["4"]);
    assert_eq!(source.calls(), 1);
}

// =============================================================================
// Abort and context loss
// =============================================================================

#[tokio::test]
async fn test_abort_ends_the_run() {
    let service = service();
    let a = add(&service, "while true {\n  print(\"tick\")\n  sleep(5)\n}");
    let b = add(&service, "print(\"after\")");

    let mut stream = service.evaluate(b, true).unwrap();
    assert!(service.evaluate(b, true).is_err_and(|e| matches!(e, Error::AlreadyEvaluating)));

    loop {
        match stream.next_event().await {
            Some(EvaluationEvent::CapturedOutput { .. }) => break,
            Some(_) => {}
            None => panic!("run ended before producing output"),
        }
    }
    assert!(service.abort());

    let (rest, summary) = stream.collect().await;
    let last = rest.last().expect("finished follows the abort");
    assert!(matches!(
        last,
        EvaluationEvent::Finished { cell, status: EvaluationStatus::Aborted, diagnostics, .. }
            if *cell == a && diagnostics.is_empty()
    ));
    assert!(summary.aborted);
    assert_eq!(status_of(&rest, b), None);

    assert_eq!(service.state(), SessionState::Idle);
    assert_eq!(service.cell(a).unwrap().status, CellStatus::Aborted);
    assert!(!service.abort());

    // The context survived a cooperative abort.
    assert!(service.globals().await.is_ok());
    assert!(matches!(
        service.evaluate(b, false),
        Err(Error::PrerequisiteNotEvaluated { prerequisite, .. }) if prerequisite == a
    ));
}

#[tokio::test]
async fn test_abort_during_resolution() {
    let source = MemoryPackageSource::new().with_delay(Duration::from_millis(800));
    source
        .add_toml("name = \"mathx\"\nversion = \"1.2.0\"\n[exports]\npi = 3\n")
        .unwrap();
    let service = service_with(Arc::new(source));
    let a = add(&service, "#r \"mathx\"\nmathx.pi");

    let started = std::time::Instant::now();
    let mut stream = service.evaluate(a, true).unwrap();
    assert!(matches!(stream.next_event().await, Some(EvaluationEvent::Started { .. })));
    assert!(service.abort());

    let (rest, summary) = stream.collect().await;
    assert!(started.elapsed() < Duration::from_millis(800));
    assert!(summary.aborted);
    assert_eq!(rest.len(), 1);
    assert!(matches!(
        &rest[0],
        EvaluationEvent::Finished { cell, status: EvaluationStatus::Aborted, diagnostics, .. }
            if *cell == a && diagnostics.is_empty()
    ));
    assert_eq!(service.cell(a).unwrap().status, CellStatus::Aborted);
    assert_eq!(service.state(), SessionState::Idle);
}

/// An abort that lands while the cell is compiling leaves it unevaluated.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_abort_during_compilation() {
    let service = service();
    let mut buffer = String::from("var x = 0\n");
    buffer.push_str(&"x = x + 1\n".repeat(300_000));
    let a = add(&service, &buffer);

    let mut stream = service.evaluate(a, true).unwrap();
    assert!(matches!(stream.next_event().await, Some(EvaluationEvent::Started { .. })));
    assert!(service.abort());

    let (rest, summary) = stream.collect().await;
    assert!(summary.aborted);
    assert_eq!(rest.len(), 1);
    assert!(matches!(
        &rest[0],
        EvaluationEvent::Finished { cell, status: EvaluationStatus::Aborted, diagnostics, .. }
            if *cell == a && diagnostics.is_empty()
    ));
    assert_eq!(service.cell(a).unwrap().status, CellStatus::Unevaluated);

    // Nothing reached the context.
    assert!(service.globals().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_context_loss_and_reset() {
    let service = service();
    let a = add(&service, "var x = 1");
    let b = add(&service, "exit(1)");

    let (events, summary) = service.evaluate(b, true).unwrap().collect().await;
    assert_eq!(status_of(&events, a), Some(EvaluationStatus::Success));
    assert_eq!(status_of(&events, b), Some(EvaluationStatus::Error));
    assert!(summary.context_lost);

    for cell in service.cells() {
        assert_eq!(cell.status, CellStatus::Unevaluated);
    }
    assert!(matches!(service.evaluate(a, false), Err(Error::ContextLost(_))));
    assert!(matches!(service.globals().await, Err(Error::ContextLost(_))));

    let context = service.reset_context().await.unwrap();
    assert_eq!(service.context_id(), Some(context));
    service.update_cell(b, "x + 1").unwrap();

    let events = run(&service, b, true).await;
    assert_eq!(results(&events), vec!["2"]);
}

#[tokio::test]
async fn test_reset_context_clears_state() {
    let service = service();
    let a = add(&service, "var x = 7");
    run(&service, a, false).await;
    let before = service.context_id().unwrap();

    let after = service.reset_context().await.unwrap();
    assert_ne!(before, after);
    assert!(service.globals().await.unwrap().is_empty());
    assert_eq!(service.cell(a).unwrap().status, CellStatus::Unevaluated);
}

// =============================================================================
// Editing assistance
// =============================================================================

#[tokio::test]
async fn test_start_new_cell_hint_on_last_target() {
    let service = service();
    let a = add(&service, "var x = 1");
    let b = add(&service, "x + 1");

    let hints = |events: &[EvaluationEvent]| -> Vec<(CellId, bool)> {
        events
            .iter()
            .filter_map(|event| match event {
                EvaluationEvent::Finished {
                    cell,
                    start_new_cell,
                    ..
                } => Some((*cell, *start_new_cell)),
                _ => None,
            })
            .collect()
    };

    let events = run(&service, a, true).await;
    assert_eq!(hints(&events), vec![(a, false)]);

    let events = run(&service, b, true).await;
    assert_eq!(hints(&events), vec![(b, true)]);

    service.update_cell(b, "fail(\"no\")").unwrap();
    let events = run(&service, b, true).await;
    assert_eq!(hints(&events), vec![(b, false)]);
}

#[tokio::test]
async fn test_completions_and_hover_see_resolved_packages() {
    let service = service();
    let a = add(&service, "#r \"mathx\"\nvar radius = 2");
    let b = add(&service, "mathx.");

    // Before the package is resolved only its name is known.
    assert!(service.completions(b, Position::new(1, 7)).unwrap().is_empty());

    run(&service, a, true).await;

    let members: Vec<String> = service
        .completions(b, Position::new(1, 7))
        .unwrap()
        .into_iter()
        .map(|item| item.label)
        .collect();
    assert_eq!(members, vec!["pi", "unit"]);

    service.update_cell(b, "print(radius * mathx.pi, ").unwrap();
    let items = service.completions(b, Position::new(1, 8)).unwrap();
    assert!(items.iter().any(|item| item.label == "radius" && item.kind == CompletionKind::Variable));

    let hover = service.hover(b, Position::new(1, 22)).unwrap().unwrap();
    assert_eq!(hover.contents, "(constant) mathx.pi: int = 3");
    let hover = service.hover(a, Position::new(1, 4)).unwrap().unwrap();
    assert_eq!(hover.contents, "(package) mathx@1.2.0 as `mathx`");

    let help = service.signature_help(b, Position::new(1, 26)).unwrap().unwrap();
    assert_eq!(help.label, "print(values...)");
    assert_eq!(help.active_parameter, 0);

    assert!(service.completions(CellId::new(service.session(), 999), Position::new(1, 1)).is_err());
}
