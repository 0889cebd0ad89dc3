//! Evaluation orchestration.
//!
//! The service owns the cell store, the compiler chain, the session's
//! dependency resolver and its execution context, and runs at most one
//! evaluation at a time.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use futures::future::BoxFuture;
use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use super::events::{EvaluationEvent, EvaluationStatus, EventStream, RunSummary};
use crate::cells::{Cell, CellId, CellOutcome, CellStatus, CellStore, SessionId};
use crate::compile::{
    self, AssistScope, CompileOutcome, CompiledUnit, CompilerChain, CompletionItem,
    DependencyReference, Diagnostic, Hover, PackageSummary, Position, SignatureHelp, SourceSpan,
    SymbolDescriptor,
};
use crate::config::WorkbookConfig;
use crate::error::{Error, Result};
use crate::execute::{
    AbortHandle, ContextError, ExecutionContext, ExecutionEvent, ExecutionOutcome, Fault,
    GlobalVariable, PackageImage, RemoteContext,
};
use crate::resolve::{DependencyResolver, DirectoryPackageSource, ResolutionCache};

/// Creates a fresh execution context.
pub type ContextFactory = Arc<
    dyn Fn() -> BoxFuture<'static, std::result::Result<Box<dyn ExecutionContext>, ContextError>>
        + Send
        + Sync,
>;

/// Factory starting a [`RemoteContext`] as `config` describes.
pub fn remote_context_factory(config: WorkbookConfig) -> ContextFactory {
    Arc::new(move || {
        let config = config.clone();
        Box::pin(async move {
            let context = RemoteContext::start(&config).await?;
            Ok(Box::new(context) as Box<dyn ExecutionContext>)
        })
    })
}

/// Where the session's single evaluation run stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "cell", rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Evaluating(CellId),
    Aborting,
}

/// Answer to an edit: whether the buffer is ready to submit, and what the
/// compiler thinks of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateResult {
    pub is_complete: bool,
    pub diagnostics: Vec<Diagnostic>,
}

/// Point-in-time view of a cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellSnapshot {
    pub id: CellId,
    pub buffer: String,
    /// Effective status: a success recorded against earlier cells that have
    /// changed since is reported as `Stale`.
    pub status: CellStatus,
    pub diagnostics: Vec<Diagnostic>,
    pub revision: u64,
}

const CONTEXT_TERMINATED: &str = "the execution context terminated during evaluation of this cell";

struct Inner {
    store: CellStore,
    state: SessionState,
    abort: Option<AbortHandle>,
    next_stamp: u64,
    context_id: Option<Uuid>,
    /// Set when the context died; cleared by `reset_context`.
    context_lost: Option<String>,
}

pub struct EvaluationService {
    session: SessionId,
    inner: Mutex<Inner>,
    /// Never locked together with `inner`, so compiling does not block edits
    /// to other cells or `abort`.
    chain: Mutex<CompilerChain>,
    context: tokio::sync::Mutex<Option<Box<dyn ExecutionContext>>>,
    resolver: DependencyResolver,
    factory: ContextFactory,
}

/// How one cell's evaluation ended.
enum CellStep {
    Finished(EvaluationStatus),
    /// The context died; the run cannot continue.
    ContextLost(EvaluationStatus),
    /// The cell was deleted before it could start.
    Vanished,
}

impl EvaluationService {
    pub fn new(resolver: DependencyResolver, factory: ContextFactory) -> Arc<Self> {
        let session = SessionId::new();
        Arc::new(Self {
            session,
            inner: Mutex::new(Inner {
                store: CellStore::new(session),
                state: SessionState::Idle,
                abort: None,
                next_stamp: 1,
                context_id: None,
                context_lost: None,
            }),
            chain: Mutex::new(CompilerChain::new()),
            context: tokio::sync::Mutex::new(None),
            resolver,
            factory,
        })
    }

    /// Service searching `config.package_paths` and executing through
    /// [`RemoteContext`]s.
    pub fn from_config(config: &WorkbookConfig) -> Arc<Self> {
        let source = Arc::new(DirectoryPackageSource::new(config.package_paths.clone()));
        let mut resolver = DependencyResolver::new(source);
        if let Some(path) = &config.resolution_cache {
            resolver = resolver.with_cache(ResolutionCache::load(path));
        }
        Self::new(resolver, remote_context_factory(config.clone()))
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn resolver(&self) -> &DependencyResolver {
        &self.resolver
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_chain(&self) -> MutexGuard<'_, CompilerChain> {
        self.chain.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// Id of the live execution context, once one has been started.
    pub fn context_id(&self) -> Option<Uuid> {
        self.lock().context_id
    }

    /// Add a cell before or after `relative_to` (head or tail without one).
    pub fn insert_cell(
        &self,
        buffer: impl Into<String>,
        relative_to: Option<CellId>,
        before: bool,
    ) -> Result<CellId> {
        self.lock().store.insert(buffer, relative_to, before)
    }

    pub fn update_cell(&self, id: CellId, buffer: impl Into<String>) -> Result<UpdateResult> {
        let buffer = buffer.into();
        let scope = {
            let mut inner = self.lock();
            let scope = scope_before(&inner.store, id)?;
            inner.store.update_buffer(id, buffer.as_str())?;
            scope
        };
        let diagnostics = self.lock_chain().diagnose(&buffer, &scope);
        Ok(UpdateResult {
            is_complete: CompilerChain::is_complete(&buffer),
            diagnostics,
        })
    }

    pub fn delete_cell(&self, id: CellId) -> Result<()> {
        self.lock().store.delete(id).map(|_| ())
    }

    pub fn cell(&self, id: CellId) -> Result<CellSnapshot> {
        self.lock().store.get(id)?;
        self.cells()
            .into_iter()
            .find(|cell| cell.id == id)
            .ok_or(Error::NotFound(id))
    }

    /// Every cell in link order.
    pub fn cells(&self) -> Vec<CellSnapshot> {
        let inner = self.lock();
        let fresh = freshness(&inner.store);
        inner
            .store
            .iter()
            .zip(fresh)
            .map(|(cell, (_, fresh))| CellSnapshot {
                id: cell.id,
                buffer: cell.buffer.clone(),
                status: if cell.status.is_success() && !fresh {
                    CellStatus::Stale
                } else {
                    cell.status
                },
                diagnostics: cell.diagnostics.clone(),
                revision: cell.revision,
            })
            .collect()
    }

    /// Completion candidates at `position` in a cell.
    pub fn completions(&self, id: CellId, position: Position) -> Result<Vec<CompletionItem>> {
        let (buffer, symbols, packages) = self.assist_inputs(id)?;
        let scope = AssistScope {
            symbols: &symbols,
            packages: &packages,
        };
        Ok(compile::completions(&buffer, position, &scope))
    }

    pub fn hover(&self, id: CellId, position: Position) -> Result<Option<Hover>> {
        let (buffer, symbols, packages) = self.assist_inputs(id)?;
        let scope = AssistScope {
            symbols: &symbols,
            packages: &packages,
        };
        Ok(compile::hover(&buffer, position, &scope))
    }

    pub fn signature_help(&self, id: CellId, position: Position) -> Result<Option<SignatureHelp>> {
        let buffer = self.lock().store.get(id)?.buffer.clone();
        Ok(compile::signature_help(&buffer, position))
    }

    /// A cell's buffer, the symbols it can see, and every package already
    /// resolved for it or an earlier cell, by alias.
    fn assist_inputs(
        &self,
        id: CellId,
    ) -> Result<(String, Vec<SymbolDescriptor>, BTreeMap<String, PackageSummary>)> {
        let (buffer, symbols, mut references) = {
            let inner = self.lock();
            let buffer = inner.store.get(id)?.buffer.clone();
            let references: Vec<DependencyReference> = inner
                .store
                .predecessors(id)?
                .into_iter()
                .filter_map(|cell| cell.compiled.as_ref())
                .flat_map(|unit| unit.requested_dependencies.iter().cloned())
                .collect();
            (buffer, scope_before(&inner.store, id)?, references)
        };
        references.extend(compile::dependency_references(&buffer));

        let mut packages = BTreeMap::new();
        for reference in references {
            if let Some(resolved) = self.resolver.cached(&reference) {
                packages.insert(
                    reference.alias,
                    PackageSummary {
                        display: resolved.to_string(),
                        exports: resolved.exports.clone(),
                    },
                );
            }
        }
        Ok((buffer, symbols, packages))
    }

    /// Start evaluating `target`.
    ///
    /// With `evaluate_all`, every cell from the first one that is not up to
    /// date through `target` runs; otherwise only `target`, whose earlier
    /// cells must all be up to date. Input errors are reported here, before
    /// any state changes. Must be called within a Tokio runtime.
    pub fn evaluate(self: &Arc<Self>, target: CellId, evaluate_all: bool) -> Result<EventStream> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::InvalidArgument(format!("no async runtime: {}", e)))?;

        let (plan, abort, reset_first, target_is_last) = {
            let mut inner = self.lock();
            inner.store.get(target)?;
            if inner.state != SessionState::Idle {
                return Err(Error::AlreadyEvaluating);
            }
            if let Some(reason) = &inner.context_lost {
                return Err(Error::ContextLost(reason.clone()));
            }

            let plan = plan(&inner.store, target, evaluate_all)?;
            let abort = AbortHandle::new();
            if let Some(&first) = plan.first() {
                inner.state = SessionState::Evaluating(first);
                inner.abort = Some(abort.clone());
            }
            let reset_first = plan.first().copied() == inner.store.head();
            let target_is_last = inner.store.tail() == Some(target);
            (plan, abort, reset_first, target_is_last)
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (summary_tx, summary_rx) = oneshot::channel();
        if plan.is_empty() {
            let _ = summary_tx.send(RunSummary::default());
        } else {
            tracing::debug!("Evaluating {} cell(s) through {}", plan.len(), target);
            let service = Arc::clone(self);
            let hint_cell = target_is_last.then_some(target);
            runtime.spawn(async move {
                let summary = service
                    .run(plan, abort, reset_first, hint_cell, events_tx)
                    .await;
                let _ = summary_tx.send(summary);
            });
        }
        Ok(EventStream::new(events_rx, summary_rx))
    }

    /// Cancel the current run. Returns whether one was in flight.
    pub fn abort(&self) -> bool {
        let mut inner = self.lock();
        let Some(abort) = inner.abort.clone() else {
            return false;
        };
        if let SessionState::Evaluating(cell) = inner.state {
            tracing::info!("Abort requested while evaluating {}", cell);
            inner.state = SessionState::Aborting;
        }
        abort.abort();
        true
    }

    /// Replace the execution context with a fresh one. Every cell reverts to
    /// unevaluated. Returns the new context id.
    pub async fn reset_context(&self) -> Result<Uuid> {
        let mut slot = self
            .context
            .try_lock()
            .map_err(|_| Error::AlreadyEvaluating)?;
        if self.state() != SessionState::Idle {
            return Err(Error::AlreadyEvaluating);
        }

        if let Some(mut old) = slot.take() {
            old.shutdown().await;
        }
        {
            let mut inner = self.lock();
            inner.context_lost = None;
            inner.context_id = None;
            for cell in inner.store.cells_mut() {
                cell.clear_evaluation();
            }
        }

        let context = (self.factory)().await?;
        let id = context.id();
        *slot = Some(context);
        self.lock().context_id = Some(id);
        tracing::info!("Execution context reset; new context {}", id);
        Ok(id)
    }

    /// Live top-level variables of the current context.
    pub async fn globals(&self) -> Result<Vec<GlobalVariable>> {
        let mut slot = self
            .context
            .try_lock()
            .map_err(|_| Error::AlreadyEvaluating)?;
        if let Some(reason) = &self.lock().context_lost {
            return Err(Error::ContextLost(reason.clone()));
        }
        match slot.as_mut() {
            Some(context) => Ok(context.globals().await?),
            None => Ok(Vec::new()),
        }
    }

    /// Release the execution context.
    pub async fn shutdown(&self) {
        if let Some(mut context) = self.context.lock().await.take() {
            context.shutdown().await;
        }
        self.lock().context_id = None;
    }

    async fn run(
        self: Arc<Self>,
        plan: Vec<CellId>,
        abort: AbortHandle,
        reset_first: bool,
        hint_cell: Option<CellId>,
        tx: mpsc::UnboundedSender<EvaluationEvent>,
    ) -> RunSummary {
        let mut summary = RunSummary::default();
        let mut slot = self.context.lock().await;
        let mut reset_pending = reset_first;

        for id in plan {
            if abort.is_aborted() {
                summary.aborted = true;
                break;
            }

            let step = self
                .evaluate_cell(id, &mut slot, &abort, reset_pending, hint_cell == Some(id), &tx)
                .await;
            reset_pending = false;

            match step {
                CellStep::Finished(status) => {
                    summary.finished.push((id, status));
                    match status {
                        EvaluationStatus::Success => {}
                        EvaluationStatus::Aborted => {
                            summary.aborted = true;
                            break;
                        }
                        EvaluationStatus::Error => break,
                    }
                }
                CellStep::ContextLost(status) => {
                    summary.finished.push((id, status));
                    summary.aborted = status == EvaluationStatus::Aborted;
                    summary.context_lost = true;
                    break;
                }
                CellStep::Vanished => break,
            }
        }

        drop(slot);
        let mut inner = self.lock();
        inner.state = SessionState::Idle;
        inner.abort = None;
        summary
    }

    async fn evaluate_cell(
        &self,
        id: CellId,
        slot: &mut Option<Box<dyn ExecutionContext>>,
        abort: &AbortHandle,
        reset_first: bool,
        last_cell_target: bool,
        tx: &mpsc::UnboundedSender<EvaluationEvent>,
    ) -> CellStep {
        let (buffer, revision, scope) = {
            let mut inner = self.lock();
            let Ok(scope) = scope_before(&inner.store, id) else {
                return CellStep::Vanished;
            };
            if inner.state != SessionState::Aborting {
                inner.state = SessionState::Evaluating(id);
            }
            let Ok(cell) = inner.store.get_mut(id) else {
                return CellStep::Vanished;
            };
            cell.status = CellStatus::Evaluating;
            cell.diagnostics.clear();
            (cell.buffer.clone(), cell.revision, scope)
        };

        let _ = tx.send(EvaluationEvent::Started { cell: id });
        let run = CellRun {
            id,
            revision,
            last_cell_target,
            started: Instant::now(),
            tx,
        };

        let outcome = self.lock_chain().compile(&buffer, &scope);
        if abort.is_aborted() {
            return self.abandon(&run);
        }
        let unit = match outcome {
            CompileOutcome::Failed(diagnostics) => {
                return self.finish(&run, EvaluationStatus::Error, diagnostics, None);
            }
            outcome => match outcome.unit() {
                Some(unit) => Arc::clone(unit),
                None => return self.finish(&run, EvaluationStatus::Error, Vec::new(), None),
            },
        };
        if let Ok(cell) = self.lock().store.get_mut(id)
            && cell.revision == revision
        {
            cell.compiled = Some(Arc::clone(&unit));
        }

        let packages = match self.resolve_packages(&unit, abort).await {
            Ok(packages) => packages,
            Err(None) => return self.finish(&run, EvaluationStatus::Aborted, Vec::new(), None),
            Err(Some(diagnostic)) => {
                let mut diagnostics = unit.diagnostics.clone();
                diagnostics.push(diagnostic);
                return self.finish(&run, EvaluationStatus::Error, diagnostics, None);
            }
        };

        if slot.is_none() {
            match (self.factory)().await {
                Ok(context) => {
                    self.lock().context_id = Some(context.id());
                    *slot = Some(context);
                }
                Err(e) => return self.lose_context(&run, slot, abort, e.to_string()).await,
            }
        }
        let Some(context) = slot.as_mut() else {
            return self
                .lose_context(&run, slot, abort, "no execution context".to_string())
                .await;
        };

        if reset_first && let Err(e) = context.reset_state().await {
            return self.lose_context(&run, slot, abort, e.to_string()).await;
        }

        let handle = match context.load_module(&unit.binary_module, packages).await {
            Ok(handle) => handle,
            Err(ContextError::LoadFailure(reason)) => {
                let mut diagnostics = unit.diagnostics.clone();
                diagnostics.push(Diagnostic::error(format!("load failure: {}", reason), None));
                return self.finish(&run, EvaluationStatus::Error, diagnostics, None);
            }
            Err(e) => return self.lose_context(&run, slot, abort, e.to_string()).await,
        };

        let events = tx.clone();
        let mut sink = move |event: ExecutionEvent| {
            let event = match event {
                ExecutionEvent::Output { stream, text } => EvaluationEvent::CapturedOutput {
                    cell: id,
                    stream,
                    text,
                },
                ExecutionEvent::Value(value) => EvaluationEvent::Result { cell: id, value },
            };
            let _ = events.send(event);
        };

        match context.execute(handle, abort, &mut sink).await {
            Ok(ExecutionOutcome::Completed) => self.finish(
                &run,
                EvaluationStatus::Success,
                unit.diagnostics.clone(),
                None,
            ),
            Ok(ExecutionOutcome::Faulted(fault)) => {
                let mut diagnostics = unit.diagnostics.clone();
                diagnostics.push(Diagnostic::error(
                    format!("{:?}: {}", fault.kind, fault.message),
                    fault.line.map(|line| SourceSpan::point(line, 1)),
                ));
                self.finish(&run, EvaluationStatus::Error, diagnostics, Some(fault))
            }
            Ok(ExecutionOutcome::Aborted) => {
                self.finish(&run, EvaluationStatus::Aborted, Vec::new(), None)
            }
            Err(e) => self.lose_context(&run, slot, abort, e.to_string()).await,
        }
    }

    /// Resolve every reference of `unit` into package images in load order.
    /// `Err(None)` means the run was aborted meanwhile.
    async fn resolve_packages(
        &self,
        unit: &CompiledUnit,
        abort: &AbortHandle,
    ) -> std::result::Result<Vec<PackageImage>, Option<Diagnostic>> {
        let mut packages = Vec::new();
        for reference in &unit.requested_dependencies {
            let resolved = tokio::select! {
                biased;
                _ = abort.aborted() => return Err(None),
                resolved = self.resolver.resolve(reference) => resolved,
            };
            let resolved = resolved
                .map_err(|e| Some(Diagnostic::error(e.to_string(), Some(reference.span))))?;

            for dependency in resolved.load_order() {
                let alias = Arc::ptr_eq(&dependency, &resolved).then(|| reference.alias.clone());
                packages.push(PackageImage::from_resolved(&dependency, alias));
            }
        }
        Ok(packages)
    }

    /// Record a terminal status and emit `finished`.
    fn finish(
        &self,
        run: &CellRun<'_>,
        status: EvaluationStatus,
        diagnostics: Vec<Diagnostic>,
        fault: Option<Fault>,
    ) -> CellStep {
        {
            let mut inner = self.lock();
            let stamp = inner.next_stamp;
            inner.next_stamp += 1;
            let chain = chain_before(&inner.store, run.id);

            if let Ok(cell) = inner.store.get_mut(run.id) {
                cell.status = match status {
                    EvaluationStatus::Success => {
                        cell.stamp = stamp;
                        cell.chain = chain;
                        CellStatus::Evaluated(CellOutcome::Success)
                    }
                    EvaluationStatus::Error => CellStatus::Evaluated(CellOutcome::Error),
                    EvaluationStatus::Aborted => CellStatus::Aborted,
                };
                if cell.revision != run.revision {
                    cell.status = CellStatus::Stale;
                }
                cell.diagnostics = diagnostics.clone();
            }
        }

        let _ = run.tx.send(EvaluationEvent::Finished {
            cell: run.id,
            status,
            diagnostics,
            fault,
            start_new_cell: run.last_cell_target && status == EvaluationStatus::Success,
            duration_ms: run.started.elapsed().as_millis() as u64,
        });
        CellStep::Finished(status)
    }

    /// Aborted before a binary module existed: the cell reverts to
    /// unevaluated.
    fn abandon(&self, run: &CellRun<'_>) -> CellStep {
        tracing::debug!("Abort landed while compiling {}", run.id);
        if let Ok(cell) = self.lock().store.get_mut(run.id) {
            cell.status = CellStatus::Unevaluated;
            cell.diagnostics.clear();
        }
        let _ = run.tx.send(EvaluationEvent::Finished {
            cell: run.id,
            status: EvaluationStatus::Aborted,
            diagnostics: Vec::new(),
            fault: None,
            start_new_cell: false,
            duration_ms: run.started.elapsed().as_millis() as u64,
        });
        CellStep::Finished(EvaluationStatus::Aborted)
    }

    /// The context died while `run` was in flight: discard it and revert
    /// every cell.
    async fn lose_context(
        &self,
        run: &CellRun<'_>,
        slot: &mut Option<Box<dyn ExecutionContext>>,
        abort: &AbortHandle,
        reason: String,
    ) -> CellStep {
        tracing::error!("Execution context lost during {}: {}", run.id, reason);
        if let Some(mut context) = slot.take() {
            context.shutdown().await;
        }

        let status = if abort.is_aborted() {
            EvaluationStatus::Aborted
        } else {
            EvaluationStatus::Error
        };
        let diagnostic = Diagnostic::error(CONTEXT_TERMINATED, None);
        {
            let mut inner = self.lock();
            inner.context_lost = Some(reason);
            inner.context_id = None;
            for cell in inner.store.cells_mut() {
                cell.clear_evaluation();
            }
            if let Ok(cell) = inner.store.get_mut(run.id) {
                cell.diagnostics = vec![diagnostic.clone()];
            }
        }

        let diagnostics = match status {
            EvaluationStatus::Aborted => Vec::new(),
            _ => vec![diagnostic],
        };
        let _ = run.tx.send(EvaluationEvent::Finished {
            cell: run.id,
            status,
            diagnostics,
            fault: None,
            start_new_cell: false,
            duration_ms: run.started.elapsed().as_millis() as u64,
        });
        CellStep::ContextLost(status)
    }
}

/// The cell currently being evaluated.
struct CellRun<'a> {
    id: CellId,
    revision: u64,
    /// The run's target, and the last cell of the workbook.
    last_cell_target: bool,
    started: Instant,
    tx: &'a mpsc::UnboundedSender<EvaluationEvent>,
}

/// Fold one cell into the fingerprint of the cells before it.
fn extend_chain(chain: u64, cell: &Cell) -> u64 {
    let mut hasher = FxHasher::default();
    chain.hash(&mut hasher);
    cell.id.cell.hash(&mut hasher);
    cell.stamp.hash(&mut hasher);
    hasher.finish()
}

/// Fingerprint of every cell before `id`.
fn chain_before(store: &CellStore, id: CellId) -> u64 {
    store
        .iter()
        .take_while(|cell| cell.id != id)
        .fold(0, extend_chain)
}

/// Whether each cell, in link order, ran successfully against the current
/// state of every earlier cell.
fn freshness(store: &CellStore) -> Vec<(CellId, bool)> {
    let mut chain = 0;
    let mut upstream_fresh = true;
    store
        .iter()
        .map(|cell| {
            let fresh = upstream_fresh && cell.status.is_success() && cell.chain == chain;
            upstream_fresh = fresh;
            chain = extend_chain(chain, cell);
            (cell.id, fresh)
        })
        .collect()
}

/// Declared state of every cell before `id`, in link order.
fn scope_before(store: &CellStore, id: CellId) -> Result<Vec<SymbolDescriptor>> {
    Ok(store
        .predecessors(id)?
        .into_iter()
        .filter_map(|cell| cell.compiled.as_ref())
        .flat_map(|unit| unit.declared_top_level_state.iter().cloned())
        .collect())
}

fn plan(store: &CellStore, target: CellId, evaluate_all: bool) -> Result<Vec<CellId>> {
    let fresh = freshness(store);
    let end = fresh
        .iter()
        .position(|(id, _)| *id == target)
        .ok_or(Error::NotFound(target))?;
    let (before, _) = fresh.split_at(end);

    if evaluate_all {
        let start = fresh[..=end]
            .iter()
            .position(|(_, fresh)| !fresh)
            .unwrap_or(end + 1);
        return Ok(fresh[start..=end].iter().map(|(id, _)| *id).collect());
    }

    if let Some((prerequisite, _)) = before.iter().find(|(_, fresh)| !fresh) {
        return Err(Error::PrerequisiteNotEvaluated {
            cell: target,
            prerequisite: *prerequisite,
        });
    }
    Ok(vec![target])
}
