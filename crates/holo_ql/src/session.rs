//! Session batcher.
//!
//! A session buffers applied ops and sends them to tablets grouped by
//! destination. Batches for different tablets run concurrently; a batch for
//! one tablet executes in apply order. Every applied op reaches exactly one
//! terminal response: its tablet's answer, a timeout, or a session error when
//! the session is dropped with ops still buffered.

use std::collections::BTreeMap;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use holo_tablet::{QlResponse, ResponseStatus, TabletError, TabletId};

use crate::client::Client;
use crate::config::{FlushMode, SessionConfig};
use crate::error::QlError;
use crate::op::{Operation, Statement};
use crate::server::ServerId;

/// Observable session state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Accumulating,
    Flushing,
    Errored,
}

/// Outcome counts of one flush.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub ops: usize,
    pub ok: usize,
    pub failed: usize,
}

/// Completion of a background flush started by [`Session::flush_async`].
pub struct FlushHandle {
    handle: JoinHandle<Result<FlushSummary, QlError>>,
}

impl FlushHandle {
    pub async fn wait(self) -> Result<FlushSummary, QlError> {
        self.handle
            .await
            .map_err(|err| QlError::Internal(anyhow::anyhow!("flush task failed: {err}")))?
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

pub struct Session {
    client: Client,
    config: SessionConfig,
    flush_mode: FlushMode,
    pending: Vec<Statement>,
    in_flight: Arc<AtomicUsize>,
    errored: bool,
}

impl Session {
    pub(crate) fn new(client: Client, config: SessionConfig) -> Self {
        Self {
            flush_mode: config.flush_mode,
            client,
            config,
            pending: Vec::new(),
            in_flight: Arc::new(AtomicUsize::new(0)),
            errored: false,
        }
    }

    pub fn flush_mode(&self) -> FlushMode {
        self.flush_mode
    }

    /// Change the flush mode. Refused while ops are buffered.
    pub fn set_flush_mode(&mut self, mode: FlushMode) -> Result<(), QlError> {
        if mode != self.flush_mode && !self.pending.is_empty() {
            return Err(QlError::PendingOperations(self.pending.len()));
        }
        self.flush_mode = mode;
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.config = self.config.clone().with_timeout(timeout);
    }

    pub fn pending_ops(&self) -> usize {
        self.pending.len()
    }

    pub fn state(&self) -> SessionState {
        if self.errored || self.client.is_closed() {
            SessionState::Errored
        } else if self.in_flight.load(Ordering::SeqCst) > 0 {
            SessionState::Flushing
        } else if !self.pending.is_empty() {
            SessionState::Accumulating
        } else {
            SessionState::Idle
        }
    }

    /// Apply an op.
    ///
    /// In `AutoFlushSync` mode the op is executed before this returns and its
    /// response is available; per-op failures (stale schema, evaluation
    /// errors) are reported through the response, not through `Err`. In
    /// `ManualFlush` mode the op is only buffered.
    pub async fn apply(&mut self, op: impl Into<Operation>) -> Result<(), QlError> {
        let op = op.into();
        let frozen = Statement::freeze(&op);
        if self.client.is_closed() && !self.errored {
            warn!("client closed; session moves to errored state");
            self.errored = true;
        }
        if self.errored {
            op.complete(
                frozen.generation,
                QlResponse::error(
                    ResponseStatus::SessionError,
                    "session is in an errored state",
                ),
            );
            return Err(QlError::SessionErrored);
        }
        let route = match self.client.locate(op.table(), frozen.kind.hash_values()) {
            Ok(route) => route,
            Err(err) => {
                op.complete(
                    frozen.generation,
                    QlResponse::error(ResponseStatus::RuntimeError, err.to_string()),
                );
                return Err(err);
            }
        };
        let statement = Statement::new(frozen, op, route);
        match self.flush_mode {
            FlushMode::AutoFlushSync => {
                let _flushing = InFlight::enter(&self.in_flight);
                execute_batch(self.client.clone(), vec![statement], self.config.timeout).await?;
            }
            FlushMode::ManualFlush => self.pending.push(statement),
        }
        Ok(())
    }

    /// Send every buffered op and wait for all of them, bounded by the
    /// session timeout.
    pub async fn flush(&mut self) -> Result<FlushSummary, QlError> {
        let batch = self.take_pending()?;
        if batch.is_empty() {
            return Ok(FlushSummary::default());
        }
        let _flushing = InFlight::enter(&self.in_flight);
        execute_batch(self.client.clone(), batch, self.config.timeout).await
    }

    /// Start flushing in the background and return immediately. Each op's
    /// `completed()` resolves once its response is populated.
    ///
    /// Must be called within a tokio runtime.
    pub fn flush_async(&mut self) -> FlushHandle {
        let batch = self.take_pending();
        let client = self.client.clone();
        let timeout = self.config.timeout;
        // Entered before spawning so `state()` reports the flush at once.
        let flushing = InFlight::enter(&self.in_flight);
        let handle = tokio::spawn(async move {
            let _flushing = flushing;
            let batch = batch?;
            if batch.is_empty() {
                return Ok(FlushSummary::default());
            }
            execute_batch(client, batch, timeout).await
        });
        FlushHandle { handle }
    }

    fn take_pending(&mut self) -> Result<Vec<Statement>, QlError> {
        if self.client.is_closed() {
            self.errored = true;
        }
        let batch = mem::take(&mut self.pending);
        if self.errored {
            for statement in &batch {
                statement.fail(
                    ResponseStatus::SessionError,
                    "session is in an errored state",
                );
            }
            return Err(QlError::SessionErrored);
        }
        Ok(batch)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        debug!(
            pending = self.pending.len(),
            "session dropped with buffered operations"
        );
        for statement in self.pending.drain(..) {
            statement.fail(
                ResponseStatus::SessionError,
                "session dropped before flush",
            );
        }
    }
}

struct InFlight {
    counter: Arc<AtomicUsize>,
}

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self {
            counter: counter.clone(),
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Execute statements grouped per destination tablet, all groups
/// concurrently, under one deadline.
///
/// Statements still in flight when the deadline passes are completed with
/// `Timeout` before their batches are dropped. If this future itself is
/// dropped, every statement it still holds reports a session error.
async fn execute_batch(
    client: Client,
    statements: Vec<Statement>,
    timeout: Duration,
) -> Result<FlushSummary, QlError> {
    let ops = statements
        .iter()
        .map(|s| (s.op().clone(), s.generation()))
        .collect::<Vec<(Operation, u64)>>();
    let groups = group_by_tablet(statements);
    let tablets = groups.len();

    let run = async {
        let mut tasks = groups
            .into_iter()
            .map(|((server, tablet_id), batch)| run_tablet_batch(&client, server, tablet_id, batch))
            .collect::<FuturesUnordered<_>>();
        let mut summary = FlushSummary::default();
        while let Some(partial) = tasks.next().await {
            summary.ops += partial.ops;
            summary.ok += partial.ok;
            summary.failed += partial.failed;
        }
        summary
    };
    tokio::pin!(run);

    let finished = tokio::select! {
        summary = &mut run => Some(summary),
        () = tokio::time::sleep(timeout) => None,
    };
    let Some(summary) = finished else {
        let outstanding = ops
            .iter()
            .filter(|(op, generation)| {
                op.complete(
                    *generation,
                    QlResponse::error(
                        ResponseStatus::Timeout,
                        format!("operation timed out after {timeout:?}"),
                    ),
                )
            })
            .count();
        warn!(
            ops = ops.len(),
            outstanding,
            timeout = ?timeout,
            "flush timed out"
        );
        return Err(QlError::Timeout {
            timeout,
            outstanding,
        });
    };

    debug!(
        ops = summary.ops,
        tablets,
        ok = summary.ok,
        failed = summary.failed,
        "flush finished"
    );
    Ok(summary)
}

fn group_by_tablet(statements: Vec<Statement>) -> BTreeMap<(ServerId, TabletId), Vec<Statement>> {
    let mut groups: BTreeMap<(ServerId, TabletId), Vec<Statement>> = BTreeMap::new();
    for statement in statements {
        let route = statement.route();
        groups
            .entry((route.server, route.tablet_id))
            .or_default()
            .push(statement);
    }
    groups
}

impl FlushSummary {
    fn record(&mut self, ok: bool) {
        self.ops += 1;
        if ok {
            self.ok += 1;
        } else {
            self.failed += 1;
        }
    }
}

/// Send one tablet's batch, then re-route once whatever the tablet refused
/// because its hash range moved.
async fn run_tablet_batch(
    client: &Client,
    server: ServerId,
    tablet_id: TabletId,
    batch: Vec<Statement>,
) -> FlushSummary {
    let mut summary = FlushSummary::default();
    let stale = send(client, server, tablet_id, batch, &mut summary).await;
    if stale.is_empty() {
        return summary;
    }
    for ((server, tablet_id), batch) in reroute(client, stale, &mut summary) {
        for statement in send(client, server, tablet_id, batch, &mut summary).await {
            statement.fail(
                ResponseStatus::SessionError,
                format!("tablet {tablet_id} no longer owns the row after re-routing"),
            );
            summary.record(false);
        }
    }
    summary
}

/// Deliver a batch and complete its statements. Returns those the tablet
/// rejected as not owned.
async fn send(
    client: &Client,
    server: ServerId,
    tablet_id: TabletId,
    batch: Vec<Statement>,
    summary: &mut FlushSummary,
) -> Vec<Statement> {
    let requests = batch.iter().map(|s| s.kind().to_request()).collect::<Vec<_>>();
    let results = match client.transport().execute(server, tablet_id, requests).await {
        Ok(results) if results.len() == batch.len() => results,
        Ok(results) => {
            let message = format!(
                "tablet {tablet_id} returned {} results for {} requests",
                results.len(),
                batch.len()
            );
            warn!(server, tablet_id, "{message}");
            for statement in &batch {
                statement.fail(ResponseStatus::SessionError, message.clone());
                summary.record(false);
            }
            return Vec::new();
        }
        Err(err) => {
            warn!(server, tablet_id, error = ?err, "tablet batch failed");
            for statement in &batch {
                statement.fail(ResponseStatus::SessionError, err.to_string());
                summary.record(false);
            }
            return Vec::new();
        }
    };

    let mut stale = Vec::new();
    for (statement, result) in batch.into_iter().zip(results) {
        match result {
            Ok(response) => {
                summary.record(response.is_ok());
                statement.complete(response);
            }
            Err(TabletError::WrongTablet { .. }) => stale.push(statement),
        }
    }
    stale
}

fn reroute(
    client: &Client,
    stale: Vec<Statement>,
    summary: &mut FlushSummary,
) -> BTreeMap<(ServerId, TabletId), Vec<Statement>> {
    let mut refreshed = Vec::new();
    let mut routed = Vec::with_capacity(stale.len());
    for mut statement in stale {
        let table_id = statement.table().id();
        if !refreshed.contains(&table_id) {
            refreshed.push(table_id);
            if let Err(err) = client.refresh(table_id) {
                warn!(table_id, error = %err, "partition refresh failed");
            }
        }
        match client.locate(statement.table(), statement.kind().hash_values()) {
            Ok(route) => {
                debug!(
                    from = statement.route().tablet_id,
                    to = route.tablet_id,
                    "re-routing statement"
                );
                statement.set_route(route);
                routed.push(statement);
            }
            Err(err) => {
                statement.fail(ResponseStatus::SessionError, err.to_string());
                summary.record(false);
            }
        }
    }
    group_by_tablet(routed)
}
