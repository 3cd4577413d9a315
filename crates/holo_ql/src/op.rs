//! Client-side operations and the statement envelope a session executes.
//!
//! An op is a shared handle: the caller keeps it to edit the request and read
//! the response, while the session holds a clone until the op completes. The
//! request is snapshotted when the op is applied, so editing it afterwards
//! (the reuse pattern) never changes a batch already in flight or a response
//! already delivered.
//!
//! Every apply starts a new generation of the op. Completions carry the
//! generation they belong to and are ignored once the op has moved on, so a
//! slow batch from an earlier apply cannot overwrite a newer outcome.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use holo_tablet::{
    QlResponse, ReadRequest, ResponseStatus, TabletRequest, Value, WriteKind, WriteRequest,
};

use crate::client::Table;
use crate::partition::Route;

#[derive(Debug)]
struct OpShared<R> {
    table: Table,
    request: Mutex<R>,
    generation: AtomicU64,
    response: watch::Sender<Option<QlResponse>>,
}

impl<R: Clone> OpShared<R> {
    fn new(table: Table, request: R) -> Arc<Self> {
        let (response, _) = watch::channel(None);
        Arc::new(Self {
            table,
            request: Mutex::new(request),
            generation: AtomicU64::new(0),
            response,
        })
    }

    fn request_mut(&self) -> MutexGuard<'_, R> {
        self.request.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> R {
        self.request_mut().clone()
    }

    fn response(&self) -> Option<QlResponse> {
        self.response.borrow().clone()
    }

    async fn completed(&self) -> QlResponse {
        let mut rx = self.response.subscribe();
        let response = rx.wait_for(Option::is_some).await.ok().and_then(|r| r.clone());
        response.unwrap_or_else(|| {
            QlResponse::error(ResponseStatus::SessionError, "operation abandoned")
        })
    }
}

/// INSERT, UPDATE or DELETE of a single row.
#[derive(Clone, Debug)]
pub struct WriteOp {
    shared: Arc<OpShared<WriteRequest>>,
}

impl WriteOp {
    pub(crate) fn new(table: Table, kind: WriteKind) -> Self {
        let request = WriteRequest::new(kind, table.schema().version());
        Self {
            shared: OpShared::new(table, request),
        }
    }

    pub fn table(&self) -> &Table {
        &self.shared.table
    }

    pub fn kind(&self) -> WriteKind {
        self.shared.request_mut().kind
    }

    /// Edit the request. Changes apply to the next `apply` of this op.
    pub fn request_mut(&self) -> MutexGuard<'_, WriteRequest> {
        self.shared.request_mut()
    }

    pub fn request(&self) -> WriteRequest {
        self.shared.snapshot()
    }

    /// Response of the latest apply, once it has completed.
    pub fn response(&self) -> Option<QlResponse> {
        self.shared.response()
    }

    /// Wait for the latest apply to complete.
    pub async fn completed(&self) -> QlResponse {
        self.shared.completed().await
    }
}

/// Filtered read of one hash partition.
#[derive(Clone, Debug)]
pub struct ReadOp {
    shared: Arc<OpShared<ReadRequest>>,
}

impl ReadOp {
    pub(crate) fn new(table: Table) -> Self {
        let request = ReadRequest::new(table.schema().version());
        Self {
            shared: OpShared::new(table, request),
        }
    }

    pub fn table(&self) -> &Table {
        &self.shared.table
    }

    pub fn request_mut(&self) -> MutexGuard<'_, ReadRequest> {
        self.shared.request_mut()
    }

    pub fn request(&self) -> ReadRequest {
        self.shared.snapshot()
    }

    pub fn response(&self) -> Option<QlResponse> {
        self.shared.response()
    }

    pub async fn completed(&self) -> QlResponse {
        self.shared.completed().await
    }
}

/// Any op a session accepts.
#[derive(Clone, Debug)]
pub enum Operation {
    Write(WriteOp),
    Read(ReadOp),
}

impl From<WriteOp> for Operation {
    fn from(op: WriteOp) -> Self {
        Operation::Write(op)
    }
}

impl From<&WriteOp> for Operation {
    fn from(op: &WriteOp) -> Self {
        Operation::Write(op.clone())
    }
}

impl From<ReadOp> for Operation {
    fn from(op: ReadOp) -> Self {
        Operation::Read(op)
    }
}

impl From<&ReadOp> for Operation {
    fn from(op: &ReadOp) -> Self {
        Operation::Read(op.clone())
    }
}

impl Operation {
    pub fn table(&self) -> &Table {
        match self {
            Operation::Write(op) => op.table(),
            Operation::Read(op) => op.table(),
        }
    }

    pub fn response(&self) -> Option<QlResponse> {
        match self {
            Operation::Write(op) => op.response(),
            Operation::Read(op) => op.response(),
        }
    }

    pub async fn completed(&self) -> QlResponse {
        match self {
            Operation::Write(op) => op.completed().await,
            Operation::Read(op) => op.completed().await,
        }
    }

    fn response_tx(&self) -> &watch::Sender<Option<QlResponse>> {
        match self {
            Operation::Write(op) => &op.shared.response,
            Operation::Read(op) => &op.shared.response,
        }
    }

    fn generation(&self) -> &AtomicU64 {
        match self {
            Operation::Write(op) => &op.shared.generation,
            Operation::Read(op) => &op.shared.generation,
        }
    }

    fn snapshot(&self) -> StatementKind {
        match self {
            Operation::Write(op) => StatementKind::from(op.request()),
            Operation::Read(op) => StatementKind::Select(op.request()),
        }
    }

    /// Start a new generation: clear the previous response and return the
    /// generation later completions must name.
    fn begin(&self) -> u64 {
        let mut generation = 0;
        self.response_tx().send_modify(|slot| {
            *slot = None;
            generation = self.generation().fetch_add(1, Ordering::SeqCst) + 1;
        });
        generation
    }

    /// Deliver the outcome of `generation`. The first completion of the
    /// current generation wins; anything else is dropped. Returns whether the
    /// response was delivered.
    pub(crate) fn complete(&self, generation: u64, response: QlResponse) -> bool {
        self.response_tx().send_if_modified(|slot| {
            if slot.is_some() || self.generation().load(Ordering::SeqCst) != generation {
                return false;
            }
            *slot = Some(response);
            true
        })
    }
}

/// Kind-specific payload of a statement.
#[derive(Clone, Debug, PartialEq)]
pub enum StatementKind {
    Insert(WriteRequest),
    Update(WriteRequest),
    Delete(WriteRequest),
    Select(ReadRequest),
}

impl From<WriteRequest> for StatementKind {
    fn from(request: WriteRequest) -> Self {
        match request.kind {
            WriteKind::Insert => StatementKind::Insert(request),
            WriteKind::Update => StatementKind::Update(request),
            WriteKind::Delete => StatementKind::Delete(request),
        }
    }
}

impl StatementKind {
    pub fn name(&self) -> &'static str {
        match self {
            StatementKind::Insert(_) => "INSERT",
            StatementKind::Update(_) => "UPDATE",
            StatementKind::Delete(_) => "DELETE",
            StatementKind::Select(_) => "SELECT",
        }
    }

    pub fn hash_values(&self) -> &[Value] {
        match self {
            StatementKind::Insert(req)
            | StatementKind::Update(req)
            | StatementKind::Delete(req) => &req.hash_values,
            StatementKind::Select(req) => &req.hash_values,
        }
    }

    pub fn to_request(&self) -> TabletRequest {
        match self {
            StatementKind::Insert(req)
            | StatementKind::Update(req)
            | StatementKind::Delete(req) => TabletRequest::Write(req.clone()),
            StatementKind::Select(req) => TabletRequest::Read(req.clone()),
        }
    }
}

/// An applied op: its frozen request, where it goes, and the handle its
/// outcome is reported through.
///
/// A statement dropped before it completed reports a session error.
#[derive(Debug)]
pub struct Statement {
    kind: StatementKind,
    route: Route,
    op: Operation,
    generation: u64,
}

/// An op's request as of apply time, tied to that apply's generation.
#[derive(Debug)]
pub(crate) struct Frozen {
    pub(crate) kind: StatementKind,
    pub(crate) generation: u64,
}

impl Statement {
    /// Snapshot the op's request and clear its previous response.
    pub(crate) fn freeze(op: &Operation) -> Frozen {
        let generation = op.begin();
        Frozen {
            kind: op.snapshot(),
            generation,
        }
    }

    pub(crate) fn new(frozen: Frozen, op: Operation, route: Route) -> Self {
        Self {
            kind: frozen.kind,
            route,
            op,
            generation: frozen.generation,
        }
    }

    pub fn kind(&self) -> &StatementKind {
        &self.kind
    }

    pub fn route(&self) -> Route {
        self.route
    }

    pub(crate) fn set_route(&mut self, route: Route) {
        self.route = route;
    }

    pub fn table(&self) -> &Table {
        self.op.table()
    }

    pub fn op(&self) -> &Operation {
        &self.op
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Outcome status, once the statement has completed.
    pub fn status(&self) -> Option<ResponseStatus> {
        self.op.response().map(|r| r.status())
    }

    pub(crate) fn complete(&self, response: QlResponse) -> bool {
        self.op.complete(self.generation, response)
    }

    pub(crate) fn fail(&self, status: ResponseStatus, message: impl Into<String>) -> bool {
        self.complete(QlResponse::error(status, message))
    }
}

impl Drop for Statement {
    fn drop(&mut self) {
        self.fail(ResponseStatus::SessionError, "operation abandoned");
    }
}
