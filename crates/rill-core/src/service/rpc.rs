// Reliable RPC
// Task numbering, retries, receiver dedup and the ACK / ACKACK / NACK handshake

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use rill_api::codec;
use rill_api::remote::{PacketHeader, RpcFlag, UdpType};
use rill_common::{Result, RillError};

use crate::service::futures::PendingHandle;
use crate::service::node::{Node, WorkEntry};
use crate::service::runtime::ClusterRuntime;
use crate::service::timeout::TimeoutKind;
use crate::service::type_lookup::LeaderResolver;

/// Sweeper wake-up when nothing is scheduled
const IDLE_POLL: Duration = Duration::from_secs(1);

const REPLY_OK: u8 = 0;
const REPLY_ERR: u8 = 1;

/// Which worker budget a task runs on
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Priority {
    #[default]
    Normal,
    /// Work that other tasks block on
    High,
}

/// What a task sees while executing
#[derive(Clone)]
pub struct TaskContext {
    pub runtime: Arc<ClusterRuntime>,
    /// Node that issued the call (this node for local calls)
    pub sender: SocketAddr,
}

/// Receiver-side hook run once when the sender confirms the reply
pub type AckAckHook = Box<dyn FnOnce() + Send + 'static>;

/// Sender-side hook over the encoded reply, run before the ACKACK goes out
type AckHook = Box<dyn FnOnce(&Bytes) + Send + 'static>;

/// Result of executing a task plus its optional release hook
pub struct TaskOutcome<O> {
    pub output: O,
    pub on_ack_ack: Option<AckAckHook>,
}

impl<O> TaskOutcome<O> {
    pub fn new(output: O) -> Self {
        Self {
            output,
            on_ack_ack: None,
        }
    }

    pub fn with_ack_ack(output: O, hook: impl FnOnce() + Send + 'static) -> Self {
        Self {
            output,
            on_ack_ack: Some(Box::new(hook)),
        }
    }
}

/// A serializable unit of work executed on another node.
///
/// Every node must register the same set of task types.
pub trait RemoteTask: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Cluster-wide name used to resolve the wire tag
    const TYPE_NAME: &'static str;
    const PRIORITY: Priority = Priority::Normal;

    type Output: Serialize + DeserializeOwned + Send + Sync + 'static;

    fn execute(
        self,
        ctx: TaskContext,
    ) -> impl Future<Output = Result<TaskOutcome<Self::Output>>> + Send;
}

#[async_trait]
pub(crate) trait TaskHandler: Send + Sync {
    fn type_name(&self) -> &'static str;

    fn priority(&self) -> Priority;

    async fn run(&self, ctx: TaskContext, body: Bytes) -> Result<(Bytes, Option<AckAckHook>)>;
}

struct TypedHandler<T>(PhantomData<fn() -> T>);

#[async_trait]
impl<T: RemoteTask> TaskHandler for TypedHandler<T> {
    fn type_name(&self) -> &'static str {
        T::TYPE_NAME
    }

    fn priority(&self) -> Priority {
        T::PRIORITY
    }

    async fn run(&self, ctx: TaskContext, body: Bytes) -> Result<(Bytes, Option<AckAckHook>)> {
        let task: T = codec::decode(&body)?;
        let outcome = task.execute(ctx).await?;
        Ok((codec::encode(&outcome.output)?, outcome.on_ack_ack))
    }
}

/// Task types this node can execute, by name
#[derive(Default)]
pub struct TaskRegistry {
    handlers: HashMap<&'static str, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: RemoteTask>(&mut self) {
        info!(type_name = T::TYPE_NAME, "Registering task handler");
        self.handlers
            .insert(T::TYPE_NAME, Arc::new(TypedHandler::<T>(PhantomData)));
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn registered_types(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.handlers.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

/// Lifecycle of one outgoing task
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RpcPhase {
    Created,
    Sent,
    Retrying,
    /// The receiver answered NACK: it holds the task and is still working
    AwaitingAck,
    Acked,
    AckAckSent,
    Done,
    Cancelled,
    Failed,
}

impl RpcPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, RpcPhase::Done | RpcPhase::Cancelled | RpcPhase::Failed)
    }
}

pub(crate) type CoalesceKey = (SocketAddr, &'static str, Bytes);

struct CoreState {
    outcome: Option<Result<Bytes>>,
    retry: Duration,
    deadline: Instant,
    resends: u32,
    /// The full request reached the target over a stream
    stream_delivered: bool,
    on_ack: Option<AckHook>,
}

/// Sender-side record of one outgoing task
pub(crate) struct RpcCore {
    target: SocketAddr,
    task: u32,
    type_name: &'static str,
    /// Type tag followed by the encoded task
    request: Bytes,
    coalesce_key: Option<CoalesceKey>,
    state: Mutex<CoreState>,
    phase: watch::Sender<RpcPhase>,
}

impl RpcCore {
    fn new(
        target: SocketAddr,
        task: u32,
        type_name: &'static str,
        request: Bytes,
        coalesce_key: Option<CoalesceKey>,
        on_ack: Option<AckHook>,
        retry: Duration,
    ) -> Self {
        Self {
            target,
            task,
            type_name,
            request,
            coalesce_key,
            state: Mutex::new(CoreState {
                outcome: None,
                retry,
                deadline: Instant::now() + retry,
                resends: 0,
                stream_delivered: false,
                on_ack,
            }),
            phase: watch::channel(RpcPhase::Created).0,
        }
    }

    pub(crate) fn phase(&self) -> RpcPhase {
        *self.phase.borrow()
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.phase().is_terminal()
    }

    fn set_phase(&self, phase: RpcPhase) {
        self.phase.send_if_modified(|current| {
            if current.is_terminal() || *current == phase {
                false
            } else {
                *current = phase;
                true
            }
        });
    }

    fn deadline(&self) -> Instant {
        self.state.lock().deadline
    }

    /// Move the deadline one retry interval past `now` without resending
    fn push_deadline(&self, now: Instant) -> Instant {
        let mut state = self.state.lock();
        state.deadline = now + state.retry;
        state.deadline
    }

    /// `Some(next deadline)` when a resend is due, `None` with the deadline unchanged otherwise
    fn next_resend(&self, now: Instant, max: Duration) -> (bool, Instant) {
        let mut state = self.state.lock();
        if state.deadline > now {
            return (false, state.deadline);
        }
        state.retry = (state.retry * 2).min(max);
        state.deadline = now + state.retry;
        state.resends += 1;
        (true, state.deadline)
    }

    fn resends(&self) -> u32 {
        self.state.lock().resends
    }

    fn stream_delivered(&self) -> bool {
        self.state.lock().stream_delivered
    }

    fn mark_stream_delivered(&self) {
        self.state.lock().stream_delivered = true;
    }

    fn take_on_ack(&self) -> Option<AckHook> {
        self.state.lock().on_ack.take()
    }

    /// Record the terminal outcome; only the first call has an effect
    pub(crate) fn finish(&self, outcome: Result<Bytes>) -> bool {
        let phase = match &outcome {
            Ok(_) => RpcPhase::Done,
            Err(e) if e.is_cancelled() => RpcPhase::Cancelled,
            Err(_) => RpcPhase::Failed,
        };
        {
            let mut state = self.state.lock();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome);
            state.on_ack = None;
        }
        self.phase.send_replace(phase);
        true
    }

    pub(crate) fn cancel(&self, reason: &str) -> bool {
        self.finish(Err(RillError::Cancelled {
            target: self.target,
            task: self.task,
            reason: reason.to_string(),
        }))
    }

    pub(crate) async fn wait(&self) -> Result<Bytes> {
        let mut rx = self.phase.subscribe();
        // The sender lives in self, so this only returns once terminal
        let _ = rx.wait_for(|phase| phase.is_terminal()).await;
        self.state.lock().outcome.clone().unwrap_or_else(|| {
            Err(RillError::InternalError(
                "task finished without an outcome".to_string(),
            ))
        })
    }
}

/// Caller's handle on an outgoing task
pub struct RpcHandle<O> {
    core: Arc<RpcCore>,
    _output: PhantomData<fn() -> O>,
}

impl<O> Clone for RpcHandle<O> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            _output: PhantomData,
        }
    }
}

impl<O: DeserializeOwned> RpcHandle<O> {
    fn new(core: Arc<RpcCore>) -> Self {
        Self {
            core,
            _output: PhantomData,
        }
    }

    /// Wait until the task is done, failed or cancelled
    pub async fn get(&self) -> Result<O> {
        let bytes = self.core.wait().await?;
        codec::decode(&bytes)
    }

    /// Like [`RpcHandle::get`]; the task keeps running after a timeout
    pub async fn get_timeout(&self, timeout: Duration) -> Result<O> {
        match tokio::time::timeout(timeout, self.get()).await {
            Ok(result) => result,
            Err(_) => Err(RillError::Timeout(timeout.as_millis() as u64)),
        }
    }

    /// Give up on the task; false if it had already finished
    pub fn cancel(&self) -> bool {
        self.core.cancel("cancelled by caller")
    }

    pub fn phase(&self) -> RpcPhase {
        self.core.phase()
    }

    pub fn task_number(&self) -> u32 {
        self.core.task
    }

    pub fn target(&self) -> SocketAddr {
        self.core.target
    }

    pub fn resend_count(&self) -> u32 {
        self.core.resends()
    }
}

impl<O: Send + 'static> PendingHandle for RpcHandle<O> {
    fn is_done(&self) -> bool {
        self.core.is_terminal()
    }

    fn wait(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move { self.core.wait().await.map(|_| ()) })
    }
}

/// Per-call options
pub struct CallOptions<O> {
    coalesce_key: Option<Bytes>,
    on_ack: Option<Box<dyn FnOnce(&O) + Send + 'static>>,
}

impl<O> Default for CallOptions<O> {
    fn default() -> Self {
        Self {
            coalesce_key: None,
            on_ack: None,
        }
    }
}

impl<O> CallOptions<O> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share one in-flight task among identical calls to the same target
    pub fn coalesce(mut self, key: impl Into<Bytes>) -> Self {
        self.coalesce_key = Some(key.into());
        self
    }

    /// Run with the successful reply before the ACKACK is sent
    pub fn on_ack(mut self, hook: impl FnOnce(&O) + Send + 'static) -> Self {
        self.on_ack = Some(Box::new(hook));
        self
    }
}

struct CallState {
    computed: bool,
    ack_acked: bool,
    reply: Bytes,
    replied_via_stream: bool,
    ack_retry: Duration,
    on_ack_ack: Option<AckAckHook>,
}

/// Receiver-side record of one incoming task, kept until ACKACK
pub(crate) struct RpcCall {
    task: u32,
    state: Mutex<CallState>,
}

impl RpcCall {
    pub(crate) fn new(task: u32) -> Self {
        Self {
            task,
            state: Mutex::new(CallState {
                computed: false,
                ack_acked: false,
                reply: Bytes::new(),
                replied_via_stream: false,
                ack_retry: Duration::ZERO,
                on_ack_ack: None,
            }),
        }
    }

    pub(crate) fn task(&self) -> u32 {
        self.task
    }

    pub(crate) fn is_ack_acked(&self) -> bool {
        self.state.lock().ack_acked
    }

    fn is_computed(&self) -> bool {
        self.state.lock().computed
    }

    fn set_computed(&self, reply: Bytes, hook: Option<AckAckHook>, retry: Duration) {
        let mut state = self.state.lock();
        state.reply = reply;
        state.on_ack_ack = hook;
        state.ack_retry = retry;
        state.computed = true;
    }

    fn reply(&self) -> (Bytes, bool) {
        let state = self.state.lock();
        (state.reply.clone(), state.replied_via_stream)
    }

    fn mark_replied_via_stream(&self) {
        self.state.lock().replied_via_stream = true;
    }

    fn bump_ack_retry(&self, max: Duration) -> Duration {
        let mut state = self.state.lock();
        state.ack_retry = (state.ack_retry * 2).min(max);
        state.ack_retry
    }

    /// Mark the reply confirmed; the hook is handed out exactly once
    pub(crate) fn mark_ack_acked(&self) -> Option<AckAckHook> {
        let mut state = self.state.lock();
        state.ack_acked = true;
        state.reply = Bytes::new();
        state.on_ack_ack.take()
    }
}

fn encode_reply(result: &Result<Bytes>) -> Bytes {
    let mut buf = BytesMut::new();
    match result {
        Ok(body) => {
            buf.put_u8(REPLY_OK);
            buf.put_slice(body);
        }
        Err(e) => {
            buf.put_u8(REPLY_ERR);
            buf.put_slice(e.to_string().as_bytes());
        }
    }
    buf.freeze()
}

fn decode_reply(mut payload: Bytes, node: SocketAddr) -> Result<Bytes> {
    if payload.is_empty() {
        return Err(RillError::SerializationError("empty reply".to_string()));
    }
    match payload.get_u8() {
        REPLY_OK => Ok(payload),
        REPLY_ERR => Err(RillError::Remote {
            node,
            message: String::from_utf8_lossy(&payload).into_owned(),
        }),
        other => Err(RillError::SerializationError(format!(
            "unknown reply status {}",
            other
        ))),
    }
}

impl ClusterRuntime {
    /// Issue `task` to `target`
    pub async fn call<T: RemoteTask>(
        self: &Arc<Self>,
        target: SocketAddr,
        task: T,
    ) -> Result<RpcHandle<T::Output>> {
        self.call_with(target, task, CallOptions::default()).await
    }

    pub async fn call_with<T: RemoteTask>(
        self: &Arc<Self>,
        target: SocketAddr,
        task: T,
        options: CallOptions<T::Output>,
    ) -> Result<RpcHandle<T::Output>> {
        self.ensure_running()?;
        if target == self.address() {
            return Ok(self.call_local(task, options));
        }

        let resolver = LeaderResolver::new(self.clone());
        let tag = self.types.id_for(T::TYPE_NAME, &resolver).await?;
        let body = codec::encode(&task)?;
        let mut request = BytesMut::with_capacity(2 + body.len());
        request.put_u16(tag);
        request.put_slice(&body);
        let request = request.freeze();

        let on_ack: Option<AckHook> = options.on_ack.map(|hook| -> AckHook {
            Box::new(move |bytes: &Bytes| {
                if let Ok(output) = codec::decode::<T::Output>(bytes) {
                    hook(&output);
                }
            })
        });

        let node = self.nodes.intern(target);
        let retry = self.config.retry_initial;
        let new_core = |key: Option<CoalesceKey>| {
            Arc::new(RpcCore::new(
                target,
                node.next_task_number(),
                T::TYPE_NAME,
                request,
                key,
                on_ack,
                retry,
            ))
        };

        let core = match options.coalesce_key {
            Some(key) => match self.inflight.entry((target, T::TYPE_NAME, key)) {
                dashmap::Entry::Occupied(mut e) => {
                    if !e.get().is_terminal() {
                        trace!(node = %target, type_name = T::TYPE_NAME, "Coalesced with in-flight task");
                        return Ok(RpcHandle::new(e.get().clone()));
                    }
                    let core = new_core(Some(e.key().clone()));
                    e.insert(core.clone());
                    core
                }
                dashmap::Entry::Vacant(e) => {
                    let core = new_core(Some(e.key().clone()));
                    e.insert(core.clone());
                    core
                }
            },
            None => new_core(None),
        };

        node.tasks.insert(core.task, core.clone());
        debug!(node = %target, task = core.task, type_name = T::TYPE_NAME, "Sending task");
        self.send_request(&core, false).await;
        self.timeouts
            .schedule(core.deadline(), TimeoutKind::Request, target, core.task);
        Ok(RpcHandle::new(core))
    }

    /// Calls to self skip the network
    fn call_local<T: RemoteTask>(
        self: &Arc<Self>,
        task: T,
        options: CallOptions<T::Output>,
    ) -> RpcHandle<T::Output> {
        let core = Arc::new(RpcCore::new(
            self.address(),
            0,
            T::TYPE_NAME,
            Bytes::new(),
            None,
            None,
            self.config.retry_initial,
        ));
        core.set_phase(RpcPhase::Sent);
        let ctx = TaskContext {
            runtime: self.clone(),
            sender: self.address(),
        };
        let finished = core.clone();
        let on_ack = options.on_ack;
        self.workers.spawn(T::PRIORITY, async move {
            let outcome = match task.execute(ctx).await {
                Ok(outcome) => {
                    let encoded = codec::encode(&outcome.output);
                    if encoded.is_ok()
                        && let Some(hook) = on_ack
                    {
                        hook(&outcome.output);
                    }
                    if let Some(hook) = outcome.on_ack_ack {
                        hook();
                    }
                    encoded
                }
                Err(e) => Err(e),
            };
            finished.finish(outcome);
        });
        RpcHandle::new(core)
    }

    /// Tell the target to retire the number of a task the caller gave up on
    async fn send_release(&self, core: &RpcCore) {
        let frame = self
            .header(UdpType::Exec)
            .with_task(core.task, RpcFlag::RequestRelease)
            .encode(&[]);
        self.send_datagram(core.target, frame).await;
    }

    async fn send_request(&self, core: &RpcCore, resend: bool) {
        core.set_phase(if resend {
            RpcPhase::Retrying
        } else {
            RpcPhase::Sent
        });
        let header = self.header(UdpType::Exec);
        if resend && core.stream_delivered() {
            let frame = header
                .with_task(core.task, RpcFlag::RequestReminder)
                .encode(&[]);
            self.send_datagram(core.target, frame).await;
            return;
        }

        let frame = header
            .with_task(core.task, RpcFlag::RequestFull)
            .encode(&core.request);
        if frame.len() <= self.config.mtu {
            self.send_datagram(core.target, frame).await;
        } else {
            match self.transport.send_stream(core.target, frame).await {
                Ok(()) => core.mark_stream_delivered(),
                Err(e) => {
                    debug!(node = %core.target, task = core.task, error = %e, "Stream send failed, will retry");
                }
            }
        }
    }

    pub(crate) async fn send_datagram(&self, target: SocketAddr, frame: Bytes) {
        if let Err(e) = self.transport.send_datagram(target, frame).await {
            debug!(node = %target, error = %e, "Datagram send failed");
        }
    }

    /// Sender for reply-sized frames: datagram when it fits, else stream
    async fn send_ack(&self, node: &Node, call: &RpcCall, duplicate: bool) {
        let (reply, via_stream) = call.reply();
        let header = self.header(UdpType::Ack);
        if duplicate && via_stream {
            let frame = header
                .with_task(call.task, RpcFlag::ReplyViaStream)
                .encode(&[]);
            self.send_datagram(node.addr(), frame).await;
            return;
        }

        let frame = header.with_task(call.task, RpcFlag::ReplyFull).encode(&reply);
        if frame.len() <= self.config.mtu {
            self.send_datagram(node.addr(), frame).await;
        } else {
            match self.transport.send_stream(node.addr(), frame).await {
                Ok(()) => call.mark_replied_via_stream(),
                Err(e) => {
                    debug!(node = %node.addr(), task = call.task, error = %e, "Reply stream send failed");
                }
            }
        }
    }

    async fn send_ack_ack(&self, node: &Node, task: u32) {
        let frame = self
            .header(UdpType::AckAck)
            .with_task(task, RpcFlag::None)
            .encode(&[]);
        self.send_datagram(node.addr(), frame).await;
    }

    fn finish_task(&self, core: &Arc<RpcCore>, outcome: Result<Bytes>) {
        core.finish(outcome);
        if let Some(key) = &core.coalesce_key {
            self.inflight.remove_if(key, |_, v| Arc::ptr_eq(v, core));
        }
    }

    /// A destination is worth retrying while it belongs to the cloud, is a
    /// proposed or flatfile candidate, or is a client that was not evicted
    pub(crate) fn is_valid_target(&self, node: &Node) -> bool {
        if node.addr() == self.address() {
            return true;
        }
        if node.is_client() {
            return !node.is_removed();
        }
        self.membership.is_known(&node.addr())
    }

    // ===================== Receiver side =====================

    pub(crate) async fn on_exec(self: &Arc<Self>, node: Arc<Node>, header: PacketHeader, payload: Bytes) {
        match node.has_task(header.task) {
            Some(WorkEntry::Completed) => {
                trace!(node = %node.addr(), task = header.task, "Duplicate of a completed task");
                return;
            }
            Some(WorkEntry::Call(call)) => {
                self.answer_duplicate(&node, &call).await;
                return;
            }
            None => {}
        }

        if header.flag == RpcFlag::RequestReminder {
            debug!(node = %node.addr(), task = header.task, "Reminder for unknown task, awaiting stream copy");
            return;
        }

        match node.record_task(Arc::new(RpcCall::new(header.task))) {
            (WorkEntry::Completed, _) => {}
            (WorkEntry::Call(call), false) => self.answer_duplicate(&node, &call).await,
            (WorkEntry::Call(call), true) if header.flag == RpcFlag::RequestRelease => {
                self.retire_call(&node, &call).await
            }
            (WorkEntry::Call(call), true) => self.start_call(node, call, payload),
        }
    }

    /// Settle a task number the sender gave up on before it arrived, so the
    /// roll-up can move past it
    async fn retire_call(&self, node: &Node, call: &RpcCall) {
        trace!(node = %node.addr(), task = call.task, "Retiring released task");
        let retry = self.config.retry_initial;
        let released = Err(RillError::Cancelled {
            target: self.address(),
            task: call.task,
            reason: "released by the sender".to_string(),
        });
        call.set_computed(encode_reply(&released), None, retry);
        self.send_ack(node, call, false).await;
        self.timeouts.schedule(
            Instant::now() + retry,
            TimeoutKind::AckResend,
            node.addr(),
            call.task,
        );
    }

    async fn answer_duplicate(&self, node: &Node, call: &RpcCall) {
        if !call.is_computed() {
            let frame = self
                .header(UdpType::Nack)
                .with_task(call.task, RpcFlag::None)
                .encode(&[]);
            self.send_datagram(node.addr(), frame).await;
        } else if !call.is_ack_acked() {
            self.send_ack(node, call, true).await;
        }
    }

    fn start_call(self: &Arc<Self>, node: Arc<Node>, call: Arc<RpcCall>, payload: Bytes) {
        let rt = self.clone();
        tokio::spawn(async move {
            let (result, hook) = match rt.execute_request(&node, payload).await {
                Ok((body, hook)) => (Ok(body), hook),
                Err(e) => {
                    warn!(node = %node.addr(), task = call.task, error = %e, "Task failed");
                    (Err(e), None)
                }
            };
            let retry = rt.config.retry_initial;
            call.set_computed(encode_reply(&result), hook, retry);
            rt.send_ack(&node, &call, false).await;
            rt.timeouts.schedule(
                Instant::now() + retry,
                TimeoutKind::AckResend,
                node.addr(),
                call.task,
            );
        });
    }

    async fn execute_request(
        self: &Arc<Self>,
        node: &Arc<Node>,
        mut payload: Bytes,
    ) -> Result<(Bytes, Option<AckAckHook>)> {
        if payload.len() < 2 {
            return Err(RillError::SerializationError(
                "request without a type tag".to_string(),
            ));
        }
        let tag = payload.get_u16();
        let resolver = LeaderResolver::new(self.clone());
        let name = self.types.name_for(tag, &resolver).await?;
        let handler = self
            .task_registry
            .get(&name)
            .ok_or(RillError::UnregisteredTask(name))?;
        let _permit = self.workers.permit(handler.priority()).await;
        trace!(node = %node.addr(), type_name = handler.type_name(), "Executing task");
        handler
            .run(
                TaskContext {
                    runtime: self.clone(),
                    sender: node.addr(),
                },
                payload,
            )
            .await
    }

    pub(crate) fn on_ack_ack(&self, node: &Node, task: u32) {
        let Some(call) = node.work.get(&task).map(|c| c.clone()) else {
            return;
        };
        if !call.is_computed() || call.is_ack_acked() {
            return;
        }
        if let Some(hook) = call.mark_ack_acked() {
            hook();
        }
        node.remove_task_tracking();
    }

    // ===================== Sender side =====================

    pub(crate) async fn on_ack(&self, node: &Node, header: PacketHeader, payload: Bytes) {
        let task = header.task;
        if header.flag == RpcFlag::ReplyViaStream
            && let Some(core) = node.tasks.get(&task).map(|c| c.clone())
        {
            // The full reply is on its way over the stream
            core.push_deadline(Instant::now());
            return;
        }

        // Whoever removes the entry owns completion; duplicates just get an ACKACK
        let Some((_, core)) = node.tasks.remove(&task) else {
            self.send_ack_ack(node, task).await;
            return;
        };

        let result = decode_reply(payload, node.addr());
        core.set_phase(RpcPhase::Acked);
        if let Ok(body) = &result
            && let Some(hook) = core.take_on_ack()
        {
            hook(body);
        }
        self.send_ack_ack(node, task).await;
        core.set_phase(RpcPhase::AckAckSent);
        trace!(node = %node.addr(), task, "Task acknowledged");
        self.finish_task(&core, result);
    }

    pub(crate) fn on_nack(&self, node: &Node, task: u32) {
        if let Some(core) = node.tasks.get(&task).map(|c| c.clone()) {
            core.push_deadline(Instant::now());
            core.set_phase(RpcPhase::AwaitingAck);
            metrics::counter!("rill_rpc_nacks_total").increment(1);
        }
    }

    // ===================== Timeouts =====================

    pub(crate) async fn run_timeout_loop(self: Arc<Self>) {
        let mut stop = self.stop_signal();
        loop {
            let sleep = match self.timeouts.next_deadline() {
                Some(deadline) => tokio::time::sleep_until(deadline),
                None => tokio::time::sleep(IDLE_POLL),
            };
            tokio::select! {
                _ = sleep => {}
                _ = self.timeouts.scheduled() => {}
                _ = stop.changed() => break,
            }
            for timeout in self.timeouts.pop_expired(Instant::now()) {
                match timeout.kind {
                    TimeoutKind::Request => self.on_request_timeout(timeout.target, timeout.task),
                    TimeoutKind::AckResend => self.on_ack_timeout(timeout.target, timeout.task),
                }
            }
        }
        debug!("Timeout loop stopped");
    }

    fn on_request_timeout(self: &Arc<Self>, target: SocketAddr, task: u32) {
        let Some(node) = self.nodes.get(&target) else {
            return;
        };
        let Some(core) = node.tasks.get(&task).map(|c| c.clone()) else {
            return;
        };
        let released = core.phase() == RpcPhase::Cancelled;
        if core.is_terminal() && !released {
            node.tasks.remove(&task);
            return;
        }
        if !self.is_valid_target(&node) {
            node.tasks.remove(&task);
            warn!(node = %target, task, type_name = core.type_name, "Target left the cloud, cancelling task");
            self.finish_task(
                &core,
                Err(RillError::Cancelled {
                    target,
                    task,
                    reason: "target is no longer a member".to_string(),
                }),
            );
            return;
        }

        let (resend, deadline) = core.next_resend(Instant::now(), self.config.retry_max);
        if resend && released {
            // Kept until the target confirms it will never run the task
            trace!(node = %target, task, "Releasing cancelled task");
            let rt = self.clone();
            let core = core.clone();
            tokio::spawn(async move { rt.send_release(&core).await });
        } else if resend {
            metrics::counter!("rill_rpc_resends_total").increment(1);
            debug!(node = %target, task, resends = core.resends(), "Resending task");
            let rt = self.clone();
            let core = core.clone();
            tokio::spawn(async move { rt.send_request(&core, true).await });
        }
        self.timeouts
            .schedule(deadline, TimeoutKind::Request, target, task);
    }

    fn on_ack_timeout(self: &Arc<Self>, sender: SocketAddr, task: u32) {
        let Some(node) = self.nodes.get(&sender) else {
            return;
        };
        let Some(call) = node.work.get(&task).map(|c| c.clone()) else {
            return;
        };
        if call.is_ack_acked() {
            return;
        }
        if !self.is_valid_target(&node) {
            debug!(node = %sender, task, "Sender gone, releasing task");
            if let Some(hook) = call.mark_ack_acked() {
                hook();
            }
            node.remove_task_tracking();
            return;
        }

        let retry = call.bump_ack_retry(self.config.retry_max);
        let rt = self.clone();
        tokio::spawn(async move { rt.send_ack(&node, &call, true).await });
        self.timeouts.schedule(
            Instant::now() + retry,
            TimeoutKind::AckResend,
            sender,
            task,
        );
    }

    /// Outgoing tasks still tracked, summed over all peers
    pub fn outstanding_tasks(&self) -> usize {
        self.nodes.all().iter().map(|n| n.outstanding_tasks()).sum()
    }

    /// Incoming tasks still held until ACKACK, summed over all peers
    pub fn incoming_work(&self) -> usize {
        self.nodes.all().iter().map(|n| n.incoming_work()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:7000".parse().unwrap()
    }

    fn core(retry_ms: u64) -> RpcCore {
        RpcCore::new(
            addr(),
            1,
            "test",
            Bytes::new(),
            None,
            None,
            Duration::from_millis(retry_ms),
        )
    }

    #[test]
    fn test_reply_encoding() {
        let ok = encode_reply(&Ok(Bytes::from_static(b"abc")));
        assert_eq!(decode_reply(ok, addr()).unwrap(), Bytes::from_static(b"abc"));

        let err = encode_reply(&Err(RillError::InternalError("boom".to_string())));
        match decode_reply(err, addr()) {
            Err(RillError::Remote { node, message }) => {
                assert_eq!(node, addr());
                assert!(message.contains("boom"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(decode_reply(Bytes::new(), addr()).is_err());
        assert!(decode_reply(Bytes::from_static(&[9]), addr()).is_err());
    }

    #[tokio::test]
    async fn test_finish_is_first_wins() {
        let core = core(200);
        assert!(core.finish(Ok(Bytes::from_static(b"x"))));
        assert!(!core.cancel("late"));
        assert_eq!(core.phase(), RpcPhase::Done);
        assert_eq!(core.wait().await.unwrap(), Bytes::from_static(b"x"));
    }

    #[tokio::test]
    async fn test_cancel_reports_cancelled() {
        let core = core(200);
        core.set_phase(RpcPhase::Sent);
        core.cancel("gone");
        assert_eq!(core.phase(), RpcPhase::Cancelled);
        // Terminal phases never move again
        core.set_phase(RpcPhase::Retrying);
        assert_eq!(core.phase(), RpcPhase::Cancelled);
        assert!(core.wait().await.unwrap_err().is_cancelled());
    }

    #[test]
    fn test_retry_backoff_is_capped() {
        let core = core(200);
        let max = Duration::from_millis(1000);
        let mut now = Instant::now();

        let (resend, _) = core.next_resend(now, max);
        assert!(!resend, "deadline not reached yet");

        let mut intervals = Vec::new();
        for _ in 0..5 {
            now = core.deadline();
            let (resend, deadline) = core.next_resend(now, max);
            assert!(resend);
            intervals.push((deadline - now).as_millis());
        }
        assert_eq!(intervals, vec![400, 800, 1000, 1000, 1000]);
        assert_eq!(core.resends(), 5);
    }

    #[test]
    fn test_nack_pushes_deadline() {
        let core = core(200);
        let now = Instant::now() + Duration::from_secs(1);
        let pushed = core.push_deadline(now);
        assert_eq!(pushed, now + Duration::from_millis(200));
        let (resend, _) = core.next_resend(now, Duration::from_secs(5));
        assert!(!resend);
    }

    #[test]
    fn test_ack_ack_hook_runs_once() {
        let call = RpcCall::new(4);
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = hits.clone();
        call.set_computed(
            Bytes::from_static(b"r"),
            Some(Box::new(move || {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            })),
            Duration::from_millis(200),
        );
        if let Some(hook) = call.mark_ack_acked() {
            hook();
        }
        assert!(call.mark_ack_acked().is_none());
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(call.is_ack_acked());
    }

    #[test]
    fn test_phase_terminal() {
        assert!(RpcPhase::Done.is_terminal());
        assert!(RpcPhase::Failed.is_terminal());
        assert!(!RpcPhase::AckAckSent.is_terminal());
    }
}
