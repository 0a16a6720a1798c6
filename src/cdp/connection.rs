//! Connection and command correlation
//!
//! The connection owns the duplex channel, allocates command ids,
//! correlates replies to pending calls, and fans every inbound event out
//! to its scopes (connection-wide, per-session, unscoped). The session
//! registry lives here too: targets attach and detach purely in response
//! to protocol events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use tokio::sync::oneshot;

use crate::cdp::transport::{self, InboundMessage, Transport, TransportReader};
use crate::cdp::types::{
    AttachedToTargetEvent, DetachedFromTargetEvent, TargetAttachToTarget, TargetCloseTarget,
    TargetCloseTargetResult, TargetCreateTarget, TargetCreateTargetResult, TargetCreatedEvent,
    TargetDestroyedEvent, TargetInfoChangedEvent, TargetSetDiscoverTargets,
};
use crate::error::{Error, Result};
use crate::events::{EventListeners, ListenerId, NotifyList, ProtocolEvent};
use crate::intercept::{InterceptorHandler, InterceptorList};
use crate::page::Page;
use crate::target::Target;
use crate::DriverConfig;

/// One command awaiting its reply. Created when the command is sent,
/// removed on reply, rejection, or timeout; ids are never reused while
/// outstanding.
struct PendingCommand {
    method: String,
    params: Value,
    session_id: Option<String>,
    tx: oneshot::Sender<Result<Value>>,
}

pub(crate) struct ConnectionInner {
    config: DriverConfig,
    next_id: AtomicU64,
    /// Guards the exactly-once failure fan-out
    open: AtomicBool,
    pending: Mutex<HashMap<u64, PendingCommand>>,
    sessions: Mutex<HashMap<String, Arc<Target>>>,
    transport: Mutex<Option<Arc<Transport>>>,
    reader_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    connect_gate: tokio::sync::Mutex<()>,
    events: EventListeners,
    connected_hooks: NotifyList,
    disconnected_hooks: NotifyList,
    global_interceptors: InterceptorList,
}

impl ConnectionInner {
    fn pending_table(&self) -> std::sync::MutexGuard<'_, HashMap<u64, PendingCommand>> {
        self.pending.lock().expect("pending table poisoned")
    }

    fn session_table(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Target>>> {
        self.sessions.lock().expect("session table poisoned")
    }

    fn current_transport(&self) -> Option<Arc<Transport>> {
        self.transport.lock().expect("transport slot poisoned").clone()
    }

    fn register_pending(
        &self,
        method: &str,
        params: &Value,
        session_id: Option<&str>,
    ) -> (u64, oneshot::Receiver<Result<Value>>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending_table().insert(
            id,
            PendingCommand {
                method: method.to_string(),
                params: params.clone(),
                session_id: session_id.map(String::from),
                tx,
            },
        );
        (id, rx)
    }

    fn take_pending(&self, id: u64) -> Option<PendingCommand> {
        self.pending_table().remove(&id)
    }

    /// Route a reply to the exact pending call with the matching id.
    /// Replies for already-settled ids are an expected race and dropped.
    fn resolve_reply(&self, id: u64, result: Value, error: Option<String>) {
        match self.take_pending(id) {
            Some(pending) => {
                let outcome = match error {
                    Some(message) => {
                        Err(Error::command_failed(pending.method, message, pending.params))
                    }
                    None => Ok(result),
                };
                let _ = pending.tx.send(outcome);
            }
            None => tracing::trace!(id, "reply for settled id dropped"),
        }
    }

    /// Reject every pending command scoped to one session
    fn reject_session_pending(&self, session_id: &str, make_error: impl Fn() -> Error) {
        let mut pending = self.pending_table();
        let ids: Vec<u64> = pending
            .iter()
            .filter(|(_, cmd)| cmd.session_id.as_deref() == Some(session_id))
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            if let Some(cmd) = pending.remove(&id) {
                let _ = cmd.tx.send(Err(make_error()));
            }
        }
    }

    /// Failure fan-out, run exactly once per connection: every pending
    /// command is rejected, the session table cleared, and the
    /// disconnected notification raised.
    fn handle_closed(&self, reason: &str) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("connection closed: {}", reason);
        self.transport.lock().expect("transport slot poisoned").take();
        let drained: Vec<PendingCommand> = {
            let mut pending = self.pending_table();
            pending.drain().map(|(_, cmd)| cmd).collect()
        };
        for cmd in drained {
            let _ = cmd.tx.send(Err(Error::Disconnected(reason.to_string())));
        }
        self.session_table().clear();
        self.disconnected_hooks.notify();
    }
}

/// A connection to one browser debugging endpoint.
///
/// Cheap to clone; all clones share the same channel, pending table and
/// session registry.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

/// Non-owning connection reference held by targets, pages and frames
#[derive(Debug, Clone)]
pub struct WeakConnection {
    inner: Weak<ConnectionInner>,
}

impl WeakConnection {
    pub(crate) fn upgrade(&self) -> Result<Connection> {
        self.inner
            .upgrade()
            .map(|inner| Connection { inner })
            .ok_or(Error::NotConnected)
    }

    /// A reference that never upgrades; state-machine tests use this
    #[allow(dead_code)]
    pub(crate) fn detached() -> Self {
        Self { inner: Weak::new() }
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new(DriverConfig::default())
    }
}

impl Connection {
    pub fn new(config: DriverConfig) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                config,
                next_id: AtomicU64::new(1),
                open: AtomicBool::new(false),
                pending: Mutex::new(HashMap::new()),
                sessions: Mutex::new(HashMap::new()),
                transport: Mutex::new(None),
                reader_task: Mutex::new(None),
                connect_gate: tokio::sync::Mutex::new(()),
                events: EventListeners::new(),
                connected_hooks: NotifyList::new(),
                disconnected_hooks: NotifyList::new(),
                global_interceptors: InterceptorList::new(),
            }),
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.inner.config
    }

    pub(crate) fn downgrade(&self) -> WeakConnection {
        WeakConnection {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// The connection-wide event scope
    pub fn events(&self) -> &EventListeners {
        &self.inner.events
    }

    /// Register a callback for the once-per-connect connected notification
    pub fn on_connected(&self, callback: Arc<dyn Fn() + Send + Sync>) -> ListenerId {
        self.inner.connected_hooks.add(callback)
    }

    /// Register a callback for the disconnected notification
    pub fn on_disconnected(&self, callback: Arc<dyn Fn() + Send + Sync>) -> ListenerId {
        self.inner.disconnected_hooks.add(callback)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    /// Establish the duplex channel. A no-op when already connected.
    ///
    /// The endpoint may be `host:port`, an `http://` URL (both resolved
    /// through /json/version) or a raw `ws://` URL.
    pub async fn connect(&self, endpoint: &str) -> Result<()> {
        let _gate = self.inner.connect_gate.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        let ws_url = transport::resolve_endpoint(endpoint).await?;
        let (transport, reader) = Transport::connect(&ws_url).await?;
        {
            let mut slot = self.inner.transport.lock().expect("transport slot poisoned");
            *slot = Some(transport);
        }
        self.inner.open.store(true, Ordering::SeqCst);

        let weak = self.downgrade();
        let task = tokio::spawn(read_loop(weak, reader));
        *self
            .inner
            .reader_task
            .lock()
            .expect("reader task slot poisoned") = Some(task);

        // Discovery drives the whole session registry: every created
        // target gets a fire-and-forget attach.
        self.send::<_, Value>(
            "Target.setDiscoverTargets",
            &TargetSetDiscoverTargets { discover: true },
        )
        .await?;

        tracing::info!("connected to {}", ws_url);
        self.inner.connected_hooks.notify();
        Ok(())
    }

    /// Tear the channel down and run the failure fan-out
    pub async fn disconnect(&self) {
        let transport = self.inner.current_transport();
        let Some(transport) = transport else {
            return;
        };
        transport.send_close().await;
        self.inner.handle_closed("disconnected by caller");
        let task = self
            .inner
            .reader_task
            .lock()
            .expect("reader task slot poisoned")
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }

    // ---------------------------------------------------------------------
    // Command correlation
    // ---------------------------------------------------------------------

    /// Send a command and await its typed reply
    pub async fn send<C, R>(&self, method: &str, params: &C) -> Result<R>
    where
        C: Serialize,
        R: DeserializeOwned,
    {
        let value = self
            .send_raw(
                method,
                serde_json::to_value(params)?,
                None,
                self.inner.config.command_timeout,
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Send a command scoped to a session and await its typed reply
    pub async fn send_to_session<C, R>(&self, session_id: &str, method: &str, params: &C) -> Result<R>
    where
        C: Serialize,
        R: DeserializeOwned,
    {
        let value = self
            .send_raw(
                method,
                serde_json::to_value(params)?,
                Some(session_id),
                self.inner.config.command_timeout,
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Send with an explicit per-call deadline
    pub async fn send_with_timeout<C, R>(
        &self,
        method: &str,
        params: &C,
        session_id: Option<&str>,
        timeout: Duration,
    ) -> Result<R>
    where
        C: Serialize,
        R: DeserializeOwned,
    {
        let value = self
            .send_raw(method, serde_json::to_value(params)?, session_id, timeout)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Fire a command without registering for its reply; a late reply is
    /// dropped on the floor as an unknown id
    pub async fn send_and_forget<C>(
        &self,
        method: &str,
        params: &C,
        session_id: Option<&str>,
    ) -> Result<()>
    where
        C: Serialize,
    {
        let transport = self.inner.current_transport().ok_or(Error::NotConnected)?;
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let mut message = json!({
            "id": id,
            "method": method,
            "params": serde_json::to_value(params)?,
        });
        if let Some(session_id) = session_id {
            message["sessionId"] = json!(session_id);
        }
        let data = serde_json::to_string(&message)?;
        if let Err(err) = transport.send_text(&data).await {
            self.inner.handle_closed("write on dead channel");
            return Err(err);
        }
        tracing::trace!(method, id, "command sent (no reply expected)");
        Ok(())
    }

    /// Untyped command path: allocate an id, register the pending entry,
    /// write the frame, await the reply until the deadline
    pub async fn send_raw(
        &self,
        method: &str,
        params: Value,
        session_id: Option<&str>,
        timeout: Duration,
    ) -> Result<Value> {
        let transport = self.inner.current_transport().ok_or(Error::NotConnected)?;
        let (id, rx) = self.inner.register_pending(method, &params, session_id);

        let mut message = json!({
            "id": id,
            "method": method,
            "params": params,
        });
        if let Some(session_id) = session_id {
            message["sessionId"] = json!(session_id);
        }
        let data = match serde_json::to_string(&message) {
            Ok(data) => data,
            Err(err) => {
                self.inner.take_pending(id);
                return Err(err.into());
            }
        };

        if let Err(err) = transport.send_text(&data).await {
            self.inner.take_pending(id);
            self.inner.handle_closed("write on dead channel");
            return Err(err);
        }
        tracing::trace!(method, id, session = ?session_id, "command sent");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::Disconnected("reply channel dropped".to_string())),
            Err(_) => {
                // The deadline was this command's alone; the entry goes,
                // nothing else is touched.
                self.inner.take_pending(id);
                Err(Error::CommandTimeout {
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    // ---------------------------------------------------------------------
    // Event demultiplexing and target lifecycle
    // ---------------------------------------------------------------------

    fn dispatch_event(&self, event: &ProtocolEvent) {
        self.handle_builtin(event);

        // (a) connection-wide scope, always
        self.inner.events.emit(event);

        // (b) the owning session's scope, (c) otherwise unscoped
        let target = event
            .session_id
            .as_deref()
            .and_then(|sid| self.get_target_by_session(sid));
        match target {
            Some(target) => target.events.emit(event),
            None => self.inner.events.emit_unscoped(event),
        }
    }

    fn handle_builtin(&self, event: &ProtocolEvent) {
        match event.method.as_str() {
            "Target.targetCreated" => {
                let Ok(ev) = serde_json::from_value::<TargetCreatedEvent>(event.params.clone())
                else {
                    return;
                };
                let target_id = ev.target_info.target_id;
                tracing::debug!(target_id = %target_id, kind = %ev.target_info.kind, "target created");
                let conn = self.clone();
                tokio::spawn(async move {
                    let attach = TargetAttachToTarget {
                        target_id: target_id.clone(),
                        flatten: Some(true),
                    };
                    if let Err(err) = conn
                        .send_and_forget("Target.attachToTarget", &attach, None)
                        .await
                    {
                        tracing::debug!(target_id = %target_id, "attach request failed: {}", err);
                    }
                });
            }
            "Target.attachedToTarget" => {
                let Ok(ev) = serde_json::from_value::<AttachedToTargetEvent>(event.params.clone())
                else {
                    return;
                };
                tracing::debug!(
                    session = %ev.session_id,
                    target_id = %ev.target_info.target_id,
                    "session attached"
                );
                let target = Target::new(self.downgrade(), ev.session_id.clone(), ev.target_info);
                self.inner.session_table().insert(ev.session_id, target);
            }
            "Target.detachedFromTarget" => {
                let Ok(ev) =
                    serde_json::from_value::<DetachedFromTargetEvent>(event.params.clone())
                else {
                    return;
                };
                self.remove_session(&ev.session_id);
            }
            "Target.targetDestroyed" => {
                let Ok(ev) = serde_json::from_value::<TargetDestroyedEvent>(event.params.clone())
                else {
                    return;
                };
                let session_id = self
                    .get_target(&ev.target_id)
                    .map(|target| target.session_id().to_string());
                if let Some(session_id) = session_id {
                    self.remove_session(&session_id);
                }
            }
            "Target.targetInfoChanged" => {
                // Refresh failures are ignored; the next change retries
                // naturally.
                let Ok(ev) = serde_json::from_value::<TargetInfoChangedEvent>(event.params.clone())
                else {
                    return;
                };
                if let Some(target) = self.get_target(&ev.target_info.target_id) {
                    target.update_info(ev.target_info);
                }
            }
            "Inspector.targetCrashed" => {
                let Some(session_id) = event.session_id.as_deref() else {
                    return;
                };
                if let Some(target) = self.get_target_by_session(session_id) {
                    target.mark_crashed();
                    let session = session_id.to_string();
                    self.inner
                        .reject_session_pending(session_id, || Error::TargetCrashed(session.clone()));
                }
            }
            _ => {}
        }
    }

    fn remove_session(&self, session_id: &str) {
        let removed = self.inner.session_table().remove(session_id);
        if removed.is_some() {
            tracing::debug!(session = session_id, "session detached");
            let session = session_id.to_string();
            self.inner
                .reject_session_pending(session_id, || Error::TargetDetached(session.clone()));
        }
    }

    // ---------------------------------------------------------------------
    // Session registry API
    // ---------------------------------------------------------------------

    /// Look a target up by its session id
    pub fn get_target_by_session(&self, session_id: &str) -> Option<Arc<Target>> {
        self.inner.session_table().get(session_id).cloned()
    }

    /// Linear-scan helper: look a target up by its target id
    pub fn get_target(&self, target_id: &str) -> Option<Arc<Target>> {
        self.inner
            .session_table()
            .values()
            .find(|target| target.target_id() == target_id)
            .cloned()
    }

    /// All currently attached targets
    pub fn attached_targets(&self) -> Vec<Arc<Target>> {
        self.inner.session_table().values().cloned().collect()
    }

    /// Poll until a created target has completed its attach.
    ///
    /// Target creation and attach completion are separate, non-atomically
    /// ordered events, so this is a bounded polling loop by design.
    pub async fn wait_for_target(&self, target_id: &str) -> Result<Arc<Target>> {
        let budget = self.inner.config.attach_timeout;
        let poll = self.inner.config.attach_poll_interval;
        let started = tokio::time::Instant::now();
        loop {
            if let Some(target) = self.get_target(target_id) {
                return Ok(target);
            }
            if started.elapsed() >= budget {
                return Err(Error::AttachTimeout {
                    target_id: target_id.to_string(),
                    timeout_ms: budget.as_millis() as u64,
                });
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// The Page bound to a target, created lazily and cached
    pub async fn get_page_for_target(&self, target_id: &str) -> Result<Arc<Page>> {
        let target = self
            .get_target(target_id)
            .ok_or_else(|| Error::InvalidTarget(target_id.to_string()))?;
        target.page().await
    }

    /// Pages for every currently valid page target
    pub async fn attached_pages(&self) -> Result<Vec<Arc<Page>>> {
        let targets: Vec<Arc<Target>> = self
            .attached_targets()
            .into_iter()
            .filter(|target| target.is_valid_page())
            .collect();
        let mut pages = Vec::with_capacity(targets.len());
        for target in targets {
            pages.push(target.page().await?);
        }
        Ok(pages)
    }

    /// Open a new tab at the given URL and wait for its attach
    pub async fn new_tab(&self, url: &str) -> Result<Arc<Page>> {
        let created: TargetCreateTargetResult = self
            .send(
                "Target.createTarget",
                &TargetCreateTarget {
                    url: url.to_string(),
                },
            )
            .await?;
        let target = self.wait_for_target(&created.target_id).await?;
        target.page().await
    }

    /// Close every page-type target
    pub async fn close_all_tabs(&self) -> Result<()> {
        let page_targets: Vec<Arc<Target>> = self
            .attached_targets()
            .into_iter()
            .filter(|target| target.kind() == "page")
            .collect();
        for target in page_targets {
            let _: TargetCloseTargetResult = self
                .send(
                    "Target.closeTarget",
                    &TargetCloseTarget {
                        target_id: target.target_id(),
                    },
                )
                .await?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Global interception
    // ---------------------------------------------------------------------

    /// Register a global request interceptor; returns its removal id
    pub fn intercept_requests(&self, label: Option<&str>, handler: InterceptorHandler) -> u64 {
        self.inner.global_interceptors.add(label, handler)
    }

    /// Remove global interceptors by label, or all of them
    pub fn clear_interceptors(&self, label: Option<&str>) {
        self.inner.global_interceptors.remove(label);
    }

    pub(crate) fn global_interceptors(&self) -> &InterceptorList {
        &self.inner.global_interceptors
    }
}

/// The single reader task: inbound frames are processed one at a time,
/// in arrival order; replies resolve pending calls, events are fanned
/// out synchronously before the next frame is read.
async fn read_loop(conn: WeakConnection, mut reader: TransportReader) {
    while let Some(message) = reader.next().await {
        let Ok(conn) = conn.upgrade() else {
            return;
        };
        match message {
            InboundMessage::Reply { id, result, error } => {
                conn.inner.resolve_reply(id, result, error)
            }
            InboundMessage::Event(event) => conn.dispatch_event(&event),
        }
    }
    if let Ok(conn) = conn.upgrade() {
        conn.inner.handle_closed("transport closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn connection() -> Connection {
        Connection::new(DriverConfig::default())
    }

    /// Pretend the channel is up without a real transport
    fn force_open(conn: &Connection) {
        conn.inner.open.store(true, Ordering::SeqCst);
    }

    fn attach_event(session_id: &str, target_id: &str, kind: &str, url: &str) -> ProtocolEvent {
        ProtocolEvent {
            method: "Target.attachedToTarget".to_string(),
            params: json!({
                "sessionId": session_id,
                "targetInfo": {
                    "targetId": target_id,
                    "type": kind,
                    "title": "",
                    "url": url,
                    "attached": true
                },
                "waitingForDebugger": false
            }),
            session_id: None,
        }
    }

    #[tokio::test]
    async fn replies_resolve_exactly_their_own_pending_call() {
        let conn = connection();
        let (id_a, rx_a) = conn.inner.register_pending("A.a", &json!({"n": 1}), None);
        let (id_b, rx_b) = conn.inner.register_pending("B.b", &json!({"n": 2}), None);
        let (id_c, rx_c) = conn.inner.register_pending("C.c", &json!({"n": 3}), None);

        // Replies interleave in an arbitrary order
        conn.inner.resolve_reply(id_b, json!({"from": "b"}), None);
        conn.inner.resolve_reply(id_c, json!({"from": "c"}), None);
        conn.inner.resolve_reply(id_a, json!({"from": "a"}), None);

        assert_eq!(rx_a.await.unwrap().unwrap()["from"], "a");
        assert_eq!(rx_b.await.unwrap().unwrap()["from"], "b");
        assert_eq!(rx_c.await.unwrap().unwrap()["from"], "c");
        assert!(conn.inner.pending_table().is_empty());
    }

    #[tokio::test]
    async fn error_reply_carries_method_and_params() {
        let conn = connection();
        let (id, rx) = conn
            .inner
            .register_pending("Page.navigate", &json!({"url": "x"}), Some("sess-1"));
        conn.inner
            .resolve_reply(id, json!({}), Some("Cannot navigate".to_string()));

        let err = rx.await.unwrap().unwrap_err();
        match err {
            Error::CommandFailed { method, params, .. } => {
                assert_eq!(method, "Page.navigate");
                assert_eq!(params["url"], "x");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn late_replies_are_dropped_silently() {
        let conn = connection();
        conn.inner.resolve_reply(9999, json!({}), None);

        let (id, rx) = conn.inner.register_pending("A.a", &json!({}), None);
        conn.inner.take_pending(id); // timed out meanwhile
        conn.inner.resolve_reply(id, json!({}), None); // late reply, dropped
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn a_timed_out_command_does_not_affect_others() {
        let conn = connection();
        let (id_a, rx_a) = conn.inner.register_pending("A.a", &json!({}), None);
        let (id_b, rx_b) = conn.inner.register_pending("B.b", &json!({}), None);

        // A's deadline fires: only its entry is removed
        conn.inner.take_pending(id_a);
        assert!(rx_a.await.is_err());

        conn.inner.resolve_reply(id_b, json!({"ok": true}), None);
        assert_eq!(rx_b.await.unwrap().unwrap()["ok"], true);
    }

    #[tokio::test]
    async fn disconnect_rejects_every_pending_command_once() {
        let conn = connection();
        force_open(&conn);
        let disconnects = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&disconnects);
        conn.on_disconnected(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let receivers: Vec<_> = (0..5)
            .map(|i| conn.inner.register_pending("X.y", &json!({"i": i}), None).1)
            .collect();

        conn.inner.handle_closed("reader gone");
        for rx in receivers {
            let err = rx.await.unwrap().unwrap_err();
            assert!(matches!(err, Error::Disconnected(_)));
            assert!(err.is_retriable());
        }
        assert!(conn.inner.pending_table().is_empty());

        // A second close is a no-op
        conn.inner.handle_closed("again");
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn attach_event_registers_a_session() {
        let conn = connection();
        conn.dispatch_event(&attach_event("sess-1", "t-1", "page", "https://example.com"));

        let target = conn.get_target_by_session("sess-1").expect("registered");
        assert_eq!(target.target_id(), "t-1");
        assert!(Arc::ptr_eq(&target, &conn.get_target("t-1").unwrap()));
        assert_eq!(conn.attached_targets().len(), 1);
    }

    #[tokio::test]
    async fn detach_rejects_only_that_sessions_pending_commands() {
        let conn = connection();
        conn.dispatch_event(&attach_event("sess-1", "t-1", "page", "https://example.com"));

        let (_, rx_scoped) = conn
            .inner
            .register_pending("DOM.getDocument", &json!({}), Some("sess-1"));
        let (id_other, rx_other) = conn.inner.register_pending("Browser.x", &json!({}), None);

        conn.dispatch_event(&ProtocolEvent {
            method: "Target.detachedFromTarget".to_string(),
            params: json!({"sessionId": "sess-1"}),
            session_id: None,
        });

        let err = rx_scoped.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::TargetDetached(_)));
        assert!(err.is_retriable());
        assert!(conn.get_target_by_session("sess-1").is_none());

        conn.inner.resolve_reply(id_other, json!({}), None);
        assert!(rx_other.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn target_destroyed_removes_the_session_by_target_id() {
        let conn = connection();
        conn.dispatch_event(&attach_event("sess-1", "t-1", "page", "https://example.com"));
        conn.dispatch_event(&ProtocolEvent {
            method: "Target.targetDestroyed".to_string(),
            params: json!({"targetId": "t-1"}),
            session_id: None,
        });
        assert!(conn.get_target("t-1").is_none());
    }

    #[tokio::test]
    async fn crash_rejects_pending_but_keeps_the_session() {
        let conn = connection();
        conn.dispatch_event(&attach_event("sess-1", "t-1", "page", "https://example.com"));
        let (_, rx) = conn
            .inner
            .register_pending("Runtime.evaluate", &json!({}), Some("sess-1"));

        conn.dispatch_event(&ProtocolEvent {
            method: "Inspector.targetCrashed".to_string(),
            params: json!({}),
            session_id: Some("sess-1".to_string()),
        });

        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::TargetCrashed(_)));
        assert!(!err.is_retriable());

        // Removal still requires an explicit detach
        let target = conn.get_target_by_session("sess-1").expect("still registered");
        assert!(target.is_crashed());
    }

    #[tokio::test]
    async fn info_changed_refreshes_the_target_snapshot() {
        let conn = connection();
        conn.dispatch_event(&attach_event("sess-1", "t-1", "page", "about:blank"));
        conn.dispatch_event(&ProtocolEvent {
            method: "Target.targetInfoChanged".to_string(),
            params: json!({
                "targetInfo": {
                    "targetId": "t-1",
                    "type": "page",
                    "title": "Example",
                    "url": "https://example.com",
                    "attached": true
                }
            }),
            session_id: None,
        });
        assert_eq!(conn.get_target("t-1").unwrap().url(), "https://example.com");
    }

    #[tokio::test]
    async fn events_route_to_session_scope_or_unscoped() {
        let conn = connection();
        conn.dispatch_event(&attach_event("sess-1", "t-1", "page", "https://example.com"));
        let target = conn.get_target_by_session("sess-1").unwrap();

        let scoped = Arc::new(AtomicUsize::new(0));
        let unscoped = Arc::new(AtomicUsize::new(0));
        {
            let scoped = Arc::clone(&scoped);
            target.events.on_method("Page.loadEventFired", Arc::new(move |_| {
                scoped.fetch_add(1, Ordering::SeqCst);
            }));
        }
        {
            let unscoped = Arc::clone(&unscoped);
            conn.events().on_unscoped(Arc::new(move |_| {
                unscoped.fetch_add(1, Ordering::SeqCst);
            }));
        }

        // Matching session: session scope only
        conn.dispatch_event(&ProtocolEvent {
            method: "Page.loadEventFired".to_string(),
            params: json!({}),
            session_id: Some("sess-1".to_string()),
        });
        assert_eq!(scoped.load(Ordering::SeqCst), 1);
        assert_eq!(unscoped.load(Ordering::SeqCst), 0);

        // Unknown session: unscoped bucket
        conn.dispatch_event(&ProtocolEvent {
            method: "Page.loadEventFired".to_string(),
            params: json!({}),
            session_id: Some("sess-gone".to_string()),
        });
        assert_eq!(scoped.load(Ordering::SeqCst), 1);
        assert_eq!(unscoped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn connection_scope_sees_method_and_namespace() {
        let conn = connection();
        let by_method = Arc::new(AtomicUsize::new(0));
        let by_namespace = Arc::new(AtomicUsize::new(0));
        {
            let c = Arc::clone(&by_method);
            conn.events().on_method("Network.responseReceived", Arc::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }));
        }
        {
            let c = Arc::clone(&by_namespace);
            conn.events().on_namespace("Network", Arc::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }));
        }

        conn.dispatch_event(&ProtocolEvent {
            method: "Network.responseReceived".to_string(),
            params: json!({}),
            session_id: None,
        });
        conn.dispatch_event(&ProtocolEvent {
            method: "Network.requestWillBeSent".to_string(),
            params: json!({}),
            session_id: None,
        });
        assert_eq!(by_method.load(Ordering::SeqCst), 1);
        assert_eq!(by_namespace.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_target_times_out_with_a_retriable_error() {
        let conn = connection();
        let err = conn.wait_for_target("t-missing").await.unwrap_err();
        assert!(matches!(err, Error::AttachTimeout { .. }));
        assert!(err.is_retriable());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_target_finds_a_late_attach() {
        let conn = connection();
        {
            let conn = conn.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                conn.dispatch_event(&attach_event("sess-1", "t-1", "page", "https://example.com"));
            });
        }
        let target = conn.wait_for_target("t-1").await.unwrap();
        assert_eq!(target.session_id(), "sess-1");
    }

    #[tokio::test]
    async fn send_without_a_connection_fails_fast() {
        let conn = connection();
        let err = conn
            .send::<_, Value>("Browser.getVersion", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected));
        assert!(err.is_retriable());
    }
}
