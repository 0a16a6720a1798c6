//! Frame tree reconstruction and navigation state
//!
//! The frame manager rebuilds a page's frame tree purely from the event
//! stream (attach / navigate / detach), tracks each frame's navigation
//! state machine and its current scripting context, and correlates the
//! frame's own document load with network events. Frames are owned by the
//! manager's id-keyed table; parent links are non-owning id references.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::cdp::connection::WeakConnection;
use crate::cdp::types::{
    ExecutionContextDescription, FramePayload, FrameTreeNode, LoadingFailedEvent, NetworkResponse,
    RequestWillBeSentEvent, ResponseReceivedEvent,
};
use crate::context::{EvalArg, RemoteHandle, ScriptingContext};
use crate::error::{Error, Result};
use crate::DriverConfig;

/// Which navigation state a caller is waiting on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitState {
    Ready,
    Loaded,
}

/// Options for one lifecycle wait
#[derive(Debug, Clone)]
pub struct WaitOptions {
    /// Deadline for the wait
    pub timeout: Duration,
    /// Resolve instead of rejecting when the deadline expires
    pub tolerate_timeout: bool,
    /// Suppress rejection on HTTP error status
    pub ignore_http_errors: bool,
    /// Suppress rejection on network-level load failure
    pub ignore_network_errors: bool,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            tolerate_timeout: false,
            ignore_http_errors: false,
            ignore_network_errors: false,
        }
    }
}

impl WaitOptions {
    pub fn from_config(config: &DriverConfig) -> Self {
        Self {
            timeout: config.navigation_timeout,
            tolerate_timeout: config.tolerate_navigation_timeout,
            ignore_http_errors: config.ignore_http_errors,
            ignore_network_errors: config.ignore_network_errors,
        }
    }
}

/// What a waiter sees when its notification fires
#[derive(Debug, Clone)]
struct WaitSnapshot {
    frame_id: String,
    status: Option<i64>,
    failed: bool,
    error_text: Option<String>,
}

struct FrameState {
    id: String,
    parent_id: Option<String>,
    child_ids: Vec<String>,
    url: String,
    security_origin: String,
    mime_type: String,
    ready: bool,
    loaded: bool,
    failed: bool,
    request_id: Option<String>,
    post_data: Option<String>,
    response: Option<NetworkResponse>,
    error_text: Option<String>,
    context_id: Option<i64>,
    document: Option<RemoteHandle>,
    ready_waiters: Vec<oneshot::Sender<WaitSnapshot>>,
    loaded_waiters: Vec<oneshot::Sender<WaitSnapshot>>,
}

impl FrameState {
    fn snapshot(&self) -> WaitSnapshot {
        WaitSnapshot {
            frame_id: self.id.clone(),
            status: self.response.as_ref().map(|r| r.status),
            failed: self.failed,
            error_text: self.error_text.clone(),
        }
    }
}

/// One node of the page's frame tree.
///
/// Identity is stable across navigation, including cross-process
/// navigation where the backing id changes; listeners and waiters stay
/// with the frame.
pub struct Frame {
    conn: WeakConnection,
    session_id: String,
    state: Mutex<FrameState>,
}

impl Frame {
    fn new(
        conn: WeakConnection,
        session_id: String,
        id: String,
        parent_id: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            conn,
            session_id,
            state: Mutex::new(FrameState {
                id,
                parent_id,
                child_ids: Vec::new(),
                url: String::new(),
                security_origin: String::new(),
                mime_type: String::new(),
                ready: false,
                loaded: false,
                failed: false,
                request_id: None,
                post_data: None,
                response: None,
                error_text: None,
                context_id: None,
                document: None,
                ready_waiters: Vec::new(),
                loaded_waiters: Vec::new(),
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FrameState> {
        self.state.lock().expect("frame state poisoned")
    }

    /// The frame's current backing id
    pub fn id(&self) -> String {
        self.lock().id.clone()
    }

    /// Id of the parent frame; None for the tree root
    pub fn parent_id(&self) -> Option<String> {
        self.lock().parent_id.clone()
    }

    /// Ids of the current child frames
    pub fn child_ids(&self) -> Vec<String> {
        self.lock().child_ids.clone()
    }

    pub fn url(&self) -> String {
        self.lock().url.clone()
    }

    pub fn security_origin(&self) -> String {
        self.lock().security_origin.clone()
    }

    pub fn mime_type(&self) -> String {
        self.lock().mime_type.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.lock().ready
    }

    pub fn is_loaded(&self) -> bool {
        self.lock().loaded
    }

    pub fn is_failed(&self) -> bool {
        self.lock().failed
    }

    /// Response metadata for the frame's own document load, if observed
    pub fn response(&self) -> Option<NetworkResponse> {
        self.lock().response.clone()
    }

    /// Network error text for the frame's own document load, if any
    pub fn error_text(&self) -> Option<String> {
        self.lock().error_text.clone()
    }

    /// Post data recorded for the frame's own document request, if any
    pub fn post_data(&self) -> Option<String> {
        self.lock().post_data.clone()
    }

    /// The frame's current scripting context
    pub fn context(&self) -> Result<ScriptingContext> {
        let state = self.lock();
        match state.context_id {
            Some(context_id) => Ok(ScriptingContext::new(
                self.conn.clone(),
                self.session_id.clone(),
                state.id.clone(),
                context_id,
            )),
            None => Err(Error::NoContext(state.id.clone())),
        }
    }

    /// Evaluate an expression in the frame's current context.
    ///
    /// Any evaluation failure conservatively invalidates the cached
    /// document handle; the context itself may still be fine.
    pub async fn evaluate(&self, expression: &str, args: &[EvalArg]) -> Result<serde_json::Value> {
        let context = self.context()?;
        match context.evaluate(expression, args).await {
            Ok(value) => Ok(value),
            Err(err) => {
                self.invalidate_document();
                Err(err)
            }
        }
    }

    /// Evaluate and deserialize into a caller type
    pub async fn evaluate_as_json<T: serde::de::DeserializeOwned>(
        &self,
        expression: &str,
        args: &[EvalArg],
    ) -> Result<T> {
        let context = self.context()?;
        match context.evaluate_as_json(expression, args).await {
            Ok(value) => Ok(value),
            Err(err) => {
                self.invalidate_document();
                Err(err)
            }
        }
    }

    /// Evaluate an expression expected to yield a single element
    pub async fn evaluate_element(
        &self,
        expression: &str,
        args: &[EvalArg],
    ) -> Result<RemoteHandle> {
        let context = self.context()?;
        match context.evaluate_element(expression, args).await {
            Ok(handle) => Ok(handle),
            Err(err) => {
                self.invalidate_document();
                Err(err)
            }
        }
    }

    /// Evaluate an expression expected to yield a list of elements
    pub async fn evaluate_element_list(
        &self,
        expression: &str,
        args: &[EvalArg],
    ) -> Result<Vec<RemoteHandle>> {
        let context = self.context()?;
        match context.evaluate_element_list(expression, args).await {
            Ok(handles) => Ok(handles),
            Err(err) => {
                self.invalidate_document();
                Err(err)
            }
        }
    }

    /// Handle to the frame's document, cached until invalidated
    pub async fn document(&self) -> Result<RemoteHandle> {
        if let Some(document) = self.lock().document.clone() {
            return Ok(document);
        }
        let context = self.context()?;
        match context.document().await {
            Ok(document) => {
                self.lock().document = Some(document.clone());
                Ok(document)
            }
            Err(err) => Err(err),
        }
    }

    fn invalidate_document(&self) {
        self.lock().document = None;
    }

    /// Wait until the frame reached `ready` (DOMContentLoaded)
    pub async fn wait_for_ready(&self, opts: &WaitOptions) -> Result<()> {
        self.wait_for(WaitState::Ready, opts).await
    }

    /// Wait until the frame reached `loaded` (load event)
    pub async fn wait_for_loaded(&self, opts: &WaitOptions) -> Result<()> {
        self.wait_for(WaitState::Loaded, opts).await
    }

    async fn wait_for(&self, kind: WaitState, opts: &WaitOptions) -> Result<()> {
        let rx = {
            let mut state = self.lock();
            let holds = match kind {
                WaitState::Ready => state.ready,
                WaitState::Loaded => state.loaded,
            };
            if holds {
                // State already reached: resolve now without subscribing,
                // so a later notification cannot double-resolve.
                let snapshot = state.snapshot();
                drop(state);
                return judge(&snapshot, opts);
            }
            let (tx, rx) = oneshot::channel();
            match kind {
                WaitState::Ready => state.ready_waiters.push(tx),
                WaitState::Loaded => state.loaded_waiters.push(tx),
            }
            rx
        };

        match tokio::time::timeout(opts.timeout, rx).await {
            Ok(Ok(snapshot)) => judge(&snapshot, opts),
            // Waiters are dropped when the frame leaves the tree
            Ok(Err(_)) => Err(Error::FrameNotFound(self.id())),
            Err(_) if opts.tolerate_timeout => Ok(()),
            Err(_) => Err(Error::NavigationTimeout {
                frame_id: self.id(),
                timeout_ms: opts.timeout.as_millis() as u64,
            }),
        }
    }

    // ---------------------------------------------------------------------
    // State transitions, driven by the manager
    // ---------------------------------------------------------------------

    fn navigated(&self, payload: &FramePayload) {
        let mut state = self.lock();
        state.url = payload.url.clone();
        state.security_origin = payload.security_origin.clone();
        state.mime_type = payload.mime_type.clone();
        state.failed = payload.unreachable_url.is_some();
        state.ready = false;
        state.loaded = false;
        state.document = None;
    }

    fn on_lifecycle(&self, name: &str) {
        let (ready_waiters, loaded_waiters, snapshot) = {
            let mut state = self.lock();
            match name {
                "init" => {
                    state.ready = false;
                    state.loaded = false;
                    return;
                }
                "DOMContentLoaded" => {
                    state.ready = true;
                    let waiters = std::mem::take(&mut state.ready_waiters);
                    (waiters, Vec::new(), state.snapshot())
                }
                "load" => {
                    state.ready = true;
                    state.loaded = true;
                    let ready = std::mem::take(&mut state.ready_waiters);
                    let loaded = std::mem::take(&mut state.loaded_waiters);
                    (ready, loaded, state.snapshot())
                }
                _ => return,
            }
        };
        // ready notifications strictly before loaded notifications
        for tx in ready_waiters {
            let _ = tx.send(snapshot.clone());
        }
        for tx in loaded_waiters {
            let _ = tx.send(snapshot.clone());
        }
    }

    /// Fallback for loads whose lifecycle events are suppressed
    fn force_loaded(&self) {
        let (ready_waiters, loaded_waiters, snapshot) = {
            let mut state = self.lock();
            state.ready = true;
            state.loaded = true;
            let ready = std::mem::take(&mut state.ready_waiters);
            let loaded = std::mem::take(&mut state.loaded_waiters);
            (ready, loaded, state.snapshot())
        };
        for tx in ready_waiters {
            let _ = tx.send(snapshot.clone());
        }
        for tx in loaded_waiters {
            let _ = tx.send(snapshot.clone());
        }
    }

    #[cfg(test)]
    fn waiter_counts(&self) -> (usize, usize) {
        let state = self.lock();
        (state.ready_waiters.len(), state.loaded_waiters.len())
    }
}

fn judge(snapshot: &WaitSnapshot, opts: &WaitOptions) -> Result<()> {
    if !opts.ignore_http_errors {
        if let Some(status) = snapshot.status {
            if status >= 400 {
                return Err(Error::http_failure(&snapshot.frame_id, status));
            }
        }
    }
    if !opts.ignore_network_errors && snapshot.failed {
        return Err(Error::net_failure(
            &snapshot.frame_id,
            snapshot
                .error_text
                .clone()
                .unwrap_or_else(|| "unreachable URL".to_string()),
        ));
    }
    Ok(())
}

/// Rebuilds one page's frame tree from the event stream
pub struct FrameManager {
    conn: WeakConnection,
    session_id: String,
    frames: Mutex<HashMap<String, Arc<Frame>>>,
    main_frame_id: Mutex<Option<String>>,
}

impl FrameManager {
    pub(crate) fn new(conn: WeakConnection, session_id: String) -> Self {
        Self {
            conn,
            session_id,
            frames: Mutex::new(HashMap::new()),
            main_frame_id: Mutex::new(None),
        }
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Frame>>> {
        self.frames.lock().expect("frame table poisoned")
    }

    /// The tree root, once known
    pub fn main_frame(&self) -> Option<Arc<Frame>> {
        let main_id = self
            .main_frame_id
            .lock()
            .expect("main frame id poisoned")
            .clone()?;
        self.table().get(&main_id).cloned()
    }

    /// Look a frame up by its current backing id
    pub fn frame(&self, frame_id: &str) -> Option<Arc<Frame>> {
        self.table().get(frame_id).cloned()
    }

    /// All frames currently in the tree
    pub fn frames(&self) -> Vec<Arc<Frame>> {
        self.table().values().cloned().collect()
    }

    /// Replay an initial frame-tree snapshot through the normal handlers
    pub(crate) fn seed(&self, node: &FrameTreeNode) {
        self.on_frame_navigated(&node.frame);
        for child in &node.child_frames {
            self.seed_subtree(child, &node.frame.id);
        }
    }

    fn seed_subtree(&self, node: &FrameTreeNode, parent_id: &str) {
        self.on_frame_attached(&node.frame.id, parent_id);
        self.on_frame_navigated(&node.frame);
        for child in &node.child_frames {
            self.seed_subtree(child, &node.frame.id);
        }
    }

    /// Register a new frame under a parent; re-attaching a known id is a
    /// no-op returning the existing frame
    pub(crate) fn on_frame_attached(&self, frame_id: &str, parent_frame_id: &str) -> Arc<Frame> {
        let mut frames = self.table();
        if let Some(existing) = frames.get(frame_id) {
            return Arc::clone(existing);
        }
        let frame = Frame::new(
            self.conn.clone(),
            self.session_id.clone(),
            frame_id.to_string(),
            Some(parent_frame_id.to_string()),
        );
        frames.insert(frame_id.to_string(), Arc::clone(&frame));
        if let Some(parent) = frames.get(parent_frame_id) {
            parent.lock().child_ids.push(frame_id.to_string());
        }
        tracing::trace!(frame = frame_id, parent = parent_frame_id, "frame attached");
        frame
    }

    pub(crate) fn on_frame_navigated(&self, payload: &FramePayload) {
        let is_main = payload.parent_id.is_none();
        let frame = {
            let mut frames = self.table();
            if let Some(existing) = frames.get(&payload.id) {
                Arc::clone(existing)
            } else if is_main {
                let mut main_id = self.main_frame_id.lock().expect("main frame id poisoned");
                let current_root = main_id.as_ref().and_then(|id| frames.get(id).cloned());
                match current_root {
                    Some(root) => {
                        // Cross-process navigation: the logical root keeps
                        // its identity but arrives under a new backing id.
                        let old_id = root.lock().id.clone();
                        frames.remove(&old_id);
                        root.lock().id = payload.id.clone();
                        frames.insert(payload.id.clone(), Arc::clone(&root));
                        *main_id = Some(payload.id.clone());
                        tracing::debug!(old = %old_id, new = %payload.id, "main frame re-keyed");
                        root
                    }
                    None => {
                        let frame = Frame::new(
                            self.conn.clone(),
                            self.session_id.clone(),
                            payload.id.clone(),
                            None,
                        );
                        frames.insert(payload.id.clone(), Arc::clone(&frame));
                        *main_id = Some(payload.id.clone());
                        frame
                    }
                }
            } else {
                // Unknown id with a parent: implicit attach, then navigate
                let parent_id = payload.parent_id.clone().unwrap_or_default();
                let frame = Frame::new(
                    self.conn.clone(),
                    self.session_id.clone(),
                    payload.id.clone(),
                    Some(parent_id.clone()),
                );
                frames.insert(payload.id.clone(), Arc::clone(&frame));
                if let Some(parent) = frames.get(&parent_id) {
                    parent.lock().child_ids.push(payload.id.clone());
                }
                frame
            }
        };

        // A navigation invalidates the previous document's child frames
        self.detach_children(&payload.id);
        frame.navigated(payload);
        tracing::trace!(frame = %payload.id, url = %payload.url, "frame navigated");
    }

    fn detach_children(&self, frame_id: &str) {
        let mut frames = self.table();
        let mut worklist: Vec<String> = match frames.get(frame_id) {
            Some(frame) => frame.lock().child_ids.drain(..).collect(),
            None => return,
        };
        while let Some(id) = worklist.pop() {
            if let Some(frame) = frames.remove(&id) {
                let mut state = frame.lock();
                worklist.extend(state.child_ids.drain(..));
                // Dropping the senders wakes any waiter with an error
                state.ready_waiters.clear();
                state.loaded_waiters.clear();
            }
        }
    }

    /// Remove a frame and all its descendants from the tree
    pub(crate) fn on_frame_detached(&self, frame_id: &str) {
        {
            let mut frames = self.table();
            let parent_id = frames
                .get(frame_id)
                .and_then(|frame| frame.lock().parent_id.clone());
            if let Some(parent_id) = parent_id {
                if let Some(parent) = frames.get(&parent_id) {
                    parent.lock().child_ids.retain(|id| id != frame_id);
                }
            }
            let mut worklist = vec![frame_id.to_string()];
            while let Some(id) = worklist.pop() {
                if let Some(frame) = frames.remove(&id) {
                    let mut state = frame.lock();
                    worklist.extend(state.child_ids.drain(..));
                    state.ready_waiters.clear();
                    state.loaded_waiters.clear();
                }
            }
        }
        let mut main_id = self.main_frame_id.lock().expect("main frame id poisoned");
        if main_id.as_deref() == Some(frame_id) {
            *main_id = None;
        }
        tracing::trace!(frame = frame_id, "frame detached");
    }

    pub(crate) fn on_lifecycle_event(&self, frame_id: &str, name: &str) {
        if let Some(frame) = self.frame(frame_id) {
            frame.on_lifecycle(name);
        }
    }

    pub(crate) fn on_frame_stopped_loading(&self, frame_id: &str) {
        if let Some(frame) = self.frame(frame_id) {
            frame.force_loaded();
        }
    }

    // ---------------------------------------------------------------------
    // Network correlation: only the frame's own Document load is tracked
    // ---------------------------------------------------------------------

    pub(crate) fn on_request_will_be_sent(&self, event: &RequestWillBeSentEvent) {
        if event.resource_type.as_deref() != Some("Document") {
            return;
        }
        let Some(frame_id) = event.frame_id.as_deref() else {
            return;
        };
        if let Some(frame) = self.frame(frame_id) {
            let mut state = frame.lock();
            state.request_id = Some(event.request_id.clone());
            state.response = None;
            state.error_text = None;
            state.post_data = event.request.post_data.clone();
        }
    }

    pub(crate) fn on_response_received(&self, event: &ResponseReceivedEvent) {
        let Some(frame_id) = event.frame_id.as_deref() else {
            return;
        };
        if let Some(frame) = self.frame(frame_id) {
            let mut state = frame.lock();
            // A response for a superseded request is stale; discard it
            if state.request_id.as_deref() == Some(&event.request_id) {
                state.response = Some(event.response.clone());
            }
        }
    }

    pub(crate) fn on_loading_failed(&self, event: &LoadingFailedEvent) {
        let frames = self.table();
        for frame in frames.values() {
            let mut state = frame.lock();
            if state.request_id.as_deref() == Some(&event.request_id) {
                state.error_text = Some(event.error_text.clone());
            }
        }
    }

    // ---------------------------------------------------------------------
    // Scripting context lifecycle
    // ---------------------------------------------------------------------

    pub(crate) fn on_context_created(&self, description: &ExecutionContextDescription) {
        if !description.is_default() {
            return;
        }
        let Some(frame_id) = description.frame_id() else {
            return;
        };
        if let Some(frame) = self.frame(frame_id) {
            let mut state = frame.lock();
            // A new default context supersedes the old one outright
            state.context_id = Some(description.id);
            state.document = None;
        }
    }

    pub(crate) fn on_context_destroyed(&self, context_id: i64) {
        let frames = self.table();
        for frame in frames.values() {
            let mut state = frame.lock();
            if state.context_id == Some(context_id) {
                state.context_id = None;
                state.document = None;
            }
        }
    }

    pub(crate) fn on_contexts_cleared(&self) {
        let frames = self.table();
        for frame in frames.values() {
            let mut state = frame.lock();
            state.context_id = None;
            state.document = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdp::types::NetworkRequest;
    use crate::error::NavigationError;

    fn manager() -> FrameManager {
        FrameManager::new(WeakConnection::detached(), "sess-1".to_string())
    }

    fn payload(id: &str, parent: Option<&str>, url: &str) -> FramePayload {
        FramePayload {
            id: id.to_string(),
            parent_id: parent.map(String::from),
            url: url.to_string(),
            security_origin: "https://example.com".to_string(),
            mime_type: "text/html".to_string(),
            unreachable_url: None,
        }
    }

    fn document_request(frame_id: &str, request_id: &str) -> RequestWillBeSentEvent {
        RequestWillBeSentEvent {
            request_id: request_id.to_string(),
            frame_id: Some(frame_id.to_string()),
            request: NetworkRequest::default(),
            resource_type: Some("Document".to_string()),
        }
    }

    fn response(frame_id: &str, request_id: &str, status: i64) -> ResponseReceivedEvent {
        ResponseReceivedEvent {
            request_id: request_id.to_string(),
            frame_id: Some(frame_id.to_string()),
            response: NetworkResponse {
                status,
                ..Default::default()
            },
            resource_type: Some("Document".to_string()),
        }
    }

    #[test]
    fn attach_is_idempotent() {
        let fm = manager();
        fm.on_frame_navigated(&payload("root", None, "https://example.com"));
        let first = fm.on_frame_attached("child", "root");
        let second = fm.on_frame_attached("child", "root");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(fm.frame("root").unwrap().child_ids(), vec!["child"]);
    }

    #[test]
    fn navigated_unknown_id_with_parent_implicitly_attaches() {
        let fm = manager();
        fm.on_frame_navigated(&payload("root", None, "https://example.com"));
        fm.on_frame_navigated(&payload("sub", Some("root"), "https://example.com/ad"));
        let frame = fm.frame("sub").expect("implicitly attached");
        assert_eq!(frame.url(), "https://example.com/ad");
        assert_eq!(frame.parent_id().as_deref(), Some("root"));
    }

    #[test]
    fn detach_cascades_to_descendants() {
        let fm = manager();
        fm.on_frame_navigated(&payload("root", None, "https://example.com"));
        fm.on_frame_attached("a", "root");
        fm.on_frame_attached("b", "a");
        assert!(fm.frame("b").is_some());

        fm.on_frame_detached("a");
        assert!(fm.frame("a").is_none());
        assert!(fm.frame("b").is_none());
        assert!(fm.frame("root").unwrap().child_ids().is_empty());
    }

    #[test]
    fn navigation_detaches_previous_children() {
        let fm = manager();
        fm.on_frame_navigated(&payload("root", None, "https://example.com"));
        fm.on_frame_attached("child", "root");

        fm.on_frame_navigated(&payload("root", None, "https://example.com/next"));
        assert!(fm.frame("child").is_none());
        assert!(fm.frame("root").unwrap().child_ids().is_empty());
    }

    #[test]
    fn cross_process_navigation_rekeys_but_preserves_identity() {
        let fm = manager();
        fm.on_frame_navigated(&payload("A", None, "https://example.com"));
        let original = fm.frame("A").unwrap();

        fm.on_frame_navigated(&payload("B", None, "https://other.example"));
        assert!(fm.frame("A").is_none());
        let rekeyed = fm.frame("B").expect("looked up by new id");
        assert!(Arc::ptr_eq(&original, &rekeyed));
        assert_eq!(rekeyed.url(), "https://other.example");
        assert!(Arc::ptr_eq(&fm.main_frame().unwrap(), &rekeyed));
    }

    #[test]
    fn navigation_resets_lifecycle_flags() {
        let fm = manager();
        fm.on_frame_navigated(&payload("root", None, "https://example.com"));
        fm.on_lifecycle_event("root", "load");
        let frame = fm.frame("root").unwrap();
        assert!(frame.is_ready() && frame.is_loaded());

        fm.on_frame_navigated(&payload("root", None, "https://example.com/next"));
        assert!(!frame.is_ready() && !frame.is_loaded());
    }

    #[test]
    fn unreachable_url_sets_failed() {
        let fm = manager();
        let mut p = payload("root", None, "https://bad.invalid/");
        p.unreachable_url = Some("https://bad.invalid/".to_string());
        fm.on_frame_navigated(&p);
        assert!(fm.frame("root").unwrap().is_failed());
    }

    #[test]
    fn stale_response_for_superseded_request_is_discarded() {
        let fm = manager();
        fm.on_frame_navigated(&payload("root", None, "https://example.com"));
        fm.on_request_will_be_sent(&document_request("root", "req-2"));

        fm.on_response_received(&response("root", "req-1", 500));
        assert!(fm.frame("root").unwrap().response().is_none());

        fm.on_response_received(&response("root", "req-2", 200));
        assert_eq!(fm.frame("root").unwrap().response().unwrap().status, 200);
    }

    #[test]
    fn sub_resource_requests_are_not_tracked() {
        let fm = manager();
        fm.on_frame_navigated(&payload("root", None, "https://example.com"));
        let mut ev = document_request("root", "req-9");
        ev.resource_type = Some("XHR".to_string());
        fm.on_request_will_be_sent(&ev);
        assert!(fm.frame("root").unwrap().lock().request_id.is_none());
    }

    #[tokio::test]
    async fn load_notifies_ready_before_loaded() {
        let fm = Arc::new(manager());
        fm.on_frame_navigated(&payload("root", None, "https://example.com"));
        let frame = fm.frame("root").unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let opts = WaitOptions::default();

        let ready_task = {
            let frame = Arc::clone(&frame);
            let order = Arc::clone(&order);
            let opts = opts.clone();
            tokio::spawn(async move {
                frame.wait_for_ready(&opts).await.unwrap();
                order.lock().unwrap().push("ready");
            })
        };
        let loaded_task = {
            let frame = Arc::clone(&frame);
            let order = Arc::clone(&order);
            let opts = opts.clone();
            tokio::spawn(async move {
                frame.wait_for_loaded(&opts).await.unwrap();
                order.lock().unwrap().push("loaded");
            })
        };

        // Let both waiters register before firing the event
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(frame.waiter_counts(), (1, 1));

        // A bare "load" with no prior DOMContentLoaded still notifies
        // ready first
        fm.on_lifecycle_event("root", "load");
        ready_task.await.unwrap();
        loaded_task.await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["ready", "loaded"]);
    }

    #[tokio::test]
    async fn stopped_loading_forces_ready_and_loaded() {
        let fm = manager();
        fm.on_frame_navigated(&payload("root", None, "https://example.com"));
        let frame = fm.frame("root").unwrap();
        assert!(!frame.is_ready());

        fm.on_frame_stopped_loading("root");
        assert!(frame.is_ready() && frame.is_loaded());
        frame.wait_for_loaded(&WaitOptions::default()).await.unwrap();
    }

    #[tokio::test]
    async fn already_loaded_wait_resolves_without_subscribing() {
        let fm = manager();
        fm.on_frame_navigated(&payload("root", None, "https://example.com"));
        fm.on_lifecycle_event("root", "load");
        let frame = fm.frame("root").unwrap();

        frame.wait_for_loaded(&WaitOptions::default()).await.unwrap();
        assert_eq!(frame.waiter_counts(), (0, 0));

        // An unrelated loaded event afterwards finds no waiter to resolve
        fm.on_lifecycle_event("root", "load");
        assert_eq!(frame.waiter_counts(), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_rejects_with_timeout_at_the_deadline() {
        let fm = manager();
        fm.on_frame_navigated(&payload("root", None, "https://example.com"));
        let frame = fm.frame("root").unwrap();

        let opts = WaitOptions {
            timeout: Duration::from_millis(500),
            ..Default::default()
        };
        let started = tokio::time::Instant::now();
        let err = frame.wait_for_ready(&opts).await.unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(500));
        match err {
            Error::NavigationTimeout { timeout_ms, .. } => assert_eq!(timeout_ms, 500),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!err.is_retriable());
    }

    #[tokio::test(start_paused = true)]
    async fn tolerated_timeout_resolves_instead() {
        let fm = manager();
        fm.on_frame_navigated(&payload("root", None, "https://example.com"));
        let frame = fm.frame("root").unwrap();

        let opts = WaitOptions {
            timeout: Duration::from_millis(100),
            tolerate_timeout: true,
            ..Default::default()
        };
        frame.wait_for_ready(&opts).await.unwrap();
    }

    #[tokio::test]
    async fn http_error_status_rejects_even_though_loaded() {
        let fm = manager();
        fm.on_frame_navigated(&payload("root", None, "https://example.com"));
        fm.on_request_will_be_sent(&document_request("root", "req-1"));
        fm.on_response_received(&response("root", "req-1", 400));
        fm.on_lifecycle_event("root", "load");

        let frame = fm.frame("root").unwrap();
        assert!(frame.is_loaded());
        let err = frame
            .wait_for_loaded(&WaitOptions::default())
            .await
            .unwrap_err();
        match err {
            Error::NavigationFailed { ref reason, .. } => {
                assert_eq!(*reason, NavigationError::HttpStatus(400));
            }
            ref other => panic!("unexpected error: {other:?}"),
        }
        assert!(!err.is_retriable());
    }

    #[tokio::test]
    async fn http_error_can_be_suppressed() {
        let fm = manager();
        fm.on_frame_navigated(&payload("root", None, "https://example.com"));
        fm.on_request_will_be_sent(&document_request("root", "req-1"));
        fm.on_response_received(&response("root", "req-1", 500));
        fm.on_lifecycle_event("root", "load");

        let opts = WaitOptions {
            ignore_http_errors: true,
            ..Default::default()
        };
        fm.frame("root").unwrap().wait_for_loaded(&opts).await.unwrap();
    }

    #[tokio::test]
    async fn network_failure_rejects_with_error_text() {
        let fm = manager();
        fm.on_frame_navigated(&payload("root", None, "https://example.com"));
        fm.on_request_will_be_sent(&document_request("root", "req-1"));
        fm.on_loading_failed(&LoadingFailedEvent {
            request_id: "req-1".to_string(),
            error_text: "net::ERR_NAME_NOT_RESOLVED".to_string(),
            canceled: None,
        });

        let mut p = payload("root", None, "https://bad.invalid/");
        p.unreachable_url = Some("https://bad.invalid/".to_string());
        fm.on_frame_navigated(&p);
        fm.on_frame_stopped_loading("root");

        let err = fm
            .frame("root")
            .unwrap()
            .wait_for_loaded(&WaitOptions::default())
            .await
            .unwrap_err();
        match err {
            Error::NavigationFailed { reason, .. } => {
                assert_eq!(reason, NavigationError::Net("net::ERR_NAME_NOT_RESOLVED".into()));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn default_context_supersedes_and_destroy_clears() {
        let fm = manager();
        fm.on_frame_navigated(&payload("root", None, "https://example.com"));
        let frame = fm.frame("root").unwrap();
        assert!(frame.context().is_err());

        let desc = |id: i64| ExecutionContextDescription {
            id,
            aux_data: Some(serde_json::json!({"frameId": "root", "isDefault": true})),
            ..Default::default()
        };
        fm.on_context_created(&desc(1));
        assert_eq!(frame.context().unwrap().id(), 1);

        fm.on_context_created(&desc(2));
        assert_eq!(frame.context().unwrap().id(), 2);

        // Destroying the superseded context is a no-op for the frame
        fm.on_context_destroyed(1);
        assert_eq!(frame.context().unwrap().id(), 2);

        fm.on_context_destroyed(2);
        assert!(matches!(frame.context(), Err(Error::NoContext(_))));
    }

    #[test]
    fn non_default_context_is_ignored() {
        let fm = manager();
        fm.on_frame_navigated(&payload("root", None, "https://example.com"));
        fm.on_context_created(&ExecutionContextDescription {
            id: 5,
            aux_data: Some(serde_json::json!({"frameId": "root", "isDefault": false})),
            ..Default::default()
        });
        assert!(fm.frame("root").unwrap().context().is_err());
    }

    #[test]
    fn contexts_cleared_drops_every_context() {
        let fm = manager();
        fm.on_frame_navigated(&payload("root", None, "https://example.com"));
        fm.on_frame_attached("sub", "root");
        for (frame_id, ctx_id) in [("root", 1), ("sub", 2)] {
            fm.on_context_created(&ExecutionContextDescription {
                id: ctx_id,
                aux_data: Some(serde_json::json!({"frameId": frame_id, "isDefault": true})),
                ..Default::default()
            });
        }
        fm.on_contexts_cleared();
        assert!(fm.frame("root").unwrap().context().is_err());
        assert!(fm.frame("sub").unwrap().context().is_err());
    }

    #[tokio::test]
    async fn detached_frame_wakes_waiter_with_frame_not_found() {
        let fm = Arc::new(manager());
        fm.on_frame_navigated(&payload("root", None, "https://example.com"));
        fm.on_frame_attached("sub", "root");
        let frame = fm.frame("sub").unwrap();

        let waiter = {
            let frame = Arc::clone(&frame);
            tokio::spawn(async move {
                frame.wait_for_loaded(&WaitOptions::default()).await
            })
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        fm.on_frame_detached("sub");
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::FrameNotFound(_)));
    }

    #[test]
    fn seed_replays_a_frame_tree_snapshot() {
        let fm = manager();
        let tree = FrameTreeNode {
            frame: payload("root", None, "https://example.com"),
            child_frames: vec![FrameTreeNode {
                frame: payload("sub", Some("root"), "https://example.com/embed"),
                child_frames: vec![FrameTreeNode {
                    frame: payload("inner", Some("sub"), "https://example.com/inner"),
                    child_frames: vec![],
                }],
            }],
        };
        fm.seed(&tree);
        assert_eq!(fm.frames().len(), 3);
        assert_eq!(fm.main_frame().unwrap().id(), "root");
        assert_eq!(fm.frame("sub").unwrap().child_ids(), vec!["inner"]);
        assert_eq!(fm.frame("inner").unwrap().url(), "https://example.com/inner");
    }
}
