//! Targets and their attached sessions
//!
//! A target is one controllable unit inside the browser (page, sub-frame
//! target, background worker), reached through the opaque session id the
//! attach event handed us. A page-type target lazily owns one Page.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{de::DeserializeOwned, Serialize};

use crate::cdp::connection::WeakConnection;
use crate::cdp::types::TargetInfo;
use crate::error::Result;
use crate::events::{EventListeners, ListenerId, NotifyList};
use crate::page::Page;

/// Target kinds that can host a page
const PAGEABLE_KINDS: &[&str] = &["page", "iframe", "background_page"];

/// One attached target, owned by the connection's session registry.
pub struct Target {
    session_id: String,
    conn: WeakConnection,
    info: Mutex<TargetInfo>,
    crashed: AtomicBool,
    /// The session-scoped event dispatch table
    pub(crate) events: EventListeners,
    crash_hooks: NotifyList,
    page: tokio::sync::Mutex<Option<Arc<Page>>>,
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Target")
            .field("session_id", &self.session_id)
            .field("info", &self.info)
            .field("crashed", &self.crashed)
            .finish_non_exhaustive()
    }
}

impl Target {
    pub(crate) fn new(conn: WeakConnection, session_id: String, info: TargetInfo) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            conn,
            info: Mutex::new(info),
            crashed: AtomicBool::new(false),
            events: EventListeners::new(),
            crash_hooks: NotifyList::new(),
            page: tokio::sync::Mutex::new(None),
        })
    }

    /// The opaque session id this target is reached through
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn target_id(&self) -> String {
        self.info.lock().expect("target info poisoned").target_id.clone()
    }

    /// A copy of the most recent target description
    pub fn info(&self) -> TargetInfo {
        self.info.lock().expect("target info poisoned").clone()
    }

    pub fn kind(&self) -> String {
        self.info.lock().expect("target info poisoned").kind.clone()
    }

    pub fn url(&self) -> String {
        self.info.lock().expect("target info poisoned").url.clone()
    }

    pub(crate) fn update_info(&self, info: TargetInfo) {
        *self.info.lock().expect("target info poisoned") = info;
    }

    pub fn is_crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    /// Mark the target crashed and raise the local crash notification.
    /// The session itself stays registered until an explicit detach.
    pub(crate) fn mark_crashed(&self) {
        if !self.crashed.swap(true, Ordering::SeqCst) {
            tracing::warn!(session = %self.session_id, "target crashed");
            self.crash_hooks.notify();
        }
    }

    /// Register a callback for the target's crash notification
    pub fn on_crashed(&self, callback: Arc<dyn Fn() + Send + Sync>) -> ListenerId {
        self.crash_hooks.add(callback)
    }

    /// Whether the target's kind can host a page at all
    pub fn is_page_like(&self) -> bool {
        let kind = self.kind();
        PAGEABLE_KINDS.contains(&kind.as_str())
    }

    /// Whether the target is usable for paging. Page-type targets also
    /// need a non-blank URL; the browser is known to leak stale blank
    /// page targets.
    pub fn is_valid_page(&self) -> bool {
        let info = self.info();
        if !PAGEABLE_KINDS.contains(&info.kind.as_str()) {
            return false;
        }
        info.kind != "page" || (!info.url.is_empty() && info.url != "about:blank")
    }

    pub(crate) fn conn(&self) -> WeakConnection {
        self.conn.clone()
    }

    /// Send a command scoped to this target's session
    pub async fn send<C, R>(&self, method: &str, params: &C) -> Result<R>
    where
        C: Serialize,
        R: DeserializeOwned,
    {
        let conn = self.conn.upgrade()?;
        conn.send_to_session(&self.session_id, method, params).await
    }

    /// The target's Page, created on first access and cached for the
    /// target's lifetime.
    pub(crate) async fn page(self: &Arc<Self>) -> Result<Arc<Page>> {
        if !self.is_page_like() {
            return Err(crate::error::Error::InvalidTarget(format!(
                "{} ({})",
                self.session_id,
                self.kind()
            )));
        }
        let mut slot = self.page.lock().await;
        if let Some(page) = slot.as_ref() {
            return Ok(Arc::clone(page));
        }
        let page = Page::attach(self).await?;
        *slot = Some(Arc::clone(&page));
        Ok(page)
    }
}
