//! Page abstraction
//!
//! A Page is the automatable unit bound 1:1 to a page-type target. It
//! owns the frame manager and the page-scoped interceptor list, wires the
//! session's event scope into both, and brokers evaluation through the
//! main frame's current scripting context.

use std::sync::{Arc, Weak};

use serde_json::Value;

use crate::cdp::connection::WeakConnection;
use crate::cdp::types::{
    ExecutionContextCreatedEvent, ExecutionContextDestroyedEvent, FetchEnable, FrameAttachedEvent,
    FrameDetachedEvent, FrameNavigatedEvent, FrameStoppedLoadingEvent, LifecycleEvent,
    LoadingFailedEvent, NetworkEnable, PageEnable, PageGetFrameTree, PageGetFrameTreeResult,
    PageGetNavigationHistory, PageGetNavigationHistoryResult, PageNavigate,
    PageNavigateResult, PageNavigateToHistoryEntry, PageReload, PageSetLifecycleEventsEnabled,
    RequestPausedEvent, RequestWillBeSentEvent, ResponseReceivedEvent, RuntimeEnable,
};
use crate::context::{EvalArg, RemoteHandle};
use crate::error::{Error, Result};
use crate::frame::{Frame, FrameManager, WaitOptions};
use crate::intercept::{self, InterceptedRequest, InterceptorHandler, InterceptorList};
use crate::target::Target;
use crate::DriverConfig;

/// The automatable unit bound to one page-type target
pub struct Page {
    target: Weak<Target>,
    session_id: String,
    conn: WeakConnection,
    config: DriverConfig,
    frames: Arc<FrameManager>,
    interceptors: InterceptorList,
}

impl Page {
    /// Build the Page for a target: enable the protocol domains, wire the
    /// session's event scope, and seed the frame tree. Called once per
    /// target through the lazy cache.
    pub(crate) async fn attach(target: &Arc<Target>) -> Result<Arc<Self>> {
        let weak_conn = target.conn();
        let conn = weak_conn.upgrade()?;
        let session_id = target.session_id().to_string();
        let config = conn.config().clone();

        let page = Arc::new(Self {
            target: Arc::downgrade(target),
            session_id: session_id.clone(),
            conn: weak_conn.clone(),
            config: config.clone(),
            frames: Arc::new(FrameManager::new(weak_conn, session_id.clone())),
            interceptors: InterceptorList::new(),
        });

        conn.send_to_session::<_, Value>(&session_id, "Page.enable", &PageEnable {})
            .await?;
        conn.send_to_session::<_, Value>(
            &session_id,
            "Page.setLifecycleEventsEnabled",
            &PageSetLifecycleEventsEnabled { enabled: true },
        )
        .await?;
        conn.send_to_session::<_, Value>(&session_id, "Runtime.enable", &RuntimeEnable {})
            .await?;
        conn.send_to_session::<_, Value>(
            &session_id,
            "Network.enable",
            &NetworkEnable {
                max_post_data_size: Some(config.max_post_data_size),
            },
        )
        .await?;
        // Interception is enabled as a side effect of page creation; an
        // empty chain resumes every request untouched.
        conn.send_to_session::<_, Value>(&session_id, "Fetch.enable", &FetchEnable {})
            .await?;

        page.register_listeners(target);

        let tree: PageGetFrameTreeResult = conn
            .send_to_session(&session_id, "Page.getFrameTree", &PageGetFrameTree {})
            .await?;
        page.frames.seed(&tree.frame_tree);

        tracing::debug!(session = %session_id, "page attached");
        Ok(page)
    }

    fn register_listeners(self: &Arc<Self>, target: &Arc<Target>) {
        let frame_manager = &self.frames;
        let scope = &target.events;

        macro_rules! route {
            ($method:literal, $event:ty, $handler:expr) => {{
                let frames = Arc::clone(frame_manager);
                scope.on_method(
                    $method,
                    Arc::new(move |ev| {
                        if let Ok(parsed) = serde_json::from_value::<$event>(ev.params.clone()) {
                            let handler: fn(&FrameManager, $event) = $handler;
                            handler(&frames, parsed);
                        }
                    }),
                );
            }};
        }

        route!("Page.frameAttached", FrameAttachedEvent, |frames, ev| {
            frames.on_frame_attached(&ev.frame_id, &ev.parent_frame_id);
        });
        route!("Page.frameNavigated", FrameNavigatedEvent, |frames, ev| {
            frames.on_frame_navigated(&ev.frame);
        });
        route!("Page.frameDetached", FrameDetachedEvent, |frames, ev| {
            frames.on_frame_detached(&ev.frame_id);
        });
        route!("Page.lifecycleEvent", LifecycleEvent, |frames, ev| {
            frames.on_lifecycle_event(&ev.frame_id, &ev.name);
        });
        route!(
            "Page.frameStoppedLoading",
            FrameStoppedLoadingEvent,
            |frames, ev| {
                frames.on_frame_stopped_loading(&ev.frame_id);
            }
        );
        route!(
            "Network.requestWillBeSent",
            RequestWillBeSentEvent,
            |frames, ev| {
                frames.on_request_will_be_sent(&ev);
            }
        );
        route!(
            "Network.responseReceived",
            ResponseReceivedEvent,
            |frames, ev| {
                frames.on_response_received(&ev);
            }
        );
        route!("Network.loadingFailed", LoadingFailedEvent, |frames, ev| {
            frames.on_loading_failed(&ev);
        });
        route!(
            "Runtime.executionContextCreated",
            ExecutionContextCreatedEvent,
            |frames, ev| {
                frames.on_context_created(&ev.context);
            }
        );
        route!(
            "Runtime.executionContextDestroyed",
            ExecutionContextDestroyedEvent,
            |frames, ev| {
                frames.on_context_destroyed(ev.execution_context_id);
            }
        );
        {
            let frames = Arc::clone(frame_manager);
            scope.on_method(
                "Runtime.executionContextsCleared",
                Arc::new(move |_| {
                    frames.on_contexts_cleared();
                }),
            );
        }
        {
            let page = Arc::downgrade(self);
            scope.on_method(
                "Fetch.requestPaused",
                Arc::new(move |ev| {
                    let Some(page) = page.upgrade() else {
                        return;
                    };
                    let Ok(parsed) =
                        serde_json::from_value::<RequestPausedEvent>(ev.params.clone())
                    else {
                        return;
                    };
                    page.handle_paused_request(parsed);
                }),
            );
        }
    }

    /// Run the interceptor chain for one paused request in its own task;
    /// event dispatch never blocks on a handler.
    fn handle_paused_request(self: Arc<Self>, event: RequestPausedEvent) {
        let Ok(conn) = self.conn.upgrade() else {
            return;
        };
        let mut handlers = conn.global_interceptors().snapshot();
        handlers.extend(self.interceptors.snapshot());
        let mut request = InterceptedRequest::from_event(event);
        let session_id = self.session_id.clone();

        tokio::spawn(async move {
            let request_id = request.request_id.clone();
            let outcome = intercept::run_chain(&handlers, &mut request).await;
            if let Err(err) =
                intercept::issue_outcome(&conn, &session_id, &request_id, outcome).await
            {
                tracing::debug!(request = %request_id, "interception outcome failed: {}", err);
            }
        });
    }

    // ---------------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------------

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The owning target
    pub fn target(&self) -> Result<Arc<Target>> {
        self.target
            .upgrade()
            .ok_or_else(|| Error::InvalidTarget(self.session_id.clone()))
    }

    /// The page's frame manager
    pub fn frame_manager(&self) -> &FrameManager {
        &self.frames
    }

    /// The frame tree root
    pub fn main_frame(&self) -> Result<Arc<Frame>> {
        self.frames
            .main_frame()
            .ok_or_else(|| Error::FrameNotFound("main frame".to_string()))
    }

    /// Look a frame up by id
    pub fn frame(&self, frame_id: &str) -> Option<Arc<Frame>> {
        self.frames.frame(frame_id)
    }

    /// All frames currently in the tree
    pub fn frames(&self) -> Vec<Arc<Frame>> {
        self.frames.frames()
    }

    /// Current URL of the main frame
    pub fn url(&self) -> Result<String> {
        Ok(self.main_frame()?.url())
    }

    /// Wait options derived from the driver configuration
    pub fn wait_options(&self) -> WaitOptions {
        WaitOptions::from_config(&self.config)
    }

    // ---------------------------------------------------------------------
    // Navigation
    // ---------------------------------------------------------------------

    /// Start a navigation. Completion is observed separately through
    /// [`Page::wait_until_ready`] / [`Page::wait_until_loaded`].
    pub async fn navigate(&self, url: &str) -> Result<()> {
        let conn = self.conn.upgrade()?;
        let result: PageNavigateResult = conn
            .send_to_session(
                &self.session_id,
                "Page.navigate",
                &PageNavigate {
                    url: url.to_string(),
                },
            )
            .await?;
        if let Some(error_text) = result.error_text {
            return Err(Error::net_failure(result.frame_id, error_text));
        }
        Ok(())
    }

    /// Wait until the main frame reached `ready`
    pub async fn wait_until_ready(&self) -> Result<()> {
        self.main_frame()?.wait_for_ready(&self.wait_options()).await
    }

    /// Wait until the main frame reached `loaded`
    pub async fn wait_until_loaded(&self) -> Result<()> {
        self.main_frame()?
            .wait_for_loaded(&self.wait_options())
            .await
    }

    /// Wait on the main frame with explicit options
    pub async fn wait_until_loaded_with(&self, opts: &WaitOptions) -> Result<()> {
        self.main_frame()?.wait_for_loaded(opts).await
    }

    /// Reload the page
    pub async fn reload(&self) -> Result<()> {
        let conn = self.conn.upgrade()?;
        conn.send_to_session::<_, Value>(
            &self.session_id,
            "Page.reload",
            &PageReload { ignore_cache: None },
        )
        .await?;
        Ok(())
    }

    /// Go back in history, if possible
    pub async fn go_back(&self) -> Result<()> {
        self.navigate_history(-1).await
    }

    /// Go forward in history, if possible
    pub async fn go_forward(&self) -> Result<()> {
        self.navigate_history(1).await
    }

    async fn navigate_history(&self, delta: i32) -> Result<()> {
        let conn = self.conn.upgrade()?;
        let history: PageGetNavigationHistoryResult = conn
            .send_to_session(
                &self.session_id,
                "Page.getNavigationHistory",
                &PageGetNavigationHistory {},
            )
            .await?;
        let index = history.current_index + delta;
        if index < 0 || index as usize >= history.entries.len() {
            return Ok(());
        }
        let entry_id = history.entries[index as usize].id;
        conn.send_to_session::<_, Value>(
            &self.session_id,
            "Page.navigateToHistoryEntry",
            &PageNavigateToHistoryEntry { entry_id },
        )
        .await?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Evaluation, brokered through the main frame
    // ---------------------------------------------------------------------

    pub async fn evaluate(&self, expression: &str, args: &[EvalArg]) -> Result<Value> {
        self.main_frame()?.evaluate(expression, args).await
    }

    pub async fn evaluate_as_json<T: serde::de::DeserializeOwned>(
        &self,
        expression: &str,
        args: &[EvalArg],
    ) -> Result<T> {
        self.main_frame()?.evaluate_as_json(expression, args).await
    }

    pub async fn evaluate_element(
        &self,
        expression: &str,
        args: &[EvalArg],
    ) -> Result<RemoteHandle> {
        self.main_frame()?.evaluate_element(expression, args).await
    }

    pub async fn evaluate_element_list(
        &self,
        expression: &str,
        args: &[EvalArg],
    ) -> Result<Vec<RemoteHandle>> {
        self.main_frame()?
            .evaluate_element_list(expression, args)
            .await
    }

    // ---------------------------------------------------------------------
    // Page-scoped interception
    // ---------------------------------------------------------------------

    /// Append a page-scoped interceptor; page handlers run after the
    /// connection's global handlers, in insertion order
    pub fn add_interceptor(&self, label: Option<&str>, handler: InterceptorHandler) -> u64 {
        self.interceptors.add(label, handler)
    }

    /// Remove page-scoped interceptors by label, or all of them
    pub fn remove_interceptors(&self, label: Option<&str>) {
        self.interceptors.remove(label);
    }
}
