//! Request interception
//!
//! An ordered chain of handlers (global first, then page-scoped, each in
//! insertion order) decides the fate of every paused outbound request.
//! The first handler that fails, fulfills or continues the request stops
//! the chain; pass decisions accumulate modifications for whoever runs
//! next, and an undecided chain resumes the request with whatever
//! accumulated.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use base64::Engine;

use crate::cdp::connection::Connection;
use crate::cdp::types::{
    FetchContinueRequest, FetchFailRequest, FetchFulfillRequest, HeaderEntry, RequestPausedEvent,
};
use crate::error::Result;

/// A synthetic response used to fulfill a request without hitting the
/// network.
#[derive(Debug, Clone)]
pub struct ResponseSpec {
    pub status: i64,
    pub status_text: Option<String>,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl ResponseSpec {
    /// A 200 response with the given body
    pub fn ok(body: impl AsRef<[u8]>) -> Self {
        Self {
            status: 200,
            status_text: None,
            headers: HashMap::new(),
            body: body.as_ref().to_vec(),
        }
    }
}

/// Mutations applied to a request before it leaves the browser
#[derive(Debug, Clone, Default)]
pub struct RequestModifications {
    pub url: Option<String>,
    pub method: Option<String>,
    pub headers: Option<HashMap<String, String>>,
    pub post_data: Option<Vec<u8>>,
}

impl RequestModifications {
    pub fn is_empty(&self) -> bool {
        self.url.is_none()
            && self.method.is_none()
            && self.headers.is_none()
            && self.post_data.is_none()
    }

    /// Merge later modifications over these; header maps merge key-wise,
    /// scalar fields overwrite
    pub fn merge(&mut self, later: RequestModifications) {
        if later.url.is_some() {
            self.url = later.url;
        }
        if later.method.is_some() {
            self.method = later.method;
        }
        if let Some(headers) = later.headers {
            self.headers.get_or_insert_with(HashMap::new).extend(headers);
        }
        if later.post_data.is_some() {
            self.post_data = later.post_data;
        }
    }
}

/// A handler's verdict for one paused request
#[derive(Debug, Clone)]
pub enum InterceptDecision {
    /// Abort the request with a network error reason (e.g. "Failed",
    /// "BlockedByClient")
    Fail(String),
    /// Answer the request with a synthetic response; chain stops
    Fulfill(ResponseSpec),
    /// Resume the request now with these modifications; chain stops
    Continue(RequestModifications),
    /// Record modifications (possibly none) and let the next handler run
    Pass(RequestModifications),
}

impl InterceptDecision {
    /// The no-op decision: nothing recorded, next handler runs
    pub fn pass() -> Self {
        InterceptDecision::Pass(RequestModifications::default())
    }
}

/// One paused request as presented to handlers. `modifications` carries
/// what earlier handlers in the chain have accumulated.
#[derive(Debug, Clone)]
pub struct InterceptedRequest {
    pub request_id: String,
    pub url: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub post_data: Option<String>,
    pub resource_type: String,
    pub frame_id: String,
    pub network_id: Option<String>,
    pub modifications: RequestModifications,
}

impl InterceptedRequest {
    pub(crate) fn from_event(event: RequestPausedEvent) -> Self {
        Self {
            request_id: event.request_id,
            url: event.request.url,
            method: event.request.method,
            headers: event.request.headers,
            post_data: event.request.post_data,
            resource_type: event.resource_type,
            frame_id: event.frame_id,
            network_id: event.network_id,
            modifications: RequestModifications::default(),
        }
    }
}

/// Future returned by an interceptor handler
pub type HandlerFuture = Pin<Box<dyn Future<Output = InterceptDecision> + Send>>;

/// An interceptor handler; invoked asynchronously per paused request
pub type InterceptorHandler = Arc<dyn Fn(&InterceptedRequest) -> HandlerFuture + Send + Sync>;

struct Interceptor {
    id: u64,
    label: Option<String>,
    handler: InterceptorHandler,
}

/// An ordered, mutable list of interceptors for one scope
#[derive(Default)]
pub struct InterceptorList {
    next_id: AtomicU64,
    items: Mutex<Vec<Interceptor>>,
}

impl InterceptorList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler; returns its removal id
    pub fn add(&self, label: Option<&str>, handler: InterceptorHandler) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.items.lock().expect("interceptor list poisoned").push(Interceptor {
            id,
            label: label.map(String::from),
            handler,
        });
        id
    }

    /// Remove by label, or clear entirely when no label is given
    pub fn remove(&self, label: Option<&str>) {
        let mut items = self.items.lock().expect("interceptor list poisoned");
        match label {
            Some(label) => items.retain(|i| i.label.as_deref() != Some(label)),
            None => items.clear(),
        }
    }

    /// Remove one interceptor by its id
    pub fn remove_by_id(&self, id: u64) {
        self.items
            .lock()
            .expect("interceptor list poisoned")
            .retain(|i| i.id != id);
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().expect("interceptor list poisoned").is_empty()
    }

    pub(crate) fn snapshot(&self) -> Vec<InterceptorHandler> {
        self.items
            .lock()
            .expect("interceptor list poisoned")
            .iter()
            .map(|i| Arc::clone(&i.handler))
            .collect()
    }
}

/// Final fate of a paused request
#[derive(Debug, Clone)]
pub(crate) enum ChainOutcome {
    Fail(String),
    Fulfill(ResponseSpec),
    Continue(RequestModifications),
}

/// Run the chain over one paused request and produce exactly one outcome.
///
/// An explicit continue folds previously accumulated pass-modifications
/// into its own before stopping the chain.
pub(crate) async fn run_chain(
    handlers: &[InterceptorHandler],
    request: &mut InterceptedRequest,
) -> ChainOutcome {
    for handler in handlers {
        match handler(request).await {
            InterceptDecision::Fail(reason) => return ChainOutcome::Fail(reason),
            InterceptDecision::Fulfill(spec) => return ChainOutcome::Fulfill(spec),
            InterceptDecision::Continue(mods) => {
                request.modifications.merge(mods);
                return ChainOutcome::Continue(request.modifications.clone());
            }
            InterceptDecision::Pass(mods) => {
                request.modifications.merge(mods);
            }
        }
    }
    ChainOutcome::Continue(request.modifications.clone())
}

/// Convert a header map into the wire's name/value entry list, sorted for
/// a stable wire order
fn headers_to_entries(headers: &HashMap<String, String>) -> Vec<HeaderEntry> {
    let mut entries: Vec<HeaderEntry> = headers
        .iter()
        .map(|(name, value)| HeaderEntry {
            name: name.clone(),
            value: value.clone(),
        })
        .collect();
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    entries
}

/// Issue the chain's outcome to the browser
pub(crate) async fn issue_outcome(
    conn: &Connection,
    session_id: &str,
    request_id: &str,
    outcome: ChainOutcome,
) -> Result<()> {
    let b64 = base64::engine::general_purpose::STANDARD;
    match outcome {
        ChainOutcome::Fail(reason) => {
            conn.send_to_session::<_, serde_json::Value>(
                session_id,
                "Fetch.failRequest",
                &FetchFailRequest {
                    request_id: request_id.to_string(),
                    error_reason: reason,
                },
            )
            .await?;
        }
        ChainOutcome::Fulfill(spec) => {
            conn.send_to_session::<_, serde_json::Value>(
                session_id,
                "Fetch.fulfillRequest",
                &FetchFulfillRequest {
                    request_id: request_id.to_string(),
                    response_code: spec.status,
                    response_headers: Some(headers_to_entries(&spec.headers)),
                    body: Some(b64.encode(&spec.body)),
                    response_phrase: spec.status_text,
                },
            )
            .await?;
        }
        ChainOutcome::Continue(mods) => {
            conn.send_to_session::<_, serde_json::Value>(
                session_id,
                "Fetch.continueRequest",
                &FetchContinueRequest {
                    request_id: request_id.to_string(),
                    url: mods.url,
                    method: mods.method,
                    post_data: mods.post_data.map(|data| b64.encode(data)),
                    headers: mods.headers.as_ref().map(headers_to_entries),
                },
            )
            .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn request() -> InterceptedRequest {
        InterceptedRequest {
            request_id: "r-1".into(),
            url: "https://example.com/api".into(),
            method: "GET".into(),
            headers: HashMap::new(),
            post_data: None,
            resource_type: "XHR".into(),
            frame_id: "frame-1".into(),
            network_id: None,
            modifications: RequestModifications::default(),
        }
    }

    fn deciding(decision: InterceptDecision) -> InterceptorHandler {
        Arc::new(move |_| {
            let decision = decision.clone();
            Box::pin(async move { decision })
        })
    }

    fn counting(counter: Arc<AtomicUsize>, decision: InterceptDecision) -> InterceptorHandler {
        Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            let decision = decision.clone();
            Box::pin(async move { decision })
        })
    }

    #[tokio::test]
    async fn fail_short_circuits_the_chain() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handlers = vec![
            counting(Arc::clone(&calls), InterceptDecision::pass()),
            counting(Arc::clone(&calls), InterceptDecision::Fail("Failed".into())),
            counting(Arc::clone(&calls), InterceptDecision::pass()),
        ];

        let outcome = run_chain(&handlers, &mut request()).await;
        assert!(matches!(outcome, ChainOutcome::Fail(ref r) if r == "Failed"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn undecided_chain_continues_with_accumulated_modifications() {
        let handlers = vec![
            deciding(InterceptDecision::Pass(RequestModifications {
                headers: Some(HashMap::from([("x-a".to_string(), "1".to_string())])),
                ..Default::default()
            })),
            deciding(InterceptDecision::Pass(RequestModifications {
                headers: Some(HashMap::from([("x-b".to_string(), "2".to_string())])),
                method: Some("POST".into()),
                ..Default::default()
            })),
        ];

        let outcome = run_chain(&handlers, &mut request()).await;
        match outcome {
            ChainOutcome::Continue(mods) => {
                let headers = mods.headers.unwrap();
                assert_eq!(headers.get("x-a").map(String::as_str), Some("1"));
                assert_eq!(headers.get("x-b").map(String::as_str), Some("2"));
                assert_eq!(mods.method.as_deref(), Some("POST"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_chain_continues_unmodified() {
        let outcome = run_chain(&[], &mut request()).await;
        match outcome {
            ChainOutcome::Continue(mods) => assert!(mods.is_empty()),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn continue_bypasses_remaining_handlers_and_keeps_pass_mods() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handlers = vec![
            deciding(InterceptDecision::Pass(RequestModifications {
                headers: Some(HashMap::from([("x-a".to_string(), "1".to_string())])),
                ..Default::default()
            })),
            deciding(InterceptDecision::Continue(RequestModifications {
                url: Some("https://example.com/other".into()),
                ..Default::default()
            })),
            counting(Arc::clone(&calls), InterceptDecision::pass()),
        ];

        let outcome = run_chain(&handlers, &mut request()).await;
        match outcome {
            ChainOutcome::Continue(mods) => {
                assert_eq!(mods.url.as_deref(), Some("https://example.com/other"));
                assert!(mods.headers.is_some());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn later_handlers_see_accumulated_modifications() {
        let handlers: Vec<InterceptorHandler> = vec![
            deciding(InterceptDecision::Pass(RequestModifications {
                method: Some("PUT".into()),
                ..Default::default()
            })),
            Arc::new(|req: &InterceptedRequest| {
                let seen = req.modifications.method.clone();
                Box::pin(async move {
                    assert_eq!(seen.as_deref(), Some("PUT"));
                    InterceptDecision::pass()
                })
            }),
        ];
        run_chain(&handlers, &mut request()).await;
    }

    #[test]
    fn label_removal_and_clear() {
        let list = InterceptorList::new();
        list.add(Some("ads"), deciding(InterceptDecision::pass()));
        list.add(Some("ads"), deciding(InterceptDecision::pass()));
        list.add(Some("auth"), deciding(InterceptDecision::pass()));
        assert_eq!(list.snapshot().len(), 3);

        list.remove(Some("ads"));
        assert_eq!(list.snapshot().len(), 1);

        list.remove(None);
        assert!(list.is_empty());
    }

    #[test]
    fn headers_convert_to_sorted_entries() {
        let headers = HashMap::from([
            ("b".to_string(), "2".to_string()),
            ("a".to_string(), "1".to_string()),
        ]);
        let entries = headers_to_entries(&headers);
        assert_eq!(
            entries,
            vec![
                HeaderEntry {
                    name: "a".into(),
                    value: "1".into()
                },
                HeaderEntry {
                    name: "b".into(),
                    value: "2".into()
                },
            ]
        );
    }
}
