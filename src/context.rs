//! Scripting contexts and remote object handles
//!
//! A scripting context is one isolated evaluation environment bound to a
//! frame. Expressions go to the remote process and come back either by
//! value or as [`RemoteHandle`]s whose lifetime stays remote.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::cdp::connection::WeakConnection;
use crate::cdp::types::{
    CallArgument, EvaluateResult, ExceptionDetails, RemoteObject, RuntimeCallFunctionOn,
    RuntimeEvaluate, RuntimeGetProperties, RuntimeGetPropertiesResult,
};
use crate::error::{Error, Result};

/// A handle to an object living in the remote process.
///
/// While attached, the handle is passed back to the browser by its remote
/// object id; once detached only the last known literal value remains.
#[derive(Debug, Clone)]
pub struct RemoteHandle {
    object_id: Option<String>,
    last_value: Option<Value>,
    detached: Arc<AtomicBool>,
}

impl RemoteHandle {
    pub(crate) fn from_remote_object(object: &RemoteObject) -> Self {
        Self {
            object_id: object.object_id.clone(),
            last_value: object.value.clone(),
            detached: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The remote object id, if still attached
    pub fn object_id(&self) -> Option<&str> {
        if self.is_detached() {
            None
        } else {
            self.object_id.as_deref()
        }
    }

    /// The last literal value observed for this object, if any
    pub fn last_value(&self) -> Option<&Value> {
        self.last_value.as_ref()
    }

    /// Sever the remote linkage; subsequent argument conversion falls
    /// back to the last known literal value
    pub fn detach(&self) {
        self.detached.store(true, Ordering::SeqCst);
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    fn as_call_argument(&self) -> CallArgument {
        match self.object_id() {
            Some(id) => CallArgument::from_object_id(id),
            None => CallArgument::from_value(self.last_value.clone().unwrap_or(Value::Null)),
        }
    }
}

/// One positional evaluation argument
#[derive(Debug, Clone)]
pub enum EvalArg {
    /// Passed as a literal null
    Null,
    /// Passed by remote object id (or last known value once detached)
    Handle(RemoteHandle),
    /// Passed as a literal value
    Value(Value),
}

impl EvalArg {
    fn as_call_argument(&self) -> CallArgument {
        match self {
            EvalArg::Null => CallArgument::from_value(Value::Null),
            EvalArg::Handle(handle) => handle.as_call_argument(),
            // A literal null collapses to the null argument form too
            EvalArg::Value(Value::Null) => CallArgument::from_value(Value::Null),
            EvalArg::Value(value) => CallArgument::from_value(value.clone()),
        }
    }
}

impl From<Value> for EvalArg {
    fn from(value: Value) -> Self {
        EvalArg::Value(value)
    }
}

impl From<RemoteHandle> for EvalArg {
    fn from(handle: RemoteHandle) -> Self {
        EvalArg::Handle(handle)
    }
}

/// Compose a diagnostic message from remote exception details.
///
/// Prefers the exception's own description; otherwise assembles the raw
/// text plus a synthesized call-stack trace. Some promise rejections come
/// back prefixed with "Uncaught (in promise)", which is noise here.
fn compose_exception_message(details: &ExceptionDetails) -> String {
    let message = match details
        .exception
        .as_ref()
        .and_then(|e| e.description.clone())
    {
        Some(description) => description,
        None => {
            let mut message = details.text.clone();
            if let Some(stack) = &details.stack_trace {
                for frame in &stack.call_frames {
                    message.push_str(&format!(
                        "\n    at {} ({}:{}:{})",
                        if frame.function_name.is_empty() {
                            "<anonymous>"
                        } else {
                            &frame.function_name
                        },
                        frame.url,
                        frame.line_number,
                        frame.column_number
                    ));
                }
            }
            message
        }
    };

    message
        .strip_prefix("Uncaught (in promise)")
        .map(|rest| rest.trim_start().to_string())
        .unwrap_or(message)
}

/// One isolated evaluation environment bound to a frame.
///
/// Contexts are created and superseded by the frame's lifecycle events;
/// holding a `ScriptingContext` does not keep the remote context alive.
#[derive(Debug, Clone)]
pub struct ScriptingContext {
    context_id: i64,
    frame_id: String,
    session_id: String,
    conn: WeakConnection,
}

impl ScriptingContext {
    pub(crate) fn new(
        conn: WeakConnection,
        session_id: String,
        frame_id: String,
        context_id: i64,
    ) -> Self {
        Self {
            context_id,
            frame_id,
            session_id,
            conn,
        }
    }

    /// The remote execution context id
    pub fn id(&self) -> i64 {
        self.context_id
    }

    /// The owning frame's id
    pub fn frame_id(&self) -> &str {
        &self.frame_id
    }

    async fn invoke(
        &self,
        expression: &str,
        args: &[EvalArg],
        return_by_value: bool,
    ) -> Result<RemoteObject> {
        let conn = self.conn.upgrade()?;

        let result: EvaluateResult = if args.is_empty() {
            conn.send_to_session(
                &self.session_id,
                "Runtime.evaluate",
                &RuntimeEvaluate {
                    expression: expression.to_string(),
                    context_id: Some(self.context_id),
                    return_by_value: Some(return_by_value),
                    await_promise: Some(true),
                },
            )
            .await?
        } else {
            conn.send_to_session(
                &self.session_id,
                "Runtime.callFunctionOn",
                &RuntimeCallFunctionOn {
                    function_declaration: expression.to_string(),
                    execution_context_id: Some(self.context_id),
                    arguments: Some(args.iter().map(EvalArg::as_call_argument).collect()),
                    return_by_value: Some(return_by_value),
                    await_promise: Some(true),
                    object_id: None,
                },
            )
            .await?
        };

        if let Some(details) = result.exception_details {
            let message = compose_exception_message(&details);
            tracing::debug!(frame = %self.frame_id, "evaluation raised: {}", message);
            return Err(Error::Evaluation(message));
        }
        Ok(result.result)
    }

    /// Evaluate an expression and return its result by value.
    ///
    /// With positional arguments the expression must be a function
    /// declaration (it is invoked with the converted arguments); without
    /// arguments it is evaluated as a bare expression.
    pub async fn evaluate(&self, expression: &str, args: &[EvalArg]) -> Result<Value> {
        let object = self.invoke(expression, args, true).await?;
        Ok(object.value.unwrap_or(Value::Null))
    }

    /// Evaluate and deserialize the by-value result into a caller type
    pub async fn evaluate_as_json<T: DeserializeOwned>(
        &self,
        expression: &str,
        args: &[EvalArg],
    ) -> Result<T> {
        let value = self.evaluate(expression, args).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Evaluate an expression expected to yield a single remote object
    pub async fn evaluate_element(
        &self,
        expression: &str,
        args: &[EvalArg],
    ) -> Result<RemoteHandle> {
        let object = self.invoke(expression, args, false).await?;
        if object.object_id.is_none() {
            return Err(Error::Evaluation(format!(
                "expression did not yield an element (got {})",
                object.kind
            )));
        }
        Ok(RemoteHandle::from_remote_object(&object))
    }

    /// Evaluate an expression expected to yield an array-like of remote
    /// objects; elements are enumerated via own-property descriptors.
    pub async fn evaluate_element_list(
        &self,
        expression: &str,
        args: &[EvalArg],
    ) -> Result<Vec<RemoteHandle>> {
        let object = self.invoke(expression, args, false).await?;
        let object_id = object.object_id.clone().ok_or_else(|| {
            Error::Evaluation(format!(
                "expression did not yield an element list (got {})",
                object.kind
            ))
        })?;

        let conn = self.conn.upgrade()?;
        let props: RuntimeGetPropertiesResult = conn
            .send_to_session(
                &self.session_id,
                "Runtime.getProperties",
                &RuntimeGetProperties {
                    object_id,
                    own_properties: Some(true),
                },
            )
            .await?;

        Ok(props
            .result
            .iter()
            .filter(|p| p.enumerable && p.name.parse::<usize>().is_ok())
            .filter_map(|p| p.value.as_ref())
            .filter(|o| o.object_id.is_some())
            .map(RemoteHandle::from_remote_object)
            .collect())
    }

    /// Obtain a handle to the context's document
    pub async fn document(&self) -> Result<RemoteHandle> {
        self.evaluate_element("document", &[]).await
    }
}
