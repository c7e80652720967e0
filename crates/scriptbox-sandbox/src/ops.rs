//! deno_core op definitions for the guest bridge.
//!
//! These are the only host entry points reachable from a context. The runtime
//! shim captures them in closures and then removes `Deno` from the global
//! scope, so guest code reaches them only through `console`, `fetch` and the
//! timer functions.
//!
//! The `#[op2]` macro generates additional public items (v8 function pointers,
//! metadata structs) that cannot carry doc comments. We suppress `missing_docs`
//! at the module level; all actual functions and types are documented below.
#![allow(missing_docs)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use chrono::Utc;
use deno_core::op2;
use deno_core::OpState;
use deno_error::JsErrorBox;
use reqwest::header::{HeaderName, HeaderValue};
use scriptbox_error::FetchError;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::marshal::{copy_in, copy_out, HandleId, HandleTable};
use crate::network::{normalize_method, parse_url, FetchRequest};
use crate::timers::TimeoutRegistry;
use crate::types::{LogEntry, LogLevel};
use crate::Fetcher;

/// Largest serialized argument list accepted for one console call.
pub const MAX_LOG_ARGS_SIZE: usize = 64 * 1024;

/// Largest serialized fetch options accepted from the guest (body excluded).
const MAX_FETCH_OPTIONS_SIZE: usize = 64 * 1024;

/// Console output collected for one invocation.
#[derive(Debug)]
pub struct ConsoleBuffer {
    /// Entries in the order the host received them.
    pub entries: Vec<LogEntry>,
    /// Maximum entries kept.
    pub max_entries: usize,
    /// Entries discarded after the limit was reached.
    pub dropped: usize,
}

impl ConsoleBuffer {
    /// An empty buffer keeping at most `max_entries`.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Vec::new(),
            max_entries,
            dropped: 0,
        }
    }

    fn push(&mut self, entry: LogEntry) {
        if self.entries.len() >= self.max_entries {
            if self.dropped == 0 {
                tracing::warn!(
                    max = self.max_entries,
                    "console entry limit reached, dropping further output"
                );
            }
            self.dropped += 1;
            return;
        }
        self.entries.push(entry);
    }
}

/// Rate limiting state for `fetch` within a single invocation.
#[derive(Debug)]
pub struct FetchLimits {
    /// Maximum number of requests allowed.
    pub max_calls: usize,
    /// Maximum request body size in bytes.
    pub max_body_size: usize,
    /// Number of requests made so far.
    pub calls_made: usize,
}

/// Response bodies waiting to be read by the guest.
#[derive(Debug, Default)]
pub struct ResponseBodies(pub HandleTable<Vec<u8>>);

/// Secret shared between the host and the trusted entry module.
#[derive(Debug, Clone)]
pub struct InvocationToken(pub String);

/// Handler input, handed out once to the entry module.
#[derive(Debug)]
pub struct InvocationInput {
    /// Request parameters.
    pub params: Map<String, Value>,
    /// Secret values; exposed only when serialized for the handler.
    pub secrets: HashMap<String, SecretString>,
}

/// Raw settlement envelope written by the entry module.
#[derive(Debug, Clone)]
pub struct Settlement(pub String);

#[derive(Debug, Deserialize)]
struct GuestFetchRequest {
    url: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    headers: Vec<(String, String)>,
    #[serde(default)]
    body: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GuestFetchResponse<'a> {
    status: u16,
    status_text: &'a str,
    url: &'a str,
    headers: &'a [(String, String)],
    body: u32,
}

/// Record one console call.
#[op2(fast)]
pub fn op_sandbox_console(state: &mut OpState, #[string] level: &str, #[string] args_json: &str) {
    let level = level.parse().unwrap_or(LogLevel::Log);
    let args = match copy_in::<Vec<Value>>("console arguments", args_json, MAX_LOG_ARGS_SIZE) {
        Ok(args) => args,
        Err(e) => vec![Value::String(format!("[unloggable: {e}]"))],
    };
    state.borrow_mut::<ConsoleBuffer>().push(LogEntry {
        timestamp: Utc::now(),
        level,
        args,
    });
}

/// Issue an outbound request for guest `fetch()`.
///
/// Returns response metadata as JSON. The body stays host-side and is
/// referenced by handle.
#[op2]
#[string]
pub async fn op_sandbox_fetch(
    op_state: Rc<RefCell<OpState>>,
    #[string] request_json: String,
) -> Result<String, JsErrorBox> {
    let request = {
        let mut st = op_state.borrow_mut();
        let limits = st.borrow_mut::<FetchLimits>();
        if limits.calls_made >= limits.max_calls {
            tracing::warn!(max = limits.max_calls, "fetch limit exceeded");
            return Err(JsErrorBox::generic(format!(
                "fetch limit exceeded (max {} requests per invocation)",
                limits.max_calls
            )));
        }
        let max_body = limits.max_body_size;
        let guest: GuestFetchRequest = copy_in(
            "fetch request",
            &request_json,
            MAX_FETCH_OPTIONS_SIZE.saturating_add(max_body),
        )
        .map_err(|e| JsErrorBox::type_error(e.to_string()))?;
        let request = validate_fetch_request(guest, max_body)
            .map_err(|e| JsErrorBox::type_error(e.to_string()))?;
        limits.calls_made += 1;
        request
    };

    tracing::debug!(method = %request.method, "fetch dispatched");

    let fetcher = {
        let st = op_state.borrow();
        st.borrow::<Arc<dyn Fetcher>>().clone()
    };

    let response = fetcher
        .fetch(request)
        .await
        .map_err(|e| JsErrorBox::type_error(guest_fetch_error(&e)))?;

    let mut st = op_state.borrow_mut();
    let HandleId(body) = st.borrow_mut::<ResponseBodies>().0.insert(response.body);
    copy_out(
        "fetch response",
        &GuestFetchResponse {
            status: response.status,
            status_text: &response.status_text,
            url: &response.url,
            headers: &response.headers,
            body,
        },
        usize::MAX,
    )
    .map_err(|e| JsErrorBox::generic(e.to_string()))
}

/// Read a response body once, decoded as UTF-8.
#[op2]
#[string]
pub fn op_sandbox_body_text(state: &mut OpState, #[smi] handle: u32) -> Result<String, JsErrorBox> {
    let bytes = state
        .borrow_mut::<ResponseBodies>()
        .0
        .take(HandleId(handle))
        .map_err(|_| JsErrorBox::type_error("body has already been consumed"))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Schedule a timer and return its id.
#[op2(nofast)]
#[smi]
pub fn op_sandbox_timer_start(state: &mut OpState, delay_ms: f64) -> Result<u32, JsErrorBox> {
    let HandleId(id) = state
        .borrow_mut::<TimeoutRegistry>()
        .start(delay_ms)
        .map_err(|e| {
            tracing::warn!(error = %e, "timer limit exceeded");
            JsErrorBox::range_error(e.to_string())
        })?;
    Ok(id)
}

/// Resolve `true` when the timer fires, `false` if it was cleared first.
#[op2]
pub async fn op_sandbox_timer_wait(op_state: Rc<RefCell<OpState>>, #[smi] id: u32) -> bool {
    let armed = op_state
        .borrow_mut()
        .borrow_mut::<TimeoutRegistry>()
        .arm(HandleId(id));
    let Some(wait) = armed else {
        return false;
    };
    let fired = wait.wait().await;
    if fired {
        op_state
            .borrow_mut()
            .borrow_mut::<TimeoutRegistry>()
            .finish(HandleId(id));
    }
    fired
}

/// Cancel a pending timer. Unknown ids are ignored.
#[op2(fast)]
pub fn op_sandbox_timer_clear(state: &mut OpState, #[smi] id: u32) {
    state.borrow_mut::<TimeoutRegistry>().clear(HandleId(id));
}

/// Hand the handler input to the entry module, once.
#[op2]
#[string]
pub fn op_sandbox_request(state: &mut OpState, #[string] token: &str) -> Result<String, JsErrorBox> {
    check_token(state, token)?;
    let input = state
        .try_take::<InvocationInput>()
        .ok_or_else(|| JsErrorBox::generic("invocation input already consumed"))?;
    let secrets: Map<String, Value> = input
        .secrets
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.expose_secret().to_string())))
        .collect();
    let mut payload = Map::new();
    payload.insert("params".into(), Value::Object(input.params));
    payload.insert("secrets".into(), Value::Object(secrets));
    serde_json::to_string(&payload).map_err(|e| JsErrorBox::generic(e.to_string()))
}

/// Record the handler's settlement. Single use.
#[op2(nofast)]
pub fn op_sandbox_complete(
    state: &mut OpState,
    #[string] token: &str,
    #[string] envelope: String,
) -> Result<(), JsErrorBox> {
    check_token(state, token)?;
    if state.has::<Settlement>() {
        return Err(JsErrorBox::generic("invocation already settled"));
    }
    state.put(Settlement(envelope));
    Ok(())
}

fn check_token(state: &OpState, token: &str) -> Result<(), JsErrorBox> {
    match state.try_borrow::<InvocationToken>() {
        Some(expected) if expected.0 == token => Ok(()),
        _ => Err(JsErrorBox::generic("invalid invocation token")),
    }
}

fn validate_fetch_request(
    guest: GuestFetchRequest,
    max_body: usize,
) -> Result<FetchRequest, FetchError> {
    let url = parse_url(&guest.url)?;
    let method = normalize_method(guest.method.as_deref().unwrap_or("GET"))?;

    for (name, value) in &guest.headers {
        HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| FetchError::InvalidRequest(format!("invalid header name '{name}'")))?;
        HeaderValue::from_str(value).map_err(|_| {
            FetchError::InvalidRequest(format!("invalid value for header '{name}'"))
        })?;
    }

    if let Some(body) = &guest.body {
        if matches!(method.as_str(), "GET" | "HEAD") {
            return Err(FetchError::InvalidRequest(format!(
                "request with {method} method cannot have a body"
            )));
        }
        if body.len() > max_body {
            return Err(FetchError::InvalidRequest(format!(
                "request body too large ({} bytes, max {max_body} bytes)",
                body.len()
            )));
        }
    }

    Ok(FetchRequest {
        method,
        url: url.to_string(),
        headers: guest.headers,
        body: guest.body,
    })
}

/// Message shown to the guest when a request fails.
///
/// Transport failures carry host-side detail (resolver output, socket
/// addresses), so only their scrubbed form crosses the boundary.
fn guest_fetch_error(err: &FetchError) -> String {
    match err {
        FetchError::Connection(_) | FetchError::Internal(_) => {
            crate::redact::redact_error_message(&err.to_string())
        }
        _ => err.to_string(),
    }
}

deno_core::extension!(
    scriptbox_ext,
    ops = [
        op_sandbox_console,
        op_sandbox_fetch,
        op_sandbox_body_text,
        op_sandbox_timer_start,
        op_sandbox_timer_wait,
        op_sandbox_timer_clear,
        op_sandbox_request,
        op_sandbox_complete
    ],
);
