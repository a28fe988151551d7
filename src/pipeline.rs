//! The per-request pipeline: ordered middleware with short-circuit
//! semantics, the matched route handler, and endware.
//!
//! Stage order: built-ins (public-content serve, route validation, session
//! load — body and cookie parsing happen in the protocol parser), then
//! global middleware in registration order, then authentication, then route
//! middleware, then the handler, then endware (global plus whatever the
//! event queued onto its `OnEnd` list).
//!
//! Every stage reports `true` to continue or `false` to stop the pipeline
//! with the response as already set. A stage error aborts the pipeline and
//! produces a 500 with the description redacted.

use crate::auth::AuthState;
use crate::context::{Lockable, ServerContext};
use crate::endpoint::Endpoint;
use crate::ids::{ConnectionId, RequestId};
use crate::listener::tls::ClientCertificate;
use crate::protocol::http::{HttpRequest, HttpResponse};
use crate::router::RouteMatch;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

/// A pipeline stage. `Ok(true)` continues; `Ok(false)` short-circuits with
/// the response as already set; `Err` aborts with a 500.
pub trait Middleware: Send + Sync {
    fn handle(&self, event: &mut HttpEvent) -> anyhow::Result<bool>;
}

impl<F> Middleware for F
where
    F: Fn(&mut HttpEvent) -> anyhow::Result<bool> + Send + Sync,
{
    fn handle(&self, event: &mut HttpEvent) -> anyhow::Result<bool> {
        self(event)
    }
}

/// A post-response handler. Endware runs after the response is decided,
/// including on pipeline errors; its own errors are logged and swallowed.
pub trait Endware: Send + Sync {
    fn handle(&self, event: &mut HttpEvent) -> anyhow::Result<()>;
}

impl<F> Endware for F
where
    F: Fn(&mut HttpEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn handle(&self, event: &mut HttpEvent) -> anyhow::Result<()> {
        self(event)
    }
}

/// The function invoked for a matched route.
pub type RouteHandler = Arc<dyn Fn(&mut HttpEvent) -> anyhow::Result<()> + Send + Sync>;

pub fn handler<F>(f: F) -> RouteHandler
where
    F: Fn(&mut HttpEvent) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Handler that leaves the response untouched. Used by static routes and in
/// tests.
pub fn noop_handler() -> RouteHandler {
    Arc::new(|_event| Ok(()))
}

/// The session attached to this request, mirrored out of the store while
/// the worker owns the event and written back when the response is sent.
#[derive(Debug, Clone)]
pub struct SessionBinding {
    pub id: String,
    pub signed: String,
    pub data: HashMap<String, Value>,
    /// Allocated during this request (no valid id arrived with it).
    pub new: bool,
    /// When set, the session is revoked instead of saved.
    pub revoked: bool,
}

impl SessionBinding {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.data.remove(key)
    }
}

/// Everything a worker knows about one in-flight HTTP request.
pub struct HttpEvent {
    pub request_id: RequestId,
    pub connection_id: ConnectionId,
    pub remote_addr: SocketAddr,
    pub endpoint: Arc<Endpoint>,
    pub request: HttpRequest,
    pub response: HttpResponse,
    pub route: Option<RouteMatch>,
    /// Per-request data bag shared across stages.
    pub data: HashMap<String, Value>,
    pub auth: Option<AuthState>,
    pub session: Option<SessionBinding>,
    /// Endware queued for this event only.
    pub on_end: Vec<Arc<dyn Endware>>,
    pub client_certificate: Option<ClientCertificate>,
    /// The server-wide lockable, for shared-state access from handlers.
    pub runtime: Arc<Lockable>,
}

impl HttpEvent {
    pub fn new(
        connection_id: ConnectionId,
        remote_addr: SocketAddr,
        endpoint: Arc<Endpoint>,
        request: HttpRequest,
        runtime: Arc<Lockable>,
    ) -> Self {
        Self {
            request_id: RequestId::new(),
            connection_id,
            remote_addr,
            endpoint,
            request,
            response: HttpResponse::new(),
            route: None,
            data: HashMap::new(),
            auth: None,
            session: None,
            on_end: Vec::new(),
            client_certificate: None,
            runtime,
        }
    }

    /// A bound path parameter from the matched route.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.route
            .as_ref()
            .and_then(|m| m.params.get(name))
            .map(String::as_str)
    }

    pub fn query(&self, name: &str) -> Option<&str> {
        self.request.query.get(name).map(String::as_str)
    }

    /// Queue endware to run after this request's response.
    pub fn on_end<F>(&mut self, f: F)
    where
        F: Fn(&mut HttpEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_end.push(Arc::new(f));
    }

    /// Shared-state access under the server lockable.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut crate::state::SharedState) -> R) -> R {
        let mut runtime = self.runtime.lock().unwrap();
        f(&mut runtime.state)
    }
}

/// Run the full pipeline for one event. Infallible from the caller's view:
/// errors become the response.
pub fn process(ctx: &ServerContext, event: &mut HttpEvent) {
    if let Err(err) = run_stages(ctx, event) {
        tracing::error!(
            request_id = %event.request_id,
            method = %event.request.method,
            path = %event.request.path,
            error = %err,
            "pipeline error"
        );
        // The description stays in the log; the client gets a redacted body.
        event.response = HttpResponse::new();
        event
            .response
            .status(500)
            .json(&json!({ "error": "Internal Server Error" }));
    }
    save_session(ctx, event);
    run_endware(ctx, event);
}

fn run_stages(ctx: &ServerContext, event: &mut HttpEvent) -> anyhow::Result<()> {
    lookup_route(ctx, event);

    if !serve_public(event)? {
        return Ok(());
    }
    if !validate_route(event)? {
        return Ok(());
    }
    if !load_session(ctx, event)? {
        return Ok(());
    }
    for mw in &ctx.middleware {
        if !mw.handle(event)? {
            return Ok(());
        }
    }
    if !crate::auth::authenticate(ctx, event)? {
        return Ok(());
    }
    let Some(matched) = event.route.clone() else {
        return Ok(());
    };
    for mw in &matched.route.middleware {
        if !mw.handle(event)? {
            return Ok(());
        }
    }
    (matched.route.handler)(event)
}

fn lookup_route(ctx: &ServerContext, event: &mut HttpEvent) {
    let endpoint_name = event.endpoint.name.clone();
    event.route = ctx.router.route(
        &event.request.method,
        &event.request.path,
        endpoint_name.as_deref(),
    );
}

/// Built-in: serve static content when the matched route mounts it.
fn serve_public(event: &mut HttpEvent) -> anyhow::Result<bool> {
    let Some(matched) = event.route.clone() else {
        return Ok(true);
    };
    let Some(mount) = &matched.route.static_mount else {
        return Ok(true);
    };

    let sub_path = matched.remainder.clone().unwrap_or_default();
    match mount.load(&sub_path) {
        Ok((bytes, content_type)) => {
            event.response.bytes(content_type, bytes);
            if let Some(cache) = mount.cache_control() {
                event.response.set_header("Cache-Control", cache);
            }
        }
        Err(_) => {
            event
                .response
                .status(404)
                .json(&json!({ "error": "Not Found" }));
        }
    }
    Ok(false)
}

/// Built-in: 404 when nothing matched.
fn validate_route(event: &mut HttpEvent) -> anyhow::Result<bool> {
    if event.route.is_some() {
        return Ok(true);
    }
    tracing::debug!(
        method = %event.request.method,
        path = %event.request.path,
        "no route, responding 404"
    );
    event
        .response
        .status(404)
        .json(&json!({ "error": "Not Found" }));
    Ok(false)
}

/// Built-in: read, verify and mirror the caller's session; allocate a fresh
/// one when none arrived.
fn load_session(ctx: &ServerContext, event: &mut HttpEvent) -> anyhow::Result<bool> {
    if !ctx.sessions_enabled() {
        return Ok(true);
    }

    let binding_hash = crate::session::binding_hash(
        &event.remote_addr.ip().to_string(),
        event.request.user_agent().unwrap_or(""),
    );

    let mut runtime = event.runtime.lock().unwrap();
    let Some(store) = runtime.sessions.as_mut() else {
        return Ok(true);
    };

    let config = store.config().clone();
    let incoming = if config.use_headers {
        event.request.header(&config.name).map(str::to_string)
    } else {
        event.request.cookies.get(&config.name).cloned()
    };

    let session = incoming
        .as_deref()
        .and_then(|signed| store.resolve(signed, Some(&binding_hash)))
        .map(|s| (s.id.clone(), s.data.clone(), false));

    let (id, data, new) = match session {
        Some(s) => s,
        None => {
            let created = store.create(Some(binding_hash));
            (created.id.clone(), created.data.clone(), true)
        }
    };
    let signed = store.sign(&id);
    drop(runtime);

    event.session = Some(SessionBinding {
        id,
        signed,
        data,
        new,
        revoked: false,
    });
    Ok(true)
}

/// Write the session's data bag back to the store and stamp its identifier
/// onto the response.
fn save_session(ctx: &ServerContext, event: &mut HttpEvent) {
    let Some(binding) = event.session.clone() else {
        return;
    };
    let Some(config) = ctx.session_config() else {
        return;
    };

    {
        let mut runtime = event.runtime.lock().unwrap();
        if let Some(store) = runtime.sessions.as_mut() {
            if binding.revoked {
                store.revoke(&binding.id);
            } else if let Some(session) = store.get_mut(&binding.id) {
                session.data = binding.data.clone();
            }
        }
    }

    if binding.revoked {
        return;
    }
    if config.use_headers {
        event.response.set_header(&config.name, binding.signed);
    } else {
        event.response.cookie(format!(
            "{}={}; Path=/; HttpOnly",
            config.name, binding.signed
        ));
    }
}

fn run_endware(ctx: &ServerContext, event: &mut HttpEvent) {
    let queued: Vec<_> = ctx
        .endware
        .iter()
        .cloned()
        .chain(std::mem::take(&mut event.on_end))
        .collect();
    for endware in queued {
        if let Err(err) = endware.handle(event) {
            tracing::error!(request_id = %event.request_id, error = %err, "endware error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ServerContext;
    use crate::endpoint::{Endpoint, Protocol};
    use crate::protocol::http::parse_request;
    use crate::router::Route;
    use http::Method;
    use std::io::BufReader;

    fn request(raw: &str) -> HttpRequest {
        let mut reader = BufReader::new(raw.as_bytes());
        parse_request(&mut reader, 1024 * 1024).unwrap().unwrap()
    }

    fn event_for(ctx: &ServerContext, raw: &str) -> HttpEvent {
        HttpEvent::new(
            ConnectionId::new(),
            "127.0.0.1:50000".parse().unwrap(),
            Arc::new(Endpoint::new(Protocol::Http, "127.0.0.1", 8080).unwrap()),
            request(raw),
            ctx.runtime(),
        )
    }

    #[test]
    fn handler_runs_for_matched_route() {
        let mut ctx = ServerContext::new();
        ctx.router
            .add(
                Route::new(
                    Some(Method::GET),
                    "/ping",
                    handler(|event| {
                        event.response.text("pong");
                        Ok(())
                    }),
                )
                .unwrap(),
            )
            .unwrap();

        let mut event = event_for(&ctx, "GET /ping HTTP/1.1\r\n\r\n");
        process(&ctx, &mut event);
        assert_eq!(event.response.status, 200);
        assert_eq!(event.response.body, b"pong");
    }

    #[test]
    fn unmatched_route_responds_404() {
        let ctx = ServerContext::new();
        let mut event = event_for(&ctx, "GET /missing HTTP/1.1\r\n\r\n");
        process(&ctx, &mut event);
        assert_eq!(event.response.status, 404);
    }

    #[test]
    fn middleware_short_circuits() {
        let mut ctx = ServerContext::new();
        ctx.router
            .add(
                Route::new(
                    Some(Method::GET),
                    "/x",
                    handler(|_| panic!("handler must not run")),
                )
                .unwrap(),
            )
            .unwrap();
        ctx.middleware
            .push(Arc::new(|event: &mut HttpEvent| -> anyhow::Result<bool> {
                event.response.status(403).text("blocked");
                Ok(false)
            }));

        let mut event = event_for(&ctx, "GET /x HTTP/1.1\r\n\r\n");
        process(&ctx, &mut event);
        assert_eq!(event.response.status, 403);
    }

    #[test]
    fn handler_error_becomes_redacted_500() {
        let mut ctx = ServerContext::new();
        ctx.router
            .add(
                Route::new(
                    Some(Method::GET),
                    "/boom",
                    handler(|_| Err(anyhow::anyhow!("secret database password leaked"))),
                )
                .unwrap(),
            )
            .unwrap();

        let mut event = event_for(&ctx, "GET /boom HTTP/1.1\r\n\r\n");
        process(&ctx, &mut event);
        assert_eq!(event.response.status, 500);
        let body = String::from_utf8(event.response.body.clone()).unwrap();
        assert!(!body.contains("secret"));
    }

    #[test]
    fn endware_runs_after_handler_and_on_error() {
        let mut ctx = ServerContext::new();
        ctx.router
            .add(
                Route::new(
                    Some(Method::GET),
                    "/boom",
                    handler(|_| Err(anyhow::anyhow!("nope"))),
                )
                .unwrap(),
            )
            .unwrap();
        ctx.endware
            .push(Arc::new(|event: &mut HttpEvent| -> anyhow::Result<()> {
                event.response.set_header("X-Seen", "1");
                Ok(())
            }));

        let mut event = event_for(&ctx, "GET /boom HTTP/1.1\r\n\r\n");
        process(&ctx, &mut event);
        assert_eq!(event.response.status, 500);
        assert_eq!(event.response.get_header("x-seen"), Some("1"));
    }

    #[test]
    fn per_event_on_end_runs_once() {
        let mut ctx = ServerContext::new();
        ctx.router
            .add(
                Route::new(
                    Some(Method::GET),
                    "/x",
                    handler(|event| {
                        event.on_end(|e| {
                            e.response.set_header("X-From-OnEnd", "yes");
                            Ok(())
                        });
                        Ok(())
                    }),
                )
                .unwrap(),
            )
            .unwrap();

        let mut event = event_for(&ctx, "GET /x HTTP/1.1\r\n\r\n");
        process(&ctx, &mut event);
        assert_eq!(event.response.get_header("x-from-onend"), Some("yes"));
        assert!(event.on_end.is_empty());
    }

    #[test]
    fn session_allocated_and_cookie_stamped() {
        let mut ctx = ServerContext::new();
        ctx.enable_sessions(crate::session::SessionConfig::new("secret"));
        ctx.router
            .add(Route::new(Some(Method::GET), "/s", noop_handler()).unwrap())
            .unwrap();

        let mut event = event_for(&ctx, "GET /s HTTP/1.1\r\n\r\n");
        process(&ctx, &mut event);
        let binding = event.session.as_ref().unwrap();
        assert!(binding.new);
        let mut out = Vec::new();
        event.response.write_to(&mut out, false).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains(&format!(
            "Set-Cookie: pode.sid={}; Path=/; HttpOnly",
            binding.signed
        )));
    }

    #[test]
    fn session_data_persists_across_requests() {
        let mut ctx = ServerContext::new();
        ctx.enable_sessions(crate::session::SessionConfig::new("secret"));
        ctx.router
            .add(
                Route::new(
                    Some(Method::GET),
                    "/count",
                    handler(|event| {
                        let session = event.session.as_mut().unwrap();
                        let n = session
                            .get("views")
                            .and_then(Value::as_i64)
                            .unwrap_or(0)
                            + 1;
                        session.set("views", json!(n));
                        Ok(())
                    }),
                )
                .unwrap(),
            )
            .unwrap();

        let mut first = event_for(&ctx, "GET /count HTTP/1.1\r\n\r\n");
        process(&ctx, &mut first);
        let signed = first.session.as_ref().unwrap().signed.clone();

        let raw = format!("GET /count HTTP/1.1\r\nCookie: pode.sid={signed}\r\n\r\n");
        let mut second = event_for(&ctx, &raw);
        // Same remote and user agent, so the strict binding hash matches.
        process(&ctx, &mut second);
        let binding = second.session.as_ref().unwrap();
        assert!(!binding.new);
        assert_eq!(binding.get("views"), Some(&json!(2)));
    }
}
