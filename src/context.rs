//! Process-wide server state.
//!
//! [`ServerContext`] is split along the concurrency model: the route table,
//! auth registry, endpoint set and handler lists are configure-once and read
//! without locking; everything mutable at runtime (shared state, sessions,
//! timer and schedule registries, restart bookkeeping) lives in
//! [`RuntimeState`] behind the single server-wide lockable.

use crate::auth::AuthRegistry;
use crate::config::ServerConfig;
use crate::endpoint::EndpointSet;
use crate::error::{Error, Result};
use crate::ids::ConnectionId;
use crate::pipeline::{Endware, Middleware};
use crate::protocol::smtp::SmtpMessage;
use crate::protocol::websocket::WsFrame;
use crate::router::Router;
use crate::scheduler::{Schedule, Timer};
use crate::session::{SessionConfig, SessionStore};
use crate::state::SharedState;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

/// The single reentrant-free mutual-exclusion primitive protecting shared
/// runtime state. Scoped guards guarantee release on all exit paths.
pub type Lockable = may::sync::Mutex<RuntimeState>;

/// State mutable while the server runs. All access goes through the
/// lockable.
#[derive(Default)]
pub struct RuntimeState {
    pub state: SharedState,
    pub sessions: Option<SessionStore>,
    pub timers: HashMap<String, Timer>,
    pub schedules: HashMap<String, Schedule>,
    pub restart_count: u32,
    pub last_restart: Option<DateTime<Utc>>,
}

impl RuntimeState {
    pub fn add_timer(&mut self, timer: Timer) -> Result<()> {
        if self.timers.contains_key(&timer.name) {
            return Err(Error::config(format!(
                "a timer named '{}' is already defined",
                timer.name
            )));
        }
        self.timers.insert(timer.name.clone(), timer);
        Ok(())
    }

    pub fn add_schedule(&mut self, schedule: Schedule) -> Result<()> {
        if self.schedules.contains_key(&schedule.name) {
            return Err(Error::config(format!(
                "a schedule named '{}' is already defined",
                schedule.name
            )));
        }
        self.schedules.insert(schedule.name.clone(), schedule);
        Ok(())
    }

    pub fn note_restart(&mut self) {
        self.restart_count += 1;
        self.last_restart = Some(Utc::now());
    }
}

/// Event for one received SMTP message.
pub struct SmtpEvent {
    pub message: SmtpMessage,
    pub remote_addr: SocketAddr,
    pub runtime: Arc<Lockable>,
}

pub type SmtpHandler = Arc<dyn Fn(&mut SmtpEvent) -> anyhow::Result<()> + Send + Sync>;

/// Event for one chunk of data read from a raw TCP connection. Whatever the
/// handler puts in `response` is written back to the peer.
pub struct TcpEvent {
    pub data: Vec<u8>,
    pub remote_addr: SocketAddr,
    pub response: Vec<u8>,
    /// Ask the connection loop to close after responding.
    pub close: bool,
    pub runtime: Arc<Lockable>,
}

pub type TcpHandler = Arc<dyn Fn(&mut TcpEvent) -> anyhow::Result<()> + Send + Sync>;

/// Event for one received WebSocket message. Frames pushed onto `replies`
/// are written back to the same client.
pub struct WsEvent {
    pub client_id: ConnectionId,
    pub path: String,
    pub frame: WsFrame,
    pub remote_addr: SocketAddr,
    pub replies: Vec<WsFrame>,
    pub runtime: Arc<Lockable>,
}

impl WsEvent {
    pub fn reply(&mut self, frame: WsFrame) {
        self.replies.push(frame);
    }
}

pub type WsHandler = Arc<dyn Fn(&mut WsEvent) -> anyhow::Result<()> + Send + Sync>;

/// The set of open, upgraded WebSocket connections, supporting
/// server-initiated sends to one client or to all of them.
#[derive(Clone, Default)]
pub struct WsRegistry {
    inner: Arc<std::sync::Mutex<HashMap<ConnectionId, may::sync::mpsc::Sender<WsFrame>>>>,
}

impl WsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: ConnectionId, outbox: may::sync::mpsc::Sender<WsFrame>) {
        self.inner.lock().unwrap().insert(id, outbox);
    }

    pub fn unregister(&self, id: ConnectionId) {
        self.inner.lock().unwrap().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    /// Queue a frame for one client. `false` when the client is gone.
    pub fn send_to(&self, id: ConnectionId, frame: WsFrame) -> bool {
        let guard = self.inner.lock().unwrap();
        match guard.get(&id) {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    /// Queue a frame for every open client; returns how many received it.
    pub fn broadcast(&self, frame: WsFrame) -> usize {
        let guard = self.inner.lock().unwrap();
        guard
            .values()
            .filter(|tx| tx.send(frame.clone()).is_ok())
            .count()
    }
}

/// Process-wide state: endpoints, routes, auth registry, handler lists,
/// configuration and the lockable runtime.
pub struct ServerContext {
    pub endpoints: EndpointSet,
    pub router: Router,
    pub auth: AuthRegistry,
    /// Global middleware, run in registration order after the built-ins.
    pub middleware: Vec<Arc<dyn Middleware>>,
    /// Global endware, run after every response.
    pub endware: Vec<Arc<dyn Endware>>,
    pub smtp_handlers: Vec<SmtpHandler>,
    pub tcp_handlers: Vec<TcpHandler>,
    /// WebSocket handlers keyed by upgrade path.
    pub ws_handlers: HashMap<String, WsHandler>,
    pub websockets: WsRegistry,
    pub config: ServerConfig,
    session_config: Option<SessionConfig>,
    runtime: Arc<Lockable>,
}

impl Default for ServerContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerContext {
    pub fn new() -> Self {
        Self {
            endpoints: EndpointSet::new(),
            router: Router::new(),
            auth: AuthRegistry::new(),
            middleware: Vec::new(),
            endware: Vec::new(),
            smtp_handlers: Vec::new(),
            tcp_handlers: Vec::new(),
            ws_handlers: HashMap::new(),
            websockets: WsRegistry::new(),
            config: ServerConfig::default(),
            session_config: None,
            runtime: Arc::new(may::sync::Mutex::new(RuntimeState::default())),
        }
    }

    pub fn with_config(config: ServerConfig) -> Self {
        let mut ctx = Self::new();
        ctx.config = config;
        ctx
    }

    /// A handle on the server-wide lockable.
    pub fn runtime(&self) -> Arc<Lockable> {
        self.runtime.clone()
    }

    /// Turn sessions on. Safe to call once during setup.
    ///
    /// Also installs a minutely sweep timer that drops expired sessions.
    pub fn enable_sessions(&mut self, config: SessionConfig) {
        let mut rt = self.runtime.lock().unwrap();
        rt.sessions = Some(SessionStore::new(config.clone()));
        let _ = rt.add_timer(Timer::new(
            "__pode_sessions_cleanup__",
            std::time::Duration::from_secs(60),
            |event| {
                let mut runtime = event.runtime.lock().unwrap();
                if let Some(store) = runtime.sessions.as_mut() {
                    let purged = store.purge_expired();
                    if purged > 0 {
                        tracing::debug!(purged, "expired sessions removed");
                    }
                }
                Ok(())
            },
        ));
        drop(rt);
        self.session_config = Some(config);
    }

    pub fn sessions_enabled(&self) -> bool {
        self.session_config.is_some()
    }

    pub fn session_config(&self) -> Option<&SessionConfig> {
        self.session_config.as_ref()
    }

    pub fn add_middleware<M: Middleware + 'static>(&mut self, middleware: M) {
        self.middleware.push(Arc::new(middleware));
    }

    pub fn add_endware<E: Endware + 'static>(&mut self, endware: E) {
        self.endware.push(Arc::new(endware));
    }

    pub fn add_smtp_handler<F>(&mut self, handler: F)
    where
        F: Fn(&mut SmtpEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.smtp_handlers.push(Arc::new(handler));
    }

    pub fn add_tcp_handler<F>(&mut self, handler: F)
    where
        F: Fn(&mut TcpEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.tcp_handlers.push(Arc::new(handler));
    }

    pub fn add_ws_handler<F>(&mut self, path: &str, handler: F)
    where
        F: Fn(&mut WsEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let path = if path.starts_with('/') {
            path.trim_end_matches('/').to_string()
        } else {
            format!("/{}", path.trim_end_matches('/'))
        };
        let path = if path.is_empty() { "/".to_string() } else { path };
        self.ws_handlers.insert(path, Arc::new(handler));
    }

    pub fn ws_handler_for(&self, path: &str) -> Option<&WsHandler> {
        let normalized = path.trim_end_matches('/');
        let key = if normalized.is_empty() { "/" } else { normalized };
        self.ws_handlers.get(key)
    }

    /// Add a timer to the runtime registry.
    pub fn add_timer(&self, timer: Timer) -> Result<()> {
        self.runtime.lock().unwrap().add_timer(timer)
    }

    /// Add a schedule to the runtime registry.
    pub fn add_schedule(&self, schedule: Schedule) -> Result<()> {
        self.runtime.lock().unwrap().add_schedule(schedule)
    }

    /// Persist shared state to disk, optionally filtered by scope.
    pub fn save_state(&self, path: impl AsRef<Path>, scope: &[String]) -> Result<()> {
        self.runtime.lock().unwrap().state.save(path, scope)
    }

    /// Restore shared state from disk, optionally filtered by scope.
    pub fn restore_state(&self, path: impl AsRef<Path>, scope: &[String]) -> Result<()> {
        self.runtime.lock().unwrap().state.restore(path, scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::websocket::WsFrame;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn runtime_state_round_trips_through_lockable() {
        let ctx = ServerContext::new();
        {
            let runtime = ctx.runtime();
            let mut rt = runtime.lock().unwrap();
            rt.state.set("k", json!(1));
        }
        let rt = ctx.runtime();
        let guard = rt.lock().unwrap();
        assert_eq!(guard.state.get("k"), Some(&json!(1)));
    }

    #[test]
    fn duplicate_timer_names_rejected() {
        let ctx = ServerContext::new();
        ctx.add_timer(Timer::new("t", Duration::from_secs(5), |_| Ok(())))
            .unwrap();
        assert!(ctx
            .add_timer(Timer::new("t", Duration::from_secs(9), |_| Ok(())))
            .is_err());
    }

    #[test]
    fn ws_registry_send_and_broadcast() {
        let registry = WsRegistry::new();
        let (tx_a, rx_a) = may::sync::mpsc::channel();
        let (tx_b, rx_b) = may::sync::mpsc::channel();
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        registry.register(a, tx_a);
        registry.register(b, tx_b);

        assert!(registry.send_to(a, WsFrame::Text("only a".into())));
        assert_eq!(registry.broadcast(WsFrame::Text("all".into())), 2);

        assert_eq!(rx_a.try_recv().unwrap(), WsFrame::Text("only a".into()));
        assert_eq!(rx_a.try_recv().unwrap(), WsFrame::Text("all".into()));
        assert_eq!(rx_b.try_recv().unwrap(), WsFrame::Text("all".into()));

        registry.unregister(a);
        assert!(!registry.send_to(a, WsFrame::Text("gone".into())));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn ws_handler_path_normalization() {
        let mut ctx = ServerContext::new();
        ctx.add_ws_handler("chat/", |_| Ok(()));
        assert!(ctx.ws_handler_for("/chat").is_some());
        assert!(ctx.ws_handler_for("/chat/").is_some());
        assert!(ctx.ws_handler_for("/other").is_none());
    }

    #[test]
    fn restart_bookkeeping() {
        let ctx = ServerContext::new();
        {
            let runtime = ctx.runtime();
            let mut rt = runtime.lock().unwrap();
            rt.note_restart();
            rt.note_restart();
        }
        let rt = ctx.runtime();
        let guard = rt.lock().unwrap();
        assert_eq!(guard.restart_count, 2);
        assert!(guard.last_restart.is_some());
    }
}
