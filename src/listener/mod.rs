//! Socket listeners: one accept loop per endpoint, handing accepted
//! connections to the worker pool as request contexts.

pub mod tls;

use crate::connection::RequestContext;
use crate::context::ServerContext;
use crate::endpoint::{Endpoint, Host};
use crate::error::{Error, Result};
use crate::scheduler::WorkItem;
use may::net::TcpListener;
use may::sync::mpsc;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// A running set of accept loops. Dropping the handle does not stop them;
/// call [`Listener::stop`].
pub struct Listener {
    handles: Vec<may::coroutine::JoinHandle<()>>,
    bound: Vec<(String, SocketAddr)>,
}

impl Listener {
    /// The addresses actually bound, paired with the endpoint description.
    /// Port 0 endpoints show their assigned port here.
    pub fn bound_addrs(&self) -> &[(String, SocketAddr)] {
        &self.bound
    }

    /// Stop accepting: cancel and join every accept loop.
    pub fn stop(self) {
        for handle in self.handles {
            unsafe {
                handle.coroutine().cancel();
            }
            let _ = handle.join();
        }
    }
}

fn resolve_bind_addr(endpoint: &Endpoint) -> Result<SocketAddr> {
    match &endpoint.host {
        Host::Any => Ok(SocketAddr::new(endpoint.host.bind_ip(), endpoint.port)),
        Host::Ip(ip) => Ok(SocketAddr::new(*ip, endpoint.port)),
        Host::Name(name) => (name.as_str(), endpoint.port)
            .to_socket_addrs()
            .map_err(|e| Error::Bind {
                endpoint: endpoint.to_string(),
                source: e,
            })?
            .next()
            .ok_or_else(|| Error::Bind {
                endpoint: endpoint.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("hostname {name} did not resolve"),
                ),
            }),
    }
}

fn bind(endpoint: &Endpoint) -> Result<TcpListener> {
    let addr = resolve_bind_addr(endpoint)?;
    TcpListener::bind(addr).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied && endpoint.requires_elevation() {
            Error::Bind {
                endpoint: endpoint.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    format!(
                        "binding port {} requires elevated privileges",
                        endpoint.port
                    ),
                ),
            }
        } else {
            Error::Bind {
                endpoint: endpoint.to_string(),
                source: e,
            }
        }
    })
}

/// Bind every configured endpoint and start its accept loop.
///
/// Binding and TLS material loading happen synchronously so configuration
/// and bind failures are fatal at startup, before any traffic is accepted.
pub fn start(
    ctx: Arc<ServerContext>,
    queue: mpsc::Sender<WorkItem>,
    stack_size: usize,
) -> Result<Listener> {
    let mut handles = Vec::new();
    let mut bound = Vec::new();

    for endpoint in ctx.endpoints.iter() {
        let endpoint = Arc::new(endpoint.clone());
        let listener = bind(&endpoint)?;
        let local = listener.local_addr().map_err(Error::Io)?;
        bound.push((endpoint.to_string(), local));

        let tls_config = if endpoint.protocol.is_secure() {
            Some(tls::server_config(&endpoint)?)
        } else {
            None
        };

        info!(endpoint = %endpoint, addr = %local, "listening");

        let queue = queue.clone();
        let accept_endpoint = endpoint.clone();
        let handle = unsafe {
            may::coroutine::Builder::new()
                .name(format!("pode-listen-{local}"))
                .stack_size(stack_size)
                .spawn(move || loop {
                    match listener.accept() {
                        Ok((socket, remote_addr)) => {
                            debug!(endpoint = %accept_endpoint, remote = %remote_addr, "accepted");
                            let context = RequestContext::new(
                                socket,
                                remote_addr,
                                accept_endpoint.clone(),
                                tls_config.clone(),
                            );
                            if queue.send(WorkItem::Connection(context)).is_err() {
                                debug!(endpoint = %accept_endpoint, "worker queue closed, accept loop exiting");
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(endpoint = %accept_endpoint, error = %e, "accept failed");
                        }
                    }
                })
        }
        .map_err(|e| {
            error!(endpoint = %endpoint, error = %e, "failed to spawn accept loop");
            Error::Io(e)
        })?;
        handles.push(handle);
    }

    Ok(Listener { handles, bound })
}
