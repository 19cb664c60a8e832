//! Forwarding listener.
//!
//! Each listener accepts HTTP/1.1, runs the proxy header filter to pull out
//! the override destination, and forwards the request through its cluster
//! client. Upstream failures become 4xx/5xx responses generated here.

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use burrow_common::{BurrowError, BurrowResult, ListenerId};
use burrow_config::Config;

use crate::metadata::ProxyHeaderFilter;
use crate::upstream::{Body, ClusterClient};

/// Runtime state of one listener
struct ListenerRuntime {
    id: ListenerId,
    address: SocketAddr,
    filter: ProxyHeaderFilter,
    client: ClusterClient,
}

/// Listeners and cluster clients built from configuration
pub struct ProxyServer {
    listeners: Vec<ListenerRuntime>,
    clusters: HashMap<String, ClusterClient>,
}

impl ProxyServer {
    pub fn from_config(config: &Config) -> BurrowResult<Self> {
        let mut clusters = HashMap::new();
        for (id, cluster) in &config.clusters {
            let client = ClusterClient::from_config(cluster).map_err(|e| BurrowError::Config {
                message: format!("Cluster '{}' could not be initialized: {}", id, e),
                source: Some(Box::new(e)),
            })?;
            clusters.insert(id.clone(), client);
        }

        let mut listeners = Vec::with_capacity(config.listeners.len());
        for listener in &config.listeners {
            let client = clusters.get(&listener.cluster).cloned().ok_or_else(|| {
                BurrowError::config(format!(
                    "Listener '{}' references non-existent cluster '{}'",
                    listener.id, listener.cluster
                ))
            })?;
            let filter = ProxyHeaderFilter::new(&listener.proxy_header).map_err(|e| {
                BurrowError::config(format!("Listener '{}': {}", listener.id, e))
            })?;
            listeners.push(ListenerRuntime {
                id: ListenerId::new(listener.id.clone()),
                address: listener.address,
                filter,
                client,
            });
        }

        Ok(Self {
            listeners,
            clusters,
        })
    }

    pub fn cluster(&self, id: &str) -> Option<&ClusterClient> {
        self.clusters.get(id)
    }

    /// Bind every listener socket
    pub async fn bind(self) -> BurrowResult<BoundServer> {
        let mut bound = Vec::with_capacity(self.listeners.len());
        for runtime in self.listeners {
            let listener = TcpListener::bind(runtime.address).await.map_err(|e| {
                BurrowError::Io {
                    message: format!("Failed to bind listener '{}' on {}", runtime.id, runtime.address),
                    path: None,
                    source: e,
                }
            })?;
            let local = listener.local_addr()?;
            info!(listener = %runtime.id, address = %local, cluster = %runtime.client.id(), "Listener bound");
            bound.push((listener, Arc::new(runtime)));
        }

        Ok(BoundServer {
            listeners: bound,
            clusters: self.clusters.into_values().collect(),
        })
    }
}

/// A server whose sockets are bound but not yet accepting
pub struct BoundServer {
    listeners: Vec<(TcpListener, Arc<ListenerRuntime>)>,
    clusters: Vec<ClusterClient>,
}

impl BoundServer {
    /// Bound address of a listener
    pub fn local_addr(&self, listener: &str) -> Option<SocketAddr> {
        self.listeners
            .iter()
            .find(|(_, runtime)| runtime.id.as_str() == listener)
            .and_then(|(socket, _)| socket.local_addr().ok())
    }

    /// Accept connections until `shutdown` resolves
    pub async fn serve<F>(self, shutdown: F) -> BurrowResult<()>
    where
        F: Future<Output = ()>,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let reapers: Vec<_> = self
            .clusters
            .iter()
            .map(|client| client.spawn_reaper(Duration::from_secs(30)))
            .collect();

        let accept_loops: Vec<_> = self
            .listeners
            .into_iter()
            .map(|(listener, runtime)| tokio::spawn(accept_loop(listener, runtime, shutdown_rx.clone())))
            .collect();

        shutdown.await;
        info!("Shutdown requested, closing listeners");
        let _ = shutdown_tx.send(true);

        for result in join_all(accept_loops).await {
            if let Err(e) = result {
                error!(error = %e, "Listener task failed");
            }
        }
        for reaper in reapers {
            reaper.abort();
        }
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    runtime: Arc<ListenerRuntime>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(serve_connection(stream, peer, Arc::clone(&runtime)));
                }
                Err(e) => {
                    warn!(listener = %runtime.id, error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            _ = shutdown.changed() => break,
        }
    }
    debug!(listener = %runtime.id, "Listener stopped");
}

async fn serve_connection(stream: TcpStream, peer: SocketAddr, runtime: Arc<ListenerRuntime>) {
    debug!(listener = %runtime.id, peer = %peer, "Accepted downstream connection");
    let service = service_fn(move |req| handle_request(Arc::clone(&runtime), req));
    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        debug!(peer = %peer, error = %e, "Downstream connection error");
    }
}

async fn handle_request(
    runtime: Arc<ListenerRuntime>,
    mut req: Request<Incoming>,
) -> Result<Response<Body>, Infallible> {
    let destination = match runtime.filter.apply(req.headers_mut()) {
        Ok(destination) => destination,
        Err(e) => {
            warn!(listener = %runtime.id, error = %e, "Rejecting request with invalid proxy header");
            return Ok(error_response(&BurrowError::RequestValidation {
                reason: e.to_string(),
            }));
        }
    };

    let req = req.map(BodyExt::boxed);
    match runtime.client.send(req, destination).await {
        Ok(response) => Ok(response.map(BodyExt::boxed)),
        Err(e) => {
            let err = e.into_burrow_error(runtime.client.id());
            warn!(
                listener = %runtime.id,
                cluster = %runtime.client.id(),
                status = err.to_http_status(),
                error = %err,
                "Upstream request failed"
            );
            Ok(error_response(&err))
        }
    }
}

fn error_response(err: &BurrowError) -> Response<Body> {
    let body = Full::new(Bytes::from(err.client_message()))
        .map_err(|never| match never {})
        .boxed();
    let mut response = Response::new(body);
    *response.status_mut() =
        StatusCode::from_u16(err.to_http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}
