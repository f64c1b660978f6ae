//! Service host: the listening side of one fleet service.
//!
//! A `Service` binds the endpoint its own coordinate resolves to, accepts
//! connections forever, and runs one [`Dispatcher`] per peer against the
//! host's method registry. It also caches one [`RpcClient`] per remote
//! coordinate so repeated `connect_to` calls share a manager.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use fleet_config::{Address, ServiceCoord, ServiceDirectory};

use crate::client::RpcClient;
use crate::connection::Connection;
use crate::dispatch::{CallContext, Dispatcher, HandlerError, MethodRegistry};
use crate::RpcError;

/// Retry interval used for service-to-service links, as deployed fleet-wide.
pub const DEFAULT_AUTO_RETRY: Duration = Duration::from_millis(500);

/// Maps an accepted peer to the caller identity bound to its connection.
/// Returning `None` rejects the connection before dispatch starts.
pub type IdentityProvider = Arc<dyn Fn(SocketAddr) -> Option<Value> + Send + Sync>;

pub struct Service {
    coord: ServiceCoord,
    address: Address,
    directory: Arc<ServiceDirectory>,
    registry: Arc<MethodRegistry>,
    grants: HashSet<String>,
    identity_provider: Option<IdentityProvider>,
    remotes: StdMutex<HashMap<ServiceCoord, Arc<RpcClient>>>,
    shutdown: CancellationToken,
}

impl Service {
    /// Build the host for `name:shard`, resolving its own listen address
    /// from the directory. The built-in `ping` method is added unless the
    /// registry already defines one.
    pub fn new(
        name: impl Into<String>,
        shard: u32,
        directory: Arc<ServiceDirectory>,
        mut registry: MethodRegistry,
    ) -> Result<Self, RpcError> {
        let coord = ServiceCoord::new(name, shard);
        let address = directory.address_of(&coord)?;
        if !registry.contains("ping") {
            registry.register("ping", ping);
        }
        Ok(Self {
            coord,
            address,
            directory,
            registry: Arc::new(registry),
            grants: HashSet::new(),
            identity_provider: None,
            remotes: StdMutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn coord(&self) -> &ServiceCoord {
        &self.coord
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Grant a permission tag to every inbound connection this host serves.
    pub fn grant(&mut self, permission: impl Into<String>) {
        self.grants.insert(permission.into());
    }

    /// Install the collaborator that derives a caller identity per accepted
    /// peer; connections it refuses are closed before dispatch starts.
    pub fn set_identity_provider(&mut self, provider: IdentityProvider) {
        self.identity_provider = Some(provider);
    }

    /// Bind the configured endpoint and serve until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> Result<(), RpcError> {
        let listener =
            TcpListener::bind((self.address.host.as_str(), self.address.port)).await?;
        log::info!("service {} started on <{}>", self.coord, self.address);
        self.serve_on(listener).await
    }

    /// Accept loop on an already-bound listener.
    ///
    /// Shutdown stops accepting; connections already accepted finalize
    /// naturally on peer disconnect. Outbound managers are disconnected on
    /// the way out.
    pub async fn serve_on(&self, listener: TcpListener) -> Result<(), RpcError> {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.accept_connection(stream, peer),
                    Err(err) => log::warn!("service {}: accept failed: {err}", self.coord),
                },
            }
        }

        log::info!("service {} stopped accepting", self.coord);
        self.disconnect_all().await;
        Ok(())
    }

    /// Stop the accept loop. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Obtain the shared call manager for a remote coordinate, creating and
    /// connecting it on first use (with [`DEFAULT_AUTO_RETRY`]).
    pub fn connect_to(&self, coord: ServiceCoord) -> Result<Arc<RpcClient>, RpcError> {
        let mut remotes = self.remotes.lock().expect("remotes lock poisoned");
        if let Some(client) = remotes.get(&coord) {
            return Ok(client.clone());
        }
        let client = RpcClient::new(
            coord.clone(),
            self.directory.clone(),
            Some(DEFAULT_AUTO_RETRY),
        )?;
        client.connect()?;
        remotes.insert(coord, client.clone());
        Ok(client)
    }

    fn accept_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let identity = match &self.identity_provider {
            Some(provider) => match provider(peer) {
                Some(identity) => Some(identity),
                None => {
                    log::warn!("service {}: rejected peer <{peer}>: unknown caller", self.coord);
                    return;
                }
            },
            None => None,
        };

        log::info!("service {}: client connected <{peer}>", self.coord);
        let registry = self.registry.clone();
        let grants = self.grants.clone();
        let coord = self.coord.clone();
        tokio::spawn(async move {
            let connection = Arc::new(Connection::new());
            connection.initialize(stream).await;

            let mut dispatcher = Dispatcher::new(registry).with_grants(grants);
            if let Some(identity) = identity {
                dispatcher = dispatcher.with_identity(identity);
            }
            dispatcher.serve(connection).await;
            log::info!("service {coord}: client disconnected <{peer}>");
        });
    }

    async fn disconnect_all(&self) {
        let remotes: Vec<Arc<RpcClient>> = {
            let mut remotes = self.remotes.lock().expect("remotes lock poisoned");
            remotes.drain().map(|(_, client)| client).collect()
        };
        for client in remotes {
            client.disconnect().await;
        }
    }
}

/// Liveness check: echoes the string it was given, `"ping"` by default.
async fn ping(params: Value, _context: CallContext) -> Result<Value, HandlerError> {
    let reply = match &params {
        Value::Object(map) => map.get("string").cloned(),
        Value::Array(items) => items.first().cloned(),
        _ => None,
    };
    Ok(reply.unwrap_or_else(|| Value::String("ping".to_string())))
}
