//! Outbound call manager (client role).
//!
//! One `RpcClient` owns the outbound connection to one service coordinate:
//! it correlates responses to pending calls by request id and runs the
//! background connect/reconnect loop. Responses that match nothing — late
//! arrivals from a torn-down cycle, or envelopes with bad fields — are
//! dropped as noise, never reported.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use fleet_config::{ServiceCoord, ServiceDirectory};
use fleet_wire::{decode_value, encode_frame, Request, Response};

use crate::connection::{Connection, Observer};
use crate::RpcError;

struct PendingCall {
    method: String,
    resolve: oneshot::Sender<Result<Value, RpcError>>,
}

type PendingMap = StdMutex<HashMap<String, PendingCall>>;

/// Client side of one service-to-service link.
///
/// Construction resolves the coordinate once to validate it; the reconnect
/// loop re-resolves on every attempt. At most one loop runs per client.
pub struct RpcClient {
    coord: ServiceCoord,
    directory: Arc<ServiceDirectory>,
    auto_retry: Option<Duration>,
    connection: StdMutex<Arc<Connection>>,
    pending: PendingMap,
    connecting: AtomicBool,
    loop_cancel: StdMutex<Option<CancellationToken>>,
    on_connect: Arc<StdMutex<Vec<Observer>>>,
    on_disconnect: Arc<StdMutex<Vec<Observer>>>,
}

impl RpcClient {
    /// Create a manager for `coord`.
    ///
    /// Fails synchronously when the coordinate has no configured address.
    /// With `auto_retry` set, the connect loop retries failed cycles after
    /// that interval forever; without it, each `connect()` makes exactly
    /// one attempt cycle.
    pub fn new(
        coord: ServiceCoord,
        directory: Arc<ServiceDirectory>,
        auto_retry: Option<Duration>,
    ) -> Result<Arc<Self>, RpcError> {
        directory.address_of(&coord)?;
        Ok(Arc::new(Self {
            coord,
            directory,
            auto_retry,
            connection: StdMutex::new(Arc::new(Connection::new())),
            pending: StdMutex::new(HashMap::new()),
            connecting: AtomicBool::new(false),
            loop_cancel: StdMutex::new(None),
            on_connect: Arc::new(StdMutex::new(Vec::new())),
            on_disconnect: Arc::new(StdMutex::new(Vec::new())),
        }))
    }

    pub fn coord(&self) -> &ServiceCoord {
        &self.coord
    }

    pub fn is_connected(&self) -> bool {
        self.current_connection().is_connected()
    }

    /// Observers survive reconnects: they fire for every connection this
    /// manager establishes, not just the current one.
    pub fn add_on_connect_handler(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.on_connect
            .lock()
            .expect("on_connect lock poisoned")
            .push(Arc::new(handler));
    }

    pub fn add_on_disconnect_handler(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.on_disconnect
            .lock()
            .expect("on_disconnect lock poisoned")
            .push(Arc::new(handler));
    }

    /// Start the background connect loop.
    ///
    /// Errors with `AlreadyConnecting` while a previous loop is still
    /// active — at most one loop per manager.
    pub fn connect(self: &Arc<Self>) -> Result<(), RpcError> {
        if self.connecting.swap(true, Ordering::SeqCst) {
            return Err(RpcError::AlreadyConnecting);
        }

        let token = CancellationToken::new();
        *self.loop_cancel.lock().expect("loop_cancel lock poisoned") = Some(token.clone());

        let client = self.clone();
        tokio::spawn(async move {
            client.run_loop(token).await;
            client.connecting.store(false, Ordering::SeqCst);
        });
        Ok(())
    }

    /// Cancel the connect loop, tear down the connection, fail all pending
    /// calls.
    pub async fn disconnect(&self) {
        if let Some(token) = self
            .loop_cancel
            .lock()
            .expect("loop_cancel lock poisoned")
            .take()
        {
            token.cancel();
        }
        self.current_connection().disconnect().await;
        self.fail_pending();
    }

    /// Invoke a remote method and await its response.
    ///
    /// A write failure fails the call immediately and leaves no pending
    /// entry; otherwise the call stays pending until its response arrives
    /// or the connection finalizes.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let request = Request::new(method, params);
        let frame = encode_frame(&request)?;
        let connection = self.current_connection();

        let (resolve, resolved) = oneshot::channel();
        self.pending_lock().insert(
            request.id.clone(),
            PendingCall {
                method: method.to_string(),
                resolve,
            },
        );

        if let Err(err) = connection.send(&frame).await {
            self.pending_lock().remove(&request.id);
            return Err(err);
        }

        match resolved.await {
            Ok(result) => result,
            Err(_) => Err(RpcError::ConnectionLost),
        }
    }

    /// Fire-and-forget variant: the callback runs on its own task with the
    /// call's outcome, never inline on the read loop.
    pub fn call_with_callback(
        self: &Arc<Self>,
        method: &str,
        params: Value,
        callback: impl FnOnce(Result<Value, RpcError>) + Send + 'static,
    ) {
        let client = self.clone();
        let method = method.to_string();
        tokio::spawn(async move {
            let result = client.call(&method, params).await;
            // The task boundary contains a panicking callback.
            callback(result);
        });
    }

    fn current_connection(&self) -> Arc<Connection> {
        self.connection
            .lock()
            .expect("connection lock poisoned")
            .clone()
    }

    fn pending_lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingCall>> {
        self.pending.lock().expect("pending lock poisoned")
    }

    fn fail_pending(&self) {
        let drained: Vec<PendingCall> = {
            let mut pending = self.pending_lock();
            pending.drain().map(|(_, call)| call).collect()
        };
        for call in drained {
            let _ = call.resolve.send(Err(RpcError::ConnectionLost));
        }
    }

    async fn run_loop(self: &Arc<Self>, token: CancellationToken) {
        loop {
            if token.is_cancelled() {
                break;
            }

            let established = match self.establish().await {
                Some(connection) => {
                    log::info!(
                        "rpc client: connected to <{}> at <{:?}>",
                        self.coord,
                        connection.peer_addr()
                    );
                    self.read_loop(&connection, &token).await;
                    connection.finalize().await;
                    self.fail_pending();
                    log::info!("rpc client: disconnected from <{}>", self.coord);
                    true
                }
                None => {
                    log::info!("rpc client: couldn't connect to <{}>", self.coord);
                    false
                }
            };

            let Some(interval) = self.auto_retry else {
                break;
            };
            // A dropped connection is re-established right away; the delay
            // only paces attempt cycles that failed to connect at all.
            if established {
                continue;
            }
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// One attempt cycle: resolve the coordinate, try each candidate
    /// address in order, initialize on first success.
    async fn establish(self: &Arc<Self>) -> Option<Arc<Connection>> {
        let address = match self.directory.address_of(&self.coord) {
            Ok(address) => address,
            Err(err) => {
                log::warn!("rpc client: cannot resolve <{}>: {err}", self.coord);
                return None;
            }
        };

        let candidates = match tokio::net::lookup_host((address.host.as_str(), address.port)).await
        {
            Ok(candidates) => candidates,
            Err(err) => {
                log::warn!("rpc client: lookup failed for <{address}>: {err}");
                return None;
            }
        };

        for candidate in candidates {
            match TcpStream::connect(candidate).await {
                Ok(stream) => {
                    let connection = Arc::new(Connection::new());
                    self.wire_observers(&connection);
                    connection.initialize(stream).await;
                    *self.connection.lock().expect("connection lock poisoned") =
                        connection.clone();
                    return Some(connection);
                }
                Err(err) => {
                    log::info!("rpc client: connect to <{candidate}> failed: {err}");
                }
            }
        }
        None
    }

    /// Forward this manager's observer lists to a fresh connection. The
    /// lists are read at event time so handlers registered later still see
    /// disconnects of the current connection, and each handler runs on its
    /// own task so one panicking never skips the others.
    fn wire_observers(&self, connection: &Connection) {
        let on_connect = self.on_connect.clone();
        connection.add_on_connect_handler(move || {
            let handlers: Vec<Observer> =
                on_connect.lock().expect("on_connect lock poisoned").clone();
            for handler in handlers {
                tokio::spawn(async move { handler() });
            }
        });
        let on_disconnect = self.on_disconnect.clone();
        connection.add_on_disconnect_handler(move || {
            let handlers: Vec<Observer> = on_disconnect
                .lock()
                .expect("on_disconnect lock poisoned")
                .clone();
            for handler in handlers {
                tokio::spawn(async move { handler() });
            }
        });
    }

    async fn read_loop(&self, connection: &Arc<Connection>, token: &CancellationToken) {
        loop {
            let line = tokio::select! {
                _ = token.cancelled() => {
                    connection.disconnect().await;
                    return;
                }
                result = connection.recv() => match result {
                    Ok(Some(line)) => line,
                    Ok(None) => return,
                    Err(err) => {
                        log::warn!("rpc client: read failed on <{}>: {err}", self.coord);
                        return;
                    }
                },
            };

            let value = match decode_value(&line) {
                Ok(value) => value,
                Err(err) => {
                    log::warn!("rpc client: protocol violation from <{}>: {err}", self.coord);
                    connection.disconnect().await;
                    return;
                }
            };

            // Envelopes with bad fields and unknown ids are late/duplicate
            // noise from a previous cycle: drop them.
            let Ok(response) = Response::from_value(&value) else {
                continue;
            };
            let Some(call) = self.pending_lock().remove(&response.id) else {
                continue;
            };

            let result = match response.error {
                None => Ok(response.data),
                Some(message) => Err(RpcError::Remote {
                    address: connection
                        .peer_addr()
                        .map(|addr| addr.to_string())
                        .unwrap_or_else(|| self.coord.to_string()),
                    method: call.method,
                    message,
                }),
            };
            let _ = call.resolve.send(result);
        }
    }
}
