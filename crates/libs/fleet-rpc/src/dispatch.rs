//! Inbound request dispatch (server role).
//!
//! Methods are resolved against an explicit [`MethodRegistry`] built at
//! startup: name → handler plus optional permission tag. A name that is not
//! registered, and a name whose permission the dispatcher does not grant,
//! produce the identical [`METHOD_NOT_FOUND`] error — callers must not be
//! able to distinguish a hidden method from a nonexistent one.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use fleet_wire::{decode_value, encode_frame, Request, Response};

use crate::connection::Connection;

/// Error string for unknown, unexposed, and unauthorized methods alike.
pub const METHOD_NOT_FOUND: &str = "Method not found";

/// Failure of one handler invocation. Converted to the response error
/// string; never tears down the dispatch task or the connection.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("handler failed: {0}")]
    Failed(String),
}

/// Per-call context passed to every handler.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Remote endpoint of the connection that carried the request.
    pub peer: Option<SocketAddr>,
    /// Caller identity bound to the connection before its serve loop
    /// started; immutable for the connection lifetime.
    pub identity: Option<Value>,
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, HandlerError>> + Send>>;
type HandlerFn = Arc<dyn Fn(Value, CallContext) -> HandlerFuture + Send + Sync>;

struct Method {
    handler: HandlerFn,
    permission: Option<String>,
}

/// Name → handler table, built once at startup.
///
/// Only registered methods are callable; not registering a method is how it
/// stays hidden, so non-exposure and non-existence are the same thing.
#[derive(Default)]
pub struct MethodRegistry {
    methods: HashMap<String, Method>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a method callable by anyone.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(Value, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.insert(name.into(), None, handler);
    }

    /// Register a method callable only where the dispatcher grants
    /// `permission`.
    pub fn register_with_permission<F, Fut>(
        &mut self,
        name: impl Into<String>,
        permission: impl Into<String>,
        handler: F,
    ) where
        F: Fn(Value, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.insert(name.into(), Some(permission.into()), handler);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    fn insert<F, Fut>(&mut self, name: String, permission: Option<String>, handler: F)
    where
        F: Fn(Value, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        let handler: HandlerFn =
            Arc::new(move |params, context| Box::pin(handler(params, context)));
        self.methods.insert(
            name,
            Method {
                handler,
                permission,
            },
        );
    }

    fn get(&self, name: &str) -> Option<&Method> {
        self.methods.get(name)
    }
}

/// Serves one connection against a registry: reads frames, spawns one
/// dispatch task per request, writes responses in completion order.
pub struct Dispatcher {
    registry: Arc<MethodRegistry>,
    grants: HashSet<String>,
    identity: Option<Value>,
}

impl Dispatcher {
    pub fn new(registry: Arc<MethodRegistry>) -> Self {
        Self {
            registry,
            grants: HashSet::new(),
            identity: None,
        }
    }

    /// Grant a permission tag to every call dispatched on this connection.
    pub fn grant(mut self, permission: impl Into<String>) -> Self {
        self.grants.insert(permission.into());
        self
    }

    pub fn with_grants(mut self, grants: HashSet<String>) -> Self {
        self.grants = grants;
        self
    }

    /// Bind a caller identity to the connection. Handlers receive it in
    /// their [`CallContext`] on every call.
    pub fn with_identity(mut self, identity: Value) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Run the serve loop until the peer closes, an I/O error finalizes the
    /// connection, or the peer violates the protocol.
    ///
    /// Each well-formed request runs on its own task; dispatch starts in
    /// read order but responses go out in completion order, so a slow
    /// method never stalls the frames behind it. Connection finalize
    /// cancels whatever is still in flight.
    pub async fn serve(self, connection: Arc<Connection>) {
        let dispatcher = Arc::new(self);
        let peer = connection.peer_addr();

        loop {
            let line = match connection.recv().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    log::info!("rpc server: peer closed <{peer:?}>");
                    break;
                }
                Err(err) => {
                    log::warn!("rpc server: read failed on <{peer:?}>: {err}");
                    break;
                }
            };

            let request = match decode_value(&line).and_then(|value| Request::from_value(&value)) {
                Ok(request) => request,
                Err(err) => {
                    log::warn!("rpc server: protocol violation from <{peer:?}>: {err}");
                    connection.disconnect().await;
                    break;
                }
            };

            let dispatcher = dispatcher.clone();
            let connection = connection.clone();
            let cancel = connection.cancellation();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    response = dispatcher.handle(request, peer) => {
                        write_response(&connection, response).await;
                    }
                }
            });
        }

        connection.finalize().await;
    }

    async fn handle(&self, request: Request, peer: Option<SocketAddr>) -> Response {
        let Some(method) = self.registry.get(&request.method) else {
            return Response::failure(request.id, METHOD_NOT_FOUND);
        };
        if let Some(permission) = &method.permission {
            if !self.grants.contains(permission) {
                return Response::failure(request.id, METHOD_NOT_FOUND);
            }
        }

        let context = CallContext {
            peer,
            identity: self.identity.clone(),
        };
        match (method.handler)(request.params, context).await {
            Ok(data) => Response::success(request.id, data),
            Err(err) => Response::failure(request.id, err.to_string()),
        }
    }
}

async fn write_response(connection: &Connection, response: Response) {
    let id = response.id.clone();
    let frame = match encode_frame(&response) {
        Ok(frame) => frame,
        Err(err) => {
            // An unencodable payload still answers the caller instead of
            // leaving its pending call hanging.
            log::warn!("rpc server: response {id} not encodable: {err}");
            match encode_frame(&Response::failure(id, format!("response encoding failed: {err}"))) {
                Ok(frame) => frame,
                Err(_) => return,
            }
        }
    };
    // A write failure finalizes the connection on its own.
    let _ = connection.send(&frame).await;
}
