use fleet_config::ConfigError;
use fleet_wire::WireError;

/// Errors surfaced by the RPC engine.
///
/// Failures intrinsic to one connection (framing, I/O) tear that connection
/// down; failures local to one call (`Remote`) leave it open. `Config` and
/// `AlreadyConnecting` are caller misuse, reported synchronously.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("not connected")]
    NotConnected,

    #[error("connection lost")]
    ConnectionLost,

    #[error("already (re)connecting")]
    AlreadyConnecting,

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("remote call {method} on {address} failed: {message}")]
    Remote {
        address: String,
        method: String,
        message: String,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}
