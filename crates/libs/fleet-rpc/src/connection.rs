//! One duplex RPC connection over a TCP socket.
//!
//! The socket is split into halves so the read and write paths serialize
//! independently: a slow outbound write never blocks inbound frame decoding,
//! while concurrent senders (or receivers) on the same direction still take
//! turns. Any I/O or framing failure finalizes the connection exactly once;
//! an instance is single-use and a new logical connection needs a new
//! instance.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use fleet_wire::{DELIMITER, MAX_FRAME_SIZE};

use crate::RpcError;

/// Connect/disconnect observer. Contextual arguments are closure captures.
pub type Observer = Arc<dyn Fn() + Send + Sync>;

const READ_CHUNK_SIZE: usize = 4096;

struct ReadState {
    half: OwnedReadHalf,
    buffer: Vec<u8>,
}

/// A single-use duplex connection: Disconnected → Connected → Disconnected.
pub struct Connection {
    connected: AtomicBool,
    reader: Mutex<Option<ReadState>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    local_addr: StdMutex<Option<SocketAddr>>,
    peer_addr: StdMutex<Option<SocketAddr>>,
    on_connect: StdMutex<Vec<Observer>>,
    on_disconnect: StdMutex<Vec<Observer>>,
    cancel: CancellationToken,
}

impl Connection {
    /// Create a connection in the Disconnected state.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            local_addr: StdMutex::new(None),
            peer_addr: StdMutex::new(None),
            on_connect: StdMutex::new(Vec::new()),
            on_disconnect: StdMutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Transition Disconnected → Connected, taking ownership of the socket
    /// and firing on-connect observers on their own tasks.
    ///
    /// Single-use: on a live or already-finalized instance the call is a
    /// no-op and the stream is dropped.
    pub async fn initialize(&self, stream: TcpStream) {
        if self.is_connected() || self.cancel.is_cancelled() {
            log::warn!(
                "connection already used, dropping socket <{:?}>",
                stream.peer_addr().ok()
            );
            return;
        }
        *self.local_addr.lock().expect("local_addr lock poisoned") = stream.local_addr().ok();
        *self.peer_addr.lock().expect("peer_addr lock poisoned") = stream.peer_addr().ok();

        let (read_half, write_half) = stream.into_split();
        *self.reader.lock().await = Some(ReadState {
            half: read_half,
            buffer: Vec::with_capacity(READ_CHUNK_SIZE),
        });
        *self.writer.lock().await = Some(write_half);
        self.connected.store(true, Ordering::SeqCst);

        let observers: Vec<Observer> = self
            .on_connect
            .lock()
            .expect("on_connect lock poisoned")
            .clone();
        for observer in observers {
            tokio::spawn(async move { observer() });
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().expect("local_addr lock poisoned")
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.peer_addr.lock().expect("peer_addr lock poisoned")
    }

    /// Token cancelled when the connection finalizes. Dispatch tasks select
    /// on it so teardown kills everything still in flight.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn add_on_connect_handler(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.add_on_connect_observer(Arc::new(handler));
    }

    pub fn add_on_disconnect_handler(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.add_on_disconnect_observer(Arc::new(handler));
    }

    pub(crate) fn add_on_connect_observer(&self, observer: Observer) {
        self.on_connect
            .lock()
            .expect("on_connect lock poisoned")
            .push(observer);
    }

    pub(crate) fn add_on_disconnect_observer(&self, observer: Observer) {
        self.on_disconnect
            .lock()
            .expect("on_disconnect lock poisoned")
            .push(observer);
    }

    /// Write one already-framed message.
    ///
    /// Fails when not connected, when the frame exceeds [`MAX_FRAME_SIZE`]
    /// (checked before the socket is touched), or on a write failure — the
    /// latter also finalizes the connection.
    pub async fn send(&self, frame: &[u8]) -> Result<(), RpcError> {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(fleet_wire::WireError::TooLong(frame.len()).into());
        }
        if !self.is_connected() {
            return Err(RpcError::NotConnected);
        }

        let mut guard = self.writer.lock().await;
        let half = guard.as_mut().ok_or(RpcError::NotConnected)?;
        let result = async {
            half.write_all(frame).await?;
            half.flush().await
        }
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                guard.take();
                drop(guard);
                self.finalize().await;
                Err(err.into())
            }
        }
    }

    /// Read one delimited frame, without its delimiter.
    ///
    /// `Ok(None)` means the peer closed in an orderly way at a frame
    /// boundary. A frame lacking its delimiter within [`MAX_FRAME_SIZE`],
    /// or bytes left over at EOF, is a fatal framing violation. All exit
    /// paths other than a complete frame finalize the connection.
    pub async fn recv(&self) -> Result<Option<Vec<u8>>, RpcError> {
        let mut guard = self.reader.lock().await;
        let Some(state) = guard.as_mut() else {
            return Ok(None);
        };

        loop {
            if let Some(end) = find_delimiter(&state.buffer) {
                let line = state.buffer[..end].to_vec();
                state.buffer.drain(..end + DELIMITER.len());
                return Ok(Some(line));
            }

            if state.buffer.len() >= MAX_FRAME_SIZE {
                guard.take();
                drop(guard);
                self.finalize().await;
                return Err(framing_violation("frame exceeds maximum size without delimiter"));
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            match state.half.read(&mut chunk).await {
                Ok(0) => {
                    let trailing = state.buffer.len();
                    guard.take();
                    drop(guard);
                    self.finalize().await;
                    if trailing != 0 {
                        return Err(framing_violation("eof inside a partial frame"));
                    }
                    return Ok(None);
                }
                Ok(n) => state.buffer.extend_from_slice(&chunk[..n]),
                Err(err) => {
                    guard.take();
                    drop(guard);
                    self.finalize().await;
                    return Err(err.into());
                }
            }
        }
    }

    /// Terminal teardown of in-memory state. Idempotent: the first call
    /// clears the socket halves, cancels in-flight dispatch tasks, and
    /// fires on-disconnect observers; later calls return false and do
    /// nothing.
    pub async fn finalize(&self) -> bool {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return false;
        }

        self.cancel.cancel();
        self.reader.lock().await.take();
        self.writer.lock().await.take();

        let observers: Vec<Observer> = self
            .on_disconnect
            .lock()
            .expect("on_disconnect lock poisoned")
            .clone();
        for observer in observers {
            tokio::spawn(async move { observer() });
        }
        true
    }

    /// Active shutdown of the socket followed by [`finalize`](Self::finalize).
    /// Safe on an already-disconnected instance (returns false).
    pub async fn disconnect(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        {
            let mut guard = self.writer.lock().await;
            if let Some(half) = guard.as_mut() {
                let _ = half.shutdown().await;
            }
        }
        self.finalize().await
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

fn find_delimiter(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(DELIMITER.len())
        .position(|window| window == DELIMITER)
}

fn framing_violation(reason: &str) -> RpcError {
    RpcError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn connected_pair() -> (Arc<Connection>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
        let addr = listener.local_addr().expect("no local addr");
        let peer = TcpStream::connect(addr).await.expect("connect failed");
        let (stream, _) = listener.accept().await.expect("accept failed");
        let connection = Arc::new(Connection::new());
        connection.initialize(stream).await;
        (connection, peer)
    }

    #[tokio::test]
    async fn send_requires_connection() {
        let connection = Connection::new();
        assert!(matches!(
            connection.send(b"{}\r\n").await,
            Err(RpcError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn oversized_send_fails_before_socket() {
        let (connection, _peer) = connected_pair().await;
        let frame = vec![b'a'; MAX_FRAME_SIZE + 1];
        assert!(matches!(
            connection.send(&frame).await,
            Err(RpcError::Wire(fleet_wire::WireError::TooLong(_)))
        ));
        // The failure was local; the connection is still usable.
        assert!(connection.is_connected());
    }

    #[tokio::test]
    async fn recv_reassembles_split_frames() {
        let (connection, mut peer) = connected_pair().await;
        peer.write_all(b"{\"a\":1}\r").await.expect("write failed");
        peer.flush().await.expect("flush failed");
        let reader = tokio::spawn(async move {
            let first = connection.recv().await.expect("recv failed");
            let second = connection.recv().await.expect("recv failed");
            (first, second)
        });
        peer.write_all(b"\n{\"b\":2}\r\n").await.expect("write failed");
        peer.flush().await.expect("flush failed");
        let (first, second) = reader.await.expect("reader panicked");
        assert_eq!(first.as_deref(), Some(b"{\"a\":1}".as_slice()));
        assert_eq!(second.as_deref(), Some(b"{\"b\":2}".as_slice()));
    }

    #[tokio::test]
    async fn orderly_close_yields_none() {
        let (connection, peer) = connected_pair().await;
        drop(peer);
        assert!(connection.recv().await.expect("recv failed").is_none());
        assert!(!connection.is_connected());
    }

    #[tokio::test]
    async fn eof_inside_partial_frame_is_fatal() {
        let (connection, mut peer) = connected_pair().await;
        peer.write_all(b"{\"a\":1}").await.expect("write failed");
        peer.shutdown().await.expect("shutdown failed");
        assert!(connection.recv().await.is_err());
        assert!(!connection.is_connected());
    }

    #[tokio::test]
    async fn finalize_is_idempotent() {
        let (connection, _peer) = connected_pair().await;
        assert!(connection.finalize().await);
        assert!(!connection.finalize().await);
        assert!(!connection.disconnect().await);
        assert!(!connection.is_connected());
    }

    #[tokio::test]
    async fn initialize_is_single_use() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
        let addr = listener.local_addr().expect("no local addr");

        let _first = TcpStream::connect(addr).await.expect("connect failed");
        let (stream, _) = listener.accept().await.expect("accept failed");
        let connection = Arc::new(Connection::new());
        connection.initialize(stream).await;
        let bound_peer = connection.peer_addr();

        // A second socket on a live instance is refused and dropped.
        let _second = TcpStream::connect(addr).await.expect("connect failed");
        let (stream, _) = listener.accept().await.expect("accept failed");
        connection.initialize(stream).await;
        assert!(connection.is_connected());
        assert_eq!(connection.peer_addr(), bound_peer);

        // A finalized instance stays terminal.
        connection.finalize().await;
        let _third = TcpStream::connect(addr).await.expect("connect failed");
        let (stream, _) = listener.accept().await.expect("accept failed");
        connection.initialize(stream).await;
        assert!(!connection.is_connected());
    }

    #[tokio::test]
    async fn disconnect_twice_returns_false_second_time() {
        let (connection, _peer) = connected_pair().await;
        assert!(connection.disconnect().await);
        assert!(!connection.disconnect().await);
    }

    #[tokio::test]
    async fn observers_fire_on_both_transitions() {
        use std::sync::atomic::AtomicUsize;

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
        let addr = listener.local_addr().expect("no local addr");
        let _peer = TcpStream::connect(addr).await.expect("connect failed");
        let (stream, _) = listener.accept().await.expect("accept failed");

        let connection = Arc::new(Connection::new());
        let connects = Arc::new(AtomicUsize::new(0));
        let disconnects = Arc::new(AtomicUsize::new(0));
        {
            let connects = connects.clone();
            connection.add_on_connect_handler(move || {
                connects.fetch_add(1, Ordering::SeqCst);
            });
        }
        {
            let disconnects = disconnects.clone();
            connection.add_on_disconnect_handler(move || {
                disconnects.fetch_add(1, Ordering::SeqCst);
            });
        }

        connection.initialize(stream).await;
        connection.finalize().await;
        connection.finalize().await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }
}
