//! Client-side connection management.
//!
//! [`ConnectionManager`] owns at most one TCP connection to a relay server. The
//! connection is established with a plain blocking connect; only once that succeeds is
//! the socket switched to non-blocking mode and handed to a receiver thread that runs a
//! private single-threaded Tokio runtime. The receiver wakes on socket readiness, queues
//! every received unit of text, and performs the writes requested by [`ConnectionManager::send`].
//!
//! The public API is synchronous so a render loop can poll it once per tick. Do not call
//! it from inside an async runtime: `connect`, `send` and `disconnect` block.

use std::{
    collections::VecDeque,
    io,
    net::{SocketAddr, TcpStream as StdTcpStream, ToSocketAddrs},
    sync::{
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, tcp::OwnedWriteHalf},
    runtime::{self, Runtime},
    select,
    sync::{mpsc, oneshot},
};
use tracing::{debug, info, warn};

use crate::{
    error::{ConnectError, SendError, is_connection_lost, is_retryable},
    framing::{Deframer, Framing, terminate_line},
};

pub const DEFAULT_PORT: u16 = 54000;

pub const SYSTEM_PREFIX: &str = "[SYSTEM]";
pub const SERVER_CLOSED_NOTICE: &str = "[SYSTEM] Server disconnected";
pub const CONNECTION_LOST_NOTICE: &str = "[SYSTEM] Connection lost";
pub const NETWORK_ERROR_NOTICE: &str = "[SYSTEM] Network error";

const READ_BUFFER_SIZE: usize = 4096;
const WRITE_QUEUE_DEPTH: usize = 16;

/// Whether a received entry is a synthetic notice rather than text from a peer.
pub fn is_system_notice(text: &str) -> bool {
    text.starts_with(SYSTEM_PREFIX)
}

pub struct ConnectionManager {
    framing: Framing,
    shared: Arc<Shared>,
    session: Mutex<Option<Session>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::with_framing(Framing::default())
    }

    pub fn with_framing(framing: Framing) -> Self {
        Self {
            framing,
            shared: Arc::new(Shared::new()),
            session: Mutex::new(None),
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Connects to `host:port` and starts the receiver thread.
    ///
    /// Returns immediately if already connected. A session that ended on its own (peer
    /// close or I/O error) is reaped first, so calling this again after a drop reconnects.
    ///
    /// Name resolution and the connect itself run without holding the session lock, so a
    /// slow or unreachable host never stalls `send` or `disconnect` on another thread.
    ///
    /// # Panics
    ///
    /// Panics if called from within an async runtime.
    pub fn connect(&self, host: &str, port: u16) -> Result<(), ConnectError> {
        if self.is_connected() {
            return Ok(());
        }

        info!(host, port, "connecting");
        let (stream, peer) = open_stream(host, port)?;
        let (stream, runtime) = attach_runtime(stream)?;

        let mut session = self.lock_session();
        if self.is_connected() {
            debug!(%peer, "another caller connected first; dropping the new socket");
            return Ok(());
        }
        if let Some(stale) = session.take() {
            stop_session(stale);
        }

        let (commands, requests) = mpsc::channel(WRITE_QUEUE_DEPTH);
        self.shared.running.store(true, Ordering::SeqCst);
        self.shared.connected.store(true, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        let framing = self.framing;
        let spawned = thread::Builder::new()
            .name("chat-receiver".to_string())
            .spawn(move || runtime.block_on(run_session(stream, requests, shared, framing)));

        match spawned {
            Ok(receiver) => {
                info!(%peer, "connected");
                *session = Some(Session {
                    peer,
                    commands,
                    receiver,
                });
                Ok(())
            }
            Err(error) => {
                self.shared.running.store(false, Ordering::SeqCst);
                self.shared.connected.store(false, Ordering::SeqCst);
                Err(ConnectError::Spawn(error))
            }
        }
    }

    /// Stops the receiver thread and closes the socket. Safe to call at any time.
    pub fn disconnect(&self) {
        let session = self.lock_session().take();
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.connected.store(false, Ordering::SeqCst);
        if let Some(session) = session {
            stop_session(session);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        if !self.is_connected() {
            return None;
        }
        self.lock_session().as_ref().map(|session| session.peer)
    }

    /// Writes `text`, newline-terminated, and waits until the bytes are handed to the socket.
    ///
    /// # Panics
    ///
    /// Panics if called from within an async runtime.
    pub fn send(&self, text: &str) -> Result<(), SendError> {
        if text.is_empty() {
            return Err(SendError::EmptyMessage);
        }

        let commands = match self.lock_session().as_ref() {
            Some(session) if self.is_connected() => session.commands.clone(),
            _ => {
                debug!("send attempted while disconnected");
                return Err(SendError::NotConnected);
            }
        };

        let payload = terminate_line(text).into_owned().into_bytes();
        let (respond_to, response) = oneshot::channel();
        if commands
            .blocking_send(WriteRequest {
                payload,
                respond_to,
            })
            .is_err()
        {
            return Err(SendError::NotConnected);
        }

        match response.blocking_recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) if is_connection_lost(&error) => {
                self.shared.connected.store(false, Ordering::SeqCst);
                warn!(?error, "connection reset while sending");
                Err(SendError::ConnectionReset(error))
            }
            Ok(Err(error)) => {
                warn!(?error, "send failed");
                Err(SendError::Io(error))
            }
            // The session ended before it got to this write.
            Err(_) => Err(SendError::NotConnected),
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.shared.inbox.is_empty()
    }

    /// Pops the oldest queued entry without blocking.
    pub fn receive(&self) -> Option<String> {
        self.shared.inbox.pop()
    }

    /// Pops the oldest queued entry, waiting up to `timeout` for one to arrive.
    pub fn receive_timeout(&self, timeout: Duration) -> Option<String> {
        self.shared.inbox.pop_timeout(timeout)
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

struct Session {
    peer: SocketAddr,
    commands: mpsc::Sender<WriteRequest>,
    receiver: JoinHandle<()>,
}

struct WriteRequest {
    payload: Vec<u8>,
    respond_to: oneshot::Sender<io::Result<()>>,
}

struct Shared {
    connected: AtomicBool,
    running: AtomicBool,
    inbox: Inbox,
}

impl Shared {
    fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            running: AtomicBool::new(false),
            inbox: Inbox::default(),
        }
    }

    /// Flags the connection as down and queues `notice`, once per connection.
    fn mark_disconnected(&self, notice: &str) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.inbox.push(notice.to_string());
        }
    }
}

#[derive(Default)]
struct Inbox {
    queue: Mutex<VecDeque<String>>,
    ready: Condvar,
}

impl Inbox {
    fn push(&self, message: String) {
        self.lock().push_back(message);
        self.ready.notify_all();
    }

    fn pop(&self) -> Option<String> {
        self.lock().pop_front()
    }

    fn pop_timeout(&self, timeout: Duration) -> Option<String> {
        let queue = self.lock();
        let (mut queue, _) = self
            .ready
            .wait_timeout_while(queue, timeout, |queue| queue.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        queue.pop_front()
    }

    fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn open_stream(host: &str, port: u16) -> Result<(StdTcpStream, SocketAddr), ConnectError> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|source| ConnectError::Resolve {
            host: host.to_string(),
            port,
            source,
        })?;

    let mut last_error = None;
    for addr in addrs {
        match StdTcpStream::connect(addr) {
            Ok(stream) => return Ok((stream, addr)),
            Err(error) => {
                debug!(%addr, ?error, "connection attempt failed");
                last_error = Some(error);
            }
        }
    }

    match last_error {
        Some(source) => Err(ConnectError::Connect {
            target: format!("{host}:{port}"),
            source,
        }),
        None => Err(ConnectError::NoAddress {
            host: host.to_string(),
            port,
        }),
    }
}

/// Switches a connected socket to non-blocking mode and registers it with a fresh runtime.
fn attach_runtime(stream: StdTcpStream) -> Result<(TcpStream, Runtime), ConnectError> {
    stream
        .set_nonblocking(true)
        .map_err(ConnectError::NonBlocking)?;

    let runtime = runtime::Builder::new_current_thread()
        .enable_io()
        .build()
        .map_err(ConnectError::Runtime)?;

    let stream = {
        let _guard = runtime.enter();
        TcpStream::from_std(stream).map_err(ConnectError::NonBlocking)?
    };

    Ok((stream, runtime))
}

fn stop_session(session: Session) {
    let Session {
        peer,
        commands,
        receiver,
    } = session;

    // Closing the request channel wakes the receiver loop.
    drop(commands);
    if receiver.join().is_err() {
        warn!(%peer, "receiver thread panicked");
    }
    debug!(%peer, "session closed");
}

async fn run_session(
    stream: TcpStream,
    mut requests: mpsc::Receiver<WriteRequest>,
    shared: Arc<Shared>,
    framing: Framing,
) {
    let (mut reader, mut writer) = stream.into_split();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    let mut deframer = Deframer::new(framing);

    while shared.running.load(Ordering::SeqCst) {
        select! {
            request = requests.recv() => {
                let Some(request) = request else {
                    break;
                };
                if !handle_write_request(request, &mut writer, &shared).await {
                    break;
                }
            }
            read = reader.read(&mut buffer) => {
                if !handle_read(read, &buffer, &mut deframer, &shared) {
                    break;
                }
            }
        }
    }

    debug!("receiver loop finished");
}

async fn handle_write_request(
    request: WriteRequest,
    writer: &mut OwnedWriteHalf,
    shared: &Shared,
) -> bool {
    let WriteRequest {
        payload,
        respond_to,
    } = request;

    let result = write_payload(writer, &payload).await;
    let lost = matches!(&result, Err(error) if is_connection_lost(error));
    if lost {
        shared.mark_disconnected(CONNECTION_LOST_NOTICE);
    }

    // The caller only goes away if it panicked.
    let _ = respond_to.send(result);
    !lost
}

async fn write_payload(writer: &mut OwnedWriteHalf, payload: &[u8]) -> io::Result<()> {
    writer.write_all(payload).await?;
    writer.flush().await
}

fn handle_read(
    read: io::Result<usize>,
    buffer: &[u8],
    deframer: &mut Deframer,
    shared: &Shared,
) -> bool {
    match read {
        Ok(0) => {
            if let Some(rest) = deframer.finish() {
                shared.inbox.push(decode(&rest));
            }
            info!("server closed the connection");
            shared.mark_disconnected(SERVER_CLOSED_NOTICE);
            false
        }
        Ok(n) => {
            for unit in deframer.push(&buffer[..n]) {
                shared.inbox.push(decode(&unit));
            }
            true
        }
        Err(error) if is_retryable(&error) => true,
        Err(error) if is_connection_lost(&error) => {
            warn!(?error, "connection reset by server");
            shared.mark_disconnected(CONNECTION_LOST_NOTICE);
            false
        }
        Err(error) => {
            warn!(?error, "receive failed");
            shared.mark_disconnected(NETWORK_ERROR_NOTICE);
            false
        }
    }
}

fn decode(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
