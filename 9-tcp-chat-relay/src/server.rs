use std::{
    collections::HashMap,
    future::{self, Future},
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::{Notify, OwnedSemaphorePermit, Semaphore, mpsc, mpsc::error::TrySendError},
    task::JoinSet,
};
use tracing::{debug, info, warn};

use crate::{
    connection::DEFAULT_PORT,
    error::ServerError,
    framing::{Deframer, Framing},
};

pub type ClientId = u64;

/// Bytes relayed to peers; cloned once per recipient without copying.
pub type Payload = Arc<[u8]>;

const READ_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    /// Connections beyond this wait in the listen backlog until a slot frees up.
    pub max_clients: usize,
    /// Messages buffered per peer; a peer that falls this far behind is disconnected.
    pub outbound_capacity: usize,
    pub framing: Framing,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            max_clients: 1024,
            outbound_capacity: 256,
            framing: Framing::Chunk,
        }
    }
}

pub struct BroadcastServer {
    listener: TcpListener,
    config: ServerConfig,
    registry: Arc<ClientRegistry>,
    permits: Arc<Semaphore>,
}

impl BroadcastServer {
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.listen)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.listen,
                source,
            })?;

        Ok(Self {
            listener,
            permits: Arc::new(Semaphore::new(config.max_clients.max(1))),
            registry: Arc::new(ClientRegistry::new()),
            config,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<ClientRegistry> {
        Arc::clone(&self.registry)
    }

    /// Accepts clients until `accept()` itself fails.
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(future::pending()).await
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send,
    {
        let BroadcastServer {
            listener,
            config,
            registry,
            permits,
        } = self;
        let mut handlers = JoinSet::new();
        tokio::pin!(shutdown);

        let outcome = loop {
            select! {
                _ = &mut shutdown => {
                    info!("server shutting down");
                    break Ok(());
                }
                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    if let Err(error) = joined {
                        if error.is_panic() {
                            warn!(?error, "client handler panicked");
                        }
                    }
                }
                accepted = accept_with_permit(&listener, &permits) => {
                    match accepted {
                        Ok((stream, peer, permit)) => {
                            spawn_client_handler(stream, peer, permit, &registry, &config, &mut handlers);
                        }
                        Err(error) => {
                            warn!(?error, "accept failed; stopping server");
                            break Err(ServerError::Accept(error));
                        }
                    }
                }
            }
        };

        handlers.shutdown().await;
        registry.clear();
        outcome
    }

    pub async fn run_until_ctrl_c(self) -> Result<(), ServerError> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
                future::pending::<()>().await;
            }
        })
        .await
    }
}

async fn accept_with_permit(
    listener: &TcpListener,
    permits: &Arc<Semaphore>,
) -> io::Result<(TcpStream, SocketAddr, OwnedSemaphorePermit)> {
    let permit = Arc::clone(permits)
        .acquire_owned()
        .await
        .map_err(|_| io::Error::other("connection limit closed"))?;
    let (stream, peer) = listener.accept().await?;
    Ok((stream, peer, permit))
}

fn spawn_client_handler(
    stream: TcpStream,
    peer: SocketAddr,
    permit: OwnedSemaphorePermit,
    registry: &Arc<ClientRegistry>,
    config: &ServerConfig,
    handlers: &mut JoinSet<()>,
) {
    let id = registry.next_id();
    let (outbound, queued) = mpsc::channel(config.outbound_capacity.max(1));
    let evicted = Arc::new(Notify::new());
    let total = registry.insert(id, peer, outbound, Arc::clone(&evicted));
    info!(%peer, id, clients = total, "client connected");

    let registry = Arc::clone(registry);
    let framing = config.framing;
    handlers.spawn(async move {
        let _permit = permit;
        let session = ClientSession {
            id,
            peer,
            queued,
            evicted,
        };
        handle_connection(session, stream, &registry, framing).await;
    });
}

struct ClientSession {
    id: ClientId,
    peer: SocketAddr,
    queued: mpsc::Receiver<Payload>,
    evicted: Arc<Notify>,
}

async fn handle_connection(
    session: ClientSession,
    stream: TcpStream,
    registry: &ClientRegistry,
    framing: Framing,
) {
    let ClientSession {
        id,
        peer,
        queued,
        evicted,
    } = session;
    let (reader, writer) = stream.into_split();

    select! {
        inbound = relay_inbound(id, reader, registry, framing) => match inbound {
            Ok(()) => info!(%peer, id, "client disconnected"),
            Err(error) => warn!(%peer, id, ?error, "client read failed"),
        },
        outbound = drain_outbound(writer, queued) => {
            if let Err(error) = outbound {
                warn!(%peer, id, ?error, "delivery to client failed");
            }
        }
        _ = evicted.notified() => {
            warn!(%peer, id, "client fell behind; closing its connection");
        }
    }

    if registry.remove(id).is_some() {
        info!(%peer, id, clients = registry.len(), "client removed");
    }
}

async fn relay_inbound(
    id: ClientId,
    mut reader: OwnedReadHalf,
    registry: &ClientRegistry,
    framing: Framing,
) -> io::Result<()> {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    let mut deframer = Deframer::new(framing);

    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            if let Some(rest) = deframer.finish() {
                registry.broadcast(rest.into(), id);
            }
            return Ok(());
        }

        for unit in deframer.push(&buffer[..n]) {
            debug!(id, bytes = unit.len(), "relaying");
            registry.broadcast(unit.into(), id);
        }
    }
}

async fn drain_outbound(
    mut writer: OwnedWriteHalf,
    mut queued: mpsc::Receiver<Payload>,
) -> io::Result<()> {
    while let Some(payload) = queued.recv().await {
        writer.write_all(&payload).await?;
    }
    writer.shutdown().await
}

/// Live connections of one server, keyed by an id assigned at accept time.
pub struct ClientRegistry {
    clients: Mutex<HashMap<ClientId, ClientRecord>>,
    next_id: AtomicU64,
}

#[derive(Clone)]
struct ClientRecord {
    peer: SocketAddr,
    outbound: mpsc::Sender<Payload>,
    evicted: Arc<Notify>,
}

impl ClientRegistry {
    fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> ClientId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a connection and returns the new member count.
    fn insert(
        &self,
        id: ClientId,
        peer: SocketAddr,
        outbound: mpsc::Sender<Payload>,
        evicted: Arc<Notify>,
    ) -> usize {
        let mut clients = self.lock();
        clients.insert(
            id,
            ClientRecord {
                peer,
                outbound,
                evicted,
            },
        );
        clients.len()
    }

    /// Returns the peer address the first time `id` is removed and `None` afterwards.
    fn remove(&self, id: ClientId) -> Option<SocketAddr> {
        self.lock().remove(&id).map(|record| record.peer)
    }

    fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Queues `payload` for every member except `except` and returns how many accepted it.
    ///
    /// Membership is snapshotted and the lock released before any queue is touched. A
    /// member whose queue is full is evicted rather than waited on, so every member either
    /// receives everything relayed to it or gets disconnected.
    pub fn broadcast(&self, payload: Payload, except: ClientId) -> usize {
        let recipients: Vec<(ClientId, ClientRecord)> = self
            .lock()
            .iter()
            .filter(|(id, _)| **id != except)
            .map(|(id, record)| (*id, record.clone()))
            .collect();

        let mut delivered = 0;
        for (id, record) in recipients {
            match record.outbound.try_send(Arc::clone(&payload)) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    if self.evict(id) {
                        warn!(peer = %record.peer, id, "outbound queue full; evicting slow client");
                    }
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(peer = %record.peer, id, "client already gone");
                }
            }
        }
        delivered
    }

    /// Removes `id` and tells its handler to hang up. Returns `false` if it was already gone.
    fn evict(&self, id: ClientId) -> bool {
        match self.lock().remove(&id) {
            Some(record) => {
                record.evicted.notify_one();
                true
            }
            None => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ClientId, ClientRecord>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
