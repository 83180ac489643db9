use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use socks_task::{spawn_task, ShutdownHandle, ShutdownSignal, Task};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, error, info, instrument};

use crate::options::ServerOptions;
use crate::session::Session;

/// Number of concurrent accept tasks sharing the same listening socket, mirroring common
/// SO_REUSEPORT-style fan-out: several tasks blocked in `accept()` on the same listener so a
/// burst of incoming connections isn't serialized behind a single task's handling of one.
const ACCEPT_TASKS: usize = 32;

fn configure_accepted_stream(stream: &TcpStream) {
    if let Err(error) = stream.set_nodelay(true) {
        debug!(%error, "failed to set TCP_NODELAY on accepted socket");
    }

    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(120))
        .with_interval(Duration::from_secs(30));

    if let Err(error) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        debug!(%error, "failed to configure TCP keepalive on accepted socket");
    }
}

/// Owns the bound listening socket and the set of live [`Session`]s it has spawned. Sessions
/// are tracked by `Weak` handle only: a `Session` is kept alive solely by its own tasks, and
/// deregisters itself from `clients` on drop. This lets `close()` broadcast shutdown to
/// whatever happens to still be alive without the listener itself keeping anything alive past
/// its natural lifetime.
pub struct Listener {
    addr: SocketAddr,
    listener: TcpListener,
    options: Arc<ServerOptions>,
    clients: Mutex<HashMap<u64, Weak<Session>>>,
    next_id: AtomicU64,
    shutdown: ShutdownHandle,
    shutdown_signal: ShutdownSignal,
}

impl Listener {
    pub async fn bind(addr: SocketAddr, options: ServerOptions) -> anyhow::Result<Arc<Self>> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(1024)?;

        let (shutdown, shutdown_signal) = ShutdownHandle::new();

        info!(%addr, "listener bound");

        Ok(Arc::new(Self {
            addr,
            listener,
            options: Arc::new(options),
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            shutdown,
            shutdown_signal,
        }))
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Spawns the accept task pool and returns once every task has exited, which only
    /// happens after `close()` signals shutdown (accept tasks run the full process lifetime
    /// otherwise).
    pub async fn serve(self: &Arc<Self>) {
        let mut tasks = Vec::with_capacity(ACCEPT_TASKS);
        for worker in 0..ACCEPT_TASKS {
            let task = AcceptTask {
                listener: Arc::clone(self),
                worker,
            };
            tasks.push(spawn_task(task, self.shutdown_signal.clone()));
        }

        for task in tasks {
            let _ = task.join().await;
        }
    }

    /// Force-closes every still-live session and prevents the accept loop from accepting
    /// further connections. Idempotent: calling twice is harmless.
    pub fn close(&self) {
        self.shutdown.signal();

        let clients = self.clients.lock().expect("clients mutex poisoned");
        for session in clients.values().filter_map(Weak::upgrade) {
            session.close();
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().expect("clients mutex poisoned").len()
    }

    fn next_connection_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn remove_client(&self, id: u64) {
        self.clients.lock().expect("clients mutex poisoned").remove(&id);
    }

    #[instrument(skip_all, fields(addr = %self.addr))]
    async fn accept_loop(self: Arc<Self>, mut shutdown_signal: ShutdownSignal) {
        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = shutdown_signal.wait() => return,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    configure_accepted_stream(&stream);
                    let id = self.next_connection_id();

                    debug!(connection_id = id, %peer_addr, "accepted connection");

                    let weak_self = Arc::downgrade(&self);
                    if let Some(weak_session) = Session::spawn(stream, id, weak_self, Arc::clone(&self.options)) {
                        self.clients.lock().expect("clients mutex poisoned").insert(id, weak_session);
                    }
                }
                Err(error) => error!(%error, "accept failed"),
            }
        }
    }
}

struct AcceptTask {
    listener: Arc<Listener>,
    worker: usize,
}

#[async_trait::async_trait]
impl Task for AcceptTask {
    type Output = ();

    const NAME: &'static str = "socks accept";

    async fn run(self, shutdown_signal: ShutdownSignal) -> Self::Output {
        debug!(worker = self.worker, "accept worker started");
        self.listener.accept_loop(shutdown_signal).await;
    }
}
