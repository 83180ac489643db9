use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};

use socket2::SockRef;
use socks_protocol::{Socks4Acceptor, Socks4AcceptorConfig, Socks4FailureCode};
use socks_protocol::{Socks5Acceptor, Socks5AcceptorConfig, Socks5FailureCode};
use socks_types::{DestAddr, ToDestAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpSocket, TcpStream};
use tracing::{debug, instrument, warn};

use crate::error::SessionError;
use crate::listener::Listener;
use crate::options::{ServerOptions, UpstreamProxy};

const RELAY_BUFFER_SIZE: usize = 64 * 1024;

/// A handle to a shared `TcpStream` that implements `AsyncRead`/`AsyncWrite` by delegating to
/// `&TcpStream`, which tokio guarantees supports concurrent reads and writes from independent
/// tasks (the same mechanism backing `TcpStream::into_split`). Cheap to clone: it's an `Arc`.
#[derive(Clone)]
struct SharedTcpStream(Arc<TcpStream>);

impl AsyncRead for SharedTcpStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut &*self.0).poll_read(cx, buf)
    }
}

impl AsyncWrite for SharedTcpStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut &*self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut &*self.0).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut &*self.0).poll_shutdown(cx)
    }
}

fn shutdown(stream: &Arc<TcpStream>, dir: std::net::Shutdown) {
    let _ = SockRef::from(stream.as_ref()).shutdown(dir);
}

#[derive(Clone, Copy)]
enum Direction {
    InboundToOutbound,
    OutboundToInbound,
}

/// Per-connection SOCKS state machine and relay. Kept alive only by the tasks it has
/// spawned (the state-machine task, then the two relay copiers); the listener holds only a
/// `Weak` reference for broadcast shutdown.
pub struct Session {
    pub id: u64,
    listener: Weak<Listener>,
    options: Arc<ServerOptions>,
    next_proxy: Option<UpstreamProxy>,
    inbound: Arc<TcpStream>,
    outbound: Mutex<Option<Arc<TcpStream>>>,
    abort: AtomicBool,
}

impl Session {
    /// Parses `options.next_proxy` (if any) and, on success, spawns the state-machine task.
    /// A `next_proxy` that fails to parse logs and aborts session start entirely, matching
    /// the server's configuration-error policy: the socket is simply dropped, no accept retry.
    pub fn spawn(
        inbound: TcpStream,
        id: u64,
        listener: Weak<Listener>,
        options: Arc<ServerOptions>,
    ) -> Option<Weak<Session>> {
        let next_proxy = match options.next_proxy.as_deref() {
            Some(raw) => match UpstreamProxy::parse(raw) {
                Ok(parsed) => Some(parsed),
                Err(error) => {
                    warn!(connection_id = id, %error, "failed to parse next_proxy, dropping connection");
                    return None;
                }
            },
            None => None,
        };

        let session = Arc::new(Session {
            id,
            listener,
            options,
            next_proxy,
            inbound: Arc::new(inbound),
            outbound: Mutex::new(None),
            abort: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&session);
        tokio::spawn(session.run());
        Some(weak)
    }

    /// Sets the abort flag and force-closes both sockets, unblocking any pending read/write
    /// in the state machine or relay copiers with an I/O error.
    pub fn close(&self) {
        self.abort.store(true, Ordering::Relaxed);
        shutdown(&self.inbound, std::net::Shutdown::Both);
        if let Some(outbound) = self.outbound.lock().expect("outbound mutex poisoned").as_ref() {
            shutdown(outbound, std::net::Shutdown::Both);
        }
    }

    fn aborted(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }

    #[instrument(skip_all, fields(connection_id = self.id))]
    async fn run(self: Arc<Self>) {
        if let Err(error) = self.run_inner().await {
            debug!(%error, "session ended");
        }
    }

    async fn run_inner(self: &Arc<Self>) -> Result<(), SessionError> {
        let mut version = [0u8; 1];
        let peeked = self.inbound.peek(&mut version).await?;
        if peeked == 0 {
            return Ok(());
        }

        match version[0] {
            0x05 => self.handle_socks5().await,
            0x04 => self.handle_socks4().await,
            other => {
                debug!(version = other, "unrecognized protocol version, closing");
                Ok(())
            }
        }
    }

    async fn handle_socks5(self: &Arc<Self>) -> Result<(), SessionError> {
        let stream = SharedTcpStream(Arc::clone(&self.inbound));

        let requires_auth = self.options.requires_auth();
        let conf = Socks5AcceptorConfig {
            no_auth_required: !requires_auth,
            users: Some(vec![(self.options.username.clone(), self.options.password.clone())]),
        };

        let acceptor = Socks5Acceptor::accept_with_config(stream, &conf).await?;

        let dest = acceptor.dest_addr().clone();

        if !acceptor.is_connect_command() {
            // BIND/UDP ASSOCIATE are not relayed, but are acknowledged as successful: no
            // connect_host is ever attempted for them, so there is nothing to fail.
            acceptor.connected(dest).await?;
            return Ok(());
        }

        match self.connect_host(&dest).await {
            Ok((outbound, bound_addr)) => {
                *self.outbound.lock().expect("outbound mutex poisoned") = Some(Arc::clone(&outbound));
                acceptor.connected(bound_addr).await?;
                self.relay().await;
                Ok(())
            }
            Err(error) => {
                acceptor.failed_with_addr(Socks5FailureCode::from(&error), dest).await?;
                Err(SessionError::Connect(error))
            }
        }
    }

    async fn handle_socks4(self: &Arc<Self>) -> Result<(), SessionError> {
        let stream = SharedTcpStream(Arc::clone(&self.inbound));

        let requires_auth = self.options.requires_auth();
        let conf = Socks4AcceptorConfig {
            username: requires_auth.then(|| self.options.username.clone()),
        };

        let acceptor = match Socks4Acceptor::accept_with_config(stream, &conf).await {
            Ok(acceptor) => acceptor,
            Err(error) => return Err(SessionError::Io(error)),
        };

        if !acceptor.is_connect_command() {
            acceptor.failed(Socks4FailureCode::RequestRejectedOrFailed).await?;
            return Err(SessionError::Unsupported);
        }

        let dest = acceptor.dest_addr().clone();

        match self.connect_host(&dest).await {
            Ok((outbound, _bound_addr)) => {
                *self.outbound.lock().expect("outbound mutex poisoned") = Some(Arc::clone(&outbound));
                acceptor.connected().await?;
                self.relay().await;
                Ok(())
            }
            Err(error) => {
                acceptor.failed(Socks4FailureCode::CannotConnectTarget).await?;
                Err(SessionError::Connect(error))
            }
        }
    }

    /// Opens the outbound connection, either directly to `dest` or, if a `next_proxy` is
    /// configured, to that upstream followed by a client-side SOCKS handshake tunnelling to
    /// `dest`. Returns the socket to relay through plus the address to report back to the
    /// inbound client in the SOCKS reply.
    async fn connect_host(&self, dest: &DestAddr) -> std::io::Result<(Arc<TcpStream>, DestAddr)> {
        let bind_addr = self.options.parsed_bind_addr();

        if let Some(proxy) = &self.next_proxy {
            let raw = connect_one(SocketAddr::new(proxy.host, proxy.port), bind_addr).await?;
            let outbound = Arc::new(raw);
            let shared = SharedTcpStream(Arc::clone(&outbound));

            let (target_host, proxy_hostname) = match dest {
                DestAddr::Ip(addr) => (addr.ip().to_string(), false),
                DestAddr::Domain(host, _) => (host.clone(), true),
            };

            let upstream_options = socks_protocol::UpstreamOptions {
                target_host,
                target_port: dest.port(),
                proxy_hostname,
                username: proxy.username.clone(),
                password: proxy.password.clone(),
                version: proxy.version,
            };

            socks_protocol::handshake(shared, upstream_options).await?;

            return Ok((outbound, dest.clone()));
        }

        match dest {
            DestAddr::Ip(addr) => {
                let raw = connect_one(*addr, bind_addr).await?;
                Ok((Arc::new(raw), DestAddr::Ip(*addr)))
            }
            DestAddr::Domain(host, port) => {
                let mut last_error = None;
                for candidate in tokio::net::lookup_host((host.as_str(), *port)).await? {
                    match connect_one(candidate, bind_addr).await {
                        Ok(raw) => return Ok((Arc::new(raw), DestAddr::Ip(candidate))),
                        Err(error) => last_error = Some(error),
                    }
                }
                Err(last_error
                    .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "host resolved to no addresses")))
            }
        }
    }

    async fn relay(self: &Arc<Self>) {
        let inbound_to_outbound = tokio::spawn(Arc::clone(self).copy(Direction::InboundToOutbound));
        let outbound_to_inbound = tokio::spawn(Arc::clone(self).copy(Direction::OutboundToInbound));
        let _ = tokio::join!(inbound_to_outbound, outbound_to_inbound);
    }

    async fn copy(self: Arc<Self>, direction: Direction) {
        let outbound = self
            .outbound
            .lock()
            .expect("outbound mutex poisoned")
            .clone()
            .expect("outbound socket must be connected before relaying");

        let (src, dst) = match direction {
            Direction::InboundToOutbound => (&self.inbound, &outbound),
            Direction::OutboundToInbound => (&outbound, &self.inbound),
        };

        let mut buf = vec![0u8; RELAY_BUFFER_SIZE];

        loop {
            if self.aborted() {
                shutdown(dst, std::net::Shutdown::Write);
                return;
            }

            let read = match (&**src).read(&mut buf).await {
                Ok(0) | Err(_) => {
                    shutdown(dst, std::net::Shutdown::Write);
                    return;
                }
                Ok(n) => n,
            };

            if self.aborted() || (&**dst).write_all(&buf[..read]).await.is_err() {
                shutdown(src, std::net::Shutdown::Read);
                return;
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.upgrade() {
            listener.remove_client(self.id);
        }
    }
}

async fn connect_one(addr: SocketAddr, bind_addr: Option<std::net::IpAddr>) -> std::io::Result<TcpStream> {
    let Some(bind_addr) = bind_addr else {
        return TcpStream::connect(addr).await;
    };

    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.bind(SocketAddr::new(bind_addr, 0))?;
    socket.connect(addr).await
}
