use std::io;
use std::net::SocketAddr;

use socks_types::{DestAddr, ToDestAddr};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{Socks4Stream, Socks5Stream};

/// Which SOCKS dialect to speak to the upstream proxy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyVersion {
    Socks4,
    Socks4a,
    Socks5,
}

/// Parameters for a chained (upstream) SOCKS handshake.
#[derive(Clone, Debug)]
pub struct UpstreamOptions {
    pub target_host: String,
    pub target_port: u16,
    /// When true, the upstream proxy is asked to resolve `target_host` itself rather than
    /// the caller resolving it beforehand.
    pub proxy_hostname: bool,
    pub username: String,
    pub password: String,
    pub version: ProxyVersion,
}

/// Performs the client side of a SOCKS handshake against an already-connected upstream
/// proxy socket, tunnelling to `options.target_host:options.target_port`.
///
/// `stream` is consumed for the duration of the handshake and handed back implicitly: once
/// this returns `Ok(())`, the same underlying transport (if the caller kept another handle
/// to it, e.g. a cloned `Arc`) carries the established tunnel and payload bytes can be
/// relayed through it directly, since SOCKS CONNECT tunnels transparently over the
/// handshake connection. On failure, the error from the underlying wire-protocol
/// implementation is surfaced verbatim.
pub async fn handshake<S>(stream: S, options: UpstreamOptions) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    match options.version {
        // Plain SOCKS4 has no hostname-resolution extension: the target must already be (or
        // be resolved to) an IP address before the request is built, regardless of
        // `proxy_hostname`.
        ProxyVersion::Socks4 => {
            let dest = resolve_to_ip(&options.target_host, options.target_port).await?;
            Socks4Stream::connect(stream, dest, &options.username).await?;
        }
        ProxyVersion::Socks4a => {
            let dest: DestAddr = if options.proxy_hostname {
                DestAddr::Domain(options.target_host, options.target_port)
            } else {
                (options.target_host.as_str(), options.target_port).to_dest_addr()?
            };
            Socks4Stream::connect(stream, dest, &options.username).await?;
        }
        ProxyVersion::Socks5 => {
            let dest = (options.target_host.as_str(), options.target_port);
            if options.username.is_empty() {
                Socks5Stream::connect(stream, dest).await?;
            } else {
                Socks5Stream::connect_with_password(stream, dest, options.username, options.password).await?;
            }
        }
    }

    Ok(())
}

/// Resolves `host` to an IP address, parsing it directly when it is already a literal and
/// falling back to DNS resolution otherwise.
async fn resolve_to_ip(host: &str, port: u16) -> io::Result<DestAddr> {
    if let Ok(ip) = host.parse() {
        return Ok(DestAddr::Ip(SocketAddr::new(ip, port)));
    }

    let mut addrs = tokio::net::lookup_host((host, port)).await?;
    let addr = addrs
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses"))?;
    Ok(DestAddr::Ip(addr))
}
