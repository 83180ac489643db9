use crate::ReadWriteStream;
use socks_types::{DestAddr, ToDestAddr};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// SOCKS4 CONNECT client.
#[derive(Debug)]
pub struct Socks4Stream<S> {
    inner: S,
    dest_addr: SocketAddrV4,
}

impl<S> Socks4Stream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Initiates a CONNECT request to the specified proxy.
    pub async fn connect(mut stream: S, dest: impl ToDestAddr, userid: &str) -> io::Result<Self> {
        let dest = dest.to_dest_addr()?;

        // SOCKS request
        write_socks_request(&mut stream, &dest, userid).await?;

        // SOCKS reply
        let dest_addr = read_socks_reply(&mut stream).await?;

        Ok(Socks4Stream {
            inner: stream,
            dest_addr,
        })
    }

    /// Returns the destination address that the proxy server connects to.
    pub fn dest_addr(&self) -> SocketAddrV4 {
        self.dest_addr
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S> AsyncRead for Socks4Stream<S>
where
    S: AsyncRead + Unpin,
{
    #[inline]
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S> AsyncWrite for Socks4Stream<S>
where
    S: AsyncWrite + Unpin,
{
    #[inline]
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<Result<usize, io::Error>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    #[inline]
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), io::Error>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    #[inline]
    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), io::Error>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

async fn write_socks_request(stream: &mut dyn ReadWriteStream, dest: &DestAddr, userid: &str) -> io::Result<()> {
    // https://www.openssh.com/txt/socks4.protocol
    //             +----+----+----+----+----+----+----+----+----+----+....+----+
    //             | VN | CD | DSTPORT |      DSTIP        | USERID       |NULL|
    //             +----+----+----+----+----+----+----+----+----+----+....+----+
    // # of bytes:   1    1      2              4           variable       1
    //
    // VN is the SOCKS protocol version number and should be 4. CD is the
    // SOCKS command code and should be 1 for CONNECT request. NULL is a byte
    // of all zero bits.

    let mut packet = vec![
        4, // version
        1, // command (1 = CONNECT)
    ];

    match dest {
        DestAddr::Ip(SocketAddr::V4(addr)) => {
            packet.extend_from_slice(&addr.port().to_be_bytes());
            packet.extend_from_slice(&u32::from(*addr.ip()).to_be_bytes());
            packet.extend_from_slice(userid.as_bytes());
            packet.push(0);
        }
        DestAddr::Ip(SocketAddr::V6(_)) => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "SOCKS4 does not support IPv6",
            ));
        }
        DestAddr::Domain(domain, port) => {
            // SOCKS4a: invalid IP with a non-zero last octet signals the server that it
            // should resolve the hostname that follows the (NUL-terminated) userid.
            packet.extend_from_slice(&port.to_be_bytes());
            packet.extend_from_slice(&u32::from(Ipv4Addr::new(0, 0, 0, 1)).to_be_bytes());
            packet.extend_from_slice(userid.as_bytes());
            packet.push(0);
            packet.extend_from_slice(domain.as_bytes());
            packet.push(0);
        }
    }

    stream.write_all(&packet).await?;

    Ok(())
}

async fn read_socks_reply(stream: &mut dyn ReadWriteStream) -> io::Result<SocketAddrV4> {
    // https://www.openssh.com/txt/socks4.protocol
    //	        	+----+----+----+----+----+----+----+----+
    //	        	| VN | CD | DSTPORT |      DSTIP        |
    //	        	+----+----+----+----+----+----+----+----+
    // # of bytes:	   1    1      2              4
    //
    // VN is the version of the reply code and should be 0. CD is the result code.

    if stream.read_u8().await? != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "invalid version of reply code",
        ));
    }

    match stream.read_u8().await? {
        90 => {}
        91 => return Err(io::Error::other("request rejected or failed")),
        92 => {
            return Err(io::Error::other(
                "request rejected because SOCKS server cannot connect to identd on the client",
            ));
        }
        93 => {
            return Err(io::Error::other(
                "request rejected because the client program and identd report different user-ids",
            ));
        }
        _ => return Err(io::Error::other("invalid result code")),
    }

    let port = stream.read_u16().await?;
    let ip = stream.read_u32().await?;

    Ok(SocketAddrV4::new(Ipv4Addr::from(ip), port))
}

/// SOCKS4 reply codes.
#[derive(Clone, Copy, Debug)]
#[repr(u8)]
pub enum Socks4FailureCode {
    RequestRejectedOrFailed = 91,
    CannotConnectTarget = 92,
}

impl Socks4FailureCode {
    fn to_u8(self) -> u8 {
        self as u8
    }
}

impl core::fmt::Display for Socks4FailureCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Socks4FailureCode::RequestRejectedOrFailed => write!(f, "request rejected or failed"),
            Socks4FailureCode::CannotConnectTarget => write!(f, "request rejected because the SOCKS server cannot connect to the target"),
        }
    }
}

/// Configuration for a SOCKS4 acceptor.
///
/// `username` being `None` means no authentication is required, and any (or no) USERID
/// is accepted. `Some(expected)` requires the client's USERID to match `expected` exactly.
#[derive(Debug, Default)]
pub struct Socks4AcceptorConfig {
    pub username: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Command {
    Connect,
    Other(u8),
}

/// SOCKS4/4a request acceptor for usage in a proxy server.
///
/// Unlike `Socks5Acceptor`, there is no corresponding client-side negotiation step: SOCKS4
/// has no method-selection handshake, so the request is the first thing read off the wire.
#[derive(Debug)]
pub struct Socks4Acceptor<S> {
    inner: S,
    cmd: Command,
    dest_addr: DestAddr,
    // Raw DSTPORT/DSTIP from the request, echoed back verbatim in the reply regardless of
    // what address was actually dialed (this is what real SOCKS4 implementations do).
    raw_dst_port: u16,
    raw_dst_ip: Ipv4Addr,
    userid: String,
}

impl<S> Socks4Acceptor<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Accepts a SOCKS4/4a request without requiring any authentication.
    pub async fn accept(stream: S) -> io::Result<Self> {
        Self::accept_with_config(stream, &Socks4AcceptorConfig::default()).await
    }

    /// Accepts a SOCKS4/4a request, enforcing `conf.username` if set.
    ///
    /// On a USERID mismatch, the rejection reply is written before returning `Err`, mirroring
    /// `Socks5Acceptor::accept_with_config`'s handling of an unacceptable auth method.
    pub async fn accept_with_config(mut stream: S, conf: &Socks4AcceptorConfig) -> io::Result<Self> {
        if stream.read_u8().await? != 4 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "invalid request version"));
        }

        let cmd = match stream.read_u8().await? {
            1 => Command::Connect,
            other => Command::Other(other),
        };

        let raw_dst_port = stream.read_u16().await?;
        let raw_dst_ip = Ipv4Addr::from(stream.read_u32().await?);

        // SOCKS4a: a destination of the form 0.0.0.x (x != 0) means "resolve the hostname
        // that follows the userid"; 0.0.0.0 itself is left as a (useless) literal IPv4 address.
        let octets = raw_dst_ip.octets();
        let is_socks4a = octets[0] == 0 && octets[1] == 0 && octets[2] == 0 && octets[3] != 0;

        let userid = read_nul_terminated_string(&mut stream).await?;

        let dest_addr = if is_socks4a {
            let hostname = read_nul_terminated_string(&mut stream).await?;
            DestAddr::Domain(hostname, raw_dst_port)
        } else {
            DestAddr::Ip(SocketAddr::V4(SocketAddrV4::new(raw_dst_ip, raw_dst_port)))
        };

        if let Some(expected) = &conf.username {
            // An empty `expected` means "no authentication required"; any USERID is accepted.
            if !expected.is_empty() && expected.as_str() != userid {
                write_reply(&mut stream, Socks4ReplyCode::Failure(Socks4FailureCode::RequestRejectedOrFailed), raw_dst_port, raw_dst_ip)
                    .await?;
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "SOCKS4 USERID authentication failed",
                ));
            }
        }

        Ok(Self {
            inner: stream,
            cmd,
            dest_addr,
            raw_dst_port,
            raw_dst_ip,
            userid,
        })
    }

    /// Returns the destination address the proxy server should connect to.
    pub fn dest_addr(&self) -> &DestAddr {
        &self.dest_addr
    }

    /// The USERID field sent by the client (may be empty).
    pub fn userid(&self) -> &str {
        &self.userid
    }

    pub fn is_connect_command(&self) -> bool {
        matches!(self.cmd, Command::Connect)
    }

    /// Sends the final `request granted` reply. DSTPORT/DSTIP echo the original request,
    /// per the SOCKS4 memo, not the resolved endpoint.
    pub async fn connected(mut self) -> io::Result<S> {
        write_reply(&mut self.inner, Socks4ReplyCode::Granted, self.raw_dst_port, self.raw_dst_ip).await?;
        Ok(self.inner)
    }

    /// Sends a rejection reply and consumes the stream.
    pub async fn failed(mut self, code: Socks4FailureCode) -> io::Result<()> {
        write_reply(&mut self.inner, Socks4ReplyCode::Failure(code), self.raw_dst_port, self.raw_dst_ip).await
    }
}

enum Socks4ReplyCode {
    Granted,
    Failure(Socks4FailureCode),
}

async fn write_reply(
    stream: &mut dyn ReadWriteStream,
    code: Socks4ReplyCode,
    dst_port: u16,
    dst_ip: Ipv4Addr,
) -> io::Result<()> {
    let code = match code {
        Socks4ReplyCode::Granted => 90,
        Socks4ReplyCode::Failure(c) => c.to_u8(),
    };

    let mut packet = Vec::with_capacity(8);
    packet.push(0); // VN of the reply is always 0
    packet.push(code);
    packet.extend_from_slice(&dst_port.to_be_bytes());
    packet.extend_from_slice(&dst_ip.octets());

    stream.write_all(&packet).await
}

async fn read_nul_terminated_string(stream: &mut dyn ReadWriteStream) -> io::Result<String> {
    let mut buf = Vec::new();
    loop {
        let byte = stream.read_u8().await?;
        if byte == 0 {
            break;
        }
        buf.push(byte);
    }
    String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[expect(clippy::unwrap_used, reason = "Test code can panic on errors")]
#[cfg(test)]
mod tests {
    use super::*;

    async fn assert_encoding(addr: DestAddr, userid: &str, encoded: &[u8]) {
        let mut writer = tokio_test::io::Builder::new().write(encoded).build();
        write_socks_request(&mut writer, &addr, userid).await.unwrap();
    }

    #[tokio::test]
    async fn ipv4_addr() {
        assert_encoding(
            "192.168.0.39:80".to_dest_addr().unwrap(),
            "david",
            &[4, 1, 0, 80, 192, 168, 0, 39, 100, 97, 118, 105, 100, 0],
        )
        .await;
    }

    #[tokio::test]
    async fn domain_addr() {
        assert_encoding(
            "devolutions.net:80".to_dest_addr().unwrap(),
            "david",
            &[
                4, 1, 0, 80, 0, 0, 0, 1, 100, 97, 118, 105, 100, 0, 100, 101, 118, 111, 108, 117, 116, 105, 111, 110,
                115, 46, 110, 101, 116, 0,
            ],
        )
        .await;
    }

    #[tokio::test]
    async fn accept_ipv4_connect_no_auth() {
        let stream = tokio_test::io::Builder::new()
            .read(&[4, 1, 0, 80, 127, 0, 0, 1, b'u', 0])
            .write(&[0, 90, 0, 80, 127, 0, 0, 1])
            .build();

        let acceptor = Socks4Acceptor::accept(stream).await.unwrap();
        assert!(acceptor.is_connect_command());
        assert_eq!(
            acceptor.dest_addr(),
            &DestAddr::Ip(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 80)))
        );
        acceptor.connected().await.unwrap();
    }

    #[tokio::test]
    async fn accept_socks4a_domain() {
        let stream = tokio_test::io::Builder::new()
            .read(&[4, 1, 0, 80, 0, 0, 0, 1, b'u', 0, b'h', b'o', b's', b't', 0])
            .write(&[0, 90, 0, 80, 0, 0, 0, 1])
            .build();

        let acceptor = Socks4Acceptor::accept(stream).await.unwrap();
        assert_eq!(acceptor.dest_addr(), &DestAddr::Domain("host".to_owned(), 80));
        acceptor.connected().await.unwrap();
    }

    #[tokio::test]
    async fn accept_rejects_bad_userid() {
        let stream = tokio_test::io::Builder::new()
            .read(&[4, 1, 0, 80, 127, 0, 0, 1, b'x', 0])
            .write(&[0, 91, 0, 80, 127, 0, 0, 1])
            .build();

        let conf = Socks4AcceptorConfig {
            username: Some("u".to_owned()),
        };
        let err = Socks4Acceptor::accept_with_config(stream, &conf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }
}
