//! End-to-end tests driving the real listener over loopback TCP, with a stub echo server
//! standing in for the target host.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use socks_protocol::{Socks4Stream, Socks5Stream};
use socks_proxy::{Listener, ServerOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else { return };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

async fn spawn_proxy(options: ServerOptions) -> SocketAddr {
    let listener = Listener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0), options)
        .await
        .unwrap();
    let addr = listener.addr();
    tokio::spawn(async move { listener.serve().await });
    addr
}

#[tokio::test]
async fn socks5_connect_relays_data_round_trip() {
    let echo_addr = spawn_echo_server().await;
    let proxy_addr = spawn_proxy(ServerOptions::default()).await;

    let stream = TcpStream::connect(proxy_addr).await.unwrap();
    let mut tunnel = Socks5Stream::connect(stream, echo_addr).await.unwrap();

    tunnel.write_all(b"hello world").await.unwrap();
    let mut buf = [0u8; 11];
    tunnel.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello world");
}

#[tokio::test]
async fn socks5_connect_requires_password_when_configured() {
    let echo_addr = spawn_echo_server().await;
    let options = ServerOptions {
        username: "alice".into(),
        password: "secret".into(),
        ..ServerOptions::default()
    };
    let proxy_addr = spawn_proxy(options).await;

    let stream = TcpStream::connect(proxy_addr).await.unwrap();
    let result = Socks5Stream::connect(stream, echo_addr).await;
    assert!(result.is_err(), "anonymous connect should be rejected when auth is required");

    let stream = TcpStream::connect(proxy_addr).await.unwrap();
    let mut tunnel = Socks5Stream::connect_with_password(stream, echo_addr, "alice", "secret")
        .await
        .unwrap();

    tunnel.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    tunnel.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
}

#[tokio::test]
async fn socks4_connect_relays_data_round_trip() {
    let echo_addr = spawn_echo_server().await;
    let proxy_addr = spawn_proxy(ServerOptions::default()).await;

    let stream = TcpStream::connect(proxy_addr).await.unwrap();
    let SocketAddr::V4(echo_v4) = echo_addr else {
        panic!("loopback echo server should be bound on IPv4");
    };
    let mut tunnel = Socks4Stream::connect(stream, echo_v4, "").await.unwrap();

    tunnel.write_all(b"socks4").await.unwrap();
    let mut buf = [0u8; 6];
    tunnel.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"socks4");
}

#[tokio::test]
async fn half_close_propagates_between_directions() {
    let echo_addr = spawn_echo_server().await;
    let proxy_addr = spawn_proxy(ServerOptions::default()).await;

    let stream = TcpStream::connect(proxy_addr).await.unwrap();
    let mut tunnel = Socks5Stream::connect(stream, echo_addr).await.unwrap();

    tunnel.write_all(b"still alive").await.unwrap();
    let mut buf = [0u8; 11];
    tunnel.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"still alive");

    // Closing our write half should eventually surface as EOF once the echo server's own
    // read half observes the shutdown and the relay propagates it back.
    tunnel.shutdown().await.unwrap();
    let mut trailing = Vec::new();
    tunnel.read_to_end(&mut trailing).await.unwrap();
    assert!(trailing.is_empty());
}
