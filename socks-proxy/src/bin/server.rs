use std::io;
use std::net::{IpAddr, SocketAddr};

use socks_proxy::{Listener, ServerOptions};
use tracing::info;

const USAGE: &str = "[--port <PORT>] [--bind-addr <ADDR>] [--user <USERNAME>,<PASSWORD>] [--next-proxy <URL>]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let argv: Vec<String> = std::env::args().collect();
    let argv: Vec<&str> = argv.iter().skip(1).map(String::as_str).collect();
    let args = match parse_args(&argv) {
        Ok(args) => args,
        Err(error) => {
            eprintln!("{error}");
            println!("Usage: socks-proxy {USAGE}");
            return Err(error.into());
        }
    };

    if args.show_usage {
        println!("Usage: socks-proxy {USAGE}");
        return Ok(());
    }

    let options = ServerOptions {
        username: args.username,
        password: args.password,
        bind_addr: args.bind_addr,
        next_proxy: args.next_proxy,
    };

    let listen_addr = SocketAddr::new(args.listen_host, args.port);
    let listener = Listener::bind(listen_addr, options).await?;

    info!(addr = %listener.addr(), "socks-proxy listening");

    listener.serve().await;

    Ok(())
}

#[derive(Debug)]
struct Args {
    listen_host: IpAddr,
    port: u16,
    username: String,
    password: String,
    bind_addr: Option<String>,
    next_proxy: Option<String>,
    show_usage: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            listen_host: IpAddr::from([0, 0, 0, 0]),
            port: 1080,
            username: String::new(),
            password: String::new(),
            bind_addr: None,
            next_proxy: None,
            show_usage: false,
        }
    }
}

fn parse_args(mut input: &[&str]) -> io::Result<Args> {
    let mut args = Args::default();

    loop {
        match input {
            ["--port" | "-p", value, rest @ ..] => {
                args.port = value
                    .parse()
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("port value malformed: {e}")))?;
                input = rest;
            }
            ["--listen-host", value, rest @ ..] => {
                args.listen_host = value
                    .parse()
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("listen host malformed: {e}")))?;
                input = rest;
            }
            ["--bind-addr", value, rest @ ..] => {
                args.bind_addr = Some((*value).to_owned());
                input = rest;
            }
            ["--next-proxy", value, rest @ ..] => {
                args.next_proxy = Some((*value).to_owned());
                input = rest;
            }
            ["--user" | "-u", value, rest @ ..] => {
                let idx = value
                    .find(',')
                    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("malformed username,password: {value}")))?;
                let (user, pass) = value.split_at(idx);
                args.username = user.to_owned();
                args.password = pass[1..].to_owned();
                input = rest;
            }
            ["--help" | "-h", rest @ ..] => {
                args.show_usage = true;
                input = rest;
            }
            [unexpected, ..] => {
                return Err(io::Error::new(io::ErrorKind::InvalidInput, format!("unexpected argument: {unexpected}")))
            }
            [] => break,
        }
    }

    Ok(args)
}
