use std::net::IpAddr;

use socks_protocol::ProxyVersion;

/// Server-wide configuration, snapshotted by value into every [`crate::session::Session`]
/// when it starts so that later mutation (there is none in this crate, but the invariant is
/// worth keeping explicit) can never change the rules mid-connection.
#[derive(Clone, Debug, Default)]
pub struct ServerOptions {
    /// Empty means "no authentication required" for both SOCKS4 USERID and SOCKS5 user/pass.
    pub username: String,
    pub password: String,
    /// Textual IP literal outbound sockets should bind to. Parsed lazily; an unparseable
    /// value is treated as absent rather than a hard configuration error.
    pub bind_addr: Option<String>,
    /// `socks{4,4a,5}://[user[:pass]@]host:port` descriptor of an upstream proxy. Presence
    /// switches outbound connects into chained mode.
    pub next_proxy: Option<String>,
}

impl ServerOptions {
    pub fn requires_auth(&self) -> bool {
        !self.username.is_empty()
    }

    pub fn parsed_bind_addr(&self) -> Option<IpAddr> {
        self.bind_addr.as_deref().and_then(|s| s.parse().ok())
    }
}

/// `next_proxy` after parsing, resolved once per session. Grounded in the upstream
/// descriptor format documented for `next_proxy_` in the original server: a numeric host
/// (no DNS resolution of the upstream itself) and a scheme selecting the dialect to speak.
#[derive(Clone, Debug)]
pub struct UpstreamProxy {
    pub host: IpAddr,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub version: ProxyVersion,
}

impl UpstreamProxy {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let url = url::Url::parse(raw)?;

        let version = match url.scheme() {
            "socks4" => ProxyVersion::Socks4,
            "socks4a" => ProxyVersion::Socks4a,
            "socks5" => ProxyVersion::Socks5,
            other => anyhow::bail!("unsupported next_proxy scheme: {other}"),
        };

        let host = url
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("next_proxy is missing a host"))?
            .parse::<IpAddr>()
            .map_err(|_| anyhow::anyhow!("next_proxy host must be a numeric IP literal"))?;

        let port = url.port().ok_or_else(|| anyhow::anyhow!("next_proxy is missing a port"))?;

        let username = url.username().to_owned();
        let password = url.password().unwrap_or("").to_owned();

        Ok(Self {
            host,
            port,
            username,
            password,
            version,
        })
    }
}
