use std::fs;
use std::io;
use std::sync::Arc;

use rpctap_observe::{Recorder, SubscriptionHub};
use rpctap_proto::MessageRegistry;
use rpctap_tls::{CaStore, CaStoreConfig, KeyLogSink};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

mod api;
mod config;
mod connect;
mod inspect;
mod intercept;
mod mirror;
mod peek;
mod socks5;
mod upstream;

pub use config::{ConfigError, ProxyConfig};
pub use connect::{parse_connect_authority, request_line, ConnectError, TunnelTarget};
pub use peek::PeekableStream;
pub use upstream::{parse_proxy_url, ProxyEndpoint, UpstreamDialer};

use api::{run_api, ApiContext};
use intercept::Interceptor;
use socks5::accept_socks5;

#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("certificate authority init failed: {0}")]
    Ca(#[from] rpctap_tls::CaError),
    #[error("descriptor registry init failed: {0}")]
    Registry(#[from] rpctap_proto::RegistryError),
    #[error("I/O error during startup: {0}")]
    Io(#[from] io::Error),
}

/// The assembled proxy: CONNECT and SOCKS5 acceptors feeding the MITM
/// engine, plus the management endpoint.
pub struct ProxyServer {
    config: ProxyConfig,
    ca: Arc<CaStore>,
    recorder: Arc<Recorder>,
    hub: Arc<SubscriptionHub>,
    interceptor: Arc<Interceptor>,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig) -> Result<Self, StartError> {
        config.validate()?;
        fs::create_dir_all(&config.state_dir)?;
        fs::create_dir_all(config.data_dir())?;
        if let Some(parent) = config.record_path.as_deref().and_then(|path| path.parent()) {
            fs::create_dir_all(parent)?;
        }

        let ca = Arc::new(CaStore::ensure(CaStoreConfig::new(&config.state_dir))?);
        let key_log = Arc::new(KeyLogSink::open(config.key_log_path())?);
        tracing::info!(path = %config.key_log_path().display(), "TLS key log enabled");

        let registry = match &config.descriptor_set_path {
            Some(path) => {
                let registry = MessageRegistry::from_descriptor_set_file(path)?;
                tracing::info!(path = %path.display(), "descriptor set loaded");
                Arc::new(registry)
            }
            None => Arc::new(MessageRegistry::new()),
        };

        let recorder = Recorder::open(config.record_path.as_deref(), config.record_cache_size)?;
        if let Some(path) = &config.record_path {
            tracing::info!(path = %path.display(), "record log enabled");
        }

        let hub = Arc::new(SubscriptionHub::new());
        let broadcast = hub.handle();
        recorder.set_on_record(Arc::new(move |record| broadcast.broadcast_record(record)));

        let dialer = Arc::new(UpstreamDialer::new(
            config.upstream_proxy.as_deref(),
            config.dial_timeout,
        )?);

        let interceptor = Arc::new(Interceptor {
            ca: Arc::clone(&ca),
            key_log,
            dialer,
            recorder: Arc::clone(&recorder),
            registry,
            enable_http_parsing: config.enable_http_parsing,
            max_http_head_bytes: config.max_http_head_bytes,
        });

        Ok(Self {
            config,
            ca,
            recorder,
            hub,
            interceptor,
        })
    }

    pub fn recorder(&self) -> Arc<Recorder> {
        Arc::clone(&self.recorder)
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Binds all listeners and serves until one of them fails. Dropping the
    /// future closes the listeners; in-flight sessions end with their
    /// sockets.
    pub async fn run(&self) -> io::Result<()> {
        let http_listener = self.bind(self.config.http_port).await?;
        tracing::info!(addr = %listener_addr(&http_listener), "HTTP CONNECT proxy listening");
        let socks_listener = self.bind(self.config.socks5_port).await?;
        tracing::info!(addr = %listener_addr(&socks_listener), "SOCKS5 proxy listening");
        let api_listener = self.bind(self.config.api_port).await?;
        let api_addr = listener_addr(&api_listener);
        tracing::info!(addr = %api_addr, "management API listening");

        if let Err(error) = fs::write(self.config.api_addr_path(), api_addr.as_bytes()) {
            tracing::warn!(%error, "failed to write api.addr");
        }

        let hub = Arc::clone(&self.hub);
        let dispatch = tokio::spawn(async move { hub.run().await });

        let api_ctx = Arc::new(ApiContext {
            recorder: Arc::clone(&self.recorder),
            hub: Arc::clone(&self.hub),
            ca: Arc::clone(&self.ca),
            recent_fetch_max: self.config.recent_fetch_max,
        });

        let result = tokio::select! {
            result = accept_http(http_listener, Arc::clone(&self.interceptor)) => result,
            result = accept_socks(socks_listener, Arc::clone(&self.interceptor)) => result,
            result = run_api(api_listener, api_ctx) => result,
        };

        dispatch.abort();
        result
    }

    /// Removes the discovery file; called once serving has stopped.
    pub fn cleanup(&self) {
        let _ = fs::remove_file(self.config.api_addr_path());
    }

    async fn bind(&self, port: u16) -> io::Result<TcpListener> {
        TcpListener::bind((self.config.listen_addr.as_str(), port)).await
    }
}

fn listener_addr(listener: &TcpListener) -> String {
    listener
        .local_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "<unknown>".to_string())
}

async fn accept_http(listener: TcpListener, interceptor: Arc<Interceptor>) -> io::Result<()> {
    loop {
        let (stream, client_addr) = listener.accept().await?;
        let interceptor = Arc::clone(&interceptor);
        tokio::spawn(async move {
            if let Err(error) = handle_http_connection(stream, interceptor).await {
                tracing::debug!(client = %client_addr, %error, "http connection ended");
            }
        });
    }
}

async fn accept_socks(listener: TcpListener, interceptor: Arc<Interceptor>) -> io::Result<()> {
    loop {
        let (stream, client_addr) = listener.accept().await?;
        let interceptor = Arc::clone(&interceptor);
        tokio::spawn(async move {
            if let Err(error) = handle_socks_connection(stream, interceptor).await {
                tracing::debug!(client = %client_addr, %error, "socks5 connection ended");
            }
        });
    }
}

async fn handle_http_connection(
    stream: TcpStream,
    interceptor: Arc<Interceptor>,
) -> io::Result<()> {
    let mut client = PeekableStream::new(stream);
    let head = read_request_head(&mut client, interceptor.max_http_head_bytes).await?;
    let (method, target) = match request_line(&head) {
        Ok(parsed) => parsed,
        Err(_) => {
            client.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await?;
            return Ok(());
        }
    };

    if method == "CONNECT" {
        let target = match parse_connect_authority(&target) {
            Ok(target) => target,
            Err(_) => {
                client.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await?;
                return Ok(());
            }
        };
        client
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await?;
        tracing::info!(host = %target.host, port = target.port, "CONNECT");
        return interceptor
            .intercept_auto(client, &target.host, target.port)
            .await;
    }

    // Plain HTTP proxying: forwarded to origin without interception.
    forward_plain_http(client, &head, &method, &target).await
}

async fn handle_socks_connection(
    stream: TcpStream,
    interceptor: Arc<Interceptor>,
) -> io::Result<()> {
    let mut stream = stream;
    let Some(target) = accept_socks5(&mut stream).await? else {
        return Ok(());
    };
    tracing::info!(host = %target.host, port = target.port, "SOCKS5 CONNECT");
    interceptor
        .intercept_auto(PeekableStream::new(stream), &target.host, target.port)
        .await
}

/// Reads one request head off the stream, putting any over-read bytes back.
async fn read_request_head(
    client: &mut PeekableStream<TcpStream>,
    max_head_bytes: usize,
) -> io::Result<Vec<u8>> {
    let mut head = Vec::with_capacity(512);
    let mut chunk = [0_u8; 2048];
    loop {
        if let Some(end) = find_subsequence(&head, b"\r\n\r\n") {
            let excess = head.split_off(end + 4);
            client.unread(&excess);
            return Ok(head);
        }
        if head.len() > max_head_bytes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "request head exceeded configured limit",
            ));
        }
        let read = client.read(&mut chunk).await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "client closed before request head completed",
            ));
        }
        head.extend_from_slice(&chunk[..read]);
    }
}

/// Non-CONNECT requests are relayed to the origin: the request line is
/// rewritten to origin form and the two sockets are joined afterwards.
async fn forward_plain_http(
    mut client: PeekableStream<TcpStream>,
    head: &[u8],
    method: &str,
    target: &str,
) -> io::Result<()> {
    let Some((host, port, origin_target)) = plain_http_target(head, target) else {
        client.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await?;
        return Ok(());
    };

    let mut upstream = match TcpStream::connect((host.as_str(), port)).await {
        Ok(stream) => stream,
        Err(_) => {
            client.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await?;
            return Ok(());
        }
    };

    let head_text = String::from_utf8_lossy(head);
    let mut rebuilt = format!("{method} {origin_target} HTTP/1.1\r\n");
    for line in head_text.split("\r\n").skip(1) {
        if line.is_empty() {
            break;
        }
        if line.to_ascii_lowercase().starts_with("proxy-connection:") {
            continue;
        }
        rebuilt.push_str(line);
        rebuilt.push_str("\r\n");
    }
    rebuilt.push_str("\r\n");

    upstream.write_all(rebuilt.as_bytes()).await?;
    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok(_) => Ok(()),
        Err(error) if mirror::is_benign_disconnect(&error) => Ok(()),
        Err(error) => Err(error),
    }
}

/// Resolves the origin `(host, port, origin-form target)` for a plain
/// proxied request, from the absolute-form URI or the Host header.
fn plain_http_target(head: &[u8], target: &str) -> Option<(String, u16, String)> {
    if let Some(rest) = target.strip_prefix("http://") {
        let (authority, path) = match rest.find('/') {
            Some(index) => (&rest[..index], &rest[index..]),
            None => (rest, "/"),
        };
        let (host, port) = split_host_port(authority, 80)?;
        return Some((host, port, path.to_string()));
    }

    let head_text = std::str::from_utf8(head).ok()?;
    let host_header = head_text.split("\r\n").skip(1).find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim().eq_ignore_ascii_case("host").then(|| value.trim())
    })?;
    let (host, port) = split_host_port(host_header, 80)?;
    Some((host, port, target.to_string()))
}

fn split_host_port(authority: &str, default_port: u16) -> Option<(String, u16)> {
    if authority.is_empty() {
        return None;
    }
    match authority.rsplit_once(':') {
        Some((host, port_text)) if !host.contains(':') => {
            let port = port_text.parse::<u16>().ok()?;
            Some((host.to_string(), port))
        }
        _ => Some((authority.to_string(), default_port)),
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
