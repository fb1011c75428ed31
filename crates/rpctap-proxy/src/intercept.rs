use std::io;
use std::sync::{Arc, Mutex};

use rpctap_http::Direction;
use rpctap_observe::{Recorder, Session, TrafficLog};
use rpctap_proto::MessageRegistry;
use rpctap_tls::{
    build_leaf_server_config, build_upstream_client_config, client_hello_record_len, extract_sni,
    is_tls_client_hello, CaStore, KeyLogSink,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::inspect::InspectorContext;
use crate::mirror::{is_benign_disconnect, splice};
use crate::peek::PeekableStream;
use crate::upstream::UpstreamDialer;

/// Everything one interception needs: trust material, the upstream dialer,
/// the recorder and the descriptor registry.
pub(crate) struct Interceptor {
    pub ca: Arc<CaStore>,
    pub key_log: Arc<KeyLogSink>,
    pub dialer: Arc<UpstreamDialer>,
    pub recorder: Arc<Recorder>,
    pub registry: Arc<MessageRegistry>,
    pub enable_http_parsing: bool,
    pub max_http_head_bytes: usize,
}

impl Interceptor {
    /// Entry point for a freshly accepted tunnel. Peeks the first bytes to
    /// decide between TLS interception and plain relay; either way the
    /// client stream keeps every byte it arrived with.
    pub async fn intercept_auto<S>(
        &self,
        mut client: PeekableStream<S>,
        target_host: &str,
        target_port: u16,
    ) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let prefix = client.peek(6).await?.to_vec();
        if !is_tls_client_hello(&prefix) {
            tracing::debug!(host = target_host, port = target_port, "plain relay");
            return self.relay_plain(client, target_host, target_port).await;
        }

        let sni = match client_hello_record_len(&prefix) {
            Some(record_len) => {
                let hello = client.peek(record_len).await?;
                extract_sni(hello)
            }
            None => None,
        };
        let host = sni.as_deref().unwrap_or(target_host);
        tracing::debug!(
            target = target_host,
            port = target_port,
            sni = sni.as_deref().unwrap_or(""),
            "tls intercept"
        );
        self.intercept_tls(client, host, target_port).await
    }

    async fn intercept_tls<S>(
        &self,
        client: PeekableStream<S>,
        host: &str,
        port: u16,
    ) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let upstream_tcp = match self.dialer.dial(host, port).await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::warn!(host, port, %error, "upstream dial failed");
                return Ok(());
            }
        };

        // Upstream leg first: there is no point minting a leaf for a server
        // that cannot be reached.
        let server_name = match ServerName::try_from(host.to_string()) {
            Ok(name) => name,
            Err(_) => {
                tracing::warn!(host, "invalid server name for upstream TLS");
                return Ok(());
            }
        };
        let connector =
            TlsConnector::from(build_upstream_client_config(Arc::clone(&self.key_log)));
        let upstream_tls = match connector.connect(server_name, upstream_tcp).await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::warn!(host, port, %error, "upstream TLS handshake failed");
                return Ok(());
            }
        };

        let leaf = match self.ca.get_or_mint(host) {
            Ok(leaf) => leaf,
            Err(error) => {
                tracing::warn!(host, %error, "leaf issuance failed");
                return Ok(());
            }
        };
        let server_config = match build_leaf_server_config(&leaf, Arc::clone(&self.key_log)) {
            Ok(config) => config,
            Err(error) => {
                tracing::warn!(host, %error, "leaf server config build failed");
                return Ok(());
            }
        };
        let acceptor = TlsAcceptor::from(server_config);
        let client_tls = match acceptor.accept(client).await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::warn!(host, %error, "client TLS handshake failed");
                return Ok(());
            }
        };

        let session = self.recorder.new_session(host);
        tracing::debug!(host, session = session.id(), seq = session.seq(), "session started");
        self.splice_session(client_tls, upstream_tls, session).await
    }

    async fn relay_plain<S>(
        &self,
        client: PeekableStream<S>,
        host: &str,
        port: u16,
    ) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let upstream = match self.dialer.dial(host, port).await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::warn!(host, port, %error, "upstream dial failed");
                return Ok(());
            }
        };
        let session = self.recorder.new_session(host);
        self.splice_session(client, upstream, session).await
    }

    async fn splice_session<C, U>(
        &self,
        client: C,
        upstream: U,
        session: Arc<Session>,
    ) -> io::Result<()>
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
        U: AsyncRead + AsyncWrite + Send + 'static,
    {
        let inspectors = self.enable_http_parsing.then(|| {
            let slot = Arc::new(Mutex::new(None));
            let log: Arc<dyn TrafficLog> = session.clone();
            (
                InspectorContext {
                    direction: Direction::ClientToServer,
                    log: Arc::clone(&log),
                    registry: Arc::clone(&self.registry),
                    slot: Arc::clone(&slot),
                    max_head_bytes: self.max_http_head_bytes,
                },
                InspectorContext {
                    direction: Direction::ServerToClient,
                    log,
                    registry: Arc::clone(&self.registry),
                    slot,
                    max_head_bytes: self.max_http_head_bytes,
                },
            )
        });

        match splice(client, upstream, inspectors).await {
            Ok(outcome) => {
                tracing::debug!(
                    session = session.id(),
                    c2s = outcome.bytes_client_to_server,
                    s2c = outcome.bytes_server_to_client,
                    "session finished"
                );
                Ok(())
            }
            Err(error) if is_benign_disconnect(&error) => Ok(()),
            Err(error) => {
                session.log_error(&error.to_string());
                Err(error)
            }
        }
    }
}
