use std::io;
use std::sync::Arc;

use rpctap_observe::{Recorder, SubscriptionHub};
use rpctap_tls::CaStore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::connect::request_line;

const API_HEAD_LIMIT: usize = 16 * 1024;

/// Management endpoint: status and stats probes, CA download, the recent
/// records fetch for subscriber priming, and the live subscription stream.
pub(crate) struct ApiContext {
    pub recorder: Arc<Recorder>,
    pub hub: Arc<SubscriptionHub>,
    pub ca: Arc<CaStore>,
    pub recent_fetch_max: usize,
}

pub(crate) async fn run_api(listener: TcpListener, ctx: Arc<ApiContext>) -> io::Result<()> {
    loop {
        let (stream, _addr) = listener.accept().await?;
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            if let Err(error) = handle_api_connection(stream, ctx).await {
                tracing::debug!(%error, "api connection ended");
            }
        });
    }
}

async fn handle_api_connection(mut stream: TcpStream, ctx: Arc<ApiContext>) -> io::Result<()> {
    let head = read_head(&mut stream).await?;
    let Ok((method, target)) = request_line(&head) else {
        return respond(&mut stream, "400 Bad Request", "text/plain", b"bad request").await;
    };
    if method != "GET" {
        return respond(
            &mut stream,
            "405 Method Not Allowed",
            "text/plain",
            b"method not allowed",
        )
        .await;
    }

    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (target.as_str(), None),
    };

    match path {
        "/api/status" => {
            respond(
                &mut stream,
                "200 OK",
                "application/json",
                b"{\"status\":\"running\"}",
            )
            .await
        }
        "/api/stats" => {
            let body = serde_json::json!({
                "subscribers": ctx.hub.subscriber_count(),
                "records": ctx.recorder.record_count(),
                "sessions": ctx.recorder.session_count(),
                "dropped_messages": ctx.hub.dropped_message_count(),
            });
            respond(
                &mut stream,
                "200 OK",
                "application/json",
                body.to_string().as_bytes(),
            )
            .await
        }
        "/api/ca/cert" => match ctx.ca.ca_cert_pem() {
            Ok(pem) => {
                respond(&mut stream, "200 OK", "application/x-pem-file", pem.as_bytes()).await
            }
            Err(error) => {
                tracing::warn!(%error, "ca certificate read failed");
                respond(
                    &mut stream,
                    "500 Internal Server Error",
                    "text/plain",
                    b"ca unavailable",
                )
                .await
            }
        },
        "/api/records/recent" => {
            let limit = query
                .and_then(|query| query_param(query, "limit"))
                .and_then(|value| value.parse::<usize>().ok())
                .unwrap_or(ctx.recent_fetch_max)
                .min(ctx.recent_fetch_max);
            let records = ctx.recorder.recent_records(limit);
            let body = serde_json::to_vec(&records)
                .map_err(|error| io::Error::other(format!("serialize records: {error}")))?;
            respond(&mut stream, "200 OK", "application/json", &body).await
        }
        "/api/subscribe" => stream_records(stream, ctx).await,
        _ => respond(&mut stream, "404 Not Found", "text/plain", b"not found").await,
    }
}

/// Long-lived ndjson stream of newly appended records. No pings are sent;
/// disconnect is observed when the read half fails or the write errors out.
async fn stream_records(stream: TcpStream, ctx: Arc<ApiContext>) -> io::Result<()> {
    let (mut read_half, mut write_half) = stream.into_split();
    write_half
        .write_all(
            b"HTTP/1.1 200 OK\r\n\
              Content-Type: application/x-ndjson\r\n\
              Cache-Control: no-cache\r\n\
              Connection: close\r\n\r\n",
        )
        .await?;

    let mut subscriber = ctx.hub.subscribe();
    tracing::debug!(id = subscriber.id, "subscriber attached");

    let mut drain = [0_u8; 512];
    let result: io::Result<()> = loop {
        tokio::select! {
            message = subscriber.receiver.recv() => {
                let Some(message) = message else {
                    break Ok(());
                };
                if let Err(error) = write_half.write_all(message.as_bytes()).await {
                    break Err(error);
                }
                if let Err(error) = write_half.write_all(b"\n").await {
                    break Err(error);
                }
            }
            read = read_half.read(&mut drain) => {
                match read {
                    Ok(0) | Err(_) => break Ok(()),
                    Ok(_) => {}
                }
            }
        }
    };

    ctx.hub.unsubscribe(subscriber.id);
    tracing::debug!(id = subscriber.id, "subscriber detached");
    result
}

async fn read_head(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut head = Vec::with_capacity(256);
    let mut byte = [0_u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let read = stream.read(&mut byte).await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "client closed before request head completed",
            ));
        }
        head.push(byte[0]);
        if head.len() > API_HEAD_LIMIT {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "request head exceeded limit",
            ));
        }
    }
    Ok(head)
}

async fn respond(
    stream: &mut TcpStream,
    status: &str,
    content_type: &str,
    body: &[u8],
) -> io::Result<()> {
    let head = format!(
        "HTTP/1.1 {status}\r\n\
         Content-Type: {content_type}\r\n\
         Content-Length: {}\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Connection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.shutdown().await
}

fn query_param<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then_some(value)
    })
}

#[cfg(test)]
mod tests {
    use super::query_param;

    #[test]
    fn query_param_finds_named_value() {
        assert_eq!(query_param("limit=200&foo=bar", "limit"), Some("200"));
        assert_eq!(query_param("foo=bar", "limit"), None);
        assert_eq!(query_param("", "limit"), None);
    }
}
