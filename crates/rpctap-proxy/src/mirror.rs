use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::inspect::{run_inspector, InspectorContext};

const IO_CHUNK_SIZE: usize = 8 * 1024;
pub(crate) const MIRROR_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SpliceOutcome {
    pub bytes_client_to_server: u64,
    pub bytes_server_to_client: u64,
}

/// Splices two streams while duplicating each direction into its inspector.
/// The forward copy is the only loop that touches the sockets; inspectors
/// consume a bounded side channel and can lag or die without slowing it.
pub(crate) async fn splice<C, S>(
    client: C,
    server: S,
    inspectors: Option<(InspectorContext, InspectorContext)>,
) -> io::Result<SpliceOutcome>
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (server_read, server_write) = tokio::io::split(server);

    let (c2s_tap, s2c_tap, inspector_tasks) = match inspectors {
        Some((c2s_ctx, s2c_ctx)) => {
            let (c2s_tx, c2s_rx) = mpsc::channel(MIRROR_CHANNEL_CAPACITY);
            let (s2c_tx, s2c_rx) = mpsc::channel(MIRROR_CHANNEL_CAPACITY);
            let c2s_task = tokio::spawn(run_inspector(c2s_rx, c2s_ctx));
            let s2c_task = tokio::spawn(run_inspector(s2c_rx, s2c_ctx));
            (Some(c2s_tx), Some(s2c_tx), vec![c2s_task, s2c_task])
        }
        None => (None, None, Vec::new()),
    };

    let dropped_c2s = Arc::new(AtomicU64::new(0));
    let dropped_s2c = Arc::new(AtomicU64::new(0));

    let (c2s_result, s2c_result) = tokio::join!(
        pump(client_read, server_write, c2s_tap, Arc::clone(&dropped_c2s)),
        pump(server_read, client_write, s2c_tap, Arc::clone(&dropped_s2c)),
    );

    for task in inspector_tasks {
        let _ = task.await;
    }

    Ok(SpliceOutcome {
        bytes_client_to_server: c2s_result?,
        bytes_server_to_client: s2c_result?,
    })
}

/// One forwarding direction. The tap is offered each chunk with `try_send`;
/// when the inspector lags the chunk is counted as dropped and forwarding
/// carries on untouched. Source EOF half-closes the destination.
async fn pump<R, W>(
    mut src: R,
    mut dst: W,
    mut tap: Option<mpsc::Sender<MirrorChunk>>,
    dropped: Arc<AtomicU64>,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0_u64;
    let mut chunk = [0_u8; IO_CHUNK_SIZE];

    let outcome = loop {
        let read = match src.read(&mut chunk).await {
            Ok(0) => break Ok(()),
            Ok(read) => read,
            Err(error) if is_benign_disconnect(&error) => break Ok(()),
            Err(error) => break Err(error),
        };

        if let Err(error) = dst.write_all(&chunk[..read]).await {
            if is_benign_disconnect(&error) {
                break Ok(());
            }
            break Err(error);
        }
        total += read as u64;

        if let Some(sender) = &tap {
            let gap = dropped.load(Ordering::Relaxed);
            let message = MirrorChunk {
                data: Bytes::copy_from_slice(&chunk[..read]),
                preceded_by_gap: gap,
            };
            match sender.try_send(message) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    dropped.fetch_add(read as u64, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tap = None;
                }
            }
        }
    };

    drop(tap);
    let _ = dst.shutdown().await;
    outcome.map(|()| total)
}

/// A mirrored chunk plus the number of bytes dropped before it; nonzero
/// means framing is no longer trustworthy.
#[derive(Debug, Clone)]
pub(crate) struct MirrorChunk {
    pub data: Bytes,
    pub preceded_by_gap: u64,
}

pub(crate) fn is_benign_disconnect(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}
