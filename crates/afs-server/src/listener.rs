//! Newline-delimited JSON over TCP.
//!
//! Each connection is served by its own task. Requests on one connection
//! are answered in order, one at a time.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};

use crate::constants::SWEEP_INTERVAL;
use crate::rpc::ApiServer;

/// Accept connections until `shutdown` resolves.
pub async fn serve(
    api: Arc<ApiServer>,
    listener: TcpListener,
    shutdown: impl Future<Output = ()>,
) -> io::Result<()> {
    let max_line = api.config().max_request_bytes;
    let sweeper = {
        let api = Arc::clone(&api);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                api.sweep(Instant::now());
            }
        })
    };

    info!(addr = %listener.local_addr()?, "listening");
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutting down");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let api = Arc::clone(&api);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(api, stream, peer, max_line).await {
                        debug!(%peer, error = %e, "connection closed with error");
                    }
                });
            }
        }
    }

    sweeper.abort();
    Ok(())
}

async fn handle_connection(
    api: Arc<ApiServer>,
    stream: TcpStream,
    peer: SocketAddr,
    max_line: usize,
) -> Result<(), LinesCodecError> {
    debug!(%peer, "connection opened");
    let mut lines = Framed::new(stream, LinesCodec::new_with_max_length(max_line));
    while let Some(line) = lines.next().await {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let reply = api.handle_line(&line).await;
        lines.send(reply).await?;
    }
    debug!(%peer, "connection closed");
    Ok(())
}
