//! Line-delimited JSON feed for remote subscribers
//!
//! Every connection receives each lifecycle event as one JSON line and may
//! send queries, also one JSON object per line:
//!
//! ```text
//! -> {"event":"getAll"}
//! <- {"event":"getAll","data":[{...document...}]}
//! <- {"event":"created","data":{"document":{...},"resync":false}}
//! ```

use crate::config::WatchedSource;
use crate::document::Document;
use crate::monitor::ResilientWatcher;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

/// Query sent by a subscriber
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event")]
pub enum FeedRequest {
    #[serde(rename = "getAll")]
    GetAll,
    #[serde(rename = "getPrinter")]
    GetPrinter,
}

/// Reply to a [`FeedRequest`]
#[derive(Debug, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum FeedReply<'a> {
    #[serde(rename = "getAll")]
    GetAll(Vec<Document>),
    #[serde(rename = "getPrinter")]
    GetPrinter(&'a [WatchedSource]),
    #[serde(rename = "error")]
    Error { message: String },
}

pub struct FeedServer {
    listener: TcpListener,
    watcher: Arc<ResilientWatcher>,
}

impl FeedServer {
    /// Bind the listener; port 0 picks a free port
    pub async fn bind(addr: SocketAddr, watcher: Arc<ResilientWatcher>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind feed to {addr}"))?;
        Ok(Self { listener, watcher })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept subscribers until the task is dropped
    pub async fn serve(self) -> Result<()> {
        info!("Feed listening on {}", self.local_addr()?);

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept feed connection: {}", e);
                    continue;
                }
            };
            debug!("Feed subscriber connected from {}", peer);

            let watcher = Arc::clone(&self.watcher);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, watcher).await {
                    error!("Feed connection {} failed: {}", peer, e);
                }
                debug!("Feed subscriber {} disconnected", peer);
            });
        }
    }
}

async fn handle_connection(stream: TcpStream, watcher: Arc<ResilientWatcher>) -> Result<()> {
    let mut events = watcher.subscribe();
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    return Ok(());
                };
                if line.trim().is_empty() {
                    continue;
                }
                let reply = answer(&line, &watcher);
                write_line(&mut writer, &reply).await?;
            }
            event = events.recv() => match event {
                Ok(event) => write_line(&mut writer, &event).await?,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Feed subscriber lagging, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}

fn answer<'a>(line: &str, watcher: &'a ResilientWatcher) -> FeedReply<'a> {
    match serde_json::from_str::<FeedRequest>(line) {
        Ok(FeedRequest::GetAll) => FeedReply::GetAll(watcher.get_all_fax()),
        Ok(FeedRequest::GetPrinter) => FeedReply::GetPrinter(watcher.sources()),
        Err(e) => {
            debug!("Rejected feed request {:?}: {}", line, e);
            FeedReply::Error { message: format!("unsupported request: {e}") }
        }
    }
}

async fn write_line<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let json = serde_json::to_string(message)? + "\n";
    writer.write_all(json.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
