// contrametrics/src/server.rs
//
// Query API — the pull-style transport in front of the facade.
//
// Dashboards (or the detection pipeline, for appends) connect over TCP and
// exchange length-prefixed JSON frames:
//
//   [4 bytes little-endian length] [JSON payload]
//
// Requests:
//   { "op": "query",  "period": "30d", "query": "leaderboard", "topN": 5 }
//   { "op": "append", "timestamp": "...", "category": "Political", "source": "politics", "accuracyScore": 0.9 }
//
// Responses:
//   { "ok": true,  "result": { "type": "leaderboard", "entries": [...] } }
//   { "ok": true,  "eventId": "..." }
//   { "ok": false, "error": "unknown_period", "message": "..." }
//
// A bad frame or a typed error only affects that request / connection.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::analytics::Analytics;
use crate::engine::{AggregateResult, QueryRequest};
use crate::events::EventSubmission;

pub const MAX_FRAME: usize = 1_048_576;

// ── Wire protocol ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Query(QueryRequest),
    Append(EventSubmission),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub ok:       bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result:   Option<AggregateResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error:    Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message:  Option<String>,
}

impl Response {
    fn result(r: AggregateResult) -> Self {
        Self { ok: true, result: Some(r), ..Default::default() }
    }

    fn accepted(id: String) -> Self {
        Self { ok: true, event_id: Some(id), ..Default::default() }
    }

    fn failure(kind: &str, message: impl ToString) -> Self {
        Self {
            ok:      false,
            error:   Some(kind.to_string()),
            message: Some(message.to_string()),
            ..Default::default()
        }
    }
}

// ── Server ────────────────────────────────────────────────────────────────────

pub struct QueryServer {
    analytics: Arc<Analytics>,
    listener:  TcpListener,
}

impl QueryServer {
    pub async fn bind(analytics: Arc<Analytics>, addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { analytics, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn serve(self) -> Result<()> {
        info!("Query API listening on {}", self.local_addr()?);
        loop {
            let (stream, peer) = self.listener.accept().await?;
            let analytics = Arc::clone(&self.analytics);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(&analytics, stream).await {
                    warn!("Query API connection error from {}: {}", peer, e);
                }
            });
        }
    }
}

async fn handle_connection(analytics: &Analytics, mut stream: TcpStream) -> Result<()> {
    while let Some(body) = read_frame(&mut stream).await? {
        let resp = match serde_json::from_slice::<Request>(&body) {
            Ok(req) => handle(analytics, req).await,
            Err(e)  => Response::failure("bad_request", e),
        };
        write_frame(&mut stream, &serde_json::to_vec(&resp)?).await?;
    }
    Ok(())
}

pub async fn handle(analytics: &Analytics, req: Request) -> Response {
    match req {
        Request::Query(q) => match analytics.query(&q) {
            Ok(r)  => Response::result(r),
            Err(e) => {
                debug!("Query rejected: {}", e);
                Response::failure(e.kind(), e)
            }
        },
        Request::Append(sub) => match analytics.submit(sub).await {
            Ok(ev) => Response::accepted(ev.id),
            Err(e) => Response::failure(e.kind(), e),
        },
    }
}

// ── Framing ───────────────────────────────────────────────────────────────────

/// Read one frame. `None` on clean EOF before a length prefix.
pub async fn read_frame(stream: &mut TcpStream) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME { anyhow::bail!("frame too large: {} bytes", len); }

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(Some(body))
}

pub async fn write_frame(stream: &mut TcpStream, body: &[u8]) -> Result<()> {
    if body.len() > MAX_FRAME { anyhow::bail!("frame too large: {} bytes", body.len()); }
    stream.write_all(&(body.len() as u32).to_le_bytes()).await?;
    stream.write_all(body).await?;
    Ok(())
}

/// One request/response round trip on an open connection.
pub async fn call(stream: &mut TcpStream, req: &Request) -> Result<Response> {
    write_frame(stream, &serde_json::to_vec(req)?).await?;
    let body = read_frame(stream).await?
        .ok_or_else(|| anyhow::anyhow!("connection closed before response"))?;
    Ok(serde_json::from_slice(&body)?)
}
