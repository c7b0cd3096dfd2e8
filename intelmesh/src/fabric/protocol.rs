// intelmesh/src/fabric/protocol.rs
//
// Event-channel wire protocol: length-prefixed JSON frames over TCP.
//
// Frame format:
//   [4 bytes little-endian length] [JSON payload]
//
// Any framed transport satisfies the exchange semantics; this framing keeps
// agents trivial to write in any language without a schema compiler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::events::{Ioc, IocPayload, IocStatus};

pub const MAX_FRAME: usize = 1_048_576;

// ── Frames ────────────────────────────────────────────────────────────────────

/// Agent → coordinator events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientFrame {
    Register {
        client_id: String,
        hostname:  String,
        version:   String,
    },
    Heartbeat {
        client_id: String,
        at:        DateTime<Utc>,
    },
    ReportThreat {
        client_id: String,
        ioc:       IocPayload,
    },
    SyncRequest {
        client_id: String,
        cursor:    i64,
    },
    Disconnect {
        client_id: String,
    },
}

/// Coordinator → agent events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerFrame {
    ReportAck {
        ioc_id: String,
        status: IocStatus,
    },
    ReportNack {
        reason: String,
    },
    IocVerified {
        ioc: Ioc,
    },
    ClientStatus {
        client_id: String,
        online:    bool,
        trust:     f64,
    },
    SyncResponse {
        iocs:   Vec<Ioc>,
        cursor: i64,
    },
}

impl ServerFrame {
    /// Frames the overflow policy may discard. Verified intelligence and
    /// direct replies are never dropped silently.
    pub fn droppable(&self) -> bool {
        matches!(self, Self::ClientStatus { .. })
    }
}

// ── Frame IO ──────────────────────────────────────────────────────────────────

pub async fn read_frame<R, T>(reader: &mut R) -> anyhow::Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: serde::de::DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME {
        anyhow::bail!("frame too large: {} bytes", len);
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}

pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(frame)?;
    writer.write_all(&(body.len() as u32).to_le_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_round_trip_through_a_duplex_pipe() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let frame = ClientFrame::Heartbeat { client_id: "agent-1".into(), at: Utc::now() };
        write_frame(&mut a, &frame).await.unwrap();
        let got: Option<ClientFrame> = read_frame(&mut b).await.unwrap();
        match got {
            Some(ClientFrame::Heartbeat { client_id, .. }) => assert_eq!(client_id, "agent-1"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn eof_reads_as_none() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        let got: Option<ClientFrame> = read_frame(&mut b).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn oversized_frame_is_refused() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let len = (MAX_FRAME as u32 + 1).to_le_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut a, &len).await.unwrap();
        let got: anyhow::Result<Option<ClientFrame>> = read_frame(&mut b).await;
        assert!(got.is_err());
    }

    #[test]
    fn wire_tags_are_snake_case_events() {
        let json = serde_json::to_value(ServerFrame::ReportAck {
            ioc_id: "abc".into(),
            status: IocStatus::Pending,
        })
        .unwrap();
        assert_eq!(json["event"], "report_ack");
        assert_eq!(json["status"], "pending");
    }
}
