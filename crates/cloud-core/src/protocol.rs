//! RPC envelope and wire framing (C5). `cloud-rpc` builds the dispatcher
//! on top of these wire types; this module only defines the envelope
//! shape and the length-prefixed frame codec, so it has no tokio I/O
//! dependency beyond `AsyncRead`/`AsyncWrite`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{CloudError, Result};

/// Maximum frame size accepted on the wire: 1 MiB, matching the envelope
/// sizes seen in practice and bounding a single bad frame's memory cost.
pub const MAX_FRAME_BYTES: u32 = 1024 * 1024;

/// Request/response addressing context threaded through every verb
/// handler and RPC call (propagates
/// `{request_id, user_id, project_id, is_admin, roles,
/// remote_address, read_deleted_flag}`").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    pub request_id: String,
    pub user_id: String,
    pub project_id: String,
    pub is_admin: bool,
    pub roles: Vec<String>,
    pub remote_address: Option<String>,
    pub read_deleted: bool,
}

/// A destination for `cast`/`call`: either a fan-out `topic` consumed by
/// any worker, or a direct `topic.host` address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Destination {
    Topic(String),
    TopicHost(String, String),
}

impl Destination {
    pub fn topic(&self) -> &str {
        match self {
            Destination::Topic(t) => t,
            Destination::TopicHost(t, _) => t,
        }
    }

    /// Parses the wire form `topic` or `topic.host`.
    pub fn parse(s: &str) -> Self {
        match s.split_once('.') {
            Some((topic, host)) => Destination::TopicHost(topic.to_string(), host.to_string()),
            None => Destination::Topic(s.to_string()),
        }
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Destination::Topic(t) => write!(f, "{}", t),
            Destination::TopicHost(t, h) => write!(f, "{}.{}", t, h),
        }
    }
}

/// The message sent over `cast`/`call`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub method: String,
    pub args: HashMap<String, serde_json::Value>,
    /// Present on `call`, absent on `cast`.
    pub msg_id: Option<String>,
    pub reply_to: Option<String>,
    pub context: RequestContext,
}

/// A worker's reply to a `call`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub msg_id: String,
    pub result: std::result::Result<serde_json::Value, String>,
}

/// Writes a length-prefixed JSON frame: a 4-byte big-endian length
/// followed by that many bytes of JSON.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = serde_json::to_vec(value)
        .map_err(|e| CloudError::Internal(format!("failed to serialize frame: {e}")))?;
    if bytes.len() as u64 > MAX_FRAME_BYTES as u64 {
        return Err(CloudError::Internal(format!(
            "frame too large: {} bytes (max {})",
            bytes.len(),
            MAX_FRAME_BYTES
        )));
    }
    writer
        .write_all(&(bytes.len() as u32).to_be_bytes())
        .await
        .map_err(|e| CloudError::Internal(format!("frame write failed: {e}")))?;
    writer
        .write_all(&bytes)
        .await
        .map_err(|e| CloudError::Internal(format!("frame write failed: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| CloudError::Internal(format!("frame flush failed: {e}")))?;
    Ok(())
}

/// Reads one length-prefixed JSON frame, rejecting frames over
/// `MAX_FRAME_BYTES`.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| CloudError::Internal(format!("frame read failed: {e}")))?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(CloudError::Internal(format!(
            "frame too large: {} bytes (max {})",
            len, MAX_FRAME_BYTES
        )));
    }
    let mut buf = vec![0u8; len as usize];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| CloudError::Internal(format!("frame read failed: {e}")))?;
    serde_json::from_slice(&buf).map_err(|e| CloudError::Internal(format!("frame decode failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RequestContext {
        RequestContext {
            request_id: "req-1".into(),
            user_id: "bob".into(),
            project_id: "acme".into(),
            is_admin: false,
            roles: vec!["developer".into()],
            remote_address: Some("10.0.0.1".into()),
            read_deleted: false,
        }
    }

    #[tokio::test]
    async fn envelope_round_trips_over_frame() {
        let env = Envelope {
            method: "run_instance".into(),
            args: HashMap::from([("instance_id".to_string(), serde_json::json!("i-1"))]),
            msg_id: Some("m-1".into()),
            reply_to: Some("reply.host1".into()),
            context: ctx(),
        };

        let mut buf = Vec::new();
        write_frame(&mut buf, &env).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let decoded: Envelope = read_frame(&mut cursor).await.unwrap();
        assert_eq!(decoded.method, "run_instance");
        assert_eq!(decoded.msg_id, Some("m-1".into()));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_on_read() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_BYTES + 1).to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        let result: Result<Envelope> = read_frame(&mut cursor).await;
        assert!(result.is_err());
    }

    #[test]
    fn destination_parses_topic_and_topic_host() {
        assert_eq!(Destination::parse("compute"), Destination::Topic("compute".into()));
        assert_eq!(
            Destination::parse("compute.host1"),
            Destination::TopicHost("compute".into(), "host1".into())
        );
    }

    #[test]
    fn destination_display_round_trips() {
        assert_eq!(Destination::parse("volume.hostA").to_string(), "volume.hostA");
        assert_eq!(Destination::parse("scheduler").to_string(), "scheduler");
    }
}
