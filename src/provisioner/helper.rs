//! Line-JSON client to the `atex-virt-helper` process.
//!
//! One request at a time: a request is one JSON object plus `\n` on the
//! helper's stdin, the response is one JSON line from its stdout, and the
//! reply to a request must be read by the same critical section that wrote
//! it, so callers keep the channel behind a mutex. The channel itself never
//! retries; reservation policy decides what a failure means.

use std::collections::BTreeMap;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::Child;
use tracing::debug;

use crate::connection::Connection;
use crate::util::LineReader;

/// Replies can carry whole `virsh dumpxml` outputs; size the line buffer
/// accordingly.
const REPLY_MAX_LEN: usize = 1 << 20;

/// Requests understood by the helper, one JSON object per line.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum HelperRequest {
    Ping,
    /// Label this client's reservations (≤ 15 chars, per PR_SET_NAME).
    Setname { name: String },
    Reservations,
    Reserve {
        #[serde(skip_serializing_if = "Option::is_none")]
        filter: Option<String>,
    },
    Release { domain: String },
    Virsh { args: Vec<String> },
    #[serde(rename = "vol-copy")]
    VolCopy {
        pool: String,
        from: String,
        to_domain: String,
    },
}

/// Shape shared by all helper replies; unknown keys are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct HelperReply {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub cmd: Option<String>,
    #[serde(default)]
    pub reply: Option<Value>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub domains: Option<BTreeMap<String, String>>,
}

impl HelperReply {
    /// The `reply` field as a string, empty when absent or non-string.
    pub fn reply_str(&self) -> &str {
        match &self.reply {
            Some(Value::String(s)) => s,
            _ => "",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HelperError {
    /// Observed via poll before a send; reservations are already freed.
    #[error("helper not running, exited with {0}")]
    Exited(String),

    /// The helper's stdout returned an empty line / EOF.
    #[error("empty response from helper")]
    ChannelClosed,

    #[error("bad reply from helper: {0}")]
    BadReply(String),

    #[error("helper I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The request/response channel to one helper process.
pub struct HelperChannel {
    child: Option<Child>,
    stdin: Box<dyn AsyncWrite + Send + Unpin>,
    reader: LineReader<Box<dyn AsyncRead + Send + Unpin>>,
}

impl HelperChannel {
    /// Spawns `helper_command` over `conn` and wires up its stdio.
    pub fn spawn(conn: &dyn Connection, helper_command: &[&str]) -> Result<Self, HelperError> {
        let mut child = conn
            .spawn(helper_command, Stdio::piped(), Stdio::piped(), Stdio::inherit())
            .map_err(|e| HelperError::BadReply(format!("failed to spawn helper: {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| HelperError::BadReply("helper stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HelperError::BadReply("helper stdout not captured".into()))?;
        Ok(Self::from_parts(Some(child), Box::new(stdin), Box::new(stdout)))
    }

    /// Builds a channel over arbitrary streams; used by transports that are
    /// not child processes, and by tests with in-memory peers.
    pub fn from_streams(
        writer: impl AsyncWrite + Send + Unpin + 'static,
        reader: impl AsyncRead + Send + Unpin + 'static,
    ) -> Self {
        Self::from_parts(None, Box::new(writer), Box::new(reader))
    }

    fn from_parts(
        child: Option<Child>,
        stdin: Box<dyn AsyncWrite + Send + Unpin>,
        stdout: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Self {
        Self {
            child,
            stdin,
            reader: LineReader::with_limits(stdout, REPLY_MAX_LEN, 4096),
        }
    }

    /// Exit status of the helper process, if it has exited.
    pub fn poll_exit(&mut self) -> Option<String> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => Some(format!("unknown ({e})")),
        }
    }

    /// Sends one request and reads its reply.
    pub async fn request(&mut self, request: &HelperRequest) -> Result<HelperReply, HelperError> {
        if let Some(status) = self.poll_exit() {
            return Err(HelperError::Exited(status));
        }

        let mut line = serde_json::to_vec(request).expect("request serialization is infallible");
        line.push(b'\n');
        debug!(request = %String::from_utf8_lossy(&line).trim_end(), "helper request");
        if let Err(err) = async {
            self.stdin.write_all(&line).await?;
            self.stdin.flush().await
        }
        .await
        {
            // EPIPE from a helper that died between poll and write
            return match self.poll_exit() {
                Some(status) => Err(HelperError::Exited(status)),
                None => Err(HelperError::Io(err)),
            };
        }

        let raw = self
            .reader
            .read_line()
            .await
            .map_err(|e| HelperError::BadReply(e.to_string()))?
            .ok_or(HelperError::ChannelClosed)?;
        if raw.is_empty() {
            return Err(HelperError::ChannelClosed);
        }
        debug!(reply = %String::from_utf8_lossy(&raw), "helper reply");
        serde_json::from_slice(&raw)
            .map_err(|e| HelperError::BadReply(format!("{e}: {}", String::from_utf8_lossy(&raw))))
    }

    /// Terminates the helper process. For the shared-virt helper this is
    /// the global release path: it frees every reservation when its stdin
    /// closes, without relying on a possibly-corrupt stdio channel.
    pub async fn terminate(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};

    /// Scripted helper peer: answers each incoming line with the next
    /// canned reply, recording what it received.
    fn scripted_helper(
        replies: Vec<&'static str>,
    ) -> (HelperChannel, tokio::task::JoinHandle<Vec<String>>) {
        let (client_w, helper_r) = tokio::io::duplex(4096);
        let (helper_w, client_r) = tokio::io::duplex(4096);

        let peer = tokio::spawn(async move {
            let mut received = Vec::new();
            let mut lines = BufReader::new(helper_r).lines();
            let mut helper_w = helper_w;
            for reply in replies {
                match lines.next_line().await.unwrap() {
                    Some(line) => received.push(line),
                    None => break,
                }
                helper_w
                    .write_all(format!("{reply}\n").as_bytes())
                    .await
                    .unwrap();
            }
            received
        });

        (HelperChannel::from_streams(client_w, client_r), peer)
    }

    #[tokio::test]
    async fn request_and_reply_round_trip() {
        let (mut channel, peer) = scripted_helper(vec![
            r#"{"cmd": "ping", "reply": "atex-virt-helper v1 pong", "success": true}"#,
            r#"{"success": true, "domain": "auto-03", "ignored-key": 1}"#,
        ]);

        let pong = channel.request(&HelperRequest::Ping).await.unwrap();
        assert_eq!(pong.cmd.as_deref(), Some("ping"));
        assert_eq!(pong.reply_str(), "atex-virt-helper v1 pong");

        let reserved = channel
            .request(&HelperRequest::Reserve {
                filter: Some("auto-.*".into()),
            })
            .await
            .unwrap();
        assert!(reserved.success);
        assert_eq!(reserved.domain.as_deref(), Some("auto-03"));

        drop(channel);
        let received = peer.await.unwrap();
        assert_eq!(received[0], r#"{"cmd":"ping"}"#);
        assert_eq!(received[1], r#"{"cmd":"reserve","filter":"auto-.*"}"#);
    }

    #[tokio::test]
    async fn vol_copy_wire_format() {
        let (mut channel, peer) =
            scripted_helper(vec![r#"{"success": true, "reply": "copied"}"#]);
        channel
            .request(&HelperRequest::VolCopy {
                pool: "default".into(),
                from: "base.qcow2".into(),
                to_domain: "auto-01".into(),
            })
            .await
            .unwrap();
        drop(channel);
        let received = peer.await.unwrap();
        assert_eq!(
            received[0],
            r#"{"cmd":"vol-copy","pool":"default","from":"base.qcow2","to_domain":"auto-01"}"#
        );
    }

    #[tokio::test]
    async fn closed_peer_means_channel_closed() {
        let (client_w, _helper_r) = tokio::io::duplex(64);
        let (helper_w, client_r) = tokio::io::duplex(64);
        drop(helper_w);

        let mut channel = HelperChannel::from_streams(client_w, client_r);
        match channel.request(&HelperRequest::Reservations).await {
            Err(HelperError::ChannelClosed) => {}
            other => panic!("expected ChannelClosed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn garbage_reply_is_bad_reply() {
        let (mut channel, _peer) = scripted_helper(vec!["not json at all"]);
        match channel.request(&HelperRequest::Ping).await {
            Err(HelperError::BadReply(msg)) => assert!(msg.contains("not json")),
            other => panic!("expected BadReply, got {other:?}"),
        }
    }
}
