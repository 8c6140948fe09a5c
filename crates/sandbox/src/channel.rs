//! Line-delimited streaming command channel.
//!
//! The companion server inside the sandbox accepts a raw command string
//! over TCP and replies with newline-delimited JSON frames: zero or
//! more `chunk` frames followed by exactly one `final` frame. A
//! [`CommandChannel`] opens a fresh connection per call; there is no
//! connection reuse and no built-in timeout — callers bound the overall
//! operation themselves (the readiness probe does, for example).

use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Socket read buffer size.
const READ_BUFFER_SIZE: usize = 4096;

/// Sentinel status returned when the peer closes the connection before
/// sending a `final` frame.
pub const STATUS_CONNECTION_CLOSED: i32 = -1;

/// One frame from the companion server.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Partial output, streamed while the command runs.
    Chunk { data: String },
    /// Terminal frame carrying the exit status and collected result.
    Final { status: i32, result: String },
}

/// Final outcome of one command exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub status: i32,
    pub result: String,
}

/// Errors on the command channel.
///
/// Protocol noise (malformed frames) is *not* an error — such lines are
/// logged and skipped. Only transport failures surface here.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("failed to connect to command server at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command channel I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-call TCP client for the companion command server.
#[derive(Debug, Clone)]
pub struct CommandChannel {
    host: String,
    port: u16,
}

impl CommandChannel {
    /// Channel to the sandbox's host-mapped port on localhost.
    pub fn new(port: u16) -> Self {
        Self::with_host("127.0.0.1", port)
    }

    pub fn with_host(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Run a command, discarding streamed chunks.
    pub async fn run(&self, command: &str) -> Result<CommandOutcome, ChannelError> {
        self.run_streaming(command, |_| {}).await
    }

    /// Run a command, invoking `on_chunk` for each streamed `chunk`
    /// frame in arrival order.
    ///
    /// Frames may be split across arbitrary TCP segment boundaries;
    /// bytes are buffered until a full `\n`-terminated line is
    /// available. Malformed lines are logged and skipped. If the peer
    /// closes the connection without a `final` frame, the call returns
    /// a [`STATUS_CONNECTION_CLOSED`] outcome rather than an error.
    pub async fn run_streaming(
        &self,
        command: &str,
        mut on_chunk: impl FnMut(&str),
    ) -> Result<CommandOutcome, ChannelError> {
        let addr = format!("{}:{}", self.host, self.port);
        let mut stream = TcpStream::connect(&addr)
            .await
            .map_err(|source| ChannelError::Connect {
                addr: addr.clone(),
                source,
            })?;

        stream.write_all(command.as_bytes()).await?;

        let mut pending: Vec<u8> = Vec::new();
        let mut buf = [0u8; READ_BUFFER_SIZE];

        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            pending.extend_from_slice(&buf[..n]);

            while let Some(newline) = pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = pending.drain(..=newline).collect();
                let line = String::from_utf8_lossy(&line[..line.len() - 1]);
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                match serde_json::from_str::<ServerMessage>(line) {
                    Ok(ServerMessage::Chunk { data }) => on_chunk(&data),
                    Ok(ServerMessage::Final { status, result }) => {
                        return Ok(CommandOutcome { status, result });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, line, "Skipping malformed frame");
                    }
                }
            }
        }

        tracing::warn!(addr = %addr, "Connection closed without a final frame");
        Ok(CommandOutcome {
            status: STATUS_CONNECTION_CLOSED,
            result: "connection closed without a final response".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::time::Duration;
    use tokio::net::TcpListener;

    /// Spawn a one-shot stub server that reads the incoming command and
    /// then writes `segments` with a small delay between each, forcing
    /// the client to observe arbitrary frame splits.
    async fn stub_server(segments: Vec<&'static [u8]>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut cmd = [0u8; 64];
            let _ = socket.read(&mut cmd).await.unwrap();
            for segment in segments {
                socket.write_all(segment).await.unwrap();
                socket.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            // Socket drops here, closing the connection.
        });
        port
    }

    #[tokio::test]
    async fn chunks_then_final_split_across_segments() {
        let port = stub_server(vec![
            br#"{"type":"chunk","da"#,
            br#"ta":"one"}"#,
            b"\n",
            br#"{"type":"chunk","data":"two"}"#,
            b"\n{\"type\":\"final\",",
            br#""status":0,"result":"R"}"#,
            b"\n",
        ])
        .await;

        let mut chunks = Vec::new();
        let outcome = CommandChannel::new(port)
            .run_streaming("ls", |c| chunks.push(c.to_string()))
            .await
            .unwrap();

        assert_eq!(chunks, vec!["one", "two"]);
        assert_eq!(
            outcome,
            CommandOutcome {
                status: 0,
                result: "R".into()
            }
        );
    }

    #[tokio::test]
    async fn two_frames_in_one_segment() {
        let port = stub_server(vec![
            b"{\"type\":\"chunk\",\"data\":\"a\"}\n{\"type\":\"final\",\"status\":7,\"result\":\"done\"}\n",
        ])
        .await;

        let mut chunks = 0;
        let outcome = CommandChannel::new(port)
            .run_streaming("ps aux", |_| chunks += 1)
            .await
            .unwrap();

        assert_eq!(chunks, 1);
        assert_eq!(outcome.status, 7);
        assert_eq!(outcome.result, "done");
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let port = stub_server(vec![
            b"this is not json\n",
            b"{\"type\":\"mystery\"}\n",
            b"{\"type\":\"final\",\"status\":0,\"result\":\"ok\"}\n",
        ])
        .await;

        let outcome = CommandChannel::new(port).run("echo hi").await.unwrap();
        assert_eq!(outcome.status, 0);
        assert_eq!(outcome.result, "ok");
    }

    #[tokio::test]
    async fn close_without_final_returns_sentinel() {
        let port = stub_server(vec![b"{\"type\":\"chunk\",\"data\":\"partial\"}\n"]).await;

        let outcome = CommandChannel::new(port).run("whoami").await.unwrap();
        assert_eq!(outcome.status, STATUS_CONNECTION_CLOSED);
        assert!(outcome.result.contains("without a final response"));
    }

    #[tokio::test]
    async fn unreachable_server_is_a_connect_error() {
        // Grab a port that is definitely free, then release it.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = CommandChannel::new(port).run("ls").await.unwrap_err();
        assert_matches!(err, ChannelError::Connect { .. });
    }
}
