//! CLI control socket
//!
//! A UNIX stream socket accepting one command per connection and answering
//! with a single JSON document `{"retcode": n, "msg": "..."}`. Both
//! processes serve the same protocol; commands are forwarded to the main
//! loop over a channel, so the socket task never touches engine state
//! itself.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

/// A control command received on the socket.
#[derive(Debug, Clone)]
pub enum CtlRequest {
    Status,
    Pause,
    Resume,
    /// Re-run an initsync sequence.
    Reinit,
    FlushErrorQueue,
    Inspect { entity: String, pkey: String },
    Quit,
}

impl CtlRequest {
    /// Parse one command line.
    pub fn parse(line: &str) -> Result<CtlRequest, String> {
        let mut words = line.split_whitespace();
        match words.next() {
            Some("status") => Ok(CtlRequest::Status),
            Some("pause") => Ok(CtlRequest::Pause),
            Some("resume") => Ok(CtlRequest::Resume),
            Some("reinit") => Ok(CtlRequest::Reinit),
            Some("flush-errorqueue") => Ok(CtlRequest::FlushErrorQueue),
            Some("inspect") => {
                let entity = words.next().ok_or("usage: inspect <type> <pkey>")?;
                let pkey = words.next().ok_or("usage: inspect <type> <pkey>")?;
                Ok(CtlRequest::Inspect {
                    entity: entity.to_string(),
                    pkey: pkey.to_string(),
                })
            }
            Some("quit") => Ok(CtlRequest::Quit),
            Some(other) => Err(format!("unknown command '{other}'")),
            None => Err("empty command".to_string()),
        }
    }
}

/// Reply sent back on the socket. Retcode 0 is success, 1 transient
/// failure, 2 fatal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CtlResponse {
    pub retcode: i32,
    pub msg: String,
}

impl CtlResponse {
    pub fn ok(msg: impl Into<String>) -> CtlResponse {
        CtlResponse {
            retcode: 0,
            msg: msg.into(),
        }
    }

    pub fn error(msg: impl Into<String>) -> CtlResponse {
        CtlResponse {
            retcode: 1,
            msg: msg.into(),
        }
    }
}

/// Commands travel to the main loop with their reply slot.
pub type CtlChannel = mpsc::Sender<(CtlRequest, oneshot::Sender<CtlResponse>)>;

/// Bind the socket and serve until the process exits.
pub async fn serve(path: PathBuf, channel: CtlChannel) -> std::io::Result<()> {
    // A previous unclean shutdown may have left the socket file behind.
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path)?;
    info!(path = %path.display(), "control socket listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let channel = channel.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, channel).await {
                warn!(error = %e, "control connection failed");
            }
        });
    }
}

async fn handle_connection(stream: UnixStream, channel: CtlChannel) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut line = String::new();
    BufReader::new(read_half).read_line(&mut line).await?;

    let response = match CtlRequest::parse(line.trim()) {
        Err(message) => CtlResponse::error(message),
        Ok(request) => {
            let (reply_tx, reply_rx) = oneshot::channel();
            if channel.send((request, reply_tx)).await.is_err() {
                CtlResponse::error("process is shutting down")
            } else {
                reply_rx
                    .await
                    .unwrap_or_else(|_| CtlResponse::error("no reply from main loop"))
            }
        }
    };

    let payload = serde_json::to_vec(&response).unwrap_or_default();
    write_half.write_all(&payload).await?;
    write_half.write_all(b"\n").await?;
    write_half.shutdown().await
}

/// Send one command as a client and print the reply. Returns the process
/// exit code.
pub async fn send_command(path: &Path, command: &str) -> i32 {
    let stream = match UnixStream::connect(path).await {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("cannot connect to {}: {e}", path.display());
            return 1;
        }
    };
    let (read_half, mut write_half) = stream.into_split();
    if write_half
        .write_all(format!("{command}\n").as_bytes())
        .await
        .is_err()
    {
        eprintln!("failed to send command");
        return 1;
    }
    let _ = write_half.shutdown().await;

    let mut line = String::new();
    if BufReader::new(read_half).read_line(&mut line).await.is_err() {
        eprintln!("failed to read reply");
        return 1;
    }
    match serde_json::from_str::<CtlResponse>(line.trim()) {
        Ok(response) => {
            if !response.msg.is_empty() {
                println!("{}", response.msg);
            }
            response.retcode
        }
        Err(_) => {
            eprintln!("invalid reply: {line}");
            2
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert!(matches!(CtlRequest::parse("status"), Ok(CtlRequest::Status)));
        assert!(matches!(CtlRequest::parse("  pause "), Ok(CtlRequest::Pause)));
        assert!(matches!(
            CtlRequest::parse("inspect Users 42"),
            Ok(CtlRequest::Inspect { .. })
        ));
        assert!(CtlRequest::parse("inspect Users").is_err());
        assert!(CtlRequest::parse("dance").is_err());
        assert!(CtlRequest::parse("").is_err());
    }

    #[tokio::test]
    async fn test_roundtrip_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        let (tx, mut rx) = mpsc::channel(4);

        let server_path = path.clone();
        tokio::spawn(async move {
            let _ = serve(server_path, tx).await;
        });
        tokio::spawn(async move {
            while let Some((request, reply)) = rx.recv().await {
                let msg = match request {
                    CtlRequest::Status => "running".to_string(),
                    _ => "ok".to_string(),
                };
                let _ = reply.send(CtlResponse::ok(msg));
            }
        });

        // Wait for the socket file to appear.
        for _ in 0..50 {
            if path.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let retcode = send_command(&path, "status").await;
        assert_eq!(retcode, 0);
    }
}
