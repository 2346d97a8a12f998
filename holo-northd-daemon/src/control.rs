//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//
// Local control socket. Accepts the zero-argument commands "exit",
// "pause", "resume" and "is-paused" and returns a one-line textual reply.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};

// A command parsed off the control socket, paired with the channel carrying
// the textual reply.
#[derive(Debug)]
pub struct ControlRequest {
    pub command: ControlCommand,
    pub reply: oneshot::Sender<String>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ControlCommand {
    Exit,
    Pause,
    Resume,
    IsPaused,
}

// ===== impl ControlCommand =====

impl ControlCommand {
    fn parse(line: &str) -> Option<ControlCommand> {
        match line.trim() {
            "exit" => Some(ControlCommand::Exit),
            "pause" => Some(ControlCommand::Pause),
            "resume" => Some(ControlCommand::Resume),
            "is-paused" => Some(ControlCommand::IsPaused),
            _ => None,
        }
    }
}

// ===== global functions =====

// Binds the control socket and serves connections until the daemon exits.
pub(crate) fn spawn(
    path: String,
    request_tx: mpsc::Sender<ControlRequest>,
) -> std::io::Result<()> {
    // A previous run may have left the socket behind.
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path)?;
    info!(%path, "listening on control socket");

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let request_tx = request_tx.clone();
                    tokio::spawn(async move {
                        if let Err(error) =
                            serve_connection(stream, request_tx).await
                        {
                            error!(%error, "control connection error");
                        }
                    });
                }
                Err(error) => {
                    error!(%error, "control socket accept error");
                    break;
                }
            }
        }
    });

    Ok(())
}

async fn serve_connection(
    stream: UnixStream,
    request_tx: mpsc::Sender<ControlRequest>,
) -> std::io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    while let Some(line) = lines.next_line().await? {
        let Some(command) = ControlCommand::parse(&line) else {
            write.write_all(b"error: unknown command\n").await?;
            continue;
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if request_tx
            .send(ControlRequest {
                command,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            break;
        }
        let reply = reply_rx.await.unwrap_or_else(|_| "error".to_owned());
        write.write_all(reply.as_bytes()).await?;
        write.write_all(b"\n").await?;
    }

    Ok(())
}
