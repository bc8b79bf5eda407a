use std::io::BufRead;

use anyhow::{Context, Result, bail};
use tokio::{
    io::{self, AsyncWrite, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::mpsc,
};
use tracing::{debug, info, warn};

use crate::{
    cli::ClientArgs,
    codec::{decode_server_frame, read_frame, send},
    config::RelayConfig,
    error::FrameError,
    message::{ClientFrame, ServerFrame},
};

pub async fn run(args: ClientArgs) -> Result<()> {
    let max_len = RelayConfig::default().max_frame_len;
    let stream = TcpStream::connect((args.host.as_str(), args.port))
        .await
        .with_context(|| format!("failed to connect to {}:{}", args.host, args.port))?;
    info!("connected to {}:{}", args.host, args.port);

    let (reader, mut writer) = stream.into_split();
    send(
        &mut writer,
        &ClientFrame::Join {
            username: args.username.clone(),
        },
        max_len,
    )
    .await?;

    // Frames are read on their own task so the select below only waits on
    // cancel-safe futures.
    let (inbound_tx, mut inbound) = mpsc::channel(64);
    let reader_task = tokio::spawn(read_server_frames(reader, inbound_tx, max_len));
    let mut input = spawn_stdin_reader();
    let mut terminal = Terminal::new();

    let outcome = chat_loop(&mut inbound, &mut input, &mut writer, &mut terminal, max_len).await;
    if let Err(error) = writer.shutdown().await {
        debug!(?error, "failed to shut down connection cleanly");
    }
    reader_task.abort();

    outcome
}

/// Reads stdin lines on a plain thread. A blocking read there never holds
/// up runtime shutdown, so the client exits as soon as the relay hangs up.
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(error) => {
                    debug!(?error, "stopped reading stdin");
                    break;
                }
            };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

async fn read_server_frames(reader: OwnedReadHalf, frames: mpsc::Sender<ServerFrame>, max_len: usize) {
    let mut reader = BufReader::new(reader);
    loop {
        let payload = match read_frame(&mut reader, max_len).await {
            Ok(payload) => payload,
            Err(FrameError::ConnectionClosed) => break,
            Err(err) => {
                debug!(error = ?err, "failed to read from relay");
                break;
            }
        };
        match decode_server_frame(&payload) {
            Ok(frame) => {
                if frames.send(frame).await.is_err() {
                    break;
                }
            }
            Err(err) => warn!(error = %err, "ignoring unreadable frame from relay"),
        }
    }
}

async fn chat_loop(
    inbound: &mut mpsc::Receiver<ServerFrame>,
    input: &mut mpsc::Receiver<String>,
    writer: &mut OwnedWriteHalf,
    terminal: &mut Terminal,
    max_len: usize,
) -> Result<()> {
    let mut welcomed = false;
    loop {
        select! {
            frame = inbound.recv() => {
                let Some(frame) = frame else {
                    terminal.notice("server closed the connection").await?;
                    if !welcomed {
                        bail!("relay closed the connection before welcoming us");
                    }
                    return Ok(());
                };
                welcomed |= matches!(frame, ServerFrame::Welcome { .. });
                terminal.render(frame).await?;
            }
            line = input.recv() => {
                let Some(line) = line else {
                    // stdin closed
                    send(writer, &ClientFrame::Quit, max_len).await?;
                    return Ok(());
                };
                let text = line.trim_end();
                if text.is_empty() {
                    continue;
                }
                if text.eq_ignore_ascii_case("/quit") {
                    terminal.notice("leaving chat").await?;
                    send(writer, &ClientFrame::Quit, max_len).await?;
                    return Ok(());
                }
                let chat = ClientFrame::Chat { body: text.to_string() };
                send(writer, &chat, max_len).await?;
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(error) = signal {
                    warn!(?error, "ctrl-c handler failed");
                }
                send(writer, &ClientFrame::Quit, max_len).await?;
                return Ok(());
            }
        }
    }
}

/// Human-facing output: chat and notices on stdout, relay errors on stderr.
struct Terminal {
    stdout: io::Stdout,
    stderr: io::Stderr,
}

impl Terminal {
    fn new() -> Self {
        Self {
            stdout: io::stdout(),
            stderr: io::stderr(),
        }
    }

    async fn render(&mut self, frame: ServerFrame) -> io::Result<()> {
        match frame {
            ServerFrame::Welcome { username, .. } => self.notice(&format!("connected as {username}")).await,
            ServerFrame::Roster { participants } if participants.is_empty() => Ok(()),
            ServerFrame::Roster { participants } => {
                self.notice(&format!("currently online: {}", participants.join(", ")))
                    .await
            }
            ServerFrame::Joined { username } => self.notice(&format!("{username} joined the chat")).await,
            ServerFrame::Left { username } => self.notice(&format!("{username} left the chat")).await,
            ServerFrame::Message(message) => {
                let line = format!(
                    "[{}] {}: {}\n",
                    message.timestamp().format("%H:%M:%S"),
                    message.username(),
                    message.body()
                );
                emit(&mut self.stdout, &line).await
            }
            ServerFrame::Error { message, .. } => emit(&mut self.stderr, &format!("!!! {message}\n")).await,
        }
    }

    async fn notice(&mut self, text: &str) -> io::Result<()> {
        emit(&mut self.stdout, &format!("*** {text}\n")).await
    }
}

async fn emit<W: AsyncWrite + Unpin>(out: &mut W, line: &str) -> io::Result<()> {
    out.write_all(line.as_bytes()).await?;
    out.flush().await
}
