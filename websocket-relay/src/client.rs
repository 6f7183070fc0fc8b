use anyhow::{Context, Result};
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    select,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, Message},
};
use tracing::{info, warn};

use crate::cli::ConnectArgs;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SocketWriter = SplitSink<Socket, Message>;
type SocketReader = SplitStream<Socket>;

pub async fn run(args: ConnectArgs) -> Result<()> {
    let (mut writer, mut reader) = establish_connection(&args).await?;
    write_stdout(&format!("*** connected to {}", args.url)).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    run_client_loop(&mut reader, &mut writer, &mut stdin, &mut input).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn establish_connection(args: &ConnectArgs) -> Result<(SocketWriter, SocketReader)> {
    let (socket, _response) = connect_async(args.url.as_str())
        .await
        .with_context(|| format!("failed to connect to {}", args.url))?;

    info!("connected to {}", args.url);
    Ok(socket.split())
}

async fn run_client_loop(
    reader: &mut SocketReader,
    writer: &mut SocketWriter,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
) -> Result<()> {
    loop {
        input.clear();
        select! {
            server_message = reader.next() => {
                if !handle_server_message(server_message).await? {
                    break;
                }
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, writer).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_message(
    message: Option<Result<Message, tungstenite::Error>>,
) -> Result<bool> {
    match message {
        Some(Ok(Message::Text(text))) => {
            write_stdout(&text).await?;
            Ok(true)
        }
        Some(Ok(Message::Binary(bytes))) => {
            write_stdout(&String::from_utf8_lossy(&bytes)).await?;
            Ok(true)
        }
        Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => Ok(true),
        Some(Ok(Message::Close(_))) | None => {
            write_stdout("*** server closed the connection").await?;
            Ok(false)
        }
        Some(Err(err)) => Err(err).context("failed to read from relay"),
    }
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    writer: &mut SocketWriter,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        return Ok(false);
    }

    let text = input.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving").await?;
        return Ok(false);
    }

    writer
        .send(Message::Text(text.to_string()))
        .await
        .context("failed to send message")?;
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut SocketWriter) {
    if let Err(error) = writer.close().await {
        warn!(?error, "failed to close connection cleanly");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
