//! Central dispatcher process.
//!
//! Listens on a single TCP port. Every connection is classified by its
//! first frame: `CAR` opens a long-lived car session (status reports in,
//! target floors out), `CALL` is a one-shot hall-call client that gets a
//! reply and is closed. All car records and queues live behind one
//! mutex; outbound frames never block under it, they are queued on a
//! per-connection channel drained by a writer task.

use std::io;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use clap::Parser;
use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use liftcore::floor::Floor;
use liftcore::proto::Message;

mod registry;
use registry::Registry;

#[derive(Parser, Debug)]
#[command(author, version, about = "Lift controller: registers cars and routes hall calls")]
struct Args {
    /// Listen address
    #[arg(long, default_value = liftcore::CONTROLLER_ADDR)]
    bind: String,
}

type SharedRegistry = Arc<Mutex<Registry>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let listener = TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("cannot listen on {}", args.bind))?;
    info!("lift controller listening on {}", args.bind);

    let registry: SharedRegistry = Arc::new(Mutex::new(Registry::new()));

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("accept failed")?;
                let registry = registry.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, registry).await {
                        debug!("connection from {} ended: {}", peer, e);
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }
    Ok(())
}

async fn handle_connection(mut stream: TcpStream, registry: SharedRegistry) -> anyhow::Result<()> {
    let Some(first) = read_frame(&mut stream).await? else {
        return Ok(());
    };
    match Message::parse(&first) {
        Ok(Message::Register {
            name,
            lowest,
            highest,
        }) => car_session(stream, registry, name, lowest, highest).await,
        Ok(Message::Call { from, to }) => {
            let reply = {
                let mut reg = registry.lock().unwrap();
                match reg.handle_call(from, to) {
                    Some(name) => {
                        info!("call {} -> {} assigned to car {}", from, to, name);
                        Message::Assigned { name }
                    }
                    None => {
                        warn!("call {} -> {}: no car available", from, to);
                        Message::Unavailable
                    }
                }
            };
            write_frame(&mut stream, &reply.encode()).await?;
            Ok(())
        }
        Ok(other) => {
            warn!("unexpected opening message: {:?}", other);
            Ok(())
        }
        Err(e) => {
            warn!("unparseable opening message: {}", e);
            Ok(())
        }
    }
}

/// Serve one registered car until it disconnects or reports that it is
/// leaving (emergency or individual service).
async fn car_session(
    stream: TcpStream,
    registry: SharedRegistry,
    name: String,
    lowest: Floor,
    highest: Floor,
) -> anyhow::Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    registry.lock().unwrap().register(&name, lowest, highest, tx);

    let writer_task = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if write_frame(&mut writer, &line).await.is_err() {
                break;
            }
        }
    });

    let result = loop {
        match read_frame(&mut reader).await {
            Ok(Some(text)) => match Message::parse(&text) {
                Ok(Message::Status {
                    status,
                    current,
                    destination,
                }) => {
                    registry
                        .lock()
                        .unwrap()
                        .on_status(&name, status, current, destination);
                }
                Ok(Message::Emergency) => {
                    warn!("car {} reported an emergency", name);
                    break Ok(());
                }
                Ok(Message::IndividualService) => {
                    info!("car {} switched to individual service", name);
                    break Ok(());
                }
                Ok(other) => debug!("car {} sent unexpected message {:?}", name, other),
                Err(e) => debug!("car {} sent unparseable frame: {}", name, e),
            },
            Ok(None) => break Ok(()),
            Err(e) => break Err(e.into()),
        }
    };

    registry.lock().unwrap().detach(&name);
    writer_task.abort();
    result
}

/// Read one length-prefixed frame; `None` on clean close before a frame.
async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> io::Result<Option<String>> {
    let mut header = [0u8; 2];
    match stream.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u16::from_be_bytes(header) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    String::from_utf8(body)
        .map(Some)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "frame is not valid text"))
}

async fn write_frame<W: AsyncWrite + Unpin>(stream: &mut W, text: &str) -> io::Result<()> {
    let mut buf = Vec::with_capacity(2 + text.len());
    buf.extend_from_slice(&(text.len() as u16).to_be_bytes());
    buf.extend_from_slice(text.as_bytes());
    stream.write_all(&buf).await
}
