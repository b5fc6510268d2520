//! The async driver: one `tokio::task` per target, owning the real socket
//! and timer and translating I/O events into the sans-IO engine's pure
//! event methods.

use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::Instrument;

use crate::config::Config;
use crate::engine::{Command, DeviceClientEngine, Delivery, Port, Requester};
use crate::error::{ActorGone, StartError};
use crate::sleep::Sleep;
use crate::socket::UdpSocket;

const MAILBOX_CAPACITY: usize = 128;

enum Mailbox {
    Enqueue {
        request: Vec<u8>,
        requester: Requester,
    },
}

/// Aborts the actor's task when the last clone of its handle is dropped.
struct TaskGuard(tokio::task::JoinHandle<()>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// A cheaply-clonable reference to a running device-client actor.
#[derive(Clone)]
pub struct ActorHandle {
    ipv4: Ipv4Addr,
    port: u16,
    tx: mpsc::Sender<Mailbox>,
    _task: Arc<TaskGuard>,
}

impl ActorHandle {
    /// The `(ipv4, control_port)` this handle's actor was started for.
    pub fn target(&self) -> (Ipv4Addr, u16) {
        (self.ipv4, self.port)
    }

    /// Submits a request, invoking `requester` exactly once with the
    /// outcome. Returns immediately once the request has been accepted
    /// into the actor's mailbox.
    pub async fn enqueue(&self, request: Vec<u8>, requester: Requester) -> Result<(), ActorGone> {
        self.tx
            .send(Mailbox::Enqueue { request, requester })
            .await
            .map_err(|_| ActorGone {
                ipv4: self.ipv4,
                port: self.port,
            })
    }

    /// Convenience wrapper over [`Self::enqueue`] for callers happy to
    /// `await` the reply rather than supplying their own one-shot sink.
    pub async fn request(&self, request: Vec<u8>) -> Result<Delivery, ActorGone> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let requester: Requester = Box::new(move |delivery| {
            let _ = tx.send(delivery);
        });

        self.enqueue(request, requester).await?;

        rx.await.map_err(|_| ActorGone {
            ipv4: self.ipv4,
            port: self.port,
        })
    }
}

/// Starts a new actor for `(ipv4, control_port)`: binds a local ephemeral
/// UDP socket and spawns the event loop that owns it.
pub async fn start(ipv4: Ipv4Addr, control_port: u16, config: Config) -> Result<ActorHandle, StartError> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .await
        .map_err(|source| StartError {
            ipv4,
            port: control_port,
            source: source
                .downcast::<std::io::Error>()
                .unwrap_or_else(|e| std::io::Error::other(e.to_string())),
        })?;

    let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
    let engine = DeviceClientEngine::new(ipv4, control_port, config);

    let span = tracing::info_span!("device_client_actor", %ipv4, port = control_port);
    let task = tokio::task::spawn(run(engine, socket, rx).instrument(span));

    tracing::info!(%ipv4, port = control_port, "started device client actor");

    Ok(ActorHandle {
        ipv4,
        port: control_port,
        tx,
        _task: Arc::new(TaskGuard(task)),
    })
}

fn target_addr(ipv4: Ipv4Addr, control_port: u16, port: Port) -> SocketAddr {
    let offset = match port {
        Port::Control => 0,
        Port::Status => 1,
        Port::Resend => 2,
    };

    SocketAddr::new(ipv4.into(), control_port.wrapping_add(offset))
}

fn classify(from_port: u16, control_port: u16) -> Option<Port> {
    match from_port {
        p if p == control_port => Some(Port::Control),
        p if p == control_port.wrapping_add(1) => Some(Port::Status),
        p if p == control_port.wrapping_add(2) => Some(Port::Resend),
        _ => None,
    }
}

async fn run(mut engine: DeviceClientEngine, mut socket: UdpSocket, mut mailbox: mpsc::Receiver<Mailbox>) {
    let ipv4 = engine.ipv4();
    let control_port = engine.control_port();
    let mut sleep = Sleep::default();

    loop {
        tokio::select! {
            msg = mailbox.recv() => {
                let Some(Mailbox::Enqueue { request, requester }) = msg else {
                    tracing::debug!("all handles dropped, shutting down actor");
                    return;
                };

                let commands = engine.enqueue(request, requester, Instant::now());
                execute(commands, &mut socket, &mut sleep, ipv4, control_port).await;
            }
            received = socket.recv() => {
                match received {
                    Ok((bytes, from)) => {
                        if tracing::enabled!(target: "wire", tracing::Level::TRACE) {
                            tracing::trace!(target: "wire", from = %from, bytes = %hex::encode(bytes), "recv");
                        }

                        let Some(port) = classify(from.port(), control_port) else {
                            tracing::trace!(%from, "dropping datagram from unrecognised port");
                            continue;
                        };

                        let commands = engine.handle_datagram(port, bytes, Instant::now());
                        execute(commands, &mut socket, &mut sleep, ipv4, control_port).await;
                    }
                    Err(e) => tracing::warn!("udp recv error: {e:#}"),
                }
            }
            () = &mut sleep => {
                let commands = engine.handle_deadline(Instant::now());
                execute(commands, &mut socket, &mut sleep, ipv4, control_port).await;
            }
        }
    }
}

async fn execute(
    commands: Vec<Command>,
    socket: &mut UdpSocket,
    sleep: &mut Sleep,
    ipv4: Ipv4Addr,
    control_port: u16,
) {
    for command in commands {
        match command {
            Command::Transmit { port, bytes } => {
                let target = target_addr(ipv4, control_port, port);

                if tracing::enabled!(target: "wire", tracing::Level::TRACE) {
                    tracing::trace!(target: "wire", to = %target, bytes = %hex::encode(&bytes), "send");
                }

                if let Err(e) = socket.send_to(&bytes, target).await {
                    tracing::warn!(%target, "udp send error: {e:#}");
                }
            }
            Command::Deliver { requester, delivery } => {
                tracing::debug!(error_code = delivery.error_code.as_u16(), "delivering reply");
                requester(delivery);
            }
            Command::Wake { at } => {
                Pin::new(sleep).reset(at);
            }
        }
    }
}
