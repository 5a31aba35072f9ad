//! tokio host for a [`Device`]
//!
//! - `UdpTransport`: non-blocking sends on the shared socket
//! - `WorkQueue`: per-peer task runs on the blocking pool
//! - `Driver::run`: receive loop plus the timer ticker

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

use crate::config::DeviceConfig;
use crate::device::external::{TaskScheduler, Transport};
use crate::device::peer::Peer;
use crate::device::Device;
use crate::error::{NetworkError, WgError};
use crate::routing::AllowedIps;

/// Buffer size for datagrams
const BUFFER_SIZE: usize = 65535;

/// How often deadlines are polled
const TICK_INTERVAL: Duration = Duration::from_millis(250);

/// Sends on a bound tokio socket without awaiting
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }
}

impl Transport for UdpTransport {
    fn send_datagram(&self, endpoint: SocketAddr, data: &[u8]) -> Result<(), NetworkError> {
        self.socket
            .try_send_to(data, endpoint)
            .map(|_| ())
            .map_err(|e| NetworkError::SendFailed {
                endpoint,
                reason: e.to_string(),
            })
    }
}

/// Hands scheduled peers to the worker task
pub struct WorkQueue {
    tx: mpsc::UnboundedSender<Arc<Peer>>,
}

impl WorkQueue {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Arc<Peer>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl TaskScheduler for WorkQueue {
    fn schedule_peer(&self, peer: Arc<Peer>) {
        if self.tx.send(peer).is_err() {
            tracing::warn!("Work queue closed, peer tasks dropped");
        }
    }
}

async fn run_worker(device: Arc<Device>, mut work: mpsc::UnboundedReceiver<Arc<Peer>>) {
    while let Some(peer) = work.recv().await {
        let device = Arc::clone(&device);
        // session teardown waits for readers; keep it off the async workers
        tokio::task::spawn_blocking(move || device.run_peer_tasks(&peer, Instant::now()));
    }
}

/// A device bound to a UDP socket
pub struct Driver {
    device: Arc<Device>,
    socket: Arc<UdpSocket>,
    work: mpsc::UnboundedReceiver<Arc<Peer>>,
}

impl Driver {
    /// Bind `0.0.0.0:listen_port` and build the device around it
    pub async fn bind(config: &DeviceConfig) -> Result<Self, WgError> {
        let bind_addr = format!("0.0.0.0:{}", config.listen_port);
        let socket = UdpSocket::bind(&bind_addr)
            .await
            .map_err(|e| NetworkError::BindFailed {
                addr: bind_addr.clone(),
                reason: e.to_string(),
            })?;
        let socket = Arc::new(socket);
        let port = socket.local_addr()?.port();

        let (queue, work) = WorkQueue::channel();
        let device = Device::from_config(
            config,
            Arc::new(UdpTransport::new(Arc::clone(&socket))),
            Arc::new(AllowedIps::new()),
            Arc::new(queue),
        )?;
        device.set_listen_port(port);

        tracing::info!("Listening on UDP port {} with {} peers", port, device.peer_count());

        Ok(Self {
            device: Arc::new(device),
            socket,
            work,
        })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serve until `shutdown` resolves
    ///
    /// Decrypted inner packets are pushed to `deliver`; when it is full they
    /// are dropped.
    pub async fn run<F>(self, deliver: mpsc::Sender<Vec<u8>>, shutdown: F) -> Result<(), WgError>
    where
        F: Future<Output = ()>,
    {
        let Self {
            device,
            socket,
            work,
        } = self;

        let worker = tokio::spawn(run_worker(Arc::clone(&device), work));

        let mut ticker = interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = vec![0u8; BUFFER_SIZE];
        tokio::pin!(shutdown);

        tracing::info!("Device event loop started");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested");
                    break;
                }

                result = socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, from)) => {
                            if let Some(packet) = device.handle_datagram(&buf[..len], from, Instant::now()) {
                                if deliver.try_send(packet).is_err() {
                                    tracing::trace!("Delivery queue full, dropped inner packet");
                                }
                            }
                        }
                        Err(e) => tracing::warn!("UDP recv error: {}", e),
                    }
                }

                _ = ticker.tick() => device.tick(Instant::now()),
            }
        }

        worker.abort();
        Ok(())
    }
}
