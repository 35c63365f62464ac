//! BlueZ-backed implementation of the protocol-stack interface
//!
//! Glue only: inquiry maps onto adapter discovery, bonding onto device
//! pairing, and the SPP data channel onto an RFCOMM stream. The stack
//! itself lives in bluetoothd; outcomes of every accepted request are
//! delivered as [`LinkEvent`]s on the registered sink.

use crate::stack::traits::{ConnHandle, LinkEvent, LinkStatus, RequestStatus, SppStack};
use anyhow::Result;
use async_trait::async_trait;
use bluer::rfcomm::{SocketAddr as RfcommAddr, Stream as RfcommStream};
use bluer::{Adapter, AdapterEvent, Address};
use bytes::{Buf, Bytes, BytesMut};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, info, warn};

/// Default RFCOMM channel for the SPP service.
pub const DEFAULT_RFCOMM_CHANNEL: u8 = 1;

/// Configuration for the BlueZ adapter.
#[derive(Debug, Clone)]
pub struct StackConfig {
    /// RFCOMM channel to connect to on each peer.
    pub channel: u8,
    /// How long an inquiry scans before reporting its device count.
    pub inquiry_duration: Duration,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            channel: DEFAULT_RFCOMM_CHANNEL,
            inquiry_duration: Duration::from_secs(10),
        }
    }
}

/// One live SPP connection: the write half plus the inbound buffer its
/// reader task fills.
struct Connection {
    peer: Address,
    writer: Arc<Mutex<WriteHalf<RfcommStream>>>,
    inbound: Arc<Mutex<BytesMut>>,
    write_in_flight: Arc<AtomicBool>,
    closing: Arc<Notify>,
}

type ConnectionMap = Arc<Mutex<HashMap<ConnHandle, Connection>>>;

/// Protocol stack implementation backed by BlueZ.
pub struct BluezStack {
    config: StackConfig,
    adapter: Option<Adapter>,
    sink: Option<mpsc::Sender<LinkEvent>>,
    connections: ConnectionMap,
    next_handle: Arc<AtomicI16>,
    inquiry_in_flight: Arc<AtomicBool>,
    bond_in_flight: Arc<AtomicBool>,
    connect_in_flight: Arc<AtomicBool>,
}

impl BluezStack {
    pub fn new(config: StackConfig) -> Self {
        Self {
            config,
            adapter: None,
            sink: None,
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_handle: Arc::new(AtomicI16::new(1)),
            inquiry_in_flight: Arc::new(AtomicBool::new(false)),
            bond_in_flight: Arc::new(AtomicBool::new(false)),
            connect_in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Adapter and sink, once both start-up and sink registration happened.
    fn ready(&self) -> Option<(Adapter, mpsc::Sender<LinkEvent>)> {
        match (&self.adapter, &self.sink) {
            (Some(adapter), Some(sink)) => Some((adapter.clone(), sink.clone())),
            _ => {
                warn!("[BT] stack not started or no event sink registered");
                None
            }
        }
    }
}

/// Count nearby devices for the scan duration. The timeout ending the scan
/// is expected, not an error.
async fn run_inquiry(adapter: Adapter, duration: Duration) -> Result<u16> {
    let mut devices_seen: u16 = 0;
    let discover = adapter.discover_devices().await?;
    tokio::pin!(discover);

    let _ = tokio::time::timeout(duration, async {
        while let Some(event) = discover.next().await {
            if let AdapterEvent::DeviceAdded(addr) = event {
                debug!("[BT] discovered {addr}");
                devices_seen += 1;
            }
        }
    })
    .await;

    Ok(devices_seen)
}

/// Pair with `peer`, treating an existing pairing as success.
async fn run_bond(adapter: Adapter, peer: Address) -> Result<()> {
    let device = adapter.device(peer)?;
    if device.is_paired().await? {
        debug!("[BT] {peer} already paired");
        return Ok(());
    }
    device.pair().await?;
    Ok(())
}

/// Read from `stream` into the connection's inbound buffer until EOF, a
/// read error, or a local close; then deregister and notify.
fn spawn_reader(
    handle: ConnHandle,
    peer: Address,
    mut stream: tokio::io::ReadHalf<RfcommStream>,
    inbound: Arc<Mutex<BytesMut>>,
    closing: Arc<Notify>,
    connections: ConnectionMap,
    sink: mpsc::Sender<LinkEvent>,
) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1024];
        loop {
            tokio::select! {
                _ = closing.notified() => break,
                result = stream.read(&mut buf) => match result {
                    Ok(0) => break,
                    Ok(n) => {
                        inbound.lock().await.extend_from_slice(&buf[..n]);
                        let _ = sink.send(LinkEvent::DataAvailable { handle }).await;
                    }
                    Err(e) => {
                        warn!("[BT] read error on handle {handle}: {e}");
                        break;
                    }
                },
            }
        }
        connections.lock().await.remove(&handle);
        let _ = sink.send(LinkEvent::Disconnected { handle, peer }).await;
    });
}

#[async_trait]
impl SppStack for BluezStack {
    async fn start(&mut self) -> Result<()> {
        let session = bluer::Session::new().await?;
        let adapter = session.default_adapter().await?;
        adapter.set_powered(true).await?;
        info!(
            "[BT] adapter {} ({}) powered",
            adapter.name(),
            adapter.address().await?
        );
        self.adapter = Some(adapter);
        Ok(())
    }

    fn register_event_sink(&mut self, sink: mpsc::Sender<LinkEvent>) {
        self.sink = Some(sink);
    }

    async fn request_inquiry(&mut self) -> RequestStatus {
        let Some((adapter, sink)) = self.ready() else {
            return RequestStatus::Error;
        };
        if self.inquiry_in_flight.swap(true, Ordering::SeqCst) {
            return RequestStatus::Busy;
        }

        let in_flight = self.inquiry_in_flight.clone();
        let duration = self.config.inquiry_duration;
        tokio::spawn(async move {
            let result = run_inquiry(adapter, duration).await;
            in_flight.store(false, Ordering::SeqCst);
            let event = match result {
                Ok(count) => LinkEvent::InquiryComplete {
                    status: LinkStatus::Ok,
                    devices_found: count,
                },
                Err(e) => {
                    warn!("[BT] inquiry failed: {e:#}");
                    LinkEvent::InquiryComplete {
                        status: LinkStatus::Failed,
                        devices_found: 0,
                    }
                }
            };
            let _ = sink.send(event).await;
        });
        RequestStatus::Accepted
    }

    async fn request_bond(&mut self, peer: Address) -> RequestStatus {
        let Some((adapter, sink)) = self.ready() else {
            return RequestStatus::Error;
        };
        if self.bond_in_flight.swap(true, Ordering::SeqCst) {
            return RequestStatus::Busy;
        }

        let in_flight = self.bond_in_flight.clone();
        tokio::spawn(async move {
            let result = run_bond(adapter, peer).await;
            in_flight.store(false, Ordering::SeqCst);
            let status = match result {
                Ok(()) => LinkStatus::Ok,
                Err(e) => {
                    warn!("[BT] bonding with {peer} failed: {e:#}");
                    LinkStatus::Failed
                }
            };
            let _ = sink.send(LinkEvent::BondComplete { status }).await;
        });
        RequestStatus::Accepted
    }

    async fn request_connect(&mut self, peer: Address) -> RequestStatus {
        let Some((_, sink)) = self.ready() else {
            return RequestStatus::Error;
        };
        if self.connect_in_flight.swap(true, Ordering::SeqCst) {
            return RequestStatus::Busy;
        }

        let in_flight = self.connect_in_flight.clone();
        let connections = self.connections.clone();
        let next_handle = self.next_handle.clone();
        let channel = self.config.channel;
        tokio::spawn(async move {
            let result = RfcommStream::connect(RfcommAddr::new(peer, channel)).await;
            in_flight.store(false, Ordering::SeqCst);
            match result {
                Ok(stream) => {
                    let handle = next_handle.fetch_add(1, Ordering::SeqCst);
                    let (read_half, write_half) = tokio::io::split(stream);
                    let inbound = Arc::new(Mutex::new(BytesMut::new()));
                    let closing = Arc::new(Notify::new());
                    connections.lock().await.insert(
                        handle,
                        Connection {
                            peer,
                            writer: Arc::new(Mutex::new(write_half)),
                            inbound: inbound.clone(),
                            write_in_flight: Arc::new(AtomicBool::new(false)),
                            closing: closing.clone(),
                        },
                    );
                    spawn_reader(
                        handle,
                        peer,
                        read_half,
                        inbound,
                        closing,
                        connections.clone(),
                        sink.clone(),
                    );
                    info!("[BT] RFCOMM link to {peer} open on handle {handle}");
                    let _ = sink
                        .send(LinkEvent::ConnectComplete {
                            status: LinkStatus::Ok,
                            handle,
                            peer,
                        })
                        .await;
                }
                Err(e) => {
                    warn!("[BT] RFCOMM connect to {peer} failed: {e}");
                    let _ = sink
                        .send(LinkEvent::ConnectComplete {
                            status: LinkStatus::Failed,
                            handle: -1,
                            peer,
                        })
                        .await;
                }
            }
        });
        RequestStatus::Accepted
    }

    async fn request_disconnect(&mut self, handle: ConnHandle) -> RequestStatus {
        let connections = self.connections.lock().await;
        match connections.get(&handle) {
            Some(conn) => {
                info!("[BT] closing link to {} on handle {handle}", conn.peer);
                // The reader task deregisters the link and emits Disconnected
                conn.closing.notify_one();
                let writer = conn.writer.clone();
                tokio::spawn(async move {
                    let _ = writer.lock().await.shutdown().await;
                });
                RequestStatus::Accepted
            }
            None => RequestStatus::Error,
        }
    }

    async fn write(&mut self, handle: ConnHandle, payload: Bytes, tag: i32) -> RequestStatus {
        let Some((_, sink)) = self.ready() else {
            return RequestStatus::Error;
        };
        let connections = self.connections.lock().await;
        let Some(conn) = connections.get(&handle) else {
            return RequestStatus::Error;
        };
        // One in-flight buffer per link; callers pace themselves on the
        // write confirmation
        if conn.write_in_flight.swap(true, Ordering::SeqCst) {
            return RequestStatus::Busy;
        }

        let writer = conn.writer.clone();
        let in_flight = conn.write_in_flight.clone();
        tokio::spawn(async move {
            let result = writer.lock().await.write_all(&payload).await;
            in_flight.store(false, Ordering::SeqCst);
            let event = match result {
                Ok(()) => LinkEvent::WriteComplete {
                    handle,
                    status: LinkStatus::Ok,
                    bytes_written: payload.len(),
                    tag,
                },
                Err(e) => {
                    warn!("[BT] write on handle {handle} failed: {e}");
                    LinkEvent::WriteComplete {
                        handle,
                        status: LinkStatus::Failed,
                        bytes_written: 0,
                        tag,
                    }
                }
            };
            let _ = sink.send(event).await;
        });
        RequestStatus::Accepted
    }

    async fn read_available(&mut self, handle: ConnHandle) -> Option<Bytes> {
        let connections = self.connections.lock().await;
        let conn = connections.get(&handle)?;
        let inbound = conn.inbound.lock().await;
        if inbound.is_empty() {
            None
        } else {
            Some(Bytes::copy_from_slice(&inbound))
        }
    }

    async fn consume_read(&mut self, handle: ConnHandle, len: usize) {
        let connections = self.connections.lock().await;
        if let Some(conn) = connections.get(&handle) {
            let mut inbound = conn.inbound.lock().await;
            let take = len.min(inbound.len());
            inbound.advance(take);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StackConfig::default();
        assert_eq!(config.channel, DEFAULT_RFCOMM_CHANNEL);
        assert_eq!(config.inquiry_duration, Duration::from_secs(10));
    }

    #[test]
    fn test_requests_without_sink_are_rejected() {
        let stack = BluezStack::new(StackConfig::default());
        assert!(stack.ready().is_none());
    }
}
