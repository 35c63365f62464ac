//! Abstract interface to the externally supplied protocol stack

use anyhow::Result;
use async_trait::async_trait;
use bluer::Address;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Opaque handle identifying one active SPP connection, issued by the stack.
pub type ConnHandle = i16;

/// Synchronous acknowledgement returned by every stack request.
///
/// `Accepted` only means the request was taken on; the real outcome arrives
/// later as a [`LinkEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// Request queued; a confirmation event will follow.
    Accepted,
    /// The stack is occupied with a conflicting operation.
    Busy,
    /// The request was rejected outright.
    Error,
}

impl RequestStatus {
    pub fn is_accepted(self) -> bool {
        self == RequestStatus::Accepted
    }
}

/// Outcome carried by confirmation events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Ok,
    Failed,
}

impl LinkStatus {
    pub fn is_ok(self) -> bool {
        self == LinkStatus::Ok
    }
}

/// Asynchronous events delivered by the protocol stack.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// Inquiry finished; on success carries the number of peers seen.
    InquiryComplete {
        status: LinkStatus,
        devices_found: u16,
    },
    /// Outcome of the most recent bond request.
    BondComplete { status: LinkStatus },
    /// Outcome of an SPP connect request.
    ConnectComplete {
        status: LinkStatus,
        handle: ConnHandle,
        peer: Address,
    },
    /// An SPP link went down, whether locally or remotely initiated.
    Disconnected { handle: ConnHandle, peer: Address },
    /// Inbound data is buffered on the given handle.
    DataAvailable { handle: ConnHandle },
    /// A previously accepted write has been handed to the link.
    WriteComplete {
        handle: ConnHandle,
        status: LinkStatus,
        bytes_written: usize,
        tag: i32,
    },
}

/// Capability set the connection controller consumes from the stack.
///
/// Request methods acknowledge synchronously with a [`RequestStatus`];
/// outcomes always arrive on the sink installed with
/// [`register_event_sink`](SppStack::register_event_sink).
#[async_trait]
pub trait SppStack: Send + 'static {
    /// One-shot start-up; resolves once the link layer is usable.
    async fn start(&mut self) -> Result<()>;

    /// Install the sink all [`LinkEvent`]s are delivered to.
    fn register_event_sink(&mut self, sink: mpsc::Sender<LinkEvent>);

    /// Start discovery of nearby peers.
    async fn request_inquiry(&mut self) -> RequestStatus;

    /// Bond (pair) with the given peer.
    async fn request_bond(&mut self, peer: Address) -> RequestStatus;

    /// Open an SPP data channel to the given peer.
    async fn request_connect(&mut self, peer: Address) -> RequestStatus;

    /// Close the SPP link behind `handle`.
    async fn request_disconnect(&mut self, handle: ConnHandle) -> RequestStatus;

    /// Stage `payload` for transmission on `handle`. `tag` is passed back
    /// unchanged in the matching [`LinkEvent::WriteComplete`].
    async fn write(&mut self, handle: ConnHandle, payload: Bytes, tag: i32) -> RequestStatus;

    /// Peek the currently buffered inbound data for `handle`, if any.
    async fn read_available(&mut self, handle: ConnHandle) -> Option<Bytes>;

    /// Mark `len` bytes of previously peeked inbound data as consumed.
    async fn consume_read(&mut self, handle: ConnHandle, len: usize);
}
