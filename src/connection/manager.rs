//! Connection manager driving the multi-peer SPP workflow
//!
//! The manager is purely reactive: it owns the workflow state and advances
//! it one event at a time on a single consumer task. Inputs are the user
//! trigger and the protocol stack's asynchronous events; outputs are
//! requests issued back to the stack. All "waiting" (bond pacing, the next
//! rotation write, chained disconnects) is a delayed repost onto the same
//! queue, never a blocking sleep.

use crate::config::ControllerConfig;
use crate::connection::phase::{event_permitted, Phase};
use crate::connection::slots::{SlotTable, MAX_PEERS};
use crate::stack::{ConnHandle, LinkEvent, LinkStatus, SppStack};
use anyhow::{ensure, Result};
use bluer::Address;
use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Internal events consumed by the manager task: the user trigger plus the
/// delayed self-events that pace the workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    /// The no-argument user trigger.
    Trigger,
    /// Continue the bond batch with the next target.
    ContinueBonding,
    /// Issue the next round-robin write.
    SendNextPayload,
    /// Issue a disconnect for the next occupied slot.
    DisconnectNext,
}

/// Everything fed to the manager task, merged from the two inbound channels.
enum Incoming {
    Link(LinkEvent),
    Control(Control),
}

/// Mutable workflow state, owned by the manager task.
///
/// `connected_count` mirrors the number of occupied slots; `phase` is the
/// single source of truth for which operation is legal next.
#[derive(Debug)]
struct AppState {
    phase: Phase,
    devices_found: u16,
    connected_count: usize,
    bonded_count: usize,
    next_bond_index: usize,
    next_connect_index: usize,
    slots: SlotTable,
    write_cursor: Option<ConnHandle>,
    disconnect_all_requested: bool,
    /// Shared staging buffer for outbound payloads, reused across write
    /// cycles. Single-writer by virtue of the serialized event loop.
    scratch: BytesMut,
}

/// Cloneable handle used to deliver the user trigger to the manager task.
#[derive(Clone)]
pub struct ControllerHandle {
    control_tx: mpsc::Sender<Control>,
}

impl ControllerHandle {
    /// Advance the workflow by one step.
    ///
    /// Triggers are not debounced; one that lands in an incompatible phase
    /// is ignored by the guards.
    pub async fn trigger(&self) {
        if self.control_tx.send(Control::Trigger).await.is_err() {
            warn!("manager task is gone, trigger dropped");
        }
    }
}

/// Drives the discover/bond/connect/stream/teardown workflow over an
/// externally supplied protocol stack.
pub struct ConnectionManager<S: SppStack> {
    config: ControllerConfig,
    stack: S,
    state: AppState,
    control_rx: mpsc::Receiver<Control>,
    control_tx: mpsc::Sender<Control>,
    link_rx: mpsc::Receiver<LinkEvent>,
}

impl<S: SppStack> ConnectionManager<S> {
    /// Create a manager around `stack` and return it together with the
    /// trigger handle. The stack's event sink is installed here.
    pub fn new(config: ControllerConfig, mut stack: S) -> Result<(Self, ControllerHandle)> {
        ensure!(!config.targets.is_empty(), "target peer list is empty");
        ensure!(
            config.targets.len() <= MAX_PEERS,
            "at most {} target peers are supported, got {}",
            MAX_PEERS,
            config.targets.len()
        );

        let (control_tx, control_rx) = mpsc::channel(32);
        let (link_tx, link_rx) = mpsc::channel(64);
        stack.register_event_sink(link_tx);

        let mut scratch = BytesMut::with_capacity(config.payload_size);
        scratch.resize(config.payload_size, b's');

        let state = AppState {
            phase: Phase::Initializing,
            devices_found: 0,
            connected_count: 0,
            bonded_count: 0,
            next_bond_index: 0,
            next_connect_index: 0,
            slots: SlotTable::new(),
            write_cursor: None,
            disconnect_all_requested: false,
            scratch,
        };

        let handle = ControllerHandle {
            control_tx: control_tx.clone(),
        };

        Ok((
            Self {
                config,
                stack,
                state,
                control_rx,
                control_tx,
                link_rx,
            },
            handle,
        ))
    }

    /// Run the manager until every event source is closed.
    ///
    /// All state mutation happens on this task; events are processed one at
    /// a time to completion, which is the serialization guarantee the data
    /// model relies on.
    pub async fn run(mut self) {
        match self.stack.start().await {
            Ok(()) => {
                self.set_phase(Phase::Idle);
                info!("stack ready, waiting for trigger");
            }
            Err(e) => {
                error!("stack start-up failed: {e:#}");
                return;
            }
        }

        loop {
            let next = tokio::select! {
                event = self.link_rx.recv() => event.map(Incoming::Link),
                control = self.control_rx.recv() => control.map(Incoming::Control),
            };
            match next {
                Some(Incoming::Link(event)) => self.handle_link_event(event).await,
                Some(Incoming::Control(control)) => self.handle_control(control).await,
                None => break,
            }
        }
        info!("event sources closed, manager stopping");
    }

    async fn handle_control(&mut self, control: Control) {
        match control {
            Control::Trigger => self.on_trigger().await,
            Control::ContinueBonding => {
                // Delayed reposts are never cancelled; re-check the phase
                if self.state.phase == Phase::Bonding {
                    self.bond_next().await;
                }
            }
            Control::SendNextPayload => self.send_next_payload().await,
            Control::DisconnectNext => self.disconnect_next().await,
        }
    }

    async fn handle_link_event(&mut self, event: LinkEvent) {
        if !event_permitted(self.state.phase, &event) {
            debug!("ignoring {event:?} in phase {}", self.state.phase);
            return;
        }
        match event {
            LinkEvent::InquiryComplete {
                status,
                devices_found,
            } => self.on_inquiry_complete(status, devices_found),
            LinkEvent::BondComplete { status } => self.on_bond_complete(status),
            LinkEvent::ConnectComplete {
                status,
                handle,
                peer,
            } => self.on_connect_complete(status, handle, peer),
            LinkEvent::Disconnected { handle, peer } => self.on_disconnected(handle, peer),
            LinkEvent::DataAvailable { handle } => self.on_data_available(handle).await,
            LinkEvent::WriteComplete { handle, status, .. } => {
                self.on_write_complete(handle, status)
            }
        }
        debug_assert_eq!(self.state.connected_count, self.state.slots.occupied());
    }

    async fn on_trigger(&mut self) {
        debug!("trigger in phase {}", self.state.phase);
        match self.state.phase {
            Phase::Idle => {
                let status = self.stack.request_inquiry().await;
                if status.is_accepted() {
                    self.set_phase(Phase::Inquiring);
                } else {
                    warn!("inquiry request not accepted: {status:?}");
                }
            }
            Phase::InquiryCompleted => {
                if self.state.next_bond_index >= self.config.targets.len() {
                    self.state.next_bond_index = 0;
                }
                self.set_phase(Phase::Bonding);
                self.bond_next().await;
            }
            Phase::BondingCompleted | Phase::SppConnected => {
                if self.state.next_connect_index < self.config.targets.len() {
                    let peer = self.config.targets[self.state.next_connect_index];
                    let status = self.stack.request_connect(peer).await;
                    self.state.next_connect_index += 1;
                    if status.is_accepted() {
                        self.set_phase(Phase::ConnectingSpp);
                    } else {
                        // No automatic retry; the cursor has moved on and
                        // this peer is skipped until the cycle restarts
                        warn!("connect request for {peer} not accepted: {status:?}");
                    }
                    info!(
                        "connect attempt {} of {}, {} connected",
                        self.state.next_connect_index,
                        self.config.targets.len(),
                        self.state.connected_count
                    );
                } else if self.state.connected_count > 0 && !self.state.disconnect_all_requested {
                    self.state.write_cursor = self.state.slots.first_occupied();
                    self.set_phase(Phase::StreamOpened);
                    self.send_next_payload().await;
                }
            }
            Phase::StreamOpened => {
                self.state.disconnect_all_requested = true;
                self.set_phase(Phase::Disconnecting);
                self.disconnect_next().await;
            }
            other => debug!("trigger ignored in phase {other}"),
        }
    }

    /// Request a bond for the cursor target, falling through to the next
    /// target whenever the stack rejects a request synchronously.
    async fn bond_next(&mut self) {
        while self.state.next_bond_index < self.config.targets.len() {
            let peer = self.config.targets[self.state.next_bond_index];
            let status = self.stack.request_bond(peer).await;
            self.state.next_bond_index += 1;
            if status.is_accepted() {
                // Confirmation pending; the bond-complete handler decides
                // whether the batch continues or finishes
                return;
            }
            warn!("bond request for {peer} not accepted: {status:?}");
        }
        // Every remaining request was rejected synchronously, so no
        // confirmation is pending and the batch is over
        self.finish_bonding();
    }

    fn on_bond_complete(&mut self, status: LinkStatus) {
        if status.is_ok() {
            self.state.bonded_count += 1;
        } else {
            warn!("bond attempt {} failed", self.state.next_bond_index);
        }
        if self.state.next_bond_index >= self.config.targets.len() {
            self.finish_bonding();
        } else {
            self.post_delayed(Control::ContinueBonding, self.config.bond_retry_delay);
        }
    }

    fn finish_bonding(&mut self) {
        self.set_phase(Phase::BondingCompleted);
        info!(
            "bonding completed, {} of {} peers bonded",
            self.state.bonded_count,
            self.config.targets.len()
        );
    }

    fn on_inquiry_complete(&mut self, status: LinkStatus, devices_found: u16) {
        if status.is_ok() {
            self.state.devices_found = devices_found;
            self.set_phase(Phase::InquiryCompleted);
            info!("inquiry completed, found {devices_found} devices");
        } else {
            self.state.devices_found = 0;
            self.set_phase(Phase::Idle);
            warn!("inquiry failed");
        }
    }

    fn on_connect_complete(&mut self, status: LinkStatus, handle: ConnHandle, peer: Address) {
        if status.is_ok() {
            if !self.state.slots.allocate(handle) {
                error!("no free slot for handle {handle}, dropping confirmation");
                return;
            }
            self.state.connected_count += 1;
            self.set_phase(Phase::SppConnected);
            info!(
                "SPP link to {peer} open on handle {handle}, {} connected",
                self.state.connected_count
            );
        } else {
            self.set_phase(Phase::BondingCompleted);
            warn!("SPP connect to {peer} failed");
        }
    }

    fn on_disconnected(&mut self, handle: ConnHandle, peer: Address) {
        if !self.state.slots.release(handle) {
            debug!("disconnect for handle {handle} not held in any slot");
            return;
        }
        self.state.connected_count -= 1;
        info!(
            "handle {handle} ({peer}) disconnected, {} remaining",
            self.state.connected_count
        );

        if self.state.connected_count == 0 {
            self.state.next_connect_index = 0;
            self.state.disconnect_all_requested = false;
            self.set_phase(Phase::BondingCompleted);
            info!("all links closed, cycle complete");
        } else if self.state.disconnect_all_requested {
            self.post_delayed(Control::DisconnectNext, self.config.disconnect_delay);
        }
    }

    /// Issue a disconnect for the first occupied slot. Chained from each
    /// disconnect notification while a bulk teardown is in progress.
    async fn disconnect_next(&mut self) {
        if !self.state.disconnect_all_requested {
            return;
        }
        match self.state.slots.first_occupied() {
            Some(handle) => {
                let status = self.stack.request_disconnect(handle).await;
                info!("disconnect requested for handle {handle}: {status:?}");
            }
            None => self.state.disconnect_all_requested = false,
        }
    }

    /// Drain everything buffered on `handle` and echo it back on the same
    /// link (loopback pattern for exercising the data path).
    async fn on_data_available(&mut self, handle: ConnHandle) {
        while let Some(data) = self.stack.read_available(handle).await {
            let len = data.len();
            let size = len.min(self.config.payload_size);
            self.state.scratch[..size].copy_from_slice(&data[..size]);
            self.stack.consume_read(handle, len).await;

            let status = self
                .stack
                .write(handle, data.slice(..size), self.config.echo_tag)
                .await;
            if !status.is_accepted() {
                warn!("failed to echo {size} bytes to handle {handle}");
                break;
            }
        }
    }

    fn on_write_complete(&mut self, handle: ConnHandle, status: LinkStatus) {
        debug!("write confirmation for handle {handle}: {status:?}");
        // Pacing signal only: each confirmation schedules the next rotation
        // write unless teardown has started
        if !self.state.disconnect_all_requested {
            self.post_delayed(Control::SendNextPayload, self.config.write_delay);
        }
    }

    /// Write the scratch payload to the current rotation target, then
    /// advance the round-robin cursor.
    async fn send_next_payload(&mut self) {
        if self.state.disconnect_all_requested || self.state.connected_count == 0 {
            return;
        }
        let Some(handle) = self.state.write_cursor else {
            return;
        };

        let payload = Bytes::copy_from_slice(&self.state.scratch);
        let status = self.stack.write(handle, payload, i32::from(handle)).await;
        if status.is_accepted() {
            debug!("sent {} bytes to handle {handle}", self.state.scratch.len());
        } else {
            warn!("write to handle {handle} not accepted: {status:?}");
            self.post_delayed(Control::SendNextPayload, self.config.write_delay);
        }
        self.state.write_cursor = self.state.slots.next_write_target(self.state.write_cursor);
    }

    /// Repost a control event to our own queue after `delay`. Posted events
    /// cannot be cancelled; handlers re-check their guards when one fires.
    fn post_delayed(&self, control: Control, delay: Duration) {
        let tx = self.control_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(control).await;
        });
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.state.phase != phase {
            debug!("phase {} -> {}", self.state.phase, phase);
            self.state.phase = phase;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::RequestStatus;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum StackCall {
        Inquiry,
        Bond(Address),
        Connect(Address),
        Disconnect(ConnHandle),
        Write {
            handle: ConnHandle,
            len: usize,
            tag: i32,
        },
    }

    /// Stand-in for the external stack: records every request and answers
    /// with scripted acknowledgements (`Accepted` once the script runs out).
    #[derive(Default)]
    struct FakeStack {
        calls: Vec<StackCall>,
        scripted: VecDeque<RequestStatus>,
        reads: VecDeque<Bytes>,
    }

    impl FakeStack {
        fn ack(&mut self) -> RequestStatus {
            self.scripted.pop_front().unwrap_or(RequestStatus::Accepted)
        }
    }

    #[async_trait]
    impl SppStack for FakeStack {
        async fn start(&mut self) -> Result<()> {
            Ok(())
        }

        fn register_event_sink(&mut self, _sink: mpsc::Sender<LinkEvent>) {}

        async fn request_inquiry(&mut self) -> RequestStatus {
            self.calls.push(StackCall::Inquiry);
            self.ack()
        }

        async fn request_bond(&mut self, peer: Address) -> RequestStatus {
            self.calls.push(StackCall::Bond(peer));
            self.ack()
        }

        async fn request_connect(&mut self, peer: Address) -> RequestStatus {
            self.calls.push(StackCall::Connect(peer));
            self.ack()
        }

        async fn request_disconnect(&mut self, handle: ConnHandle) -> RequestStatus {
            self.calls.push(StackCall::Disconnect(handle));
            self.ack()
        }

        async fn write(&mut self, handle: ConnHandle, payload: Bytes, tag: i32) -> RequestStatus {
            self.calls.push(StackCall::Write {
                handle,
                len: payload.len(),
                tag,
            });
            self.ack()
        }

        async fn read_available(&mut self, _handle: ConnHandle) -> Option<Bytes> {
            self.reads.front().cloned()
        }

        async fn consume_read(&mut self, _handle: ConnHandle, _len: usize) {
            self.reads.pop_front();
        }
    }

    fn addr(last: u8) -> Address {
        Address::new([0x78, 0xA5, 0x04, 0x2F, 0x4A, last])
    }

    fn manager(n_targets: u8) -> ConnectionManager<FakeStack> {
        let config = ControllerConfig {
            targets: (0..n_targets).map(addr).collect(),
            ..Default::default()
        };
        let (manager, _handle) = ConnectionManager::new(config, FakeStack::default()).unwrap();
        manager
    }

    #[test]
    fn test_new_rejects_bad_target_lists() {
        let empty = ControllerConfig {
            targets: Vec::new(),
            ..Default::default()
        };
        assert!(ConnectionManager::new(empty, FakeStack::default()).is_err());

        let oversized = ControllerConfig {
            targets: (0..MAX_PEERS as u8 + 1).map(addr).collect(),
            ..Default::default()
        };
        assert!(ConnectionManager::new(oversized, FakeStack::default()).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_in_idle_starts_inquiry() {
        let mut mgr = manager(3);
        mgr.state.phase = Phase::Idle;

        mgr.handle_control(Control::Trigger).await;
        assert_eq!(mgr.stack.calls, vec![StackCall::Inquiry]);
        assert_eq!(mgr.state.phase, Phase::Inquiring);

        mgr.handle_link_event(LinkEvent::InquiryComplete {
            status: LinkStatus::Ok,
            devices_found: 4,
        })
        .await;
        assert_eq!(mgr.state.phase, Phase::InquiryCompleted);
        assert_eq!(mgr.state.devices_found, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_inquiry_stays_idle() {
        let mut mgr = manager(3);
        mgr.state.phase = Phase::Idle;
        mgr.stack.scripted.push_back(RequestStatus::Busy);

        mgr.handle_control(Control::Trigger).await;
        assert_eq!(mgr.state.phase, Phase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_inquiry_returns_to_idle() {
        let mut mgr = manager(3);
        mgr.state.phase = Phase::Inquiring;
        mgr.state.devices_found = 9;

        mgr.handle_link_event(LinkEvent::InquiryComplete {
            status: LinkStatus::Failed,
            devices_found: 0,
        })
        .await;
        assert_eq!(mgr.state.phase, Phase::Idle);
        assert_eq!(mgr.state.devices_found, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bond_batch_tolerates_single_failure() {
        let mut mgr = manager(3);
        mgr.state.phase = Phase::InquiryCompleted;

        mgr.handle_control(Control::Trigger).await;
        assert_eq!(mgr.state.phase, Phase::Bonding);
        assert_eq!(mgr.state.next_bond_index, 1);

        // success, failure, success
        for status in [LinkStatus::Ok, LinkStatus::Failed, LinkStatus::Ok] {
            mgr.handle_link_event(LinkEvent::BondComplete { status })
                .await;
            if mgr.state.phase == Phase::Bonding {
                // the paced continuation fires after the bond retry delay
                let control = mgr.control_rx.recv().await.unwrap();
                assert_eq!(control, Control::ContinueBonding);
                mgr.handle_control(control).await;
            }
        }

        assert_eq!(mgr.state.phase, Phase::BondingCompleted);
        assert_eq!(mgr.state.bonded_count, 2);
        assert_eq!(mgr.state.next_bond_index, 3);
        let bonds = mgr
            .stack
            .calls
            .iter()
            .filter(|call| matches!(call, StackCall::Bond(_)))
            .count();
        assert_eq!(bonds, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bond_batch_with_every_request_rejected() {
        let mut mgr = manager(3);
        mgr.state.phase = Phase::InquiryCompleted;
        for _ in 0..3 {
            mgr.stack.scripted.push_back(RequestStatus::Busy);
        }

        mgr.handle_control(Control::Trigger).await;
        // nothing pending, the batch finished without confirmations
        assert_eq!(mgr.state.phase, Phase::BondingCompleted);
        assert_eq!(mgr.state.bonded_count, 0);
        assert_eq!(mgr.state.next_bond_index, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_bond_continuation_is_ignored() {
        let mut mgr = manager(2);
        mgr.state.phase = Phase::BondingCompleted;

        mgr.handle_control(Control::ContinueBonding).await;
        assert!(mgr.stack.calls.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_confirmations_fill_slots() {
        let mut mgr = manager(2);
        mgr.state.phase = Phase::BondingCompleted;

        mgr.handle_control(Control::Trigger).await;
        assert_eq!(mgr.state.phase, Phase::ConnectingSpp);
        mgr.handle_link_event(LinkEvent::ConnectComplete {
            status: LinkStatus::Ok,
            handle: 5,
            peer: addr(0),
        })
        .await;
        assert_eq!(mgr.state.phase, Phase::SppConnected);
        assert_eq!(mgr.state.connected_count, 1);

        mgr.handle_control(Control::Trigger).await;
        mgr.handle_link_event(LinkEvent::ConnectComplete {
            status: LinkStatus::Ok,
            handle: 7,
            peer: addr(1),
        })
        .await;
        assert_eq!(mgr.state.connected_count, 2);
        assert_eq!(mgr.state.slots.occupied(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_returns_to_bonding_completed() {
        let mut mgr = manager(2);
        mgr.state.phase = Phase::ConnectingSpp;
        mgr.state.next_connect_index = 1;

        mgr.handle_link_event(LinkEvent::ConnectComplete {
            status: LinkStatus::Failed,
            handle: -1,
            peer: addr(0),
        })
        .await;
        assert_eq!(mgr.state.phase, Phase::BondingCompleted);
        assert_eq!(mgr.state.connected_count, 0);
        // the cursor stays where it was; the next trigger tries the next peer
        assert_eq!(mgr.state.next_connect_index, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stray_connect_confirm_does_not_reopen_slot() {
        let mut mgr = manager(2);
        mgr.state.phase = Phase::Disconnecting;

        mgr.handle_link_event(LinkEvent::ConnectComplete {
            status: LinkStatus::Ok,
            handle: 9,
            peer: addr(0),
        })
        .await;
        assert_eq!(mgr.state.connected_count, 0);
        assert_eq!(mgr.state.slots.occupied(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_of_unknown_handle_is_noop() {
        let mut mgr = manager(2);
        mgr.state.phase = Phase::SppConnected;
        mgr.state.slots.allocate(5);
        mgr.state.connected_count = 1;

        mgr.handle_link_event(LinkEvent::Disconnected {
            handle: 9,
            peer: addr(1),
        })
        .await;
        assert_eq!(mgr.state.connected_count, 1);
        assert_eq!(mgr.state.phase, Phase::SppConnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_writes_rotate_across_links() {
        let mut mgr = manager(2);
        mgr.state.slots.allocate(5);
        mgr.state.slots.allocate(7);
        mgr.state.connected_count = 2;
        mgr.state.next_connect_index = 2;
        mgr.state.phase = Phase::SppConnected;

        mgr.handle_control(Control::Trigger).await;
        assert_eq!(mgr.state.phase, Phase::StreamOpened);
        let payload_size = mgr.config.payload_size;
        assert_eq!(
            mgr.stack.calls.last(),
            Some(&StackCall::Write {
                handle: 5,
                len: payload_size,
                tag: 5,
            })
        );

        // each confirmation paces the next write, rotated to the other link
        mgr.handle_link_event(LinkEvent::WriteComplete {
            handle: 5,
            status: LinkStatus::Ok,
            bytes_written: payload_size,
            tag: 5,
        })
        .await;
        let control = mgr.control_rx.recv().await.unwrap();
        assert_eq!(control, Control::SendNextPayload);
        mgr.handle_control(control).await;
        assert_eq!(
            mgr.stack.calls.last(),
            Some(&StackCall::Write {
                handle: 7,
                len: payload_size,
                tag: 7,
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_bulk_disconnect_chains_in_slot_order() {
        let mut mgr = manager(2);
        mgr.state.slots.allocate(5);
        mgr.state.slots.allocate(7);
        mgr.state.connected_count = 2;
        mgr.state.next_connect_index = 2;
        mgr.state.phase = Phase::StreamOpened;

        mgr.handle_control(Control::Trigger).await;
        assert!(mgr.state.disconnect_all_requested);
        assert_eq!(mgr.state.phase, Phase::Disconnecting);
        assert_eq!(mgr.stack.calls.last(), Some(&StackCall::Disconnect(5)));

        mgr.handle_link_event(LinkEvent::Disconnected {
            handle: 5,
            peer: addr(0),
        })
        .await;
        let control = mgr.control_rx.recv().await.unwrap();
        assert_eq!(control, Control::DisconnectNext);
        mgr.handle_control(control).await;
        assert_eq!(mgr.stack.calls.last(), Some(&StackCall::Disconnect(7)));

        mgr.handle_link_event(LinkEvent::Disconnected {
            handle: 7,
            peer: addr(1),
        })
        .await;
        assert_eq!(mgr.state.phase, Phase::BondingCompleted);
        assert_eq!(mgr.state.connected_count, 0);
        assert_eq!(mgr.state.next_connect_index, 0);
        assert!(!mgr.state.disconnect_all_requested);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_write_scheduled_during_teardown() {
        let mut mgr = manager(1);
        mgr.state.slots.allocate(4);
        mgr.state.connected_count = 1;
        mgr.state.phase = Phase::Disconnecting;
        mgr.state.disconnect_all_requested = true;

        mgr.handle_link_event(LinkEvent::WriteComplete {
            handle: 4,
            status: LinkStatus::Ok,
            bytes_written: 512,
            tag: 4,
        })
        .await;

        tokio::time::advance(mgr.config.write_delay * 4).await;
        tokio::task::yield_now().await;
        assert!(mgr.control_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_data_echoes_back() {
        let mut mgr = manager(1);
        mgr.state.slots.allocate(5);
        mgr.state.connected_count = 1;
        mgr.state.phase = Phase::SppConnected;
        mgr.stack.reads.push_back(Bytes::from_static(b"hello"));

        mgr.handle_link_event(LinkEvent::DataAvailable { handle: 5 })
            .await;
        assert_eq!(
            mgr.stack.calls.last(),
            Some(&StackCall::Write {
                handle: 5,
                len: 5,
                tag: mgr.config.echo_tag,
            })
        );
        // the drained bytes were staged through the scratch buffer
        assert_eq!(&mgr.state.scratch[..5], b"hello");
        assert!(mgr.stack.reads.is_empty());
    }
}
