//! Workflow phases and the central transition-legality table

use crate::stack::LinkEvent;

/// Phases of the pairing/connection workflow.
///
/// The workflow is strictly trigger-driven and linear per pass; the phase
/// value is the single source of truth for which operation is legal next.
/// One full cycle runs `Idle -> Inquiring -> InquiryCompleted -> Bonding ->
/// BondingCompleted -> ConnectingSpp/SppConnected -> StreamOpened ->
/// Disconnecting -> BondingCompleted`, and restarts from there on the next
/// trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Stack start-up still in progress.
    Initializing,
    /// Link layer usable, nothing requested yet.
    Idle,
    /// Inquiry running.
    Inquiring,
    /// Inquiry finished; peer count recorded.
    InquiryCompleted,
    /// Bond batch in progress.
    Bonding,
    /// Bond batch finished; also the cycle restart point after teardown.
    BondingCompleted,
    /// SPP connect request outstanding.
    ConnectingSpp,
    /// At least one SPP link open, no data exchange running.
    SppConnected,
    /// Round-robin data exchange running.
    StreamOpened,
    /// Bulk teardown in progress.
    Disconnecting,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl Phase {
    /// Phases in which SPP links can be live. Connect-confirm failures fall
    /// back to `BondingCompleted` while earlier links stay up, so it counts.
    fn holds_connections(self) -> bool {
        matches!(
            self,
            Phase::BondingCompleted
                | Phase::ConnectingSpp
                | Phase::SppConnected
                | Phase::StreamOpened
                | Phase::Disconnecting
        )
    }
}

/// Central legality check: is `event` meaningful in `phase`?
///
/// Confirmation events are only accepted while the matching request can be
/// outstanding; a stray confirmation (a connect confirm arriving after
/// teardown has begun, say) must not mutate state. Disconnects and stream
/// events are accepted wherever a link can be live, since the remote side
/// may act at any time.
pub fn event_permitted(phase: Phase, event: &LinkEvent) -> bool {
    match event {
        LinkEvent::InquiryComplete { .. } => phase == Phase::Inquiring,
        LinkEvent::BondComplete { .. } => phase == Phase::Bonding,
        LinkEvent::ConnectComplete { .. } => phase == Phase::ConnectingSpp,
        LinkEvent::Disconnected { .. }
        | LinkEvent::DataAvailable { .. }
        | LinkEvent::WriteComplete { .. } => phase.holds_connections(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::LinkStatus;
    use bluer::Address;

    fn connect_confirm() -> LinkEvent {
        LinkEvent::ConnectComplete {
            status: LinkStatus::Ok,
            handle: 3,
            peer: Address::new([0, 0, 0, 0, 0, 1]),
        }
    }

    #[test]
    fn test_inquiry_confirm_only_while_inquiring() {
        let event = LinkEvent::InquiryComplete {
            status: LinkStatus::Ok,
            devices_found: 2,
        };
        assert!(event_permitted(Phase::Inquiring, &event));
        assert!(!event_permitted(Phase::Idle, &event));
        assert!(!event_permitted(Phase::Bonding, &event));
    }

    #[test]
    fn test_bond_confirm_only_while_bonding() {
        let event = LinkEvent::BondComplete {
            status: LinkStatus::Failed,
        };
        assert!(event_permitted(Phase::Bonding, &event));
        assert!(!event_permitted(Phase::BondingCompleted, &event));
        assert!(!event_permitted(Phase::Inquiring, &event));
    }

    #[test]
    fn test_stray_connect_confirm_rejected_after_teardown_begins() {
        assert!(event_permitted(Phase::ConnectingSpp, &connect_confirm()));
        assert!(!event_permitted(Phase::Disconnecting, &connect_confirm()));
        assert!(!event_permitted(Phase::StreamOpened, &connect_confirm()));
    }

    #[test]
    fn test_disconnect_accepted_wherever_links_can_live() {
        let event = LinkEvent::Disconnected {
            handle: 3,
            peer: Address::new([0, 0, 0, 0, 0, 1]),
        };
        for phase in [
            Phase::BondingCompleted,
            Phase::ConnectingSpp,
            Phase::SppConnected,
            Phase::StreamOpened,
            Phase::Disconnecting,
        ] {
            assert!(event_permitted(phase, &event), "rejected in {phase}");
        }
        assert!(!event_permitted(Phase::Idle, &event));
        assert!(!event_permitted(Phase::Initializing, &event));
    }
}
