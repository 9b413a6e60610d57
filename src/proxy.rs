//! Packet router between the host-facing and controller-facing sides.
//!
//! [`Proxy`] classifies the HCI traffic flowing through and hands the
//! events and data frames the ACL layer cares about to its
//! [`AclDataChannel`]; everything else travels through unchanged.

use embassy_sync::blocking_mutex::raw::RawMutex;

use crate::acl_data_channel::{AclDataChannel, Disposition};
use crate::events::{
    command_complete_opcode, event_code, le_subevent_code, EVT_COMMAND_COMPLETE, EVT_CONNECTION_COMPLETE,
    EVT_DISCONNECTION_COMPLETE, EVT_LE_META, EVT_NUMBER_OF_COMPLETED_PACKETS, OPCODE_LE_READ_BUFFER_SIZE_V1,
    OPCODE_LE_READ_BUFFER_SIZE_V2, OPCODE_READ_BUFFER_SIZE, SUBEVT_LE_CONNECTION_COMPLETE,
    SUBEVT_LE_ENHANCED_CONNECTION_COMPLETE_V1, SUBEVT_LE_ENHANCED_CONNECTION_COMPLETE_V2,
};
use crate::{Direction, HciTransport, L2capChannelManager, ProxyResources};

/// A pass-through HCI proxy terminating a subset of L2CAP channels.
pub struct Proxy<'d, M: RawMutex> {
    acl: AclDataChannel<'d, M>,
    transport: &'d dyn HciTransport,
}

impl<'d, M: RawMutex> Proxy<'d, M> {
    /// Creates a proxy using the given resources and collaborators.
    pub fn new<const CONNS: usize>(
        resources: &'d mut ProxyResources<CONNS>,
        br_edr_credits_to_reserve: u16,
        le_credits_to_reserve: u16,
        transport: &'d dyn HciTransport,
        l2cap: &'d dyn L2capChannelManager,
    ) -> Self {
        Self {
            acl: AclDataChannel::new(
                resources.connections(),
                br_edr_credits_to_reserve,
                le_credits_to_reserve,
                transport,
                l2cap,
            ),
            transport,
        }
    }

    /// The ACL data path. Channels reserve their send credits here.
    pub fn acl_data_channel(&self) -> &AclDataChannel<'d, M> {
        &self.acl
    }

    /// Tears down all proxy state ahead of a fresh initialization.
    pub fn reset(&self) {
        self.acl.reset();
    }

    /// Routes one HCI event arriving from the controller.
    ///
    /// The event reaches the host unless the ACL layer consumed it
    /// whole; the two buffer-size events and the completed-packets event
    /// may be rewritten on the way.
    pub fn handle_event_from_controller(&self, event: &mut [u8]) {
        match event_code(event) {
            Some(EVT_NUMBER_OF_COMPLETED_PACKETS) => {
                // Forwards or drops the event itself.
                self.acl.handle_number_of_completed_packets(event);
            }
            Some(EVT_CONNECTION_COMPLETE) => self.acl.handle_connection_complete(event),
            Some(EVT_DISCONNECTION_COMPLETE) => {
                self.acl.process_disconnection_complete(event);
                self.transport.send_event_to_host(event);
            }
            Some(EVT_LE_META) => match le_subevent_code(event) {
                Some(SUBEVT_LE_CONNECTION_COMPLETE) => self.acl.handle_le_connection_complete(event),
                Some(SUBEVT_LE_ENHANCED_CONNECTION_COMPLETE_V1) => {
                    self.acl.handle_le_enhanced_connection_complete_v1(event)
                }
                Some(SUBEVT_LE_ENHANCED_CONNECTION_COMPLETE_V2) => {
                    self.acl.handle_le_enhanced_connection_complete_v2(event)
                }
                _ => self.transport.send_event_to_host(event),
            },
            Some(EVT_COMMAND_COMPLETE) => {
                match command_complete_opcode(event) {
                    Some(OPCODE_READ_BUFFER_SIZE) => self.acl.process_read_buffer_size_complete(event),
                    Some(OPCODE_LE_READ_BUFFER_SIZE_V1) => self.acl.process_le_read_buffer_size_v1_complete(event),
                    Some(OPCODE_LE_READ_BUFFER_SIZE_V2) => self.acl.process_le_read_buffer_size_v2_complete(event),
                    _ => {}
                }
                self.transport.send_event_to_host(event);
            }
            _ => self.transport.send_event_to_host(event),
        }
    }

    /// Routes one ACL data packet arriving from the controller.
    pub fn handle_acl_from_controller(&self, acl: &[u8]) {
        if self.acl.handle_acl_data(Direction::FromController, acl) == Disposition::Unhandled {
            self.transport.send_acl_to_host(acl);
        }
    }

    /// Routes one ACL data packet arriving from the host.
    pub fn handle_acl_from_host(&self, acl: &[u8]) {
        if self.acl.handle_acl_data(Direction::FromHost, acl) == Disposition::Unhandled {
            self.transport.send_acl_to_controller(acl);
        }
    }

    /// Routes one HCI command arriving from the host.
    ///
    /// The ACL layer never terminates commands; they travel through so
    /// the controller keeps seeing the host's command stream unchanged.
    pub fn handle_command_from_host(&self, command: &[u8]) {
        self.transport.send_command_to_controller(command);
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::boxed::Box;
    use std::vec::Vec;

    use embassy_sync::blocking_mutex::raw::NoopRawMutex;

    use super::*;
    use bt_hci::data::AclPacketBoundary;

    use crate::acl_data_channel::tests::{
        acl_frame, connection_complete_event, disconnection_complete_event, l2cap_frame,
        le_connection_complete_event, le_read_buffer_size_v1_event, nocp_event, test_allocator, TestChannel,
        TestChannelManager, TestTransport,
    };
    use crate::Transport;

    struct Harness {
        proxy: &'static Proxy<'static, NoopRawMutex>,
        transport: &'static TestTransport,
        manager: &'static TestChannelManager,
    }

    fn harness(channels: Vec<TestChannel>) -> Harness {
        let transport: &'static TestTransport = Box::leak(Box::new(TestTransport::new()));
        let manager: &'static TestChannelManager = Box::leak(Box::new(TestChannelManager::new(channels)));
        let resources = Box::leak(Box::new(ProxyResources::<4>::new()));
        let proxy = Box::leak(Box::new(Proxy::new(resources, 4, 4, transport, manager)));
        Harness {
            proxy,
            transport,
            manager,
        }
    }

    #[test]
    fn unrecognized_events_are_forwarded_unchanged() {
        let h = harness(Vec::new());
        // Encryption Change, which the proxy does not terminate.
        let mut event = std::vec![0x08, 0x04, 0x00, 0x40, 0x00, 0x01];
        let original = event.clone();
        h.proxy.handle_event_from_controller(&mut event);
        assert_eq!(h.transport.events_to_host.borrow().as_slice(), &[original]);
    }

    #[test]
    fn le_buffer_size_complete_is_rewritten_then_forwarded() {
        let h = harness(Vec::new());
        let mut event = le_read_buffer_size_v1_event(27, 10);
        h.proxy.handle_event_from_controller(&mut event);

        let events = h.transport.events_to_host.borrow();
        assert_eq!(events.len(), 1);
        // The host sees its 6-credit share.
        assert_eq!(events[0][8], 6);
        assert_eq!(h.manager.le_acl_data_packet_length.get(), Some(27));
        assert_eq!(h.proxy.acl_data_channel().num_free_acl_packets(Transport::Le), 4);
    }

    #[test]
    fn command_complete_for_other_opcodes_is_forwarded() {
        let h = harness(Vec::new());
        // Command complete for Reset (0x0c03).
        let mut event = std::vec![0x0e, 0x04, 0x01, 0x03, 0x0c, 0x00];
        let original = event.clone();
        h.proxy.handle_event_from_controller(&mut event);
        assert_eq!(h.transport.events_to_host.borrow().as_slice(), &[original]);
    }

    #[test]
    fn connection_events_route_to_the_acl_layer() {
        let h = harness(Vec::new());
        let mut event = le_connection_complete_event(0x0040, 0x00);
        h.proxy.handle_event_from_controller(&mut event);
        let mut event = connection_complete_event(0x0011, 0x00);
        h.proxy.handle_event_from_controller(&mut event);
        assert_eq!(h.transport.events_to_host.borrow().len(), 2);

        let mut event = disconnection_complete_event(0x0040, 0x00, 0x13);
        h.proxy.handle_event_from_controller(&mut event);
        assert_eq!(h.transport.events_to_host.borrow().len(), 3);
        assert_eq!(h.manager.disconnects.borrow().as_slice(), &[0x0040]);
    }

    #[test]
    fn fully_reclaimed_completions_never_reach_the_host() {
        let h = harness(Vec::new());
        let mut event = le_read_buffer_size_v1_event(27, 10);
        h.proxy.handle_event_from_controller(&mut event);
        let mut event = le_connection_complete_event(0x0040, 0x00);
        h.proxy.handle_event_from_controller(&mut event);

        let acl = h.proxy.acl_data_channel();
        let credit = acl.reserve_send_credit(Transport::Le).unwrap();
        let frame = acl_frame(0x0040, AclPacketBoundary::FirstNonFlushable, &l2cap_frame(0x0041, &[1]));
        acl.send_acl(&frame, credit).unwrap();

        let events_before = h.transport.events_to_host.borrow().len();
        let mut event = nocp_event(&[(0x0040, 1)]);
        h.proxy.handle_event_from_controller(&mut event);
        assert_eq!(h.transport.events_to_host.borrow().len(), events_before);
        assert_eq!(acl.num_free_acl_packets(Transport::Le), 4);
    }

    #[test]
    fn foreign_acl_data_flows_through_both_ways() {
        let h = harness(Vec::new());
        let frame = acl_frame(0x0077, AclPacketBoundary::FirstNonFlushable, &l2cap_frame(0x0004, &[1, 2]));

        h.proxy.handle_acl_from_controller(&frame);
        assert_eq!(h.transport.acl_to_host.borrow().as_slice(), &[frame.clone()]);

        h.proxy.handle_acl_from_host(&frame);
        assert_eq!(h.transport.acl_to_controller.borrow().as_slice(), &[frame]);
    }

    #[test]
    fn terminated_acl_data_is_consumed() {
        let channel = TestChannel::new(0x0040, 0x0041, 0x0042, Some(test_allocator(true)));
        let h = harness(std::vec![channel]);
        let mut event = le_connection_complete_event(0x0040, 0x00);
        h.proxy.handle_event_from_controller(&mut event);

        let frame = acl_frame(0x0040, AclPacketBoundary::FirstNonFlushable, &l2cap_frame(0x0041, &[1, 2]));
        h.proxy.handle_acl_from_controller(&frame);
        assert!(h.transport.acl_to_host.borrow().is_empty());
        assert_eq!(h.manager.channels[0].from_controller.borrow().len(), 1);
    }

    #[test]
    fn commands_pass_through() {
        let h = harness(Vec::new());
        let command = std::vec![0x03, 0x0c, 0x00];
        h.proxy.handle_command_from_host(&command);
        assert_eq!(h.transport.commands_to_controller.borrow().as_slice(), &[command]);
    }

    #[test]
    fn reset_tears_down_acl_state() {
        let h = harness(Vec::new());
        let mut event = le_read_buffer_size_v1_event(27, 10);
        h.proxy.handle_event_from_controller(&mut event);
        assert!(h.proxy.acl_data_channel().has_send_acl_capability(Transport::Le));

        h.proxy.reset();
        assert!(!h.proxy.acl_data_channel().has_send_acl_capability(Transport::Le));
    }
}
