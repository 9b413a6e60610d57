//! Zero-copy views over the HCI events the proxy inspects.
//!
//! The proxy forwards event packets it does not terminate, so these views
//! operate directly on the borrowed wire bytes. The two buffer-size views
//! and the completed-packets view additionally rewrite their count fields
//! in place before the packet travels on to the host.

use bt_hci::param::{ConnHandle, Status};
use bt_hci::FromHciBytes;

use crate::codec::Error;

pub(crate) const EVT_CONNECTION_COMPLETE: u8 = 0x03;
pub(crate) const EVT_DISCONNECTION_COMPLETE: u8 = 0x05;
pub(crate) const EVT_COMMAND_COMPLETE: u8 = 0x0e;
pub(crate) const EVT_NUMBER_OF_COMPLETED_PACKETS: u8 = 0x13;
pub(crate) const EVT_LE_META: u8 = 0x3e;

pub(crate) const SUBEVT_LE_CONNECTION_COMPLETE: u8 = 0x01;
pub(crate) const SUBEVT_LE_ENHANCED_CONNECTION_COMPLETE_V1: u8 = 0x0a;
pub(crate) const SUBEVT_LE_ENHANCED_CONNECTION_COMPLETE_V2: u8 = 0x29;

pub(crate) const OPCODE_READ_BUFFER_SIZE: u16 = 0x1005;
pub(crate) const OPCODE_LE_READ_BUFFER_SIZE_V1: u16 = 0x2002;
pub(crate) const OPCODE_LE_READ_BUFFER_SIZE_V2: u16 = 0x2060;

// Event header is event code + parameter total length.
const EVENT_HEADER_SIZE: usize = 2;
// Command Complete prefixes its return parameters with the number of
// allowed command packets and the answered opcode.
const RETURN_PARAMS_OFFSET: usize = EVENT_HEADER_SIZE + 3;

/// Event code of an HCI event packet, if the header is intact.
pub fn event_code(event: &[u8]) -> Option<u8> {
    if event.len() < EVENT_HEADER_SIZE {
        return None;
    }
    Some(event[0])
}

/// Opcode a Command Complete event answers, if `event` is one.
pub fn command_complete_opcode(event: &[u8]) -> Option<u16> {
    if event_code(event)? != EVT_COMMAND_COMPLETE || event.len() < RETURN_PARAMS_OFFSET {
        return None;
    }
    Some(u16::from_le_bytes([event[3], event[4]]))
}

/// Subevent code of an LE Meta event, if `event` is one.
pub fn le_subevent_code(event: &[u8]) -> Option<u8> {
    if event_code(event)? != EVT_LE_META || event.len() <= EVENT_HEADER_SIZE {
        return None;
    }
    Some(event[2])
}

fn check_event(event: &[u8], code: u8, min_len: usize) -> Result<(), Error> {
    if event_code(event) != Some(code) {
        return Err(Error::InvalidValue);
    }
    if event.len() < min_len || (event[1] as usize) < min_len - EVENT_HEADER_SIZE {
        return Err(Error::InsufficientSpace);
    }
    Ok(())
}

fn read_status(event: &[u8], offset: usize) -> Status {
    let (status, _) = unwrap!(Status::from_hci_bytes(&event[offset..]));
    status
}

fn read_handle(event: &[u8], offset: usize) -> ConnHandle {
    let raw = u16::from_le_bytes([event[offset], event[offset + 1]]);
    ConnHandle::new(raw & 0x0fff)
}

/// Writer over a Read Buffer Size Command Complete event.
pub struct ReadBufferSizeComplete<'a> {
    event: &'a mut [u8],
}

impl<'a> ReadBufferSizeComplete<'a> {
    const TOTAL_NUM_ACL_OFFSET: usize = RETURN_PARAMS_OFFSET + 4;
    const SIZE: usize = RETURN_PARAMS_OFFSET + 8;

    pub fn new(event: &'a mut [u8]) -> Result<Self, Error> {
        check_event(event, EVT_COMMAND_COMPLETE, Self::SIZE)?;
        if command_complete_opcode(event) != Some(OPCODE_READ_BUFFER_SIZE) {
            return Err(Error::InvalidValue);
        }
        Ok(Self { event })
    }

    pub fn total_num_acl_data_packets(&self) -> u16 {
        let o = Self::TOTAL_NUM_ACL_OFFSET;
        u16::from_le_bytes([self.event[o], self.event[o + 1]])
    }

    pub fn set_total_num_acl_data_packets(&mut self, count: u16) {
        let o = Self::TOTAL_NUM_ACL_OFFSET;
        self.event[o..o + 2].copy_from_slice(&count.to_le_bytes());
    }
}

/// Writer over an LE Read Buffer Size (V1 or V2) Command Complete event.
///
/// The LE fields this crate cares about sit at the same offsets in both
/// versions; V2 merely appends the ISO buffer description.
pub struct LeReadBufferSizeComplete<'a> {
    event: &'a mut [u8],
}

impl<'a> LeReadBufferSizeComplete<'a> {
    const DATA_PACKET_LENGTH_OFFSET: usize = RETURN_PARAMS_OFFSET + 1;
    const TOTAL_NUM_OFFSET: usize = RETURN_PARAMS_OFFSET + 3;
    const V1_SIZE: usize = RETURN_PARAMS_OFFSET + 4;
    const V2_SIZE: usize = RETURN_PARAMS_OFFSET + 7;

    pub fn new_v1(event: &'a mut [u8]) -> Result<Self, Error> {
        Self::new(event, OPCODE_LE_READ_BUFFER_SIZE_V1, Self::V1_SIZE)
    }

    pub fn new_v2(event: &'a mut [u8]) -> Result<Self, Error> {
        Self::new(event, OPCODE_LE_READ_BUFFER_SIZE_V2, Self::V2_SIZE)
    }

    fn new(event: &'a mut [u8], opcode: u16, size: usize) -> Result<Self, Error> {
        check_event(event, EVT_COMMAND_COMPLETE, size)?;
        if command_complete_opcode(event) != Some(opcode) {
            return Err(Error::InvalidValue);
        }
        Ok(Self { event })
    }

    pub fn le_acl_data_packet_length(&self) -> u16 {
        let o = Self::DATA_PACKET_LENGTH_OFFSET;
        u16::from_le_bytes([self.event[o], self.event[o + 1]])
    }

    pub fn total_num_le_acl_data_packets(&self) -> u8 {
        self.event[Self::TOTAL_NUM_OFFSET]
    }

    pub fn set_total_num_le_acl_data_packets(&mut self, count: u8) {
        self.event[Self::TOTAL_NUM_OFFSET] = count;
    }
}

/// Writer over a Number Of Completed Packets event.
pub struct NumberOfCompletedPackets<'a> {
    event: &'a mut [u8],
}

impl<'a> NumberOfCompletedPackets<'a> {
    const ENTRIES_OFFSET: usize = EVENT_HEADER_SIZE + 1;
    const ENTRY_SIZE: usize = 4;

    pub fn new(event: &'a mut [u8]) -> Result<Self, Error> {
        check_event(event, EVT_NUMBER_OF_COMPLETED_PACKETS, Self::ENTRIES_OFFSET)?;
        let num_handles = event[2] as usize;
        check_event(
            event,
            EVT_NUMBER_OF_COMPLETED_PACKETS,
            Self::ENTRIES_OFFSET + num_handles * Self::ENTRY_SIZE,
        )?;
        Ok(Self { event })
    }

    pub fn num_handles(&self) -> usize {
        self.event[2] as usize
    }

    pub fn handle(&self, index: usize) -> ConnHandle {
        read_handle(self.event, Self::ENTRIES_OFFSET + index * Self::ENTRY_SIZE)
    }

    pub fn num_completed_packets(&self, index: usize) -> u16 {
        let o = Self::ENTRIES_OFFSET + index * Self::ENTRY_SIZE + 2;
        u16::from_le_bytes([self.event[o], self.event[o + 1]])
    }

    pub fn set_num_completed_packets(&mut self, index: usize, count: u16) {
        let o = Self::ENTRIES_OFFSET + index * Self::ENTRY_SIZE + 2;
        self.event[o..o + 2].copy_from_slice(&count.to_le_bytes());
    }
}

/// View over a BR/EDR Connection Complete event.
pub struct ConnectionComplete<'a> {
    event: &'a [u8],
}

impl<'a> ConnectionComplete<'a> {
    const SIZE: usize = EVENT_HEADER_SIZE + 11;

    pub fn new(event: &'a [u8]) -> Result<Self, Error> {
        check_event(event, EVT_CONNECTION_COMPLETE, Self::SIZE)?;
        Ok(Self { event })
    }

    pub fn status(&self) -> Status {
        read_status(self.event, 2)
    }

    pub fn handle(&self) -> ConnHandle {
        read_handle(self.event, 3)
    }
}

/// View over the connection-complete family of LE Meta subevents.
pub struct LeConnectionComplete<'a> {
    event: &'a [u8],
}

impl<'a> LeConnectionComplete<'a> {
    const LEGACY_SIZE: usize = EVENT_HEADER_SIZE + 19;
    const ENHANCED_V1_SIZE: usize = EVENT_HEADER_SIZE + 31;
    const ENHANCED_V2_SIZE: usize = EVENT_HEADER_SIZE + 34;

    pub fn new(event: &'a [u8]) -> Result<Self, Error> {
        Self::with_subevent(event, SUBEVT_LE_CONNECTION_COMPLETE, Self::LEGACY_SIZE)
    }

    pub fn new_enhanced_v1(event: &'a [u8]) -> Result<Self, Error> {
        Self::with_subevent(event, SUBEVT_LE_ENHANCED_CONNECTION_COMPLETE_V1, Self::ENHANCED_V1_SIZE)
    }

    pub fn new_enhanced_v2(event: &'a [u8]) -> Result<Self, Error> {
        Self::with_subevent(event, SUBEVT_LE_ENHANCED_CONNECTION_COMPLETE_V2, Self::ENHANCED_V2_SIZE)
    }

    fn with_subevent(event: &'a [u8], subevent: u8, size: usize) -> Result<Self, Error> {
        check_event(event, EVT_LE_META, size)?;
        if event[2] != subevent {
            return Err(Error::InvalidValue);
        }
        Ok(Self { event })
    }

    pub fn status(&self) -> Status {
        read_status(self.event, 3)
    }

    pub fn handle(&self) -> ConnHandle {
        read_handle(self.event, 4)
    }
}

/// View over a Disconnection Complete event.
pub struct DisconnectionComplete<'a> {
    event: &'a [u8],
}

impl<'a> DisconnectionComplete<'a> {
    const SIZE: usize = EVENT_HEADER_SIZE + 4;

    pub fn new(event: &'a [u8]) -> Result<Self, Error> {
        check_event(event, EVT_DISCONNECTION_COMPLETE, Self::SIZE)?;
        Ok(Self { event })
    }

    pub fn status(&self) -> Status {
        read_status(self.event, 2)
    }

    pub fn handle(&self) -> ConnHandle {
        read_handle(self.event, 3)
    }

    pub fn reason(&self) -> u8 {
        self.event[5]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_buffer_size_event(acl_len: u16, acl_count: u16) -> [u8; 13] {
        let mut event = [0u8; 13];
        event[0] = EVT_COMMAND_COMPLETE;
        event[1] = 11;
        event[2] = 1;
        event[3..5].copy_from_slice(&OPCODE_READ_BUFFER_SIZE.to_le_bytes());
        event[5] = 0x00;
        event[6..8].copy_from_slice(&acl_len.to_le_bytes());
        event[8] = 60;
        event[9..11].copy_from_slice(&acl_count.to_le_bytes());
        event
    }

    #[test]
    fn read_buffer_size_roundtrip() {
        let mut event = read_buffer_size_event(1021, 8);
        let mut view = ReadBufferSizeComplete::new(&mut event).unwrap();
        assert_eq!(view.total_num_acl_data_packets(), 8);
        view.set_total_num_acl_data_packets(5);
        assert_eq!(view.total_num_acl_data_packets(), 5);
        assert_eq!(&event[9..11], &5u16.to_le_bytes());
    }

    #[test]
    fn read_buffer_size_rejects_wrong_opcode() {
        let mut event = read_buffer_size_event(1021, 8);
        event[3..5].copy_from_slice(&0x1009u16.to_le_bytes());
        assert!(ReadBufferSizeComplete::new(&mut event).is_err());
    }

    #[test]
    fn le_read_buffer_size_v1_fields() {
        let mut event = [0u8; 9];
        event[0] = EVT_COMMAND_COMPLETE;
        event[1] = 7;
        event[2] = 1;
        event[3..5].copy_from_slice(&OPCODE_LE_READ_BUFFER_SIZE_V1.to_le_bytes());
        event[6..8].copy_from_slice(&27u16.to_le_bytes());
        event[8] = 10;

        let mut view = LeReadBufferSizeComplete::new_v1(&mut event).unwrap();
        assert_eq!(view.le_acl_data_packet_length(), 27);
        assert_eq!(view.total_num_le_acl_data_packets(), 10);
        view.set_total_num_le_acl_data_packets(6);
        assert_eq!(event[8], 6);

        // A V1 event must not parse as V2.
        assert!(LeReadBufferSizeComplete::new_v2(&mut event).is_err());
    }

    #[test]
    fn number_of_completed_packets_entries() {
        let mut event = [0u8; 11];
        event[0] = EVT_NUMBER_OF_COMPLETED_PACKETS;
        event[1] = 9;
        event[2] = 2;
        event[3..5].copy_from_slice(&0x0040u16.to_le_bytes());
        event[5..7].copy_from_slice(&3u16.to_le_bytes());
        event[7..9].copy_from_slice(&0x0080u16.to_le_bytes());
        event[9..11].copy_from_slice(&2u16.to_le_bytes());

        let mut view = NumberOfCompletedPackets::new(&mut event).unwrap();
        assert_eq!(view.num_handles(), 2);
        assert_eq!(view.handle(0).raw(), 0x0040);
        assert_eq!(view.num_completed_packets(0), 3);
        assert_eq!(view.handle(1).raw(), 0x0080);
        assert_eq!(view.num_completed_packets(1), 2);

        view.set_num_completed_packets(0, 1);
        assert_eq!(view.num_completed_packets(0), 1);
    }

    #[test]
    fn number_of_completed_packets_truncated_entries() {
        // Claims two entries but only carries one.
        let mut event = [0u8; 7];
        event[0] = EVT_NUMBER_OF_COMPLETED_PACKETS;
        event[1] = 5;
        event[2] = 2;
        assert!(NumberOfCompletedPackets::new(&mut event).is_err());
    }

    #[test]
    fn disconnection_complete_fields() {
        let event = [EVT_DISCONNECTION_COMPLETE, 4, 0x00, 0x40, 0x00, 0x13];
        let view = DisconnectionComplete::new(&event).unwrap();
        assert!(view.status().to_result().is_ok());
        assert_eq!(view.handle().raw(), 0x0040);
        assert_eq!(view.reason(), 0x13);
    }

}
