//! Per-link state tracked by the ACL data path.

use bt_hci::param::ConnHandle;

use crate::packet_pool::RxAllocator;
use crate::pdu::Pdu;
use crate::recombine::RecombinationBuffer;
use crate::types::l2cap::{L2CAP_CID_ACL_U_SIGNAL, L2CAP_CID_LE_U_SIGNAL};
use crate::{Direction, Error, Transport};

/// The fixed L2CAP signaling channel carried by an ACL link.
///
/// Which flavor exists is decided by the link's transport at connection
/// time; an LE link never carries ACL-U signaling and vice versa.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingChannel {
    /// ACL-U signaling on a BR/EDR link.
    BrEdr { handle: ConnHandle },
    /// LE-U signaling on an LE link.
    Le { handle: ConnHandle },
}

impl SignalingChannel {
    pub(crate) fn new(transport: Transport, handle: ConnHandle) -> Self {
        match transport {
            Transport::BrEdr => Self::BrEdr { handle },
            Transport::Le => Self::Le { handle },
        }
    }

    /// The channel's fixed id on its link.
    pub fn local_cid(&self) -> u16 {
        match self {
            Self::BrEdr { .. } => L2CAP_CID_ACL_U_SIGNAL,
            Self::Le { .. } => L2CAP_CID_LE_U_SIGNAL,
        }
    }

    pub fn handle(&self) -> ConnHandle {
        match self {
            Self::BrEdr { handle } | Self::Le { handle } => *handle,
        }
    }
}

/// Storage slot for one tracked ACL connection.
///
/// Slots live in a caller-provided slice whose length bounds how many
/// connections the proxy tracks at once. A slot with `handle == None` is
/// free.
pub struct ConnectionStorage {
    pub(crate) handle: Option<ConnHandle>,
    pub(crate) transport: Transport,
    pub(crate) num_pending_packets: u16,
    pub(crate) signaling: Option<SignalingChannel>,
    recombination: [Option<RecombinationBuffer>; 2],
}

impl Default for ConnectionStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStorage {
    pub(crate) const NEW: ConnectionStorage = ConnectionStorage::new();

    /// Creates a free slot.
    pub const fn new() -> Self {
        Self {
            handle: None,
            transport: Transport::Le,
            num_pending_packets: 0,
            signaling: None,
            recombination: [None, None],
        }
    }

    pub(crate) fn open(&mut self, handle: ConnHandle, transport: Transport) {
        self.handle = Some(handle);
        self.transport = transport;
        self.num_pending_packets = 0;
        self.signaling = Some(SignalingChannel::new(transport, handle));
        self.recombination = [None, None];
    }

    pub(crate) fn close(&mut self) {
        self.handle = None;
        self.num_pending_packets = 0;
        self.signaling = None;
        self.recombination = [None, None];
    }

    /// Begins recombining a PDU of `size` total bytes.
    pub(crate) fn start_recombination(
        &mut self,
        direction: Direction,
        allocator: RxAllocator,
        size: usize,
    ) -> Result<(), Error> {
        if self.recombination_active(direction) {
            return Err(Error::InvalidState);
        }
        let buffer = RecombinationBuffer::new(allocator, size)?;
        self.recombination[direction.index()] = Some(buffer);
        Ok(())
    }

    /// Appends one fragment to the active recombination.
    ///
    /// Returns `Ok(None)` while more fragments are needed and
    /// `Ok(Some(pdu))` once the PDU is complete, at which point the
    /// buffer slot is already cleared.
    pub(crate) fn recombine_fragment(&mut self, direction: Direction, data: &[u8]) -> Result<Option<Pdu>, Error> {
        let slot = &mut self.recombination[direction.index()];
        let buffer = slot.as_mut().ok_or(Error::InvalidState)?;
        buffer.write(data)?;
        if !buffer.is_complete() {
            return Ok(None);
        }
        let buffer = unwrap!(slot.take());
        Ok(Some(buffer.take()))
    }

    pub(crate) fn end_recombination(&mut self, direction: Direction) {
        self.recombination[direction.index()] = None;
    }

    pub(crate) fn recombination_active(&self, direction: Direction) -> bool {
        self.recombination[direction.index()].is_some()
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::boxed::Box;

    use super::*;
    use crate::packet_pool::{ClientId, GlobalPacketPool, PacketPool, Quota};

    fn allocator() -> RxAllocator {
        let pool: &'static dyn GlobalPacketPool = Box::leak(Box::new(PacketPool::<
            embassy_sync::blocking_mutex::raw::NoopRawMutex,
            64,
            2,
            1,
        >::new(Quota::Shared)));
        RxAllocator::new(pool, ClientId::new(0))
    }

    fn open_slot() -> ConnectionStorage {
        let mut slot = ConnectionStorage::new();
        slot.open(ConnHandle::new(0x40), Transport::Le);
        slot
    }

    #[test]
    fn signaling_channel_follows_transport() {
        let slot = open_slot();
        let signaling = slot.signaling.unwrap();
        assert_eq!(signaling.local_cid(), L2CAP_CID_LE_U_SIGNAL);
        assert_eq!(signaling.handle(), ConnHandle::new(0x40));

        let mut slot = ConnectionStorage::new();
        slot.open(ConnHandle::new(0x41), Transport::BrEdr);
        assert_eq!(slot.signaling.unwrap().local_cid(), L2CAP_CID_ACL_U_SIGNAL);
    }

    #[test]
    fn directions_recombine_independently() {
        let mut slot = open_slot();
        slot.start_recombination(Direction::FromController, allocator(), 4)
            .unwrap();
        assert!(slot.recombination_active(Direction::FromController));
        assert!(!slot.recombination_active(Direction::FromHost));

        slot.start_recombination(Direction::FromHost, allocator(), 2).unwrap();
        let pdu = slot
            .recombine_fragment(Direction::FromHost, &[9, 9])
            .unwrap()
            .expect("complete");
        assert_eq!(pdu.as_ref(), &[9, 9]);
        assert!(!slot.recombination_active(Direction::FromHost));
        assert!(slot.recombination_active(Direction::FromController));
    }

    #[test]
    fn second_start_in_same_direction_is_rejected() {
        let mut slot = open_slot();
        slot.start_recombination(Direction::FromController, allocator(), 4)
            .unwrap();
        assert_eq!(
            slot.start_recombination(Direction::FromController, allocator(), 4),
            Err(Error::InvalidState)
        );
    }

    #[test]
    fn fragment_without_active_recombination_is_rejected() {
        let mut slot = open_slot();
        assert_eq!(
            slot.recombine_fragment(Direction::FromController, &[1]),
            Err(Error::InvalidState)
        );
    }

    #[test]
    fn completion_clears_the_slot() {
        let mut slot = open_slot();
        slot.start_recombination(Direction::FromController, allocator(), 3)
            .unwrap();
        assert!(slot
            .recombine_fragment(Direction::FromController, &[1, 2])
            .unwrap()
            .is_none());
        let pdu = slot
            .recombine_fragment(Direction::FromController, &[3])
            .unwrap()
            .expect("complete");
        assert_eq!(pdu.as_ref(), &[1, 2, 3]);
        assert!(!slot.recombination_active(Direction::FromController));
    }

    #[test]
    fn close_drops_recombination_state() {
        let mut slot = open_slot();
        slot.start_recombination(Direction::FromController, allocator(), 4)
            .unwrap();
        slot.close();
        assert!(slot.handle.is_none());
        assert!(!slot.recombination_active(Direction::FromController));
    }
}
