#![no_std]
#![warn(missing_docs)]
#![doc = include_str!("../README.md")]

use bt_hci::param::ConnHandle;

mod fmt;

mod codec;
mod connection;
mod credits;
mod events;
mod pdu;
mod recombine;
mod types;

mod acl_data_channel;
pub mod packet_pool;
mod proxy;

pub use acl_data_channel::{AclDataChannel, Disposition, SendCredit};
pub use connection::{ConnectionStorage, SignalingChannel};
pub use packet_pool::RxAllocator;
pub use proxy::Proxy;
pub use types::l2cap::{L2capHeader, L2CAP_CID_ACL_U_SIGNAL, L2CAP_CID_LE_U_SIGNAL};

/// Errors surfaced by the proxy data path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Malformed packet or field.
    InvalidValue,
    /// A buffer or budget was too small for the request.
    InsufficientSpace,
    /// No transmit credits left on the requested transport.
    NoCredits,
    /// The supplied credit was drawn on a different transport than the
    /// connection uses.
    WrongTransport,
    /// No tracked connection with that handle.
    NotFound,
    /// A connection with that handle is already tracked.
    AlreadyExists,
    /// The connection table is full.
    ConnectionLimitReached,
    /// The operation does not fit the current state.
    InvalidState,
    /// Buffer pool exhausted.
    OutOfMemory,
}

impl From<codec::Error> for Error {
    fn from(error: codec::Error) -> Self {
        match error {
            codec::Error::InsufficientSpace => Error::InsufficientSpace,
            codec::Error::InvalidValue => Error::InvalidValue,
        }
    }
}

/// Physical transport an ACL connection runs over.
///
/// Each transport has its own controller buffer pool; credits drawn on
/// one are never valid on the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Transport {
    /// BR/EDR (classic) transport.
    BrEdr,
    /// Low Energy transport.
    Le,
}

/// Which side of the proxy a packet entered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    /// Travelling controller to host.
    FromController,
    /// Travelling host to controller.
    FromHost,
}

impl Direction {
    pub(crate) const fn index(self) -> usize {
        match self {
            Direction::FromController => 0,
            Direction::FromHost => 1,
        }
    }

    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            Direction::FromController => "from controller",
            Direction::FromHost => "from host",
        }
    }
}

/// Packet egress used by the proxy.
///
/// Implementations apply whatever transport framing (typically H4) the
/// physical link needs. Called outside the proxy's internal lock, except
/// where noted on the calling operation.
pub trait HciTransport {
    /// Delivers an HCI event packet to the host.
    fn send_event_to_host(&self, event: &[u8]);
    /// Delivers an ACL data packet to the host.
    fn send_acl_to_host(&self, acl: &[u8]);
    /// Delivers an ACL data packet to the controller.
    fn send_acl_to_controller(&self, acl: &[u8]);
    /// Delivers an HCI command packet to the controller.
    fn send_command_to_controller(&self, command: &[u8]);
}

/// Registry of the L2CAP channels the proxy terminates.
pub trait L2capChannelManager {
    /// Finds a proxy-owned channel by the id it is addressed with in
    /// controller-to-host traffic.
    fn find_channel_by_local_cid(&self, handle: ConnHandle, cid: u16) -> Option<&dyn L2capChannel>;
    /// Finds a proxy-owned channel by the id it is addressed with in
    /// host-to-controller traffic.
    fn find_channel_by_remote_cid(&self, handle: ConnHandle, cid: u16) -> Option<&dyn L2capChannel>;
    /// Flushes channel transmit queues; invoked whenever transmit
    /// credits become available. Runs outside the proxy lock.
    fn drain_channel_queues(&self);
    /// Notifies that a tracked connection disconnected. Invoked while the
    /// proxy lock is held; implementations must not call back into the
    /// data path.
    fn handle_disconnection_complete(&self, handle: ConnHandle);
    /// Publishes the controller's LE ACL payload size.
    fn set_le_acl_data_packet_length(&self, length: u16);
}

/// One L2CAP channel terminated by the proxy.
pub trait L2capChannel {
    /// The channel's id on the local side.
    fn local_cid(&self) -> u16;
    /// Offers a PDU travelling controller to host. Returns false to have
    /// the frame passed through instead.
    fn handle_pdu_from_controller(&self, pdu: &[u8]) -> bool;
    /// Offers a PDU travelling host to controller. Returns false to have
    /// the frame passed through instead.
    fn handle_pdu_from_host(&self, pdu: &[u8]) -> bool;
    /// Storage used to reassemble fragmented PDUs addressed to this
    /// channel. Channels without one cannot receive fragmented PDUs.
    fn rx_allocator(&self) -> Option<RxAllocator>;
}

/// Connection-table storage handed to the proxy at construction.
///
/// The const parameter fixes how many concurrent ACL connections the
/// proxy will track.
pub struct ProxyResources<const CONNS: usize> {
    connections: [ConnectionStorage; CONNS],
}

impl<const CONNS: usize> Default for ProxyResources<CONNS> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const CONNS: usize> ProxyResources<CONNS> {
    /// Creates a new instance of proxy resources.
    pub const fn new() -> Self {
        Self {
            connections: [ConnectionStorage::NEW; CONNS],
        }
    }

    pub(crate) fn connections(&mut self) -> &mut [ConnectionStorage] {
        &mut self.connections
    }
}

pub mod prelude {
    //! Convenience include of the most commonly used types.
    pub use bt_hci::param::ConnHandle;

    pub use crate::acl_data_channel::{AclDataChannel, Disposition, SendCredit};
    pub use crate::connection::{ConnectionStorage, SignalingChannel};
    pub use crate::packet_pool::{ClientId, GlobalPacketPool, PacketPool, Quota, RxAllocator};
    pub use crate::proxy::Proxy;
    pub use crate::types::l2cap::{L2capHeader, L2CAP_CID_ACL_U_SIGNAL, L2CAP_CID_LE_U_SIGNAL};
    pub use crate::{Direction, Error, HciTransport, L2capChannel, L2capChannelManager, ProxyResources, Transport};
}
