//! ACL data path of the proxy.
//!
//! [`AclDataChannel`] sits between the host and the controller and owns
//! the ACL flow-control state both sides believe they have to themselves:
//! the controller's transmit credits (split between host and proxy), the
//! set of open connections, and the per-connection recombination of
//! fragmented L2CAP PDUs addressed to proxy-owned channels. Everything
//! else passes through untouched.

use core::cell::RefCell;

use bt_hci::data::{AclPacket, AclPacketBoundary};
use bt_hci::param::{ConnHandle, Status};
use bt_hci::FromHciBytes;
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;

use crate::connection::{ConnectionStorage, SignalingChannel};
use crate::credits::Credits;
use crate::events::{
    ConnectionComplete, DisconnectionComplete, LeConnectionComplete, LeReadBufferSizeComplete,
    NumberOfCompletedPackets, ReadBufferSizeComplete,
};
use crate::pdu::Pdu;
use crate::types::l2cap::L2capHeader;
use crate::{Direction, Error, HciTransport, L2capChannel, L2capChannelManager, Transport};

/// What became of an ACL frame offered to the proxy.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Disposition {
    /// The proxy consumed the frame; it must not travel further.
    Handled,
    /// The proxy did not touch the frame; pass it on unchanged.
    Unhandled,
}

struct State<'d> {
    br_edr_credits: Credits,
    le_credits: Credits,
    connections: &'d mut [ConnectionStorage],
}

impl State<'_> {
    fn credits(&mut self, transport: Transport) -> &mut Credits {
        match transport {
            Transport::BrEdr => &mut self.br_edr_credits,
            Transport::Le => &mut self.le_credits,
        }
    }

    fn connection_index(&self, handle: ConnHandle) -> Option<usize> {
        self.connections.iter().position(|c| c.handle == Some(handle))
    }
}

/// Decision produced under the lock for one inbound ACL frame; external
/// callbacks run only after the lock is released.
enum RxDecision<'a> {
    Pass,
    Consume,
    DeliverInline(&'a [u8]),
    DeliverRecombined(Pdu),
}

/// The proxy's view of the controller's ACL buffers and connections.
pub struct AclDataChannel<'d, M: RawMutex> {
    state: Mutex<M, RefCell<State<'d>>>,
    transport: &'d dyn HciTransport,
    l2cap: &'d dyn L2capChannelManager,
}

impl<'d, M: RawMutex> AclDataChannel<'d, M> {
    /// Creates a data channel tracking at most `connections.len()`
    /// concurrent ACL connections and skimming up to the given number of
    /// credits per transport off the controller's budgets.
    pub fn new(
        connections: &'d mut [ConnectionStorage],
        br_edr_credits_to_reserve: u16,
        le_credits_to_reserve: u16,
        transport: &'d dyn HciTransport,
        l2cap: &'d dyn L2capChannelManager,
    ) -> Self {
        Self {
            state: Mutex::new(RefCell::new(State {
                br_edr_credits: Credits::new(br_edr_credits_to_reserve),
                le_credits: Credits::new(le_credits_to_reserve),
                connections,
            })),
            transport,
            l2cap,
        }
    }

    fn with_state<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut State<'d>) -> R,
    {
        self.state.lock(|state| f(&mut state.borrow_mut()))
    }

    /// Drops all credit and connection state ahead of re-initialization.
    pub fn reset(&self) {
        self.with_state(|state| {
            // Credits are cleared before the connections so any transmit
            // attempt racing the reset sees zero capacity and backs off.
            state.le_credits.reset();
            state.br_edr_credits.reset();
            for connection in state.connections.iter_mut() {
                connection.close();
            }
        });
    }

    /// Splits the BR/EDR credit budget announced by a Read Buffer Size
    /// command complete, rewriting the event to carry the host's share.
    ///
    /// The caller forwards the event afterwards.
    pub fn process_read_buffer_size_complete(&self, event: &mut [u8]) {
        let mut view = match ReadBufferSizeComplete::new(&mut *event) {
            Ok(view) => view,
            Err(_) => {
                error!("[acl] READ_BUFFER_SIZE command complete too short, not processing");
                return;
            }
        };
        self.with_state(|state| {
            let controller_max = view.total_num_acl_data_packets();
            let host_max = state.br_edr_credits.reserve(controller_max);
            view.set_total_num_acl_data_packets(host_max);
        });
        // BR/EDR traffic queued while the proxy had no credits can go now.
        self.l2cap.drain_channel_queues();
    }

    /// LE flavor of [`AclDataChannel::process_read_buffer_size_complete`]
    /// for the V1 command.
    pub fn process_le_read_buffer_size_v1_complete(&self, event: &mut [u8]) {
        match LeReadBufferSizeComplete::new_v1(&mut *event) {
            Ok(view) => self.process_le_read_buffer_size(view),
            Err(_) => error!("[acl] LE_READ_BUFFER_SIZE command complete too short, not processing"),
        }
    }

    /// LE flavor of [`AclDataChannel::process_read_buffer_size_complete`]
    /// for the V2 command.
    pub fn process_le_read_buffer_size_v2_complete(&self, event: &mut [u8]) {
        match LeReadBufferSizeComplete::new_v2(&mut *event) {
            Ok(view) => self.process_le_read_buffer_size(view),
            Err(_) => error!("[acl] LE_READ_BUFFER_SIZE command complete too short, not processing"),
        }
    }

    fn process_le_read_buffer_size(&self, mut view: LeReadBufferSizeComplete<'_>) {
        self.with_state(|state| {
            let controller_max = view.total_num_le_acl_data_packets() as u16;
            let host_max = state.le_credits.reserve(controller_max);
            view.set_total_num_le_acl_data_packets(host_max as u8);
        });

        let length = view.le_acl_data_packet_length();
        if length == 0 {
            error!(
                "[acl] controller shares one buffer pool between BR/EDR and LE, which is not \
                 supported; LE channels will not transmit"
            );
        }
        self.l2cap.set_le_acl_data_packet_length(length);
        // Send packets that may have queued before any LE credits existed.
        self.l2cap.drain_channel_queues();
    }

    /// Reclaims the proxy's share of a Number Of Completed Packets event.
    ///
    /// Entries for tracked connections are rewritten in place to the
    /// count the host is owed; the event is forwarded only if some entry
    /// still carries completions for the host.
    pub fn handle_number_of_completed_packets(&self, event: &mut [u8]) {
        let mut view = match NumberOfCompletedPackets::new(&mut *event) {
            Ok(view) => view,
            Err(_) => {
                error!("[acl] NUMBER_OF_COMPLETED_PACKETS event too short, forwarding unprocessed");
                self.transport.send_event_to_host(event);
                return;
            }
        };

        let mut should_send_to_host = false;
        let mut did_reclaim_credits = false;
        self.with_state(|state| {
            for i in 0..view.num_handles() {
                let completed = view.num_completed_packets(i);
                if completed == 0 {
                    continue;
                }
                let Some(index) = state.connection_index(view.handle(i)) else {
                    // Completions for a connection the proxy is not
                    // tracking belong to the host in full.
                    should_send_to_host = true;
                    continue;
                };

                let (transport, reclaimed) = {
                    let connection = &mut state.connections[index];
                    let reclaimed = completed.min(connection.num_pending_packets);
                    connection.num_pending_packets -= reclaimed;
                    (connection.transport, reclaimed)
                };
                if reclaimed > 0 {
                    did_reclaim_credits = true;
                    state.credits(transport).mark_completed(reclaimed);
                }

                let remaining = completed - reclaimed;
                view.set_num_completed_packets(i, remaining);
                if remaining > 0 {
                    should_send_to_host = true;
                }
            }
        });

        if did_reclaim_credits {
            self.l2cap.drain_channel_queues();
        }
        if should_send_to_host {
            self.transport.send_event_to_host(event);
        }
    }

    /// Tracks the connection a successful BR/EDR Connection Complete
    /// announces, then forwards the event.
    pub fn handle_connection_complete(&self, event: &[u8]) {
        if let Ok(view) = ConnectionComplete::new(event) {
            self.track_connection(view.status(), view.handle(), Transport::BrEdr);
        }
        self.transport.send_event_to_host(event);
    }

    /// Tracks the connection a successful LE Connection Complete
    /// announces, then forwards the event.
    pub fn handle_le_connection_complete(&self, event: &[u8]) {
        if let Ok(view) = LeConnectionComplete::new(event) {
            self.track_connection(view.status(), view.handle(), Transport::Le);
        }
        self.transport.send_event_to_host(event);
    }

    /// LE Enhanced Connection Complete (V1) flavor of
    /// [`AclDataChannel::handle_le_connection_complete`].
    pub fn handle_le_enhanced_connection_complete_v1(&self, event: &[u8]) {
        if let Ok(view) = LeConnectionComplete::new_enhanced_v1(event) {
            self.track_connection(view.status(), view.handle(), Transport::Le);
        }
        self.transport.send_event_to_host(event);
    }

    /// LE Enhanced Connection Complete (V2) flavor of
    /// [`AclDataChannel::handle_le_connection_complete`].
    pub fn handle_le_enhanced_connection_complete_v2(&self, event: &[u8]) {
        if let Ok(view) = LeConnectionComplete::new_enhanced_v2(event) {
            self.track_connection(view.status(), view.handle(), Transport::Le);
        }
        self.transport.send_event_to_host(event);
    }

    fn track_connection(&self, status: Status, handle: ConnHandle, transport: Transport) {
        if status.to_result().is_err() {
            return;
        }
        if let Err(Error::ConnectionLimitReached) = self.create_connection(handle, transport) {
            error!("[acl] could not track connection {:x}, connection limit reached", handle.raw());
        }
    }

    fn create_connection(&self, handle: ConnHandle, transport: Transport) -> Result<(), Error> {
        self.with_state(|state| {
            if state.connection_index(handle).is_some() {
                warn!("[acl] connection {:x} is already tracked", handle.raw());
                return Err(Error::AlreadyExists);
            }
            let Some(connection) = state.connections.iter_mut().find(|c| c.handle.is_none()) else {
                return Err(Error::ConnectionLimitReached);
            };
            connection.open(handle, transport);
            info!("[acl] tracking {:?} connection {:x}", transport, handle.raw());
            Ok(())
        })
    }

    /// Releases the state held for a disconnected connection.
    ///
    /// The event itself still travels to the host; forwarding is the
    /// caller's job.
    pub fn process_disconnection_complete(&self, event: &[u8]) {
        let view = match DisconnectionComplete::new(event) {
            Ok(view) => view,
            Err(_) => {
                error!("[acl] DISCONNECTION_COMPLETE event too short, not processing");
                return;
            }
        };
        let handle = view.handle();

        self.with_state(|state| {
            let Some(index) = state.connection_index(handle) else {
                warn!(
                    "[acl] viewed disconnect (reason {:x}) for untracked connection {:x}",
                    view.reason(),
                    handle.raw()
                );
                return;
            };

            if view.status().to_result().is_ok() {
                info!(
                    "[acl] viewed disconnect (reason {:x}) for connection {:x}",
                    view.reason(),
                    handle.raw()
                );
                let pending = state.connections[index].num_pending_packets;
                if pending > 0 {
                    // Those packets will never show up in a completed
                    // packets event; their credits are taken back here.
                    warn!(
                        "[acl] connection {:x} disconnecting with {} packets in flight, releasing credits",
                        handle.raw(),
                        pending
                    );
                    let transport = state.connections[index].transport;
                    state.credits(transport).mark_completed(pending);
                }
                self.l2cap.handle_disconnection_complete(handle);
                state.connections[index].close();
            } else if state.connections[index].num_pending_packets > 0 {
                warn!(
                    "[acl] failed disconnect for connection {:x} with packets in flight, credits stay reserved",
                    handle.raw()
                );
            }
        });
    }

    /// Whether the proxy obtained any transmit credits on `transport`.
    pub fn has_send_acl_capability(&self, transport: Transport) -> bool {
        self.with_state(|state| state.credits(transport).has_send_capability())
    }

    /// Number of ACL packets the proxy could send on `transport` right
    /// now.
    pub fn num_free_acl_packets(&self, transport: Transport) -> u16 {
        self.with_state(|state| state.credits(transport).available())
    }

    /// Reserves one transmit slot on `transport`.
    ///
    /// Returns `None` when no credit is available. The returned credit
    /// restores the slot when dropped unsent.
    pub fn reserve_send_credit(&self, transport: Transport) -> Option<SendCredit<'_, 'd, M>> {
        self.with_state(|state| state.credits(transport).mark_pending(1).ok())?;
        Some(SendCredit {
            channel: self,
            transport,
            used: false,
        })
    }

    /// Sends an ACL packet to the controller, spending `credit`.
    ///
    /// The packet's connection must be tracked and must run on the
    /// transport the credit was drawn on; otherwise the packet is not
    /// sent and the credit returns to its pool when dropped.
    pub fn send_acl(&self, acl: &[u8], mut credit: SendCredit<'_, 'd, M>) -> Result<(), Error> {
        let Ok((packet, _)) = AclPacket::from_hci_bytes(acl) else {
            error!("[acl] invalid ACL packet provided, will not send");
            return Err(Error::InvalidValue);
        };
        let handle = packet.handle();

        self.with_state(|state| {
            let Some(index) = state.connection_index(handle) else {
                error!("[acl] tried to send on untracked connection {:x}", handle.raw());
                return Err(Error::NotFound);
            };
            let connection = &mut state.connections[index];
            if connection.transport != credit.transport {
                warn!("[acl] credit drawn on the wrong transport, will not send");
                return Err(Error::WrongTransport);
            }
            connection.num_pending_packets += 1;
            Ok(())
        })?;

        credit.mark_used();
        self.transport.send_acl_to_controller(acl);
        Ok(())
    }

    /// Runs `f` on the signaling channel of `handle` if `local_cid` is
    /// that channel's fixed id.
    pub fn with_signaling_channel<F, R>(&self, handle: ConnHandle, local_cid: u16, f: F) -> Option<R>
    where
        F: FnOnce(&SignalingChannel) -> R,
    {
        self.with_state(|state| {
            let index = state.connection_index(handle)?;
            let signaling = state.connections[index].signaling.as_ref()?;
            if signaling.local_cid() != local_cid {
                return None;
            }
            Some(f(signaling))
        })
    }

    /// Classifies one ACL data frame and consumes it if it belongs to a
    /// proxy-owned L2CAP channel.
    ///
    /// Once the proxy has consumed the first fragment of a PDU it also
    /// consumes every following fragment of that PDU, even on error;
    /// anything else would leave the receiver facing a continuation with
    /// no beginning.
    pub fn handle_acl_data(&self, direction: Direction, acl: &[u8]) -> Disposition {
        let Ok((packet, _)) = AclPacket::from_hci_bytes(acl) else {
            warn!("[acl] malformed ACL frame {}, passing on", direction.as_str());
            return Disposition::Unhandled;
        };
        let handle = packet.handle();
        let boundary = packet.boundary_flag();
        let payload = packet.data();
        trace!(
            "[acl] {} byte frame {} on connection {:x}",
            payload.len(),
            direction.as_str(),
            handle.raw()
        );

        let decision = self.with_state(|state| {
            let Some(index) = state.connection_index(handle) else {
                return RxDecision::Pass;
            };
            let connection = &mut state.connections[index];

            match boundary {
                AclPacketBoundary::Continuing => {
                    // Without an active recombination these are fragments
                    // of a PDU the proxy chose not to own. Let them pass.
                    if !connection.recombination_active(direction) {
                        return RxDecision::Pass;
                    }
                }
                AclPacketBoundary::FirstNonFlushable | AclPacketBoundary::FirstFlushable => {
                    if connection.recombination_active(direction) {
                        warn!(
                            "[acl] first packet {} on connection {:x} while recombination is active, \
                             dropping previous partially recombined PDU",
                            direction.as_str(),
                            handle.raw()
                        );
                        connection.end_recombination(direction);
                    }

                    // The full L2CAP header is required up front: its
                    // length field sizes the recombination and its channel
                    // id decides whether the proxy owns this PDU at all.
                    let Ok((header, _)) = L2capHeader::decode(payload) else {
                        error!(
                            "[acl] packet {} on connection {:x} does not hold a full L2CAP header, \
                             passing on",
                            direction.as_str(),
                            handle.raw()
                        );
                        return RxDecision::Pass;
                    };

                    let Some(channel) = self.find_channel(direction, handle, header.channel) else {
                        return RxDecision::Pass;
                    };

                    let frame_length = header.frame_length();
                    if frame_length < payload.len() {
                        error!(
                            "[acl] packet {} on connection {:x} carries {} bytes but its L2CAP frame \
                             is only {}, dropping",
                            direction.as_str(),
                            handle.raw(),
                            payload.len(),
                            frame_length
                        );
                        return RxDecision::Consume;
                    }
                    if frame_length == payload.len() {
                        return RxDecision::DeliverInline(payload);
                    }

                    // First fragment of a fragmented PDU.
                    let Some(allocator) = channel.rx_allocator() else {
                        error!(
                            "[acl] channel {:x} has no rx allocator, cannot recombine, passing on",
                            header.channel
                        );
                        return RxDecision::Pass;
                    };
                    if let Err(e) = connection.start_recombination(direction, allocator, frame_length) {
                        error!(
                            "[acl] cannot start recombination for channel {:x}: {:?}, passing on",
                            header.channel, e
                        );
                        return RxDecision::Pass;
                    }
                }
                AclPacketBoundary::Complete => {
                    error!(
                        "[acl] packet {} on connection {:x} has unexpected boundary flag",
                        direction.as_str(),
                        handle.raw()
                    );
                    return RxDecision::Pass;
                }
            }

            // Reaching here means the frame is a fragment of a PDU the
            // proxy owns: append it.
            match connection.recombine_fragment(direction, payload) {
                Err(_) => {
                    // The first fragment bounds the buffer by
                    // construction, only a continuation can overrun it.
                    debug_assert!(matches!(boundary, AclPacketBoundary::Continuing));
                    error!(
                        "[acl] continuation {} on connection {:x} overruns the announced PDU length, \
                         dropping entire PDU",
                        direction.as_str(),
                        handle.raw()
                    );
                    connection.end_recombination(direction);
                    RxDecision::Consume
                }
                Ok(None) => RxDecision::Consume,
                Ok(Some(pdu)) => {
                    debug!(
                        "[acl] recombined {} byte PDU on connection {:x}",
                        pdu.len(),
                        handle.raw()
                    );
                    RxDecision::DeliverRecombined(pdu)
                }
            }
        });

        match decision {
            RxDecision::Pass => Disposition::Unhandled,
            RxDecision::Consume => Disposition::Handled,
            RxDecision::DeliverInline(pdu) => self.deliver(direction, handle, pdu, false),
            RxDecision::DeliverRecombined(pdu) => self.deliver(direction, handle, pdu.as_ref(), true),
        }
    }

    /// Hands a complete PDU to its channel. Runs outside the lock; the
    /// channel registry is consulted again because it may have changed
    /// since the frame was classified.
    fn deliver(&self, direction: Direction, handle: ConnHandle, pdu: &[u8], is_fragment: bool) -> Disposition {
        let (header, _) = unwrap!(L2capHeader::decode(pdu));

        let Some(channel) = self.find_channel(direction, handle, header.channel) else {
            // Recombination only starts for a recognized channel, so a
            // recombined PDU cannot land here; a pristine frame can and
            // may safely travel on.
            debug_assert!(!is_fragment);
            return Disposition::Unhandled;
        };

        let accepted = match direction {
            Direction::FromController => channel.handle_pdu_from_controller(pdu),
            Direction::FromHost => channel.handle_pdu_from_host(pdu),
        };

        if accepted {
            Disposition::Handled
        } else if is_fragment {
            // Passing on only the last fragment would present the peer
            // with a torn PDU, so the whole recombined PDU is dropped.
            error!(
                "[acl] channel {:x} rejected a recombined PDU, dropping it entirely",
                header.channel
            );
            Disposition::Handled
        } else {
            Disposition::Unhandled
        }
    }

    fn find_channel(&self, direction: Direction, handle: ConnHandle, cid: u16) -> Option<&dyn L2capChannel> {
        match direction {
            Direction::FromController => self.l2cap.find_channel_by_local_cid(handle, cid),
            Direction::FromHost => self.l2cap.find_channel_by_remote_cid(handle, cid),
        }
    }
}

/// One reserved ACL transmit slot.
///
/// Move-only: handing the credit to [`AclDataChannel::send_acl`] spends
/// it, dropping it unspent returns the slot to the pool it came from.
pub struct SendCredit<'a, 'd, M: RawMutex> {
    channel: &'a AclDataChannel<'d, M>,
    transport: Transport,
    used: bool,
}

impl<M: RawMutex> SendCredit<'_, '_, M> {
    /// The transport this credit was drawn on.
    pub fn transport(&self) -> Transport {
        self.transport
    }

    fn mark_used(&mut self) {
        self.used = true;
    }
}

impl<M: RawMutex> Drop for SendCredit<'_, '_, M> {
    fn drop(&mut self) {
        if !self.used {
            let transport = self.transport;
            self.channel
                .with_state(|state| state.credits(transport).mark_completed(1));
        }
    }
}
