//! Bounded writer used to reassemble a fragmented PDU.

use crate::packet_pool::{Packet, RxAllocator};
use crate::pdu::Pdu;
use crate::Error;

/// Accumulates ACL fragments until a known total size has been written.
///
/// Created when the first fragment of a fragmented PDU arrives, fed every
/// following fragment, and consumed with [`RecombinationBuffer::take`]
/// once [`RecombinationBuffer::is_complete`] reports true.
pub(crate) struct RecombinationBuffer {
    packet: Packet,
    size: usize,
    written: usize,
}

impl RecombinationBuffer {
    /// Draws a buffer from `allocator` able to hold exactly `size` bytes.
    pub fn new(allocator: RxAllocator, size: usize) -> Result<Self, Error> {
        if size > allocator.mtu() {
            return Err(Error::InsufficientSpace);
        }
        let packet = allocator.alloc().ok_or(Error::OutOfMemory)?;
        Ok(Self {
            packet,
            size,
            written: 0,
        })
    }

    /// Appends `data` at the write cursor.
    pub fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        if self.written + data.len() > self.size {
            return Err(Error::InsufficientSpace);
        }
        self.packet.as_mut()[self.written..self.written + data.len()].copy_from_slice(data);
        self.written += data.len();
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.written == self.size
    }

    /// Consumes the backing buffer.
    pub fn take(self) -> Pdu {
        Pdu::new(self.packet, self.written)
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
            32,
            2,
            1,
        >::new(Quota::Shared)));
        RxAllocator::new(pool, ClientId::new(0))
    }

    #[test]
    fn fragments_accumulate_until_complete() {
        let mut buffer = RecombinationBuffer::new(allocator(), 7).unwrap();
        buffer.write(&[1, 2, 3]).unwrap();
        assert!(!buffer.is_complete());
        buffer.write(&[4, 5, 6, 7]).unwrap();
        assert!(buffer.is_complete());

        let pdu = buffer.take();
        assert_eq!(pdu.len(), 7);
        assert_eq!(pdu.as_ref(), &[1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn write_past_target_size_fails() {
        let mut buffer = RecombinationBuffer::new(allocator(), 4).unwrap();
        buffer.write(&[1, 2, 3]).unwrap();
        assert_eq!(buffer.write(&[4, 5]), Err(Error::InsufficientSpace));
        // The earlier fragments are untouched.
        buffer.write(&[4]).unwrap();
        assert!(buffer.is_complete());
    }

    #[test]
    fn empty_write_is_accepted() {
        let mut buffer = RecombinationBuffer::new(allocator(), 2).unwrap();
        buffer.write(&[]).unwrap();
        assert!(!buffer.is_complete());
    }

    #[test]
    fn target_larger_than_pool_mtu_is_rejected() {
        assert_eq!(
            RecombinationBuffer::new(allocator(), 33).err(),
            Some(Error::InsufficientSpace)
        );
    }
}
