//! L2CAP wire types shared by the data path.

use crate::codec::{Decode, Encode, Error};

/// Fixed channel id of the BR/EDR (ACL-U) signaling channel.
pub const L2CAP_CID_ACL_U_SIGNAL: u16 = 0x0001;
/// Fixed channel id of the LE (LE-U) signaling channel.
pub const L2CAP_CID_LE_U_SIGNAL: u16 = 0x0005;

/// Basic L2CAP header carried at the start of every B-frame.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L2capHeader {
    /// Length of the PDU payload following the header.
    pub length: u16,
    /// Channel id the PDU is addressed to.
    pub channel: u16,
}

impl L2capHeader {
    /// Size of the basic header on the wire.
    pub const SIZE: usize = 4;

    /// Decodes a header from the front of `data`, returning it together
    /// with the bytes that follow it.
    ///
    /// `data` may be an ACL payload or a recombined buffer; either way
    /// the header announces how long the PDU is and which channel owns
    /// it.
    pub fn decode(data: &[u8]) -> Result<(Self, &[u8]), Error> {
        if data.len() < Self::SIZE {
            return Err(Error::InsufficientSpace);
        }
        let length = u16::decode(&data[..2])?;
        let channel = u16::decode(&data[2..])?;
        Ok((Self { length, channel }, &data[Self::SIZE..]))
    }

    /// Encodes the header into the first [`L2capHeader::SIZE`] bytes of
    /// `dest`.
    pub fn encode(&self, dest: &mut [u8]) -> Result<(), Error> {
        if dest.len() < Self::SIZE {
            return Err(Error::InsufficientSpace);
        }
        self.length.encode(&mut dest[..2])?;
        self.channel.encode(&mut dest[2..4])?;
        Ok(())
    }

    /// Total length of the L2CAP frame this header announces, header
    /// included.
    pub fn frame_length(&self) -> usize {
        Self::SIZE + self.length as usize
    }
}
