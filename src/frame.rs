//! Wire protocol: the packed packet header, checksum rules, and the
//! incremental framing state machine the reactor drives.
//!
//! Every packet starts with an 8-byte big-endian header. `pkg_len` counts
//! the header itself, so the smallest legal packet is a bare header and the
//! `crc32` field is zero exactly when the body is empty.

use std::mem;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Error;

/// Size of the wire header in bytes.
pub const PKG_HEADER_SIZE: usize = 8;

/// Decoded wire header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Total packet length, header included.
    pub pkg_len: u16,
    /// Application-defined message code.
    pub msg_code: u16,
    /// CRC-32 of the body, zero when the body is empty.
    pub crc32: u32,
}

impl PacketHeader {
    pub fn decode(raw: &[u8; PKG_HEADER_SIZE]) -> Self {
        Self {
            pkg_len: u16::from_be_bytes([raw[0], raw[1]]),
            msg_code: u16::from_be_bytes([raw[2], raw[3]]),
            crc32: u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]),
        }
    }

    pub fn encode(&self) -> [u8; PKG_HEADER_SIZE] {
        let mut raw = [0u8; PKG_HEADER_SIZE];
        raw[0..2].copy_from_slice(&self.pkg_len.to_be_bytes());
        raw[2..4].copy_from_slice(&self.msg_code.to_be_bytes());
        raw[4..8].copy_from_slice(&self.crc32.to_be_bytes());
        raw
    }

    /// Declared body length. Zero for a bare-header packet.
    pub fn body_len(&self) -> usize {
        (self.pkg_len as usize).saturating_sub(PKG_HEADER_SIZE)
    }

    fn length_in_bounds(&self, max_packet: usize) -> bool {
        let len = self.pkg_len as usize;
        (PKG_HEADER_SIZE..=max_packet).contains(&len)
    }
}

/// CRC-32 of a body under the wire rules: an empty body checksums to zero.
pub fn checksum(body: &[u8]) -> u32 {
    if body.is_empty() {
        0
    } else {
        crc32fast::hash(body)
    }
}

/// Whether a header's checksum field matches its body. An empty body
/// requires a zero field.
pub fn verify_checksum(header: &PacketHeader, body: &[u8]) -> bool {
    header.crc32 == checksum(body)
}

/// Handle naming one occupancy of a connection slot.
///
/// The slot index is stable for the life of the engine; the generation
/// changes every time the slot is issued or recycled, so a stale token can
/// never act on the slot's next occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnToken {
    slot: u32,
    generation: u64,
}

impl ConnToken {
    pub(crate) const fn new(slot: u32, generation: u64) -> Self {
        Self { slot, generation }
    }

    pub const fn slot(&self) -> u32 {
        self.slot
    }

    pub const fn generation(&self) -> u64 {
        self.generation
    }
}

/// A complete, checksum-valid inbound message as handed to
/// [`EventHandler::on_message`](crate::EventHandler::on_message).
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The connection the message arrived on.
    pub token: ConnToken,
    /// The decoded wire header.
    pub header: PacketHeader,
    /// The message body. Empty for bare-header packets.
    pub body: Bytes,
}

/// An encoded outbound packet bound for one connection.
pub struct OutboundMessage {
    token: ConnToken,
    frame: Bytes,
}

impl OutboundMessage {
    /// Encode `body` under `msg_code` for the connection named by `token`.
    ///
    /// Fails with [`Error::PacketTooLarge`] if header plus body would
    /// overflow the u16 length field.
    pub fn new(token: ConnToken, msg_code: u16, body: &[u8]) -> Result<Self, Error> {
        let total = PKG_HEADER_SIZE + body.len();
        if total > u16::MAX as usize {
            return Err(Error::PacketTooLarge);
        }
        let header = PacketHeader {
            pkg_len: total as u16,
            msg_code,
            crc32: checksum(body),
        };
        let mut frame = BytesMut::with_capacity(total);
        frame.put_slice(&header.encode());
        frame.put_slice(body);
        Ok(Self {
            token,
            frame: frame.freeze(),
        })
    }

    pub fn token(&self) -> ConnToken {
        self.token
    }

    pub(crate) fn frame(&self) -> &Bytes {
        &self.frame
    }
}

/// Where the framer is within the current packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FramingState {
    /// Nothing of the next header read yet.
    AwaitHeader,
    /// Some, but not all, header bytes read.
    ReceivingHeader,
    /// Header complete and valid; none of the body read yet.
    AwaitBody,
    /// Some, but not all, body bytes read.
    ReceivingBody,
}

/// Outcome of feeding bytes to the framer.
#[derive(Debug)]
pub(crate) enum FrameEvent {
    /// More bytes are needed.
    Incomplete,
    /// The header declared an out-of-bounds length. The framer has resynced
    /// to await a fresh header; the connection stays open.
    BadLength { pkg_len: u16 },
    /// A full packet is ready.
    Packet(CompletePacket),
}

/// A fully framed packet, body not yet checksum-validated.
#[derive(Debug)]
pub(crate) struct CompletePacket {
    pub header: PacketHeader,
    pub body: BytesMut,
}

/// Incremental parser for one connection's inbound byte stream.
///
/// The caller reads straight into [`next_read_target`](Framer::next_read_target)
/// and reports how many bytes landed via [`advance`](Framer::advance), so
/// header bytes accumulate in a fixed scratch array and body bytes land in a
/// single heap buffer sized from the validated header. At most one body
/// buffer is alive per connection at a time.
pub(crate) struct Framer {
    state: FramingState,
    scratch: [u8; PKG_HEADER_SIZE],
    scratch_filled: usize,
    header: PacketHeader,
    body: BytesMut,
    body_filled: usize,
    max_packet: usize,
}

impl Framer {
    pub(crate) fn new(max_packet: usize) -> Self {
        Self {
            state: FramingState::AwaitHeader,
            scratch: [0u8; PKG_HEADER_SIZE],
            scratch_filled: 0,
            header: PacketHeader {
                pkg_len: 0,
                msg_code: 0,
                crc32: 0,
            },
            body: BytesMut::new(),
            body_filled: 0,
            max_packet,
        }
    }

    /// Discard any partial parse and drop the body buffer.
    pub(crate) fn reset(&mut self) {
        self.state = FramingState::AwaitHeader;
        self.scratch_filled = 0;
        self.body = BytesMut::new();
        self.body_filled = 0;
    }

    /// The buffer the next read must fill. Never empty.
    pub(crate) fn next_read_target(&mut self) -> &mut [u8] {
        match self.state {
            FramingState::AwaitHeader | FramingState::ReceivingHeader => {
                &mut self.scratch[self.scratch_filled..]
            }
            FramingState::AwaitBody | FramingState::ReceivingBody => {
                &mut self.body[self.body_filled..]
            }
        }
    }

    /// Record that `n` bytes were read into the current target.
    pub(crate) fn advance(&mut self, n: usize) -> FrameEvent {
        debug_assert!(n > 0);
        match self.state {
            FramingState::AwaitHeader | FramingState::ReceivingHeader => {
                self.scratch_filled += n;
                debug_assert!(self.scratch_filled <= PKG_HEADER_SIZE);
                if self.scratch_filled < PKG_HEADER_SIZE {
                    self.state = FramingState::ReceivingHeader;
                    return FrameEvent::Incomplete;
                }
                self.scratch_filled = 0;
                let header = PacketHeader::decode(&self.scratch);
                if !header.length_in_bounds(self.max_packet) {
                    self.state = FramingState::AwaitHeader;
                    return FrameEvent::BadLength {
                        pkg_len: header.pkg_len,
                    };
                }
                let body_len = header.body_len();
                if body_len == 0 {
                    self.state = FramingState::AwaitHeader;
                    return FrameEvent::Packet(CompletePacket {
                        header,
                        body: BytesMut::new(),
                    });
                }
                self.header = header;
                self.body = BytesMut::zeroed(body_len);
                self.body_filled = 0;
                self.state = FramingState::AwaitBody;
                FrameEvent::Incomplete
            }
            FramingState::AwaitBody | FramingState::ReceivingBody => {
                self.body_filled += n;
                debug_assert!(self.body_filled <= self.body.len());
                if self.body_filled < self.body.len() {
                    self.state = FramingState::ReceivingBody;
                    return FrameEvent::Incomplete;
                }
                let body = mem::take(&mut self.body);
                self.body_filled = 0;
                self.state = FramingState::AwaitHeader;
                FrameEvent::Packet(CompletePacket {
                    header: self.header,
                    body,
                })
            }
        }
    }
}
