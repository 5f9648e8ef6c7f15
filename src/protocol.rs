//! Wire formats shared with the streaming server.
//!
//! Uplink: URTP datagrams, a 14-byte big-endian header followed by an
//! audio body, concatenated on the TCP stream. Downlink: an 11-byte
//! timing datagram once per second, echoing the sequence number and
//! timestamp of an uplink datagram the server has received. Both
//! directions begin every frame with the same sync byte; the protocols
//! are unidirectional per direction so this is unambiguous.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::error::NetworkError;

/// First byte of every frame in both directions.
pub const SYNC_BYTE: u8 = 0x5A;

/// Size of the URTP datagram header in bytes.
pub const URTP_HEADER_SIZE: usize = 14;

/// Size of a downlink timing datagram in bytes, sync byte included.
pub const TIMING_DATAGRAM_SIZE: usize = 11;

/// Audio coding scheme carried in byte 1 of the URTP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioCoding {
    /// Big-endian signed 16-bit mono PCM.
    PcmSigned16Bit,
    /// NICAM-like 8-bit coding with a shared 4-bit shift per sub-block.
    UnicamCompressed8Bit,
}

impl AudioCoding {
    pub fn wire_value(self) -> u8 {
        match self {
            AudioCoding::PcmSigned16Bit => 0,
            AudioCoding::UnicamCompressed8Bit => 1,
        }
    }

    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(AudioCoding::PcmSigned16Bit),
            1 => Some(AudioCoding::UnicamCompressed8Bit),
            _ => None,
        }
    }
}

/// URTP datagram header.
///
/// | Offset | Size | Field |
/// |---|---|---|
/// | 0 | 1 | Sync byte |
/// | 1 | 1 | Audio coding scheme |
/// | 2 | 2 | Sequence number |
/// | 4 | 8 | Microsecond UTC timestamp of block start |
/// | 12 | 2 | Number of body bytes |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UrtpHeader {
    pub coding: AudioCoding,
    pub sequence: u16,
    pub timestamp_us: u64,
    pub body_len: u16,
}

impl UrtpHeader {
    /// Write the header into the first `URTP_HEADER_SIZE` bytes of `buf`.
    pub fn write_to(&self, mut buf: &mut [u8]) {
        debug_assert!(buf.len() >= URTP_HEADER_SIZE);
        buf.put_u8(SYNC_BYTE);
        buf.put_u8(self.coding.wire_value());
        buf.put_u16(self.sequence);
        buf.put_u64(self.timestamp_us);
        buf.put_u16(self.body_len);
    }

    /// Parse a header from the start of `buf`.
    pub fn parse(mut buf: &[u8]) -> Result<Self, NetworkError> {
        if buf.len() < URTP_HEADER_SIZE {
            return Err(NetworkError::InvalidPacket);
        }
        if buf.get_u8() != SYNC_BYTE {
            return Err(NetworkError::InvalidPacket);
        }
        let coding = AudioCoding::from_wire(buf.get_u8()).ok_or(NetworkError::InvalidPacket)?;
        let sequence = buf.get_u16();
        let timestamp_us = buf.get_u64();
        let body_len = buf.get_u16();
        Ok(UrtpHeader {
            coding,
            sequence,
            timestamp_us,
            body_len,
        })
    }
}

/// Downlink timing datagram.
///
/// | Offset | Size | Field |
/// |---|---|---|
/// | 0 | 1 | Sync byte |
/// | 1 | 2 | Sequence number, echo of an uplink datagram |
/// | 3 | 8 | Microsecond timestamp, echo of the same datagram |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingDatagram {
    pub sequence: u16,
    pub timestamp_us: u64,
}

impl TimingDatagram {
    /// Parse the 10 bytes that follow the sync byte.
    pub fn parse_body(mut body: &[u8]) -> Result<Self, NetworkError> {
        if body.len() < TIMING_DATAGRAM_SIZE - 1 {
            return Err(NetworkError::InvalidPacket);
        }
        let sequence = body.get_u16();
        let timestamp_us = body.get_u64();
        Ok(TimingDatagram {
            sequence,
            timestamp_us,
        })
    }

    /// Encode a full timing datagram, sync byte included.
    pub fn encode(&self) -> [u8; TIMING_DATAGRAM_SIZE] {
        let mut out = [0u8; TIMING_DATAGRAM_SIZE];
        let mut buf = &mut out[..];
        buf.put_u8(SYNC_BYTE);
        buf.put_u16(self.sequence);
        buf.put_u64(self.timestamp_us);
        out
    }
}

/// Microseconds since the Unix epoch (UTC).
pub(crate) fn unix_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
