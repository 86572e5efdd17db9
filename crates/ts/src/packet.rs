use std::fmt;

use crate::{Result, TsError};

/// Size of one transport packet in bytes
pub const PACKET_SIZE: usize = 188;

/// Sync byte found at the start of every valid packet
pub const SYNC_BYTE: u8 = 0x47;

/// PAT PID (always 0x0000)
pub const PID_PAT: u16 = 0x0000;

/// NULL PID (always 0x1FFF)
pub const PID_NULL: u16 = 0x1FFF;

/// Largest valid PID value
pub const PID_MAX: u16 = 0x1FFF;

/// A raw transport packet.
///
/// The packet is stored as its 188 wire bytes and is `Copy`, so slices of
/// packets can live in a pre-allocated buffer and be compacted in place.
///
/// A packet whose first byte is zero is a *dropped* marker: the slot is in use
/// but there is nothing to deliver. Valid packets always start with
/// [`SYNC_BYTE`], so the two states never collide.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct TsPacket(pub [u8; PACKET_SIZE]);

impl TsPacket {
    /// A packet with every byte set to zero (also a dropped marker).
    pub const fn zeroed() -> Self {
        Self([0u8; PACKET_SIZE])
    }

    /// A null packet: sync byte, PID 0x1FFF, payload only, 0xFF stuffing.
    pub fn null() -> Self {
        let mut data = [0xFFu8; PACKET_SIZE];
        data[0] = SYNC_BYTE;
        data[1] = 0x1F;
        data[2] = 0xFF;
        data[3] = 0x10;
        Self(data)
    }

    /// Build a packet from exactly 188 bytes, checking the sync byte.
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        let bytes: [u8; PACKET_SIZE] = data
            .try_into()
            .map_err(|_| TsError::InvalidPacketSize(data.len()))?;
        if bytes[0] != SYNC_BYTE {
            return Err(TsError::InvalidSyncByte(bytes[0]));
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; PACKET_SIZE] {
        &self.0
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8; PACKET_SIZE] {
        &mut self.0
    }

    /// Check the first byte against [`SYNC_BYTE`]
    pub fn has_sync(&self) -> bool {
        self.0[0] == SYNC_BYTE
    }

    /// Whether the slot holds a dropped marker (first byte zero).
    #[inline]
    pub fn is_dropped(&self) -> bool {
        self.0[0] == 0
    }

    /// Turn the slot into a dropped marker. Only the first byte is touched.
    #[inline]
    pub fn mark_dropped(&mut self) {
        self.0[0] = 0;
    }

    /// Packet Identifier
    pub fn pid(&self) -> u16 {
        parse_pid(self.0[1], self.0[2])
    }

    pub fn set_pid(&mut self, pid: u16) -> Result<()> {
        if pid > PID_MAX {
            return Err(TsError::InvalidPid(pid));
        }
        self.0[1] = (self.0[1] & 0xE0) | ((pid >> 8) as u8 & 0x1F);
        self.0[2] = pid as u8;
        Ok(())
    }

    pub fn is_null(&self) -> bool {
        self.has_sync() && self.pid() == PID_NULL
    }

    /// Payload Unit Start Indicator
    pub fn payload_unit_start(&self) -> bool {
        (self.0[1] & 0x40) != 0
    }

    pub fn continuity_counter(&self) -> u8 {
        self.0[3] & 0x0F
    }

    pub fn set_continuity_counter(&mut self, cc: u8) {
        self.0[3] = (self.0[3] & 0xF0) | (cc & 0x0F);
    }
}

impl Default for TsPacket {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl fmt::Debug for TsPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_dropped() {
            return f.write_str("TsPacket(dropped)");
        }
        f.debug_struct("TsPacket")
            .field("sync", &self.has_sync())
            .field("pid", &self.pid())
            .field("pusi", &self.payload_unit_start())
            .field("cc", &self.continuity_counter())
            .finish()
    }
}

/// Extract the 13-bit PID from the second and third header bytes
#[inline]
pub fn parse_pid(byte1: u8, byte2: u8) -> u16 {
    ((byte1 as u16 & 0x1F) << 8) | byte2 as u16
}

/// Position of the first sync byte in `data`, if any
pub fn find_sync_byte(data: &[u8]) -> Option<usize> {
    memchr::memchr(SYNC_BYTE, data)
}
