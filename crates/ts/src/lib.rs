//! Transport Stream (TS) packet primitives
//!
//! This crate provides the fixed-size 188-byte packet type moved around by the
//! `tsp` pipeline, together with the few header accessors plugins need (PID,
//! continuity counter, payload unit start) and a sync byte search used to
//! recover alignment when reading raw streams.
//!
//! Payload decoding (sections, tables, descriptors) is not part of this crate.

pub mod error;
pub mod packet;

pub use error::TsError;
pub use packet::{
    PACKET_SIZE, PID_MAX, PID_NULL, PID_PAT, SYNC_BYTE, TsPacket, find_sync_byte, parse_pid,
};

/// Result type for TS packet operations
pub type Result<T> = std::result::Result<T, TsError>;
