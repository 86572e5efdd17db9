//! Per-packet side-channel data.
//!
//! Every ring slot has one [`PacketMetadata`] next to its packet. Both are
//! indexed identically and change owner together, so a plugin that reorders
//! or compacts packets must move the metadata with them.

/// Number of distinct labels a packet can carry.
pub const MAX_LABELS: u32 = 32;

/// Metadata attached to one packet slot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketMetadata {
    labels: u32,
}

impl PacketMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore the state expected for a freshly received packet.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Set a label; labels outside `0..MAX_LABELS` are ignored.
    pub fn set_label(&mut self, label: u32) {
        if label < MAX_LABELS {
            self.labels |= 1u32 << label;
        }
    }

    pub fn clear_label(&mut self, label: u32) {
        if label < MAX_LABELS {
            self.labels &= !(1u32 << label);
        }
    }

    pub fn has_label(&self, label: u32) -> bool {
        label < MAX_LABELS && (self.labels & (1u32 << label)) != 0
    }

    pub fn has_any_label(&self) -> bool {
        self.labels != 0
    }

    pub fn labels(&self) -> u32 {
        self.labels
    }
}
