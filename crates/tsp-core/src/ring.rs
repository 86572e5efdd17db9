//! # Shared Packet Ring
//!
//! A fixed-capacity arena of packet slots plus one metadata record per slot.
//! The arena is allocated once when the pipeline is assembled and shared by
//! every stage thread.
//!
//! The ring itself holds no ownership state. At any instant each stage owns
//! one contiguous (cyclic) range of slots, tracked by its link, and the ranges
//! of all stages partition the ring. A stage reaches the slots it owns only
//! through a [`RangeGrant`], which is created by its link, cannot be cloned,
//! and is consumed when the range is handed to the next stage.

use std::cell::UnsafeCell;

use ts::TsPacket;

use crate::PacketMetadata;

/// A contiguous, non-wrapping range of slots owned by one stage.
///
/// Grants are only created by the link layer and never overlap.
#[derive(Debug)]
pub struct RangeGrant {
    first: usize,
    len: usize,
}

impl RangeGrant {
    pub(crate) fn new(first: usize, len: usize) -> Self {
        Self { first, len }
    }

    /// Index of the first slot in the ring
    pub fn first(&self) -> usize {
        self.first
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

pub struct PacketRing {
    packets: Box<[UnsafeCell<TsPacket>]>,
    metadata: Box<[UnsafeCell<PacketMetadata>]>,
}

// SAFETY: slots are only reached through `RangeGrant`s, and the link protocol
// guarantees that live grants never overlap. Each slot is therefore accessed
// by at most one thread at a time, and the channel handoff between stages
// provides the happens-before edge for the next owner.
unsafe impl Sync for PacketRing {}

impl PacketRing {
    /// Allocate a ring of `capacity` slots, all holding dropped markers.
    pub fn new(capacity: usize) -> Self {
        let packets = (0..capacity)
            .map(|_| UnsafeCell::new(TsPacket::zeroed()))
            .collect();
        let metadata = (0..capacity)
            .map(|_| UnsafeCell::new(PacketMetadata::default()))
            .collect();
        Self { packets, metadata }
    }

    pub fn capacity(&self) -> usize {
        self.packets.len()
    }

    /// Borrow the packets and metadata covered by `grant`.
    ///
    /// The returned slices live as long as the mutable borrow of the grant, so
    /// a stage cannot keep them after handing the grant back to its link.
    pub fn slices<'a>(
        &'a self,
        grant: &'a mut RangeGrant,
    ) -> (&'a mut [TsPacket], &'a mut [PacketMetadata]) {
        assert!(
            grant.first + grant.len <= self.capacity(),
            "grant {}+{} exceeds ring capacity {}",
            grant.first,
            grant.len,
            self.capacity()
        );
        // SAFETY: bounds checked above; `UnsafeCell<T>` has the same layout as
        // `T`; the grant is exclusive to the calling stage (see `Sync` impl).
        unsafe {
            let packets = std::slice::from_raw_parts_mut(
                UnsafeCell::raw_get(self.packets.as_ptr().add(grant.first)),
                grant.len,
            );
            let metadata = std::slice::from_raw_parts_mut(
                UnsafeCell::raw_get(self.metadata.as_ptr().add(grant.first)),
                grant.len,
            );
            (packets, metadata)
        }
    }
}

impl std::fmt::Debug for PacketRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketRing")
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_ring_is_all_dropped() {
        let ring = PacketRing::new(8);
        let mut grant = RangeGrant::new(0, 8);
        let (packets, metadata) = ring.slices(&mut grant);
        assert_eq!(packets.len(), 8);
        assert_eq!(metadata.len(), 8);
        assert!(packets.iter().all(|p| p.is_dropped()));
    }

    #[test]
    fn test_disjoint_grants_see_their_own_slots() {
        let ring = PacketRing::new(6);
        let mut head = RangeGrant::new(0, 3);
        let mut tail = RangeGrant::new(3, 3);

        {
            let (packets, metadata) = ring.slices(&mut head);
            for (i, packet) in packets.iter_mut().enumerate() {
                *packet = TsPacket::null();
                packet.set_continuity_counter(i as u8);
                metadata[i].set_label(1);
            }
        }

        let (packets, metadata) = ring.slices(&mut tail);
        assert!(packets.iter().all(|p| p.is_dropped()));
        assert!(metadata.iter().all(|m| !m.has_any_label()));

        let (packets, metadata) = ring.slices(&mut head);
        assert_eq!(packets[2].continuity_counter(), 2);
        assert!(metadata[0].has_label(1));
    }

    #[test]
    #[should_panic(expected = "exceeds ring capacity")]
    fn test_grant_past_end_panics() {
        let ring = PacketRing::new(4);
        let mut grant = RangeGrant::new(2, 3);
        let _ = ring.slices(&mut grant);
    }
}
