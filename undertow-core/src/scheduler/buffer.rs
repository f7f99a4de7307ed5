//! Per-item delivery buffer.
//!
//! Chunks complete out of order, so readers must check slot occupancy
//! instead of assuming arrival order.

use bytes::Bytes;

/// Outcome of writing a chunk into the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferWrite {
    /// Slot was empty and now holds the chunk
    Stored,
    /// Slot already held identical bytes
    Duplicate,
    /// Slot already held different bytes; the original is kept
    Conflict,
    /// Index beyond the buffer
    OutOfBounds,
}

/// Fixed-length, write-once slot array for one item.
#[derive(Debug, Clone)]
pub struct DeliveryBuffer {
    slots: Vec<Option<Bytes>>,
    available: u32,
}

impl DeliveryBuffer {
    pub fn new(total_chunks: u32) -> Self {
        Self {
            slots: vec![None; total_chunks as usize],
            available: 0,
        }
    }

    pub fn total_chunks(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Stores `data` at `index` unless the slot is already occupied.
    pub fn write(&mut self, index: u32, data: Bytes) -> BufferWrite {
        let Some(slot) = self.slots.get_mut(index as usize) else {
            return BufferWrite::OutOfBounds;
        };

        match slot {
            Some(existing) if *existing == data => BufferWrite::Duplicate,
            Some(_) => BufferWrite::Conflict,
            None => {
                *slot = Some(data);
                self.available += 1;
                BufferWrite::Stored
            }
        }
    }

    pub fn get(&self, index: u32) -> Option<&Bytes> {
        self.slots.get(index as usize).and_then(Option::as_ref)
    }

    pub fn contains(&self, index: u32) -> bool {
        self.get(index).is_some()
    }

    pub fn available(&self) -> u32 {
        self.available
    }

    pub fn is_complete(&self) -> bool {
        self.available == self.total_chunks()
    }

    /// Number of leading chunks present without a gap (playable prefix).
    pub fn contiguous_prefix(&self) -> u32 {
        self.slots.iter().take_while(|slot| slot.is_some()).count() as u32
    }

    /// Indices still missing, in order.
    pub fn missing(&self) -> impl Iterator<Item = u32> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(index, _)| index as u32)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_out_of_order_writes() {
        let mut buffer = DeliveryBuffer::new(4);

        assert_eq!(buffer.write(2, Bytes::from_static(b"c")), BufferWrite::Stored);
        assert_eq!(buffer.write(0, Bytes::from_static(b"a")), BufferWrite::Stored);

        assert_eq!(buffer.available(), 2);
        assert_eq!(buffer.contiguous_prefix(), 1);
        assert_eq!(buffer.missing().collect::<Vec<_>>(), vec![1, 3]);
        assert!(!buffer.is_complete());
    }

    #[test]
    fn test_slot_is_never_overwritten() {
        let mut buffer = DeliveryBuffer::new(1);
        buffer.write(0, Bytes::from_static(b"first"));

        assert_eq!(buffer.write(0, Bytes::from_static(b"first")), BufferWrite::Duplicate);
        assert_eq!(buffer.write(0, Bytes::from_static(b"other")), BufferWrite::Conflict);
        assert_eq!(buffer.get(0), Some(&Bytes::from_static(b"first")));
        assert_eq!(buffer.available(), 1);
        assert!(buffer.is_complete());
    }

    #[test]
    fn test_out_of_bounds_write() {
        let mut buffer = DeliveryBuffer::new(2);
        assert_eq!(buffer.write(2, Bytes::new()), BufferWrite::OutOfBounds);
        assert_eq!(buffer.available(), 0);
    }

    proptest! {
        #[test]
        fn prop_first_write_wins(writes in proptest::collection::vec((0u32..8, any::<u8>()), 0..64)) {
            let mut buffer = DeliveryBuffer::new(8);
            let mut first: [Option<u8>; 8] = [None; 8];

            for (index, value) in writes {
                buffer.write(index, Bytes::from(vec![value]));
                first[index as usize].get_or_insert(value);
            }

            for (index, expected) in first.iter().enumerate() {
                let stored = buffer.get(index as u32).map(|bytes| bytes[0]);
                prop_assert_eq!(stored, *expected);
            }
            prop_assert_eq!(buffer.available() as usize, first.iter().flatten().count());
        }
    }
}
