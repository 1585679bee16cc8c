/// Nonce allocator - disjoint nonce prefixes per session per template
///
/// With nonce editing enabled every live session owns a unique `bits`-wide
/// prefix of the 32-bit nonce for the current template. The prefix is written
/// into the job blob; miners in "nicehash" mode keep the top byte fixed, so
/// a reported nonce outside the session's range was never searched for it.

use std::collections::{BTreeSet, HashMap};

use thiserror::Error;

use crate::session::SessionId;

/// Size of the nonce field inside the hashing blob.
pub const NONCE_SIZE: usize = 4;

pub const DEFAULT_PREFIX_BITS: u8 = 8;
/// nicehash miners only hold the top blob byte of the nonce fixed.
pub const MAX_PREFIX_BITS: u8 = 8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocatorError {
    #[error("all {0} nonce partitions are in use")]
    Exhausted(usize),
}

/// One session's slice of the nonce space: every nonce whose top `bits`
/// bits equal `prefix`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NoncePartition {
    prefix: u32,
    bits: u8,
}

impl NoncePartition {
    pub fn new(prefix: u32, bits: u8) -> Self {
        debug_assert!((1..=MAX_PREFIX_BITS).contains(&bits));
        debug_assert!(u64::from(prefix) < (1u64 << bits));
        Self { prefix, bits }
    }

    pub fn prefix(&self) -> u32 {
        self.prefix
    }

    fn shift(&self) -> u32 {
        32 - u32::from(self.bits)
    }

    /// First nonce of the partition.
    pub fn start(&self) -> u32 {
        self.prefix << self.shift()
    }

    /// One past the last nonce (exclusive, may be 2^32).
    pub fn end(&self) -> u64 {
        u64::from(self.start()) + (1u64 << self.shift())
    }

    pub fn low_mask(&self) -> u32 {
        (1u32 << self.shift()) - 1
    }

    pub fn contains(&self, nonce: u32) -> bool {
        nonce & !self.low_mask() == self.start()
    }

    /// Rebuild the upstream nonce from what the miner reported.
    pub fn combine(&self, reported: u32) -> u32 {
        self.start() | (reported & self.low_mask())
    }

    pub fn overlaps(&self, other: &NoncePartition) -> bool {
        u64::from(self.start()) < other.end() && u64::from(other.start()) < self.end()
    }
}

/// True nonce for a share: passthrough when the session has no partition.
pub fn reconstruct(partition: Option<NoncePartition>, reported: u32) -> u32 {
    match partition {
        Some(p) => p.combine(reported),
        None => reported,
    }
}

/// Parse a miner-reported nonce: 8 hex chars in blob byte order.
pub fn parse_nonce_hex(nonce: &str) -> Option<u32> {
    let nonce = nonce.trim();
    if nonce.len() != NONCE_SIZE * 2 {
        return None;
    }
    let mut bytes = [0u8; NONCE_SIZE];
    hex::decode_to_slice(nonce, &mut bytes).ok()?;
    Some(u32::from_le_bytes(bytes))
}

pub fn nonce_to_hex(nonce: u32) -> String {
    hex::encode(nonce.to_le_bytes())
}

/// Overwrite the nonce field of a hashing blob. Returns false if the blob is
/// too short for the offset.
pub fn write_nonce(blob: &mut [u8], offset: usize, nonce: u32) -> bool {
    let Some(end) = offset.checked_add(NONCE_SIZE) else {
        return false;
    };
    match blob.get_mut(offset..end) {
        Some(field) => {
            field.copy_from_slice(&nonce.to_le_bytes());
            true
        }
        None => false,
    }
}

/// Partition table for the current template.
///
/// Lives inside the session registry's structural lock: assignment and
/// registration happen atomically.
#[derive(Debug)]
pub struct NonceAllocator {
    enabled: bool,
    bits: u8,
    next_prefix: u32,
    released: BTreeSet<u32>,
    assigned: HashMap<SessionId, NoncePartition>,
}

impl NonceAllocator {
    pub fn new(enabled: bool, bits: u8) -> Self {
        Self {
            enabled,
            bits: bits.clamp(1, MAX_PREFIX_BITS),
            next_prefix: 0,
            released: BTreeSet::new(),
            assigned: HashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Maximum number of concurrent partitions, `None` when disabled.
    pub fn capacity(&self) -> Option<usize> {
        self.enabled.then(|| 1usize << self.bits)
    }

    /// Start a new template: drop every old partition and hand out fresh
    /// prefixes in the given (registration) order.
    pub fn begin_template<I>(&mut self, sessions: I) -> Result<(), AllocatorError>
    where
        I: IntoIterator<Item = SessionId>,
    {
        self.next_prefix = 0;
        self.released.clear();
        self.assigned.clear();

        if !self.enabled {
            return Ok(());
        }

        for id in sessions {
            self.assign(id)?;
        }
        Ok(())
    }

    /// Give `id` a partition for the current template. Mid-template joins
    /// take the next counter value, then fall back to released prefixes.
    pub fn assign(&mut self, id: SessionId) -> Result<Option<NoncePartition>, AllocatorError> {
        if !self.enabled {
            return Ok(None);
        }
        if let Some(existing) = self.assigned.get(&id) {
            return Ok(Some(*existing));
        }

        let capacity = 1u64 << self.bits;
        let prefix = if u64::from(self.next_prefix) < capacity {
            let p = self.next_prefix;
            self.next_prefix += 1;
            p
        } else if let Some(p) = self.released.pop_first() {
            p
        } else {
            return Err(AllocatorError::Exhausted(capacity as usize));
        };

        let partition = NoncePartition::new(prefix, self.bits);
        self.assigned.insert(id, partition);
        Ok(Some(partition))
    }

    pub fn release(&mut self, id: SessionId) {
        if let Some(partition) = self.assigned.remove(&id) {
            self.released.insert(partition.prefix());
        }
    }

    pub fn partition_of(&self, id: SessionId) -> Option<NoncePartition> {
        self.assigned.get(&id).copied()
    }
}
