//! Double-buffered history snapshot handoff
//!
//! After rendering, a program may publish a pack of history entries
//! (fixed-stride records the engine emits for visualization). The renderer
//! writes into the pack that is not currently advertised, guarded by a
//! per-pack lock word, then advertises it through the program record's
//! history index and bumps the epoch. Readers poll the epoch and copy the
//! advertised pack under the same lock. Neither side ever waits: a writer
//! that finds the pack locked drops that snapshot, a reader retries on its
//! next poll.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use super::double_buffer::{DoubleBuffer, FlipIndex};
use super::program::{ProgramField, SharedProgramState};

/// Words per history entry
pub const HISTORY_STRIDE: usize = 20;

/// Entries per pack
pub const HISTORY_CAPACITY: usize = 512;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// One pack of history entries
pub struct HistoryPack {
    lock: AtomicU32,
    count: AtomicU32,
    entries: Box<[AtomicU32]>,
}

impl HistoryPack {
    pub fn new() -> Self {
        Self {
            lock: AtomicU32::new(UNLOCKED),
            count: AtomicU32::new(0),
            entries: (0..HISTORY_CAPACITY * HISTORY_STRIDE)
                .map(|_| AtomicU32::new(0))
                .collect(),
        }
    }

    #[inline]
    fn try_lock(&self) -> bool {
        self.lock
            .compare_exchange(UNLOCKED, LOCKED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    fn unlock(&self) {
        self.lock.store(UNLOCKED, Ordering::Release);
    }

    /// Number of entries currently stored
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire) as usize
    }

    /// Mark empty under the lock; false if a reader holds it
    fn clear(&self) -> bool {
        if !self.try_lock() {
            return false;
        }
        self.count.store(0, Ordering::Relaxed);
        self.unlock();
        true
    }
}

impl Default for HistoryPack {
    fn default() -> Self {
        Self::new()
    }
}

/// Flip index stored in the program record; every flip bumps the epoch
pub struct ProgramHistoryIndex {
    state: Arc<SharedProgramState>,
}

impl FlipIndex for ProgramHistoryIndex {
    fn load(&self) -> usize {
        (self.state.history_index() & 1) as usize
    }

    fn store(&self, index: usize) {
        self.state
            .store_u32(ProgramField::HistoryPackIndex, (index & 1) as u32);
        self.state
            .slot(ProgramField::HistoryPackEpoch)
            .fetch_add(1, Ordering::AcqRel);
    }
}

/// Both history packs of a program plus its advertised index
pub struct HistoryExchange {
    packs: DoubleBuffer<HistoryPack, ProgramHistoryIndex>,
}

impl HistoryExchange {
    pub fn new(state: Arc<SharedProgramState>) -> Self {
        Self {
            packs: DoubleBuffer::with_index(
                HistoryPack::new(),
                HistoryPack::new(),
                ProgramHistoryIndex { state },
            ),
        }
    }

    /// Publish a snapshot of `words` (whole entries only)
    ///
    /// Returns false if the snapshot was empty or the target pack was busy.
    /// Snapshots larger than the pack capacity are truncated.
    pub fn publish(&self, words: &[u32]) -> bool {
        let entries = (words.len() / HISTORY_STRIDE).min(HISTORY_CAPACITY);
        if entries == 0 {
            return false;
        }

        let pack = self.packs.inactive();
        if !pack.try_lock() {
            return false;
        }
        pack.count.store(entries as u32, Ordering::Relaxed);
        for (slot, &word) in pack.entries.iter().zip(&words[..entries * HISTORY_STRIDE]) {
            slot.store(word, Ordering::Relaxed);
        }
        pack.unlock();

        self.packs.flip();
        true
    }

    /// Empty both packs (on entering Start)
    ///
    /// A pack a reader holds at that instant keeps its entries; returns
    /// false in that case.
    pub fn clear(&self) -> bool {
        let mut cleared = true;
        for pack in self.packs.both() {
            cleared &= pack.clear();
        }
        cleared
    }

    /// Epoch of the most recent publish
    pub fn epoch(&self) -> u32 {
        self.packs.index().state.history_epoch()
    }

    /// Copy the advertised pack into `out`
    ///
    /// Returns the epoch the copy belongs to, or None if the pack was
    /// locked by the writer at that instant.
    pub fn read_latest(&self, out: &mut Vec<u32>) -> Option<u32> {
        let epoch = self.epoch();
        let pack = self.packs.active();
        if !pack.try_lock() {
            return None;
        }
        let words = pack.count() * HISTORY_STRIDE;
        out.clear();
        out.extend(pack.entries[..words].iter().map(|w| w.load(Ordering::Relaxed)));
        pack.unlock();
        Some(epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(tag: u32) -> Vec<u32> {
        (0..HISTORY_STRIDE as u32).map(|i| tag * 100 + i).collect()
    }

    #[test]
    fn test_publish_flips_and_bumps_epoch() {
        let state = Arc::new(SharedProgramState::new());
        let history = HistoryExchange::new(state.clone());

        assert!(history.publish(&entry(1)));
        assert_eq!(state.history_index(), 1);
        assert_eq!(state.history_epoch(), 1);

        let mut words = Vec::new();
        assert_eq!(history.read_latest(&mut words), Some(1));
        assert_eq!(words, entry(1));

        let mut two = entry(2);
        two.extend(entry(3));
        assert!(history.publish(&two));
        assert_eq!(state.history_index(), 0);
        assert_eq!(history.read_latest(&mut words), Some(2));
        assert_eq!(words.len(), 2 * HISTORY_STRIDE);
    }

    #[test]
    fn test_empty_snapshot_is_not_published() {
        let state = Arc::new(SharedProgramState::new());
        let history = HistoryExchange::new(state.clone());
        assert!(!history.publish(&[1, 2, 3]), "partial entry is dropped");
        assert_eq!(state.history_epoch(), 0);
    }

    #[test]
    fn test_locked_pack_drops_snapshot() {
        let state = Arc::new(SharedProgramState::new());
        let history = HistoryExchange::new(state.clone());

        assert!(history.packs.inactive().try_lock());
        assert!(!history.publish(&entry(1)));
        assert_eq!(state.history_epoch(), 0, "no flip when the pack is busy");
    }

    #[test]
    fn test_oversized_snapshot_truncates() {
        let state = Arc::new(SharedProgramState::new());
        let history = HistoryExchange::new(state);
        let words = vec![7u32; (HISTORY_CAPACITY + 10) * HISTORY_STRIDE];
        assert!(history.publish(&words));
        assert_eq!(history.packs.active().count(), HISTORY_CAPACITY);
    }

    #[test]
    fn test_clear_empties_both_packs() {
        let state = Arc::new(SharedProgramState::new());
        let history = HistoryExchange::new(state);
        history.publish(&entry(1));
        history.publish(&entry(2));
        history.clear();

        let mut words = vec![1];
        history.read_latest(&mut words);
        assert!(words.is_empty());
        assert!(history.packs.inactive().try_lock(), "clear leaves packs unlocked");
    }

    #[test]
    fn test_clear_keeps_reader_lock() {
        let state = Arc::new(SharedProgramState::new());
        let history = HistoryExchange::new(state);
        history.publish(&entry(1));

        // A reader is mid-copy on the advertised pack
        let held = history.packs.active();
        assert!(held.try_lock());
        assert!(!history.clear(), "busy pack is skipped");
        assert!(!held.try_lock(), "reader still owns the lock");
        assert_eq!(held.count(), 1, "busy pack keeps its entries");
        assert_eq!(history.packs.inactive().count(), 0);

        held.unlock();
        assert!(history.clear());
        assert_eq!(history.packs.active().count(), 0);
    }
}
