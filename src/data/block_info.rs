//! Double-buffered validity and blanking window over heap metadata.
//!
//! A consuming stage keeps the metadata of the block it is working on ("current")
//! next to that of the block before it ("previous"). Runs of heaps that straddle the
//! block boundary can then be judged without going back to the ring buffer.
//!
//! Heaps are addressed by absolute index into the `2 x K` window: `0..K` is the
//! previous block, `K..2K` the current one.

use crate::data::heap::{HeapHeader, HeapIndexEntry};

/// Blanking asserted (or scan not started) somewhere in the run, or the run's
/// last heap closes an interval.
pub const BLANKED: u8 = 0x1;
/// The run's last heap closes an interval.
pub const INTERVAL_END: u8 = 0x2;
/// Switching/calibration phase changes between two adjacent heaps of the run.
pub const PHASE_CHANGE: u8 = 0x4;

/// Sliding `2 x K` window of heap index entries and headers.
///
/// The two halves are fixed-capacity arenas; [`BlockInfoCache::input`] swaps which
/// arena is "current" and overwrites the other one in place.
#[derive(Debug, Clone)]
pub struct BlockInfoCache {
    heaps_per_block: usize,
    index: [Vec<HeapIndexEntry>; 2],
    headers: [Vec<HeapHeader>; 2],
    current: usize,
    blocks_loaded: u64,
}

impl BlockInfoCache {
    /// Empty window for blocks of `heaps_per_block` heaps. Every slot starts invalid.
    pub fn new(heaps_per_block: usize) -> Self {
        Self {
            heaps_per_block,
            index: [
                vec![HeapIndexEntry::default(); heaps_per_block],
                vec![HeapIndexEntry::default(); heaps_per_block],
            ],
            headers: [
                vec![HeapHeader::default(); heaps_per_block],
                vec![HeapHeader::default(); heaps_per_block],
            ],
            current: 0,
            blocks_loaded: 0,
        }
    }

    /// Heaps per block (K).
    pub fn heaps_per_block(&self) -> usize {
        self.heaps_per_block
    }

    /// Window length (2K).
    pub fn len(&self) -> usize {
        2 * self.heaps_per_block
    }

    /// True when K is zero.
    pub fn is_empty(&self) -> bool {
        self.heaps_per_block == 0
    }

    /// Blocks loaded since construction.
    pub fn blocks_loaded(&self) -> u64 {
        self.blocks_loaded
    }

    /// Shift the current block into the previous half and load a new block.
    ///
    /// Entries beyond K are ignored; missing entries are stored as invalid heaps.
    pub fn input(&mut self, headers: &[HeapHeader], index: &[HeapIndexEntry]) {
        self.current ^= 1;
        let slot = self.current;
        for (i, dst) in self.index[slot].iter_mut().enumerate() {
            *dst = index.get(i).copied().unwrap_or_default();
        }
        for (i, dst) in self.headers[slot].iter_mut().enumerate() {
            *dst = headers.get(i).copied().unwrap_or_default();
        }
        self.blocks_loaded += 1;
    }

    fn locate(&self, i: usize) -> Option<(usize, usize)> {
        let k = self.heaps_per_block;
        if i < k {
            Some((self.current ^ 1, i))
        } else if i < 2 * k {
            Some((self.current, i - k))
        } else {
            None
        }
    }

    fn header(&self, i: usize) -> Option<&HeapHeader> {
        self.locate(i).map(|(arena, j)| &self.headers[arena][j])
    }

    fn entry(&self, i: usize) -> Option<&HeapIndexEntry> {
        self.locate(i).map(|(arena, j)| &self.index[arena][j])
    }

    /// True only if every heap in `[start, start + count)` is valid.
    ///
    /// Empty runs and runs reaching outside the window are not valid.
    pub fn is_valid(&self, start: usize, count: usize) -> bool {
        if count == 0 {
            return false;
        }
        let Some(end) = start.checked_add(count) else {
            return false;
        };
        (start..end).all(|i| self.entry(i).is_some_and(HeapIndexEntry::is_valid))
    }

    /// Blanking flags for `[start, start + count)`, a combination of [`BLANKED`],
    /// [`INTERVAL_END`] and [`PHASE_CHANGE`].
    ///
    /// Heaps outside the window count as blanked.
    pub fn is_blanked(&self, start: usize, count: usize) -> u8 {
        if count == 0 {
            return 0;
        }
        let end = start.saturating_add(count);
        let mut flags = 0u8;
        let mut previous_phase: Option<u32> = None;

        for i in start..end {
            let Some(header) = self.header(i) else {
                flags |= BLANKED;
                previous_phase = None;
                continue;
            };
            if header.is_blanking() {
                flags |= BLANKED;
            }
            let phase = header.phase();
            if previous_phase.is_some_and(|p| p != phase) {
                flags |= PHASE_CHANGE;
            }
            previous_phase = Some(phase);
        }

        if self.header(end - 1).is_some_and(HeapHeader::is_interval_end) {
            flags |= BLANKED | INTERVAL_END;
        }
        flags
    }

    /// First heap in the run with neither blanking nor scan-not-started set.
    pub fn first_unblanked(&self, start: usize, count: usize) -> Option<usize> {
        (start..start.saturating_add(count))
            .find(|&i| self.header(i).is_some_and(|h| !h.is_blanking()))
    }

    /// Status word of heap `i`, if `i` is inside the window.
    pub fn status(&self, i: usize) -> Option<u32> {
        self.header(i).map(|h| h.status)
    }

    /// Receipt MJD of heap `i`, if `i` is inside the window.
    pub fn mjd(&self, i: usize) -> Option<f64> {
        self.entry(i).map(|e| e.mjd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::heap::status;

    const K: usize = 4;

    fn block(mjd0: f64, valid: [bool; K], statuses: [u32; K]) -> (Vec<HeapHeader>, Vec<HeapIndexEntry>) {
        let headers = statuses
            .iter()
            .enumerate()
            .map(|(i, s)| HeapHeader::new(i as u64, *s))
            .collect();
        let index = valid
            .iter()
            .enumerate()
            .map(|(i, v)| HeapIndexEntry::new(mjd0 + i as f64, *v))
            .collect();
        (headers, index)
    }

    #[test]
    fn new_cache_is_all_invalid() {
        let cache = BlockInfoCache::new(K);
        assert_eq!(cache.len(), 2 * K);
        assert!(!cache.is_valid(0, 1));
        assert!(!cache.is_valid(K, K));
    }

    #[test]
    fn input_shifts_current_to_previous() {
        let mut cache = BlockInfoCache::new(K);
        let (ha, ia) = block(100.0, [true; K], [0; K]);
        let (hb, ib) = block(200.0, [true; K], [1; K]);
        cache.input(&ha, &ia);
        cache.input(&hb, &ib);

        assert_eq!(cache.mjd(0), Some(100.0));
        assert_eq!(cache.mjd(K - 1), Some(103.0));
        assert_eq!(cache.mjd(K), Some(200.0));
        assert_eq!(cache.status(K + 2), Some(1));
        assert_eq!(cache.status(1), Some(0));
        assert_eq!(cache.blocks_loaded(), 2);

        let (hc, ic) = block(300.0, [true; K], [2; K]);
        cache.input(&hc, &ic);
        assert_eq!(cache.mjd(0), Some(200.0));
        assert_eq!(cache.mjd(K), Some(300.0));
    }

    #[test]
    fn boundary_spanning_queries_read_both_halves() {
        let mut cache = BlockInfoCache::new(K);
        let (ha, ia) = block(0.0, [true, true, true, false], [0; K]);
        let (hb, ib) = block(10.0, [true; K], [0; K]);
        cache.input(&ha, &ia);
        cache.input(&hb, &ib);

        assert!(!cache.is_valid(2, 4));
        assert!(cache.is_valid(0, 3));
        assert!(cache.is_valid(K, K));
        assert!(cache.is_valid(K + 3, 1));
    }

    #[test]
    fn is_valid_fails_closed() {
        let mut cache = BlockInfoCache::new(K);
        let (h, i) = block(0.0, [true, false, true, true], [0; K]);
        cache.input(&h, &i);
        assert!(cache.is_valid(K, 1));
        assert!(!cache.is_valid(K, 2));
        assert!(cache.is_valid(K + 2, 2));
        assert!(!cache.is_valid(K + 2, 3));
        assert!(!cache.is_valid(K, 0));
        assert!(!cache.is_valid(usize::MAX, 2));
    }

    #[test]
    fn short_input_pads_with_invalid_heaps() {
        let mut cache = BlockInfoCache::new(K);
        let (h, i) = block(0.0, [true; K], [0; K]);
        cache.input(&h[..2], &i[..2]);
        assert!(cache.is_valid(K, 2));
        assert!(!cache.is_valid(K + 2, 1));
        assert_eq!(cache.status(K + 3), Some(0));
    }

    #[test]
    fn blanking_and_scan_not_started_set_bit_one() {
        let mut cache = BlockInfoCache::new(K);
        let (h, i) = block(0.0, [true; K], [0, status::BLANKING, 0, status::SCAN_NOT_STARTED]);
        cache.input(&h, &i);
        assert_eq!(cache.is_blanked(K, 1), 0);
        assert_eq!(cache.is_blanked(K, 2), BLANKED);
        assert_eq!(cache.is_blanked(K + 2, 2), BLANKED);
        assert_eq!(cache.first_unblanked(K + 1, 3), Some(K + 2));
    }

    #[test]
    fn interval_end_only_counts_on_terminal_heap() {
        let mut cache = BlockInfoCache::new(K);
        let (h, i) = block(0.0, [true; K], [0, status::INTERVAL_END, 0, status::INTERVAL_END]);
        cache.input(&h, &i);
        assert_eq!(cache.is_blanked(K, 2), BLANKED | INTERVAL_END);
        assert_eq!(cache.is_blanked(K, 3), 0);
        assert_eq!(cache.is_blanked(K + 2, 2), BLANKED | INTERVAL_END);
    }

    #[test]
    fn phase_change_between_adjacent_heaps() {
        let mut cache = BlockInfoCache::new(K);
        let (ha, ia) = block(0.0, [true; K], [1, 1, 1, 1]);
        let (hb, ib) = block(0.0, [true; K], [1, 1, 2, 2]);
        cache.input(&ha, &ia);
        cache.input(&hb, &ib);

        assert_eq!(cache.is_blanked(0, 6), 0);
        assert_eq!(cache.is_blanked(K + 1, 2), PHASE_CHANGE);
        assert_eq!(cache.is_blanked(K + 2, 2), 0);
        // non-phase bits do not count as a phase change
        let (hc, ic) = block(0.0, [true; K], [3, 3 | status::INTERVAL_END, 3, 3]);
        cache.input(&hc, &ic);
        assert_eq!(cache.is_blanked(K, 3) & PHASE_CHANGE, 0);
        assert_eq!(cache.is_blanked(K - 1, 2), PHASE_CHANGE);
    }

    #[test]
    fn out_of_range_accessors_return_none() {
        let cache = BlockInfoCache::new(K);
        assert_eq!(cache.status(2 * K), None);
        assert_eq!(cache.mjd(2 * K), None);
        assert_eq!(cache.is_blanked(2 * K - 1, 2) & BLANKED, BLANKED);
    }
}
