//! Per-partition extent map: which physical slice backs each virtual slice.
//!
//! Extents are runs of consecutive virtual slice indices; each index in the
//! run carries its own physical slice number, so a single extent can span
//! physically scattered slices. The map keeps itself minimal: inserts append
//! to an adjacent extent and greedily merge with the successor, removes
//! split so only a tail element is ever popped. Rebuilt from the allocation
//! table at load time; never persisted directly.

use std::collections::BTreeMap;

/// A contiguous run of virtual slices starting at `start`, entry `i`
/// backed by physical slice `pslices[i]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extent {
    start: u64,
    pslices: Vec<u64>,
}

impl Extent {
    fn new(start: u64, pslice: u64) -> Self {
        Extent {
            start,
            pslices: vec![pslice],
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    /// One past the last virtual slice in the run.
    pub fn end(&self) -> u64 {
        self.start + self.pslices.len() as u64
    }

    pub fn len(&self) -> u64 {
        self.pslices.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.pslices.is_empty()
    }

    pub fn contains(&self, vslice: u64) -> bool {
        vslice >= self.start && vslice < self.end()
    }

    /// Physical slice backing `vslice`, which must be inside the run.
    pub fn lookup(&self, vslice: u64) -> u64 {
        debug_assert!(self.contains(vslice));
        self.pslices[(vslice - self.start) as usize]
    }

    fn push(&mut self, pslice: u64) {
        self.pslices.push(pslice);
    }

    fn pop(&mut self) -> u64 {
        self.pslices.pop().expect("pop from empty extent")
    }

    /// Split off the tail `[at, end)`, leaving `[start, at)` behind.
    fn split_off(&mut self, at: u64) -> Extent {
        debug_assert!(at > self.start && at < self.end());
        let tail = self.pslices.split_off((at - self.start) as usize);
        Extent {
            start: at,
            pslices: tail,
        }
    }

    /// Absorb `next`, which must begin exactly at our end.
    fn merge(&mut self, mut next: Extent) {
        debug_assert_eq!(next.start, self.end());
        self.pslices.append(&mut next.pslices);
    }
}

/// Ordered collection of disjoint, non-adjacent extents for one partition.
#[derive(Debug, Clone, Default)]
pub struct ExtentMap {
    /// Extents keyed by start vslice; BTreeMap gives the predecessor probe
    /// and in-order neighbors for merging.
    extents: BTreeMap<u64, Extent>,
    mapped: u64,
}

impl ExtentMap {
    pub fn new() -> Self {
        ExtentMap::default()
    }

    /// Total mapped virtual slices.
    pub fn mapped_slices(&self) -> u64 {
        self.mapped
    }

    pub fn extent_count(&self) -> usize {
        self.extents.len()
    }

    pub fn is_mapped(&self, vslice: u64) -> bool {
        self.lookup(vslice).is_some()
    }

    /// Physical slice backing `vslice`, if mapped.
    pub fn lookup(&self, vslice: u64) -> Option<u64> {
        let (_, extent) = self.extents.range(..=vslice).next_back()?;
        extent.contains(vslice).then(|| extent.lookup(vslice))
    }

    /// Map `vslice` to `pslice`. The index must not already be mapped; the
    /// caller checks, so a violation here is a bug.
    pub fn insert(&mut self, vslice: u64, pslice: u64) {
        // Append to the predecessor if it ends exactly at vslice, otherwise
        // start a new single-entry extent.
        let append_to = match self.extents.range(..=vslice).next_back() {
            Some((&start, extent)) => {
                assert!(!extent.contains(vslice), "vslice {} already mapped", vslice);
                (extent.end() == vslice).then_some(start)
            }
            None => None,
        };
        let start = match append_to {
            Some(start) => {
                self.extents
                    .get_mut(&start)
                    .expect("predecessor extent vanished")
                    .push(pslice);
                start
            }
            None => {
                self.extents.insert(vslice, Extent::new(vslice, pslice));
                vslice
            }
        };

        // Greedy coalescing with the successor keeps the extent count
        // minimal for later range queries.
        if let Some(next) = self.extents.remove(&(vslice + 1)) {
            self.extents
                .get_mut(&start)
                .expect("current extent vanished")
                .merge(next);
        }

        self.mapped += 1;
    }

    /// Unmap `vslice`, returning the physical slice it held. `None` if the
    /// index was not mapped.
    pub fn remove(&mut self, vslice: u64) -> Option<u64> {
        let start = {
            let (&start, extent) = self.extents.range(..=vslice).next_back()?;
            if !extent.contains(vslice) {
                return None;
            }
            start
        };

        // Split so vslice becomes the tail of its extent, then pop it.
        let tail = {
            let extent = self.extents.get_mut(&start).unwrap();
            (vslice + 1 < extent.end()).then(|| extent.split_off(vslice + 1))
        };
        if let Some(tail) = tail {
            self.extents.insert(tail.start(), tail);
        }

        let extent = self.extents.get_mut(&start).unwrap();
        let pslice = extent.pop();
        if extent.is_empty() {
            self.extents.remove(&start);
        }

        self.mapped -= 1;
        Some(pslice)
    }

    /// Remove every mapping, returning the `(vslice, pslice)` pairs. Used
    /// only for whole-partition teardown.
    pub fn drain_all(&mut self) -> Vec<(u64, u64)> {
        let mut pairs = Vec::with_capacity(self.mapped as usize);
        for (_, extent) in std::mem::take(&mut self.extents) {
            for (i, &pslice) in extent.pslices.iter().enumerate() {
                pairs.push((extent.start + i as u64, pslice));
            }
        }
        self.mapped = 0;
        pairs
    }

    /// Length of the uniform run starting at `vslice`: `(mapped, len)` where
    /// `len` slices beginning at `vslice` share the mapped/unmapped state.
    /// For an unmapped tail with no later extent, `len` is `None`.
    pub fn run_at(&self, vslice: u64) -> (bool, Option<u64>) {
        if let Some((_, extent)) = self.extents.range(..=vslice).next_back() {
            if extent.contains(vslice) {
                return (true, Some(extent.end() - vslice));
            }
        }
        match self.extents.range(vslice..).next() {
            Some((&next_start, _)) => (false, Some(next_start - vslice)),
            None => (false, None),
        }
    }

    /// `(start, end)` of every extent, in order.
    pub fn ranges(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.extents.values().map(|e| (e.start(), e.end()))
    }

    /// Every `(vslice, pslice)` mapping, in vslice order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.extents.values().flat_map(|e| {
            e.pslices
                .iter()
                .enumerate()
                .map(move |(i, &p)| (e.start + i as u64, p))
        })
    }
}
