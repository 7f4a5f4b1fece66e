/// Chains of iterations waiting on the same cache line.
///
/// Entries are indexed by iteration number. An entry records which word of the line the iteration wants and
/// links to the next iteration sharing the line, so a single response can be fanned out to every sharer in
/// iteration order.
pub struct OffsetTable {
    entries: Vec<Entry>,
    live: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct Entry {
    valid: bool,
    wid: usize,
    next: Option<usize>,
}

impl OffsetTable {
    pub fn new(num_tile_elements: usize) -> Self {
        Self {
            entries: vec![Entry::default(); num_tile_elements],
            live: 0,
        }
    }

    /// Record that iteration `itr` waits on word `wid`, appending it after `prev` if the line is already
    /// awaited.
    pub fn insert(&mut self, itr: usize, wid: usize, prev: Option<usize>) {
        assert!(itr < self.entries.len(), "OT: iteration {itr} out of bounds");
        assert!(!self.entries[itr].valid, "OT: iteration {itr} inserted twice");
        if let Some(prev) = prev {
            let p = &mut self.entries[prev];
            assert!(p.valid && p.next.is_none(), "OT: {prev} is not the tail of a chain");
            p.next = Some(itr);
        }
        self.entries[itr] = Entry {
            valid: true,
            wid,
            next: None,
        };
        self.live += 1;
    }

    /// Consume the chain starting at `first`, returning `(iteration, word)` pairs in chain order.
    pub fn drain(&mut self, first: usize) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        let mut cursor = Some(first);
        while let Some(itr) = cursor {
            let entry = &mut self.entries[itr];
            assert!(entry.valid, "OT: draining invalid entry {itr} (chain from {first})");
            entry.valid = false;
            out.push((itr, entry.wid));
            cursor = entry.next.take();
        }
        self.live -= out.len();
        out
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Prepare for a new instruction. The previous one must have consumed every chain.
    pub fn check_reset(&self) {
        if let Some(itr) = self.entries.iter().position(|e| e.valid) {
            panic!("OT: entry {itr} still valid at reset ({} live)", self.live);
        }
        assert_eq!(self.live, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chains_drain_in_order() {
        let mut ot = OffsetTable::new(8);
        ot.insert(0, 0, None);
        ot.insert(1, 5, Some(0));
        ot.insert(2, 0, None);
        ot.insert(3, 5, Some(1));

        assert_eq!(ot.drain(0), [(0, 0), (1, 5), (3, 5)]);
        assert!(!ot.is_empty());
        assert_eq!(ot.drain(2), [(2, 0)]);
        ot.check_reset();
    }

    #[test]
    #[should_panic(expected = "draining invalid entry")]
    fn drain_twice() {
        let mut ot = OffsetTable::new(4);
        ot.insert(1, 0, None);
        ot.drain(1);
        ot.drain(1);
    }

    #[test]
    #[should_panic(expected = "still valid at reset")]
    fn reset_non_empty() {
        let mut ot = OffsetTable::new(4);
        ot.insert(2, 0, None);
        ot.check_reset();
    }

    #[test]
    #[should_panic(expected = "inserted twice")]
    fn insert_into_valid_slot() {
        let mut ot = OffsetTable::new(4);
        ot.insert(2, 0, None);
        ot.insert(2, 1, None);
    }
}
