use crate::offset_table::OffsetTable;

/// Coalescing table of one bank.
///
/// Each row gathers the distinct cache lines that fall in one DRAM row (identified by its row-group key), and
/// each line heads a chain in the engine's [`OffsetTable`] listing the iterations waiting on it.
pub struct RowTable {
    rows: Vec<Row>,
    /// Row to resume from in [`RowTable::send_next`].
    send_row: usize,
    inserted_words: u64,
    inserted_lines: u64,
    inserted_rows: u64,
}

#[derive(Debug, Clone, Copy)]
struct Line {
    addr: u64,
    first: usize,
    last: usize,
    sent: bool,
    received: bool,
}

struct Row {
    valid: bool,
    key: u64,
    lines: Vec<Option<Line>>,
    /// Next line slot to send.
    cursor: usize,
}

impl Row {
    fn new(entries_per_row: usize) -> Self {
        Self {
            valid: false,
            key: 0,
            lines: vec![None; entries_per_row],
            cursor: 0,
        }
    }

    fn send_next(&mut self) -> Option<u64> {
        while self.cursor < self.lines.len() {
            let slot = &mut self.lines[self.cursor];
            self.cursor += 1;
            if let Some(line) = slot
                && !line.sent
            {
                line.sent = true;
                return Some(line.addr);
            }
        }
        None
    }

    fn free(&mut self) {
        self.valid = false;
        self.lines.fill(None);
        self.cursor = 0;
    }
}

impl RowTable {
    pub fn new(num_rows: usize, entries_per_row: usize) -> Self {
        assert!(num_rows > 0 && entries_per_row > 0);
        Self {
            rows: (0..num_rows).map(|_| Row::new(entries_per_row)).collect(),
            send_row: 0,
            inserted_words: 0,
            inserted_lines: 0,
            inserted_rows: 0,
        }
    }

    /// Queue word `wid` of line `addr` for iteration `itr`.
    ///
    /// The line joins a pending request for it if one exists, else takes a free slot of a row already holding
    /// `key`, else opens a new row for `key`. Returns false when none of these is possible; the caller has to
    /// drain and retry.
    pub fn insert(&mut self, ot: &mut OffsetTable, key: u64, addr: u64, itr: usize, wid: usize) -> bool {
        let new_line = Line {
            addr,
            first: itr,
            last: itr,
            sent: false,
            received: false,
        };

        // Another iteration already waits on this line.
        if let Some(line) = self
            .rows
            .iter_mut()
            .filter(|r| r.valid && r.key == key)
            .flat_map(|r| r.lines.iter_mut().flatten())
            .find(|l| l.addr == addr)
        {
            assert!(!line.sent, "RT: insert into line {addr:#x} that was already sent");
            ot.insert(itr, wid, Some(line.last));
            line.last = itr;
            self.inserted_words += 1;
            return true;
        }

        if let Some(slot) = self
            .rows
            .iter_mut()
            .filter(|r| r.valid && r.key == key)
            .flat_map(|r| r.lines.iter_mut())
            .find(|l| l.is_none())
        {
            *slot = Some(new_line);
            ot.insert(itr, wid, None);
            self.inserted_words += 1;
            self.inserted_lines += 1;
            return true;
        }

        let Some(row) = self.rows.iter_mut().find(|r| !r.valid) else {
            return false;
        };
        assert!(row.lines.iter().all(Option::is_none), "RT: free row holds lines");
        row.valid = true;
        row.key = key;
        row.cursor = 0;
        row.lines[0] = Some(new_line);
        ot.insert(itr, wid, None);
        self.inserted_words += 1;
        self.inserted_lines += 1;
        self.inserted_rows += 1;
        true
    }

    /// Row to flush after a failed insert. Inserts only fail once every row is taken, so this is always the
    /// first row.
    pub fn drain_victim(&self) -> usize {
        assert!(self.rows.iter().all(|r| r.valid), "RT: draining with free rows");
        0
    }

    /// Next line of `row` that was not sent yet.
    pub fn send_next_in_row(&mut self, row: usize) -> Option<u64> {
        let row = &mut self.rows[row];
        if !row.valid {
            return None;
        }
        row.send_next()
    }

    /// Next line of any row that was not sent yet, rows taken in order.
    pub fn send_next(&mut self) -> Option<u64> {
        while self.send_row < self.rows.len() {
            if let Some(addr) = self.send_next_in_row(self.send_row) {
                return Some(addr);
            }
            self.send_row += 1;
        }
        self.send_row = 0;
        None
    }

    /// A line came back: return the iterations waiting on it, in iteration order.
    ///
    /// Returns nothing if the line was not requested from this table. The row is freed once every line in it
    /// has been received.
    pub fn recv(&mut self, ot: &mut OffsetTable, key: u64, addr: u64) -> Vec<(usize, usize)> {
        let mut matches = self.rows.iter_mut().filter(|r| r.valid && r.key == key).filter_map(|row| {
            let line = row
                .lines
                .iter_mut()
                .flatten()
                .find(|l| l.addr == addr && l.sent && !l.received)?;
            line.received = true;
            let first = line.first;
            if row.lines.iter().flatten().all(|l| l.received) {
                row.free();
            }
            Some(first)
        });
        let Some(first) = matches.next() else {
            return Vec::new();
        };
        assert!(matches.next().is_none(), "RT: line {addr:#x} pending in multiple rows");
        ot.drain(first)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.iter().all(|r| !r.valid)
    }

    pub fn occupied_rows(&self) -> usize {
        self.rows.iter().filter(|r| r.valid).count()
    }

    /// Mean number of lines per occupied row.
    pub fn average_lines_per_row(&self) -> f64 {
        let occupied = self.occupied_rows();
        if occupied == 0 {
            return 0.0;
        }
        let lines: usize = self.rows.iter().filter(|r| r.valid).map(|r| r.lines.iter().flatten().count()).sum();
        lines as f64 / occupied as f64
    }

    /// `(words, lines, rows)` inserted since the last reset.
    pub fn inserted(&self) -> (u64, u64, u64) {
        (self.inserted_words, self.inserted_lines, self.inserted_rows)
    }

    /// Prepare for a new instruction. The previous one must have received every line.
    pub fn reset(&mut self) {
        self.check_reset();
        self.send_row = 0;
        self.inserted_words = 0;
        self.inserted_lines = 0;
        self.inserted_rows = 0;
    }

    pub fn check_reset(&self) {
        for (i, row) in self.rows.iter().enumerate() {
            assert!(
                !row.valid,
                "RT: row {i} (key {:#x}) still valid with {} lines",
                row.key,
                row.lines.iter().flatten().count()
            );
        }
    }
}
