//! Row-table layouts.
//!
//! The row-table storage of a unit can be split into few wide bank tables or many narrow ones. Layout `i` has
//! `min_tables << i` tables of `entries_per_row >> i` lines per row, so every layout holds the same number of
//! lines. With reconfiguration enabled, the layout of an instruction is picked from the rows its base address
//! touched the last time it ran.

use log::debug;
use runtime::Instant;

use crate::addr_map::{AddrMapper, TableMap};
use crate::row_table::RowTable;

pub struct Layout {
    pub map: TableMap,
    pub tables: Vec<RowTable>,
    /// Table visiting order of the build stage.
    pub order: Vec<usize>,
    /// Rows over all tables.
    pub num_rows: usize,
    pub entries_per_row: usize,
}

impl Layout {
    fn new(map: TableMap, num_rows: usize, entries_per_row: usize) -> Self {
        let tables = (0..map.num_tables()).map(|_| RowTable::new(num_rows, entries_per_row)).collect();
        Self {
            order: map.order(),
            num_rows: map.num_tables() * num_rows,
            entries_per_row,
            tables,
            map,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tables.iter().all(RowTable::is_empty)
    }
}

/// Layouts a unit can switch between, narrowest first.
///
/// Without reconfiguration only the narrowest layout exists.
pub fn layouts(mapper: &AddrMapper, num_rows: usize, entries_per_row: usize, reconfigure: bool) -> Vec<Layout> {
    let mut layouts = Vec::new();
    let mut tables = mapper.min_tables();
    let mut entries = entries_per_row;
    loop {
        layouts.push(Layout::new(mapper.table_map(tables), num_rows, entries));
        if !reconfigure || tables * 2 > mapper.num_banks() || entries < 2 {
            return layouts;
        }
        tables *= 2;
        entries /= 2;
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    base: u64,
    layout: usize,
    last_used: Instant,
}

/// Per-unit cache of the layout chosen for each base address.
pub struct LayoutCache {
    entries: Vec<Option<Entry>>,
    /// Row capacity of every layout, narrowest first.
    rows: Vec<usize>,
    reconfigure: bool,
}

impl LayoutCache {
    pub fn new(capacity: usize, layouts: &[Layout], reconfigure: bool) -> Self {
        assert!(!layouts.is_empty());
        assert!(!reconfigure || capacity > 0, "layout cache needs at least one entry");
        Self {
            entries: vec![None; capacity],
            rows: layouts.iter().map(|l| l.num_rows).collect(),
            reconfigure,
        }
    }

    /// Layout used for base addresses seen for the first time: the one with the most tables.
    fn initial(&self) -> usize {
        if self.reconfigure { self.rows.len() - 1 } else { 0 }
    }

    /// Layout for an instruction at `base`, remembering `base` if it is new.
    pub fn lookup(&mut self, base: u64, now: Instant) -> usize {
        if !self.reconfigure {
            return 0;
        }
        if let Some(entry) = self.entries.iter_mut().flatten().find(|e| e.base == base) {
            entry.last_used = now;
            return entry.layout;
        }

        let initial = self.initial();
        let victim = self
            .entries
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| e.map(|e| e.last_used))
            .map(|(i, _)| i)
            .unwrap_or(0);
        self.entries[victim] = Some(Entry {
            base,
            layout: initial,
            last_used: now,
        });
        initial
    }

    /// An instruction at `base` touched `rows` distinct DRAM rows: next time, use the narrowest layout with more
    /// rows than that.
    pub fn update(&mut self, base: u64, rows: usize) {
        if !self.reconfigure {
            return;
        }
        let layout = self
            .rows
            .iter()
            .position(|&capacity| rows < capacity)
            .unwrap_or(self.rows.len() - 1);
        let Some(entry) = self.entries.iter_mut().flatten().find(|e| e.base == base) else {
            panic!("layout of base {base:#x} was never looked up");
        };
        if entry.layout != layout {
            debug!("RT: base {base:#x} moves to layout {layout} for {rows} rows");
        }
        entry.layout = layout;
    }
}

#[cfg(test)]
mod tests {
    use runtime::Duration;

    use super::*;
    use crate::addr_map::Organization;

    fn mapper() -> AddrMapper {
        AddrMapper::new(Organization {
            channels: 1,
            ranks: 2,
            bankgroups: 4,
            banks_per_group: 4,
            rows: 1024,
            columns: 16,
        })
    }

    fn at(ns: u64) -> Instant {
        Instant::INIT + Duration::from_nanos(ns)
    }

    #[test]
    fn layouts_keep_capacity() {
        let all = layouts(&mapper(), 4, 16, true);
        let shape: Vec<_> = all.iter().map(|l| (l.tables.len(), l.entries_per_row, l.num_rows)).collect();
        assert_eq!(shape, [(4, 16, 16), (8, 8, 32), (16, 4, 64), (32, 2, 128)]);
        assert_eq!(all[3].order.len(), 32);

        assert_eq!(layouts(&mapper(), 4, 16, false).len(), 1);
        // Rows cannot get narrower than one line.
        assert_eq!(layouts(&mapper(), 4, 2, true).len(), 2);
    }

    #[test]
    fn new_bases_start_wide_then_shrink() {
        let all = layouts(&mapper(), 4, 16, true);
        let mut cache = LayoutCache::new(2, &all, true);

        assert_eq!(cache.lookup(0x1000, at(1)), 3);
        cache.update(0x1000, 20);
        assert_eq!(cache.lookup(0x1000, at(2)), 1);
        cache.update(0x1000, 3);
        assert_eq!(cache.lookup(0x1000, at(3)), 0);
        // More rows than any layout holds.
        cache.update(0x1000, 500);
        assert_eq!(cache.lookup(0x1000, at(4)), 3);
    }

    #[test]
    fn least_recently_used_base_is_replaced() {
        let all = layouts(&mapper(), 4, 16, true);
        let mut cache = LayoutCache::new(2, &all, true);
        cache.lookup(0, at(1));
        cache.update(0, 1);
        cache.lookup(0x40, at(2));
        cache.update(0x40, 1);
        assert_eq!(cache.lookup(0, at(3)), 0);

        // 0x40 is older, so it makes room for 0x80.
        assert_eq!(cache.lookup(0x80, at(4)), 3);
        assert_eq!(cache.lookup(0, at(5)), 0);
        assert_eq!(cache.lookup(0x40, at(6)), 3);
    }

    #[test]
    fn fixed_layout_ignores_history() {
        let all = layouts(&mapper(), 4, 16, false);
        let mut cache = LayoutCache::new(0, &all, false);
        assert_eq!(cache.lookup(0x1000, at(1)), 0);
        cache.update(0x1000, 1000);
        assert_eq!(cache.lookup(0x1000, at(2)), 0);
    }
}
