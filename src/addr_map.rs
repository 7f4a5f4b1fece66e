//! DRAM address mapping.
//!
//! Physical addresses are interpreted with the RoBaRaCoCh scheme: after dropping the cache-line offset, the
//! fields are, from least significant up, channel, column, rank, bank group, bank and row.

use memory::LINE_SIZE;

use crate::load_config::DramSection;

/// Number of units at each level of the DRAM hierarchy. All counts are powers of two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Organization {
    pub channels: u32,
    pub ranks: u32,
    pub bankgroups: u32,
    pub banks_per_group: u32,
    pub rows: u32,
    /// Cache lines per row.
    pub columns: u32,
}

impl From<&DramSection> for Organization {
    fn from(dram: &DramSection) -> Self {
        Self {
            channels: dram.channels.value,
            ranks: dram.ranks.value,
            bankgroups: dram.bankgroups.value,
            banks_per_group: dram.banks_per_group.value,
            rows: dram.rows.value,
            columns: dram.columns.value,
        }
    }
}

/// Location of a cache line in the DRAM hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Location {
    pub channel: u32,
    pub rank: u32,
    pub bankgroup: u32,
    pub bank: u32,
    pub row: u32,
    pub column: u32,
}

#[derive(Debug, Clone)]
pub struct AddrMapper {
    org: Organization,
    tx_offset: u32,
}

/// Take the low `bits` bits of `addr` and shift them out.
fn slice_lower_bits(addr: &mut u64, bits: u32) -> u32 {
    let lbits = (*addr & ((1 << bits) - 1)) as u32;
    *addr >>= bits;
    lbits
}

impl AddrMapper {
    pub fn new(org: Organization) -> Self {
        for count in [
            org.channels,
            org.ranks,
            org.bankgroups,
            org.banks_per_group,
            org.rows,
            org.columns,
        ] {
            assert!(count.is_power_of_two(), "DRAM organization {org:?} is not a power of two");
        }
        Self {
            org,
            tx_offset: LINE_SIZE.ilog2(),
        }
    }

    pub fn block_align(&self, addr: u64) -> u64 {
        addr & !((1 << self.tx_offset) - 1)
    }

    pub fn map(&self, addr: u64) -> Location {
        let org = &self.org;
        let mut addr = addr >> self.tx_offset;
        let channel = slice_lower_bits(&mut addr, org.channels.ilog2());
        let column = slice_lower_bits(&mut addr, org.columns.ilog2());
        let rank = slice_lower_bits(&mut addr, org.ranks.ilog2());
        let bankgroup = slice_lower_bits(&mut addr, org.bankgroups.ilog2());
        let bank = slice_lower_bits(&mut addr, org.banks_per_group.ilog2());
        let row = slice_lower_bits(&mut addr, org.rows.ilog2());
        Location {
            channel,
            rank,
            bankgroup,
            bank,
            row,
            column,
        }
    }

    /// Inverse of [`AddrMapper::map`], returning the block-aligned address.
    pub fn compose(&self, loc: &Location) -> u64 {
        let org = &self.org;
        let fields = [
            (loc.channel, org.channels),
            (loc.column, org.columns),
            (loc.rank, org.ranks),
            (loc.bankgroup, org.bankgroups),
            (loc.bank, org.banks_per_group),
            (loc.row, org.rows),
        ];

        let mut addr = 0u64;
        let mut shift = self.tx_offset;
        for (value, count) in fields {
            assert!(value < count, "{loc:?} out of range for {org:?}");
            addr |= (value as u64) << shift;
            shift += count.ilog2();
        }
        addr
    }

    pub fn num_banks(&self) -> u32 {
        let org = &self.org;
        org.channels * org.ranks * org.bankgroups * org.banks_per_group
    }

    /// Number of bank tables of the narrowest layout: one per bank group parity of every rank.
    pub fn min_tables(&self) -> u32 {
        (self.org.channels * self.org.ranks * 2).min(self.num_banks())
    }

    /// Spread `num_tables` bank tables over the DRAM hierarchy, filling channels first, then ranks, bank groups
    /// and banks.
    pub fn table_map(&self, num_tables: u32) -> TableMap {
        assert!(
            num_tables.is_power_of_two() && num_tables <= self.num_banks(),
            "cannot split {} banks over {num_tables} tables",
            self.num_banks()
        );
        let org = self.org;
        let mut remaining = num_tables;
        let mut split = |count: u32| {
            let s = remaining.min(count);
            remaining /= s;
            s
        };
        TableMap {
            org,
            channels: split(org.channels),
            ranks: split(org.ranks),
            bankgroups: split(org.bankgroups),
            banks: split(org.banks_per_group),
        }
    }
}

/// Assignment of DRAM banks to row tables.
///
/// Each level is split over as many tables as its count in the map; units of a level beyond that share a table
/// and are told apart by the row-group key.
#[derive(Debug, Clone)]
pub struct TableMap {
    org: Organization,
    channels: u32,
    ranks: u32,
    bankgroups: u32,
    banks: u32,
}

impl TableMap {
    pub fn num_tables(&self) -> usize {
        (self.channels * self.ranks * self.bankgroups * self.banks) as usize
    }

    /// Index of the row table serving `loc`.
    pub fn bank_table(&self, loc: &Location) -> usize {
        let mut idx = loc.channel % self.channels;
        idx = idx * self.ranks + loc.rank % self.ranks;
        idx = idx * self.bankgroups + loc.bankgroup % self.bankgroups;
        idx = idx * self.banks + loc.bank % self.banks;
        idx as usize
    }

    /// Key identifying a DRAM row within its row table.
    pub fn row_group_key(&self, loc: &Location) -> u64 {
        let org = &self.org;
        let key = (loc.bankgroup / self.bankgroups) as u64 * org.banks_per_group as u64;
        (key + (loc.bank / self.banks) as u64) * org.rows as u64 + loc.row as u64
    }

    /// Order in which tables are visited when building requests.
    ///
    /// Channel varies fastest, so that consecutive requests spread over channels before ranks.
    pub fn order(&self) -> Vec<usize> {
        let org = &self.org;
        let mut order = Vec::with_capacity(self.num_tables());
        for bank in 0..org.banks_per_group {
            for bankgroup in 0..org.bankgroups {
                for rank in 0..org.ranks {
                    for channel in 0..org.channels {
                        let table = self.bank_table(&Location {
                            channel,
                            rank,
                            bankgroup,
                            bank,
                            ..Default::default()
                        });
                        if !order.contains(&table) {
                            order.push(table);
                        }
                    }
                }
            }
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper() -> AddrMapper {
        AddrMapper::new(Organization {
            channels: 2,
            ranks: 2,
            bankgroups: 4,
            banks_per_group: 4,
            rows: 1024,
            columns: 8,
        })
    }

    #[test]
    fn field_order() {
        let m = mapper();
        // Line 1 is channel 1; lines 2..16 walk the columns of channel 0 and 1.
        assert_eq!(m.map(64).channel, 1);
        assert_eq!(m.map(128).column, 1);
        assert_eq!(m.map(128).channel, 0);

        let loc = Location {
            channel: 1,
            rank: 1,
            bankgroup: 3,
            bank: 2,
            row: 700,
            column: 5,
        };
        let addr = m.compose(&loc);
        assert_eq!(m.map(addr), loc);
        assert_eq!(m.map(addr + 63), loc);
        assert_eq!(m.block_align(addr + 63), addr);
    }

    #[test]
    fn row_group_folds_bankgroup_pairs() {
        let m = mapper().table_map(mapper().min_tables());
        let loc = |bankgroup, column| Location {
            bankgroup,
            bank: 1,
            row: 9,
            column,
            ..Default::default()
        };

        // Bank groups 2 and 3 share the key but not the table.
        assert_eq!(m.row_group_key(&loc(2, 0)), m.row_group_key(&loc(3, 7)));
        assert_ne!(m.bank_table(&loc(2, 0)), m.bank_table(&loc(3, 0)));
        assert_ne!(m.row_group_key(&loc(1, 0)), m.row_group_key(&loc(2, 0)));
        assert_eq!(m.row_group_key(&loc(2, 0)), (4 + 1) * 1024 + 9);
    }

    #[test]
    fn bank_table_order_visits_all() {
        let m = mapper().table_map(8);
        let order = m.order();
        assert_eq!(order, [0, 4, 2, 6, 1, 5, 3, 7]);

        let mut sorted = order.clone();
        sorted.sort();
        assert_eq!(sorted, (0..m.num_tables()).collect::<Vec<_>>());
    }

    #[test]
    fn wider_maps_split_banks() {
        let m = mapper();
        assert_eq!(m.min_tables(), 8);
        let loc = |bankgroup, bank| Location {
            channel: 1,
            rank: 0,
            bankgroup,
            bank,
            row: 3,
            column: 0,
        };

        // 16 tables: every bank group has its own table, banks still share through the key.
        let wide = m.table_map(16);
        assert_eq!(wide.num_tables(), 16);
        assert_ne!(wide.bank_table(&loc(2, 0)), wide.bank_table(&loc(3, 0)));
        assert_eq!(wide.bank_table(&loc(2, 0)), wide.bank_table(&loc(2, 1)));
        assert_ne!(wide.row_group_key(&loc(2, 0)), wide.row_group_key(&loc(2, 1)));
        assert_eq!(wide.row_group_key(&loc(2, 0)), wide.row_group_key(&loc(3, 0)));

        // One table per bank: the key is just the row.
        let full = m.table_map(64);
        assert_eq!(full.row_group_key(&loc(3, 3)), 3);
        let mut order = full.order();
        order.sort();
        assert_eq!(order, (0..64).collect::<Vec<_>>());
    }

    #[test]
    fn degenerate_levels() {
        let m = AddrMapper::new(Organization {
            channels: 1,
            ranks: 1,
            bankgroups: 1,
            banks_per_group: 1,
            rows: 16,
            columns: 16,
        });
        assert_eq!(m.min_tables(), 1);
        let t = m.table_map(1);
        assert_eq!(t.num_tables(), 1);
        assert_eq!(m.map(0).row, 0);
        assert_eq!(m.map(16 * 64).row, 1);
        assert_eq!(t.bank_table(&m.map(16 * 64)), 0);
        assert_eq!(t.row_group_key(&m.map(16 * 64)), 1);
    }
}
