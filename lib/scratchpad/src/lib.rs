use log::trace;

/// Scratchpad that stores the accelerator's operand tiles.
///
/// The scratchpad is organized as tiles, where each tile holds `num_elements` raw 64-bit words. Narrower
/// element types only use the low bits of each word; interpretation is left to the functional units.
///
/// Besides the data, every tile carries:
/// - a status, which is [`TileStatus::Service`] while an instruction producing the tile is live,
/// - a logical size, published by the producer when it finishes,
/// - a ready bit per element, so that consumers can start on a tile that is still being produced.
pub struct Scratchpad {
    /// Number of elements per tile
    num_elements: usize,
    /// Fixed access latency (in cycles) of one batch
    latency: u32,
    /// Number of element accesses served by one batch
    words_per_access: usize,
    tiles: Vec<Tile>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileStatus {
    /// A producer is writing the tile.
    Service,
    /// The tile content is final.
    Finished,
}

struct Tile {
    data: Vec<u64>,
    ready: Vec<bool>,
    status: TileStatus,
    size: usize,
}

impl Scratchpad {
    /// Create a new scratchpad.
    ///
    /// # Arguments
    /// * `num_tiles` - Number of tiles
    /// * `num_elements` - Number of elements per tile
    /// * `latency` - Cycles charged per batch of accesses
    /// * `words_per_access` - Accesses served by one batch
    pub fn new(num_tiles: usize, num_elements: usize, latency: u32, words_per_access: usize) -> Self {
        assert!(words_per_access > 0);
        let tiles = (0..num_tiles)
            .map(|_| Tile {
                data: vec![0; num_elements],
                ready: vec![true; num_elements],
                status: TileStatus::Finished,
                size: 0,
            })
            .collect();

        Self {
            num_elements,
            latency,
            words_per_access,
            tiles,
        }
    }

    pub fn num_tiles(&self) -> usize {
        self.tiles.len()
    }

    /// Get the number of elements per tile
    pub fn tile_size(&self) -> usize {
        self.num_elements
    }

    /// Latency in cycles of `accesses` element accesses.
    pub fn access_latency(&self, accesses: usize) -> u32 {
        accesses.div_ceil(self.words_per_access) as u32 * self.latency
    }

    /// Read one element.
    ///
    /// Reading an element that is not ready is a caller bug; check [`Scratchpad::element_ready`] first.
    pub fn read(&self, tile: usize, index: usize) -> u64 {
        let t = self.tile(tile);
        assert!(index < self.num_elements, "Index out of bounds");
        assert!(t.ready[index], "T[{tile}] E[{index}] read before it was produced");
        t.data[index]
    }

    /// Write one element, marking it ready.
    pub fn write(&mut self, tile: usize, index: usize, word: u64) {
        assert!(index < self.num_elements, "Index out of bounds");
        let t = self.tile_mut(tile);
        t.data[index] = word;
        t.ready[index] = true;
        trace!("SPD: T[{tile}] E[{index}] = {word:#x}");
    }

    pub fn element_ready(&self, tile: usize, index: usize) -> bool {
        let t = self.tile(tile);
        t.status == TileStatus::Finished || t.ready.get(index).copied().unwrap_or(false)
    }

    pub fn is_ready(&self, tile: usize) -> bool {
        self.tile(tile).status == TileStatus::Finished
    }

    pub fn status(&self, tile: usize) -> TileStatus {
        self.tile(tile).status
    }

    /// Logical size of a tile, meaningful once it is ready.
    pub fn size(&self, tile: usize) -> usize {
        self.tile(tile).size
    }

    pub fn set_size(&mut self, tile: usize, size: usize) {
        assert!(size <= self.num_elements, "Size out of bounds");
        self.tile_mut(tile).size = size;
    }

    /// The producer of the tile finished: every element is final.
    pub fn set_ready(&mut self, tile: usize) {
        let t = self.tile_mut(tile);
        t.status = TileStatus::Finished;
        t.ready.fill(true);
        trace!("SPD: T[{tile}] ready, size {}", t.size);
    }

    /// A producer of the tile was issued: nothing in it can be consumed until written again.
    pub fn unset_ready(&mut self, tile: usize) {
        let t = self.tile_mut(tile);
        t.status = TileStatus::Service;
        t.ready.fill(false);
        t.size = 0;
    }

    /// Load data from bytes into a tile.
    ///
    /// Elements are `width` bytes wide and little endian. This is used for preloading tiles with test data;
    /// the tile becomes ready with a size of the number of elements loaded.
    pub fn load_from_bytes(&mut self, tile: usize, width: usize, data: &[u8]) {
        assert!(width == 4 || width == 8, "Unsupported element width {width}");
        assert!(data.len().is_multiple_of(width), "Data is not a whole number of elements");
        let count = data.len() / width;
        assert!(count <= self.num_elements, "Data does not fit in a tile");

        for (i, chunk) in data.chunks_exact(width).enumerate() {
            let mut bytes = [0; 8];
            bytes[..width].copy_from_slice(chunk);
            self.write(tile, i, u64::from_le_bytes(bytes));
        }
        self.set_size(tile, count);
        self.set_ready(tile);
    }

    /// Dump the logical content of a tile as bytes.
    ///
    /// Elements are truncated to `width` bytes, little endian.
    pub fn as_bytes(&self, tile: usize, width: usize) -> Vec<u8> {
        assert!(width == 4 || width == 8, "Unsupported element width {width}");
        let t = self.tile(tile);
        t.data[..t.size]
            .iter()
            .flat_map(|w| w.to_le_bytes().into_iter().take(width))
            .collect()
    }

    fn tile(&self, tile: usize) -> &Tile {
        assert!(tile < self.tiles.len(), "Tile {tile} out of bounds");
        &self.tiles[tile]
    }

    fn tile_mut(&mut self, tile: usize) -> &mut Tile {
        assert!(tile < self.tiles.len(), "Tile {tile} out of bounds");
        &mut self.tiles[tile]
    }
}
