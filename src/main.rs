use std::fs;
use std::num::ParseIntError;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, ensure};
use clap::Parser;
use log::info;
use maa_sim::Assembler;
use maa_sim::Maa;
use maa_sim::load_config::{CONFIG, load_config_from_file};

#[derive(Parser)]
struct Opts {
    #[arg(long)]
    /// Path to the program: hexadecimal instruction words, three per instruction.
    program: PathBuf,

    #[arg(long)]
    /// Path to HBM contents for preloading.
    hbm: Option<PathBuf>,

    #[arg(long, value_parser = parse_tile)]
    /// Preload a tile as `ID=PATH`, the file holding little-endian elements. Repeatable.
    tile: Vec<(usize, PathBuf)>,

    #[arg(long, default_value_t = 4)]
    /// Element width in bytes of tile preloads and dumps (4 or 8).
    element_width: usize,

    #[arg(long, value_parser = parse_addr)]
    /// Mark the cache line holding ADDR as held by the upstream cache. Repeatable.
    cached: Vec<u64>,

    #[arg(long)]
    /// Settings file. Falls back to $MAA_CONFIG, then to the built-in defaults.
    config: Option<PathBuf>,

    #[arg(long)]
    /// Write the statistics report to this path as JSON.
    stats: Option<PathBuf>,

    #[arg(long)]
    /// Dump HBM contents to this path after the run.
    dump_hbm: Option<PathBuf>,

    #[arg(long)]
    /// Dump every non-empty tile into this directory as `tile_<ID>.bin`.
    dump_tiles: Option<PathBuf>,

    #[arg(long, short)]
    /// Quiet mode: only output final latency and statistics.
    quiet: bool,
}

static QUIET_MODE: AtomicBool = AtomicBool::new(false);

fn is_quiet() -> bool {
    QUIET_MODE.load(Ordering::Relaxed)
}

fn parse_hex(tok: &str) -> Result<u64, ParseIntError> {
    u64::from_str_radix(tok.trim_start_matches("0x"), 16)
}

fn parse_addr(s: &str) -> Result<u64, String> {
    let parsed = if s.starts_with("0x") { parse_hex(s) } else { s.parse() };
    parsed.map_err(|e| format!("bad address `{s}`: {e}"))
}

fn parse_tile(s: &str) -> Result<(usize, PathBuf), String> {
    let (id, path) = s.split_once('=').ok_or_else(|| format!("expected ID=PATH, got `{s}`"))?;
    let id = id.parse().map_err(|e| format!("bad tile id `{id}`: {e}"))?;
    Ok((id, PathBuf::from(path)))
}

fn start(opts: Opts) -> anyhow::Result<()> {
    let config = match &opts.config {
        Some(path) => load_config_from_file(path)?,
        None => CONFIG.clone(),
    };
    let width = opts.element_width;
    ensure!(width == 4 || width == 8, "element width must be 4 or 8, got {width}");
    let mut maa = Maa::new(&config);

    let text = fs::read_to_string(&opts.program)
        .with_context(|| format!("cannot read program {}", opts.program.display()))?;
    let words = text
        .split_whitespace()
        .map(|tok| parse_hex(tok).with_context(|| format!("bad instruction word `{tok}`")))
        .collect::<anyhow::Result<Vec<u64>>>()?;
    let program = Assembler::assemble(&words)?;
    info!("Loaded {} instructions", program.len());

    // Memory Initialization
    // - HBM Preload
    if let Some(path) = &opts.hbm {
        let data = fs::read(path).with_context(|| format!("cannot read HBM preload {}", path.display()))?;
        let size = maa.memory().memory().size_in_bytes();
        ensure!(data.len() <= size, "HBM preload of {} bytes exceeds {size} bytes", data.len());
        maa.memory_mut().memory_mut().with_data(|f| {
            f[..data.len()].copy_from_slice(&data);
        });
    }

    // - Tile Preload
    for (tile, path) in &opts.tile {
        let data = fs::read(path).with_context(|| format!("cannot read tile preload {}", path.display()))?;
        let spd = maa.scratchpad();
        ensure!(*tile < spd.num_tiles(), "T{tile} out of range ({} tiles)", spd.num_tiles());
        ensure!(
            data.len().is_multiple_of(width) && data.len() / width <= spd.tile_size(),
            "{} does not hold at most {} elements of {width} bytes",
            path.display(),
            spd.tile_size()
        );
        maa.load_tile(*tile, width, &data);
    }

    for &addr in &opts.cached {
        maa.memory_mut().cache(addr);
    }

    maa.run_program(&program)?;

    let report = maa.stats();
    if !is_quiet() {
        eprintln!("{report}");
    }
    eprintln!("Simulation completed. Latency {:?}", maa.now());

    if let Some(path) = &opts.stats {
        let json = serde_json::to_string_pretty(&report)?;
        fs::write(path, json).with_context(|| format!("cannot write stats {}", path.display()))?;
    }

    // Dump HBM
    if let Some(path) = &opts.dump_hbm {
        fs::write(path, maa.memory().memory().as_bytes())
            .with_context(|| format!("cannot write HBM dump {}", path.display()))?;
        if !is_quiet() {
            eprintln!("Dumped HBM content to: {path:?}");
        }
    }

    // Dump tiles
    if let Some(dir) = &opts.dump_tiles {
        fs::create_dir_all(dir).with_context(|| format!("cannot create {}", dir.display()))?;
        let spd = maa.scratchpad();
        for tile in (0..spd.num_tiles()).filter(|&t| spd.size(t) > 0) {
            let path = dir.join(format!("tile_{tile}.bin"));
            fs::write(&path, spd.as_bytes(tile, width))
                .with_context(|| format!("cannot write tile dump {}", path.display()))?;
        }
        if !is_quiet() {
            eprintln!("Dumped tiles to: {dir:?}");
        }
    }

    let memory = report.transport;
    let utilization = (memory.bytes_read + memory.bytes_written) as f64 / maa.now().to_secs();
    eprintln!(
        "HBM Statistics - Bytes read: {:?} | Bytes written: {:?} | Utilization: {:.2e} bytes/sec",
        memory.bytes_read, memory.bytes_written, utilization
    );
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let opts = Opts::parse();
    QUIET_MODE.store(opts.quiet, Ordering::Relaxed);
    start(opts)
}
