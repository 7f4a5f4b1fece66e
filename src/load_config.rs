// load_config.rs
use std::path::Path;
use std::{env, fs, sync::LazyLock};

use anyhow::{Context, ensure};
use log::warn;
use serde::{Deserialize, Serialize};

/// Environment variable naming the settings file used when none is given explicitly.
pub const CONFIG_ENV: &str = "MAA_CONFIG";

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct ConfigValue {
    pub value: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct ConfigValueUsize {
    pub value: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct ConfigValueU64 {
    pub value: u64,
}

const fn v(value: u32) -> ConfigValue {
    ConfigValue { value }
}

const fn vu(value: usize) -> ConfigValueUsize {
    ConfigValueUsize { value }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AcceleratorConfig {
    #[serde(rename = "CONFIG")]
    pub config: ConfigSection,
    #[serde(rename = "DRAM")]
    pub dram: DramSection,
    #[serde(rename = "LATENCY")]
    pub latency: LatencySection,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ConfigSection {
    #[serde(rename = "NUM_TILES")]
    pub num_tiles: ConfigValueUsize,
    #[serde(rename = "NUM_TILE_ELEMENTS")]
    pub num_tile_elements: ConfigValueUsize,
    #[serde(rename = "NUM_INSTRUCTIONS")]
    pub num_instructions: ConfigValueUsize,
    #[serde(rename = "NUM_INDIRECT_ACCESS_UNITS")]
    pub num_indirect_access_units: ConfigValueUsize,
    #[serde(rename = "NUM_ROW_TABLE_ROWS")]
    pub num_row_table_rows: ConfigValueUsize,
    #[serde(rename = "NUM_ROW_TABLE_ENTRIES_PER_ROW")]
    pub num_row_table_entries_per_row: ConfigValueUsize,
    /// Non-zero lets each unit pick its row-table layout per base address.
    #[serde(rename = "RECONFIGURE_ROW_TABLE")]
    pub reconfigure_row_table: ConfigValue,
    #[serde(rename = "NUM_ROW_TABLE_CONFIG_CACHE_ENTRIES")]
    pub num_row_table_config_cache_entries: ConfigValueUsize,
    #[serde(rename = "HBM_SIZE")]
    pub hbm_size: ConfigValueUsize,
    /// Constant added by the (synchronous) address translation.
    #[serde(rename = "PHYSICAL_OFFSET")]
    pub physical_offset: ConfigValueU64,
    #[serde(rename = "CLOCK_PERIOD_PS")]
    pub clock_period_ps: ConfigValueU64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TimingModel {
    Naive,
    Simple,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DramSection {
    #[serde(rename = "CHANNELS")]
    pub channels: ConfigValue,
    #[serde(rename = "RANKS")]
    pub ranks: ConfigValue,
    #[serde(rename = "BANKGROUPS")]
    pub bankgroups: ConfigValue,
    #[serde(rename = "BANKS_PER_GROUP")]
    pub banks_per_group: ConfigValue,
    #[serde(rename = "ROWS")]
    pub rows: ConfigValue,
    #[serde(rename = "COLUMNS")]
    pub columns: ConfigValue,
    #[serde(rename = "TIMING_MODEL")]
    pub timing_model: TimingModel,
    #[serde(rename = "TCK_PS")]
    pub tck_ps: ConfigValueU64,
    #[serde(rename = "CAS")]
    pub cas: ConfigValue,
    #[serde(rename = "RCD")]
    pub rcd: ConfigValue,
    #[serde(rename = "RP")]
    pub rp: ConfigValue,
    #[serde(rename = "BUS_WIDTH")]
    pub bus_width: ConfigValue,
    #[serde(rename = "TRANSPORT_CAPACITY")]
    pub transport_capacity: ConfigValueUsize,
    /// In accelerator cycles.
    #[serde(rename = "CACHE_HIT_LATENCY")]
    pub cache_hit_latency: ConfigValue,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LatencySection {
    #[serde(rename = "ROW_TABLE")]
    pub row_table: ConfigValue,
    #[serde(rename = "ROW_TABLE_PARALLELISM")]
    pub row_table_parallelism: ConfigValueUsize,
    #[serde(rename = "SPD_ACCESS")]
    pub spd_access: ConfigValue,
    #[serde(rename = "SPD_WORDS_PER_ACCESS")]
    pub spd_words_per_access: ConfigValueUsize,
    #[serde(rename = "INVALIDATE_TILE")]
    pub invalidate_tile: ConfigValue,
}

impl Default for AcceleratorConfig {
    fn default() -> Self {
        Self {
            config: ConfigSection {
                num_tiles: vu(32),
                num_tile_elements: vu(1024),
                num_instructions: vu(32),
                num_indirect_access_units: vu(1),
                num_row_table_rows: vu(64),
                num_row_table_entries_per_row: vu(16),
                reconfigure_row_table: v(0),
                num_row_table_config_cache_entries: vu(16),
                hbm_size: vu(64 * 1024 * 1024),
                physical_offset: ConfigValueU64 { value: 0 },
                clock_period_ps: ConfigValueU64 { value: 1000 },
            },
            dram: DramSection {
                channels: v(1),
                ranks: v(2),
                bankgroups: v(4),
                banks_per_group: v(4),
                rows: v(65536),
                columns: v(128),
                timing_model: TimingModel::Simple,
                tck_ps: ConfigValueU64 { value: 833 },
                cas: v(16),
                rcd: v(16),
                rp: v(16),
                bus_width: v(64),
                transport_capacity: vu(64),
                cache_hit_latency: v(20),
            },
            latency: LatencySection {
                row_table: v(1),
                row_table_parallelism: vu(4),
                spd_access: v(2),
                spd_words_per_access: vu(16),
                invalidate_tile: v(32),
            },
        }
    }
}

impl ConfigSection {
    pub fn reconfigure_row_table(&self) -> bool {
        self.reconfigure_row_table.value != 0
    }
}

impl AcceleratorConfig {
    /// Reject settings the accelerator cannot be built from.
    pub fn validate(&self) -> anyhow::Result<()> {
        let c = &self.config;
        ensure!(c.num_tiles.value > 0 && c.num_tiles.value < 0xFF, "NUM_TILES must be in 1..255");
        ensure!(c.num_tile_elements.value > 0, "NUM_TILE_ELEMENTS must be non-zero");
        ensure!(c.num_instructions.value > 0, "NUM_INSTRUCTIONS must be non-zero");
        ensure!(c.num_indirect_access_units.value > 0, "NUM_INDIRECT_ACCESS_UNITS must be non-zero");
        ensure!(c.num_row_table_rows.value > 0, "NUM_ROW_TABLE_ROWS must be non-zero");
        ensure!(
            c.num_row_table_entries_per_row.value > 0,
            "NUM_ROW_TABLE_ENTRIES_PER_ROW must be non-zero"
        );
        ensure!(
            !c.reconfigure_row_table() || c.num_row_table_config_cache_entries.value > 0,
            "NUM_ROW_TABLE_CONFIG_CACHE_ENTRIES must be non-zero when RECONFIGURE_ROW_TABLE is set"
        );
        ensure!(c.hbm_size.value.is_multiple_of(64), "HBM_SIZE must be a multiple of 64");
        ensure!(c.clock_period_ps.value > 0, "CLOCK_PERIOD_PS must be non-zero");

        let d = &self.dram;
        for (name, count) in [
            ("CHANNELS", d.channels),
            ("RANKS", d.ranks),
            ("BANKGROUPS", d.bankgroups),
            ("BANKS_PER_GROUP", d.banks_per_group),
            ("ROWS", d.rows),
            ("COLUMNS", d.columns),
        ] {
            ensure!(count.value.is_power_of_two(), "{name} must be a power of two, got {}", count.value);
        }
        ensure!(
            [8, 16, 32, 64, 128, 256].contains(&d.bus_width.value),
            "BUS_WIDTH must be a power of two between 8 and 256"
        );
        ensure!(d.transport_capacity.value > 0, "TRANSPORT_CAPACITY must be non-zero");

        let l = &self.latency;
        ensure!(l.row_table_parallelism.value > 0, "ROW_TABLE_PARALLELISM must be non-zero");
        ensure!(l.spd_words_per_access.value > 0, "SPD_WORDS_PER_ACCESS must be non-zero");
        Ok(())
    }
}

// Global configuration loaded at runtime
pub static CONFIG: LazyLock<AcceleratorConfig> = LazyLock::new(|| {
    load_config().unwrap_or_else(|e| {
        warn!("Failed to load config: {e:#}. Using defaults.");
        AcceleratorConfig::default()
    })
});

// Configuration loading functions
pub fn load_config() -> anyhow::Result<AcceleratorConfig> {
    let config_path = env::var_os(CONFIG_ENV).with_context(|| format!("{CONFIG_ENV} is not set"))?;
    load_config_from_file(Path::new(&config_path))
}

pub fn load_config_from_file(path: &Path) -> anyhow::Result<AcceleratorConfig> {
    let content =
        fs::read_to_string(path).with_context(|| format!("cannot read config {}", path.display()))?;
    let config: AcceleratorConfig =
        toml::from_str(&content).with_context(|| format!("cannot parse config {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        AcceleratorConfig::default().validate().unwrap();
    }

    #[test]
    fn shipped_settings_match_defaults() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("configs/maa_settings.toml");
        assert_eq!(load_config_from_file(&path).unwrap(), AcceleratorConfig::default());
    }

    #[test]
    fn toml_round_trip() {
        let mut config = AcceleratorConfig::default();
        config.dram.timing_model = TimingModel::Naive;
        config.config.num_row_table_rows.value = 3;

        let text = toml::to_string(&config).unwrap();
        assert!(text.contains("[DRAM]"));
        assert!(text.contains("TIMING_MODEL = \"naive\""));
        assert_eq!(toml::from_str::<AcceleratorConfig>(&text).unwrap(), config);
    }

    #[test]
    fn reconfiguration_needs_a_cache() {
        let mut config = AcceleratorConfig::default();
        assert!(!config.config.reconfigure_row_table());
        config.config.num_row_table_config_cache_entries.value = 0;
        config.validate().unwrap();

        config.config.reconfigure_row_table.value = 1;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("NUM_ROW_TABLE_CONFIG_CACHE_ENTRIES"));
    }

    #[test]
    fn rejects_non_power_of_two() {
        let mut config = AcceleratorConfig::default();
        config.dram.banks_per_group.value = 3;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("BANKS_PER_GROUP"));
    }
}
