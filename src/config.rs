use serde::Deserialize;

use crate::blockchain::error::BlockchainError;

/// Everything the storage core needs to know about its environment. All
/// fields have defaults, so a TOML config file only has to name what it
/// changes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the block and undo segment files.
    pub data_dir: String,
    pub file_extension: String,
    pub block_file_prefix: String,
    pub undo_file_prefix: String,
    /// Rotation thresholds for the two segment streams, in bytes.
    pub max_block_file_size: u32,
    pub max_undo_file_size: u32,
    pub block_index_path: String,
    pub coin_db_path: String,
    /// How many coins the in-memory cache holds before a block application
    /// flushes it to the coin store.
    pub main_cache_capacity: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: "./data".to_string(),
            file_extension: ".dat".to_string(),
            block_file_prefix: "block".to_string(),
            undo_file_prefix: "undo".to_string(),
            max_block_file_size: 16 * 1024 * 1024,
            max_undo_file_size: 16 * 1024 * 1024,
            block_index_path: "./data/block_index".to_string(),
            coin_db_path: "./data/coins".to_string(),
            main_cache_capacity: 10_000,
        }
    }
}

impl Config {
    pub fn from_file(filename: &str) -> Result<Self, BlockchainError> {
        let file = std::fs::read_to_string(filename)?;
        Ok(toml::from_str(&file)?)
    }
}

#[cfg(test)]
mod test {
    use super::Config;

    #[test]
    fn partial_config_falls_back_to_defaults() {
        let config: Config = toml::from_str(
            r#"
            data_dir = "/var/lib/jacaranda"
            main_cache_capacity = 64
            "#,
        )
        .unwrap();
        assert_eq!(config.data_dir, "/var/lib/jacaranda");
        assert_eq!(config.main_cache_capacity, 64);
        assert_eq!(config.block_file_prefix, "block");
        assert_eq!(config.file_extension, ".dat");
    }
}
