use bitcoin::hashes::sha256;
use thiserror::Error;

use super::coin_database::CoinLocator;

#[derive(Error, Debug)]
pub enum BlockchainError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] kv::Error),
    #[error("consensus encoding error: {0}")]
    ConsensusDecode(#[from] bitcoin::consensus::encode::Error),
    #[error("invalid config file: {0}")]
    InvalidConfig(#[from] toml::de::Error),
    #[error("block {0} is not in our chain")]
    BlockNotFound(sha256::Hash),
    #[error("block validation failed: {0}")]
    BlockValidation(#[from] BlockValidationError),
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockValidationError {
    #[error("input {0} spends a coin that is already spent")]
    CoinAlreadySpent(CoinLocator),
    #[error("input {0} references an output we don't know about")]
    CoinNotFound(CoinLocator),
}
