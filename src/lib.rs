// SPDX-License-Identifier: MIT

//! # Jacaranda Chain
//! Block storage and UTXO validation core for a jacaranda node. This crate
//! owns three things: the append-only segment files where blocks and their
//! undo records live ([ChainWriter]), the index from header hash to a block's
//! place on disk ([BlockIndex]), and the two-tier unspent-output set that
//! block validation runs against ([CoinDatabase]).
//!
//! [ChainState] wires the three together into an apply/undo surface for
//! callers that already decided which chain they are on; networking, mining
//! and wallets live in other crates and only push blocks through here.

pub mod block;
pub mod blockchain;
pub mod config;

pub use blockchain::block_index::BestBlock;
pub use blockchain::block_index::BlockIndex;
pub use blockchain::block_index::BlockRecord;
pub use blockchain::chain_state::ChainState;
pub use blockchain::chain_writer::ChainWriter;
pub use blockchain::chain_writer::FileLocation;
pub use blockchain::chain_writer::UndoBlock;
pub use blockchain::coin_database::Coin;
pub use blockchain::coin_database::CoinDatabase;
pub use blockchain::coin_database::CoinLocator;
pub use blockchain::coin_database::CoinRecord;
pub use blockchain::error::BlockValidationError;
pub use blockchain::error::BlockchainError;
pub use config::Config;
