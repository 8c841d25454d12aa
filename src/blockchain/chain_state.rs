//! Ties the three storage components together: blocks arrive here, get
//! coin-validated, written to the segment files, indexed by hash, and applied
//! to the coin set; reverted blocks travel the same path backwards.
//!
//! [ChainState] decides nothing about which chain to follow. Callers tell it
//! which blocks to apply and which to undo; consensus checks beyond coin
//! validity (proof-of-work, scripts, timestamps) are the caller's business
//! too.

use bitcoin::hashes::sha256;
use log::info;

use super::block_index::BestBlock;
use super::block_index::BlockIndex;
use super::chain_writer::ChainWriter;
use super::chain_writer::UndoBlock;
use super::coin_database::Coin;
use super::coin_database::CoinDatabase;
use super::coin_database::CoinLocator;
use super::error::BlockValidationError;
use super::error::BlockchainError;
use crate::block::Block;
use crate::block::Transaction;
use crate::config::Config;

pub struct ChainState {
    chain_writer: ChainWriter,
    block_index: BlockIndex,
    coin_database: CoinDatabase,
    best_block: Option<BestBlock>,
}

impl ChainState {
    /// Opens all three components and picks the chain back up at whatever
    /// tip was last persisted.
    pub fn new(config: &Config) -> Result<Self, BlockchainError> {
        let chain_writer = ChainWriter::new(config)?;
        let block_index = BlockIndex::new(&config.block_index_path)?;
        let coin_database = CoinDatabase::new(config)?;
        let best_block = block_index.load_tip()?;
        if let Some(tip) = &best_block {
            info!("resuming chain at height {} ({})", tip.height, tip.hash);
        }
        Ok(ChainState {
            chain_writer,
            block_index,
            coin_database,
            best_block,
        })
    }

    /// Validates and applies one block: its inputs are checked against the
    /// coin set, the block and its freshly derived undo data go to disk, the
    /// index learns where they are, and the coin set advances. On a
    /// validation error nothing is written.
    pub fn accept_block(&mut self, block: &Block, height: u32) -> Result<(), BlockchainError> {
        self.coin_database.check_block(&block.transactions)?;
        let undo_block = self.build_undo_block(&block.transactions)?;

        let record = self.chain_writer.store_block(block, &undo_block, height)?;
        let block_hash = block.block_hash();
        self.block_index.put(&block_hash, &record)?;
        self.coin_database.store_block(&block.transactions)?;

        let tip = BestBlock {
            height,
            hash: block_hash,
        };
        self.block_index.save_tip(&tip)?;
        self.best_block = Some(tip);
        info!("connected block {block_hash} at height {height}");
        Ok(())
    }

    /// Collects, for every input the block consumes, the output it destroys.
    /// This is the data [CoinDatabase::undo_coins] needs to revert the block
    /// later, and it must be captured now: once the block is applied the
    /// spent outputs are gone.
    fn build_undo_block(&self, transactions: &[Transaction]) -> Result<UndoBlock, BlockchainError> {
        let mut undo_block = UndoBlock::default();
        for tx in transactions {
            for input in &tx.inputs {
                let locator = CoinLocator::from(input);
                let coin = self
                    .coin_database
                    .get_coin(&locator)
                    .ok_or(BlockValidationError::CoinNotFound(locator))?;
                undo_block.push(
                    locator.txid,
                    locator.vout,
                    coin.output.amount,
                    coin.output.locking_script,
                );
            }
        }
        Ok(undo_block)
    }

    /// Reverts the given blocks from the coin set, in the caller's order
    /// (newest first for a reorg). The blocks and their undo data are loaded
    /// back from disk; the tip rewinds to the parent of the last block
    /// undone.
    pub fn undo_blocks(&mut self, hashes: &[sha256::Hash]) -> Result<(), BlockchainError> {
        let mut blocks = Vec::new();
        let mut undo_blocks = Vec::new();
        let mut last_undone = None;
        for hash in hashes {
            let record = self
                .block_index
                .get(hash)?
                .ok_or(BlockchainError::BlockNotFound(*hash))?;
            blocks.push(self.chain_writer.read_block(&record.block_location)?);
            undo_blocks.push(if record.undo_location.is_empty() {
                UndoBlock::default()
            } else {
                self.chain_writer.read_undo_block(&record.undo_location)?
            });
            last_undone = Some(record);
        }

        self.coin_database.undo_coins(&blocks, &undo_blocks)?;

        if let Some(record) = last_undone {
            if record.height == 0 {
                self.block_index.clear_tip()?;
                self.best_block = None;
            } else {
                let tip = BestBlock {
                    height: record.height - 1,
                    hash: record.header.prev_blockhash,
                };
                self.block_index.save_tip(&tip)?;
                self.best_block = Some(tip);
            }
            info!("disconnected {} block(s), tip is now {:?}", hashes.len(), self.best_block);
        }
        Ok(())
    }

    /// Loads a block back from the segment files, if we have it.
    pub fn get_block(&self, hash: &sha256::Hash) -> Result<Option<Block>, BlockchainError> {
        let Some(record) = self.block_index.get(hash)? else {
            return Ok(None);
        };
        Ok(Some(self.chain_writer.read_block(&record.block_location)?))
    }

    pub fn get_coin(&self, locator: &CoinLocator) -> Option<Coin> {
        self.coin_database.get_coin(locator)
    }

    /// Coin-validates a block without applying it.
    pub fn validate_block(&self, block: &Block) -> bool {
        self.coin_database.validate_block(&block.transactions)
    }

    pub fn best_block(&self) -> Option<BestBlock> {
        self.best_block
    }

    /// Persists the cached coin state. Should be invoked periodically, and
    /// before shutdown.
    pub fn flush(&mut self) -> Result<(), BlockchainError> {
        self.coin_database.flush_main_cache()
    }

    pub fn coin_database(&self) -> &CoinDatabase {
        &self.coin_database
    }
}
