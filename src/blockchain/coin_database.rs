//! The coin database answers the question block validation asks for every
//! single input: is this output still unspent?
//!
//! It is layered in two tiers. A bounded in-memory map holds the coins most
//! recently created, keyed by [CoinLocator]; underneath it a kv store holds
//! one [CoinRecord] per transaction, listing the outputs of that transaction
//! that remain unspent. The cache is authoritative: whatever it says about a
//! locator overrides any stale residue in the persistent record, which only
//! catches up when the cache is flushed.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::fmt::Display;
use std::mem;

use bitcoin::consensus;
use bitcoin::consensus::deserialize;
use bitcoin::consensus::serialize;
use bitcoin::consensus::Decodable;
use bitcoin::consensus::Encodable;
use bitcoin::hashes::sha256;
use bitcoin::hashes::Hash;
use bitcoin::ScriptBuf;
use kv::Batch;
use kv::Bucket;
use kv::Store;
use log::error;
use log::trace;
use log::warn;

use super::chain_writer::UndoBlock;
use super::error::BlockValidationError;
use super::error::BlockchainError;
use crate::block::Block;
use crate::block::Transaction;
use crate::block::TxInput;
use crate::block::TxOutput;
use crate::config::Config;

/// Value key naming one output of one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoinLocator {
    pub txid: sha256::Hash,
    pub vout: u32,
}

impl From<&TxInput> for CoinLocator {
    fn from(input: &TxInput) -> Self {
        CoinLocator {
            txid: input.prev_txid,
            vout: input.prev_vout,
        }
    }
}

impl Display for CoinLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

/// A cached output. Spent coins stay in the cache so that the spend reaches
/// the persistent record when the cache is flushed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coin {
    pub output: TxOutput,
    pub is_spent: bool,
}

/// Persisted per-transaction summary of which outputs remain unspent. The
/// three arrays are index-parallel; serialization shares one count so they
/// cannot come back from disk with mismatched lengths. A record that runs out
/// of outputs is deleted from the store rather than written empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoinRecord {
    pub version: u32,
    pub vouts: Vec<u32>,
    pub amounts: Vec<u32>,
    pub locking_scripts: Vec<ScriptBuf>,
}

impl CoinRecord {
    /// Builds the record for a freshly applied transaction, where every
    /// output is still unspent.
    pub fn from_transaction(tx: &Transaction) -> Self {
        let mut record = CoinRecord::default();
        for (vout, output) in tx.outputs.iter().enumerate() {
            record.push(vout as u32, output.amount, output.locking_script.clone());
        }
        record
    }

    pub fn is_empty(&self) -> bool {
        self.vouts.is_empty()
    }

    fn position(&self, vout: u32) -> Option<usize> {
        self.vouts.iter().position(|&v| v == vout)
    }

    pub fn contains(&self, vout: u32) -> bool {
        self.position(vout).is_some()
    }

    fn push(&mut self, vout: u32, amount: u32, locking_script: ScriptBuf) {
        self.vouts.push(vout);
        self.amounts.push(amount);
        self.locking_scripts.push(locking_script);
    }

    /// Drops the entry for `vout`, keeping the arrays parallel. Returns false
    /// if the output wasn't listed.
    fn remove(&mut self, vout: u32) -> bool {
        let Some(index) = self.position(vout) else {
            return false;
        };
        self.vouts.remove(index);
        self.amounts.remove(index);
        self.locking_scripts.remove(index);
        true
    }

    fn output_at(&self, vout: u32) -> Option<TxOutput> {
        self.position(vout).map(|index| TxOutput {
            amount: self.amounts[index],
            locking_script: self.locking_scripts[index].clone(),
        })
    }
}

impl Encodable for CoinRecord {
    fn consensus_encode<W: bitcoin::io::Write + ?Sized>(
        &self,
        writer: &mut W,
    ) -> Result<usize, bitcoin::io::Error> {
        debug_assert_eq!(self.vouts.len(), self.amounts.len());
        debug_assert_eq!(self.locking_scripts.len(), self.amounts.len());

        let mut len = self.version.consensus_encode(writer)?;
        len += (self.vouts.len() as u32).consensus_encode(writer)?;
        for vout in &self.vouts {
            len += vout.consensus_encode(writer)?;
        }
        for amount in &self.amounts {
            len += amount.consensus_encode(writer)?;
        }
        for script in &self.locking_scripts {
            len += script.consensus_encode(writer)?;
        }
        Ok(len)
    }
}

impl Decodable for CoinRecord {
    fn consensus_decode<R: bitcoin::io::Read + ?Sized>(
        reader: &mut R,
    ) -> Result<Self, consensus::encode::Error> {
        let version = u32::consensus_decode(reader)?;
        let count = u32::consensus_decode(reader)?;
        let mut record = CoinRecord {
            version,
            ..Default::default()
        };
        for _ in 0..count {
            record.vouts.push(u32::consensus_decode(reader)?);
        }
        for _ in 0..count {
            record.amounts.push(u32::consensus_decode(reader)?);
        }
        for _ in 0..count {
            record.locking_scripts.push(ScriptBuf::consensus_decode(reader)?);
        }
        Ok(record)
    }
}

/// The two-tier unspent-output set.
pub struct CoinDatabase {
    _store: Store,
    coins: Bucket<'static, Vec<u8>, Vec<u8>>,
    cache: HashMap<CoinLocator, Coin>,
    capacity: usize,
}

impl CoinDatabase {
    pub fn new(config: &Config) -> Result<Self, BlockchainError> {
        let store = Store::new(kv::Config::new(config.coin_db_path.as_str()))?;
        Ok(CoinDatabase {
            coins: store.bucket(Some("coins"))?,
            _store: store,
            cache: HashMap::new(),
            capacity: config.main_cache_capacity as usize,
        })
    }

    /// How many coins the cache currently holds.
    pub fn cache_size(&self) -> usize {
        self.cache.len()
    }

    /// Returns whether every input of every transaction spends an output we
    /// know to be unspent. Mutates nothing; a failed block leaves both tiers
    /// untouched.
    pub fn validate_block(&self, transactions: &[Transaction]) -> bool {
        match self.check_block(transactions) {
            Ok(()) => true,
            Err(reason) => {
                warn!("rejecting block: {reason}");
                false
            }
        }
    }

    /// Like [CoinDatabase::validate_block], but reports which input sank the
    /// block.
    pub fn check_block(&self, transactions: &[Transaction]) -> Result<(), BlockValidationError> {
        for tx in transactions {
            self.check_transaction(tx)?;
        }
        Ok(())
    }

    fn check_transaction(&self, tx: &Transaction) -> Result<(), BlockValidationError> {
        // A coinbase has no inputs, so the loop is a no-op for it.
        for input in &tx.inputs {
            let locator = CoinLocator::from(input);
            if let Some(coin) = self.cache.get(&locator) {
                if coin.is_spent {
                    return Err(BlockValidationError::CoinAlreadySpent(locator));
                }
                continue;
            }
            let record = match self.coin_record(&locator.txid) {
                Ok(record) => record,
                Err(e) => {
                    warn!("coin lookup failed for {locator}: {e}");
                    return Err(BlockValidationError::CoinNotFound(locator));
                }
            };
            match record {
                Some(record) if record.contains(locator.vout) => (),
                _ => return Err(BlockValidationError::CoinNotFound(locator)),
            }
        }
        Ok(())
    }

    /// Applies a validated block's transactions to the coin set, in three
    /// strictly ordered phases: consume the coins its inputs spend, cache its
    /// new outputs (flushing first whenever the cache is full), then persist
    /// one full [CoinRecord] per transaction as the durable shadow of the
    /// cached coins.
    pub fn store_block(&mut self, transactions: &[Transaction]) -> Result<(), BlockchainError> {
        self.spend_inputs(transactions)?;
        self.add_outputs(transactions)?;
        self.write_records(transactions)
    }

    fn spend_inputs(&mut self, transactions: &[Transaction]) -> Result<(), BlockchainError> {
        for tx in transactions {
            for input in &tx.inputs {
                let locator = CoinLocator::from(input);
                match self.cache.get_mut(&locator) {
                    // Keep the entry: the eventual flush carries the spend to
                    // the persistent record.
                    Some(coin) => coin.is_spent = true,
                    None => self.remove_coin_from_record(&locator)?,
                }
            }
        }
        Ok(())
    }

    fn add_outputs(&mut self, transactions: &[Transaction]) -> Result<(), BlockchainError> {
        for tx in transactions {
            let txid = tx.txid();
            for (vout, output) in tx.outputs.iter().enumerate() {
                if self.cache.len() >= self.capacity {
                    self.flush_main_cache()?;
                }
                self.cache.insert(
                    CoinLocator {
                        txid,
                        vout: vout as u32,
                    },
                    Coin {
                        output: output.clone(),
                        is_spent: false,
                    },
                );
            }
        }
        Ok(())
    }

    fn write_records(&self, transactions: &[Transaction]) -> Result<(), BlockchainError> {
        for tx in transactions {
            self.put_record(&tx.txid(), &CoinRecord::from_transaction(tx))?;
        }
        self.coins.flush()?;
        Ok(())
    }

    /// Reverts blocks, newest first in the order the caller gives them.
    /// `undo_blocks[i]` carries the outputs `blocks[i]` destroyed. Each
    /// block's own outputs are erased from both tiers, then the coins it
    /// spent are revived.
    pub fn undo_coins(
        &mut self,
        blocks: &[Block],
        undo_blocks: &[UndoBlock],
    ) -> Result<(), BlockchainError> {
        debug_assert_eq!(blocks.len(), undo_blocks.len());
        for (block, undo_block) in blocks.iter().zip(undo_blocks) {
            for tx in &block.transactions {
                let txid = tx.txid();
                for vout in 0..tx.outputs.len() as u32 {
                    let locator = CoinLocator { txid, vout };
                    self.cache.remove(&locator);
                    self.remove_coin_from_record(&locator)?;
                }
            }
            for i in 0..undo_block.len() {
                let locator = CoinLocator {
                    txid: undo_block.spent_txids[i],
                    vout: undo_block.spent_vouts[i],
                };
                if let Some(coin) = self.cache.get_mut(&locator) {
                    coin.is_spent = false;
                }
                let mut record = self.coin_record(&locator.txid)?.unwrap_or_default();
                // Skip the re-add if the spend never reached the record (it
                // happened in the cache and was not flushed); a vout must not
                // be listed twice.
                if !record.contains(locator.vout) {
                    record.push(
                        locator.vout,
                        undo_block.amounts[i],
                        undo_block.locking_scripts[i].clone(),
                    );
                }
                self.put_record(&locator.txid, &record)?;
            }
        }
        self.coins.flush()?;
        Ok(())
    }

    /// Reconciles every cached coin with its persistent record and empties
    /// the cache. Spent coins are pruned from their records; records left
    /// with no outputs are deleted outright. This is the only point where a
    /// cached spend becomes durable.
    pub fn flush_main_cache(&mut self) -> Result<(), BlockchainError> {
        let cache = mem::take(&mut self.cache);
        let mut updated: HashMap<sha256::Hash, CoinRecord> = HashMap::new();
        for (locator, coin) in cache {
            let record = match updated.entry(locator.txid) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    // Coins cached before their record was written (an
                    // eviction in the middle of a block application) start
                    // from an empty record here; the record proper lands
                    // once the block's third phase runs.
                    let record = match self.coin_record(&locator.txid)? {
                        Some(record) => record,
                        None => {
                            trace!("no coin record yet for cached transaction {}", locator.txid);
                            CoinRecord::default()
                        }
                    };
                    entry.insert(record)
                }
            };
            if coin.is_spent {
                record.remove(locator.vout);
            }
        }

        let mut batch = Batch::new();
        for (txid, record) in &updated {
            let key = txid.to_byte_array().to_vec();
            if record.is_empty() {
                self.coins.remove(&key)?;
            } else {
                batch.set(&key, &serialize(record))?;
            }
        }
        self.coins.batch(batch)?;
        self.coins.flush()?;
        trace!("flushed coin cache, {} records reconciled", updated.len());
        Ok(())
    }

    /// Looks one coin up, cache first. A coin reconstructed from a record is
    /// unspent by construction: spent coins only exist in the cache.
    pub fn get_coin(&self, locator: &CoinLocator) -> Option<Coin> {
        if let Some(coin) = self.cache.get(locator) {
            return Some(coin.clone());
        }
        let record = match self.coin_record(&locator.txid) {
            Ok(record) => record?,
            Err(e) => {
                error!("coin lookup failed for {locator}: {e}");
                return None;
            }
        };
        Some(Coin {
            output: record.output_at(locator.vout)?,
            is_spent: false,
        })
    }

    /// Removes one output from its persistent record, deleting the record
    /// entirely when that was the last one.
    fn remove_coin_from_record(&self, locator: &CoinLocator) -> Result<(), BlockchainError> {
        let Some(mut record) = self.coin_record(&locator.txid)? else {
            return Ok(());
        };
        if !record.remove(locator.vout) {
            return Ok(());
        }
        if record.is_empty() {
            self.delete_record(&locator.txid)
        } else {
            self.put_record(&locator.txid, &record)
        }
    }

    fn coin_record(&self, txid: &sha256::Hash) -> Result<Option<CoinRecord>, BlockchainError> {
        let key = txid.to_byte_array().to_vec();
        let Some(raw) = self.coins.get(&key)? else {
            return Ok(None);
        };
        match deserialize(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                error!("corrupted coin record for transaction {txid}: {e}");
                Ok(None)
            }
        }
    }

    fn put_record(&self, txid: &sha256::Hash, record: &CoinRecord) -> Result<(), BlockchainError> {
        let key = txid.to_byte_array().to_vec();
        self.coins.set(&key, &serialize(record))?;
        Ok(())
    }

    fn delete_record(&self, txid: &sha256::Hash) -> Result<(), BlockchainError> {
        let key = txid.to_byte_array().to_vec();
        self.coins.remove(&key)?;
        Ok(())
    }
}
