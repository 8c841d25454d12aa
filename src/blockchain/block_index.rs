//! Point-lookup index from a block's header hash to where that block (and its
//! undo data) lives on disk. Backed by a kv store; no ordering across keys is
//! exposed.

use bitcoin::consensus;
use bitcoin::consensus::deserialize;
use bitcoin::consensus::serialize;
use bitcoin::consensus::Decodable;
use bitcoin::consensus::Encodable;
use bitcoin::hashes::sha256;
use bitcoin::hashes::Hash;
use kv::Bucket;
use kv::Store;
use log::warn;

use super::chain_writer::FileLocation;
use super::error::BlockchainError;
use crate::block::decode_hash;
use crate::block::encode_hash;
use crate::block::BlockHeader;

/// Everything we keep about a stored block: its header, where it sits in the
/// chain, and where its bytes (and undo bytes) live in the segment files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    pub header: BlockHeader,
    pub height: u32,
    pub num_transactions: u32,
    pub block_location: FileLocation,
    pub undo_location: FileLocation,
}

impl Encodable for BlockRecord {
    fn consensus_encode<W: bitcoin::io::Write + ?Sized>(
        &self,
        writer: &mut W,
    ) -> Result<usize, bitcoin::io::Error> {
        let mut len = self.header.consensus_encode(writer)?;
        len += self.height.consensus_encode(writer)?;
        len += self.num_transactions.consensus_encode(writer)?;
        len += self.block_location.consensus_encode(writer)?;
        len += self.undo_location.consensus_encode(writer)?;
        Ok(len)
    }
}

impl Decodable for BlockRecord {
    fn consensus_decode<R: bitcoin::io::Read + ?Sized>(
        reader: &mut R,
    ) -> Result<Self, consensus::encode::Error> {
        Ok(BlockRecord {
            header: BlockHeader::consensus_decode(reader)?,
            height: u32::consensus_decode(reader)?,
            num_transactions: u32::consensus_decode(reader)?,
            block_location: FileLocation::consensus_decode(reader)?,
            undo_location: FileLocation::consensus_decode(reader)?,
        })
    }
}

/// The tip of the chain we last applied, persisted so a restarting node knows
/// where it left off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BestBlock {
    pub height: u32,
    pub hash: sha256::Hash,
}

impl Encodable for BestBlock {
    fn consensus_encode<W: bitcoin::io::Write + ?Sized>(
        &self,
        writer: &mut W,
    ) -> Result<usize, bitcoin::io::Error> {
        let mut len = self.height.consensus_encode(writer)?;
        len += encode_hash(&self.hash, writer)?;
        Ok(len)
    }
}

impl Decodable for BestBlock {
    fn consensus_decode<R: bitcoin::io::Read + ?Sized>(
        reader: &mut R,
    ) -> Result<Self, consensus::encode::Error> {
        Ok(BestBlock {
            height: u32::consensus_decode(reader)?,
            hash: decode_hash(reader)?,
        })
    }
}

pub struct BlockIndex {
    _store: Store,
    records: Bucket<'static, Vec<u8>, Vec<u8>>,
    meta: Bucket<'static, &'static str, Vec<u8>>,
}

impl BlockIndex {
    pub fn new(datadir: &str) -> Result<Self, BlockchainError> {
        let store = Store::new(kv::Config::new(datadir))?;
        Ok(BlockIndex {
            records: store.bucket(Some("records"))?,
            meta: store.bucket(None)?,
            _store: store,
        })
    }

    /// Files `record` under the block's header hash. Store errors propagate;
    /// there is nothing sensible to do with a block we cannot index.
    pub fn put(&self, hash: &sha256::Hash, record: &BlockRecord) -> Result<(), BlockchainError> {
        let key = hash.to_byte_array().to_vec();
        self.records.set(&key, &serialize(record))?;
        self.records.flush()?;
        Ok(())
    }

    /// Looks a block up by header hash. An unknown hash and a record that no
    /// longer deserializes both come back as `None`; the latter is corruption
    /// and gets logged.
    pub fn get(&self, hash: &sha256::Hash) -> Result<Option<BlockRecord>, BlockchainError> {
        let key = hash.to_byte_array().to_vec();
        Ok(self.records.get(&key)?.and_then(|raw| match deserialize(&raw) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("corrupted block record for {hash}: {e}");
                None
            }
        }))
    }

    pub fn save_tip(&self, tip: &BestBlock) -> Result<(), BlockchainError> {
        self.meta.set(&"tip", &serialize(tip))?;
        self.meta.flush()?;
        Ok(())
    }

    pub fn clear_tip(&self) -> Result<(), BlockchainError> {
        self.meta.remove(&"tip")?;
        self.meta.flush()?;
        Ok(())
    }

    pub fn load_tip(&self) -> Result<Option<BestBlock>, BlockchainError> {
        Ok(self.meta.get(&"tip")?.and_then(|raw| match deserialize(&raw) {
            Ok(tip) => Some(tip),
            Err(e) => {
                warn!("corrupted chain tip record: {e}");
                None
            }
        }))
    }
}

#[cfg(test)]
mod test {
    use std::fs::remove_dir_all;

    use bitcoin::consensus::deserialize;
    use bitcoin::consensus::serialize;
    use bitcoin::hashes::sha256;
    use bitcoin::hashes::Hash;

    use super::BestBlock;
    use super::BlockIndex;
    use super::BlockRecord;
    use crate::block::BlockHeader;
    use crate::blockchain::chain_writer::FileLocation;

    fn sample_record(height: u32) -> BlockRecord {
        BlockRecord {
            header: BlockHeader {
                version: 0,
                prev_blockhash: sha256::Hash::hash(b"parent"),
                merkle_root: sha256::Hash::hash(b"merkle"),
                bits: 0x207fffff,
                nonce: height,
                time: 0,
            },
            height,
            num_transactions: 3,
            block_location: FileLocation {
                file_name: "./data/block_0.dat".to_string(),
                start: 0,
                end: 120,
            },
            undo_location: FileLocation::default(),
        }
    }

    #[test]
    fn block_record_roundtrip() {
        let record = sample_record(12);
        let decoded: BlockRecord = deserialize(&serialize(&record)).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn get_returns_what_put_stored() {
        let test_id = rand::random::<u64>();
        let path = format!("./tmp-db/{test_id}/index");
        let index = BlockIndex::new(&path).unwrap();

        let record = sample_record(1);
        let hash = record.header.block_hash();
        index.put(&hash, &record).unwrap();

        assert_eq!(index.get(&hash).unwrap(), Some(record));
        assert_eq!(index.get(&sha256::Hash::hash(b"unknown")).unwrap(), None);

        drop(index);
        remove_dir_all(format!("./tmp-db/{test_id}")).unwrap();
    }

    #[test]
    fn tip_survives_reopen() {
        let test_id = rand::random::<u64>();
        let path = format!("./tmp-db/{test_id}/index");
        let tip = BestBlock {
            height: 42,
            hash: sha256::Hash::hash(b"tip"),
        };

        {
            let index = BlockIndex::new(&path).unwrap();
            assert_eq!(index.load_tip().unwrap(), None);
            index.save_tip(&tip).unwrap();
        }
        {
            let index = BlockIndex::new(&path).unwrap();
            assert_eq!(index.load_tip().unwrap(), Some(tip));
            index.clear_tip().unwrap();
            assert_eq!(index.load_tip().unwrap(), None);
        }
        remove_dir_all(format!("./tmp-db/{test_id}")).unwrap();
    }
}
