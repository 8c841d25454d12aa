//! Block data model used by the storage and validation core.
//!
//! Everything that ever touches disk implements [Encodable] and [Decodable],
//! so a single, deterministic byte format is shared by the segment files and
//! the key-value stores. Identifiers (header hashes and txids) are the sha256
//! of the serialized item.

use bitcoin::consensus;
use bitcoin::consensus::serialize;
use bitcoin::consensus::Decodable;
use bitcoin::consensus::Encodable;
use bitcoin::hashes::sha256;
use bitcoin::hashes::Hash;
use bitcoin::ScriptBuf;
use sha2::Digest;
use sha2::Sha256;

/// Computes the sha256 content hash of an arbitrary byte string.
pub fn content_hash(data: &[u8]) -> sha256::Hash {
    let digest = Sha256::new().chain_update(data).finalize();
    sha256::Hash::from_slice(digest.as_slice()).expect("sha256 digests are 32 bytes")
}

pub(crate) fn encode_hash<W: bitcoin::io::Write + ?Sized>(
    hash: &sha256::Hash,
    writer: &mut W,
) -> Result<usize, bitcoin::io::Error> {
    hash.to_byte_array().consensus_encode(writer)
}

pub(crate) fn decode_hash<R: bitcoin::io::Read + ?Sized>(
    reader: &mut R,
) -> Result<sha256::Hash, consensus::encode::Error> {
    Ok(sha256::Hash::from_byte_array(<[u8; 32]>::consensus_decode(
        reader,
    )?))
}

/// A block header. `prev_blockhash` commits to the chain this block extends,
/// `merkle_root` commits to the transactions inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_blockhash: sha256::Hash,
    pub merkle_root: sha256::Hash,
    /// Compact difficulty target this header claims to meet.
    pub bits: u32,
    pub nonce: u32,
    pub time: u32,
}

impl BlockHeader {
    /// Returns the hash of this header, used as the block's identity.
    pub fn block_hash(&self) -> sha256::Hash {
        content_hash(&serialize(self))
    }
}

impl Encodable for BlockHeader {
    fn consensus_encode<W: bitcoin::io::Write + ?Sized>(
        &self,
        writer: &mut W,
    ) -> Result<usize, bitcoin::io::Error> {
        let mut len = self.version.consensus_encode(writer)?;
        len += encode_hash(&self.prev_blockhash, writer)?;
        len += encode_hash(&self.merkle_root, writer)?;
        len += self.bits.consensus_encode(writer)?;
        len += self.nonce.consensus_encode(writer)?;
        len += self.time.consensus_encode(writer)?;
        Ok(len)
    }
}

impl Decodable for BlockHeader {
    fn consensus_decode<R: bitcoin::io::Read + ?Sized>(
        reader: &mut R,
    ) -> Result<Self, consensus::encode::Error> {
        Ok(BlockHeader {
            version: u32::consensus_decode(reader)?,
            prev_blockhash: decode_hash(reader)?,
            merkle_root: decode_hash(reader)?,
            bits: u32::consensus_decode(reader)?,
            nonce: u32::consensus_decode(reader)?,
            time: u32::consensus_decode(reader)?,
        })
    }
}

/// One spend of a previously created output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    /// Txid of the transaction that created the output being spent.
    pub prev_txid: sha256::Hash,
    /// Which of that transaction's outputs is being spent.
    pub prev_vout: u32,
    pub unlocking_script: ScriptBuf,
    pub witness: Vec<Vec<u8>>,
}

impl Encodable for TxInput {
    fn consensus_encode<W: bitcoin::io::Write + ?Sized>(
        &self,
        writer: &mut W,
    ) -> Result<usize, bitcoin::io::Error> {
        let mut len = encode_hash(&self.prev_txid, writer)?;
        len += self.prev_vout.consensus_encode(writer)?;
        len += self.unlocking_script.consensus_encode(writer)?;
        len += (self.witness.len() as u32).consensus_encode(writer)?;
        for item in &self.witness {
            len += item.consensus_encode(writer)?;
        }
        Ok(len)
    }
}

impl Decodable for TxInput {
    fn consensus_decode<R: bitcoin::io::Read + ?Sized>(
        reader: &mut R,
    ) -> Result<Self, consensus::encode::Error> {
        let prev_txid = decode_hash(reader)?;
        let prev_vout = u32::consensus_decode(reader)?;
        let unlocking_script = ScriptBuf::consensus_decode(reader)?;
        let count = u32::consensus_decode(reader)?;
        let mut witness = Vec::new();
        for _ in 0..count {
            witness.push(Vec::<u8>::consensus_decode(reader)?);
        }
        Ok(TxInput {
            prev_txid,
            prev_vout,
            unlocking_script,
            witness,
        })
    }
}

/// A newly created coin: an amount locked by a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    pub amount: u32,
    pub locking_script: ScriptBuf,
}

impl Encodable for TxOutput {
    fn consensus_encode<W: bitcoin::io::Write + ?Sized>(
        &self,
        writer: &mut W,
    ) -> Result<usize, bitcoin::io::Error> {
        let mut len = self.amount.consensus_encode(writer)?;
        len += self.locking_script.consensus_encode(writer)?;
        Ok(len)
    }
}

impl Decodable for TxOutput {
    fn consensus_decode<R: bitcoin::io::Read + ?Sized>(
        reader: &mut R,
    ) -> Result<Self, consensus::encode::Error> {
        Ok(TxOutput {
            amount: u32::consensus_decode(reader)?,
            locking_script: ScriptBuf::consensus_decode(reader)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,
}

impl Transaction {
    /// Returns this transaction's identity, the hash of its serialization.
    pub fn txid(&self) -> sha256::Hash {
        content_hash(&serialize(self))
    }

    /// A coinbase mints new coins and spends nothing.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.is_empty()
    }
}

impl Encodable for Transaction {
    fn consensus_encode<W: bitcoin::io::Write + ?Sized>(
        &self,
        writer: &mut W,
    ) -> Result<usize, bitcoin::io::Error> {
        let mut len = self.version.consensus_encode(writer)?;
        len += (self.inputs.len() as u32).consensus_encode(writer)?;
        for input in &self.inputs {
            len += input.consensus_encode(writer)?;
        }
        len += (self.outputs.len() as u32).consensus_encode(writer)?;
        for output in &self.outputs {
            len += output.consensus_encode(writer)?;
        }
        len += self.lock_time.consensus_encode(writer)?;
        Ok(len)
    }
}

impl Decodable for Transaction {
    fn consensus_decode<R: bitcoin::io::Read + ?Sized>(
        reader: &mut R,
    ) -> Result<Self, consensus::encode::Error> {
        let version = u32::consensus_decode(reader)?;
        let count = u32::consensus_decode(reader)?;
        let mut inputs = Vec::new();
        for _ in 0..count {
            inputs.push(TxInput::consensus_decode(reader)?);
        }
        let count = u32::consensus_decode(reader)?;
        let mut outputs = Vec::new();
        for _ in 0..count {
            outputs.push(TxOutput::consensus_decode(reader)?);
        }
        Ok(Transaction {
            version,
            inputs,
            outputs,
            lock_time: u32::consensus_decode(reader)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn block_hash(&self) -> sha256::Hash {
        self.header.block_hash()
    }
}

impl Encodable for Block {
    fn consensus_encode<W: bitcoin::io::Write + ?Sized>(
        &self,
        writer: &mut W,
    ) -> Result<usize, bitcoin::io::Error> {
        let mut len = self.header.consensus_encode(writer)?;
        len += (self.transactions.len() as u32).consensus_encode(writer)?;
        for tx in &self.transactions {
            len += tx.consensus_encode(writer)?;
        }
        Ok(len)
    }
}

impl Decodable for Block {
    fn consensus_decode<R: bitcoin::io::Read + ?Sized>(
        reader: &mut R,
    ) -> Result<Self, consensus::encode::Error> {
        let header = BlockHeader::consensus_decode(reader)?;
        let count = u32::consensus_decode(reader)?;
        let mut transactions = Vec::new();
        for _ in 0..count {
            transactions.push(Transaction::consensus_decode(reader)?);
        }
        Ok(Block {
            header,
            transactions,
        })
    }
}

#[cfg(test)]
mod test {
    use bitcoin::consensus::deserialize;
    use bitcoin::consensus::serialize;
    use bitcoin::hashes::sha256;
    use bitcoin::hashes::Hash;
    use bitcoin::ScriptBuf;

    use super::Block;
    use super::BlockHeader;
    use super::Transaction;
    use super::TxInput;
    use super::TxOutput;

    fn sample_block() -> Block {
        let coinbase = Transaction {
            version: 0,
            inputs: Vec::new(),
            outputs: vec![TxOutput {
                amount: 50,
                locking_script: ScriptBuf::from_bytes(b"alice".to_vec()),
            }],
            lock_time: 0,
        };
        let spend = Transaction {
            version: 0,
            inputs: vec![TxInput {
                prev_txid: coinbase.txid(),
                prev_vout: 0,
                unlocking_script: ScriptBuf::from_bytes(b"alice sig".to_vec()),
                witness: vec![b"w0".to_vec(), b"w1".to_vec()],
            }],
            outputs: vec![
                TxOutput {
                    amount: 30,
                    locking_script: ScriptBuf::from_bytes(b"bob".to_vec()),
                },
                TxOutput {
                    amount: 20,
                    locking_script: ScriptBuf::from_bytes(b"alice".to_vec()),
                },
            ],
            lock_time: 42,
        };
        Block {
            header: BlockHeader {
                version: 0,
                prev_blockhash: sha256::Hash::all_zeros(),
                merkle_root: sha256::Hash::all_zeros(),
                bits: 0x207fffff,
                nonce: 7,
                time: 1_231_006_505,
            },
            transactions: vec![coinbase, spend],
        }
    }

    #[test]
    fn block_roundtrip() {
        let block = sample_block();
        let decoded: Block = deserialize(&serialize(&block)).expect("codec roundtrip");
        assert_eq!(decoded, block);
    }

    #[test]
    fn txid_is_stable() {
        let block = sample_block();
        let txid = block.transactions[1].txid();
        let decoded: Block = deserialize(&serialize(&block)).unwrap();
        assert_eq!(decoded.transactions[1].txid(), txid);
    }

    #[test]
    fn coinbase_has_no_inputs() {
        let block = sample_block();
        assert!(block.transactions[0].is_coinbase());
        assert!(!block.transactions[1].is_coinbase());
    }

    #[test]
    fn header_hash_commits_to_all_fields() {
        let block = sample_block();
        let mut tweaked = block.header;
        tweaked.nonce += 1;
        assert_ne!(tweaked.block_hash(), block.header.block_hash());
    }
}
