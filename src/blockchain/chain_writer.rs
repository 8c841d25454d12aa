//! Append-only segment files holding serialized blocks and their undo data.
//!
//! Two independent streams are kept, one for blocks and one for undo records.
//! Each stream is a numbered sequence of files `"{dir}/{prefix}_{n}{ext}"`;
//! when the active file would outgrow its size cap we rotate to the next
//! number. Records are raw concatenated bytes, there is no framing inside a
//! file: the `(start, end)` offsets handed back on write are the only way to
//! find a record again.

use std::fs::File;
use std::fs::OpenOptions;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use bitcoin::consensus;
use bitcoin::consensus::deserialize;
use bitcoin::consensus::serialize;
use bitcoin::consensus::Decodable;
use bitcoin::consensus::Encodable;
use bitcoin::hashes::sha256;
use bitcoin::ScriptBuf;
use log::error;
use log::trace;

use super::block_index::BlockRecord;
use super::error::BlockchainError;
use crate::block::decode_hash;
use crate::block::encode_hash;
use crate::block::Block;
use crate::config::Config;

/// Where a record lives on disk. An empty location (no file name, zero
/// offsets) means "no data was written", which is how blocks without undo
/// data are marked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileLocation {
    pub file_name: String,
    pub start: u32,
    pub end: u32,
}

impl FileLocation {
    pub fn is_empty(&self) -> bool {
        self.file_name.is_empty() && self.start == 0 && self.end == 0
    }

    fn len(&self) -> usize {
        self.end.saturating_sub(self.start) as usize
    }
}

impl Encodable for FileLocation {
    fn consensus_encode<W: bitcoin::io::Write + ?Sized>(
        &self,
        writer: &mut W,
    ) -> Result<usize, bitcoin::io::Error> {
        let mut len = self.file_name.as_bytes().to_vec().consensus_encode(writer)?;
        len += self.start.consensus_encode(writer)?;
        len += self.end.consensus_encode(writer)?;
        Ok(len)
    }
}

impl Decodable for FileLocation {
    fn consensus_decode<R: bitcoin::io::Read + ?Sized>(
        reader: &mut R,
    ) -> Result<Self, consensus::encode::Error> {
        let file_name = String::from_utf8(Vec::<u8>::consensus_decode(reader)?)
            .map_err(|_| consensus::encode::Error::ParseFailed("file name is not valid utf-8"))?;
        Ok(FileLocation {
            file_name,
            start: u32::consensus_decode(reader)?,
            end: u32::consensus_decode(reader)?,
        })
    }
}

/// Side data needed to revert one block's effect on the coin set: for every
/// input the block consumed, the output it destroyed. The four arrays are
/// index-parallel; a single shared count is serialized so they cannot come
/// back from disk with mismatched lengths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UndoBlock {
    pub spent_txids: Vec<sha256::Hash>,
    pub spent_vouts: Vec<u32>,
    pub amounts: Vec<u32>,
    pub locking_scripts: Vec<ScriptBuf>,
}

impl UndoBlock {
    /// True for blocks that consumed no coins, like a chain's first block.
    pub fn is_empty(&self) -> bool {
        self.amounts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.amounts.len()
    }

    pub fn push(&mut self, txid: sha256::Hash, vout: u32, amount: u32, locking_script: ScriptBuf) {
        self.spent_txids.push(txid);
        self.spent_vouts.push(vout);
        self.amounts.push(amount);
        self.locking_scripts.push(locking_script);
    }
}

impl Encodable for UndoBlock {
    fn consensus_encode<W: bitcoin::io::Write + ?Sized>(
        &self,
        writer: &mut W,
    ) -> Result<usize, bitcoin::io::Error> {
        debug_assert_eq!(self.spent_txids.len(), self.amounts.len());
        debug_assert_eq!(self.spent_vouts.len(), self.amounts.len());
        debug_assert_eq!(self.locking_scripts.len(), self.amounts.len());

        let mut len = (self.amounts.len() as u32).consensus_encode(writer)?;
        for txid in &self.spent_txids {
            len += encode_hash(txid, writer)?;
        }
        for vout in &self.spent_vouts {
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

impl Decodable for UndoBlock {
    fn consensus_decode<R: bitcoin::io::Read + ?Sized>(
        reader: &mut R,
    ) -> Result<Self, consensus::encode::Error> {
        let count = u32::consensus_decode(reader)?;
        let mut undo = UndoBlock::default();
        for _ in 0..count {
            undo.spent_txids.push(decode_hash(reader)?);
        }
        for _ in 0..count {
            undo.spent_vouts.push(u32::consensus_decode(reader)?);
        }
        for _ in 0..count {
            undo.amounts.push(u32::consensus_decode(reader)?);
        }
        for _ in 0..count {
            undo.locking_scripts.push(ScriptBuf::consensus_decode(reader)?);
        }
        Ok(undo)
    }
}

/// One append-only stream of numbered segment files.
struct SegmentFile {
    dir: PathBuf,
    prefix: String,
    extension: String,
    max_file_size: u32,
    file_number: u32,
    offset: u32,
}

impl SegmentFile {
    fn new(dir: &Path, prefix: &str, extension: &str, max_file_size: u32) -> Self {
        SegmentFile {
            dir: dir.to_path_buf(),
            prefix: prefix.to_string(),
            extension: extension.to_string(),
            max_file_size,
            file_number: 0,
            offset: 0,
        }
    }

    fn current_path(&self) -> PathBuf {
        self.dir
            .join(format!("{}_{}{}", self.prefix, self.file_number, self.extension))
    }

    /// Appends `data` to the active file, rotating first if it would not fit.
    /// A record larger than the cap still goes into a fresh file whole: one
    /// record never spans two files.
    fn append(&mut self, data: &[u8]) -> Result<FileLocation, std::io::Error> {
        if self.offset + data.len() as u32 > self.max_file_size {
            self.file_number += 1;
            self.offset = 0;
            trace!(
                "rotating segment stream {} to file number {}",
                self.prefix,
                self.file_number
            );
        }
        let path = self.current_path();
        let mut file = open_owner_only(&path)?;
        file.write_all(data)?;

        let start = self.offset;
        self.offset += data.len() as u32;
        Ok(FileLocation {
            file_name: path.to_string_lossy().into_owned(),
            start,
            end: start + data.len() as u32,
        })
    }
}

#[cfg(unix)]
fn open_owner_only(path: &Path) -> Result<File, std::io::Error> {
    use std::os::unix::fs::OpenOptionsExt;
    OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_owner_only(path: &Path) -> Result<File, std::io::Error> {
    OpenOptions::new().create(true).append(true).open(path)
}

#[cfg(unix)]
fn create_data_dir(path: &Path) -> Result<(), std::io::Error> {
    use std::fs::DirBuilder;
    use std::os::unix::fs::DirBuilderExt;
    DirBuilder::new().recursive(true).mode(0o700).create(path)
}

#[cfg(not(unix))]
fn create_data_dir(path: &Path) -> Result<(), std::io::Error> {
    std::fs::create_dir_all(path)
}

/// Handles all block and undo-block I/O for the chain: serialized records go
/// into segment files, and the returned [BlockRecord] tells where to find
/// them again.
pub struct ChainWriter {
    blocks: SegmentFile,
    undo: SegmentFile,
}

impl ChainWriter {
    /// Creates the data directory (owner-only) and positions both streams at
    /// file zero, offset zero. Failing to create the directory is fatal for
    /// the whole core, so this error should not be swallowed.
    pub fn new(config: &Config) -> Result<Self, BlockchainError> {
        let dir = Path::new(&config.data_dir);
        create_data_dir(dir)?;
        Ok(ChainWriter {
            blocks: SegmentFile::new(
                dir,
                &config.block_file_prefix,
                &config.file_extension,
                config.max_block_file_size,
            ),
            undo: SegmentFile::new(
                dir,
                &config.undo_file_prefix,
                &config.file_extension,
                config.max_undo_file_size,
            ),
        })
    }

    /// Stores a block and its undo data, returning the [BlockRecord] to file
    /// under the block's hash. Empty undo blocks are not written at all; the
    /// record carries an empty undo location instead.
    pub fn store_block(
        &mut self,
        block: &Block,
        undo_block: &UndoBlock,
        height: u32,
    ) -> Result<BlockRecord, BlockchainError> {
        let block_location = self.write_block(&serialize(block))?;
        let undo_location = if undo_block.is_empty() {
            FileLocation::default()
        } else {
            self.write_undo_block(&serialize(undo_block))?
        };
        Ok(BlockRecord {
            header: block.header,
            height,
            num_transactions: block.transactions.len() as u32,
            block_location,
            undo_location,
        })
    }

    /// Appends a serialized block to the block stream.
    pub fn write_block(&mut self, raw_block: &[u8]) -> Result<FileLocation, BlockchainError> {
        self.blocks.append(raw_block).map_err(|e| {
            error!("failed to append block to segment file: {e}");
            e.into()
        })
    }

    /// Appends a serialized undo block to the undo stream.
    pub fn write_undo_block(&mut self, raw_undo: &[u8]) -> Result<FileLocation, BlockchainError> {
        self.undo.append(raw_undo).map_err(|e| {
            error!("failed to append undo block to segment file: {e}");
            e.into()
        })
    }

    /// Reads a block back from the segment files. A location that reads fine
    /// but doesn't deserialize means the file was corrupted or truncated
    /// under us.
    pub fn read_block(&self, location: &FileLocation) -> Result<Block, BlockchainError> {
        let raw = read_location(location)?;
        deserialize(&raw).map_err(|e| {
            error!("corrupted block at {location:?}: {e}");
            e.into()
        })
    }

    /// Reads an undo block back from the segment files. Callers must not pass
    /// an empty location here; blocks without undo data have nothing to read.
    pub fn read_undo_block(&self, location: &FileLocation) -> Result<UndoBlock, BlockchainError> {
        let raw = read_location(location)?;
        deserialize(&raw).map_err(|e| {
            error!("corrupted undo block at {location:?}: {e}");
            e.into()
        })
    }
}

fn read_location(location: &FileLocation) -> Result<Vec<u8>, std::io::Error> {
    let mut file = File::open(&location.file_name)?;
    file.seek(SeekFrom::Start(location.start as u64))?;
    let mut raw = vec![0_u8; location.len()];
    file.read_exact(&mut raw)?;
    Ok(raw)
}

#[cfg(test)]
mod test {
    use std::fs::remove_dir_all;
    use std::path::Path;

    use bitcoin::consensus::deserialize;
    use bitcoin::consensus::serialize;
    use bitcoin::hashes::sha256;
    use bitcoin::hashes::Hash;
    use bitcoin::ScriptBuf;

    use super::ChainWriter;
    use super::FileLocation;
    use super::UndoBlock;
    use crate::block::Block;
    use crate::block::BlockHeader;
    use crate::block::Transaction;
    use crate::block::TxOutput;
    use crate::config::Config;

    fn test_config(max_block_file_size: u32) -> Config {
        let test_id = rand::random::<u64>();
        Config {
            data_dir: format!("./tmp-db/{test_id}/chain"),
            max_block_file_size,
            max_undo_file_size: max_block_file_size,
            ..Default::default()
        }
    }

    fn block_with_payload(payload_len: usize, nonce: u32) -> Block {
        Block {
            header: BlockHeader {
                version: 0,
                prev_blockhash: sha256::Hash::all_zeros(),
                merkle_root: sha256::Hash::all_zeros(),
                bits: 0x207fffff,
                nonce,
                time: 0,
            },
            transactions: vec![Transaction {
                version: 0,
                inputs: Vec::new(),
                outputs: vec![TxOutput {
                    amount: 50,
                    locking_script: ScriptBuf::from_bytes(vec![0xab; payload_len]),
                }],
                lock_time: 0,
            }],
        }
    }

    #[test]
    fn undo_block_roundtrip() {
        let mut undo = UndoBlock::default();
        undo.push(
            sha256::Hash::hash(b"tx1"),
            0,
            50,
            ScriptBuf::from_bytes(b"alice".to_vec()),
        );
        undo.push(
            sha256::Hash::hash(b"tx2"),
            3,
            20,
            ScriptBuf::from_bytes(b"bob".to_vec()),
        );
        let decoded: UndoBlock = deserialize(&serialize(&undo)).unwrap();
        assert_eq!(decoded, undo);
        assert!(!decoded.is_empty());
        assert_eq!(decoded.len(), 2);
    }

    #[test]
    fn empty_file_location_marks_missing_undo_data() {
        let location = FileLocation::default();
        assert!(location.is_empty());
        let decoded: FileLocation = deserialize(&serialize(&location)).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn stored_blocks_read_back_bit_exact() {
        let config = test_config(1024 * 1024);
        let mut writer = ChainWriter::new(&config).unwrap();

        let block = block_with_payload(100, 1);
        let mut undo = UndoBlock::default();
        undo.push(
            sha256::Hash::hash(b"spent"),
            1,
            30,
            ScriptBuf::from_bytes(b"carol".to_vec()),
        );

        let record = writer.store_block(&block, &undo, 7).unwrap();
        assert_eq!(record.height, 7);
        assert_eq!(record.num_transactions, 1);
        assert!(!record.undo_location.is_empty());

        assert_eq!(writer.read_block(&record.block_location).unwrap(), block);
        assert_eq!(writer.read_undo_block(&record.undo_location).unwrap(), undo);
        remove_dir_all(&config.data_dir).unwrap();
    }

    #[test]
    fn empty_undo_block_is_not_written() {
        let config = test_config(1024 * 1024);
        let mut writer = ChainWriter::new(&config).unwrap();

        let record = writer
            .store_block(&block_with_payload(10, 2), &UndoBlock::default(), 0)
            .unwrap();
        assert!(record.undo_location.is_empty());
        assert!(!record.block_location.is_empty());
        remove_dir_all(&config.data_dir).unwrap();
    }

    #[test]
    fn writes_rotate_across_segment_files() {
        let config = test_config(1024);
        let mut writer = ChainWriter::new(&config).unwrap();

        // Each block serializes to roughly 600 bytes, so no two of them share
        // a segment file.
        let blocks: Vec<Block> = (0..3).map(|n| block_with_payload(550, n)).collect();
        let mut records = Vec::new();
        for (height, block) in blocks.iter().enumerate() {
            records.push(
                writer
                    .store_block(block, &UndoBlock::default(), height as u32)
                    .unwrap(),
            );
        }

        let names: Vec<&str> = records
            .iter()
            .map(|r| r.block_location.file_name.as_str())
            .collect();
        assert_ne!(names[0], names[1]);
        assert_ne!(names[1], names[2]);
        assert_eq!(records[1].block_location.start, 0);
        assert_eq!(records[2].block_location.start, 0);

        for (block, record) in blocks.iter().zip(&records) {
            assert_eq!(&writer.read_block(&record.block_location).unwrap(), block);
        }
        remove_dir_all(&config.data_dir).unwrap();
    }

    #[test]
    fn oversized_record_still_lands_in_one_file() {
        let config = test_config(256);
        let mut writer = ChainWriter::new(&config).unwrap();

        writer
            .store_block(&block_with_payload(16, 0), &UndoBlock::default(), 0)
            .unwrap();
        let record = writer
            .store_block(&block_with_payload(600, 1), &UndoBlock::default(), 1)
            .unwrap();

        // The oversized block overflows a fresh file rather than being split.
        assert_eq!(record.block_location.start, 0);
        assert!(record.block_location.end > 256);
        assert_eq!(
            writer.read_block(&record.block_location).unwrap(),
            block_with_payload(600, 1)
        );
        assert!(Path::new(&record.block_location.file_name).exists());
        remove_dir_all(&config.data_dir).unwrap();
    }
}
