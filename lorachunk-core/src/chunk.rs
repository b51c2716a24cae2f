//! Chunk store: split an outbound file into numbered, checksummed chunks.

use std::ops::RangeInclusive;

use rand::Rng;

use crate::integrity;
use crate::wire::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};

/// Range file ids are drawn from. Ids below 0x0100 and 0xFFFF are never issued.
pub const FILE_ID_RANGE: RangeInclusive<u16> = 0x0100..=0xFFFE;

/// One chunk of file data: sequence number, checksum, bytes.
/// `data` is at most the chunk size; only the last chunk may be shorter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub seq: u16,
    pub checksum: u8,
    pub data: Vec<u8>,
}

/// Sender-side file split into chunks. Lives for one outbound transfer.
#[derive(Debug, Clone)]
pub struct ChunkStore {
    file_id: u16,
    file_size: u32,
    chunks: Vec<Chunk>,
}

impl ChunkStore {
    /// Split `bytes` under a fresh random file id. A `chunk_size` of 0 selects
    /// the default.
    pub fn split(bytes: &[u8], chunk_size: usize) -> Result<Self, ChunkError> {
        let file_id = rand::thread_rng().gen_range(FILE_ID_RANGE);
        Self::split_with_id(file_id, bytes, chunk_size)
    }

    /// Split under an explicit file id.
    pub fn split_with_id(file_id: u16, bytes: &[u8], chunk_size: usize) -> Result<Self, ChunkError> {
        if !FILE_ID_RANGE.contains(&file_id) {
            return Err(ChunkError::ReservedFileId(file_id));
        }
        let size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        if size > MAX_CHUNK_SIZE {
            return Err(ChunkError::ChunkSize(size));
        }
        if bytes.is_empty() {
            return Err(ChunkError::Empty);
        }
        let file_size = u32::try_from(bytes.len()).map_err(|_| ChunkError::TooLarge(bytes.len()))?;
        let count = bytes.len().div_ceil(size);
        if count > usize::from(u16::MAX) {
            return Err(ChunkError::TooManyChunks(count));
        }

        let chunks = bytes
            .chunks(size)
            .enumerate()
            .map(|(i, data)| Chunk {
                // count <= u16::MAX, so every index fits
                seq: i as u16,
                checksum: integrity::checksum(data),
                data: data.to_vec(),
            })
            .collect();
        Ok(Self {
            file_id,
            file_size,
            chunks,
        })
    }

    pub fn file_id(&self) -> u16 {
        self.file_id
    }

    pub fn file_size(&self) -> u32 {
        self.file_size
    }

    pub fn total_chunks(&self) -> u16 {
        self.chunks.len() as u16
    }

    pub fn get(&self, seq: u16) -> Option<&Chunk> {
        self.chunks.get(usize::from(seq))
    }

    /// Chunks in ascending seq order.
    pub fn iter(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkError {
    #[error("file is empty")]
    Empty,
    #[error("file needs {0} chunks, at most 65535 fit a transfer")]
    TooManyChunks(usize),
    #[error("file of {0} bytes exceeds the 4 GiB size field")]
    TooLarge(usize),
    #[error("chunk size {0} does not fit one radio frame")]
    ChunkSize(usize),
    #[error("file id 0x{0:04X} is reserved")]
    ReservedFileId(u16),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + 3) as u8).collect()
    }

    #[test]
    fn split_with_short_tail() {
        let bytes = sample(853);
        let store = ChunkStore::split_with_id(0x1234, &bytes, 200).unwrap();
        assert_eq!(store.file_id(), 0x1234);
        assert_eq!(store.total_chunks(), 5);
        assert_eq!(store.file_size(), 853);
        let lens: Vec<usize> = store.iter().map(|c| c.data.len()).collect();
        assert_eq!(lens, vec![200, 200, 200, 200, 53]);

        let rebuilt: Vec<u8> = store.iter().flat_map(|c| c.data.clone()).collect();
        assert_eq!(rebuilt, bytes);
    }

    #[test]
    fn split_exact_multiple() {
        let store = ChunkStore::split_with_id(0x0100, &sample(600), 200).unwrap();
        assert_eq!(store.total_chunks(), 3);
        assert_eq!(store.get(2).unwrap().data.len(), 200);
        assert!(store.get(3).is_none());
    }

    #[test]
    fn split_single_chunk() {
        let store = ChunkStore::split_with_id(0x0100, &sample(10), 100).unwrap();
        assert_eq!(store.total_chunks(), 1);
        assert_eq!(store.get(0).unwrap().seq, 0);
    }

    #[test]
    fn checksums_computed_at_split() {
        let store = ChunkStore::split_with_id(0x0100, &sample(450), 200).unwrap();
        for chunk in store.iter() {
            assert!(integrity::verify_chunk(&chunk.data, chunk.checksum));
        }
        let seqs: Vec<u16> = store.iter().map(|c| c.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn zero_chunk_size_uses_default() {
        let store = ChunkStore::split_with_id(0x0100, &sample(DEFAULT_CHUNK_SIZE * 2), 0).unwrap();
        assert_eq!(store.total_chunks(), 2);
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(
            ChunkStore::split_with_id(0x0100, &[], 200).unwrap_err(),
            ChunkError::Empty
        );
        assert_eq!(
            ChunkStore::split_with_id(0x0100, &[1], MAX_CHUNK_SIZE + 1).unwrap_err(),
            ChunkError::ChunkSize(MAX_CHUNK_SIZE + 1)
        );
        assert_eq!(
            ChunkStore::split_with_id(0x00FF, &[1], 200).unwrap_err(),
            ChunkError::ReservedFileId(0x00FF)
        );
        assert_eq!(
            ChunkStore::split_with_id(0xFFFF, &[1], 200).unwrap_err(),
            ChunkError::ReservedFileId(0xFFFF)
        );
    }

    #[test]
    fn too_many_chunks() {
        let bytes = vec![0u8; usize::from(u16::MAX) + 1];
        assert_eq!(
            ChunkStore::split_with_id(0x0100, &bytes, 1).unwrap_err(),
            ChunkError::TooManyChunks(usize::from(u16::MAX) + 1)
        );
    }

    #[test]
    fn random_file_ids_in_range() {
        for _ in 0..200 {
            let store = ChunkStore::split(&[1, 2, 3], 0).unwrap();
            assert!(FILE_ID_RANGE.contains(&store.file_id()));
        }
    }
}
