//! Chunk source and sink: split a file into the transfer's logical units, and append received units to disk.
//!
//! A non-empty file is sent as `[digest][block]..[block(END)]`; an empty file as a single empty END.

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::integrity;
use crate::protocol::{PacketKind, MAX_PAYLOAD};

/// Default block size: everything a datagram can carry after the header.
pub const DEFAULT_CHUNK_SIZE: usize = MAX_PAYLOAD;

/// One logical unit of a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub payload: Vec<u8>,
    pub kind: PacketKind,
}

impl Chunk {
    pub fn data(payload: Vec<u8>) -> Self {
        Self {
            payload,
            kind: PacketKind::Data,
        }
    }

    pub fn end(payload: Vec<u8>) -> Self {
        Self {
            payload,
            kind: PacketKind::End,
        }
    }
}

enum ReaderState {
    Digest(String),
    Blocks,
    EmptyEnd,
    Done,
}

/// Lazy, single-use reader over one file. Yields the digest, then blocks; the last block is flagged END.
pub struct ChunkReader {
    file: Option<File>,
    chunk_size: usize,
    lookahead: Option<Vec<u8>>,
    state: ReaderState,
}

impl ChunkReader {
    /// Open `path` for a new transfer. Hashes the whole file up front.
    pub fn open(path: &Path, chunk_size: usize) -> io::Result<Self> {
        let chunk_size = if chunk_size == 0 || chunk_size > MAX_PAYLOAD {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        if std::fs::metadata(path)?.len() == 0 {
            return Ok(Self {
                file: None,
                chunk_size,
                lookahead: None,
                state: ReaderState::EmptyEnd,
            });
        }
        let digest = integrity::hash_file(path)?;
        Ok(Self {
            file: Some(File::open(path)?),
            chunk_size,
            lookahead: None,
            state: ReaderState::Digest(digest),
        })
    }

    fn read_block(&mut self) -> io::Result<Vec<u8>> {
        let Some(file) = self.file.as_mut() else {
            return Ok(Vec::new());
        };
        let mut block = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < block.len() {
            match file.read(&mut block[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        block.truncate(filled);
        Ok(block)
    }

    fn next_block(&mut self) -> io::Result<Chunk> {
        let current = match self.lookahead.take() {
            Some(b) => b,
            None => self.read_block()?,
        };
        if current.is_empty() {
            self.finish();
            return Ok(Chunk::end(current));
        }
        let following = self.read_block()?;
        if following.is_empty() {
            self.finish();
            Ok(Chunk::end(current))
        } else {
            self.lookahead = Some(following);
            Ok(Chunk::data(current))
        }
    }

    fn finish(&mut self) {
        self.state = ReaderState::Done;
        self.file = None;
    }
}

impl Iterator for ChunkReader {
    type Item = io::Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        match std::mem::replace(&mut self.state, ReaderState::Blocks) {
            ReaderState::Digest(digest) => Some(Ok(Chunk::data(digest.into_bytes()))),
            ReaderState::Blocks => {
                let r = self.next_block();
                if r.is_err() {
                    self.finish();
                }
                Some(r)
            }
            ReaderState::EmptyEnd => {
                self.finish();
                Some(Ok(Chunk::end(Vec::new())))
            }
            ReaderState::Done => {
                self.state = ReaderState::Done;
                None
            }
        }
    }
}

/// Append-only sink for a download in progress.
pub struct ChunkWriter {
    path: PathBuf,
    out: BufWriter<File>,
}

impl ChunkWriter {
    /// Create (or truncate) the destination file.
    pub fn create(path: &Path) -> io::Result<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            out: BufWriter::new(File::create(path)?),
        })
    }

    pub fn write_chunk(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.out.write_all(bytes)
    }

    /// Flush and close. Returns the path of the written file.
    pub fn finish(mut self) -> io::Result<PathBuf> {
        self.out.flush()?;
        Ok(self.path)
    }

    /// Close and delete the partial output.
    pub fn discard(self) -> io::Result<()> {
        let path = self.path;
        drop(self.out);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::hash_bytes;

    fn collect(path: &Path, chunk_size: usize) -> Vec<Chunk> {
        ChunkReader::open(path, chunk_size)
            .unwrap()
            .collect::<io::Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn empty_file_is_single_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0.txt");
        std::fs::write(&path, b"").unwrap();
        assert_eq!(collect(&path, 4), vec![Chunk::end(Vec::new())]);
    }

    #[test]
    fn digest_then_blocks_last_flagged_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1.txt");
        std::fs::write(&path, b"abcdefghij").unwrap();
        let chunks = collect(&path, 4);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0], Chunk::data(hash_bytes(b"abcdefghij").into_bytes()));
        assert_eq!(chunks[1], Chunk::data(b"abcd".to_vec()));
        assert_eq!(chunks[2], Chunk::data(b"efgh".to_vec()));
        assert_eq!(chunks[3], Chunk::end(b"ij".to_vec()));
    }

    #[test]
    fn exact_multiple_still_ends_with_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("2.txt");
        std::fs::write(&path, b"abcdefgh").unwrap();
        let chunks = collect(&path, 4);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2], Chunk::end(b"efgh".to_vec()));
    }

    #[test]
    fn reader_is_single_use() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("3.txt");
        std::fs::write(&path, b"xy").unwrap();
        let mut r = ChunkReader::open(&path, 4).unwrap();
        assert_eq!(r.by_ref().count(), 2);
        assert!(r.next().is_none());
    }

    #[test]
    fn writer_finish_and_discard() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let mut w = ChunkWriter::create(&path).unwrap();
        w.write_chunk(b"ab").unwrap();
        w.write_chunk(b"cd").unwrap();
        let written = w.finish().unwrap();
        assert_eq!(std::fs::read(&written).unwrap(), b"abcd");

        let mut w = ChunkWriter::create(&path).unwrap();
        w.write_chunk(b"partial").unwrap();
        w.discard().unwrap();
        assert!(!path.exists());
    }
}
