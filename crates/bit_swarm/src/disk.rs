use std::{
    io::SeekFrom,
    path::{Path, PathBuf},
};

use anyhow::Context;
use thiserror::Error;
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncSeekExt, AsyncWriteExt},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    file::{FileEntry, TorrentMeta},
    piece_registry::VerifiedPiece,
};

#[derive(Debug, Error)]
pub enum DiskError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("piece {0} is out of range")]
    UnknownPiece(u32),
    #[error("piece {index} has {actual} bytes, expected {expected}")]
    SizeMismatch {
        index: u32,
        expected: usize,
        actual: usize,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> DiskError + '_ {
    move |source| DiskError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Download progress, sent after every written piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    pub bytes_written: u64,
}

/// One contiguous slice of a piece that lands in a single file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileWrite {
    pub file_index: usize,
    pub file_offset: u64,
    pub piece_offset: usize,
    pub len: usize,
}

/// Writes verified pieces into the torrent's file layout.
#[derive(Debug)]
pub struct DiskWriter {
    root: PathBuf,
    files: Vec<FileEntry>,
    piece_length: u64,
    piece_sizes: Vec<u32>,
    written: Vec<bool>,
    completed: usize,
    bytes_written: u64,
}

impl DiskWriter {
    pub fn new(root: impl Into<PathBuf>, meta: &TorrentMeta) -> Self {
        let num_pieces = meta.num_pieces();
        Self {
            root: root.into(),
            files: meta.files.clone(),
            piece_length: meta.piece_length,
            piece_sizes: (0..num_pieces).map(|i| meta.piece_size(i)).collect(),
            written: vec![false; num_pieces],
            completed: 0,
            bytes_written: 0,
        }
    }

    pub fn file_path(&self, file: &FileEntry) -> PathBuf {
        self.root.join(&file.path)
    }

    pub fn progress(&self) -> Progress {
        Progress {
            completed: self.completed,
            total: self.written.len(),
            bytes_written: self.bytes_written,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completed == self.written.len()
    }

    /// Creates every file (and its parent directories) at its final length.
    pub async fn allocate(&self) -> Result<(), DiskError> {
        for file in &self.files {
            let path = self.file_path(file);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await.map_err(io_err(parent))?;
            }
            let handle = fs::File::create(&path).await.map_err(io_err(&path))?;
            handle.set_len(file.length).await.map_err(io_err(&path))?;
            debug!("allocated {} ({} bytes)", path.display(), file.length);
        }
        Ok(())
    }

    /// Splits `len` bytes of piece `index` into per-file writes, in file order.
    pub fn plan_writes(&self, index: u32, len: usize) -> Vec<FileWrite> {
        let piece_start = index as u64 * self.piece_length;
        let piece_end = piece_start + len as u64;

        self.files
            .iter()
            .enumerate()
            .filter_map(|(file_index, file)| {
                let file_end = file.byte_offset + file.length;
                let start = piece_start.max(file.byte_offset);
                let end = piece_end.min(file_end);
                (start < end).then(|| FileWrite {
                    file_index,
                    file_offset: start - file.byte_offset,
                    piece_offset: (start - piece_start) as usize,
                    len: (end - start) as usize,
                })
            })
            .collect()
    }

    pub async fn write_piece(&mut self, piece: VerifiedPiece) -> Result<Progress, DiskError> {
        let expected = *self
            .piece_sizes
            .get(piece.index as usize)
            .ok_or(DiskError::UnknownPiece(piece.index))? as usize;
        if piece.buf.len() != expected {
            return Err(DiskError::SizeMismatch {
                index: piece.index,
                expected,
                actual: piece.buf.len(),
            });
        }

        for write in self.plan_writes(piece.index, piece.buf.len()) {
            let path = self.file_path(&self.files[write.file_index]);
            let mut file = OpenOptions::new()
                .write(true)
                .open(&path)
                .await
                .map_err(io_err(&path))?;
            file.seek(SeekFrom::Start(write.file_offset))
                .await
                .map_err(io_err(&path))?;
            file.write_all(&piece.buf[write.piece_offset..write.piece_offset + write.len])
                .await
                .map_err(io_err(&path))?;
            file.flush().await.map_err(io_err(&path))?;
        }

        let slot = &mut self.written[piece.index as usize];
        if !*slot {
            *slot = true;
            self.completed += 1;
            self.bytes_written += piece.buf.len() as u64;
        }
        Ok(self.progress())
    }

    /// Writes pieces as they arrive until every piece is on disk or `stop` fires.
    pub async fn run(
        mut self,
        piece_rx: flume::Receiver<VerifiedPiece>,
        progress_tx: flume::Sender<Progress>,
        stop: CancellationToken,
    ) -> anyhow::Result<()> {
        while !self.is_complete() {
            let piece = tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                r = piece_rx.recv_async() => r.context("piece channel closed")?,
            };
            let index = piece.index;
            let progress = self
                .write_piece(piece)
                .await
                .with_context(|| format!("writing piece {}", index))?;
            info!(
                "wrote piece {} ({}/{})",
                index, progress.completed, progress.total
            );
            let _ = progress_tx.send(progress);
        }
        info!("all {} pieces written", self.written.len());
        Ok(())
    }
}
