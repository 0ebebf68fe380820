//! Atomic publication of chunk files.
//!
//! Everything is written into a `<name>_temp/` sibling first and renamed
//! into the real directory afterwards, so a consumer polling the run
//! directory never observes a partial file. Existing destinations are never
//! overwritten; a conflict means two workers were handed the same workload
//! and is only logged.

use std::fs;
use std::path::{Path, PathBuf};

use crate::constants::CHUNK_NAME_LENGTH;
use crate::error::WriterError;

pub struct ChunkWriter {
    output_path: PathBuf,
    /// `<hostname>_<worker_id>`, the per-worker file name inside each chunk
    /// directory.
    writer_name: String,
    /// Chunks below this have had their empty files verified.
    empty_verified: i64,
}

impl ChunkWriter {
    pub fn new(
        output_root: &Path,
        run_name: &str,
        hostname: &str,
        worker_id: usize,
    ) -> Result<Self, WriterError> {
        let output_path = output_root.join(run_name);
        fs::create_dir_all(&output_path)
            .map_err(|_| WriterError::BadOutputPath(output_path.clone()))?;
        Ok(ChunkWriter {
            output_path,
            writer_name: format!("{hostname}_{worker_id}"),
            empty_verified: 0,
        })
    }

    pub fn chunk_str(chunk_id: i64) -> String {
        format!("{:0width$}", chunk_id, width = CHUNK_NAME_LENGTH)
    }

    /// The three logical names fed by one chunk: the chunk itself, its
    /// trailing overlap, and the same overlap republished as the head of the
    /// next chunk.
    pub fn chunk_names(chunk_id: i64) -> [String; 3] {
        [
            Self::chunk_str(chunk_id),
            format!("{}_post", Self::chunk_str(chunk_id)),
            format!("{}_pre", Self::chunk_str(chunk_id + 1)),
        ]
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn writer_name(&self) -> &str {
        &self.writer_name
    }

    fn directory_path(&self, name: &str, temp: bool) -> PathBuf {
        if temp {
            self.output_path.join(format!("{name}_temp"))
        } else {
            self.output_path.join(name)
        }
    }

    fn file_path(&self, name: &str, temp: bool) -> PathBuf {
        self.directory_path(name, temp).join(&self.writer_name)
    }

    /// Publish one file atomically under `<output>/<name>/`.
    pub fn publish(&self, name: &str, bytes: &[u8]) -> Result<(), WriterError> {
        let temp_dir = self.directory_path(name, true);
        if !temp_dir.exists() {
            fs::create_dir_all(&temp_dir)?;
        }
        let temp_file = self.file_path(name, true);
        fs::write(&temp_file, bytes)?;

        let final_file = self.file_path(name, false);
        if final_file.exists() {
            spdlog::warn!(
                "Chunk {}/{} already exists? {} vs {} bytes",
                name,
                self.writer_name,
                final_file.metadata().map(|m| m.len()).unwrap_or(0),
                bytes.len()
            );
            fs::remove_file(temp_file)?;
            return Ok(());
        }
        let final_dir = self.directory_path(name, false);
        if !final_dir.exists() {
            fs::create_dir_all(&final_dir)?;
        }
        fs::rename(temp_file, final_file)?;
        Ok(())
    }

    /// Guarantee this worker has a file (possibly empty) for every chunk
    /// below `back_from`, so downstream consumers see a complete
    /// `(chunk, worker)` grid with no holes. Idempotent.
    pub fn create_empty(&mut self, back_from: i64) -> Result<(), WriterError> {
        if self.empty_verified == 0 && back_from > 0 {
            // the name walk below only produces `_pre` files for id+1, so
            // the very first chunk's `_pre` needs its own pass
            self.ensure_file(&format!("{}_pre", Self::chunk_str(0)))?;
        }
        while self.empty_verified < back_from {
            for name in Self::chunk_names(self.empty_verified) {
                self.ensure_file(&name)?;
            }
            self.empty_verified += 1;
        }
        Ok(())
    }

    fn ensure_file(&self, name: &str) -> Result<(), WriterError> {
        let file = self.file_path(name, false);
        if !file.exists() {
            let dir = self.directory_path(name, false);
            if !dir.exists() {
                fs::create_dir_all(&dir)?;
            }
            fs::File::create(file)?;
        }
        Ok(())
    }

    /// Drop the end-of-run sentinel for this worker.
    pub fn write_end_marker(&self) -> Result<(), WriterError> {
        let end_dir = self.directory_path("THE_END", false);
        if !end_dir.exists() {
            spdlog::debug!("Creating END directory at {:?}", end_dir);
            fs::create_dir_all(&end_dir)?;
        }
        fs::write(end_dir.join(&self.writer_name), "...my only friend\n")?;
        Ok(())
    }
}
