//! Durable collaborators of the orchestrator: the artifact store and the
//! job state store. Both come in an in-memory flavour for tests and
//! embedding, and a filesystem flavour used by the CLI.

mod artifact;
mod job_store;

use std::io::Write;
use std::path::Path;

pub use artifact::{ArtifactRef, ArtifactStore, FsArtifactStore, MemoryArtifactStore, content_digest};
pub use job_store::{FileJobStore, JobStateStore, MemoryJobStore};

/// Write `bytes` to `dir/file_name` through a temp file in the same
/// directory, so readers see either the old content or the new one.
fn write_atomic(dir: &Path, file_name: &str, bytes: &[u8]) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dir.join(file_name)).map_err(|e| e.error)?;
    Ok(())
}
