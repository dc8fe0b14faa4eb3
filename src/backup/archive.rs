// tfstate-backup/src/backup/archive.rs
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::io::{Cursor, Read, Write};
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::errors::{AppError, Result};

/// Compressed single-entry container holding one workspace's state snapshot.
#[derive(Debug, Clone)]
pub struct ArchiveArtifact {
    pub entry_name: String,
    pub bytes: Bytes,
    pub content_len: usize,
    /// Hex SHA-256 of `bytes`.
    pub sha256: String,
}

pub fn entry_name_for(workspace_id: &str) -> String {
    format!("{}.tfstate", workspace_id)
}

/// Creates a ZIP archive in memory with the state stored as `{workspace_id}.tfstate`.
///
/// The content is written exactly as downloaded. The finished archive is read
/// back before it is returned, so an artifact that would not restore to the
/// same bytes never reaches object storage.
///
/// # Arguments
/// * `workspace_id` - Names the single entry inside the archive.
/// * `content` - Raw state document bytes.
pub fn package(workspace_id: &str, content: &[u8]) -> Result<ArchiveArtifact> {
    let entry_name = entry_name_for(workspace_id);

    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(content.len() as u64 >= u32::MAX as u64);

    let mut writer = ZipWriter::new(Cursor::new(Vec::with_capacity(content.len() / 4 + 512)));
    writer.start_file(entry_name.as_str(), options)?;
    writer.write_all(content)?;
    let bytes = writer.finish()?.into_inner();

    let (stored_name, stored_content) = extract_single_entry(&bytes)?;
    if stored_name != entry_name || stored_content != content {
        return Err(AppError::Archive(format!(
            "archive for {} did not read back to the downloaded content",
            workspace_id
        )));
    }

    let sha256 = hex::encode(Sha256::digest(&bytes));
    debug!(
        workspace_id,
        entry = %entry_name,
        content_bytes = content.len(),
        archive_bytes = bytes.len(),
        "packaged state archive"
    );

    Ok(ArchiveArtifact {
        entry_name,
        bytes: Bytes::from(bytes),
        content_len: content.len(),
        sha256,
    })
}

/// Reads the only entry of an archive produced by [`package`].
///
/// # Returns
/// The entry name and its decompressed content.
pub fn extract_single_entry(archive_bytes: &[u8]) -> Result<(String, Vec<u8>)> {
    let mut archive = ZipArchive::new(Cursor::new(archive_bytes))?;
    if archive.len() != 1 {
        return Err(AppError::Archive(format!(
            "expected exactly one entry, found {}",
            archive.len()
        )));
    }

    let mut entry = archive.by_index(0)?;
    let name = entry.name().to_string();
    let mut content = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut content)?;
    Ok((name, content))
}
