//! Staging area housekeeping and the atomic commit of fetched blobs.

use crate::chunk::{CacheLayout, CacheType, PART_EXTENSION};
use crate::error::{IndexError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Removes everything an interrupted sync could have left behind: the whole
/// `staging/` content and any stray `*.part` next to committed chunks.
/// Committed chunk files are never touched. Safe to run repeatedly.
pub fn clean_staging(layout: &CacheLayout) -> Result<usize> {
    let mut removed = 0;
    let staging = layout.staging_dir();
    if staging.exists() {
        for entry in fs::read_dir(&staging).map_err(|err| IndexError::io(&staging, err))? {
            let path = entry.map_err(|err| IndexError::io(&staging, err))?.path();
            remove_path(&path)?;
            removed += 1;
        }
    }
    let root = layout.root().to_path_buf();
    for dir in [layout.dir(CacheType::Bloom), layout.dir(CacheType::Index), root] {
        removed += remove_part_files(&dir)?;
    }
    if removed > 0 {
        tracing::debug!(removed, "cleaned leftover partial files");
    }
    Ok(removed)
}

fn remove_part_files(dir: &Path) -> Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in fs::read_dir(dir).map_err(|err| IndexError::io(dir, err))? {
        let path = entry.map_err(|err| IndexError::io(dir, err))?.path();
        let is_part = path.extension().and_then(|ext| ext.to_str()) == Some(PART_EXTENSION);
        if is_part && path.is_file() {
            remove_path(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

fn remove_path(path: &Path) -> Result<()> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(IndexError::io(path, err)),
    }
}

/// Writes `bytes` to `staging`, fsyncs, then renames over `target`. A reader
/// sees either the old state or the complete new file.
pub async fn commit_blob(staging: &Path, target: &Path, bytes: &[u8]) -> Result<PathBuf> {
    if let Err(err) = write_synced(staging, bytes).await {
        let _ = tokio::fs::remove_file(staging).await;
        return Err(err);
    }
    if let Err(err) = tokio::fs::rename(staging, target).await {
        let _ = tokio::fs::remove_file(staging).await;
        return Err(IndexError::io(target, err));
    }
    Ok(target.to_path_buf())
}

async fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|err| IndexError::io(path, err))?;
    file.write_all(bytes).await.map_err(|err| IndexError::io(path, err))?;
    file.sync_all().await.map_err(|err| IndexError::io(path, err))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::BlockRange;
    use crate::test_utils::temp_dir;

    #[test]
    fn cleanup_is_idempotent_and_spares_chunks() {
        let dir = temp_dir("cleanup");
        let layout = CacheLayout::new(&dir);
        layout.ensure_dirs().expect("dirs");
        let range = BlockRange::new(0, 999);

        let committed = layout.bloom_path(&range);
        fs::write(&committed, b"bloom").expect("committed");
        fs::write(layout.staging_path(&range, CacheType::Bloom, 1), b"half").expect("staged");
        fs::create_dir_all(layout.staging_dir().join("nested")).expect("nested");
        let stray = layout.dir(CacheType::Index).join("000000000-000000999.bin.part");
        fs::write(&stray, b"stray").expect("stray");

        assert_eq!(clean_staging(&layout).expect("clean"), 3);
        assert!(committed.exists());
        assert!(!stray.exists());
        assert_eq!(clean_staging(&layout).expect("clean again"), 0);

        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn commit_replaces_target_atomically() {
        let dir = temp_dir("commit");
        let layout = CacheLayout::new(&dir);
        layout.ensure_dirs().expect("dirs");
        let range = BlockRange::new(0, 999);
        let target = layout.bloom_path(&range);
        fs::write(&target, b"old").expect("old");

        let staging = layout.staging_path(&range, CacheType::Bloom, 7);
        commit_blob(&staging, &target, b"new").await.expect("commit");
        assert_eq!(fs::read(&target).expect("read"), b"new");
        assert!(!staging.exists());

        let _ = fs::remove_dir_all(&dir);
    }
}
