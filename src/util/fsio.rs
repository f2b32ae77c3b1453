//! Durable small-file helpers: temp file + rename + parent directory sync.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Result;

pub fn temp_path_for(path: &Path) -> PathBuf {
  match path.extension().and_then(|extension| extension.to_str()) {
    Some(extension) => path.with_extension(format!("{extension}.tmp")),
    None => path.with_extension("tmp"),
  }
}

/// Atomically replace `path` with `bytes`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
  if let Some(parent) = path.parent() {
    fs::create_dir_all(parent)?;
  }

  let temp_path = temp_path_for(path);
  let mut file = OpenOptions::new()
    .create(true)
    .truncate(true)
    .write(true)
    .open(&temp_path)?;
  file.write_all(bytes)?;
  file.sync_all()?;

  fs::rename(&temp_path, path)?;
  sync_parent_dir(path.parent())?;
  Ok(())
}

pub fn sync_parent_dir(parent: Option<&Path>) -> Result<()> {
  #[cfg(unix)]
  {
    if let Some(parent) = parent {
      File::open(parent)?.sync_all()?;
    }
  }

  #[cfg(not(unix))]
  {
    let _ = parent;
  }

  Ok(())
}

/// Copy every regular file in `src` into `dst` (non-recursive).
pub fn copy_dir_files(src: &Path, dst: &Path) -> Result<u64> {
  fs::create_dir_all(dst)?;
  let mut copied = 0u64;
  for entry in fs::read_dir(src)? {
    let entry = entry?;
    let path = entry.path();
    if path.is_file() {
      fs::copy(&path, dst.join(entry.file_name()))?;
      copied += 1;
    }
  }
  Ok(copied)
}
