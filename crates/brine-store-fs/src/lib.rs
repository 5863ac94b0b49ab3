//! Filesystem store backend.
//!
//! - [`FsKeyStore`]: one directory per key state under `pki_dir`.
//! - [`FsJobStore`]: the local job cache under `<cachedir>/jobs`.
//! - [`FsDataCache`]: bank/key JSON files under a cache root.

use std::path::{Path, PathBuf};

use brine_storage::StoreError;

mod cache;
mod jobs;
mod pki;

pub use cache::FsDataCache;
pub use jobs::FsJobStore;
pub use pki::FsKeyStore;

/// Write `contents` next to `path` and rename it into place.
pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| StoreError::Backend(format!("invalid path {}", path.display())))?;
    let tmp = path.with_file_name(format!(".{}.tmp", name));
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Join untrusted relative segments, refusing anything that could escape `root`.
pub(crate) fn safe_join(root: &Path, rel: &str) -> Result<PathBuf, StoreError> {
    let mut out = root.to_path_buf();
    for part in rel.split('/') {
        if part.is_empty() || part == "." || part == ".." || part.contains('\\') {
            return Err(StoreError::Backend(format!("invalid path segment in {:?}", rel)));
        }
        out.push(part);
    }
    Ok(out)
}
