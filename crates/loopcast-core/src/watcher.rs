//! Directory Watcher (C7): snapshot + rescan of candidate files.

use std::path::Path;

use crate::state::FileEntry;

/// Scans `directory` for `.mp4` files (case-insensitive suffix), skips
/// subdirectories, and returns an immutable snapshot sorted by name
/// ascending for a deterministic play order.
pub fn scan(directory: &Path) -> std::io::Result<Vec<FileEntry>> {
    let mut entries = Vec::new();

    for entry in std::fs::read_dir(directory)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            continue;
        }

        let path = entry.path();
        let is_mp4 = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("mp4"))
            .unwrap_or(false);
        if !is_mp4 {
            continue;
        }

        let display_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        entries.push(FileEntry {
            path,
            display_name,
            size: metadata.len(),
        });
    }

    entries.sort_by(|a, b| a.display_name.cmp(&b.display_name));
    Ok(entries)
}
