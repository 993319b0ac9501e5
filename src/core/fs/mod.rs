//! Filesystem utilities.
//!
//! Crash-tolerant file replacement for the journal and settings files, and
//! sanitization of user-supplied labels that end up in artifact paths.
//!
//! A partial write (power loss, crash) must never leave a previously valid
//! file unreadable; at worst the latest write is lost.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::core::{CoreError, CoreResult};

// =============================================================================
// Path Sanitization
// =============================================================================

/// Maximum length of a sanitized path component
const MAX_COMPONENT_LEN: usize = 64;

/// Reduces a user-supplied label (job name, custom stage name) to a safe
/// directory/file component.
///
/// Keeps ASCII alphanumerics, `-`, `_` and `.`; whitespace becomes `_`;
/// everything else is dropped. The result never contains separators or `..`
/// and is never empty.
pub fn sanitize_path_component(label: &str) -> String {
    let mut out = String::with_capacity(label.len().min(MAX_COMPONENT_LEN));
    for ch in label.chars() {
        if out.len() >= MAX_COMPONENT_LEN {
            break;
        }
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
            out.push(ch);
        } else if ch.is_whitespace() {
            out.push('_');
        }
    }

    // A component of only dots would be a traversal token
    if out.is_empty() || out.chars().all(|c| c == '.') {
        return "untitled".to_string();
    }
    out
}

// =============================================================================
// Atomic Writes
// =============================================================================

/// Write bytes to `path` using an atomic replace pattern.
///
/// Writes a sibling temp file, flushes and syncs it, then swaps it into place.
/// If the destination exists it is moved aside as a `.bak` file first so the
/// swap is recoverable on platforms where rename-over-existing can fail.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> CoreResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp_path = sibling_path(path, "tmp");
    {
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(bytes)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }

    atomic_replace(path, &tmp_path)?;
    Ok(())
}

/// Write a JSON file atomically with pretty formatting.
pub fn atomic_write_json_pretty<T: serde::Serialize>(path: &Path, value: &T) -> CoreResult<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| suffix.to_string());
    let mut out = path.to_path_buf();
    out.set_file_name(format!("{file_name}.{suffix}"));
    out
}

fn atomic_replace(dest: &Path, src_tmp: &Path) -> CoreResult<()> {
    if !dest.exists() {
        std::fs::rename(src_tmp, dest)?;
        return Ok(());
    }

    let bak = sibling_path(dest, "bak");
    if bak.exists() {
        let _ = std::fs::remove_file(&bak);
    }

    std::fs::rename(dest, &bak)?;
    match std::fs::rename(src_tmp, dest) {
        Ok(()) => {
            let _ = std::fs::remove_file(&bak);
            Ok(())
        }
        Err(e) => {
            // Try to restore the old file.
            let _ = std::fs::rename(&bak, dest);
            let _ = std::fs::remove_file(src_tmp);
            Err(CoreError::IoError(e))
        }
    }
}
