//! Cache Reaper (§4.9): after a successful render of all requested
//! outputs, deletes overlay PNGs whose content key was not touched by
//! this run. Advisory — failures are logged, never propagated, so a
//! reap problem never turns a successful render into a failed one.

use std::collections::HashSet;
use std::path::Path;

pub fn reap(project_dir: &Path, touched_keys: &HashSet<String>) {
    reap_dir(&project_dir.join(".cache").join("containers"), touched_keys);
    reap_dir(&project_dir.join("cache").join("apps"), touched_keys);
}

fn reap_dir(dir: &Path, touched_keys: &HashSet<String>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("png") {
            continue;
        }
        let Some(key) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if touched_keys.contains(key) {
            continue;
        }
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::warn!(path = %path.display(), error = %e, "cache reaper failed to remove stale overlay");
        } else {
            tracing::debug!(path = %path.display(), "cache reaper removed stale overlay");
        }
    }
}
