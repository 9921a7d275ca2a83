//! Durable save/load of non-expiring key/value state.
//!
//! "Missing file", "blank file", and "bad JSON" all collapse to the same
//! empty map on load, since first-boot and corruption recovery are the same
//! situation. Saves write to a temp file and rename into place so a crash
//! mid-write never leaves a torn file behind as the readable snapshot.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Saves `entries` as a single JSON object to `path`, replacing any existing
/// file atomically via write-to-temp + rename.
pub(crate) fn save(path: &Path, entries: &HashMap<String, String>) -> crate::Result<()> {
    let tmp_path = tmp_path_for(path);
    let serialized = serde_json::to_string(entries)?;
    fs::write(&tmp_path, serialized)?;
    fs::rename(&tmp_path, path)?;
    debug!(path = %path.display(), count = entries.len(), "snapshot saved");
    Ok(())
}

/// Loads the JSON-object snapshot at `path`. Missing file, empty/whitespace
/// content, and parse errors are all treated as "no prior state".
pub(crate) fn load(path: &Path) -> HashMap<String, String> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return HashMap::new(),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "snapshot unreadable, starting empty");
            return HashMap::new();
        }
    };

    if content.trim().is_empty() {
        return HashMap::new();
    }

    match serde_json::from_str(&content) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "snapshot malformed, starting empty");
            HashMap::new()
        }
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}
