use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;

use crate::error::FgError;

/// Read a feature's accumulated context. A feature with no file yet has an
/// empty context.
pub fn read(path: &Path) -> Result<String, FgError> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(contents),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(FgError::Storage(format!(
            "Failed to read context at {}: {}",
            path.display(),
            e
        ))),
    }
}

/// Append `text` to the context file, creating it and its directory if missing.
///
/// A trailing newline is added when `text` lacks one, so consecutive appends
/// never run together on one line.
pub fn append(path: &Path, text: &str) -> Result<(), FgError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            FgError::Storage(format!(
                "Failed to create context directory {}: {}",
                parent.display(),
                e
            ))
        })?;
    }

    let mut file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .map_err(|e| {
            FgError::Storage(format!("Failed to open context at {}: {}", path.display(), e))
        })?;

    let mut entry = text.to_string();
    if !entry.ends_with('\n') {
        entry.push('\n');
    }

    file.write_all(entry.as_bytes()).map_err(|e| {
        FgError::Storage(format!("Failed to write context at {}: {}", path.display(), e))
    })?;

    Ok(())
}

/// Marker appended before each automatic re-invocation.
pub fn retry_marker(attempt: u32, max_attempts: u32) -> String {
    format!(
        "\n## Retry {}/{} ({})\n\nThe previous attempt ended without reporting success. Continue from here.\n",
        attempt,
        max_attempts,
        chrono::Utc::now().to_rfc3339()
    )
}

/// Marker plus note appended when a human sends a follow-up.
pub fn follow_up_entry(note: &str) -> String {
    format!(
        "\n## Follow-up ({})\n\n{}\n",
        chrono::Utc::now().to_rfc3339(),
        note.trim_end()
    )
}
