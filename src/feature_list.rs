use std::fs;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::error::FgError;
use crate::log_warn;
use crate::types::{Feature, FeatureFile, FeatureStatus, FEATURES_SCHEMA_VERSION};

/// Fields a caller supplies when adding a feature. Everything else is assigned.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NewFeature {
    pub category: String,
    pub description: String,
    pub steps: Vec<String>,
    pub dependencies: Vec<String>,
    pub skip_tests: bool,
}

/// Load a FeatureFile from the YAML file at `path`.
///
/// Validates `schema_version`. Unknown fields are silently ignored (forward
/// compatibility).
pub fn load(path: &Path) -> Result<FeatureFile, FgError> {
    let contents = fs::read_to_string(path)
        .map_err(|e| FgError::Storage(format!("Failed to read {}: {}", path.display(), e)))?;

    let file: FeatureFile = serde_yaml_ng::from_str(&contents).map_err(|e| {
        FgError::Storage(format!("Failed to parse YAML from {}: {}", path.display(), e))
    })?;

    if file.schema_version != FEATURES_SCHEMA_VERSION {
        return Err(FgError::Storage(format!(
            "Unsupported schema_version {} in {} (expected {})",
            file.schema_version,
            path.display(),
            FEATURES_SCHEMA_VERSION
        )));
    }

    Ok(file)
}

/// Save a FeatureFile to `path` using atomic write.
///
/// Writes to a temporary file in the same directory, syncs it, then renames it
/// over the target, so readers see either the old file or the new one.
pub fn save(path: &Path, file: &FeatureFile) -> Result<(), FgError> {
    let parent = path.parent().ok_or_else(|| {
        FgError::Storage(format!(
            "Cannot determine parent directory of {}",
            path.display()
        ))
    })?;

    fs::create_dir_all(parent).map_err(|e| {
        FgError::Storage(format!(
            "Failed to create directory {}: {}",
            parent.display(),
            e
        ))
    })?;

    let yaml = serde_yaml_ng::to_string(file)
        .map_err(|e| FgError::Storage(format!("Failed to serialize features to YAML: {}", e)))?;

    let temp_file = NamedTempFile::new_in(parent).map_err(|e| {
        FgError::Storage(format!(
            "Failed to create temp file in {}: {}",
            parent.display(),
            e
        ))
    })?;

    fs::write(temp_file.path(), &yaml)
        .map_err(|e| FgError::Storage(format!("Failed to write temp file: {}", e)))?;

    // sync to disk before rename
    let synced = fs::File::open(temp_file.path())
        .map_err(|e| FgError::Storage(format!("Failed to open temp file for sync: {}", e)))?;
    synced
        .sync_all()
        .map_err(|e| FgError::Storage(format!("Failed to sync temp file: {}", e)))?;

    temp_file.persist(path).map_err(|e| {
        FgError::Storage(format!(
            "Failed to rename temp file to {}: {}",
            path.display(),
            e
        ))
    })?;

    Ok(())
}

/// Sibling lock file that serializes read-modify-write cycles on `path`.
pub fn write_lock_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

/// Load, modify and save the list at `path` under an exclusive file lock.
///
/// Every writer in every process goes through here, so a write never saves
/// over a change another writer made after this one's load. The lock is
/// held only for the cycle itself; `f` must not block on anything else.
pub fn update<T>(
    path: &Path,
    f: impl FnOnce(&mut FeatureFile) -> Result<T, FgError>,
) -> Result<T, FgError> {
    let lock_path = write_lock_path(path);
    let mut lock = fslock::LockFile::open(&lock_path).map_err(|e| {
        FgError::Storage(format!("Failed to open {}: {}", lock_path.display(), e))
    })?;
    lock.lock()
        .map_err(|e| FgError::Storage(format!("Failed to lock {}: {}", lock_path.display(), e)))?;

    let result = load(path).and_then(|mut file| {
        let value = f(&mut file)?;
        save(path, &file)?;
        Ok(value)
    });

    if let Err(e) = lock.unlock() {
        log_warn!("[features] Failed to unlock {}: {}", lock_path.display(), e);
    }
    result
}

/// Create an empty feature list at `path`. Fails if one already exists.
pub fn init(path: &Path) -> Result<FeatureFile, FgError> {
    if path.exists() {
        return Err(FgError::Storage(format!(
            "Feature list already exists at {}",
            path.display()
        )));
    }
    let file = FeatureFile {
        schema_version: FEATURES_SCHEMA_VERSION,
        ..Default::default()
    };
    save(path, &file)?;
    Ok(file)
}

/// Generate the next sequential feature id.
///
/// Takes the max of the highest numeric suffix among ids with `prefix` and
/// the file's `next_feature_id` high-water mark, adds one, and zero-pads to
/// at least 3 digits. Returns the id and its numeric suffix.
pub fn generate_next_id(file: &FeatureFile, prefix: &str) -> Result<(String, u32), FgError> {
    let max_num = max_feature_suffix(&file.features, prefix).max(file.next_feature_id);
    let next = max_num.checked_add(1).ok_or_else(|| {
        FgError::Storage(format!(
            "No feature ids left after {}-{} (u32 limit reached)",
            prefix, max_num
        ))
    })?;
    Ok((format!("{}-{:03}", prefix, next), next))
}

/// Append a new `backlog` feature with a generated id and fresh timestamps.
///
/// Dependencies that name no existing feature are kept (they are ignored at
/// scheduling time) but logged, since they are usually typos.
pub fn add_feature(file: &mut FeatureFile, new: NewFeature, prefix: &str) -> Result<Feature, FgError> {
    let (id, suffix) = generate_next_id(file, prefix)?;
    file.next_feature_id = suffix;
    let now = chrono::Utc::now().to_rfc3339();

    for dep in &new.dependencies {
        if !file.features.iter().any(|f| &f.id == dep) {
            log_warn!("[{}] Dependency {} does not name a known feature", id, dep);
        }
    }

    let feature = Feature {
        id,
        category: new.category,
        description: new.description,
        steps: new.steps,
        status: FeatureStatus::Backlog,
        dependencies: new.dependencies,
        skip_tests: new.skip_tests,
        created: now.clone(),
        updated: now,
    };

    file.features.push(feature.clone());
    Ok(feature)
}

/// Set a feature's status in memory and bump its `updated` timestamp.
///
/// No transition rules are enforced here; the scheduler decides which
/// transitions it issues, and `set-status` is the human override.
pub fn set_status(file: &mut FeatureFile, feature_id: &str, status: FeatureStatus) -> Result<(), FgError> {
    let feature = file
        .features
        .iter_mut()
        .find(|f| f.id == feature_id)
        .ok_or_else(|| FgError::NotFound(feature_id.to_string()))?;

    feature.status = status;
    feature.updated = chrono::Utc::now().to_rfc3339();
    Ok(())
}

/// Compute the maximum numeric id suffix across features matching `prefix`.
fn max_feature_suffix(features: &[Feature], prefix: &str) -> u32 {
    let prefix_with_dash = format!("{}-", prefix);

    features
        .iter()
        .filter_map(|f| {
            f.id.strip_prefix(&prefix_with_dash)
                .and_then(|suffix| suffix.parse::<u32>().ok())
        })
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_feature(id: &str) -> Feature {
        Feature {
            id: id.to_string(),
            description: format!("Test feature {}", id),
            ..Default::default()
        }
    }

    #[test]
    fn max_suffix_empty_is_zero() {
        assert_eq!(max_feature_suffix(&[], "FG"), 0);
    }

    #[test]
    fn max_suffix_ignores_other_prefixes_and_non_numeric() {
        let features = vec![
            make_feature("FG-005"),
            make_feature("FG-abc"),
            make_feature("OTHER-100"),
            make_feature("FG-012"),
            make_feature("FG-"),
        ];
        assert_eq!(max_feature_suffix(&features, "FG"), 12);
    }
}
