// Temp artifact sweep.
//
// Only files carrying the classifier client's temp prefix are touched, and
// only inside a directory at least two levels below the filesystem root.

use std::path::{Component, Path};
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context, Result};
use classifier_client::TEMP_PREFIX;
use tracing::{debug, warn};

/// Delete prefixed temp files in `dir` older than `max_age`. Returns how many were removed.
pub async fn cleanup_temp_files(dir: &Path, max_age: Duration) -> Result<usize> {
    let dir = match tokio::fs::canonicalize(dir).await {
        Ok(dir) => dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to resolve {}", dir.display()))
        }
    };

    let depth = dir
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .count();
    if depth < 2 {
        bail!("refusing to clean root-level directory {}", dir.display());
    }

    let now = SystemTime::now();
    let mut removed = 0;
    let mut entries = tokio::fs::read_dir(&dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
            continue;
        }
        let meta = match entry.metadata().await {
            Ok(meta) if meta.is_file() => meta,
            _ => continue,
        };
        let age = meta
            .modified()
            .ok()
            .and_then(|m| now.duration_since(m).ok())
            .unwrap_or_default();
        if age <= max_age {
            continue;
        }
        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %entry.path().display(), error = %e, "Failed to remove temp file"),
        }
    }

    debug!(dir = %dir.display(), removed, "Temp cleanup finished");
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    fn age_file(path: &Path, age: Duration) {
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(SystemTime::now() - age)
            .unwrap();
    }

    #[tokio::test]
    async fn removes_only_old_prefixed_files() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join(format!("{TEMP_PREFIX}old"));
        let fresh = dir.path().join(format!("{TEMP_PREFIX}fresh"));
        let foreign = dir.path().join("keep-me.jpg");
        for p in [&old, &fresh, &foreign] {
            std::fs::write(p, b"x").unwrap();
        }
        age_file(&old, Duration::from_secs(25 * 3600));
        age_file(&foreign, Duration::from_secs(25 * 3600));

        let removed = cleanup_temp_files(dir.path(), Duration::from_secs(24 * 3600))
            .await
            .unwrap();

        assert_eq!(removed, 1);
        assert!(!old.exists());
        assert!(fresh.exists());
        assert!(foreign.exists());
    }

    #[tokio::test]
    async fn refuses_root_level_paths() {
        for dir in ["/", "/tmp", "/etc"] {
            let result = cleanup_temp_files(Path::new(dir), Duration::from_secs(0)).await;
            assert!(result.is_err(), "{dir} should be refused");
        }
    }

    #[tokio::test]
    async fn missing_directory_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("not-there");
        assert_eq!(cleanup_temp_files(&missing, Duration::ZERO).await.unwrap(), 0);
    }
}
