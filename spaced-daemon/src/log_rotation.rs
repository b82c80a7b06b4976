//! Size-based rotation of the node's stdout/stderr logs.
//!
//! The node holds its log files open in append mode for its whole life, so a
//! rename would leave it writing into the rotated copy. Rotation therefore
//! copies the live file to `<name>.1` and truncates it in place; the node's
//! next append lands at the new end of file.
//!
//!   node.log → node.log.1 → node.log.2 → … → node.log.5

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Live log size that triggers rotation (10 MiB).
pub const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;

/// Rotated copies kept per log.
pub const MAX_ROTATED_FILES: usize = 5;

/// Rotate `log_path` when it has reached `max_bytes`.
///
/// Returns `false` if the file is under the threshold or does not exist.
pub fn rotate_if_needed(log_path: &Path, max_bytes: u64, max_files: usize) -> io::Result<bool> {
    let size = match fs::metadata(log_path) {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    };
    if size < max_bytes || max_files == 0 {
        return Ok(false);
    }

    let oldest = numbered_path(log_path, max_files);
    match fs::remove_file(&oldest) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    for n in (1..max_files).rev() {
        let src = numbered_path(log_path, n);
        if src.exists() {
            fs::rename(&src, numbered_path(log_path, n + 1))?;
        }
    }

    fs::copy(log_path, numbered_path(log_path, 1))?;
    fs::OpenOptions::new().write(true).open(log_path)?.set_len(0)?;
    Ok(true)
}

/// Rotate both node logs under `home`. A failure on one does not block the
/// other.
pub fn rotate_node_logs(home: &Path) {
    for log_path in [
        crate::paths::node_stdout_log_path(home),
        crate::paths::node_stderr_log_path(home),
    ] {
        match rotate_if_needed(&log_path, MAX_LOG_BYTES, MAX_ROTATED_FILES) {
            Ok(true) => tracing::info!(path = %log_path.display(), "node log rotated"),
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(path = %log_path.display(), error = %err, "node log rotation failed")
            }
        }
    }
}

/// `node.log` + 2 → `node.log.2`.
pub fn numbered_path(base: &Path, n: usize) -> PathBuf {
    let mut name = base.file_name().map(|s| s.to_os_string()).unwrap_or_default();
    name.push(format!(".{n}"));
    base.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Write;
    use tempfile::TempDir;

    const SMALL: u64 = 64;

    fn log_with(dir: &TempDir, bytes: usize) -> PathBuf {
        let path = dir.path().join("node.log");
        fs::write(&path, vec![b'x'; bytes]).unwrap();
        path
    }

    #[rstest]
    #[case::under(SMALL as usize - 1, false)]
    #[case::at(SMALL as usize, true)]
    #[case::over(SMALL as usize * 3, true)]
    fn threshold(#[case] bytes: usize, #[case] expected: bool) {
        let dir = TempDir::new().unwrap();
        let log = log_with(&dir, bytes);
        assert_eq!(rotate_if_needed(&log, SMALL, 3).unwrap(), expected);
        assert_eq!(numbered_path(&log, 1).exists(), expected);
    }

    #[test]
    fn missing_log_is_skipped() {
        let dir = TempDir::new().unwrap();
        assert!(!rotate_if_needed(&dir.path().join("node.log"), SMALL, 3).unwrap());
    }

    #[test]
    fn open_writer_keeps_appending_to_live_file() {
        let dir = TempDir::new().unwrap();
        let log = log_with(&dir, 0);
        let mut writer = fs::OpenOptions::new().append(true).open(&log).unwrap();
        writer.write_all(&[b'a'; SMALL as usize]).unwrap();

        assert!(rotate_if_needed(&log, SMALL, 3).unwrap());
        writer.write_all(b"after").unwrap();
        drop(writer);

        assert_eq!(fs::read(&log).unwrap(), b"after");
        assert_eq!(fs::metadata(numbered_path(&log, 1)).unwrap().len(), SMALL);
    }

    #[test]
    fn copies_shift_and_are_capped() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("node.log");
        for round in 1..=4u8 {
            fs::write(&log, vec![b'0' + round; SMALL as usize]).unwrap();
            rotate_if_needed(&log, SMALL, 3).unwrap();
        }
        // Newest first: round 4 in .1, round 2 in .3, round 1 dropped.
        assert_eq!(fs::read(numbered_path(&log, 1)).unwrap()[0], b'4');
        assert_eq!(fs::read(numbered_path(&log, 3)).unwrap()[0], b'2');
        assert!(!numbered_path(&log, 4).exists());
    }

    #[test]
    fn numbered_path_appends_suffix() {
        assert_eq!(
            numbered_path(Path::new("/x/node-err.log"), 2),
            PathBuf::from("/x/node-err.log.2")
        );
    }
}
