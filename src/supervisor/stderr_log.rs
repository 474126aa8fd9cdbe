//! Per-daemon stderr log files: path layout, rotation and tail.

use std::collections::VecDeque;
use std::fs;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

/// `<log_dir>/<daemon>.stderr`
pub fn log_path(log_dir: &Path, daemon: &str) -> PathBuf {
    log_dir.join(format!("{}.stderr", daemon))
}

fn numbered(path: &Path, n: u32) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{}", n));
    PathBuf::from(name)
}

/// Shifts `path` to `path.1`, `path.1` to `path.2`, ... keeping `keep` old files.
pub fn rotate(path: &Path, keep: u32) -> io::Result<()> {
    if keep == 0 {
        return match fs::remove_file(path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        };
    }

    let oldest = numbered(path, keep);
    if oldest.exists() {
        fs::remove_file(&oldest)?;
    }
    for n in (1..keep).rev() {
        let from = numbered(path, n);
        if from.exists() {
            fs::rename(&from, numbered(path, n + 1))?;
        }
    }
    if path.exists() {
        fs::rename(path, numbered(path, 1))?;
    }
    Ok(())
}

/// Returns the last `n` lines of the file.
pub fn tail(path: &Path, n: usize) -> io::Result<Vec<String>> {
    let file = fs::File::open(path)?;
    let mut lines = VecDeque::with_capacity(n + 1);
    for line in BufReader::new(file).lines() {
        lines.push_back(line?);
        if lines.len() > n {
            lines.pop_front();
        }
    }
    Ok(lines.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_returns_last_n_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(dir.path(), "svc");
        let content: String = (0..10).map(|i| format!("line {i}\n")).collect();
        fs::write(&path, content).unwrap();

        assert_eq!(tail(&path, 3).unwrap(), vec!["line 7", "line 8", "line 9"]);
        assert_eq!(tail(&path, 100).unwrap().len(), 10);
    }

    #[test]
    fn tail_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(tail(&log_path(dir.path(), "missing"), 10).is_err());
    }

    #[test]
    fn rotate_shifts_and_drops_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(dir.path(), "svc");

        for run in 0..4 {
            rotate(&path, 2).unwrap();
            fs::write(&path, format!("run {run}")).unwrap();
        }

        assert_eq!(fs::read_to_string(&path).unwrap(), "run 3");
        assert_eq!(fs::read_to_string(numbered(&path, 1)).unwrap(), "run 2");
        assert_eq!(fs::read_to_string(numbered(&path, 2)).unwrap(), "run 1");
        assert!(!numbered(&path, 3).exists());
    }

    #[test]
    fn rotate_without_existing_log_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        rotate(&log_path(dir.path(), "fresh"), 3).unwrap();
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
