//! Rescue file read/append per §3 and §4.1: `DONE <task-name>` lines.

use std::io::Write as _;
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RescueError {
    #[error("rescue file references unknown task {0:?}")]
    UnknownTask(String),
    #[error("rescue file line {0}: malformed entry {1:?}")]
    Malformed(usize, String),
    #[error("rescue file i/o error: {0}")]
    Io(#[source] std::io::Error),
}

/// Read every `DONE <name>` line from a rescue file. Returns an empty vector
/// if `path` does not exist (no prior run to resume).
pub fn read_rescue(path: &Path) -> Result<Vec<String>, RescueError> {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(RescueError::Io(e)),
    };

    let mut done = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let name = line
            .strip_prefix("DONE ")
            .ok_or_else(|| RescueError::Malformed(idx + 1, line.to_string()))?;
        done.push(name.trim().to_string());
    }
    Ok(done)
}

/// Append a single `DONE <name>` line, flushed to the OS before returning,
/// so a crash leaves a usable prefix (§3, §5 ordering guarantee: rescue
/// append happens before the matching `TaskSuccess` event is delivered).
pub fn write_rescue_entry(path: &Path, task_name: &str) -> Result<(), RescueError> {
    let mut f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(RescueError::Io)?;
    writeln!(f, "DONE {task_name}").map_err(RescueError::Io)?;
    f.flush().map_err(RescueError::Io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("no-such-rescue");
        assert_eq!(read_rescue(&path).unwrap(), Vec::<String>::new());
    }

    #[test]
    fn append_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rescue.log");
        write_rescue_entry(&path, "A").unwrap();
        write_rescue_entry(&path, "B").unwrap();
        let done = read_rescue(&path).unwrap();
        assert_eq!(done, vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn malformed_line_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rescue.log");
        std::fs::write(&path, "NOT A DONE LINE\n").unwrap();
        assert!(read_rescue(&path).is_err());
    }
}
