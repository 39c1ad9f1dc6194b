//! The concrete line-oriented DAG grammar (§6): `TASK`, `EDGE`, `PIPE`,
//! `FILE` directives.

use std::collections::HashMap;
use std::path::Path;

use thiserror::Error;

use super::{Task, TaskId, TaskState};

#[derive(Debug, Error)]
pub enum DagParseError {
    #[error("line {line}: duplicate task {name:?}")]
    DuplicateTask { line: usize, name: String },
    #[error("line {line}: unknown task {name:?} referenced")]
    UnknownTask { line: usize, name: String },
    #[error("line {line}: malformed directive: {text:?}")]
    Malformed { line: usize, text: String },
    #[error("line {line}: EDGE, PIPE, or FILE must follow the TASK lines of both endpoints (forward reference to {name:?})")]
    ForwardReference { line: usize, name: String },
    #[error("failed to read DAG file: {0}")]
    Io(#[from] std::io::Error),
}

/// Parse a DAG text into the ordered task list `Dag::new` expects. Task
/// `parents`/`children` edges and forward maps are filled in; `seq` is
/// assigned in file order.
pub fn parse_dag_file(path: &Path, default_retries: u32) -> Result<Vec<Task>, DagParseError> {
    let text = std::fs::read_to_string(path)?;
    parse_dag_text(&text, default_retries)
}

fn parse_dag_text(text: &str, default_retries: u32) -> Result<Vec<Task>, DagParseError> {
    let mut tasks: Vec<Task> = Vec::new();
    let mut by_name: HashMap<String, TaskId> = HashMap::new();

    for (idx, raw_line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut words = line.splitn(2, char::is_whitespace);
        let keyword = words.next().unwrap_or("");
        let rest = words.next().unwrap_or("").trim();

        match keyword {
            "TASK" => {
                let (name, attrs_and_argv) = rest
                    .split_once(char::is_whitespace)
                    .ok_or_else(|| malformed(line_no, line))?;
                if by_name.contains_key(name) {
                    return Err(DagParseError::DuplicateTask {
                        line: line_no,
                        name: name.to_string(),
                    });
                }
                let (attrs_str, argv_str) = attrs_and_argv
                    .split_once("::")
                    .ok_or_else(|| malformed(line_no, line))?;

                let mut memory = 0u32;
                let mut cpus = 1u16;
                let mut priority = 0i64;
                let mut retries = default_retries;
                let mut pegasus_id = None;
                let mut pegasus_tr = None;

                for attr in attrs_str.split_whitespace() {
                    let (key, value) = attr
                        .split_once('=')
                        .ok_or_else(|| malformed(line_no, line))?;
                    match key {
                        "memory" => memory = value.parse().map_err(|_| malformed(line_no, line))?,
                        "cpus" => cpus = value.parse().map_err(|_| malformed(line_no, line))?,
                        "priority" => {
                            priority = value.parse().map_err(|_| malformed(line_no, line))?
                        }
                        "retries" => {
                            retries = value.parse().map_err(|_| malformed(line_no, line))?
                        }
                        "pegasus_id" => pegasus_id = Some(value.to_string()),
                        "pegasus_tr" => pegasus_tr = Some(value.to_string()),
                        _ => return Err(malformed(line_no, line)),
                    }
                }

                let argv: Vec<String> = argv_str.split_whitespace().map(str::to_string).collect();
                if argv.is_empty() {
                    return Err(malformed(line_no, line));
                }

                let id = TaskId::from_raw(tasks.len());
                by_name.insert(name.to_string(), id);
                tasks.push(Task {
                    id,
                    name: name.to_string(),
                    argv,
                    memory,
                    cpus,
                    priority,
                    retries_remaining: retries,
                    state: TaskState::Unready,
                    pegasus_id,
                    pegasus_tr,
                    pipe_forwards: HashMap::new(),
                    file_forwards: HashMap::new(),
                    parents: vec![],
                    children: vec![],
                    seq: id.raw(),
                });
            }
            "EDGE" => {
                let mut parts = rest.split_whitespace();
                let parent = parts.next().ok_or_else(|| malformed(line_no, line))?;
                let child = parts.next().ok_or_else(|| malformed(line_no, line))?;
                if parts.next().is_some() {
                    return Err(malformed(line_no, line));
                }
                let parent_id = *by_name.get(parent).ok_or_else(|| {
                    DagParseError::ForwardReference {
                        line: line_no,
                        name: parent.to_string(),
                    }
                })?;
                let child_id = *by_name.get(child).ok_or_else(|| {
                    DagParseError::ForwardReference {
                        line: line_no,
                        name: child.to_string(),
                    }
                })?;
                tasks[child_id.raw()].parents.push(parent_id);
                tasks[parent_id.raw()].children.push(child_id);
            }
            "PIPE" | "FILE" => {
                let mut parts = rest.splitn(3, char::is_whitespace);
                let name = parts.next().ok_or_else(|| malformed(line_no, line))?;
                let var_or_path = parts.next().ok_or_else(|| malformed(line_no, line))?;
                let dest = parts.next().ok_or_else(|| malformed(line_no, line))?.trim();
                if dest.is_empty() {
                    return Err(malformed(line_no, line));
                }
                let id = *by_name
                    .get(name)
                    .ok_or_else(|| DagParseError::UnknownTask {
                        line: line_no,
                        name: name.to_string(),
                    })?;
                let task = &mut tasks[id.raw()];
                let map = if keyword == "PIPE" {
                    &mut task.pipe_forwards
                } else {
                    &mut task.file_forwards
                };
                map.insert(var_or_path.to_string(), dest.to_string());
            }
            _ => return Err(malformed(line_no, line)),
        }
    }

    Ok(tasks)
}

fn malformed(line: usize, text: &str) -> DagParseError {
    DagParseError::Malformed {
        line,
        text: text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_diamond() {
        let text = "\
TASK A priority=1 :: echo a
TASK B memory=512 cpus=2 :: echo b
TASK C :: echo c
TASK D :: echo d
EDGE A B
EDGE A C
EDGE B D
EDGE C D
";
        let tasks = parse_dag_text(text, 1).unwrap();
        assert_eq!(tasks.len(), 4);
        let a = &tasks[0];
        assert_eq!(a.name, "A");
        assert_eq!(a.priority, 1);
        let b = &tasks[1];
        assert_eq!(b.memory, 512);
        assert_eq!(b.cpus, 2);
        assert_eq!(tasks[3].parents.len(), 2);
    }

    #[test]
    fn forward_reference_is_error() {
        let text = "\
TASK A :: echo a
EDGE A B
TASK B :: echo b
";
        let err = parse_dag_text(text, 1).unwrap_err();
        assert!(matches!(err, DagParseError::ForwardReference { name, .. } if name == "B"));
    }

    #[test]
    fn duplicate_task_is_error() {
        let text = "\
TASK A :: echo a
TASK A :: echo a2
";
        let err = parse_dag_text(text, 1).unwrap_err();
        assert!(matches!(err, DagParseError::DuplicateTask { name, .. } if name == "A"));
    }

    #[test]
    fn pipe_and_file_directives_attach_forwards() {
        let text = "\
TASK A :: echo a
PIPE A stdout /tmp/a.out
FILE A data.txt /tmp/a.data
";
        let tasks = parse_dag_text(text, 1).unwrap();
        assert_eq!(tasks[0].pipe_forwards.get("stdout").unwrap(), "/tmp/a.out");
        assert_eq!(tasks[0].file_forwards.get("data.txt").unwrap(), "/tmp/a.data");
    }

    #[test]
    fn unknown_task_in_pipe_is_error() {
        let text = "PIPE ghost stdout /tmp/x\n";
        let err = parse_dag_text(text, 1).unwrap_err();
        assert!(matches!(err, DagParseError::UnknownTask { name, .. } if name == "ghost"));
    }

    #[test]
    fn blank_and_comment_lines_ignored() {
        let text = "\
# a comment

TASK A :: echo a
";
        let tasks = parse_dag_text(text, 1).unwrap();
        assert_eq!(tasks.len(), 1);
    }
}
