//! Exercises the independent task cluster's line-protocol behaviour end to
//! end (SPEC §8 scenario 5): mixed success/failure input under each of the
//! three modes.

use std::io::Cursor;

use wrangler_core::cluster::{run, ClusterConfig, Mode};

fn config(mode: Mode) -> ClusterConfig {
    ClusterConfig {
        cpus: 1,
        mode,
        success_codes: vec![],
        progress_path: None,
        setup: None,
        cleanup: None,
        app_name: "cluster".to_string(),
    }
}

#[test]
fn collect_mode_reports_failure_and_full_task_count() {
    let input = "echo ok\nfalse\necho ok\n";
    let summary = run(Cursor::new(input), &config(Mode::Collect)).unwrap();
    assert_eq!(summary.tasks, 3);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 1);
    assert!(!summary.stat_ok);
}

#[test]
fn old_mode_reports_ok_with_same_counts() {
    let input = "echo ok\nfalse\necho ok\n";
    let summary = run(Cursor::new(input), &config(Mode::Old)).unwrap();
    assert_eq!(summary.tasks, 3);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 1);
    assert!(summary.stat_ok);
}

#[test]
fn fail_hard_mode_stops_scheduling_after_first_failure() {
    let input = "echo ok\nfalse\necho ok\n";
    let summary = run(Cursor::new(input), &config(Mode::FailHard)).unwrap();
    assert_eq!(summary.tasks, 2);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.extra, 1);
    assert!(!summary.stat_ok);
}

#[test]
fn blank_and_comment_lines_do_not_count_as_tasks() {
    let input = "# a comment\n\necho ok\n\n# another\necho ok\n";
    let summary = run(Cursor::new(input), &config(Mode::Collect)).unwrap();
    assert_eq!(summary.lines, 2);
    assert_eq!(summary.tasks, 2);
    assert_eq!(summary.succeeded, 2);
}
