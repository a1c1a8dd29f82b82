//! Local process discovery and forced termination.
//!
//! Liveness comes from the OS process table, responsiveness from the
//! application. Both are re-read every cycle; a PID seen in an earlier cycle
//! may belong to a different process by now.

use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Command-line markers of processes that share an instance directory but
/// must never be killed: our own filtering artifacts, manually started
/// copies, and child processes spawned by an instance.
const EXCLUDED_MARKERS: &[&str] = &["grep", "_manual", "child"];

/// One row of the process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub command_line: String,
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to run process listing: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("process listing exited with {status}: {stderr}")]
    Listing { status: String, stderr: String },
}

/// Enumerates processes on the local host.
#[async_trait]
pub trait ProcessTable: Send + Sync {
    async fn list(&self) -> Result<Vec<ProcessEntry>, ProcessError>;
}

/// Reads the process table with `ps`.
pub struct PsProcessTable;

#[async_trait]
impl ProcessTable for PsProcessTable {
    async fn list(&self) -> Result<Vec<ProcessEntry>, ProcessError> {
        let output = tokio::process::Command::new("ps")
            .args(["-eo", "pid=,args="])
            .output()
            .await
            .map_err(ProcessError::Spawn)?;
        if !output.status.success() {
            return Err(ProcessError::Listing {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(parse_ps_output(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parse `ps -eo pid=,args=` output. Lines without a leading PID are skipped.
pub fn parse_ps_output(stdout: &str) -> Vec<ProcessEntry> {
    stdout
        .lines()
        .filter_map(|line| {
            let line = line.trim_start();
            let (pid, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
            let pid = pid.parse().ok()?;
            Some(ProcessEntry {
                pid,
                command_line: rest.trim().to_string(),
            })
        })
        .collect()
}

/// Whether `entry` is a process of the instance deployed at `instance_dir`
/// that the watchdog may kill.
///
/// The directory must appear as a whole path: `/srv/Bot1` matches
/// `/srv/Bot1/app.js` but neither `/srv/Bot10/app.js` nor
/// `/backup/srv/Bot1/app.js`.
pub fn is_candidate(entry: &ProcessEntry, instance_dir: &str, own_pid: u32) -> bool {
    let dir = instance_dir.trim_end_matches('/');
    if entry.pid == own_pid || dir.is_empty() {
        return false;
    }
    if EXCLUDED_MARKERS
        .iter()
        .any(|marker| entry.command_line.contains(marker))
    {
        return false;
    }
    let line = entry.command_line.as_str();
    line.match_indices(dir).any(|(start, _)| {
        let before = line[..start].chars().next_back();
        let after = line[start + dir.len()..].chars().next();
        starts_path(before) && ends_path(after)
    })
}

/// A path argument starts at the beginning of the line, after whitespace or
/// a `--flag=`, or inside quotes.
fn starts_path(before: Option<char>) -> bool {
    match before {
        None => true,
        Some(c) => c.is_whitespace() || matches!(c, '/' | '=' | '"' | '\''),
    }
}

fn ends_path(after: Option<char>) -> bool {
    match after {
        None => true,
        Some(c) => c.is_whitespace() || matches!(c, '/' | '"' | '\''),
    }
}

/// PIDs of local processes belonging to the instance at `instance_dir`,
/// never including `own_pid`.
pub async fn find_candidate_pids(
    table: &dyn ProcessTable,
    instance_dir: &Path,
    own_pid: u32,
) -> Result<Vec<u32>, ProcessError> {
    if cfg!(windows) {
        warn!("process monitoring not supported on windows, skipped");
        return Ok(Vec::new());
    }
    let dir = instance_dir.to_string_lossy();
    let pids: Vec<u32> = table
        .list()
        .await?
        .iter()
        .filter(|entry| is_candidate(entry, &dir, own_pid))
        .map(|entry| entry.pid)
        .collect();
    debug!(dir = %dir, ?pids, "candidate processes");
    Ok(pids)
}

/// Forcefully ends a process.
pub trait Terminator: Send + Sync {
    /// Kill `pid`. Errors are logged, never returned: a stray match we lack
    /// the rights to kill must not take the watchdog down.
    fn terminate(&self, pid: u32);
}

/// Sends SIGKILL. The supervising restart script brings the instance back.
pub struct SignalTerminator;

#[cfg(unix)]
impl Terminator for SignalTerminator {
    fn terminate(&self, pid: u32) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            error!(pid, "pid out of range, not killing");
            return;
        };
        match kill(Pid::from_raw(raw), Signal::SIGKILL) {
            Ok(()) => info!(pid, "sent SIGKILL"),
            Err(e) => error!(pid, error = %e, "failed to kill process"),
        }
    }
}

#[cfg(not(unix))]
impl Terminator for SignalTerminator {
    fn terminate(&self, pid: u32) {
        warn!(pid, "process termination not supported on this platform");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Fixed process table.
    pub(crate) struct StaticTable(pub(crate) Vec<ProcessEntry>);

    #[async_trait]
    impl ProcessTable for StaticTable {
        async fn list(&self) -> Result<Vec<ProcessEntry>, ProcessError> {
            Ok(self.0.clone())
        }
    }

    /// Records PIDs instead of killing them.
    #[derive(Default)]
    pub(crate) struct RecordingTerminator {
        pub(crate) killed: Mutex<Vec<u32>>,
    }

    impl Terminator for RecordingTerminator {
        fn terminate(&self, pid: u32) {
            self.killed.lock().unwrap().push(pid);
        }
    }

    pub(crate) fn entry(pid: u32, command_line: &str) -> ProcessEntry {
        ProcessEntry {
            pid,
            command_line: command_line.to_string(),
        }
    }

    #[test]
    fn test_parse_ps_output() {
        let out = "    1 /sbin/init\n 4321 node /srv/Bot2/build/app.js --trader=live\n\n  77 [kthreadd]\n";
        let entries = parse_ps_output(out);
        assert_eq!(
            entries,
            vec![
                entry(1, "/sbin/init"),
                entry(4321, "node /srv/Bot2/build/app.js --trader=live"),
                entry(77, "[kthreadd]"),
            ]
        );
    }

    #[test]
    fn test_parse_ps_output_skips_header_and_garbage() {
        let out = "  PID COMMAND\nnot-a-pid foo\n 12\n";
        assert_eq!(parse_ps_output(out), vec![entry(12, "")]);
    }

    #[test]
    fn test_candidate_matches_instance_dir() {
        let e = entry(4321, "node /srv/Bot2/build/app.js");
        assert!(is_candidate(&e, "/srv/Bot2", 1));
        assert!(is_candidate(&e, "/srv/Bot2/", 1));
    }

    #[test]
    fn test_candidate_matches_dir_at_end_of_line() {
        assert!(is_candidate(&entry(5, "bash run.sh /srv/Bot2"), "/srv/Bot2", 1));
    }

    #[test]
    fn test_candidate_rejects_longer_sibling_name() {
        let e = entry(4321, "node /srv/Bot10/build/app.js");
        assert!(!is_candidate(&e, "/srv/Bot1", 1));
    }

    #[test]
    fn test_candidate_rejects_dir_inside_longer_path() {
        let e = entry(77, "node /home/other/MyBot2/app.js");
        assert!(!is_candidate(&e, "Bot2", 1));
        let e = entry(78, "node /backup/srv/Bot2/app.js");
        assert!(!is_candidate(&e, "/srv/Bot2", 1));
    }

    #[test]
    fn test_candidate_matches_flag_and_quoted_paths() {
        assert!(is_candidate(&entry(5, "node --cwd=/srv/Bot2 app.js"), "/srv/Bot2", 1));
        assert!(is_candidate(&entry(6, "sh -c \"cd '/srv/Bot2' && npm start\""), "/srv/Bot2", 1));
    }

    #[test]
    fn test_candidate_rejects_other_instance() {
        assert!(!is_candidate(&entry(4321, "node /srv/Bot3/app.js"), "/srv/Bot2", 1));
    }

    #[test]
    fn test_candidate_excludes_own_pid() {
        let e = entry(99, "node /srv/Bot1/app.js");
        assert!(!is_candidate(&e, "/srv/Bot1", 99));
    }

    #[test]
    fn test_candidate_excludes_markers() {
        assert!(!is_candidate(&entry(5, "grep /srv/Bot2"), "/srv/Bot2", 1));
        assert!(!is_candidate(&entry(6, "node /srv/Bot2/app.js --config=live_manual"), "/srv/Bot2", 1));
        assert!(!is_candidate(&entry(7, "node /srv/Bot2/child.js"), "/srv/Bot2", 1));
    }

    #[test]
    fn test_candidate_empty_dir_matches_nothing() {
        assert!(!is_candidate(&entry(5, "node /srv/Bot2/app.js"), "", 1));
        assert!(!is_candidate(&entry(5, "node /srv/Bot2/app.js"), "/", 1));
    }

    #[tokio::test]
    async fn test_find_candidate_pids() {
        let table = StaticTable(vec![
            entry(1, "/sbin/init"),
            entry(4321, "node /srv/Bot2/app.js"),
            entry(4322, "node /srv/Bot2/child.js"),
            entry(4400, "node /srv/Bot20/app.js"),
            entry(4500, "/usr/bin/node /srv/Bot2/server.js"),
        ]);
        let pids = find_candidate_pids(&table, Path::new("/srv/Bot2"), 1000)
            .await
            .unwrap();
        assert_eq!(pids, vec![4321, 4500]);
    }

    #[tokio::test]
    async fn test_find_candidate_pids_never_returns_self() {
        let own = std::process::id();
        let table = StaticTable(vec![entry(own, "fleetwatch /srv/Bot1")]);
        let pids = find_candidate_pids(&table, Path::new("/srv/Bot1"), own)
            .await
            .unwrap();
        assert!(pids.is_empty());
    }

    #[tokio::test]
    async fn test_ps_table_lists_own_process() {
        let entries = PsProcessTable.list().await.unwrap();
        assert!(entries.iter().any(|e| e.pid == std::process::id()));
    }

    #[test]
    fn test_signal_terminator_missing_pid_does_not_panic() {
        // Far above any default pid_max, so no such process
        SignalTerminator.terminate(999_999_999);
    }
}
