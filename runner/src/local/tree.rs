//! Killing a process together with everything it spawned.

#[cfg(unix)]
use tracing::{debug, warn};

/// Kill the descendants of `root` deepest-first, then its process group.
///
/// Descendants are enumerated once, now; anything forked after the scan is
/// only reached through the process group.
#[cfg(unix)]
pub fn kill_tree(root: u32) {
    let descendants = descendants(root);
    debug!(pid = root, count = descendants.len(), "Killing process tree");

    for pid in descendants.iter().rev() {
        send_kill(*pid);
    }

    // SAFETY: killpg has no memory-safety preconditions.
    let rc = unsafe { libc::killpg(root as libc::pid_t, libc::SIGKILL) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!(pid = root, error = %err, "Failed to kill process group");
        }
    }
}

#[cfg(not(unix))]
pub fn kill_tree(_root: u32) {}

#[cfg(unix)]
fn send_kill(pid: u32) {
    // SAFETY: kill has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            debug!(pid, error = %err, "Failed to kill descendant");
        }
    }
}

/// Descendants of `root` in breadth-first order.
#[cfg(target_os = "linux")]
fn descendants(root: u32) -> Vec<u32> {
    use std::collections::{HashMap, VecDeque};

    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };
        let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        if let Some(ppid) = parse_ppid(&stat) {
            children.entry(ppid).or_default().push(pid);
        }
    }

    let mut found = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        if let Some(kids) = children.get(&pid) {
            for kid in kids {
                if *kid != root && !found.contains(kid) {
                    found.push(*kid);
                    queue.push_back(*kid);
                }
            }
        }
    }
    found
}

#[cfg(all(unix, not(target_os = "linux")))]
fn descendants(_root: u32) -> Vec<u32> {
    Vec::new()
}

/// Parent pid from the contents of `/proc/<pid>/stat`. The command name may
/// itself contain spaces and parentheses, so fields are read after the last
/// `)`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
pub(crate) fn parse_ppid(stat: &str) -> Option<u32> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    fields.next()?;
    fields.next()?.parse().ok()
}
