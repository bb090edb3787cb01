use nix::unistd::geteuid;

/// Effective uid from the `Uid:` line of `/proc/<pid>/status`
/// (real, effective, saved, filesystem).
pub fn parse_effective_uid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Uid:"))
        .and_then(|rest| rest.split_whitespace().nth(1))
        .and_then(|uid| uid.parse().ok())
}

/// Effective uid of a running process, falling back to the host's own when
/// procfs is unavailable; a child inherits it unless it changes it.
pub fn effective_uid(pid: u32) -> u32 {
    std::fs::read_to_string(format!("/proc/{pid}/status"))
        .ok()
        .and_then(|status| parse_effective_uid(&status))
        .unwrap_or_else(|| geteuid().as_raw())
}

pub fn warn_if_privileged(plugin_id: &str, pid: u32) {
    if effective_uid(pid) == 0 {
        tracing::warn!(
            plugin_id = %plugin_id,
            pid,
            "Plugin process is running with elevated privileges"
        );
    }
}
