//! Process liveness checks.

/// Reports whether a process still exists on this host.
pub trait Liveness: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;

    /// `None` means the caller gave no pid, which is treated as alive.
    fn is_owner_alive(&self, pid: Option<u32>) -> bool {
        pid.map_or(true, |pid| self.is_alive(pid))
    }
}

/// Signal-0 probe against the host process table.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLiveness;

impl Liveness for ProcessLiveness {
    #[cfg(unix)]
    fn is_alive(&self, pid: u32) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        // pid 0 and negative values address process groups, not a process.
        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        if raw <= 0 {
            return false;
        }

        match kill(Pid::from_raw(raw), None) {
            Ok(()) => true,
            // Exists but owned by another user.
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    #[cfg(not(unix))]
    fn is_alive(&self, _pid: u32) -> bool {
        true
    }
}
