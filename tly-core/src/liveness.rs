//! Pluggable process liveness checks.

/// Answer of a liveness collaborator for one process id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Alive,
    Dead,
    /// The check could not decide; callers must treat this as alive.
    Unknown,
}

impl ProcessState {
    /// Only a confirmed death counts; uncertainty keeps data.
    #[inline]
    #[must_use]
    pub fn is_dead(self) -> bool {
        self == Self::Dead
    }
}

pub trait Liveness: Send + Sync {
    fn state(&self, pid: u32) -> ProcessState;
}

impl<F> Liveness for F
where
    F: Fn(u32) -> ProcessState + Send + Sync,
{
    fn state(&self, pid: u32) -> ProcessState {
        self(pid)
    }
}

/// Liveness from the host process table via `kill(pid, 0)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessTable;

impl Liveness for ProcessTable {
    #[cfg(unix)]
    fn state(&self, pid: u32) -> ProcessState {
        let Ok(raw) = libc::pid_t::try_from(pid) else {
            return ProcessState::Unknown;
        };
        if raw <= 0 {
            // 0 and negatives address process groups, not a single process.
            return ProcessState::Unknown;
        }

        // SAFETY: signal 0 performs only the existence and permission check.
        let rc = unsafe { libc::kill(raw, 0) };
        if rc == 0 {
            return ProcessState::Alive;
        }
        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::ESRCH) => ProcessState::Dead,
            // Exists, owned by someone else.
            Some(libc::EPERM) => ProcessState::Alive,
            _ => ProcessState::Unknown,
        }
    }

    #[cfg(not(unix))]
    fn state(&self, _pid: u32) -> ProcessState {
        ProcessState::Unknown
    }
}
