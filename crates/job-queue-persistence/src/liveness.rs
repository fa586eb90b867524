use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::collections::HashSet;

/// Answers whether the process owning a worker registration still exists.
pub trait ProcessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Probes with signal 0: delivery is checked but nothing is sent.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalProbe;

impl ProcessProbe for SignalProbe {
    fn is_alive(&self, pid: u32) -> bool {
        // 0 and negative values address process groups, never a single worker
        let raw = match i32::try_from(pid) {
            Ok(raw) if raw > 0 => raw,
            _ => return false,
        };

        match kill(Pid::from_raw(raw), None) {
            Ok(()) => true,
            // exists, owned by another user
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
}

/// Probe backed by a fixed set of live PIDs.
#[derive(Debug, Clone, Default)]
pub struct FixedProbe {
    alive: HashSet<u32>,
}

impl FixedProbe {
    pub fn new(alive: impl IntoIterator<Item = u32>) -> Self {
        FixedProbe {
            alive: alive.into_iter().collect(),
        }
    }
}

impl ProcessProbe for FixedProbe {
    fn is_alive(&self, pid: u32) -> bool {
        self.alive.contains(&pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_alive() {
        assert!(SignalProbe.is_alive(std::process::id()));
    }

    #[test]
    fn test_invalid_pids_are_dead() {
        assert!(!SignalProbe.is_alive(0));
        assert!(!SignalProbe.is_alive(u32::MAX));
    }

    #[test]
    fn test_reaped_child_is_dead() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!SignalProbe.is_alive(pid));
    }

    #[test]
    fn test_fixed_probe() {
        let probe = FixedProbe::new([10, 20]);
        assert!(probe.is_alive(10));
        assert!(!probe.is_alive(30));
    }
}
