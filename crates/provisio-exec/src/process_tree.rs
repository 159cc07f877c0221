//! Whole-tree termination for spawned children.
//!
//! Children are started as leaders of their own process group, so signalling
//! the group (the negative pid) also reaches any helpers they spawned.

/// Send SIGKILL to the process group led by `pgid`.
///
/// A group that has already exited is not an error.
pub fn kill_process_tree(pgid: u32) -> std::io::Result<()> {
    signal_process_tree(pgid, TreeSignal::Kill)
}

/// Send SIGTERM to the process group led by `pgid`, asking it to exit.
pub fn terminate_process_tree(pgid: u32) -> std::io::Result<()> {
    signal_process_tree(pgid, TreeSignal::Terminate)
}

#[derive(Debug, Clone, Copy)]
enum TreeSignal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_process_tree(pgid: u32, signal: TreeSignal) -> std::io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pgid).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("process group id out of range: {pgid}"),
        )
    })?;
    let signal = match signal {
        TreeSignal::Terminate => Signal::SIGTERM,
        TreeSignal::Kill => Signal::SIGKILL,
    };

    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(std::io::Error::from(errno)),
    }
}

#[cfg(not(unix))]
fn signal_process_tree(pgid: u32, signal: TreeSignal) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        format!("process-group {signal:?} is not available on this platform (pgid {pgid})"),
    ))
}

/// Put `command` in a fresh process group led by the child itself.
pub fn isolate_process_group(command: &mut tokio::process::Command) {
    #[cfg(unix)]
    command.process_group(0);
    #[cfg(not(unix))]
    let _ = command;
}
