//! Startup stdout guard.
//!
//! stdout is the protocol channel. Until the session loop takes over, fd 1 is
//! pointed at a private pipe whose contents are copied to stderr, so nothing
//! written incidentally during startup can corrupt the stream.

/// Holds fd 1 redirected until [`restore`](StdoutGuard::restore) or drop.
pub struct StdoutGuard {
    #[cfg(unix)]
    redirect: Option<unix::Redirect>,
}

impl StdoutGuard {
    /// Redirect fd 1 into a pipe drained to stderr.
    ///
    /// Must run before anything else writes to stdout. A no-op off unix.
    pub fn engage() -> std::io::Result<Self> {
        #[cfg(unix)]
        {
            Ok(Self {
                redirect: Some(unix::Redirect::engage()?),
            })
        }
        #[cfg(not(unix))]
        {
            Ok(Self::disengaged())
        }
    }

    /// A guard that redirects nothing.
    pub fn disengaged() -> Self {
        Self {
            #[cfg(unix)]
            redirect: None,
        }
    }

    pub fn is_engaged(&self) -> bool {
        #[cfg(unix)]
        {
            self.redirect.is_some()
        }
        #[cfg(not(unix))]
        {
            false
        }
    }

    /// Put the real stdout back on fd 1. Safe to call more than once.
    ///
    /// Everything captured so far has reached stderr when this returns.
    pub fn restore(&mut self) -> std::io::Result<()> {
        #[cfg(unix)]
        {
            if let Some(redirect) = self.redirect.take() {
                redirect.restore()?;
            }
        }
        Ok(())
    }
}

impl Drop for StdoutGuard {
    fn drop(&mut self) {
        let _ = self.restore();
    }
}

#[cfg(unix)]
mod unix {
    use std::io::Write;
    use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
    use std::thread::JoinHandle;

    use nix::fcntl::{fcntl, FcntlArg, FdFlag};
    use nix::unistd;

    pub(super) struct Redirect {
        /// Close-on-exec duplicate of the original fd 1.
        saved: OwnedFd,
        drain: JoinHandle<()>,
    }

    impl Redirect {
        pub(super) fn engage() -> std::io::Result<Self> {
            let stdout = std::io::stdout();
            stdout.lock().flush()?;

            // Backends spawned during startup must not inherit the real
            // stdout or the drain pipe.
            let saved = cloexec_dup(stdout.as_fd())?;
            let (read_end, write_end) = cloexec_pipe()?;
            unistd::dup2_stdout(&write_end)?;
            // fd 1 is now the pipe's only writer.
            drop(write_end);

            let mut reader = std::fs::File::from(read_end);
            let drain = std::thread::Builder::new()
                .name("stdout-drain".into())
                .spawn(move || {
                    let _ = std::io::copy(&mut reader, &mut std::io::stderr());
                })?;

            Ok(Self { saved, drain })
        }

        pub(super) fn restore(self) -> std::io::Result<()> {
            std::io::stdout().lock().flush()?;
            // Replacing fd 1 closes the last write end, so the drain sees EOF.
            unistd::dup2_stdout(&self.saved)?;
            let _ = self.drain.join();
            Ok(())
        }
    }

    /// Duplicate `fd` with `FD_CLOEXEC` set (`F_DUPFD_CLOEXEC`).
    pub(super) fn cloexec_dup(fd: BorrowedFd<'_>) -> std::io::Result<OwnedFd> {
        fd.try_clone_to_owned()
    }

    /// A pipe whose ends are both close-on-exec.
    pub(super) fn cloexec_pipe() -> std::io::Result<(OwnedFd, OwnedFd)> {
        let (read_end, write_end) = unistd::pipe()?;
        for end in [&read_end, &write_end] {
            fcntl(end, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
        }
        Ok((read_end, write_end))
    }

    #[cfg(test)]
    pub(super) fn is_cloexec(fd: BorrowedFd<'_>) -> std::io::Result<bool> {
        let flags = fcntl(fd, FcntlArg::F_GETFD)?;
        Ok(FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC))
    }
}
