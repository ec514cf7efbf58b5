//! PTY-backed terminal owned by one test attempt.
//!
//! Spawns the configured shell on a PTY slave, pumps master output through
//! the [`emulator`] and exposes the viewable/full buffer contract the
//! assertion engine polls against.

pub mod emulator;

pub use emulator::{render, render_lines, Emulator};

use crate::error::{TactError, TactResult};
use crate::shell::{self, Shell};
#[cfg(unix)]
use nix::fcntl::{fcntl, FcntlArg, OFlag};
#[cfg(unix)]
use nix::sys::signal::{killpg, Signal};
#[cfg(unix)]
use nix::unistd::Pid;
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::time::{Duration, Instant};

/// Everything needed to spawn a terminal for one attempt.
#[derive(Clone, Debug)]
pub struct SpawnSpec {
    pub shell: Shell,
    pub rows: u16,
    pub cols: u16,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<String>,
}

/// A live PTY with an attached shell and screen emulation.
pub struct Terminal {
    emulator: Emulator,
    master: Box<dyn portable_pty::MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    reader: Box<dyn Read + Send>,
    child: Box<dyn portable_pty::Child + Send + Sync>,
    eof: bool,
}

impl Terminal {
    /// Open a PTY pair, spawn the shell on the slave and set the master
    /// reader nonblocking so the poll loop can drain without stalling.
    pub fn spawn(spec: &SpawnSpec) -> TactResult<Self> {
        let system = native_pty_system();
        let size = PtySize {
            rows: spec.rows,
            cols: spec.cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        let pair = system
            .openpty(size)
            .map_err(|err| TactError::io("failed to open pty", err))?;

        let mut cmd = CommandBuilder::new(spec.shell.program());
        for arg in spec.shell.launch_args() {
            cmd.arg(arg);
        }
        if let Some(cwd) = &spec.cwd {
            cmd.cwd(cwd);
        }
        for (key, value) in shell::spawn_env(spec.shell) {
            cmd.env(key, value);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|err| TactError::io("failed to spawn shell", err))?;
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|err| TactError::io("failed to clone pty reader", err))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|err| TactError::io("failed to take pty writer", err))?;

        #[cfg(unix)]
        {
            if let Some(fd) = pair.master.as_raw_fd() {
                let flags = OFlag::from_bits_truncate(
                    fcntl(fd, FcntlArg::F_GETFL)
                        .map_err(|err| TactError::io("failed to get fd flags", err))?,
                );
                fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))
                    .map_err(|err| TactError::io("failed to set nonblocking", err))?;
            }
        }

        Ok(Self {
            emulator: Emulator::new(spec.rows, spec.cols),
            master: pair.master,
            writer,
            reader,
            child,
            eof: false,
        })
    }

    /// Write bytes to the PTY master, simulating user input.
    pub fn write(&mut self, bytes: &[u8]) -> TactResult<()> {
        self.writer
            .write_all(bytes)
            .map_err(|err| TactError::io("failed to write to pty", err))?;
        self.writer
            .flush()
            .map_err(|err| TactError::io("failed to flush pty", err))
    }

    /// Propagate a window-size change to the PTY and the emulator.
    pub fn resize(&mut self, rows: u16, cols: u16) -> TactResult<()> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| TactError::io("failed to resize pty", err))?;
        self.emulator.resize(rows, cols);
        Ok(())
    }

    /// Pump any pending PTY output through the emulator. Returns the number
    /// of bytes consumed; zero once the child has closed its end.
    pub fn drain(&mut self) -> usize {
        let mut total = 0;
        let mut buffer = [0u8; 4096];
        loop {
            match self.reader.read(&mut buffer) {
                Ok(0) => {
                    self.eof = true;
                    break;
                }
                Ok(count) => {
                    self.emulator.feed(&buffer[..count]);
                    total += count;
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => {
                    self.eof = true;
                    break;
                }
            }
        }
        total
    }

    /// The current screen, row-major.
    #[must_use]
    pub fn viewable_buffer(&mut self) -> Vec<Vec<char>> {
        self.drain();
        self.emulator.viewable_buffer()
    }

    /// Scrollback plus the current screen, row-major.
    #[must_use]
    pub fn buffer(&mut self) -> Vec<Vec<char>> {
        self.drain();
        self.emulator.buffer()
    }

    /// Whether the child closed its end of the PTY.
    #[must_use]
    pub fn eof(&self) -> bool {
        self.eof
    }

    /// Terminate the shell's process group and reap it.
    pub fn kill(&mut self) -> TactResult<()> {
        #[cfg(unix)]
        if let Some(pid) = self.child.process_id() {
            // Process ids fit in i32.
            #[allow(clippy::cast_possible_wrap)]
            let pgid = Pid::from_raw(pid as i32);
            signal_process_group(pgid, Signal::SIGTERM)?;
            if self.wait_for_exit(Duration::from_millis(200)).is_some() {
                return Ok(());
            }
            signal_process_group(pgid, Signal::SIGKILL)?;
            self.wait_for_exit(Duration::from_millis(200));
            return Ok(());
        }

        self.child
            .kill()
            .map_err(|err| TactError::io("failed to kill shell", err))
    }

    fn wait_for_exit(&mut self, timeout: Duration) -> Option<portable_pty::ExitStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => return Some(status),
                Ok(None) => {
                    if Instant::now() >= deadline {
                        return None;
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(_) => return None,
            }
        }
    }
}

impl Drop for Terminal {
    /// Best-effort teardown; errors cannot propagate from Drop.
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.child.process_id() {
            // Process ids fit in i32.
            #[allow(clippy::cast_possible_wrap)]
            let pgid = Pid::from_raw(pid as i32);
            let _ = signal_process_group(pgid, Signal::SIGTERM);
            let deadline = Instant::now() + Duration::from_millis(100);
            while Instant::now() < deadline {
                if self.child.try_wait().ok().flatten().is_some() {
                    return;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            let _ = signal_process_group(pgid, Signal::SIGKILL);
            return;
        }

        #[cfg(not(unix))]
        {
            let _ = self.child.kill();
        }
    }
}

#[cfg(unix)]
fn signal_process_group(pgid: Pid, signal: Signal) -> TactResult<()> {
    match killpg(pgid, signal) {
        // ESRCH: already gone.
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(err) => Err(TactError::io("failed to signal process group", err)),
    }
}
