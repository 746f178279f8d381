//! Child process wrapper for the external decomposition engine.
//!
//! The engine reads its config from stdin and runs with the config's directory
//! as working directory so relative file names resolve inside the run folder.
//! Its stdout/stderr are inherited: convergence output goes to whatever
//! terminal the host has and is never parsed.
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};

use tracing::{debug, warn};

enum ProcessState {
    FailedToStart,
    Running(Child),
    Exited(i32),
}

/// Handle to one launch of the engine.
pub struct EngineProcess {
    program: PathBuf,
    state: ProcessState,
}

impl EngineProcess {
    /// Launch `program` with `config_file` as stdin. Failure to start is recorded,
    /// not returned; check [`EngineProcess::failed_to_run`].
    pub fn launch(program: &Path, config_file: &Path) -> Self {
        Self::launch_with_args(program, &[], config_file)
    }

    /// Like [`EngineProcess::launch`] with extra command line arguments.
    pub fn launch_with_args(program: &Path, args: &[&str], config_file: &Path) -> Self {
        let state = match spawn(program, args, config_file) {
            Ok(child) => {
                debug!(pid = child.id(), ?program, "decomposition engine started");
                ProcessState::Running(child)
            }
            Err(err) => {
                warn!(?program, %err, "failed to start decomposition engine");
                ProcessState::FailedToStart
            }
        };
        Self {
            program: program.to_path_buf(),
            state,
        }
    }

    /// Executable this handle launched.
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// True until the process exits. False when it never started.
    pub fn is_running(&mut self) -> bool {
        let ProcessState::Running(child) = &mut self.state else {
            return false;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                self.state = ProcessState::Exited(exit_code(status));
                false
            }
            Ok(None) => true,
            Err(err) => {
                warn!(%err, "failed to poll decomposition engine");
                self.state = ProcessState::Exited(-1);
                false
            }
        }
    }

    /// Whether the engine could not be started at all.
    pub fn failed_to_run(&self) -> bool {
        matches!(self.state, ProcessState::FailedToStart)
    }

    /// Exit code, available only after the process has exited normally.
    pub fn exit_code(&self) -> Option<i32> {
        match self.state {
            ProcessState::Exited(code) => Some(code),
            _ => None,
        }
    }

    /// Kill a running process and reap it.
    pub fn terminate(&mut self) {
        if let ProcessState::Running(child) = &mut self.state {
            if let Err(err) = child.kill() {
                debug!(%err, "engine already gone when killed");
            }
            let code = child.wait().map(exit_code).unwrap_or(-1);
            self.state = ProcessState::Exited(code);
        }
    }
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn spawn(program: &Path, args: &[&str], config_file: &Path) -> std::io::Result<Child> {
    let stdin = File::open(config_file)?;
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::from(stdin))
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    if let Some(dir) = config_file.parent().filter(|d| !d.as_os_str().is_empty()) {
        command.current_dir(dir);
    }
    command.spawn()
}

/// Sign-extend the low `bits` of a raw, platform-unsigned exit status.
pub fn signed_exit_code(raw: u32, bits: u32) -> i32 {
    if bits == 0 || bits >= 32 {
        return raw as i32;
    }
    let shift = 32 - bits;
    ((raw << shift) as i32) >> shift
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    match status.code() {
        // Unix keeps only the low 8 bits of the value passed to exit().
        Some(code) => signed_exit_code(code as u32, 8),
        None => status.signal().map(|signal| -signal).unwrap_or(-1),
    }
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    // Windows reports a DWORD; `code()` already reinterprets it as i32.
    status.code().map(|code| signed_exit_code(code as u32, 32)).unwrap_or(-1)
}
