use std::{
    path::Path,
    process::{Command, ExitStatus, Stdio},
};

use tracing::debug;

use crate::core::errors::RunError;

/// Run `program` with inherited stdio and return its exit code.
///
/// The parent environment is inherited; `envs` are applied on top.
pub(crate) fn run_command_passthrough(
    program: &str,
    args: &[String],
    envs: &[(String, String)],
    cwd: &Path,
) -> Result<i32, RunError> {
    let mut command = configured_command(program, args, envs, cwd);
    command.stdin(Stdio::inherit());
    command.stdout(Stdio::inherit());
    command.stderr(Stdio::inherit());

    debug!(%program, ?args, cwd = %cwd.display(), "running command");
    let status = command
        .status()
        .map_err(|err| RunError::io(format!("failed to start {program}"), err))?;
    Ok(exit_code(status))
}

fn configured_command(
    program: &str,
    args: &[String],
    envs: &[(String, String)],
    cwd: &Path,
) -> Command {
    let mut command = Command::new(program);
    command.args(args);
    for (key, value) in envs {
        command.env(key, value);
    }
    command.current_dir(cwd);
    command
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}
