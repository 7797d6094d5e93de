//! Thin wrapper around running a command against the network/volume
//! host the allocator or firewall compiler is currently acting on.
//!
//! Tests intercept via a thread-local mock handler rather than
//! shelling out for real.

use std::process::{Command, Output, Stdio};

use cloud_core::error::{CloudError, Result};

/// Run a command, capturing output. Does not check the exit status —
/// callers that care inspect `Output::status` themselves.
pub fn run(cmd: &str, args: &[&str]) -> Result<Output> {
    #[cfg(test)]
    if let Some(output) = mock::intercept(cmd, args) {
        return Ok(output);
    }

    Command::new(cmd)
        .args(args)
        .output()
        .map_err(|e| CloudError::Internal(format!("failed to run {cmd} {}: {e}", args.join(" "))))
}

/// Run a command and fail if it did not exit 0.
pub fn run_checked(cmd: &str, args: &[&str]) -> Result<Output> {
    let output = run(cmd, args)?;
    if !output.status.success() {
        return Err(CloudError::Internal(format!(
            "command failed (exit {}): {cmd} {}: {}",
            output.status.code().unwrap_or(-1),
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim(),
        )));
    }
    Ok(output)
}

/// Run a command that takes its payload on stdin (e.g. `iptables-restore`,
/// `ip6tables-restore`), failing if it did not exit 0.
pub fn run_with_stdin(cmd: &str, args: &[&str], stdin: &str) -> Result<()> {
    #[cfg(test)]
    if let Some(output) = mock::intercept_stdin(cmd, args, stdin) {
        if !output.status.success() {
            return Err(CloudError::Internal(format!(
                "command failed (exit {}): {cmd} {}",
                output.status.code().unwrap_or(-1),
                args.join(" "),
            )));
        }
        return Ok(());
    }

    use std::io::Write;
    let mut child = Command::new(cmd)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| CloudError::Internal(format!("failed to spawn {cmd}: {e}")))?;
    child
        .stdin
        .as_mut()
        .expect("stdin piped")
        .write_all(stdin.as_bytes())
        .map_err(|e| CloudError::Internal(format!("failed to write to {cmd} stdin: {e}")))?;
    let output = child
        .wait_with_output()
        .map_err(|e| CloudError::Internal(format!("failed waiting on {cmd}: {e}")))?;
    if !output.status.success() {
        return Err(CloudError::Internal(format!(
            "command failed (exit {}): {cmd} {}: {}",
            output.status.code().unwrap_or(-1),
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim(),
        )));
    }
    Ok(())
}
