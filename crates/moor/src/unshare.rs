#![allow(unsafe_code)]

//! Re-runs a command inside fresh user and mount namespaces.
//!
//! Mapping the caller's uid and gid to root in the new user namespace
//! lets an unprivileged user mount images without any setuid helper.

use moor_common::{MoorError, MoorResult};

/// Run `command` in new user and mount namespaces and return its exit
/// code. With an empty command, `$SHELL` is started instead.
///
/// # Errors
///
/// Returns [`MoorError::Config`] when already running as root or when
/// no command can be resolved, and [`MoorError::Internal`] when the
/// namespaces cannot be entered or the command cannot be started.
#[cfg(target_os = "linux")]
pub fn run(command: &[String]) -> MoorResult<i32> {
    use std::process::Command;

    if rustix::process::geteuid().is_root() {
        return Err(MoorError::Config {
            message: "already running as root, nothing to unshare".to_string(),
        });
    }

    let argv = resolve_command(command, std::env::var("SHELL").ok())?;
    let uid = rustix::process::getuid().as_raw();
    let gid = rustix::process::getgid().as_raw();

    enter_namespaces()?;
    write_id_maps(uid, gid)?;

    tracing::debug!(command = %argv.join(" "), "Starting command in new namespaces");

    let status = Command::new(&argv[0])
        .args(&argv[1..])
        .status()
        .map_err(|e| MoorError::Internal {
            message: format!("failed to run {}: {e}", argv[0]),
        })?;

    Ok(status.code().unwrap_or(1))
}

/// Unsupported off Linux.
#[cfg(not(target_os = "linux"))]
pub fn run(_command: &[String]) -> MoorResult<i32> {
    Err(MoorError::Unsupported {
        feature: "user namespaces".to_string(),
    })
}

fn resolve_command(command: &[String], shell: Option<String>) -> MoorResult<Vec<String>> {
    if !command.is_empty() {
        return Ok(command.to_vec());
    }
    tracing::debug!("No command given, looking for $SHELL");
    match shell {
        Some(shell) if !shell.is_empty() => Ok(vec![shell]),
        _ => Err(MoorError::Config {
            message: "no command given and $SHELL is not set".to_string(),
        }),
    }
}

#[cfg(target_os = "linux")]
fn enter_namespaces() -> MoorResult<()> {
    use rustix::thread::{UnshareFlags, unshare_unsafe};

    let flags = UnshareFlags::NEWUSER | UnshareFlags::NEWNS;
    // Safety: the process is single threaded here; unsharing cannot race
    // another thread's credentials.
    unsafe { unshare_unsafe(flags) }.map_err(|e| MoorError::Internal {
        message: format!("failed to unshare namespaces: {e}"),
    })?;

    tracing::debug!("Entered new user and mount namespaces");
    Ok(())
}

#[cfg(target_os = "linux")]
fn write_id_maps(uid: u32, gid: u32) -> MoorResult<()> {
    // setgroups must be denied before an unprivileged gid_map write.
    write_proc_file("/proc/self/setgroups", "deny")?;
    write_proc_file("/proc/self/uid_map", &format!("0 {uid} 1"))?;
    write_proc_file("/proc/self/gid_map", &format!("0 {gid} 1"))?;
    Ok(())
}

#[cfg(target_os = "linux")]
fn write_proc_file(path: &str, contents: &str) -> MoorResult<()> {
    std::fs::write(path, contents).map_err(|e| MoorError::Internal {
        message: format!("failed to write {path}: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_command_is_used() {
        let command = vec!["ls".to_string(), "-l".to_string()];
        assert_eq!(resolve_command(&command, None).unwrap(), command);
    }

    #[test]
    fn shell_fallback_for_empty_command() {
        let resolved = resolve_command(&[], Some("/bin/zsh".to_string())).unwrap();
        assert_eq!(resolved, vec!["/bin/zsh".to_string()]);
    }

    #[test]
    fn empty_command_requires_shell() {
        assert!(matches!(
            resolve_command(&[], None),
            Err(MoorError::Config { .. })
        ));
        assert!(matches!(
            resolve_command(&[], Some(String::new())),
            Err(MoorError::Config { .. })
        ));
    }
}
