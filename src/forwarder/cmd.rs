//! External command execution for firewall tools

use std::io::Write;
use std::process::{Command, Stdio};

use tracing::debug;

use crate::error::ForwarderError;

/// Runs a command and returns its combined stdout and stderr
pub trait CmdExecutor: Send + Sync {
    /// Run `cmd_name args...`, feeding `stdin` if given
    ///
    /// # Errors
    ///
    /// Returns [`ForwarderError::Command`] when the command cannot be spawned
    /// or exits unsuccessfully.
    fn combined_output(
        &self,
        cmd_name: &str,
        args: &[String],
        stdin: Option<&str>,
    ) -> Result<String, ForwarderError>;

    /// Run `cmd_name args...` and return stdout alone
    ///
    /// # Errors
    ///
    /// Same as [`CmdExecutor::combined_output`].
    fn output(&self, cmd_name: &str, args: &[String]) -> Result<String, ForwarderError> {
        self.combined_output(cmd_name, args, None)
    }
}

/// [`CmdExecutor`] backed by [`std::process::Command`]
#[derive(Debug, Default, Clone, Copy)]
pub struct OsCmdExecutor;

impl CmdExecutor for OsCmdExecutor {
    fn combined_output(
        &self,
        cmd_name: &str,
        args: &[String],
        stdin: Option<&str>,
    ) -> Result<String, ForwarderError> {
        run(cmd_name, args, stdin, true)
    }

    fn output(&self, cmd_name: &str, args: &[String]) -> Result<String, ForwarderError> {
        run(cmd_name, args, None, false)
    }
}

fn run(
    cmd_name: &str,
    args: &[String],
    stdin: Option<&str>,
    with_stderr: bool,
) -> Result<String, ForwarderError> {
    let desc = describe(cmd_name, args);
    debug!("Running '{}'", desc);

    let mut child = Command::new(cmd_name)
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| ForwarderError::command(&desc, e.to_string()))?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes())
            .map_err(|e| ForwarderError::command(&desc, format!("writing stdin: {e}")))?;
    }

    let output = child
        .wait_with_output()
        .map_err(|e| ForwarderError::command(&desc, e.to_string()))?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);

    if !output.status.success() {
        debug!("Failed, status: {}, output: {}{}", output.status, stdout, stderr);
        return Err(ForwarderError::command(
            desc,
            format!("{} (output: {}{})", output.status, stdout, stderr.trim()),
        ));
    }

    debug!("Succeeded, output: {}{}", stdout, stderr);
    if with_stderr {
        Ok(stdout + &stderr)
    } else {
        Ok(stdout)
    }
}

/// Human readable form of a command line
#[must_use]
pub fn describe(cmd_name: &str, args: &[String]) -> String {
    if args.is_empty() {
        cmd_name.to_string()
    } else {
        format!("{} {}", cmd_name, args.join(" "))
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::HashMap;

    use parking_lot::Mutex;

    use super::{describe, CmdExecutor};
    use crate::error::ForwarderError;

    /// Records every command; replies with canned output keyed by full command line
    #[derive(Default)]
    pub(crate) struct FakeCmdExecutor {
        pub cmds: Mutex<Vec<Vec<String>>>,
        pub stdins: Mutex<Vec<String>>,
        pub outputs: Mutex<HashMap<String, String>>,
        pub failures: Mutex<HashMap<String, String>>,
    }

    impl FakeCmdExecutor {
        pub(crate) fn take_cmds(&self) -> Vec<Vec<String>> {
            std::mem::take(&mut *self.cmds.lock())
        }

        pub(crate) fn set_output(&self, cmd: &str, output: &str) {
            self.outputs.lock().insert(cmd.into(), output.into());
        }

        pub(crate) fn set_failure(&self, cmd: &str, reason: &str) {
            self.failures.lock().insert(cmd.into(), reason.into());
        }
    }

    impl CmdExecutor for FakeCmdExecutor {
        fn combined_output(
            &self,
            cmd_name: &str,
            args: &[String],
            stdin: Option<&str>,
        ) -> Result<String, ForwarderError> {
            let mut cmd = vec![cmd_name.to_string()];
            cmd.extend(args.iter().cloned());
            self.cmds.lock().push(cmd);

            if let Some(input) = stdin {
                self.stdins.lock().push(input.to_string());
            }

            let desc = describe(cmd_name, args);
            if let Some(reason) = self.failures.lock().get(&desc) {
                return Err(ForwarderError::command(desc.clone(), reason.clone()));
            }
            Ok(self.outputs.lock().get(&desc).cloned().unwrap_or_default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe() {
        assert_eq!(describe("pfctl", &[]), "pfctl");
        assert_eq!(
            describe("iptables", &["-w".into(), "-L".into()]),
            "iptables -w -L"
        );
    }

    #[test]
    fn test_os_executor_success_and_stdin() {
        let out = OsCmdExecutor
            .combined_output("cat", &[], Some("hello"))
            .unwrap();
        assert_eq!(out, "hello");
    }

    #[test]
    fn test_os_executor_failure() {
        let err = OsCmdExecutor
            .combined_output("sh", &["-c".into(), "echo boom >&2; exit 3".into()], None)
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Running 'sh -c"));
        assert!(msg.contains("boom"));
    }

    #[test]
    fn test_os_executor_output_drops_stderr() {
        let args = ["-c".to_string(), "echo out; echo err >&2".to_string()];
        assert_eq!(OsCmdExecutor.output("sh", &args).unwrap(), "out\n");
        assert_eq!(OsCmdExecutor.combined_output("sh", &args, None).unwrap(), "out\nerr\n");
    }

    #[test]
    fn test_os_executor_missing_binary() {
        let err = OsCmdExecutor
            .combined_output("kwt-net-definitely-missing", &[], None)
            .unwrap_err();
        assert!(matches!(err, ForwarderError::Command { .. }));
    }
}
