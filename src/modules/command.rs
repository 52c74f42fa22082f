//! `command` built-in: subprocess module run through the §4.8 local path
//! or baked into a gate and run through §4.5's `Module` dispatch.
//!
//! Grounded on `examples/original_source/src/ftl2/modules/shell.py`: runs
//! `cmd` (or `_raw_params`) through the shell, captures stdout/stderr/exit
//! code, and reports `changed: true` whenever the command actually ran.

use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::gate::resident::SyncModule;

pub struct Command;

impl SyncModule for Command {
    fn run(&self, args: &Value, check_mode: bool) -> Result<Value> {
        let cmd = args
            .get("cmd")
            .or_else(|| args.get("_raw_params"))
            .and_then(Value::as_str)
            .ok_or_else(|| Error::ModuleArgs {
                module: "command".to_string(),
                message: "missing required parameter 'cmd'".to_string(),
            })?;

        if check_mode {
            return Ok(json!({
                "changed": true,
                "cmd": cmd,
                "msg": "skipped in check mode",
            }));
        }

        let output = std::process::Command::new("sh").arg("-c").arg(cmd).output()?;
        let rc = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if rc != 0 {
            return Ok(json!({
                "failed": true,
                "changed": true,
                "cmd": cmd,
                "rc": rc,
                "stdout": stdout,
                "stderr": stderr,
                "msg": format!("non-zero return code: {rc}"),
            }));
        }

        Ok(json!({
            "changed": true,
            "cmd": cmd,
            "rc": rc,
            "stdout": stdout,
            "stderr": stderr,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_command_and_captures_stdout() {
        let result = Command.run(&json!({"cmd": "echo hi"}), false).unwrap();
        assert_eq!(result["stdout"], "hi\n");
        assert_eq!(result["changed"], true);
    }

    #[test]
    fn nonzero_exit_is_reported_as_failed() {
        let result = Command.run(&json!({"cmd": "exit 3"}), false).unwrap();
        assert_eq!(result["failed"], true);
        assert_eq!(result["rc"], 3);
    }

    #[test]
    fn check_mode_skips_execution() {
        let result = Command.run(&json!({"cmd": "touch /should/not/run"}), true).unwrap();
        assert_eq!(result["changed"], true);
        assert_eq!(result["msg"], "skipped in check mode");
    }

    #[test]
    fn missing_cmd_is_an_argument_error() {
        let err = Command.run(&json!({}), false).unwrap_err();
        assert!(matches!(err, Error::ModuleArgs { .. }));
    }
}
