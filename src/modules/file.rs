//! `file` built-in: minimal touch/absent/directory state management (§8
//! scenario A).
//!
//! Grounded on ansible.builtin.file's `state` contract, narrowed to the
//! three states scenario A needs; ownership/mode/symlink management are
//! out of scope per spec.md §1.

use std::path::Path;

use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::gate::resident::SyncModule;

pub struct File;

impl SyncModule for File {
    fn run(&self, args: &Value, check_mode: bool) -> Result<Value> {
        let path = args.get("path").and_then(Value::as_str).ok_or_else(|| Error::ModuleArgs {
            module: "file".to_string(),
            message: "missing required parameter 'path'".to_string(),
        })?;
        let state = args.get("state").and_then(Value::as_str).unwrap_or("file");
        let path = Path::new(path);

        match state {
            "touch" => touch(path, check_mode),
            "absent" => absent(path, check_mode),
            "directory" => directory(path, check_mode),
            other => Err(Error::ModuleArgs {
                module: "file".to_string(),
                message: format!("unsupported state '{other}'"),
            }),
        }
    }
}

fn touch(path: &Path, check_mode: bool) -> Result<Value> {
    let existed = path.exists();
    if check_mode {
        return Ok(json!({"changed": !existed, "path": path.display().to_string()}));
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if !existed {
        std::fs::File::create(path)?;
    } else {
        let now = std::time::SystemTime::now();
        filetime::set_file_mtime(path, filetime::FileTime::from_system_time(now))
            .map_err(std::io::Error::from)?;
    }
    Ok(json!({"changed": !existed, "path": path.display().to_string()}))
}

fn absent(path: &Path, check_mode: bool) -> Result<Value> {
    let existed = path.exists();
    if check_mode {
        return Ok(json!({"changed": existed, "path": path.display().to_string()}));
    }
    if existed {
        if path.is_dir() {
            std::fs::remove_dir_all(path)?;
        } else {
            std::fs::remove_file(path)?;
        }
    }
    Ok(json!({"changed": existed, "path": path.display().to_string()}))
}

fn directory(path: &Path, check_mode: bool) -> Result<Value> {
    let existed = path.is_dir();
    if check_mode {
        return Ok(json!({"changed": !existed, "path": path.display().to_string()}));
    }
    if !existed {
        std::fs::create_dir_all(path)?;
    }
    Ok(json!({"changed": !existed, "path": path.display().to_string()}))
}
