//! Run summary output (§7: user-visible failure behavior).
//!
//! Grounded on `automation/context.py`'s `OutputMode`/`_print_host_summary`:
//! on context close, if errors exist and printing is enabled, emit
//! per-host task counts and an error list. Callers driving the
//! orchestrator through structured event callbacks instead of this
//! printer bypass it entirely — it's a convenience for CLI-style use, not
//! the error reporting path itself.

use std::collections::BTreeMap;

use colored::Colorize;

use crate::orchestrator::ModuleResult;

/// How much the summary printer writes to stdout/stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Print nothing.
    Quiet,
    /// Print the per-host recap and, if any failures occurred, the error list.
    #[default]
    Normal,
    /// Like `Normal`, plus one line per individual module result as it's recorded.
    Verbose,
}

#[derive(Debug, Default, Clone, Copy)]
struct HostCounts {
    ok: u32,
    changed: u32,
    failed: u32,
}

/// Print one line for a single result, used by `Verbose` mode as results
/// come in.
pub fn result_line(result: &ModuleResult) {
    if result.failed {
        println!(
            "{}: [{}] {} => {}",
            "failed".red().bold(),
            result.host.bright_white().bold(),
            result.module,
            result.msg.as_deref().unwrap_or("")
        );
    } else if result.changed {
        println!(
            "{}: [{}] {}",
            "changed".yellow(),
            result.host.bright_white().bold(),
            result.module
        );
    } else {
        println!("{}: [{}] {}", "ok".green(), result.host.bright_white().bold(), result.module);
    }
}

/// Print the per-host recap and, when failures exist, the `(module, host,
/// message)` error list — the summary emitted on context close per §7.
/// A no-op under [`OutputMode::Quiet`].
pub fn print_summary(mode: OutputMode, results: &[ModuleResult]) {
    if mode == OutputMode::Quiet {
        return;
    }

    let mut counts: BTreeMap<&str, HostCounts> = BTreeMap::new();
    for result in results {
        let entry = counts.entry(result.host.as_str()).or_default();
        if result.failed {
            entry.failed += 1;
        } else if result.changed {
            entry.changed += 1;
        } else {
            entry.ok += 1;
        }
    }

    println!("\n{} {}", "RUN RECAP".bright_white().bold(), "*".repeat(70).bright_black());
    for (host, c) in &counts {
        let host_colored = if c.failed > 0 {
            host.red().bold()
        } else if c.changed > 0 {
            host.yellow()
        } else {
            host.green()
        };
        println!(
            "{:<30} : {}={:<4} {}={:<4} {}={:<4}",
            host_colored,
            "ok".green(),
            c.ok,
            "changed".yellow(),
            c.changed,
            "failed".red(),
            c.failed,
        );
    }

    let failures: Vec<&ModuleResult> = results.iter().filter(|r| r.failed).collect();
    if !failures.is_empty() {
        println!("\n{}", "ERRORS".red().bold());
        for result in failures {
            println!(
                "  {} on {}: {}",
                result.module.bright_white(),
                result.host,
                result.msg.as_deref().unwrap_or("unknown error")
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(host: &str, module: &str, changed: bool, failed: bool) -> ModuleResult {
        let mut data = serde_json::Map::new();
        data.insert("changed".to_string(), json!(changed));
        data.insert("failed".to_string(), json!(failed));
        ModuleResult {
            host: host.to_string(),
            module: module.to_string(),
            changed,
            failed,
            msg: if failed { Some("boom".to_string()) } else { None },
            data: serde_json::Value::Object(data),
            duration_secs: 0.01,
        }
    }

    #[test]
    fn quiet_mode_prints_nothing() {
        // Nothing to assert against stdout directly; this just documents
        // that the early return is reachable without panicking.
        print_summary(OutputMode::Quiet, &[result("web1", "ping", false, false)]);
    }

    #[test]
    fn normal_mode_handles_mixed_results_without_panicking() {
        let results = vec![
            result("web1", "ping", false, false),
            result("web2", "command", true, false),
            result("web3", "command", false, true),
        ];
        print_summary(OutputMode::Normal, &results);
    }
}
