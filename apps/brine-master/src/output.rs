//! Rendering of returns for the `job` subcommands.
//!
//! State runs (mappings of `module_|-id_|-name_|-fun` tags to results) are
//! laid out according to `state_output`; anything else is printed as YAML.

use std::fmt::Write;

use brine_config::StateOutput;
use brine_storage::JobReturn;

const TAG_SEP: &str = "_|-";
const RULE: &str = "----------";

#[derive(Debug, Clone, PartialEq)]
pub struct StateResult {
    pub id: String,
    pub name: String,
    pub function: String,
    /// `None` is a test run that would have changed something.
    pub result: Option<bool>,
    pub comment: String,
    pub changes: serde_json::Value,
    pub started: Option<String>,
    pub duration_ms: Option<f64>,
    pub run_num: u64,
}

impl StateResult {
    fn has_changes(&self) -> bool {
        match &self.changes {
            serde_json::Value::Null => false,
            serde_json::Value::Object(map) => !map.is_empty(),
            serde_json::Value::Array(items) => !items.is_empty(),
            serde_json::Value::String(s) => !s.is_empty(),
            _ => true,
        }
    }

    fn status(&self) -> &'static str {
        match self.result {
            Some(true) if self.has_changes() => "Changed",
            Some(true) => "Clean",
            Some(false) => "Failed",
            None => "Differs",
        }
    }

    fn failed(&self) -> bool {
        self.result == Some(false)
    }
}

/// Parse a state run. `None` when `payload` is not one.
pub fn parse_state_results(payload: &serde_json::Value) -> Option<Vec<StateResult>> {
    let map = payload.as_object()?;
    if map.is_empty() {
        return None;
    }
    let mut out = Vec::with_capacity(map.len());
    for (tag, value) in map {
        let entry = value.as_object()?;
        let result = match entry.get("result")? {
            serde_json::Value::Bool(b) => Some(*b),
            serde_json::Value::Null => None,
            _ => return None,
        };
        let parts: Vec<&str> = tag.split(TAG_SEP).collect();
        let (module, tag_id, tag_name, fun) = match parts.as_slice() {
            [module, id, name, fun] => (*module, *id, *name, *fun),
            _ => ("", tag.as_str(), tag.as_str(), ""),
        };
        let text = |key: &str| entry.get(key).and_then(|v| v.as_str()).map(str::to_string);
        out.push(StateResult {
            id: text("__id__").unwrap_or_else(|| tag_id.to_string()),
            name: text("name").unwrap_or_else(|| tag_name.to_string()),
            function: if module.is_empty() {
                fun.to_string()
            } else {
                format!("{module}.{fun}")
            },
            result,
            comment: match entry.get("comment") {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(serde_json::Value::Array(lines)) => lines
                    .iter()
                    .filter_map(|l| l.as_str())
                    .collect::<Vec<_>>()
                    .join("\n"),
                _ => String::new(),
            },
            changes: entry.get("changes").cloned().unwrap_or_default(),
            started: text("start_time"),
            duration_ms: entry.get("duration").and_then(|v| v.as_f64()),
            run_num: entry
                .get("__run_num__")
                .and_then(|v| v.as_u64())
                .unwrap_or(u64::MAX),
        });
    }
    out.sort_by_key(|r| r.run_num);
    Some(out)
}

fn indent(text: &str, by: usize) -> String {
    let pad = " ".repeat(by);
    text.lines()
        .map(|l| format!("{pad}{l}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn yaml(value: &serde_json::Value) -> String {
    serde_yaml::to_string(value)
        .unwrap_or_else(|_| value.to_string())
        .trim_end()
        .to_string()
}

fn write_full(out: &mut String, r: &StateResult) {
    let _ = writeln!(out, "{RULE}");
    let _ = writeln!(out, "          ID: {}", r.id);
    let _ = writeln!(out, "    Function: {}", r.function);
    let _ = writeln!(out, "        Name: {}", r.name);
    let result = match r.result {
        Some(true) => "True",
        Some(false) => "False",
        None => "None",
    };
    let _ = writeln!(out, "      Result: {result}");
    let mut comment = r.comment.lines();
    let _ = writeln!(out, "     Comment: {}", comment.next().unwrap_or(""));
    for line in comment {
        let _ = writeln!(out, "              {line}");
    }
    if let Some(started) = &r.started {
        let _ = writeln!(out, "     Started: {started}");
    }
    if let Some(ms) = r.duration_ms {
        let _ = writeln!(out, "    Duration: {ms} ms");
    }
    if r.has_changes() {
        let _ = writeln!(out, "     Changes:");
        let _ = writeln!(out, "              {RULE}");
        let _ = writeln!(out, "{}", indent(&yaml(&r.changes), 14));
    } else {
        let _ = writeln!(out, "     Changes:");
    }
}

fn write_terse(out: &mut String, r: &StateResult, by_id: bool) {
    let (label, value) = if by_id {
        ("ID", &r.id)
    } else {
        ("Name", &r.name)
    };
    let _ = write!(
        out,
        "  {label}: {value} - Function: {} - Result: {}",
        r.function,
        r.status()
    );
    if let Some(started) = &r.started {
        let _ = write!(out, " Started: {started}");
    }
    if let Some(ms) = r.duration_ms {
        let _ = write!(out, " Duration: {ms} ms");
    }
    out.push('\n');
}

/// One minion's state run, followed by the summary block.
pub fn format_state_run(minion: &str, results: &[StateResult], mode: StateOutput) -> String {
    let by_id = mode.uses_id();
    let mut out = format!("{minion}:\n");
    for r in results {
        let full = match mode {
            StateOutput::Full | StateOutput::FullId => true,
            StateOutput::Terse | StateOutput::TerseId => false,
            StateOutput::Mixed | StateOutput::MixedId => r.failed(),
            StateOutput::Changes | StateOutput::ChangesId => r.failed() || r.has_changes(),
        };
        if full {
            write_full(&mut out, r);
        } else {
            write_terse(&mut out, r, by_id);
        }
    }

    let failed = results.iter().filter(|r| r.failed()).count();
    let succeeded = results.len() - failed;
    let changed = results
        .iter()
        .filter(|r| !r.failed() && r.has_changes())
        .count();
    let total_ms: f64 = results.iter().filter_map(|r| r.duration_ms).sum();
    let _ = writeln!(out, "\nSummary for {minion}");
    let _ = writeln!(out, "------------");
    if changed > 0 {
        let _ = writeln!(out, "Succeeded: {succeeded} (changed={changed})");
    } else {
        let _ = writeln!(out, "Succeeded: {succeeded}");
    }
    let _ = writeln!(out, "Failed: {failed:>4}");
    let _ = writeln!(out, "------------");
    let _ = writeln!(out, "Total states run: {:>5}", results.len());
    let _ = writeln!(out, "Total run time: {:>7.3} s", total_ms / 1000.0);
    out
}

/// Render one return for the terminal.
pub fn format_return(ret: &JobReturn, mode: StateOutput) -> String {
    match parse_state_results(&ret.payload) {
        Some(results) => format_state_run(ret.minion_id.as_str(), &results, mode),
        None => format!("{}:\n{}\n", ret.minion_id, indent(&yaml(&ret.payload), 4)),
    }
}
