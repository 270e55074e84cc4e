//! Reads the access-rules file.

use std::path::Path;

use super::compiler::RuleTable;

/// Reads `path` and returns its non-empty lines.
///
/// A missing or unreadable file is logged and yields no lines, so the proxy
/// starts with an all-deny table instead of refusing to start. Invalid UTF-8
/// is replaced rather than rejected; such lines can never match a request.
pub fn read_rule_lines(path: &Path) -> Vec<String> {
    if path.as_os_str().is_empty() {
        return Vec::new();
    }

    match std::fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes)
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect(),
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Could not read access rules, denying all requests"
            );
            Vec::new()
        }
    }
}

/// Reads and compiles the rule file at `path`.
pub fn load_rule_table(path: &Path) -> RuleTable {
    let lines = read_rule_lines(path);
    let table = RuleTable::compile(&lines);

    // Malformed and duplicate lines both count as ignored.
    let ignored = lines.len().saturating_sub(table.len());
    tracing::info!(
        path = %path.display(),
        lines = lines.len(),
        rules = table.len(),
        ignored,
        "Access rules compiled"
    );
    for method in table.methods() {
        tracing::debug!(method, paths = table.paths_for(method).len(), "Allowed paths");
    }

    table
}
