//! File-backed company list: one name per line.

use std::collections::HashSet;
use std::io;
use std::path::Path;

/// Parse a company list. Blank lines are skipped and later duplicates
/// (compared case-insensitively) are dropped, keeping file order.
pub fn parse_company_list(content: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    content
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|name| !name.is_empty())
        .filter(|name| seen.insert(name.to_lowercase()))
        .collect()
}

/// Read the company list at `path`. A missing file is an empty list.
pub fn lookup_company_list(path: &Path) -> io::Result<Vec<String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(parse_company_list(&content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::warn!("company list {} not found", path.display());
            Ok(Vec::new())
        }
        Err(e) => Err(e),
    }
}
