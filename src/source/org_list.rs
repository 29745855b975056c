//! Organization list files: one org per line, `#` comments, blanks skipped,
//! whitespace trimmed, duplicates collapsed to the first occurrence.

use indexmap::IndexSet;
use std::path::Path;

use super::SourceError;

pub fn parse_org_list(path: &Path) -> Result<Vec<String>, SourceError> {
    let content = std::fs::read_to_string(path).map_err(|e| SourceError::Unavailable {
        what: format!("orgs file {}", path.display()),
        detail: e.to_string(),
    })?;
    Ok(parse_org_lines(&content))
}

fn parse_org_lines(content: &str) -> Vec<String> {
    let mut orgs: IndexSet<String> = IndexSet::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        orgs.insert(line.to_string());
    }
    orgs.into_iter().collect()
}
