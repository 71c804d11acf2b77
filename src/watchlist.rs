//! Loads the per-ticker watchlist (company, thesis, priority, risk tags)
//! from a YAML file, matching the `watchlist:` top-level key shape.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::WatchlistEntry;
use crate::error::Result;
use crate::PipelineError;

#[derive(Debug, Serialize, Deserialize)]
struct WatchlistFile {
    watchlist: Vec<WatchlistEntry>,
}

/// Load and validate a watchlist YAML file.
///
/// Requires the `yaml` feature. Ticker uniqueness is enforced: a duplicate
/// ticker is a configuration error, not a silent last-write-wins.
#[cfg(feature = "yaml")]
pub fn load_watchlist(path: impl AsRef<Path>) -> Result<Vec<WatchlistEntry>> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .map_err(|e| PipelineError::InvalidConfig(format!("cannot read watchlist {}: {e}", path.display())))?;
    let file: WatchlistFile = serde_yaml::from_str(&contents)
        .map_err(|e| PipelineError::InvalidConfig(format!("invalid watchlist YAML: {e}")))?;

    let mut seen = std::collections::HashSet::new();
    for entry in &file.watchlist {
        if !seen.insert(entry.ticker.clone()) {
            return Err(PipelineError::InvalidConfig(format!(
                "duplicate ticker '{}' in watchlist",
                entry.ticker
            )));
        }
    }

    Ok(file.watchlist)
}

/// Build a `ticker → thesis` lookup map.
pub fn thesis_map(entries: &[WatchlistEntry]) -> HashMap<String, String> {
    entries
        .iter()
        .map(|e| (e.ticker.clone(), e.thesis.clone()))
        .collect()
}

/// Build a `ticker → company_name` lookup map.
pub fn company_name_map(entries: &[WatchlistEntry]) -> HashMap<String, String> {
    entries
        .iter()
        .map(|e| (e.ticker.clone(), e.company_name.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_watchlist_parses_valid_file() {
        let mut file = tempfile_with_content(
            r#"
watchlist:
  - ticker: NVDA
    company_name: NVIDIA Corporation
    thesis: Long on AI datacenter capex supercycle.
    risk_tags: [concentration, export-controls]
    priority: 1
  - ticker: AMD
    company_name: Advanced Micro Devices
    thesis: Long on server CPU/GPU share gains.
"#,
        );
        let entries = load_watchlist(file.path()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].ticker, "NVDA");
        assert_eq!(entries[1].priority, 3);
        file.flush().ok();
    }

    #[test]
    fn test_load_watchlist_rejects_duplicate_ticker() {
        let file = tempfile_with_content(
            r#"
watchlist:
  - ticker: NVDA
    company_name: NVIDIA Corporation
    thesis: thesis one
  - ticker: NVDA
    company_name: NVIDIA Corporation
    thesis: thesis two
"#,
        );
        let result = load_watchlist(file.path());
        assert!(result.is_err());
    }

    #[test]
    fn test_thesis_map_and_company_name_map() {
        let entries = vec![WatchlistEntry {
            ticker: "NVDA".to_string(),
            company_name: "NVIDIA Corporation".to_string(),
            thesis: "Long on AI capex.".to_string(),
            risk_tags: vec![],
            priority: 1,
            sector: None,
        }];
        let theses = thesis_map(&entries);
        let companies = company_name_map(&entries);
        assert_eq!(theses.get("NVDA").unwrap(), "Long on AI capex.");
        assert_eq!(companies.get("NVDA").unwrap(), "NVIDIA Corporation");
    }

    fn tempfile_with_content(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }
}
