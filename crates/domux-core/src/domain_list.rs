use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::types::DomainName;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainEntry {
    pub name: DomainName,
    pub location: PathBuf,
}

/// Ordered list of per-domain corpus locations.
///
/// The order here fixes the index of every domain in probability and reward vectors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainList {
    entries: Vec<DomainEntry>,
}

impl DomainList {
    pub fn read(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::DomainFile {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, path)
    }

    /// Parses newline-delimited locations; `origin` only labels errors.
    pub fn parse(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        let mut entries = Vec::new();
        let mut seen: BTreeMap<String, usize> = BTreeMap::new();
        for (line_no, raw) in text.lines().enumerate() {
            let location = raw.trim();
            if location.is_empty() {
                continue;
            }
            let name = domain_name_for(location);
            if seen.insert(name.clone(), line_no + 1).is_some() {
                return Err(ConfigError::DuplicateDomain {
                    name,
                    line: line_no + 1,
                });
            }
            entries.push(DomainEntry {
                name: DomainName(name),
                location: PathBuf::from(location),
            });
        }
        if entries.is_empty() {
            return Err(ConfigError::EmptyDomainFile(origin.to_path_buf()));
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[DomainEntry] {
        &self.entries
    }

    pub fn names(&self) -> Vec<DomainName> {
        self.entries.iter().map(|e| e.name.clone()).collect()
    }
}

/// `/corpora/law-en-de/` -> `law`
fn domain_name_for(location: &str) -> String {
    let trimmed = location.trim_end_matches(['/', '\\']);
    let base = trimmed
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(trimmed);
    match base.split_once('-') {
        Some((head, _)) => head.to_string(),
        None => base.to_string(),
    }
}
