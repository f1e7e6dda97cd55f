use std::path::Path;

use tracing::info;

use domux_core::{DataError, DomainEntry, DomainList};

use crate::types::{DomainCorpus, Example, SpecialSymbols};

pub const TRAIN_SOURCE: &str = "train.src";
pub const TRAIN_TARGET: &str = "train.tgt";
pub const PROBE_SOURCE: &str = "valid.src";
pub const PROBE_TARGET: &str = "valid.tgt";

/// Loads every domain named in `list`, in list order.
pub fn load_domain_corpora(
    list: &DomainList,
    symbols: SpecialSymbols,
) -> Result<Vec<DomainCorpus>, DataError> {
    list.entries()
        .iter()
        .map(|entry| load_domain_corpus(entry, symbols))
        .collect()
}

/// Reads a pre-tokenized domain directory.
///
/// Layout: `train.src` / `train.tgt` (required) and `valid.src` / `valid.tgt` (optional),
/// one example per line as whitespace-separated token ids. Every sequence is terminated
/// with the eos id if it does not already end with it.
pub fn load_domain_corpus(
    entry: &DomainEntry,
    symbols: SpecialSymbols,
) -> Result<DomainCorpus, DataError> {
    let domain = entry.name.0.as_str();
    let train = read_pairs(domain, &entry.location, TRAIN_SOURCE, TRAIN_TARGET, symbols)?;
    if train.is_empty() {
        return Err(DataError::EmptyCorpus(domain.to_string()));
    }

    let probe_src = entry.location.join(PROBE_SOURCE);
    let probe = if probe_src.exists() {
        read_pairs(domain, &entry.location, PROBE_SOURCE, PROBE_TARGET, symbols)?
    } else {
        Vec::new()
    };

    info!(
        domain = %entry.name,
        location = %entry.location.display(),
        train_examples = train.len() as u64,
        probe_examples = probe.len() as u64,
        "loaded domain corpus"
    );
    Ok(DomainCorpus {
        name: entry.name.clone(),
        train,
        probe,
    })
}

fn read_pairs(
    domain: &str,
    dir: &Path,
    source_file: &str,
    target_file: &str,
    symbols: SpecialSymbols,
) -> Result<Vec<Example>, DataError> {
    let source = read_token_lines(&dir.join(source_file), symbols.eos)?;
    let target = read_token_lines(&dir.join(target_file), symbols.eos)?;
    if source.len() != target.len() {
        return Err(DataError::SizeMismatch {
            domain: domain.to_string(),
            source_lines: source.len(),
            target_lines: target.len(),
        });
    }
    Ok(source
        .into_iter()
        .zip(target)
        .map(|(s, t)| Example::new(s, t))
        .collect())
}

fn read_token_lines(path: &Path, eos: u32) -> Result<Vec<Vec<u32>>, DataError> {
    if !path.exists() {
        return Err(DataError::MissingCorpus(path.to_path_buf()));
    }
    let text = std::fs::read_to_string(path).map_err(|source| DataError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_token_lines(&text, eos).map_err(|(line, reason)| DataError::Malformed {
        path: path.to_path_buf(),
        line,
        reason,
    })
}

/// Parses one token sequence per line; errors carry the 1-based line number.
pub fn parse_token_lines(text: &str, eos: u32) -> Result<Vec<Vec<u32>>, (usize, String)> {
    let mut out = Vec::new();
    for (i, raw) in text.lines().enumerate() {
        let mut tokens = Vec::new();
        for tok in raw.split_whitespace() {
            let id: u32 = tok
                .parse()
                .map_err(|_| (i + 1, format!("bad token id {tok:?}")))?;
            tokens.push(id);
        }
        if tokens.last() != Some(&eos) {
            tokens.push(eos);
        }
        out.push(tokens);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_eos_once() {
        let lines = parse_token_lines("4 5\n6 2\n\n", 2).unwrap();
        assert_eq!(lines, vec![vec![4, 5, 2], vec![6, 2], vec![2]]);
    }

    #[test]
    fn reports_line_of_bad_token() {
        let err = parse_token_lines("4 5\n6 x7\n", 2).unwrap_err();
        assert_eq!(err.0, 2);
        assert!(err.1.contains("x7"));
    }
}
