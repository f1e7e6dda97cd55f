use ndarray::Array2;

use domux_core::types::DomainName;

/// Dictionary symbols the controller needs to interpret target tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialSymbols {
    pub pad: u32,
    pub eos: u32,
}

impl Default for SpecialSymbols {
    fn default() -> Self {
        Self { pad: 1, eos: 2 }
    }
}

/// One parallel training example, already tokenized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Example {
    pub source: Vec<u32>,
    pub target: Vec<u32>,
}

impl Example {
    pub fn new(source: Vec<u32>, target: Vec<u32>) -> Self {
        Self { source, target }
    }

    /// Padded length this example contributes to a batch row.
    pub fn num_tokens(&self) -> usize {
        self.source.len().max(self.target.len())
    }
}

/// Everything the multiplexer needs to know about one domain.
#[derive(Debug, Clone)]
pub struct DomainCorpus {
    pub name: DomainName,
    pub train: Vec<Example>,
    /// Held-out examples used for the probe batch; falls back to `train` when empty.
    pub probe: Vec<Example>,
}

impl DomainCorpus {
    pub fn new(name: impl Into<String>, train: Vec<Example>, probe: Vec<Example>) -> Self {
        Self {
            name: DomainName(name.into()),
            train,
            probe,
        }
    }

    pub fn size(&self) -> u64 {
        self.train.len() as u64
    }
}

/// A padded mini-batch drawn from a single domain.
///
/// Invariants:
/// - `source` and `target` have one row per example
/// - rows are right-padded with `pad`
/// - `ntokens` counts the non-pad entries of `target`
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub domain: usize,
    pub source: Array2<u32>,
    pub target: Array2<u32>,
    pub pad: u32,
    pub eos: u32,
    pub ntokens: usize,
}

impl Batch {
    pub fn from_examples(domain: usize, examples: &[&Example], symbols: SpecialSymbols) -> Self {
        let source = pad_rows(examples.iter().map(|e| e.source.as_slice()), symbols.pad);
        let target = pad_rows(examples.iter().map(|e| e.target.as_slice()), symbols.pad);
        let ntokens = target.iter().filter(|&&t| t != symbols.pad).count();
        Self {
            domain,
            source,
            target,
            pad: symbols.pad,
            eos: symbols.eos,
            ntokens,
        }
    }

    pub fn sample_count(&self) -> usize {
        self.target.nrows()
    }

    /// Padded token footprint (`rows * widest row`).
    pub fn padded_tokens(&self) -> usize {
        self.sample_count() * self.source.ncols().max(self.target.ncols())
    }

    /// `true` at every non-padding target position.
    pub fn target_mask(&self) -> Array2<bool> {
        self.target.mapv(|t| t != self.pad)
    }

    /// `true` at every end-of-sequence target position.
    pub fn eos_mask(&self) -> Array2<bool> {
        self.target.mapv(|t| t == self.eos)
    }
}

fn pad_rows<'a>(rows: impl Iterator<Item = &'a [u32]> + Clone, pad: u32) -> Array2<u32> {
    let n = rows.clone().count();
    let width = rows.clone().map(<[u32]>::len).max().unwrap_or(0);
    let mut out = Array2::from_elem((n, width), pad);
    for (i, row) in rows.enumerate() {
        for (j, &tok) in row.iter().enumerate() {
            out[[i, j]] = tok;
        }
    }
    out
}
