use std::sync::{Arc, RwLock};

use rand::distributions::{Distribution, WeightedIndex};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info};

use domux_core::types::{DomainName, ProbabilityVector, Temperature};
use domux_core::{DataError, ProbabilityError};
use domux_observe::metrics::{Counter, DomainCounters, HighWater};

use crate::types::{Batch, DomainCorpus, Example, SpecialSymbols};

#[derive(Debug, Default)]
pub struct MultiplexerMetrics {
    pub sampled_batches_total: Counter,
    pub sampled_examples_total: Counter,
    pub reshuffles_total: Counter,
    pub probability_updates_total: Counter,
    pub batch_tokens_high_water: HighWater,
    pub per_domain_batches: DomainCounters,
}

impl MultiplexerMetrics {
    fn new(num_domains: usize) -> Self {
        Self {
            per_domain_batches: DomainCounters::new(num_domains),
            ..Self::default()
        }
    }
}

/// The active distribution together with its sampler, swapped as one unit.
#[derive(Debug)]
struct ActiveDistribution {
    probabilities: ProbabilityVector,
    sampler: WeightedIndex<f64>,
}

impl ActiveDistribution {
    fn new(probabilities: ProbabilityVector) -> Result<Self, ProbabilityError> {
        let sampler = WeightedIndex::new(probabilities.as_slice().iter().copied()).map_err(|_| {
            ProbabilityError::Sum {
                sum: probabilities.as_slice().iter().sum(),
            }
        })?;
        Ok(Self {
            probabilities,
            sampler,
        })
    }
}

/// One domain's training stream, treated as infinite: it is reshuffled and restarted
/// whenever it runs out.
#[derive(Debug)]
struct DomainStream {
    examples: Vec<Example>,
    order: Vec<usize>,
    cursor: usize,
    rng: ChaCha8Rng,
    probe: Batch,
}

impl DomainStream {
    fn new(
        index: usize,
        corpus: DomainCorpus,
        symbols: SpecialSymbols,
        probe_budget: usize,
        seed: u64,
    ) -> Self {
        let probe_source = if corpus.probe.is_empty() {
            &corpus.train
        } else {
            &corpus.probe
        };
        let probe_rows = take_within_budget(probe_source.iter(), probe_budget);
        let probe = Batch::from_examples(index, &probe_rows, symbols);

        let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(index as u64 + 1));
        let mut order: Vec<usize> = (0..corpus.train.len()).collect();
        order.shuffle(&mut rng);
        Self {
            examples: corpus.train,
            order,
            cursor: 0,
            rng,
            probe,
        }
    }

    /// Greedily fills a batch from the stream. A batch never straddles a reshuffle, so it
    /// holds no duplicate examples.
    fn next_batch(
        &mut self,
        index: usize,
        token_budget: usize,
        symbols: SpecialSymbols,
        metrics: &MultiplexerMetrics,
    ) -> Batch {
        if self.cursor >= self.order.len() {
            self.order.shuffle(&mut self.rng);
            self.cursor = 0;
            metrics.reshuffles_total.inc();
            debug!(domain = index, "domain stream exhausted, reshuffled");
        }
        let remaining = self.order[self.cursor..]
            .iter()
            .map(|&i| &self.examples[i]);
        let rows = take_within_budget(remaining, token_budget);
        self.cursor += rows.len();
        Batch::from_examples(index, &rows, symbols)
    }
}

/// Takes examples while `rows * widest example` stays within `budget`; always at least one.
fn take_within_budget<'a>(
    examples: impl Iterator<Item = &'a Example>,
    budget: usize,
) -> Vec<&'a Example> {
    let mut rows: Vec<&Example> = Vec::new();
    let mut widest = 0usize;
    for ex in examples {
        let next_widest = widest.max(ex.num_tokens());
        if !rows.is_empty() && next_widest.saturating_mul(rows.len() + 1) > budget {
            break;
        }
        widest = next_widest;
        rows.push(ex);
    }
    rows
}

/// Presents N domain streams as one stream sampled by the current probability vector.
///
/// The probability vector is the only state shared between the sampling path and the
/// reweighting path. It lives behind an `Arc` that is replaced wholesale, so a reader
/// always sees either the previous or the next vector in full.
pub struct Multiplexer {
    names: Vec<DomainName>,
    sizes: Vec<u64>,
    streams: Vec<DomainStream>,
    symbols: SpecialSymbols,
    initial: ProbabilityVector,
    active: RwLock<Arc<ActiveDistribution>>,
    rng: ChaCha8Rng,
    metrics: Arc<MultiplexerMetrics>,
}

impl Multiplexer {
    /// Builds the streams and the size-based initial distribution
    /// `p_i = size_i^(1/T) / sum_j size_j^(1/T)`.
    ///
    /// `probe_token_budget` bounds the cached probe batch of every domain. A temperature
    /// that is not a positive number fails with [`DataError::Temperature`].
    pub fn initialize(
        corpora: Vec<DomainCorpus>,
        temperature: Temperature,
        symbols: SpecialSymbols,
        probe_token_budget: usize,
        seed: u64,
    ) -> Result<Self, DataError> {
        let temperature = temperature.validate().map_err(DataError::Temperature)?;
        if corpora.is_empty() {
            return Err(DataError::NoDomains);
        }
        if let Some(empty) = corpora.iter().find(|c| c.train.is_empty()) {
            return Err(DataError::EmptyCorpus(empty.name.0.clone()));
        }

        let names: Vec<DomainName> = corpora.iter().map(|c| c.name.clone()).collect();
        let sizes: Vec<u64> = corpora.iter().map(DomainCorpus::size).collect();
        let initial = ProbabilityVector::from_sizes(&sizes, temperature)?;
        let active = ActiveDistribution::new(initial.clone())?;

        let streams: Vec<DomainStream> = corpora
            .into_iter()
            .enumerate()
            .map(|(i, corpus)| DomainStream::new(i, corpus, symbols, probe_token_budget, seed))
            .collect();

        for (i, name) in names.iter().enumerate() {
            info!(
                domain = %name,
                size = sizes[i],
                probability = initial.as_slice()[i],
                probe_rows = streams[i].probe.sample_count(),
                "domain loaded"
            );
        }

        Ok(Self {
            metrics: Arc::new(MultiplexerMetrics::new(names.len())),
            names,
            sizes,
            streams,
            symbols,
            initial,
            active: RwLock::new(Arc::new(active)),
            rng: ChaCha8Rng::seed_from_u64(seed),
        })
    }

    pub fn num_domains(&self) -> usize {
        self.names.len()
    }

    pub fn domain_names(&self) -> &[DomainName] {
        &self.names
    }

    pub fn sizes(&self) -> &[u64] {
        &self.sizes
    }

    pub fn domain_index(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n.0 == name)
    }

    pub fn metrics(&self) -> Arc<MultiplexerMetrics> {
        self.metrics.clone()
    }

    /// The size-based distribution computed at initialization.
    pub fn initial_probabilities(&self) -> &ProbabilityVector {
        &self.initial
    }

    /// Snapshot of the active probability vector.
    pub fn probabilities(&self) -> ProbabilityVector {
        self.current().probabilities.clone()
    }

    fn current(&self) -> Arc<ActiveDistribution> {
        match self.active.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Draws a domain from the active distribution, then a token-bounded batch from it.
    pub fn sample_batch(&mut self, token_budget: usize) -> Batch {
        let active = self.current();
        let index = active.sampler.sample(&mut self.rng);
        let batch =
            self.streams[index].next_batch(index, token_budget, self.symbols, &self.metrics);

        self.metrics.sampled_batches_total.inc();
        self.metrics
            .sampled_examples_total
            .inc_by(batch.sample_count() as u64);
        self.metrics
            .batch_tokens_high_water
            .observe(batch.padded_tokens() as u64);
        self.metrics.per_domain_batches.inc(index);
        batch
    }

    /// The cached probe batch for domain `index`. Never advances the training stream.
    pub fn probe_batch(&self, index: usize) -> Option<&Batch> {
        self.streams.get(index).map(|s| &s.probe)
    }

    /// Every domain's probe batch, in domain order.
    pub fn probes(&self) -> impl Iterator<Item = (&DomainName, &Batch)> + '_ {
        self.names.iter().zip(self.streams.iter().map(|s| &s.probe))
    }

    pub fn probe_batch_by_name(&self, name: &str) -> Option<&Batch> {
        self.domain_index(name).and_then(|i| self.probe_batch(i))
    }

    /// Validates `next` against this multiplexer and swaps it in as a whole.
    ///
    /// On error the active vector is left unchanged.
    pub fn update_probabilities(&self, next: ProbabilityVector) -> Result<(), ProbabilityError> {
        if next.len() != self.num_domains() {
            return Err(ProbabilityError::LengthMismatch {
                expected: self.num_domains(),
                actual: next.len(),
            });
        }
        let next = ProbabilityVector::new(next.into_inner())?;
        let active = Arc::new(ActiveDistribution::new(next)?);
        match self.active.write() {
            Ok(mut guard) => *guard = active,
            Err(poisoned) => *poisoned.into_inner() = active,
        }
        self.metrics.probability_updates_total.inc();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ex(len: usize) -> Example {
        Example::new(vec![5; len], vec![6; len])
    }

    #[test]
    fn budget_admits_rows_until_padded_size_exceeds_it() {
        let examples = [ex(3), ex(3), ex(5), ex(1)];
        let rows = take_within_budget(examples.iter(), 10);
        // 3 + 3 fits (2 * 3 = 6), adding the 5-token row would need 3 * 5 = 15.
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn oversized_example_still_forms_a_batch() {
        let examples = [ex(50)];
        let rows = take_within_budget(examples.iter(), 10);
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn stream_never_repeats_within_a_batch() {
        let corpus = DomainCorpus::new("a", vec![ex(1), ex(1), ex(1)], Vec::new());
        let metrics = MultiplexerMetrics::new(1);
        let mut stream = DomainStream::new(0, corpus, SpecialSymbols::default(), 100, 7);

        let first = stream.next_batch(0, 100, SpecialSymbols::default(), &metrics);
        assert_eq!(first.sample_count(), 3);
        let second = stream.next_batch(0, 2, SpecialSymbols::default(), &metrics);
        assert_eq!(second.sample_count(), 2);
        assert_eq!(metrics.reshuffles_total.get(), 1);
    }
}
