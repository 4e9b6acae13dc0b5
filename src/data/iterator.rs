use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::data::batch::{Batch, BatchIterator};
use crate::error::Result;

/// A tokenized, labelled example.
#[derive(Debug, Clone, PartialEq)]
pub struct Example {
    pub tokens: Vec<usize>,
    pub label: usize,
}

impl Example {
    pub fn new(tokens: Vec<usize>, label: usize) -> Example {
        Example { tokens, label }
    }
}

/// Seed for `epoch` of a run seeded with `seed`.
pub fn epoch_seed(seed: u64, epoch: usize) -> u64 {
    seed ^ (epoch as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

/// Batches an in-memory dataset, padding each batch to its longest example.
///
/// When shuffled, epoch `e` is ordered by a generator seeded from
/// `epoch_seed(seed, e)`, so the order depends only on the seed and the
/// epoch number. The epoch advances after every pass unless
/// [`BatchIterator::set_epoch`] pins it.
pub struct InMemoryIterator {
    examples: Vec<Example>,
    batch_size: usize,
    padding_idx: usize,
    shuffle_seed: Option<u64>,
    include_lengths: bool,
    epoch: usize,
}

impl InMemoryIterator {
    pub fn new(examples: Vec<Example>, batch_size: usize, padding_idx: usize) -> InMemoryIterator {
        InMemoryIterator {
            examples,
            batch_size: batch_size.max(1),
            padding_idx,
            shuffle_seed: None,
            include_lengths: false,
            epoch: 0,
        }
    }

    pub fn shuffled(mut self, seed: u64) -> InMemoryIterator {
        self.shuffle_seed = Some(seed);
        self
    }

    /// Emit explicit per-example lengths alongside the padded text.
    pub fn with_lengths(mut self) -> InMemoryIterator {
        self.include_lengths = true;
        self
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    fn make_batch(&self, indices: &[usize]) -> Batch {
        let max_len = indices.iter().map(|&i| self.examples[i].tokens.len()).max().unwrap_or(0).max(1);
        let mut text = Vec::with_capacity(indices.len());
        let mut lengths = Vec::with_capacity(indices.len());
        let mut labels = Vec::with_capacity(indices.len());
        for &i in indices {
            let example = &self.examples[i];
            let mut row = example.tokens.clone();
            row.resize(max_len, self.padding_idx);
            text.push(row);
            lengths.push(example.tokens.len());
            labels.push(example.label);
        }
        let batch = Batch::new(text, labels);
        if self.include_lengths {
            batch.with_lengths(lengths)
        } else {
            batch
        }
    }
}

impl BatchIterator for InMemoryIterator {
    fn iter_epoch(&mut self) -> Box<dyn Iterator<Item = Result<Batch>> + '_> {
        let mut order: Vec<usize> = (0..self.examples.len()).collect();
        if let Some(seed) = self.shuffle_seed {
            order.shuffle(&mut StdRng::seed_from_u64(epoch_seed(seed, self.epoch)));
        }
        self.epoch += 1;
        let batches: Vec<Batch> = order.chunks(self.batch_size).map(|chunk| self.make_batch(chunk)).collect();
        Box::new(batches.into_iter().map(Ok))
    }

    fn set_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
    }
}
