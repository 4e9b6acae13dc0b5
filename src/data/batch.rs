use crate::error::{Result, TrainError};

/// One padded mini-batch.
///
/// `text` is batch-major: `text[i]` is the padded token sequence of example
/// `i`, all rows having the same length. `lengths`, when present, holds the
/// unpadded length of each example.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub text: Vec<Vec<usize>>,
    pub lengths: Option<Vec<usize>>,
    pub labels: Vec<usize>,
}

impl Batch {
    pub fn new(text: Vec<Vec<usize>>, labels: Vec<usize>) -> Batch {
        Batch { text, lengths: None, labels }
    }

    pub fn with_lengths(mut self, lengths: Vec<usize>) -> Batch {
        self.lengths = Some(lengths);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.text.len()
    }

    pub fn seq_len(&self) -> usize {
        self.text.first().map_or(0, Vec::len)
    }

    /// Checks the batch is rectangular and its side arrays line up.
    pub fn validate(&self) -> Result<()> {
        let seq_len = self.seq_len();
        if self.text.is_empty() {
            return Err(TrainError::Batch("empty batch".to_string()));
        }
        if let Some(i) = self.text.iter().position(|row| row.len() != seq_len) {
            return Err(TrainError::Batch(format!(
                "row {i} has length {} but the batch is padded to {seq_len}",
                self.text[i].len()
            )));
        }
        if self.labels.len() != self.text.len() {
            return Err(TrainError::Batch(format!(
                "{} labels for {} examples",
                self.labels.len(),
                self.text.len()
            )));
        }
        if let Some(lengths) = &self.lengths {
            if lengths.len() != self.text.len() {
                return Err(TrainError::Batch(format!(
                    "{} lengths for {} examples",
                    lengths.len(),
                    self.text.len()
                )));
            }
            if let Some(&l) = lengths.iter().find(|&&l| l > seq_len) {
                return Err(TrainError::Batch(format!("length {l} exceeds padded length {seq_len}")));
            }
        }
        Ok(())
    }
}

/// A finite source of batches that can be replayed once per epoch.
pub trait BatchIterator: Send {
    fn iter_epoch(&mut self) -> Box<dyn Iterator<Item = Result<Batch>> + '_>;

    /// Called before each training epoch so randomized iterators can derive
    /// their order from the epoch number alone, which keeps a resumed run on
    /// the same order as an uninterrupted one.
    fn set_epoch(&mut self, _epoch: usize) {}
}

/// Replays the same batches, in order, every epoch.
impl BatchIterator for Vec<Batch> {
    fn iter_epoch(&mut self) -> Box<dyn Iterator<Item = Result<Batch>> + '_> {
        Box::new(self.iter().cloned().map(Ok))
    }
}
