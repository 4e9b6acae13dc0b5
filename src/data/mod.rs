pub mod batch;
pub mod corpus;
pub mod iterator;
pub mod vocab;

pub use batch::{Batch, BatchIterator};
pub use corpus::{sentiment_dataset, tokenize, Dataset};
pub use iterator::{epoch_seed, Example, InMemoryIterator};
pub use vocab::{Fields, Vocabulary, PAD_TOKEN, UNK_TOKEN};
