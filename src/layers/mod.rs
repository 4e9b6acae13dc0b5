pub mod conv_maxpool;
pub mod dense;
pub mod dropout;
pub mod embedding;

pub use conv_maxpool::ConvMaxPool;
pub use dense::Dense;
pub use dropout::Dropout;
pub use embedding::Embedding;
