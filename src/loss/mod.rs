pub mod cross_entropy;
pub mod graph;
pub mod loss_type;
pub mod mse;

pub use cross_entropy::{softmax_rows, CrossEntropyLoss};
pub use graph::{LossGraph, ScalarLoss};
pub use loss_type::LossKind;
pub use mse::MseLoss;
