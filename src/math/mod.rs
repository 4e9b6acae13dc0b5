pub mod matrix;
pub mod parameter;

pub use matrix::Matrix;
pub use parameter::{Parameter, StateDict};
