pub mod config;
pub mod dtype;
pub mod error;
pub mod keys;
pub mod rank;

pub use dtype::{DataType, Device};
pub use error::GradflowError;
pub use keys::{KeyRange, PsKey, Pskv};
pub use rank::RankInfo;
