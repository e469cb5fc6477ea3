pub mod caption;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod gan;
pub mod logging;
pub mod model;
pub mod training;
pub mod validation;
pub mod vocab;

pub use error::{Result, TrainError};
