pub mod common;
pub mod domain;

pub use common::error::{NormalizeError, Result};
pub use domain::*;
