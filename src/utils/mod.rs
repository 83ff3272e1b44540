pub mod amount;
pub mod config_loader;
pub mod constants;

pub use amount::{amount_to_f64, finite_or_zero, safe_ratio};
pub use config_loader::*;
pub use constants::*;
