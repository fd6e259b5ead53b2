pub mod error;
pub mod types;
pub mod utils;

pub use error::TypeError;
pub use types::{AccountId, Amount, KeyPredicate, KeySet};
