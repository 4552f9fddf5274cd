pub mod budget;
pub mod error;

pub use budget::Budget;
pub use error::{AlignmentFailure, AttemptFailure, IdError};
