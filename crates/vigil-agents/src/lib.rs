pub mod env;
pub mod error;
pub mod ideation;
pub mod invocation;
mod pattern;
pub mod phase;
pub mod progress;
pub mod rate_limit;

pub use env::*;
pub use error::*;
pub use ideation::*;
pub use invocation::*;
pub use phase::*;
pub use progress::*;
pub use rate_limit::*;
