pub mod config;
pub mod error;
pub mod memory;
pub mod performance;
pub mod stats;
pub mod traits;
pub mod types;

pub use config::*;
pub use error::*;
pub use memory::*;
pub use performance::*;
pub use traits::*;
pub use types::*;
