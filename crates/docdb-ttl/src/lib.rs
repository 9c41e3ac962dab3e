mod config;
mod error;
mod handle;
mod index;
mod purger;
pub mod row;

pub use config::TtlConfig;
pub use error::TtlError;
pub use handle::TtlHandle;
pub use index::{TtlIndex, TtlRegistry};
pub use purger::{PurgeReport, TtlPurger};
