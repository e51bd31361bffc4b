pub mod config;
pub mod error;
pub mod group_id;
pub mod policy;
pub mod query;
pub mod units;

pub use config::Config;
pub use error::*;
pub use group_id::*;
pub use policy::*;
pub use query::*;
