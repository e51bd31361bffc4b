pub mod driver;
pub mod info;
pub mod kill;
pub mod limits;
mod selection;
pub mod simulated;
pub mod tree;
pub mod tree_config;

pub use driver::ResourceGroupDriver;
pub use info::{QueryStateInfo, ResourceGroupInfo};
pub use limits::GroupLimits;
pub use simulated::SimulatedQuery;
pub use tree::{QueryAdmission, ResourceGroup};
pub use tree_config::{GroupConfig, TreeConfig};
