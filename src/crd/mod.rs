mod akodeploymentconfig;
mod aviinfrasetting;
mod cluster;

pub use akodeploymentconfig::*;
pub use aviinfrasetting::*;
pub use cluster::*;
