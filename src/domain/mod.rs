pub mod cluster;
pub mod device;
pub mod simulated;
pub mod types;

pub use cluster::*;
pub use device::*;
pub use simulated::*;
pub use types::*;
