mod dev;
mod registry;

pub use dev::execute_dev;
pub use registry::{execute_registry_list, execute_registry_prune, execute_registry_resolve};
