pub mod hooks;
pub mod patch;
pub mod query_tree;
pub mod relationships;
pub mod service;
pub mod validation;

pub use hooks::*;
pub use patch::*;
pub use query_tree::{QueryTree, ResourceReader};
pub use relationships::*;
pub use service::*;
pub use validation::*;
