pub mod common;
pub mod predicate;
pub mod query;
pub mod registry;
pub mod schema;
pub mod update;

pub use common::*;
pub use predicate::*;
pub use query::*;
pub use registry::*;
pub use schema::*;
pub use update::*;
