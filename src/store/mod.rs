pub mod adapter;
pub mod codec;
pub mod matcher;
pub mod memory;
pub mod postgres;
pub mod query_parser;
pub mod traits;

pub use adapter::*;
pub use memory::*;
pub use postgres::*;
pub use traits::*;
