pub mod handlers;
pub mod query_string;
pub mod response;
pub mod routes;

pub use handlers::*;
pub use response::*;
pub use routes::*;
