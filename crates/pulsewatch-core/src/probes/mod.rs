pub mod http;
pub mod sql;

pub use http::HttpProbeExecutor;
pub use sql::SqlProbeExecutor;
