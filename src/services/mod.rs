pub mod database; // PostgreSQL / MySQL adapters
pub mod llm_service;
pub mod query_service;
pub mod schema_service;

pub use llm_service::*;
pub use query_service::*;
pub use schema_service::*;
