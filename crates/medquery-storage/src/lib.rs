pub mod eval;
pub mod executor;
pub mod mem;
pub mod mongo;
pub mod service;
pub mod traits;

pub use executor::QueryEngine;
pub use mem::InMemoryStore;
pub use mongo::{MongoConfig, MongoStore};
pub use service::{QueryResponse, QueryService};
pub use traits::*;
