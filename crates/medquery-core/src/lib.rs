pub mod compile;
pub mod errors;
pub mod intent;
pub mod mapper;
pub mod normalize;
pub mod oracle;
pub mod pipeline;
pub mod result;
pub mod schema;
pub mod shape;
pub mod time;

pub use compile::Compiler;
pub use errors::*;
pub use intent::*;
pub use mapper::SchemaMapper;
pub use oracle::{parse_oracle_response, Analysis, IntentOracle, Narrator, TemplateNarrator};
pub use pipeline::*;
pub use result::*;
pub use schema::{SchemaDescriptor, SchemaRegistry};
pub use shape::{shape, DisplayForm};
