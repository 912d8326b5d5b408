//! Search transactions: parsing, compiling and executing QIDO-RS queries against the index.

pub mod compiler;
pub mod expression;
pub mod parser;
pub mod projector;
pub mod service;
pub mod tag;

pub use compiler::{CompileError, CompiledQuery, QueryCompiler, SqlParameter};
pub use expression::{FilterCondition, IncludeFields, MatchValue, QueryExpression};
pub use parser::{QueryParameters, QueryParseError, QueryParser, QueryScope};
pub use projector::ResultProjector;
pub use service::{IndexQidoService, QidoService, SearchError, SearchRequest, SearchResponse};
pub use tag::{QueryTag, QueryTagSource};
