//! Index side: the engine contract, queries, and the facade that keeps an engine in sync
//! with the mirror.

pub mod engine;
pub mod facade;
pub mod memory;
pub mod processor;
pub mod query;
pub mod query_parser;
pub mod task;

pub use engine::{ContentSearchResult, EngineStats, FileSearchResult, IndexEngine};
pub use facade::{IndexEvent, IndexFacade, IndexOptions, PendingWork, Scheduling};
pub use memory::MemoryIndexEngine;
pub use processor::{IndexingTaskProcessor, ProcessingOutcome, ProcessorOptions};
pub use query::{BoolOperator, Query, QueryBuilder, QueryNode, StandardQueryBuilder};
pub use task::{IndexingAction, IndexingTask};
