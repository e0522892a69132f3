//! Operations ledger: the durable relational record of orchestrator work.
//!
//! Every unit of work is recorded as an operation row, optionally linked to
//! one side fact per artifact table (issue processing, code generation, PR
//! management, roadmap tracking). The schema is integer-versioned with
//! forward-only migrations.

pub mod schema;
pub mod store;
pub mod types;

pub use schema::SCHEMA_VERSION;
pub use store::Ledger;
pub use types::{
    CodeGenerationFact, IssueProcessingFact, OperationFact, OperationId, OperationKind,
    OperationRecord, PrManagementFact, RepositoryContext, RoadmapFact,
};
