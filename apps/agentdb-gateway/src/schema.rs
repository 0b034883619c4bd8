//! Declarative table/field documents and their compilation into hashed
//! migration plans.

pub mod compile;
pub mod dsl;
pub mod service;

pub use compile::{
    CompileError, DETERMINISTIC_ORDER, MIGRATION_PLAN_SCHEMA_VERSION, MigrationPlan,
    MigrationStep, StepAction, compile_migration_plan, compute_plan_hash,
};
pub use dsl::{
    Creator, DatabaseSpec, FieldSpec, FieldType, RESERVED_WORDS, SchemaDsl, TableSpec,
    ValidationIssue, validate_schema_dsl,
};
pub use service::{
    AppliedSchema, ApplySchemaRequest, SCHEMA_APPLY_ACTION, SchemaService, SchemaServiceError,
};
