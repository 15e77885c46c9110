//! Core decision logic for IATI activity analysis: the arena-backed record
//! store, the selector language, document merging, currency classification,
//! coverage ratios, the scenario test engine, and tabular reports.

pub mod classify;
pub mod coverage;
pub mod merge;
pub mod report;
pub mod scenario;
pub mod select;
pub mod store;

pub use classify::{
    parse_iso_date, Classification, ClassificationRow, ClassificationSink, CurrencyChecks,
    CurrencyClassifier, LOG_COLUMNS,
};
pub use coverage::{coverage_check, listed_coverage, Coverage, CoverageBasis};
pub use merge::{load_document, merge_documents, Fetcher, MergeLog, MergeLogEntry, MergedDocument};
pub use report::{csv_escape, CsvLogWriter, Table, ValidationReport};
pub use scenario::{
    FeatureDocument, FeatureLoader, GherkinLoader, Outcome, OutcomeAggregation, Params,
    ScenarioDefinition, ScenarioEngine, ScenarioSession, StepContext, StepRegistry, StepVerdict,
    TestCase,
};
pub use select::{Selected, Selector};
pub use store::{NodeId, NodeKind, NodeRef, RecordStore};

/// Element name of one activity record inside an `iati-activities` document.
pub const ACTIVITY_ELEMENT: &str = "iati-activity";

/// Child element carrying the external identifier of an activity.
pub const IDENTIFIER_ELEMENT: &str = "iati-identifier";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ColabError {
    #[error("failed to fetch {locator}: {detail}")]
    Fetch { locator: String, detail: String },
    #[error("malformed document {locator}: {detail}")]
    MalformedDocument { locator: String, detail: String },
    #[error("malformed date `{value}`: expected an ISO calendar date (YYYY-MM-DD)")]
    MalformedDate { value: String },
    #[error("lookup failure: {0}")]
    Lookup(String),
    #[error("division by zero: {0}")]
    DivisionByZero(String),
    #[error("query error: {0}")]
    Query(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("io error: {0}")]
    Io(String),
}
