//! Facade over `iati-colab-core` that adds configuration, source fetching,
//! remote validation, and artifact persistence.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use iati_colab_core::{
    coverage_check, merge_documents, ClassificationRow, Coverage, CoverageBasis, CsvLogWriter,
    CurrencyClassifier, Fetcher, GherkinLoader, MergedDocument, Params, RecordStore,
    ScenarioSession, Selector, StepRegistry,
};
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime, Time};

pub mod config;
pub mod fetch;
pub mod validation;

pub use config::{ColabConfig, DEFAULT_VALIDATION_ENDPOINT};
pub use fetch::HttpFetcher;
pub use validation::ValidationClient;

pub const API_CONTRACT_VERSION: &str = "api.v1";
pub const COMBINED_DOCUMENT: &str = "combined.xml";
pub const VALIDATION_JSON: &str = "validation.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClassifySummary {
    pub today: String,
    pub total: usize,
    pub current: usize,
    pub removed: usize,
    pub log_path: Option<PathBuf>,
}

#[derive(Debug)]
pub struct Classified {
    pub summary: ClassifySummary,
    pub rows: Vec<ClassificationRow>,
    pub current: RecordStore,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestListing {
    pub ordinal: usize,
    pub name: String,
    pub tags: Vec<String>,
    pub steps: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScenarioListing {
    pub name: String,
    pub file_name: String,
    pub version: String,
    pub title: String,
    pub tests: Vec<TestListing>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScenarioRunSummary {
    pub scenario: String,
    pub version: String,
    pub ordinal: usize,
    pub test: String,
    pub total: usize,
    /// Outcome label to record count.
    pub counts: BTreeMap<String, usize>,
    /// Outcome label to the identifiers of the records that produced it.
    pub records: BTreeMap<String, Vec<Option<String>>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationSummary {
    pub endpoint: String,
    pub output_dir: PathBuf,
    pub files: Vec<PathBuf>,
    /// Table name to row count.
    pub counts: BTreeMap<String, usize>,
}

/// Midnight UTC at the start of `today`, the instant the classifier compares against.
#[must_use]
pub fn reference_instant(today: Date) -> OffsetDateTime {
    today.with_time(Time::MIDNIGHT).assume_utc()
}

#[derive(Debug, Clone)]
pub struct ColabApi<F = HttpFetcher> {
    config: ColabConfig,
    fetcher: F,
}

impl ColabApi<HttpFetcher> {
    #[must_use]
    pub fn new(config: ColabConfig) -> Self {
        let fetcher = HttpFetcher::new(Duration::from_secs(config.timeout_secs));
        Self { config, fetcher }
    }
}

impl<F: Fetcher> ColabApi<F> {
    #[must_use]
    pub fn with_fetcher(config: ColabConfig, fetcher: F) -> Self {
        Self { config, fetcher }
    }

    #[must_use]
    pub fn config(&self) -> &ColabConfig {
        &self.config
    }

    /// `sources` when non-empty, otherwise the configured sources.
    #[must_use]
    pub fn resolve_sources<'a>(&'a self, sources: &'a [String]) -> &'a [String] {
        if sources.is_empty() {
            &self.config.sources
        } else {
            sources
        }
    }

    /// # Errors
    /// Returns an error when the configured `today` is invalid.
    pub fn today(&self) -> Result<Date> {
        self.config.reference_date()
    }

    /// Fetch and merge `sources` (or the configured sources) into one store.
    ///
    /// # Errors
    /// Returns an error when no source is given or any source fails to load.
    pub fn merge(&self, sources: &[String]) -> Result<MergedDocument> {
        let sources = self.resolve_sources(sources);
        merge_documents(sources, &self.fetcher).context("failed to merge source documents")
    }

    /// Serialize `store` to `path`, creating parent directories.
    ///
    /// # Errors
    /// Returns an error when serialization or the write fails.
    pub fn write_document(&self, store: &RecordStore, path: &Path) -> Result<()> {
        let bytes = store.to_xml()?;
        create_parent(path)?;
        std::fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))?;
        tracing::info!(path = %path.display(), records = store.len(), "wrote document");
        Ok(())
    }

    /// Classify every record of `store` as of `today`. When `log_path` is set,
    /// the classification log is written there row by row.
    ///
    /// # Errors
    /// Returns an error for malformed dates or when the log cannot be written;
    /// rows written before the failure remain in the log file.
    pub fn classify(
        &self,
        store: &RecordStore,
        today: Date,
        log_path: Option<&Path>,
    ) -> Result<Classified> {
        let classifier = CurrencyClassifier::new()?;
        let now = reference_instant(today);

        let classification = match log_path {
            Some(path) => {
                create_parent(path)?;
                let file = File::create(path)
                    .with_context(|| format!("failed to create {}", path.display()))?;
                let mut sink = CsvLogWriter::new(BufWriter::new(file))?;
                classifier
                    .classify(store, now, &mut sink)
                    .with_context(|| format!("classification stopped; partial log at {}", path.display()))?
            }
            None => {
                let mut sink: Vec<ClassificationRow> = Vec::new();
                classifier.classify(store, now, &mut sink)?
            }
        };

        let total = classification.log.len();
        let current = classification.current.len();
        Ok(Classified {
            summary: ClassifySummary {
                today: today.to_string(),
                total,
                current,
                removed: total - current,
                log_path: log_path.map(Path::to_path_buf),
            },
            rows: classification.log,
            current: classification.current,
        })
    }

    /// Structural coverage of `selector` over the records of `store`.
    ///
    /// # Errors
    /// Returns an error for a malformed selector or an empty store.
    pub fn coverage(&self, store: &RecordStore, selector: &str) -> Result<Coverage> {
        let selector = Selector::parse(selector)?;
        Ok(coverage_check(CoverageBasis::Structural { store, selector: &selector })?)
    }

    /// Load the `.feature` tree at `dir` (or the configured one) against the
    /// built-in steps.
    ///
    /// # Errors
    /// Returns an error when a file cannot be loaded or a step is unknown.
    pub fn load_scenarios(&self, dir: Option<&Path>, today: Date) -> Result<ScenarioSession> {
        let dir = dir.unwrap_or(self.config.features_dir.as_path());
        let registry = StepRegistry::with_builtin_steps()?;
        ScenarioSession::initialize(dir, &GherkinLoader, registry, today)
            .with_context(|| format!("failed to load scenarios from {}", dir.display()))
    }

    #[must_use]
    pub fn list_scenarios(&self, session: &ScenarioSession) -> Vec<ScenarioListing> {
        session
            .definitions()
            .iter()
            .map(|definition| ScenarioListing {
                name: definition.name().to_string(),
                file_name: definition.file_name().to_string(),
                version: definition.version().to_string(),
                title: definition.title().to_string(),
                tests: definition
                    .tests()
                    .iter()
                    .enumerate()
                    .map(|(index, test)| TestListing {
                        ordinal: index + 1,
                        name: test.name().to_string(),
                        tags: test.tags().to_vec(),
                        steps: test.step_lines(),
                    })
                    .collect(),
            })
            .collect()
    }

    /// Run test `ordinal` of scenario `name` on every `kind` child of the
    /// store root.
    ///
    /// # Errors
    /// Returns an error for unknown scenarios or tests and for step failures.
    pub fn run_scenario(
        &self,
        session: &ScenarioSession,
        name: &str,
        ordinal: usize,
        store: &RecordStore,
        kind: &str,
        params: &Params,
    ) -> Result<ScenarioRunSummary> {
        let definition = session.scenario(name)?;
        let test = definition.test(ordinal)?;
        let aggregation = session
            .run_store(name, ordinal, store, kind, params)
            .with_context(|| format!("scenario `{}` test #{ordinal} failed", definition.file_name()))?;

        let mut counts = BTreeMap::new();
        let mut records = BTreeMap::new();
        for (outcome, ids) in aggregation.iter() {
            counts.insert(outcome.to_string(), ids.len());
            records.insert(
                outcome.to_string(),
                ids.iter().map(|id| store.node(*id).identifier()).collect(),
            );
        }

        Ok(ScenarioRunSummary {
            scenario: definition.file_name().to_string(),
            version: definition.version().to_string(),
            ordinal,
            test: test.name().to_string(),
            total: aggregation.total(),
            counts,
            records,
        })
    }

    /// Submit `store` to the validator and persist `combined.xml`,
    /// `validation.json`, and one CSV per report table under `out_dir` (or the
    /// configured output directory).
    ///
    /// # Errors
    /// Returns an error when submission fails or an artifact cannot be written.
    pub fn validate(
        &self,
        store: &RecordStore,
        endpoint: Option<&str>,
        out_dir: Option<&Path>,
    ) -> Result<ValidationSummary> {
        let endpoint = endpoint.unwrap_or(self.config.validation_endpoint.as_str());
        let out_dir = out_dir.unwrap_or(self.config.output_dir.as_path());
        std::fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create {}", out_dir.display()))?;

        let combined = out_dir.join(COMBINED_DOCUMENT);
        self.write_document(store, &combined)?;
        let document = std::fs::read(&combined)
            .with_context(|| format!("failed to read {}", combined.display()))?;

        let client = ValidationClient::new(endpoint, Duration::from_secs(self.config.timeout_secs));
        let (raw, report) = client
            .submit(COMBINED_DOCUMENT, &document)
            .with_context(|| format!("validation submission to {endpoint} failed"))?;

        let mut files = vec![combined];
        let raw_path = out_dir.join(VALIDATION_JSON);
        let pretty = serde_json::to_vec_pretty(&raw).context("failed to encode validation response")?;
        std::fs::write(&raw_path, pretty)
            .with_context(|| format!("failed to write {}", raw_path.display()))?;
        files.push(raw_path);

        let mut counts = BTreeMap::new();
        for table in report.tables() {
            let path = out_dir.join(format!("{}.csv", table.name));
            let file = File::create(&path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            table.write_csv(BufWriter::new(file))?;
            counts.insert(table.name.clone(), table.len());
            files.push(path);
        }

        Ok(ValidationSummary {
            endpoint: endpoint.to_string(),
            output_dir: out_dir.to_path_buf(),
            files,
            counts,
        })
    }
}

fn create_parent(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display())),
        _ => Ok(()),
    }
}

/// Parse `KEY=VALUE` pairs into scenario parameters.
///
/// # Errors
/// Returns an error for a pair without `=` or with an empty key.
pub fn parse_params<S: AsRef<str>>(pairs: &[S]) -> Result<Params> {
    let mut params = Params::new();
    for pair in pairs {
        let pair = pair.as_ref();
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid parameter `{pair}`: expected KEY=VALUE"))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(anyhow!("invalid parameter `{pair}`: empty key"));
        }
        params.insert(key.to_string(), value.to_string());
    }
    Ok(params)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use iati_colab_core::ColabError;
    use time::macros::date;

    use super::*;

    const FIRST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<iati-activities version="2.03">
  <!-- publisher note -->
  <iati-activity>
    <iati-identifier>XM-1</iati-identifier>
    <title><narrative>Clean water</narrative></title>
    <activity-status code="2"/>
  </iati-activity>
  <iati-activity>
    <iati-identifier>XM-2</iati-identifier>
    <activity-status code="3"/>
    <activity-date type="3" iso-date="2020-01-01"/>
  </iati-activity>
</iati-activities>
"#;

    const SECOND: &str = r#"<iati-activities version="2.03">
  <iati-activity>
    <iati-identifier>XM-3</iati-identifier>
    <title><narrative>School meals</narrative></title>
    <activity-status code="4"/>
    <transaction>
      <transaction-type code="3"/>
      <transaction-date iso-date="2024-01-10"/>
    </transaction>
  </iati-activity>
</iati-activities>
"#;

    fn api() -> ColabApi<impl Fetcher> {
        let documents: HashMap<&str, &str> = [("first", FIRST), ("second", SECOND)].into_iter().collect();
        let fetcher = move |locator: &str| -> Result<Vec<u8>, ColabError> {
            documents.get(locator).map(|body| body.as_bytes().to_vec()).ok_or_else(|| {
                ColabError::Fetch { locator: locator.to_string(), detail: "not found".to_string() }
            })
        };
        let config = ColabConfig { sources: vec!["first".to_string()], ..ColabConfig::default() };
        ColabApi::with_fetcher(config, fetcher)
    }

    fn sources(names: &[&str]) -> Vec<String> {
        names.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn merge_falls_back_to_configured_sources() {
        let api = api();
        let configured = api.merge(&[]).unwrap_or_else(|err| panic!("{err:#}"));
        assert_eq!(configured.log.total, 2);

        let both = api.merge(&sources(&["first", "second"])).unwrap_or_else(|err| panic!("{err:#}"));
        assert_eq!(both.log.total, 3);
        assert!(api.merge(&sources(&["first", "third"])).is_err());
    }

    #[test]
    fn classify_writes_the_log_and_keeps_current_records() {
        let dir = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let api = api();
        let merged = api.merge(&sources(&["first", "second"])).unwrap_or_else(|err| panic!("{err:#}"));
        let log_path = dir.path().join("logs/classification_log.csv");

        let classified = api
            .classify(&merged.store, date!(2024 - 06 - 15), Some(log_path.as_path()))
            .unwrap_or_else(|err| panic!("{err:#}"));

        assert_eq!(classified.summary.total, 3);
        assert_eq!(classified.summary.current, 2);
        assert_eq!(classified.summary.removed, 1);
        assert_eq!(classified.summary.today, "2024-06-15");
        let identifiers: Vec<Option<String>> = classified
            .current
            .records()
            .map(|id| classified.current.node(id).identifier())
            .collect();
        assert_eq!(identifiers, vec![Some("XM-1".to_string()), Some("XM-3".to_string())]);

        let log = std::fs::read_to_string(&log_path).unwrap_or_else(|err| panic!("read: {err}"));
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[2], "XM-2,false,false,false,false,false");
        assert_eq!(lines[3], "XM-3,false,false,false,true,true");
    }

    #[test]
    fn coverage_and_scenarios_run_over_the_merged_store() {
        let dir = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));
        std::fs::write(
            dir.path().join("title.feature"),
            "Feature: Title\n  Scenario: Title is present\n    Given an IATI activity\n    Then `title/narrative` should be present\n",
        )
        .unwrap_or_else(|err| panic!("write: {err}"));
        let api = api();
        let merged = api.merge(&sources(&["first", "second"])).unwrap_or_else(|err| panic!("{err:#}"));

        let coverage = api
            .coverage(&merged.store, "iati-activity[title]")
            .unwrap_or_else(|err| panic!("{err:#}"));
        assert_eq!((coverage.numerator, coverage.denominator), (2, 3));

        let session = api
            .load_scenarios(Some(dir.path()), date!(2024 - 06 - 15))
            .unwrap_or_else(|err| panic!("{err:#}"));
        let listing = api.list_scenarios(&session);
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].tests[0].ordinal, 1);

        let summary = api
            .run_scenario(&session, "TITLE", 1, &merged.store, "iati-activity", &Params::new())
            .unwrap_or_else(|err| panic!("{err:#}"));
        assert_eq!(summary.scenario, "title.feature");
        assert_eq!(summary.total, 3);
        assert_eq!(summary.counts.get("pass"), Some(&2));
        assert_eq!(summary.records.get("fail"), Some(&vec![Some("XM-2".to_string())]));
    }

    #[test]
    fn validate_writes_the_document_before_failing_to_submit() {
        let dir = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let api = api();
        let merged = api.merge(&[]).unwrap_or_else(|err| panic!("{err:#}"));

        let result = api.validate(&merged.store, Some("http://127.0.0.1:9/api_test"), Some(dir.path()));
        assert!(result.is_err());
        assert!(dir.path().join(COMBINED_DOCUMENT).exists());
        assert!(!dir.path().join(VALIDATION_JSON).exists());
    }

    #[test]
    fn params_parse_key_value_pairs() {
        let params = parse_params(&["min=10", "today=2024-06-15", "note=a=b"])
            .unwrap_or_else(|err| panic!("{err:#}"));
        assert_eq!(params.get("note").map(String::as_str), Some("a=b"));
        assert_eq!(params.len(), 3);
        assert!(parse_params(&["novalue"]).is_err());
        assert!(parse_params(&["=x"]).is_err());
    }

    #[test]
    fn reference_instant_is_midnight_utc() {
        let instant = reference_instant(date!(2024 - 02 - 29));
        assert_eq!(instant.date(), date!(2024 - 02 - 29));
        assert_eq!(instant.time(), Time::MIDNIGHT);
    }
}
