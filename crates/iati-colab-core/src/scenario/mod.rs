//! Named, versioned scenario tests run against individual records.
//!
//! A [`ScenarioSession`] loads every `.feature` file under a directory once,
//! binds each step to a [`StepRegistry`] implementation, and then resolves
//! scenarios by file-name prefix and tests by 1-based ordinal.

mod gherkin;
mod steps;

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::Date;

pub use gherkin::{
    FeatureDocument, FeatureLoader, FeatureScenario, GherkinLoader, StepKeyword, StepLine,
};
pub use steps::{StepContext, StepRegistry, StepVerdict};

use crate::classify::parse_iso_date;
use crate::store::{NodeId, NodeRef, RecordStore};
use crate::ColabError;

/// Keyword parameters passed to a test run. `today` (`YYYY-MM-DD`) overrides
/// the session's reference date; every entry also fills `{name}` placeholders
/// in step text.
pub type Params = BTreeMap<String, String>;

const FEATURE_EXTENSION: &str = "feature";

#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Outcome {
    Pass,
    Fail,
    NotRelevant,
    Label(String),
}

impl Outcome {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::NotRelevant => "not relevant",
            Self::Label(label) => label,
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "pass" => Self::Pass,
            "fail" => Self::Fail,
            "not relevant" => Self::NotRelevant,
            other => Self::Label(other.to_string()),
        }
    }
}

impl Display for Outcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for Outcome {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<Outcome> for String {
    fn from(value: Outcome) -> Self {
        value.as_str().to_string()
    }
}

/// Records grouped by the outcome they produced, each group in run order.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct OutcomeAggregation {
    groups: BTreeMap<Outcome, Vec<NodeId>>,
}

impl OutcomeAggregation {
    pub fn insert(&mut self, outcome: Outcome, record: NodeId) {
        self.groups.entry(outcome).or_default().push(record);
    }

    #[must_use]
    pub fn records(&self, outcome: &Outcome) -> &[NodeId] {
        self.groups.get(outcome).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn counts(&self) -> BTreeMap<Outcome, usize> {
        self.groups.iter().map(|(outcome, records)| (outcome.clone(), records.len())).collect()
    }

    /// Number of distinct outcomes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Outcome, &[NodeId])> {
        self.groups.iter().map(|(outcome, records)| (outcome, records.as_slice()))
    }
}

#[derive(Debug, Clone)]
struct BoundStep {
    keyword: StepKeyword,
    text: String,
    /// `None` when the text carries `{name}` placeholders; resolved per run.
    implementation: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct TestCase {
    name: String,
    tags: Vec<String>,
    steps: Vec<BoundStep>,
}

impl TestCase {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Step lines as written, e.g. `Then \`title\` should be present`.
    #[must_use]
    pub fn step_lines(&self) -> Vec<String> {
        self.steps.iter().map(|step| format!("{} {}", step.keyword.as_str(), step.text)).collect()
    }
}

#[derive(Debug, Clone)]
pub struct ScenarioDefinition {
    name: String,
    file_name: String,
    path: PathBuf,
    version: String,
    title: String,
    tests: Vec<TestCase>,
}

impl ScenarioDefinition {
    /// File stem, e.g. `title` for `title.feature`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    #[must_use]
    pub fn tests(&self) -> &[TestCase] {
        &self.tests
    }

    /// Select a test by 1-based ordinal.
    ///
    /// # Errors
    /// Returns [`ColabError::Lookup`] for 0 or an ordinal past the last test.
    pub fn test(&self, ordinal: usize) -> Result<&TestCase, ColabError> {
        ordinal.checked_sub(1).and_then(|index| self.tests.get(index)).ok_or_else(|| {
            ColabError::Lookup(format!(
                "test #{ordinal} is out of range for `{}` ({} tests)",
                self.file_name,
                self.tests.len()
            ))
        })
    }
}

/// Loaded scenario definitions plus the step implementations they are bound to.
#[derive(Debug)]
pub struct ScenarioSession {
    root: PathBuf,
    definitions: Vec<ScenarioDefinition>,
    registry: StepRegistry,
    today: Date,
}

impl ScenarioSession {
    /// Load every `.feature` file under `root` and bind its steps.
    ///
    /// # Errors
    /// Returns [`ColabError::Io`] when the directory cannot be walked, loader
    /// errors for unreadable files, and [`ColabError::Lookup`] for a step with
    /// no matching implementation.
    pub fn initialize<L>(
        root: &Path,
        loader: &L,
        registry: StepRegistry,
        today: Date,
    ) -> Result<Self, ColabError>
    where
        L: FeatureLoader + ?Sized,
    {
        let mut definitions = Vec::new();
        for entry in walkdir::WalkDir::new(root).sort_by_file_name() {
            let entry = entry.map_err(|err| {
                ColabError::Io(format!("failed to read scenario directory {}: {err}", root.display()))
            })?;
            let path = entry.path();
            if !entry.file_type().is_file()
                || path.extension().and_then(|ext| ext.to_str()) != Some(FEATURE_EXTENSION)
            {
                continue;
            }
            let document = loader.load(path)?;
            definitions.push(bind(path, document, &registry)?);
        }
        definitions.sort_by(|lhs, rhs| {
            lhs.file_name.cmp(&rhs.file_name).then_with(|| lhs.path.cmp(&rhs.path))
        });

        tracing::info!(
            root = %root.display(),
            scenarios = definitions.len(),
            tests = definitions.iter().map(|definition| definition.tests.len()).sum::<usize>(),
            "loaded scenario definitions"
        );

        Ok(Self { root: root.to_path_buf(), definitions, registry, today })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn definitions(&self) -> &[ScenarioDefinition] {
        &self.definitions
    }

    #[must_use]
    pub fn today(&self) -> Date {
        self.today
    }

    /// First definition (by file name) whose file name starts with `name`,
    /// ignoring case.
    ///
    /// # Errors
    /// Returns [`ColabError::Lookup`] when no file name matches.
    pub fn scenario(&self, name: &str) -> Result<&ScenarioDefinition, ColabError> {
        let prefix = name.to_lowercase();
        self.definitions
            .iter()
            .find(|definition| definition.file_name.to_lowercase().starts_with(&prefix))
            .ok_or_else(|| {
                ColabError::Lookup(format!(
                    "no scenario file starting with `{name}` under {}",
                    self.root.display()
                ))
            })
    }

    /// Run one test against one record.
    ///
    /// # Errors
    /// Returns [`ColabError::MalformedDate`] for an invalid `today` parameter,
    /// and propagates step failures.
    pub fn run_test(
        &self,
        test: &TestCase,
        record: NodeRef<'_>,
        params: &Params,
    ) -> Result<Outcome, ColabError> {
        let today = match params.get("today") {
            Some(value) => parse_iso_date(value)?,
            None => self.today,
        };
        let context = StepContext { record, params, today };

        for step in &test.steps {
            let text = substitute(&step.text, params);
            let implementation = match step.implementation {
                Some(index) => index,
                None => self.registry.resolve(&text).ok_or_else(|| {
                    ColabError::Lookup(format!(
                        "no step implementation matches `{} {text}`",
                        step.keyword.as_str()
                    ))
                })?,
            };
            match self.registry.run(implementation, &text, &context)? {
                StepVerdict::Continue => {}
                StepVerdict::Unmet(explanation) => {
                    let outcome = match step.keyword {
                        StepKeyword::Then => Outcome::Fail,
                        StepKeyword::Given | StepKeyword::When => Outcome::NotRelevant,
                    };
                    tracing::debug!(test = %test.name, %outcome, %explanation, "step unmet");
                    return Ok(outcome);
                }
                StepVerdict::Decided(outcome) => return Ok(outcome),
            }
        }
        Ok(Outcome::Pass)
    }

    /// Resolve `scenario` and test `ordinal`, then run it on one record.
    ///
    /// # Errors
    /// Lookup failures and step failures, as in [`ScenarioSession::run_test`].
    pub fn run(
        &self,
        scenario: &str,
        ordinal: usize,
        record: NodeRef<'_>,
        params: &Params,
    ) -> Result<Outcome, ColabError> {
        let test = self.scenario(scenario)?.test(ordinal)?;
        self.run_test(test, record, params)
    }

    /// Run the selected test on every direct child of `container` named `kind`.
    ///
    /// # Errors
    /// Stops at the first lookup or step failure.
    pub fn run_all(
        &self,
        scenario: &str,
        ordinal: usize,
        container: NodeRef<'_>,
        kind: &str,
        params: &Params,
    ) -> Result<OutcomeAggregation, ColabError> {
        let definition = self.scenario(scenario)?;
        let test = definition.test(ordinal)?;

        let mut aggregation = OutcomeAggregation::default();
        for record in container.children_named(kind) {
            aggregation.insert(self.run_test(test, record, params)?, record.id());
        }

        for (outcome, records) in aggregation.iter() {
            tracing::info!(
                scenario = definition.file_name(),
                test = test.name(),
                %outcome,
                count = records.len(),
                "scenario outcome"
            );
        }
        Ok(aggregation)
    }

    /// [`ScenarioSession::run_all`] over every record of a store.
    ///
    /// # Errors
    /// See [`ScenarioSession::run_all`].
    pub fn run_store(
        &self,
        scenario: &str,
        ordinal: usize,
        store: &RecordStore,
        kind: &str,
        params: &Params,
    ) -> Result<OutcomeAggregation, ColabError> {
        self.run_all(scenario, ordinal, store.node(store.root()), kind, params)
    }
}

fn bind(
    path: &Path,
    document: FeatureDocument,
    registry: &StepRegistry,
) -> Result<ScenarioDefinition, ColabError> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default()
        .to_string();
    let name = path.file_stem().and_then(|stem| stem.to_str()).unwrap_or_default().to_string();

    let bind_step = |step: &StepLine| -> Result<BoundStep, ColabError> {
        if has_placeholder(&step.text) {
            return Ok(BoundStep { keyword: step.keyword, text: step.text.clone(), implementation: None });
        }
        let implementation = registry.resolve(&step.text).ok_or_else(|| {
            ColabError::Lookup(format!(
                "{}:{}: no step implementation matches `{} {}`",
                path.display(),
                step.line,
                step.keyword.as_str(),
                step.text
            ))
        })?;
        Ok(BoundStep { keyword: step.keyword, text: step.text.clone(), implementation: Some(implementation) })
    };

    let mut tests = Vec::with_capacity(document.scenarios.len());
    for scenario in &document.scenarios {
        let steps = document
            .background
            .iter()
            .chain(&scenario.steps)
            .map(&bind_step)
            .collect::<Result<Vec<_>, _>>()?;
        tests.push(TestCase { name: scenario.name.clone(), tags: scenario.tags.clone(), steps });
    }

    Ok(ScenarioDefinition {
        name,
        file_name,
        path: path.to_path_buf(),
        version: document.version,
        title: document.title,
        tests,
    })
}

fn has_placeholder(text: &str) -> bool {
    text.find('{').is_some_and(|open| text[open..].contains('}'))
}

fn substitute(text: &str, params: &Params) -> String {
    params.iter().fold(text.to_string(), |acc, (key, value)| acc.replace(&format!("{{{key}}}"), value))
}

/// Holds at most one [`ScenarioSession`]: uninitialized until
/// [`ScenarioEngine::initialize`] succeeds, ready afterwards.
#[derive(Debug, Default)]
pub struct ScenarioEngine {
    session: Option<ScenarioSession>,
}

impl ScenarioEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.session.is_some()
    }

    /// # Errors
    /// Returns [`ColabError::Validation`] when already initialized, or the
    /// session's own load errors.
    pub fn initialize<L>(
        &mut self,
        root: &Path,
        loader: &L,
        registry: StepRegistry,
        today: Date,
    ) -> Result<&ScenarioSession, ColabError>
    where
        L: FeatureLoader + ?Sized,
    {
        if self.session.is_some() {
            return Err(ColabError::Validation(
                "scenario engine is already initialized".to_string(),
            ));
        }
        let session = ScenarioSession::initialize(root, loader, registry, today)?;
        Ok(self.session.insert(session))
    }

    /// # Errors
    /// Returns [`ColabError::Lookup`] while uninitialized.
    pub fn session(&self) -> Result<&ScenarioSession, ColabError> {
        self.session.as_ref().ok_or_else(|| {
            ColabError::Lookup(
                "scenario engine is not initialized; load a feature directory first".to_string(),
            )
        })
    }
}
