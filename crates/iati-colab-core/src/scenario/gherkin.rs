use std::path::Path;

use sha2::{Digest, Sha256};

use crate::ColabError;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum StepKeyword {
    Given,
    When,
    Then,
}

impl StepKeyword {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Given => "Given",
            Self::When => "When",
            Self::Then => "Then",
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct StepLine {
    pub keyword: StepKeyword,
    pub text: String,
    pub line: usize,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FeatureScenario {
    pub name: String,
    pub tags: Vec<String>,
    pub steps: Vec<StepLine>,
}

/// A parsed `.feature` file, before its steps are bound to implementations.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FeatureDocument {
    pub title: String,
    pub version: String,
    pub description: Vec<String>,
    pub background: Vec<StepLine>,
    pub scenarios: Vec<FeatureScenario>,
}

/// Loads one scenario description file.
pub trait FeatureLoader {
    /// # Errors
    /// Returns [`ColabError::Io`] when the file cannot be read, or
    /// [`ColabError::MalformedDocument`] when it cannot be parsed.
    fn load(&self, path: &Path) -> Result<FeatureDocument, ColabError>;
}

/// Reads the Gherkin subset used by IATI data-quality tests: `Feature:`,
/// `Background:`, `Scenario:`/`Example:`, tags, comments, description text,
/// and `Given`/`When`/`Then`/`And`/`But`/`*` steps.
///
/// A continuation step that opens a section is an assertion (`Then`).
/// Outlines, `Examples:` tables, data tables, doc strings and `Rule:` are
/// rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct GherkinLoader;

impl FeatureLoader for GherkinLoader {
    fn load(&self, path: &Path) -> Result<FeatureDocument, ColabError> {
        let source = std::fs::read_to_string(path)
            .map_err(|err| ColabError::Io(format!("failed to read {}: {err}", path.display())))?;
        Self::parse_str(&source, &path.display().to_string())
    }
}

const UNSUPPORTED: [&str; 8] = [
    "Scenario Outline:",
    "Scenario Template:",
    "Examples:",
    "Scenarios:",
    "Rule:",
    "|",
    "\"\"\"",
    "```",
];

enum Section {
    Preamble,
    Background,
    Scenario,
}

impl GherkinLoader {
    /// Parse feature text. The version is the SHA-256 of the text.
    ///
    /// # Errors
    /// Returns [`ColabError::MalformedDocument`] naming `origin` and the line.
    pub fn parse_str(source: &str, origin: &str) -> Result<FeatureDocument, ColabError> {
        let malformed = |line: usize, detail: &str| ColabError::MalformedDocument {
            locator: origin.to_string(),
            detail: format!("line {line}: {detail}"),
        };

        let mut title: Option<String> = None;
        let mut description = Vec::new();
        let mut background = Vec::new();
        let mut scenarios: Vec<FeatureScenario> = Vec::new();
        let mut pending_tags = Vec::new();
        let mut section = Section::Preamble;
        let mut previous: Option<StepKeyword> = None;

        for (index, raw) in source.lines().enumerate() {
            let line_number = index + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line.starts_with('@') {
                pending_tags.extend(line.split_whitespace().map(|tag| tag.trim_start_matches('@').to_string()));
                continue;
            }

            if let Some(rest) = line.strip_prefix("Feature:") {
                if title.is_some() {
                    return Err(malformed(line_number, "more than one `Feature:` header"));
                }
                title = Some(rest.trim().to_string());
                pending_tags.clear();
                continue;
            }
            if title.is_none() {
                return Err(malformed(line_number, "expected a `Feature:` header first"));
            }

            if let Some(construct) = UNSUPPORTED.iter().find(|prefix| line.starts_with(**prefix)) {
                return Err(malformed(
                    line_number,
                    &format!("unsupported Gherkin construct `{}`", construct.trim_end_matches(':')),
                ));
            }
            if line.starts_with("Background:") {
                section = Section::Background;
                previous = None;
                continue;
            }
            if let Some(rest) = line.strip_prefix("Scenario:").or_else(|| line.strip_prefix("Example:")) {
                scenarios.push(FeatureScenario {
                    name: rest.trim().to_string(),
                    tags: std::mem::take(&mut pending_tags),
                    steps: Vec::new(),
                });
                section = Section::Scenario;
                previous = None;
                continue;
            }

            if let Some((keyword, text)) = split_step(line) {
                let keyword = keyword.or(previous).unwrap_or(StepKeyword::Then);
                previous = Some(keyword);
                let step = StepLine { keyword, text: text.to_string(), line: line_number };
                match section {
                    Section::Preamble => {
                        return Err(malformed(line_number, "step outside a scenario or background"));
                    }
                    Section::Background => background.push(step),
                    Section::Scenario => {
                        if let Some(scenario) = scenarios.last_mut() {
                            scenario.steps.push(step);
                        }
                    }
                }
                continue;
            }

            // Free text is description until the first step of a section.
            match section {
                Section::Preamble => description.push(line.to_string()),
                Section::Background | Section::Scenario if previous.is_none() => {}
                _ => return Err(malformed(line_number, &format!("unexpected line `{line}`"))),
            }
        }

        let Some(title) = title else {
            return Err(malformed(0, "missing `Feature:` header"));
        };

        Ok(FeatureDocument {
            title,
            version: format!("sha256:{}", hex::encode(Sha256::digest(source.as_bytes()))),
            description,
            background,
            scenarios,
        })
    }
}

/// Split a step line into its keyword (`None` for `And`/`But`/`*`) and text.
fn split_step(line: &str) -> Option<(Option<StepKeyword>, &str)> {
    const KEYWORDS: [(&str, Option<StepKeyword>); 6] = [
        ("Given ", Some(StepKeyword::Given)),
        ("When ", Some(StepKeyword::When)),
        ("Then ", Some(StepKeyword::Then)),
        ("And ", None),
        ("But ", None),
        ("* ", None),
    ];
    KEYWORDS
        .iter()
        .find_map(|(prefix, keyword)| line.strip_prefix(prefix).map(|text| (*keyword, text.trim())))
}
