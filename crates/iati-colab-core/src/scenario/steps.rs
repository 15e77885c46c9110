use std::fmt::{Debug, Formatter};

use regex_lite::Regex;
use time::{Date, Time};

use super::{Outcome, Params};
use crate::classify::{parse_iso_date, CurrencyClassifier};
use crate::select::Selector;
use crate::store::NodeRef;
use crate::ColabError;

/// What a step implementation sees while running against one record.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    pub record: NodeRef<'a>,
    pub params: &'a Params,
    pub today: Date,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum StepVerdict {
    Continue,
    /// The step did not hold. A `Given`/`When` step turns this into
    /// [`Outcome::NotRelevant`], a `Then` step into [`Outcome::Fail`].
    Unmet(String),
    /// Stop immediately with this outcome.
    Decided(Outcome),
}

type StepFn = dyn Fn(&StepContext<'_>, &[String]) -> Result<StepVerdict, ColabError>;

struct RegisteredStep {
    pattern: Regex,
    run: Box<StepFn>,
}

/// Step implementations keyed by anchored regular expressions. The first
/// registered pattern matching the whole step text wins; capture groups are
/// passed to the implementation in order.
#[derive(Default)]
pub struct StepRegistry {
    steps: Vec<RegisteredStep>,
}

impl Debug for StepRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.steps.iter().map(|step| step.pattern.as_str())).finish()
    }
}

impl StepRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// Returns [`ColabError::Query`] for an invalid pattern.
    pub fn register<F>(&mut self, pattern: &str, run: F) -> Result<(), ColabError>
    where
        F: Fn(&StepContext<'_>, &[String]) -> Result<StepVerdict, ColabError> + 'static,
    {
        let pattern = Regex::new(&format!("^(?:{pattern})$"))
            .map_err(|err| ColabError::Query(format!("invalid step pattern `{pattern}`: {err}")))?;
        self.steps.push(RegisteredStep { pattern, run: Box::new(run) });
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub(crate) fn resolve(&self, text: &str) -> Option<usize> {
        self.steps.iter().position(|step| step.pattern.is_match(text))
    }

    pub(crate) fn run(
        &self,
        index: usize,
        text: &str,
        context: &StepContext<'_>,
    ) -> Result<StepVerdict, ColabError> {
        let step = self
            .steps
            .get(index)
            .ok_or_else(|| ColabError::Lookup(format!("no step implementation #{index}")))?;
        let captures = step.pattern.captures(text).ok_or_else(|| {
            ColabError::Lookup(format!(
                "step `{text}` does not match `{}` after parameter substitution",
                step.pattern.as_str()
            ))
        })?;
        let arguments: Vec<String> = captures
            .iter()
            .skip(1)
            .map(|group| group.map(|found| found.as_str().to_string()).unwrap_or_default())
            .collect();
        (step.run)(context, &arguments)
    }

    /// The steps IATI data-quality feature files are written against.
    ///
    /// # Errors
    /// Returns [`ColabError::Query`] if a built-in pattern or selector is invalid.
    pub fn with_builtin_steps() -> Result<Self, ColabError> {
        let mut registry = Self::new();
        let classifier = CurrencyClassifier::new()?;

        registry.register("an IATI activity", |_, _| Ok(StepVerdict::Continue))?;

        registry.register("the activity is current", move |context, _| {
            let now = context.today.with_time(Time::MIDNIGHT).assume_utc();
            if classifier.is_current(context.record, now)? {
                Ok(StepVerdict::Continue)
            } else {
                Ok(StepVerdict::Unmet("the activity is not current".to_string()))
            }
        })?;

        registry.register(r"`([^`]+)` is present", |context, args| {
            presence(context, &args[0], true)
        })?;
        registry.register(r"`([^`]+)` is not present", |context, args| {
            presence(context, &args[0], false)
        })?;
        registry.register(r"`([^`]+)` should be present", |context, args| {
            presence(context, &args[0], true)
        })?;
        registry.register(r"`([^`]+)` should not be present", |context, args| {
            presence(context, &args[0], false)
        })?;

        registry.register(r"`([^`]+)` should be today, or in the future", |context, args| {
            let values = selected_values(context, &args[0])?;
            if values.is_empty() {
                return Ok(StepVerdict::Unmet(format!("`{}` is not present", args[0])));
            }
            for value in &values {
                if parse_iso_date(value)? < context.today {
                    return Ok(StepVerdict::Unmet(format!("`{}` is in the past ({value})", args[0])));
                }
            }
            Ok(StepVerdict::Continue)
        })?;

        registry.register(r"`([^`]+)` should have at least (\d+) characters", |context, args| {
            let minimum: usize = args[1]
                .parse()
                .map_err(|err| ColabError::Query(format!("invalid character count `{}`: {err}", args[1])))?;
            let values = selected_values(context, &args[0])?;
            if values.is_empty() {
                return Ok(StepVerdict::Unmet(format!("`{}` is not present", args[0])));
            }
            match values.iter().find(|value| value.trim().chars().count() < minimum) {
                Some(short) => Ok(StepVerdict::Unmet(format!(
                    "`{}` has fewer than {minimum} characters ({short:?})",
                    args[0]
                ))),
                None => Ok(StepVerdict::Continue),
            }
        })?;

        registry.register(r"`([^`]+)` should be one of (.+)", |context, args| {
            let allowed: Vec<&str> = args[1].split(',').map(str::trim).collect();
            let values = selected_values(context, &args[0])?;
            if values.is_empty() {
                return Ok(StepVerdict::Unmet(format!("`{}` is not present", args[0])));
            }
            match values.iter().find(|value| !allowed.contains(&value.as_str())) {
                Some(other) => Ok(StepVerdict::Unmet(format!(
                    "`{}` is `{other}`, not one of {}",
                    args[0], args[1]
                ))),
                None => Ok(StepVerdict::Continue),
            }
        })?;

        Ok(registry)
    }
}

fn selected_values(context: &StepContext<'_>, selector: &str) -> Result<Vec<String>, ColabError> {
    let selector = Selector::parse(selector)?;
    Ok(selector.values(context.record.store(), context.record.id()))
}

fn presence(
    context: &StepContext<'_>,
    selector: &str,
    expected: bool,
) -> Result<StepVerdict, ColabError> {
    let parsed = Selector::parse(selector)?;
    let present = parsed.matches(context.record.store(), context.record.id());
    if present == expected {
        Ok(StepVerdict::Continue)
    } else if expected {
        Ok(StepVerdict::Unmet(format!("`{selector}` is not present")))
    } else {
        Ok(StepVerdict::Unmet(format!("`{selector}` is present")))
    }
}
