//! Currency classification: an activity is current when it is in its
//! completion status, or when its planned end, actual end, or a disbursement,
//! expenditure, or incoming-funds transaction falls within the last year.

use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime, Time};

use crate::select::Selector;
use crate::store::{NodeRef, RecordStore};
use crate::ColabError;

const STATUS_COMPLETION: &str = "activity-status[@code=2]";
const PLANNED_END_DATE: &str = "activity-date[@type=3]/@iso-date";
const ACTUAL_END_DATE: &str = "activity-date[@type=4]/@iso-date";
const SPENDING_TRANSACTION_DATES: &str =
    "transaction[transaction-type[@code=2 or @code=3 or @code=4]]/transaction-date/@iso-date";

/// Column order of the persisted classification log.
pub const LOG_COLUMNS: [&str; 6] = [
    "identifier",
    "status_check",
    "planned_end_date_check",
    "actual_end_date_check",
    "transaction_date_check",
    "pwyf_current",
];

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct CurrencyChecks {
    pub status: bool,
    pub planned_end_date: bool,
    pub actual_end_date: bool,
    pub transaction_date: bool,
}

impl CurrencyChecks {
    #[must_use]
    pub fn is_current(self) -> bool {
        self.status || self.planned_end_date || self.actual_end_date || self.transaction_date
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ClassificationRow {
    pub identifier: Option<String>,
    pub status_check: bool,
    pub planned_end_date_check: bool,
    pub actual_end_date_check: bool,
    pub transaction_date_check: bool,
    pub pwyf_current: bool,
}

impl ClassificationRow {
    #[must_use]
    pub fn new(identifier: Option<String>, checks: CurrencyChecks) -> Self {
        Self {
            identifier,
            status_check: checks.status,
            planned_end_date_check: checks.planned_end_date,
            actual_end_date_check: checks.actual_end_date,
            transaction_date_check: checks.transaction_date,
            pwyf_current: checks.is_current(),
        }
    }
}

/// Receives classification rows as each record is evaluated.
pub trait ClassificationSink {
    /// # Errors
    /// Returns an error when the row cannot be recorded.
    fn push(&mut self, row: &ClassificationRow) -> Result<(), ColabError>;
}

impl ClassificationSink for Vec<ClassificationRow> {
    fn push(&mut self, row: &ClassificationRow) -> Result<(), ColabError> {
        Vec::push(self, row.clone());
        Ok(())
    }
}

#[derive(Debug)]
pub struct Classification {
    pub log: Vec<ClassificationRow>,
    pub current: RecordStore,
}

impl Classification {
    #[must_use]
    pub fn current_count(&self) -> usize {
        self.log.iter().filter(|row| row.pwyf_current).count()
    }
}

#[derive(Debug, Clone)]
pub struct CurrencyClassifier {
    status: Selector,
    planned_end_date: Selector,
    actual_end_date: Selector,
    transaction_dates: Selector,
}

impl CurrencyClassifier {
    /// # Errors
    /// Returns [`ColabError::Query`] if a built-in selector fails to parse.
    pub fn new() -> Result<Self, ColabError> {
        Ok(Self {
            status: Selector::parse(STATUS_COMPLETION)?,
            planned_end_date: Selector::parse(PLANNED_END_DATE)?,
            actual_end_date: Selector::parse(ACTUAL_END_DATE)?,
            transaction_dates: Selector::parse(SPENDING_TRANSACTION_DATES)?,
        })
    }

    /// Evaluate the four predicates for one record.
    ///
    /// # Errors
    /// Returns [`ColabError::MalformedDate`] when a consulted date is not `YYYY-MM-DD`.
    pub fn checks(
        &self,
        record: NodeRef<'_>,
        now: OffsetDateTime,
    ) -> Result<CurrencyChecks, ColabError> {
        let store = record.store();
        let id = record.id();
        let cutoff = one_year_before(now);

        let first_date_after = |selector: &Selector| -> Result<bool, ColabError> {
            match selector.values(store, id).first() {
                Some(value) => Ok(at_midnight(parse_iso_date(value)?) > cutoff),
                None => Ok(false),
            }
        };

        let transaction_dates = self
            .transaction_dates
            .values(store, id)
            .iter()
            .map(|value| parse_iso_date(value))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(CurrencyChecks {
            status: self.status.matches(store, id),
            planned_end_date: first_date_after(&self.planned_end_date)?,
            actual_end_date: first_date_after(&self.actual_end_date)?,
            transaction_date: transaction_dates.into_iter().any(|date| at_midnight(date) > cutoff),
        })
    }

    /// # Errors
    /// See [`CurrencyClassifier::checks`].
    pub fn is_current(&self, record: NodeRef<'_>, now: OffsetDateTime) -> Result<bool, ColabError> {
        self.checks(record, now).map(CurrencyChecks::is_current)
    }

    /// Classify every record, pushing one row per record to `sink` as it is
    /// evaluated, then build an independent store with only the current records.
    ///
    /// Filtering is positional: record *i* is kept iff row *i* is current.
    ///
    /// # Errors
    /// Stops at the first malformed date or sink failure; rows pushed before the
    /// failure stay in the sink.
    pub fn classify<S>(
        &self,
        store: &RecordStore,
        now: OffsetDateTime,
        sink: &mut S,
    ) -> Result<Classification, ColabError>
    where
        S: ClassificationSink + ?Sized,
    {
        let mut log = Vec::new();
        for record in store.records() {
            let record = store.node(record);
            let row = ClassificationRow::new(record.identifier(), self.checks(record, now)?);
            sink.push(&row)?;
            log.push(row);
        }

        let current = store.retain_records(|position, _| log[position].pwyf_current);
        let total = log.len();
        tracing::info!(
            removed = total - current.len(),
            total,
            "removed non-current activities"
        );
        tracing::info!(remaining = current.len(), "current activities remain");

        Ok(Classification { log, current })
    }
}

/// Parse an ISO calendar date (`YYYY-MM-DD`, four-digit unsigned year).
///
/// # Errors
/// Returns [`ColabError::MalformedDate`] for anything else.
pub fn parse_iso_date(value: &str) -> Result<Date, ColabError> {
    let malformed = || ColabError::MalformedDate { value: value.to_string() };
    if !value.bytes().next().is_some_and(|byte| byte.is_ascii_digit()) {
        return Err(malformed());
    }
    Date::parse(value, format_description!("[year repr:full sign:automatic]-[month]-[day]"))
        .map_err(|_| malformed())
}

/// `now` minus one calendar year; 29 February maps to 28 February.
fn one_year_before(now: OffsetDateTime) -> PrimitiveDateTime {
    let date = now.date();
    let year = date.year() - 1;
    let shifted = Date::from_calendar_date(year, date.month(), date.day())
        .or_else(|_| Date::from_calendar_date(year, date.month(), date.day() - 1))
        .unwrap_or(Date::MIN);
    PrimitiveDateTime::new(shifted, now.time())
}

fn at_midnight(date: Date) -> PrimitiveDateTime {
    PrimitiveDateTime::new(date, Time::MIDNIGHT)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use time::macros::{date, datetime};

    use super::*;

    const NOW: OffsetDateTime = datetime!(2024-06-15 10:30 UTC);

    struct Spec<'a> {
        identifier: Option<&'a str>,
        status: Option<&'a str>,
        planned_end: Option<&'a str>,
        actual_end: Option<&'a str>,
        transactions: &'a [(&'a str, &'a str)],
    }

    impl Default for Spec<'_> {
        fn default() -> Self {
            Self { identifier: None, status: None, planned_end: None, actual_end: None, transactions: &[] }
        }
    }

    fn add_activity(store: &mut RecordStore, spec: &Spec<'_>) {
        let root = store.root();
        let activity = store.append_element(root, "iati-activity", &[]);
        if let Some(identifier) = spec.identifier {
            let node = store.append_element(activity, "iati-identifier", &[]);
            store.append_text(node, identifier);
        }
        if let Some(code) = spec.status {
            store.append_element(activity, "activity-status", &[("code", code)]);
        }
        if let Some(date) = spec.planned_end {
            store.append_element(activity, "activity-date", &[("type", "3"), ("iso-date", date)]);
        }
        if let Some(date) = spec.actual_end {
            store.append_element(activity, "activity-date", &[("type", "4"), ("iso-date", date)]);
        }
        for (code, date) in spec.transactions {
            let transaction = store.append_element(activity, "transaction", &[]);
            store.append_element(transaction, "transaction-type", &[("code", code)]);
            store.append_element(transaction, "transaction-date", &[("iso-date", date)]);
        }
    }

    fn classifier() -> CurrencyClassifier {
        CurrencyClassifier::new().unwrap_or_else(|err| panic!("classifier: {err}"))
    }

    fn checks_for(spec: &Spec<'_>) -> Result<CurrencyChecks, ColabError> {
        let mut store = RecordStore::new("iati-activities");
        add_activity(&mut store, spec);
        let record = store.records().next().unwrap_or_else(|| panic!("missing record"));
        classifier().checks(store.node(record), NOW)
    }

    #[test]
    fn completion_status_marks_current() {
        let checks = checks_for(&Spec { status: Some("2"), ..Spec::default() })
            .unwrap_or_else(|err| panic!("{err}"));
        assert!(checks.status);
        assert!(checks.is_current());

        let closed = checks_for(&Spec { status: Some("4"), ..Spec::default() })
            .unwrap_or_else(|err| panic!("{err}"));
        assert!(!closed.is_current());
    }

    #[test]
    fn end_dates_must_be_strictly_after_one_year_ago() {
        let cases = [
            ("2023-06-14", false),
            ("2023-06-15", false),
            ("2023-06-16", true),
            ("2030-01-01", true),
        ];
        for (date, expected) in cases {
            let planned = checks_for(&Spec { planned_end: Some(date), ..Spec::default() })
                .unwrap_or_else(|err| panic!("{err}"));
            assert_eq!(planned.planned_end_date, expected, "planned end {date}");

            let actual = checks_for(&Spec { actual_end: Some(date), ..Spec::default() })
                .unwrap_or_else(|err| panic!("{err}"));
            assert_eq!(actual.actual_end_date, expected, "actual end {date}");
        }
    }

    #[test]
    fn only_spending_transactions_count() {
        let commitment_only = checks_for(&Spec { transactions: &[("1", "2024-05-01")], ..Spec::default() })
            .unwrap_or_else(|err| panic!("{err}"));
        assert!(!commitment_only.transaction_date);

        for code in ["2", "3", "4"] {
            let checks = checks_for(&Spec {
                transactions: &[("3", "2019-01-01"), (code, "2024-05-01")],
                ..Spec::default()
            })
            .unwrap_or_else(|err| panic!("{err}"));
            assert!(checks.transaction_date, "transaction type {code}");
        }
    }

    #[test]
    fn missing_dates_are_false_and_malformed_dates_are_fatal() {
        let nothing = checks_for(&Spec::default()).unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(nothing, CurrencyChecks::default());

        for spec in [
            Spec { planned_end: Some("15/06/2024"), ..Spec::default() },
            Spec { actual_end: Some("2024-06-15T00:00:00"), ..Spec::default() },
            Spec { transactions: &[("1", "not-a-date")], ..Spec::default() },
            Spec { transactions: &[("3", "2024-02-30")], ..Spec::default() },
        ] {
            match checks_for(&spec) {
                Err(ColabError::MalformedDate { .. }) => {}
                Ok(checks) if spec.transactions.first().is_some_and(|(code, _)| *code == "1") => {
                    // Commitments are never consulted, so their dates are never parsed.
                    assert!(!checks.transaction_date);
                }
                other => panic!("expected malformed date error, got {other:?}"),
            }
        }
    }

    #[test]
    fn iso_dates_need_an_unsigned_four_digit_year() {
        assert_eq!(
            parse_iso_date("2024-06-05").unwrap_or_else(|err| panic!("{err}")),
            date!(2024 - 06 - 05)
        );
        for value in ["+2024-06-05", "-2024-06-05", " 2024-06-05", "24-06-05", "2024-6-5", ""] {
            assert!(
                matches!(parse_iso_date(value), Err(ColabError::MalformedDate { value: ref got }) if got == value),
                "expected {value:?} to be rejected"
            );
        }
    }

    #[test]
    fn leap_day_cutoff_falls_back_to_february_28() {
        let now = datetime!(2024-02-29 12:00 UTC);
        assert_eq!(one_year_before(now), datetime!(2023-02-28 12:00));
    }

    #[test]
    fn classify_filters_by_position_and_logs_every_record() {
        let mut store = RecordStore::new("iati-activities");
        add_activity(&mut store, &Spec { identifier: Some("DUP"), status: Some("2"), ..Spec::default() });
        add_activity(&mut store, &Spec { identifier: Some("DUP"), status: Some("3"), ..Spec::default() });
        add_activity(&mut store, &Spec { identifier: None, planned_end: Some("2024-12-31"), ..Spec::default() });

        let mut sink: Vec<ClassificationRow> = Vec::new();
        let classification = classifier()
            .classify(&store, NOW, &mut sink)
            .unwrap_or_else(|err| panic!("classify failed: {err}"));

        assert_eq!(sink, classification.log);
        assert_eq!(classification.log.len(), store.len());
        assert_eq!(
            classification.log.iter().map(|row| row.pwyf_current).collect::<Vec<_>>(),
            vec![true, false, true]
        );
        assert_eq!(classification.log[2].identifier, None);
        assert_eq!(classification.current.len(), classification.current_count());
        assert_eq!(classification.current.len(), 2);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn rows_before_a_malformed_date_reach_the_sink() {
        let mut store = RecordStore::new("iati-activities");
        add_activity(&mut store, &Spec { identifier: Some("OK"), ..Spec::default() });
        add_activity(&mut store, &Spec { identifier: Some("BAD"), actual_end: Some("2024/01/01"), ..Spec::default() });

        let mut sink: Vec<ClassificationRow> = Vec::new();
        let result = classifier().classify(&store, NOW, &mut sink);

        assert!(matches!(result, Err(ColabError::MalformedDate { .. })));
        assert_eq!(sink.len(), 1);
        assert_eq!(sink[0].identifier.as_deref(), Some("OK"));
    }

    #[test]
    fn all_sixteen_predicate_combinations_follow_logical_or() {
        for mask in 0_u8..16 {
            let spec = Spec {
                status: Some(if mask & 1 != 0 { "2" } else { "1" }),
                planned_end: Some(if mask & 2 != 0 { "2024-12-01" } else { "2020-12-01" }),
                actual_end: Some(if mask & 4 != 0 { "2024-01-01" } else { "2021-01-01" }),
                transactions: if mask & 8 != 0 { &[("4", "2024-03-01")] } else { &[("4", "2022-03-01")] },
                ..Spec::default()
            };
            let checks = checks_for(&spec).unwrap_or_else(|err| panic!("{err}"));
            assert_eq!(
                [checks.status, checks.planned_end_date, checks.actual_end_date, checks.transaction_date],
                [mask & 1 != 0, mask & 2 != 0, mask & 4 != 0, mask & 8 != 0],
                "mask {mask:04b}"
            );
            assert_eq!(checks.is_current(), mask != 0, "mask {mask:04b}");
        }
    }

    proptest! {
        #[test]
        fn classification_is_deterministic_and_never_grows(flags in proptest::collection::vec((any::<bool>(), 0_i64..900), 0..20)) {
            let mut store = RecordStore::new("iati-activities");
            let dates: Vec<String> = flags
                .iter()
                .map(|(_, days_ago)| (NOW.date() - time::Duration::days(*days_ago)).to_string())
                .collect();
            for (index, (completed, _)) in flags.iter().enumerate() {
                add_activity(&mut store, &Spec {
                    status: Some(if *completed { "2" } else { "3" }),
                    planned_end: Some(dates[index].as_str()),
                    ..Spec::default()
                });
            }

            let classifier = classifier();
            let first = classifier.classify(&store, NOW, &mut Vec::<ClassificationRow>::new());
            let second = classifier.classify(&store, NOW, &mut Vec::<ClassificationRow>::new());
            prop_assert!(first.is_ok() && second.is_ok());
            let first = first.unwrap_or_else(|_| unreachable!());
            let second = second.unwrap_or_else(|_| unreachable!());

            prop_assert_eq!(&first.log, &second.log);
            prop_assert!(first.current.len() <= store.len());
            prop_assert_eq!(first.current.len(), first.current_count());
        }
    }
}
