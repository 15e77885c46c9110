use serde::{Deserialize, Serialize};

use crate::store::RecordStore;
use crate::ColabError;

/// Supplies the raw bytes of one source document.
pub trait Fetcher {
    /// # Errors
    /// Returns [`ColabError::Fetch`] when the document cannot be retrieved.
    fn fetch(&self, locator: &str) -> Result<Vec<u8>, ColabError>;
}

impl<F> Fetcher for F
where
    F: Fn(&str) -> Result<Vec<u8>, ColabError>,
{
    fn fetch(&self, locator: &str) -> Result<Vec<u8>, ColabError> {
        self(locator)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MergeLogEntry {
    pub locator: String,
    pub records: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct MergeLog {
    pub entries: Vec<MergeLogEntry>,
    pub total: usize,
}

#[derive(Debug)]
pub struct MergedDocument {
    pub store: RecordStore,
    pub log: MergeLog,
}

/// Fetch and parse one document, with comments stripped.
///
/// # Errors
/// Propagates fetch failures and [`ColabError::MalformedDocument`].
pub fn load_document<F>(fetcher: &F, locator: &str) -> Result<RecordStore, ColabError>
where
    F: Fetcher + ?Sized,
{
    let bytes = fetcher.fetch(locator)?;
    let mut store = RecordStore::parse(&bytes, locator)?;
    let removed = store.strip_comments();
    tracing::debug!(locator, removed, "stripped comments");
    Ok(store)
}

/// Combine the top-level records of every source, in source order, into the
/// store parsed from the first source.
///
/// Any failure aborts the merge; no partial store is returned.
///
/// # Errors
/// Returns [`ColabError::Validation`] for an empty source list, and propagates
/// the first fetch or parse failure of any source.
pub fn merge_documents<F, S>(locators: &[S], fetcher: &F) -> Result<MergedDocument, ColabError>
where
    F: Fetcher + ?Sized,
    S: AsRef<str>,
{
    let Some((first, rest)) = locators.split_first() else {
        return Err(ColabError::Validation(
            "at least one source document is required".to_string(),
        ));
    };

    tracing::info!(sources = locators.len(), "combining IATI files");

    let mut store = load_document(fetcher, first.as_ref())?;
    let mut log = MergeLog {
        entries: vec![MergeLogEntry { locator: first.as_ref().to_string(), records: store.len() }],
        total: 0,
    };

    for locator in rest {
        let document = load_document(fetcher, locator.as_ref())?;
        let records = store.extend_records(&document);
        log.entries.push(MergeLogEntry { locator: locator.as_ref().to_string(), records });
    }
    log.total = store.len();

    for entry in &log.entries {
        tracing::info!(locator = %entry.locator, activities = entry.records, "merged file");
    }
    tracing::info!(total = log.total, "activities in total");

    Ok(MergedDocument { store, log })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use proptest::prelude::*;

    use super::*;

    fn document(prefix: &str, count: usize) -> String {
        let mut body = String::from("<iati-activities version=\"2.03\">\n");
        for index in 0..count {
            body.push_str(&format!(
                "  <iati-activity><iati-identifier>{prefix}-{index}</iati-identifier></iati-activity>\n"
            ));
        }
        body.push_str("</iati-activities>\n");
        body
    }

    fn fetcher(documents: BTreeMap<String, String>) -> impl Fn(&str) -> Result<Vec<u8>, ColabError> {
        move |locator: &str| {
            documents.get(locator).map(|body| body.as_bytes().to_vec()).ok_or_else(|| {
                ColabError::Fetch { locator: locator.to_string(), detail: "404".to_string() }
            })
        }
    }

    fn identifiers(store: &RecordStore) -> Vec<String> {
        store.records().filter_map(|id| store.node(id).identifier()).collect()
    }

    #[test]
    fn merges_sources_in_order_and_logs_counts() {
        let mut documents = BTreeMap::new();
        documents.insert("a.xml".to_string(), document("A", 3));
        documents.insert("b.xml".to_string(), document("B", 2));
        let sources = ["a.xml", "b.xml"];

        let merged = merge_documents(&sources, &fetcher(documents))
            .unwrap_or_else(|err| panic!("merge failed: {err}"));

        assert_eq!(merged.store.len(), 5);
        assert_eq!(identifiers(&merged.store), vec!["A-0", "A-1", "A-2", "B-0", "B-1"]);
        assert_eq!(
            merged.log,
            MergeLog {
                entries: vec![
                    MergeLogEntry { locator: "a.xml".to_string(), records: 3 },
                    MergeLogEntry { locator: "b.xml".to_string(), records: 2 },
                ],
                total: 5,
            }
        );
    }

    #[test]
    fn comments_are_stripped_before_merge() {
        let mut documents = BTreeMap::new();
        documents.insert(
            "commented.xml".to_string(),
            "<iati-activities><!-- note --><iati-activity><!-- inner --></iati-activity></iati-activities>"
                .to_string(),
        );
        let merged = merge_documents(&["commented.xml"], &fetcher(documents))
            .unwrap_or_else(|err| panic!("merge failed: {err}"));

        let bytes = merged.store.to_xml().unwrap_or_else(|err| panic!("serialize: {err}"));
        let text = String::from_utf8_lossy(&bytes);
        assert!(!text.contains("<!--"));
        assert_eq!(merged.store.len(), 1);
    }

    #[test]
    fn empty_source_list_is_rejected() {
        let sources: [&str; 0] = [];
        let result = merge_documents(&sources, &fetcher(BTreeMap::new()));
        assert!(matches!(result, Err(ColabError::Validation(_))));
    }

    #[test]
    fn failure_on_a_later_source_is_fatal() {
        let mut documents = BTreeMap::new();
        documents.insert("a.xml".to_string(), document("A", 1));
        documents.insert("broken.xml".to_string(), "<iati-activities>".to_string());

        let missing = merge_documents(&["a.xml", "missing.xml"], &fetcher(documents.clone()));
        assert!(matches!(missing, Err(ColabError::Fetch { ref locator, .. }) if locator == "missing.xml"));

        let broken = merge_documents(&["a.xml", "broken.xml"], &fetcher(documents));
        assert!(matches!(broken, Err(ColabError::MalformedDocument { .. })));
    }

    proptest! {
        #[test]
        fn merged_size_is_the_sum_and_order_is_preserved(counts in proptest::collection::vec(0_usize..6, 1..5)) {
            let mut documents = BTreeMap::new();
            let mut sources = Vec::new();
            let mut expected = Vec::new();
            for (source, count) in counts.iter().enumerate() {
                let locator = format!("source-{source}.xml");
                let prefix = format!("S{source}");
                documents.insert(locator.clone(), document(&prefix, *count));
                expected.extend((0..*count).map(|index| format!("{prefix}-{index}")));
                sources.push(locator);
            }

            let merged = merge_documents(&sources, &fetcher(documents));
            prop_assert!(merged.is_ok());
            let merged = merged.unwrap_or_else(|_| unreachable!());
            prop_assert_eq!(merged.store.len(), counts.iter().sum::<usize>());
            prop_assert_eq!(merged.log.total, merged.store.len());
            prop_assert_eq!(identifiers(&merged.store), expected);
        }
    }
}
