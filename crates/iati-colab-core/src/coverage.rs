use serde::{Deserialize, Serialize};

use crate::select::Selector;
use crate::store::RecordStore;
use crate::ColabError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Coverage {
    pub denominator: usize,
    pub numerator: usize,
    pub coverage: f64,
}

/// How the population and the selection are counted. The caller picks the
/// mode explicitly; nothing is inferred from the inputs.
#[derive(Debug, Clone, Copy)]
pub enum CoverageBasis<'a> {
    /// Records in `store` against items `selector` yields from the store root.
    Structural { store: &'a RecordStore, selector: &'a Selector },
    /// Lengths of externally supplied lists.
    Listed { population: usize, selected: usize },
}

/// Compute `numerator / denominator`. The ratio is not clamped: a selection
/// can count more items than there are records.
///
/// # Errors
/// Returns [`ColabError::DivisionByZero`] for an empty population.
pub fn coverage_check(basis: CoverageBasis<'_>) -> Result<Coverage, ColabError> {
    let (denominator, numerator) = match basis {
        CoverageBasis::Structural { store, selector } => {
            (store.len(), selector.select(store, store.root()).len())
        }
        CoverageBasis::Listed { population, selected } => (population, selected),
    };

    if denominator == 0 {
        return Err(ColabError::DivisionByZero(
            "coverage population is empty".to_string(),
        ));
    }

    #[allow(clippy::cast_precision_loss)]
    let coverage = numerator as f64 / denominator as f64;
    Ok(Coverage { denominator, numerator, coverage })
}

/// List-based coverage: `selected.len() / population.len()`.
///
/// # Errors
/// See [`coverage_check`].
pub fn listed_coverage<T, U>(population: &[T], selected: &[U]) -> Result<Coverage, ColabError> {
    coverage_check(CoverageBasis::Listed { population: population.len(), selected: selected.len() })
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn store_with_sectors(sectors: &[usize]) -> RecordStore {
        let mut store = RecordStore::new("iati-activities");
        let root = store.root();
        for count in sectors {
            let activity = store.append_element(root, "iati-activity", &[]);
            for _ in 0..*count {
                store.append_element(activity, "sector", &[("code", "11110")]);
            }
        }
        store
    }

    fn selector(input: &str) -> Selector {
        Selector::parse(input).unwrap_or_else(|err| panic!("selector: {err}"))
    }

    #[test]
    fn structural_coverage_counts_selected_records() {
        let store = store_with_sectors(&[1, 0, 2, 0]);
        let with_sector = selector("iati-activity[sector]");
        let result = coverage_check(CoverageBasis::Structural { store: &store, selector: &with_sector })
            .unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(result, Coverage { denominator: 4, numerator: 2, coverage: 0.5 });
    }

    #[test]
    fn structural_numerator_may_exceed_denominator() {
        let store = store_with_sectors(&[3, 2]);
        let sectors = selector("iati-activity/sector");
        let result = coverage_check(CoverageBasis::Structural { store: &store, selector: &sectors })
            .unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(result.numerator, 5);
        assert!((result.coverage - 2.5).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_population_is_a_division_error() {
        let store = store_with_sectors(&[]);
        let any = selector("iati-activity");
        assert!(matches!(
            coverage_check(CoverageBasis::Structural { store: &store, selector: &any }),
            Err(ColabError::DivisionByZero(_))
        ));
        let nothing: [u8; 0] = [];
        assert!(matches!(listed_coverage(&nothing, &[1, 2]), Err(ColabError::DivisionByZero(_))));
    }

    proptest! {
        #[test]
        fn listed_ratio_is_exact_and_unclamped(denominator in 1_usize..10_000, numerator in 0_usize..20_000) {
            let result = coverage_check(CoverageBasis::Listed { population: denominator, selected: numerator });
            prop_assert!(result.is_ok());
            let result = result.unwrap_or_else(|_| unreachable!());
            prop_assert_eq!(result.denominator, denominator);
            prop_assert_eq!(result.numerator, numerator);
            #[allow(clippy::cast_precision_loss)]
            let expected = numerator as f64 / denominator as f64;
            prop_assert!((result.coverage - expected).abs() < f64::EPSILON);
        }
    }
}
