//! Subject-level train/validation/test splits.

use crate::types::{DatasetError, DatasetResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectSplits {
    pub train: Vec<String>,
    pub validation: Vec<String>,
    pub test: Vec<String>,
}

impl Default for SubjectSplits {
    /// MICCAI 2012 multi-atlas labeling subjects.
    fn default() -> Self {
        fn ids(list: &[&str]) -> Vec<String> {
            list.iter().map(|s| s.to_string()).collect()
        }
        Self {
            train: ids(&["1000_3", "1014_3"]),
            validation: ids(&["1015_3", "1036_3"]),
            test: ids(&[
                "1003_3", "1004_3", "1005_3", "1018_3", "1019_3", "1023_3", "1024_3", "1025_3",
                "1038_3", "1039_3", "1101_3", "1104_3", "1107_3", "1110_3", "1113_3", "1116_3",
                "1119_3", "1122_3", "1125_3", "1128_3",
            ]),
        }
    }
}

impl SubjectSplits {
    /// Validation and test subjects must not appear in the training split.
    pub fn ensure_disjoint(&self) -> DatasetResult<()> {
        check_disjoint("validation", &self.validation, "train", &self.train)?;
        check_disjoint("test", &self.test, "train", &self.train)
    }
}

fn check_disjoint(
    a_name: &'static str,
    a: &[String],
    b_name: &'static str,
    b: &[String],
) -> DatasetResult<()> {
    let b: HashSet<&String> = b.iter().collect();
    let shared: Vec<String> = a.iter().filter(|id| b.contains(id)).cloned().collect();
    if shared.is_empty() {
        Ok(())
    } else {
        Err(DatasetError::OverlappingSplits {
            a: a_name,
            b: b_name,
            subjects: shared,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_splits_are_disjoint() {
        let splits = SubjectSplits::default();
        assert_eq!(splits.test.len(), 20);
        splits.ensure_disjoint().unwrap();
    }

    #[test]
    fn overlap_with_train_is_reported() {
        let mut splits = SubjectSplits::default();
        splits.test.push("1014_3".into());
        match splits.ensure_disjoint() {
            Err(DatasetError::OverlappingSplits { a, b, subjects }) => {
                assert_eq!((a, b), ("test", "train"));
                assert_eq!(subjects, vec!["1014_3".to_string()]);
            }
            other => panic!("expected overlap error, got {other:?}"),
        }
    }

    #[test]
    fn validation_test_overlap_is_allowed() {
        let mut splits = SubjectSplits::default();
        splits.test.push("1015_3".into());
        assert!(splits.ensure_disjoint().is_ok());
    }
}
