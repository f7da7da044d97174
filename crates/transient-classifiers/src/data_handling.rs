//! Data structures for labelled datasets of feature-engineered objects.
//!
//! This module defines `MetadataTable`, `FeatureTable` and `Dataset`, the
//! `Featurizer` seam used to pick feature columns, and the stratified fold
//! labelling used by cross-validation.
use std::collections::{BTreeMap, HashMap, HashSet};

use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::error::{ClassifierError, Result};

/// Per-object metadata, one row per object, in dataset order.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataTable {
    object_ids: Vec<String>,
    classes: Vec<String>,
    numeric: HashMap<String, Vec<f64>>,
    categorical: HashMap<String, Vec<String>>,
    /// Set for augmented objects, pointing at the object they were derived from.
    reference_object_ids: Option<Vec<Option<String>>>,
}

impl MetadataTable {
    pub fn new(object_ids: Vec<String>, classes: Vec<String>) -> Result<Self> {
        if object_ids.len() != classes.len() {
            return Err(ClassifierError::LengthMismatch {
                expected: object_ids.len(),
                found: classes.len(),
            });
        }
        let mut seen = HashSet::with_capacity(object_ids.len());
        for id in &object_ids {
            if !seen.insert(id.as_str()) {
                return Err(ClassifierError::Configuration(format!(
                    "Duplicate object id: {}",
                    id
                )));
            }
        }
        Ok(Self {
            object_ids,
            classes,
            numeric: HashMap::new(),
            categorical: HashMap::new(),
            reference_object_ids: None,
        })
    }

    fn check_len(&self, found: usize) -> Result<()> {
        if found != self.len() {
            return Err(ClassifierError::LengthMismatch {
                expected: self.len(),
                found,
            });
        }
        Ok(())
    }

    pub fn with_numeric_column(mut self, name: &str, values: Vec<f64>) -> Result<Self> {
        self.check_len(values.len())?;
        self.numeric.insert(name.to_string(), values);
        Ok(self)
    }

    pub fn with_categorical_column(mut self, name: &str, values: Vec<String>) -> Result<Self> {
        self.check_len(values.len())?;
        self.categorical.insert(name.to_string(), values);
        Ok(self)
    }

    pub fn with_reference_object_ids(mut self, values: Vec<Option<String>>) -> Result<Self> {
        self.check_len(values.len())?;
        self.reference_object_ids = Some(values);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.object_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.object_ids.is_empty()
    }

    pub fn object_ids(&self) -> &[String] {
        &self.object_ids
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn numeric_column(&self, name: &str) -> Result<&[f64]> {
        self.numeric.get(name).map(|v| v.as_slice()).ok_or_else(|| {
            ClassifierError::Configuration(format!("No numeric metadata column named {}", name))
        })
    }

    /// Group labels for `name`, read from a categorical column or, failing
    /// that, from a numeric column rendered as text.
    pub fn group_labels(&self, name: &str) -> Result<Vec<String>> {
        if let Some(values) = self.categorical.get(name) {
            return Ok(values.clone());
        }
        if let Some(values) = self.numeric.get(name) {
            return Ok(values.iter().map(|v| v.to_string()).collect());
        }
        Err(ClassifierError::Configuration(format!(
            "No metadata column named {}",
            name
        )))
    }

    pub fn reference_object_ids(&self) -> Option<&[Option<String>]> {
        self.reference_object_ids.as_deref()
    }

    /// Mask of objects that are not augmentations, if the dataset tracks
    /// augmentation at all.
    pub fn original_mask(&self) -> Option<Vec<bool>> {
        self.reference_object_ids
            .as_ref()
            .map(|refs| refs.iter().map(|r| r.is_none()).collect())
    }
}

/// Numeric features, one row per object, aligned with the metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTable {
    columns: Vec<String>,
    values: Array2<f32>,
}

impl FeatureTable {
    pub fn new(columns: Vec<String>, values: Array2<f32>) -> Result<Self> {
        if columns.len() != values.ncols() {
            return Err(ClassifierError::LengthMismatch {
                expected: values.ncols(),
                found: columns.len(),
            });
        }
        Ok(Self { columns, values })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &Array2<f32> {
        &self.values
    }

    pub fn nrows(&self) -> usize {
        self.values.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.values.ncols()
    }

    pub fn select_rows(&self, rows: &[usize]) -> FeatureTable {
        FeatureTable {
            columns: self.columns.clone(),
            values: self.values.select(Axis(0), rows),
        }
    }

    pub fn select_columns(&self, names: &[String]) -> Result<FeatureTable> {
        let indices = names
            .iter()
            .map(|name| {
                self.columns.iter().position(|c| c == name).ok_or_else(|| {
                    ClassifierError::Configuration(format!("Unknown feature column: {}", name))
                })
            })
            .collect::<Result<Vec<usize>>>()?;
        Ok(FeatureTable {
            columns: names.to_vec(),
            values: self.values.select(Axis(1), &indices),
        })
    }
}

/// Chooses which feature columns a classifier consumes.
pub trait Featurizer {
    fn select_features(&self, features: &FeatureTable) -> Result<FeatureTable>;
}

/// Uses every feature column as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllFeatures;

impl Featurizer for AllFeatures {
    fn select_features(&self, features: &FeatureTable) -> Result<FeatureTable> {
        Ok(features.clone())
    }
}

/// Uses the named feature columns, in the given order.
#[derive(Debug, Clone)]
pub struct FeatureSubset(pub Vec<String>);

impl Featurizer for FeatureSubset {
    fn select_features(&self, features: &FeatureTable) -> Result<FeatureTable> {
        features.select_columns(&self.0)
    }
}

/// Fold id of every object, aligned with the dataset rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoldAssignment {
    folds: Vec<usize>,
    num_folds: usize,
}

impl FoldAssignment {
    /// Build an assignment from explicit fold labels. The number of folds is
    /// the largest label plus one.
    pub fn from_labels(folds: Vec<usize>) -> Result<Self> {
        let num_folds = folds.iter().max().map(|m| m + 1).unwrap_or(0);
        if num_folds < 2 {
            return Err(ClassifierError::Configuration(format!(
                "At least 2 folds are required, got {}",
                num_folds
            )));
        }
        Ok(Self { folds, num_folds })
    }

    pub fn num_folds(&self) -> usize {
        self.num_folds
    }

    pub fn len(&self) -> usize {
        self.folds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.folds.is_empty()
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.folds
    }

    pub fn validation_rows(&self, fold: usize) -> Vec<usize> {
        self.folds
            .iter()
            .enumerate()
            .filter_map(|(i, &f)| if f == fold { Some(i) } else { None })
            .collect()
    }

    pub fn train_rows(&self, fold: usize) -> Vec<usize> {
        self.folds
            .iter()
            .enumerate()
            .filter_map(|(i, &f)| if f != fold { Some(i) } else { None })
            .collect()
    }
}

/// A labelled dataset: metadata plus an aligned feature table.
#[derive(Debug, Clone)]
pub struct Dataset {
    name: String,
    metadata: MetadataTable,
    features: FeatureTable,
}

impl Dataset {
    pub fn new(name: &str, metadata: MetadataTable, features: FeatureTable) -> Result<Self> {
        if metadata.len() != features.nrows() {
            return Err(ClassifierError::LengthMismatch {
                expected: metadata.len(),
                found: features.nrows(),
            });
        }
        Ok(Self {
            name: name.to_string(),
            metadata,
            features,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.metadata.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.is_empty()
    }

    pub fn metadata(&self) -> &MetadataTable {
        &self.metadata
    }

    pub fn features(&self) -> &FeatureTable {
        &self.features
    }

    pub fn select_features(&self, featurizer: &dyn Featurizer) -> Result<FeatureTable> {
        let features = featurizer.select_features(&self.features)?;
        if features.nrows() != self.len() {
            return Err(ClassifierError::LengthMismatch {
                expected: self.len(),
                found: features.nrows(),
            });
        }
        Ok(features)
    }

    /// Assign every object to one of `num_folds` folds, stratified by class.
    ///
    /// Objects of each class are shuffled with a seeded RNG and dealt
    /// round-robin over the folds. Augmented objects whose reference object
    /// is part of the dataset are placed in the same fold as that reference,
    /// so no augmentation of a validation object is trained on.
    pub fn label_folds(&self, num_folds: usize, seed: u64) -> Result<FoldAssignment> {
        let n_objects = self.len();
        let id_to_row: HashMap<&str, usize> = self
            .metadata
            .object_ids()
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();

        // Row of the reference object for each augmented object.
        let references: Vec<Option<usize>> = match self.metadata.reference_object_ids() {
            Some(refs) => refs
                .iter()
                .map(|r| r.as_deref().and_then(|id| id_to_row.get(id).copied()))
                .collect(),
            None => vec![None; n_objects],
        };

        let mut by_class: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (row, class) in self.metadata.classes().iter().enumerate() {
            if references[row].is_none() {
                by_class.entry(class.as_str()).or_default().push(row);
            }
        }
        let num_reference = by_class.values().map(|rows| rows.len()).sum::<usize>();

        if num_folds < 2 || num_folds > num_reference {
            return Err(ClassifierError::Configuration(format!(
                "Cannot split {} reference objects into {} folds",
                num_reference, num_folds
            )));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let mut folds = vec![0usize; n_objects];
        let mut offset = 0usize;
        for (_class, rows) in by_class.iter_mut() {
            rows.shuffle(&mut rng);
            for (i, &row) in rows.iter().enumerate() {
                folds[row] = (offset + i) % num_folds;
            }
            offset = (offset + rows.len()) % num_folds;
        }

        for (row, reference) in references.iter().enumerate() {
            if let Some(reference_row) = reference {
                folds[row] = folds[*reference_row];
            }
        }

        log::debug!(
            "Labelled {} objects of dataset {} into {} folds",
            n_objects,
            self.name,
            num_folds
        );

        Ok(FoldAssignment { folds, num_folds })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_dataset() -> Dataset {
        let ids: Vec<String> = (0..12).map(|i| format!("obj_{}", i)).collect();
        let classes: Vec<String> = (0..12)
            .map(|i| if i < 8 { "snia".to_string() } else { "agn".to_string() })
            .collect();
        let mut refs = vec![None; 12];
        refs[3] = Some("obj_0".to_string());
        refs[11] = Some("obj_8".to_string());
        let metadata = MetadataTable::new(ids, classes)
            .unwrap()
            .with_reference_object_ids(refs)
            .unwrap();
        let values = Array2::from_shape_fn((12, 2), |(i, j)| (i * 2 + j) as f32);
        let features = FeatureTable::new(vec!["a".into(), "b".into()], values).unwrap();
        Dataset::new("toy", metadata, features).unwrap()
    }

    #[test]
    fn test_label_folds_partitions_index() {
        let dataset = toy_dataset();
        let folds = dataset.label_folds(3, 42).unwrap();
        assert_eq!(folds.len(), dataset.len());
        assert_eq!(folds.num_folds(), 3);

        let mut all_rows: Vec<usize> = (0..3).flat_map(|f| folds.validation_rows(f)).collect();
        all_rows.sort_unstable();
        assert_eq!(all_rows, (0..12).collect::<Vec<_>>());

        for f in 0..3 {
            assert!(!folds.validation_rows(f).is_empty());
            assert_eq!(
                folds.validation_rows(f).len() + folds.train_rows(f).len(),
                dataset.len()
            );
        }
    }

    #[test]
    fn test_label_folds_keeps_augments_with_reference() {
        let dataset = toy_dataset();
        let folds = dataset.label_folds(3, 7).unwrap();
        assert_eq!(folds.as_slice()[3], folds.as_slice()[0]);
        assert_eq!(folds.as_slice()[11], folds.as_slice()[8]);
    }

    #[test]
    fn test_label_folds_is_stable_for_seed() {
        let dataset = toy_dataset();
        assert_eq!(
            dataset.label_folds(4, 1).unwrap(),
            dataset.label_folds(4, 1).unwrap()
        );
    }

    #[test]
    fn test_label_folds_rejects_bad_counts() {
        let dataset = toy_dataset();
        assert!(dataset.label_folds(1, 0).is_err());
        assert!(dataset.label_folds(100, 0).is_err());
    }

    #[test]
    fn test_feature_subset_selects_in_order() {
        let dataset = toy_dataset();
        let subset = FeatureSubset(vec!["b".to_string()]);
        let selected = dataset.select_features(&subset).unwrap();
        assert_eq!(selected.columns(), &["b".to_string()]);
        assert_eq!(selected.values()[(2, 0)], 5.0);

        let missing = FeatureSubset(vec!["c".to_string()]);
        assert!(dataset.select_features(&missing).is_err());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let ids = vec!["a".to_string(), "a".to_string()];
        let classes = vec!["x".to_string(), "y".to_string()];
        assert!(MetadataTable::new(ids, classes).is_err());
    }
}
