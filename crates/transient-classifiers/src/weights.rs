//! Object weights for class-balanced training and scoring.
//!
//! Three policies are available: uniform weights, flat class balancing, and
//! class balancing within (group, redshift bin) cells. The redshift policy
//! removes the redshift distribution of the training sample from what a
//! classifier can learn, producing a rates-independent classifier.
use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::data_handling::MetadataTable;
use crate::error::{ClassifierError, Result};

/// Explicit per-class multipliers, keyed by class label.
pub type ClassWeights = BTreeMap<String, f64>;

/// Occupancy above which a non-galactic cell counts towards the
/// extragalactic rescale, as a fraction of the total object count.
const EXTGAL_OCCUPANCY_FRACTION: f64 = 1e-4;

/// Weight of every object, index-aligned with the dataset it was computed on.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectWeights {
    object_ids: Vec<String>,
    weights: Vec<f64>,
}

impl ObjectWeights {
    pub fn new(object_ids: Vec<String>, weights: Vec<f64>) -> Result<Self> {
        if object_ids.len() != weights.len() {
            return Err(ClassifierError::LengthMismatch {
                expected: object_ids.len(),
                found: weights.len(),
            });
        }
        Ok(Self { object_ids, weights })
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn object_ids(&self) -> &[String] {
        &self.object_ids
    }

    pub fn values(&self) -> &[f64] {
        &self.weights
    }

    pub fn get(&self, object_id: &str) -> Option<f64> {
        self.object_ids
            .iter()
            .position(|id| id == object_id)
            .map(|i| self.weights[i])
    }

    pub fn select_rows(&self, rows: &[usize]) -> Vec<f64> {
        rows.iter().map(|&i| self.weights[i]).collect()
    }
}

/// Redshift binning configuration. Construct through [`RedshiftWeightSpec::new`]
/// or [`RedshiftWeightSpec::from_settings`], which validate the bounds.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct RedshiftWeightSpec {
    min_redshift: f64,
    max_redshift: f64,
    num_bins: usize,
    min_bin_count: f64,
    redshift_key: String,
    group_key: Option<String>,
}

impl RedshiftWeightSpec {
    pub fn new(
        min_redshift: f64,
        max_redshift: f64,
        num_bins: usize,
        min_bin_count: f64,
        redshift_key: &str,
        group_key: Option<&str>,
    ) -> Result<Self> {
        if !(min_redshift > 0.0) || !max_redshift.is_finite() {
            return Err(ClassifierError::InvalidWeightSpec(format!(
                "Redshift bounds must be positive and finite, got [{}, {}]",
                min_redshift, max_redshift
            )));
        }
        if min_redshift >= max_redshift {
            return Err(ClassifierError::InvalidWeightSpec(format!(
                "min_redshift ({}) must be smaller than max_redshift ({})",
                min_redshift, max_redshift
            )));
        }
        if num_bins == 0 {
            return Err(ClassifierError::InvalidWeightSpec(
                "num_bins must be positive".to_string(),
            ));
        }
        if !(min_bin_count >= 0.0) || !min_bin_count.is_finite() {
            return Err(ClassifierError::InvalidWeightSpec(format!(
                "min_bin_count must be a non-negative number, got {}",
                min_bin_count
            )));
        }
        Ok(Self {
            min_redshift,
            max_redshift,
            num_bins,
            min_bin_count,
            redshift_key: redshift_key.to_string(),
            group_key: group_key.map(|g| g.to_string()),
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Self::new(
            settings.redshift_weighting_min_redshift,
            settings.redshift_weighting_max_redshift,
            settings.redshift_weighting_num_bins,
            settings.redshift_weighting_min_bin_count,
            &settings.redshift_weighting_redshift_key,
            settings.redshift_weighting_group_key.as_deref(),
        )
    }

    pub fn redshift_key(&self) -> &str {
        &self.redshift_key
    }

    pub fn group_key(&self) -> Option<&str> {
        self.group_key.as_deref()
    }

    /// Bin edges: a galactic bin below zero, then `num_bins` logarithmic bins
    /// whose outermost edges are pushed out to effectively infinite values.
    pub fn bin_edges(&self) -> Vec<f64> {
        let lo = self.min_redshift.log10();
        let hi = self.max_redshift.log10();
        let step = (hi - lo) / self.num_bins as f64;

        let mut edges = Vec::with_capacity(self.num_bins + 2);
        edges.push(-1e99);
        for i in 0..=self.num_bins {
            edges.push(10f64.powf(lo + step * i as f64));
        }
        edges[1] = 1e-99;
        edges[self.num_bins + 1] = 1e99;
        edges
    }

    /// Total number of bins, including the galactic one.
    pub fn total_bins(&self) -> usize {
        self.num_bins + 1
    }
}

/// Index of the left-closed bin containing `redshift`. Values on an edge land
/// in the bin that edge opens. NaN redshifts go to the last bin.
pub fn redshift_bin_index(edges: &[f64], redshift: f64) -> usize {
    let last = edges.len() - 2;
    if redshift.is_nan() {
        return last;
    }
    let insertion = edges.partition_point(|&edge| edge <= redshift);
    insertion.saturating_sub(1).min(last)
}

/// How object weights are derived from the metadata.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum WeightingPolicy {
    /// Every object has weight 1.
    Uniform,
    /// Every class gets the same total weight.
    Flat,
    /// Every class gets the same total weight in every (group, redshift bin).
    Redshift(RedshiftWeightSpec),
}

/// A weighting policy together with optional class multipliers.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct WeightSpec {
    policy: WeightingPolicy,
    class_weights: Option<ClassWeights>,
}

impl WeightSpec {
    pub fn new(policy: WeightingPolicy, class_weights: Option<ClassWeights>) -> Result<Self> {
        if let Some(class_weights) = &class_weights {
            for (class_name, multiplier) in class_weights {
                if !(*multiplier >= 0.0) || !multiplier.is_finite() {
                    return Err(ClassifierError::InvalidWeightSpec(format!(
                        "Class weight for {} must be a non-negative number, got {}",
                        class_name, multiplier
                    )));
                }
            }
        }
        Ok(Self {
            policy,
            class_weights,
        })
    }

    pub fn uniform() -> Self {
        Self {
            policy: WeightingPolicy::Uniform,
            class_weights: None,
        }
    }

    pub fn flat() -> Self {
        Self {
            policy: WeightingPolicy::Flat,
            class_weights: None,
        }
    }

    pub fn policy(&self) -> &WeightingPolicy {
        &self.policy
    }

    pub fn class_weights(&self) -> Option<&ClassWeights> {
        self.class_weights.as_ref()
    }

    pub fn evaluate(&self, metadata: &MetadataTable) -> Result<ObjectWeights> {
        match &self.policy {
            WeightingPolicy::Uniform => {
                ObjectWeights::new(metadata.object_ids().to_vec(), vec![1.0; metadata.len()])
            }
            WeightingPolicy::Flat => evaluate_weights_flat(metadata, self.class_weights.as_ref()),
            WeightingPolicy::Redshift(spec) => {
                evaluate_weights_redshift(metadata, spec, self.class_weights.as_ref())
            }
        }
    }
}

impl Default for WeightSpec {
    fn default() -> Self {
        Self::flat()
    }
}

/// Look up the multiplier of a class present in the data. An explicit mapping
/// must name every such class.
fn class_multiplier(class_weights: Option<&ClassWeights>, class_name: &str) -> Result<f64> {
    match class_weights {
        None => Ok(1.0),
        Some(weights) => weights.get(class_name).copied().ok_or_else(|| {
            ClassifierError::InvalidWeightSpec(format!(
                "No class weight given for class {}",
                class_name
            ))
        }),
    }
}

/// Normalize every class to the same total weight, with the same weight for
/// every object in a class, then apply the class multipliers.
///
/// The weight of an object of class `c` is `multiplier(c) * N / count(c)`.
pub fn evaluate_weights_flat(
    metadata: &MetadataTable,
    class_weights: Option<&ClassWeights>,
) -> Result<ObjectWeights> {
    let object_classes = metadata.classes();
    let total = object_classes.len() as f64;

    let mut class_counts: HashMap<&str, usize> = HashMap::new();
    for class_name in object_classes {
        *class_counts.entry(class_name.as_str()).or_insert(0) += 1;
    }

    let mut norm_class_weights: HashMap<&str, f64> = HashMap::with_capacity(class_counts.len());
    for (&class_name, &count) in &class_counts {
        let multiplier = class_multiplier(class_weights, class_name)?;
        norm_class_weights.insert(class_name, multiplier * total / count as f64);
    }

    let weights = object_classes
        .iter()
        .map(|c| norm_class_weights[c.as_str()])
        .collect();

    log::trace!(
        "Flat weights for {} objects over {} classes",
        object_classes.len(),
        class_counts.len()
    );

    ObjectWeights::new(metadata.object_ids().to_vec(), weights)
}

/// Map labels to dense indices over their sorted unique values.
fn dense_indices(labels: &[String]) -> (Vec<String>, Vec<usize>) {
    let mut names = labels.to_vec();
    names.sort();
    names.dedup();
    let lookup: HashMap<&str, usize> = names
        .iter()
        .enumerate()
        .map(|(i, n)| (n.as_str(), i))
        .collect();
    let indices = labels.iter().map(|l| lookup[l.as_str()]).collect();
    (names, indices)
}

/// Class-balance the objects independently in every (group, redshift bin).
///
/// Cell weights are `N / max(count, min_bin_count)`. Classes that mostly
/// live outside the galactic bin are spread over many cells, so their weights
/// are divided by the number of populated non-galactic cells per
/// extragalactic class to keep their total weight comparable to galactic
/// classes.
pub fn evaluate_weights_redshift(
    metadata: &MetadataTable,
    spec: &RedshiftWeightSpec,
    class_weights: Option<&ClassWeights>,
) -> Result<ObjectWeights> {
    let redshifts = metadata.numeric_column(&spec.redshift_key)?;
    let edges = spec.bin_edges();
    let num_redshift_bins = spec.total_bins();

    let redshift_indices: Vec<usize> = redshifts
        .iter()
        .map(|&z| redshift_bin_index(&edges, z))
        .collect();

    let (class_names, class_indices) = dense_indices(metadata.classes());
    let num_classes = class_names.len();

    let (num_groups, group_indices) = match &spec.group_key {
        Some(key) => {
            let (group_names, indices) = dense_indices(&metadata.group_labels(key)?);
            (group_names.len(), indices)
        }
        None => (1, vec![0; metadata.len()]),
    };

    let cell = |g: usize, b: usize, c: usize| (g * num_redshift_bins + b) * num_classes + c;

    let mut counts = vec![0f64; num_groups * num_redshift_bins * num_classes];
    for i in 0..metadata.len() {
        counts[cell(group_indices[i], redshift_indices[i], class_indices[i])] += 1.0;
    }
    let total_counts: f64 = counts.iter().sum();

    let mut num_extgal_bins = 0usize;
    let mut class_extgal_counts = vec![0f64; num_classes];
    let mut class_gal_counts = vec![0f64; num_classes];
    for g in 0..num_groups {
        for c in 0..num_classes {
            class_gal_counts[c] += counts[cell(g, 0, c)];
            for b in 1..num_redshift_bins {
                let count = counts[cell(g, b, c)];
                class_extgal_counts[c] += count;
                if count > EXTGAL_OCCUPANCY_FRACTION * total_counts {
                    num_extgal_bins += 1;
                }
            }
        }
    }
    let extgal_mask: Vec<bool> = (0..num_classes)
        .map(|c| class_extgal_counts[c] > class_gal_counts[c])
        .collect();
    let num_extgal_classes = extgal_mask.iter().filter(|&&m| m).count();

    let extgal_scale = if num_extgal_classes == 0 || num_extgal_bins == 0 {
        1.0
    } else {
        num_extgal_bins as f64 / num_extgal_classes as f64
    };

    log::debug!(
        "Redshift weighting: {} populated extragalactic cells, {} extragalactic classes, scale {:.3}",
        num_extgal_bins,
        num_extgal_classes,
        extgal_scale
    );

    let multipliers = class_names
        .iter()
        .map(|name| class_multiplier(class_weights, name))
        .collect::<Result<Vec<f64>>>()?;

    let mut cell_weights: Vec<f64> = counts
        .iter()
        .map(|&count| total_counts / count.max(spec.min_bin_count))
        .collect();
    for g in 0..num_groups {
        for b in 0..num_redshift_bins {
            for c in 0..num_classes {
                let w = &mut cell_weights[cell(g, b, c)];
                if extgal_mask[c] {
                    *w /= extgal_scale;
                }
                *w *= multipliers[c];
            }
        }
    }

    let weights = (0..metadata.len())
        .map(|i| cell_weights[cell(group_indices[i], redshift_indices[i], class_indices[i])])
        .collect();

    ObjectWeights::new(metadata.object_ids().to_vec(), weights)
}
