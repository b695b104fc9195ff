//! Subtype classification over extracted feature vectors
//!
//! Two modes share one trained-classifier interface: supervised
//! nearest-centroid assignment against labeled training patients, and
//! unsupervised k-means clustering when no labels exist. Both operate in
//! z-score standardized feature space so that features on different scales
//! (a peak amplitude versus a duration) contribute comparably to the
//! distance.

use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClassifierError {
    #[error("No training samples with defined features")]
    EmptyTrainingSet,
    #[error("Class {label} has {count} training examples, need at least {required}")]
    InsufficientData {
        label: String,
        count: usize,
        required: usize,
    },
    #[error("Feature vector has {got} entries, classifier was trained on {expected}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("Need at least {needed} samples for {needed} clusters, got {got}")]
    TooFewSamples { needed: usize, got: usize },
}

/// How the cohort's feature matrix is turned into assignments.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum ClassifierMode {
    /// Nearest-centroid against labeled training patients.
    Supervised { min_examples_per_class: usize },
    /// Seeded k-means over the whole cohort.
    Unsupervised {
        clusters: usize,
        seed: u64,
        max_iterations: usize,
    },
}

impl ClassifierMode {
    pub fn supervised() -> Self {
        ClassifierMode::Supervised {
            min_examples_per_class: 2,
        }
    }

    pub fn unsupervised(clusters: usize) -> Self {
        ClassifierMode::Unsupervised {
            clusters,
            seed: 0,
            max_iterations: 100,
        }
    }
}

/// One patient's classification outcome.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Assignment {
    /// Supervised: a subtype label with a confidence in (0, 1]. A patient
    /// exactly on a centroid gets confidence 1.
    Subtype { label: String, confidence: f64 },
    /// Unsupervised: a cluster index with a cohesion score in [0, 1]
    /// measuring how much closer the patient is to its own cluster than to
    /// the next one.
    Cluster { id: usize, cohesion: f64 },
}

/// Per-feature z-score scaling fitted on the training matrix.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Standardizer {
    mean: Vec<f64>,
    std: Vec<f64>,
}

impl Standardizer {
    fn fit(data: &Array2<f64>) -> Self {
        let mean = data
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(data.ncols()));
        let mut std = data.std_axis(Axis(0), 0.0);
        // Constant features carry no signal; unit scale keeps them inert.
        for v in std.iter_mut() {
            if *v == 0.0 {
                *v = 1.0;
            }
        }
        Standardizer {
            mean: mean.to_vec(),
            std: std.to_vec(),
        }
    }

    fn transform(&self, features: &[f64]) -> Vec<f64> {
        features
            .iter()
            .zip(self.mean.iter().zip(self.std.iter()))
            .map(|(&x, (&m, &s))| (x - m) / s)
            .collect()
    }
}

fn euclidean(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

fn check_dims(rows: &[Vec<f64>]) -> Result<usize, ClassifierError> {
    let dim = rows[0].len();
    for row in rows {
        if row.len() != dim {
            return Err(ClassifierError::DimensionMismatch {
                expected: dim,
                got: row.len(),
            });
        }
    }
    Ok(dim)
}

fn to_matrix(rows: &[Vec<f64>], dim: usize) -> Array2<f64> {
    let mut data = Array2::zeros((rows.len(), dim));
    for (i, row) in rows.iter().enumerate() {
        for (j, &v) in row.iter().enumerate() {
            data[(i, j)] = v;
        }
    }
    data
}

/// Supervised nearest-centroid classifier.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NearestCentroid {
    standardizer: Standardizer,
    labels: Vec<String>,
    centroids: Vec<Vec<f64>>,
}

impl NearestCentroid {
    /// Fit per-class centroids in standardized feature space.
    pub fn fit(
        labeled: &[(String, Vec<f64>)],
        min_examples_per_class: usize,
    ) -> Result<Self, ClassifierError> {
        if labeled.is_empty() {
            return Err(ClassifierError::EmptyTrainingSet);
        }
        let rows: Vec<Vec<f64>> = labeled.iter().map(|(_, f)| f.clone()).collect();
        let dim = check_dims(&rows)?;

        // BTreeMap keeps label order deterministic regardless of input order.
        let mut by_label: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (i, (label, _)) in labeled.iter().enumerate() {
            by_label.entry(label).or_default().push(i);
        }
        for (label, members) in &by_label {
            if members.len() < min_examples_per_class {
                return Err(ClassifierError::InsufficientData {
                    label: label.to_string(),
                    count: members.len(),
                    required: min_examples_per_class,
                });
            }
        }

        let standardizer = Standardizer::fit(&to_matrix(&rows, dim));
        let standardized: Vec<Vec<f64>> = rows.iter().map(|r| standardizer.transform(r)).collect();

        let mut labels = Vec::with_capacity(by_label.len());
        let mut centroids = Vec::with_capacity(by_label.len());
        for (label, members) in &by_label {
            let mut centroid = vec![0.0; dim];
            for &i in members {
                for (c, &v) in centroid.iter_mut().zip(standardized[i].iter()) {
                    *c += v;
                }
            }
            for c in &mut centroid {
                *c /= members.len() as f64;
            }
            labels.push(label.to_string());
            centroids.push(centroid);
        }

        Ok(NearestCentroid {
            standardizer,
            labels,
            centroids,
        })
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Assign the nearest subtype with a margin-based confidence.
    pub fn classify(&self, features: &[f64]) -> Result<Assignment, ClassifierError> {
        let dim = self.standardizer.mean.len();
        if features.len() != dim {
            return Err(ClassifierError::DimensionMismatch {
                expected: dim,
                got: features.len(),
            });
        }
        let z = self.standardizer.transform(features);
        let distances: Vec<f64> = self.centroids.iter().map(|c| euclidean(&z, c)).collect();

        let mut own = 0;
        for (i, &d) in distances.iter().enumerate() {
            if d < distances[own] {
                own = i;
            }
        }
        let d_own = distances[own];
        let d_other = distances
            .iter()
            .enumerate()
            .filter(|&(i, _)| i != own)
            .map(|(_, &d)| d)
            .fold(f64::INFINITY, f64::min);

        let confidence = if !d_other.is_finite() || d_own == 0.0 {
            1.0
        } else {
            d_other / (d_own + d_other)
        };
        Ok(Assignment::Subtype {
            label: self.labels[own].clone(),
            confidence,
        })
    }
}

/// Unsupervised k-means with deterministic seeded initialization.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KMeans {
    standardizer: Standardizer,
    centroids: Vec<Vec<f64>>,
}

impl KMeans {
    pub fn fit(
        samples: &[Vec<f64>],
        clusters: usize,
        seed: u64,
        max_iterations: usize,
    ) -> Result<Self, ClassifierError> {
        if samples.is_empty() || clusters == 0 {
            return Err(ClassifierError::EmptyTrainingSet);
        }
        if samples.len() < clusters {
            return Err(ClassifierError::TooFewSamples {
                needed: clusters,
                got: samples.len(),
            });
        }
        let dim = check_dims(samples)?;
        let n = samples.len();

        let standardizer = Standardizer::fit(&to_matrix(samples, dim));
        let points: Vec<Vec<f64>> = samples.iter().map(|r| standardizer.transform(r)).collect();

        let mut rng = StdRng::seed_from_u64(seed);
        let mut picked: Vec<usize> = Vec::with_capacity(clusters);
        while picked.len() < clusters {
            let i = rng.random_range(0..n);
            if !picked.contains(&i) {
                picked.push(i);
            }
        }
        let mut centroids: Vec<Vec<f64>> = picked.iter().map(|&i| points[i].clone()).collect();

        let mut assignment = vec![0usize; n];
        for _ in 0..max_iterations {
            let mut changed = false;
            for (i, p) in points.iter().enumerate() {
                let nearest = nearest_index(p, &centroids);
                if assignment[i] != nearest {
                    assignment[i] = nearest;
                    changed = true;
                }
            }

            let mut sums = vec![vec![0.0; dim]; clusters];
            let mut counts = vec![0usize; clusters];
            for (i, p) in points.iter().enumerate() {
                counts[assignment[i]] += 1;
                for (s, &v) in sums[assignment[i]].iter_mut().zip(p.iter()) {
                    *s += v;
                }
            }
            for c in 0..clusters {
                if counts[c] == 0 {
                    // Reseed the empty cluster to the point farthest from
                    // its current centroid.
                    let far = points
                        .iter()
                        .enumerate()
                        .map(|(i, p)| (i, euclidean(p, &centroids[assignment[i]])))
                        .max_by(|a, b| a.1.total_cmp(&b.1))
                        .map(|(i, _)| i)
                        .unwrap_or(0);
                    centroids[c] = points[far].clone();
                    changed = true;
                } else {
                    for (j, s) in sums[c].iter().enumerate() {
                        centroids[c][j] = s / counts[c] as f64;
                    }
                }
            }

            if !changed {
                break;
            }
        }

        Ok(KMeans {
            standardizer,
            centroids,
        })
    }

    pub fn clusters(&self) -> usize {
        self.centroids.len()
    }

    /// Assign the nearest cluster with a separation-based cohesion score.
    pub fn classify(&self, features: &[f64]) -> Result<Assignment, ClassifierError> {
        let dim = self.standardizer.mean.len();
        if features.len() != dim {
            return Err(ClassifierError::DimensionMismatch {
                expected: dim,
                got: features.len(),
            });
        }
        let z = self.standardizer.transform(features);
        let distances: Vec<f64> = self.centroids.iter().map(|c| euclidean(&z, c)).collect();
        let own = nearest_index(&z, &self.centroids);
        let d_own = distances[own];
        let d_next = distances
            .iter()
            .enumerate()
            .filter(|&(i, _)| i != own)
            .map(|(_, &d)| d)
            .fold(f64::INFINITY, f64::min);

        let cohesion = if !d_next.is_finite() || d_next == 0.0 {
            1.0
        } else {
            (1.0 - d_own / d_next).clamp(0.0, 1.0)
        };
        Ok(Assignment::Cluster { id: own, cohesion })
    }
}

fn nearest_index(point: &[f64], centroids: &[Vec<f64>]) -> usize {
    let mut best = 0;
    let mut best_d = f64::INFINITY;
    for (i, c) in centroids.iter().enumerate() {
        let d = euclidean(point, c);
        if d < best_d {
            best = i;
            best_d = d;
        }
    }
    best
}

/// A fitted classifier in either mode, ready to assign held-out patients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TrainedClassifier {
    Subtypes(NearestCentroid),
    Clusters(KMeans),
}

impl TrainedClassifier {
    /// Fit from per-patient `(label, features)` pairs. Supervised mode
    /// trains on the labeled subset only; unsupervised mode clusters every
    /// sample and ignores labels.
    pub fn fit(
        mode: &ClassifierMode,
        samples: &[(Option<String>, Vec<f64>)],
    ) -> Result<Self, ClassifierError> {
        match mode {
            ClassifierMode::Supervised {
                min_examples_per_class,
            } => {
                let labeled: Vec<(String, Vec<f64>)> = samples
                    .iter()
                    .filter_map(|(label, f)| label.clone().map(|l| (l, f.clone())))
                    .collect();
                if labeled.is_empty() {
                    return Err(ClassifierError::EmptyTrainingSet);
                }
                NearestCentroid::fit(&labeled, *min_examples_per_class)
                    .map(TrainedClassifier::Subtypes)
            }
            ClassifierMode::Unsupervised {
                clusters,
                seed,
                max_iterations,
            } => {
                let rows: Vec<Vec<f64>> = samples.iter().map(|(_, f)| f.clone()).collect();
                KMeans::fit(&rows, *clusters, *seed, *max_iterations)
                    .map(TrainedClassifier::Clusters)
            }
        }
    }

    pub fn classify(&self, features: &[f64]) -> Result<Assignment, ClassifierError> {
        match self {
            TrainedClassifier::Subtypes(nc) => nc.classify(features),
            TrainedClassifier::Clusters(km) => km.classify(features),
        }
    }
}
