//! Regression-tree trainers.
//!
//! Three model families share one variance-reduction CART base learner:
//! a single CART, a bagged random forest, and gradient tree boosting.
//! A `Regressor` is configured once and makes a one-shot transition to a
//! [`TrainedModel`] through [`Regressor::train`]; there is no retraining
//! and no incremental update. The trained model is bound to its predictor
//! band list and is a pure function from feature vectors to heights.

use std::collections::HashMap;

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::config::{CartParams, GradientBoostParams, RandomForestParams};
use crate::types::{BandStack, ChError, ChResult, ModelFamily, Raster, ReferenceTable};

/// One node of a regression tree.
#[derive(Debug, Clone)]
enum Node {
    Leaf {
        value: f32,
    },
    Split {
        feature: usize,
        threshold: f32,
        left: Box<Node>,
        right: Box<Node>,
    },
}

/// A single fitted regression tree.
#[derive(Debug, Clone)]
pub struct RegressionTree {
    root: Node,
}

impl RegressionTree {
    pub fn predict(&self, features: &[f32]) -> f32 {
        let mut node = &self.root;
        loop {
            match node {
                Node::Leaf { value } => return *value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    node = if features[*feature] <= *threshold {
                        left
                    } else {
                        right
                    };
                }
            }
        }
    }
}

/// Shared growth limits for the base learner.
#[derive(Debug, Clone, Copy)]
struct GrowthLimits {
    min_leaf: usize,
    /// Remaining node budget; `None` is unbounded.
    max_nodes: Option<usize>,
    /// Features considered per split; `None` tries all.
    variables_per_split: Option<usize>,
}

struct TreeBuilder<'a> {
    features: &'a [Vec<f32>],
    labels: &'a [f32],
    limits: GrowthLimits,
    num_features: usize,
    nodes_used: usize,
    importances: Vec<f64>,
    rng: StdRng,
}

impl<'a> TreeBuilder<'a> {
    fn new(features: &'a [Vec<f32>], labels: &'a [f32], limits: GrowthLimits, seed: u64) -> Self {
        let num_features = features.first().map_or(0, Vec::len);
        Self {
            features,
            labels,
            limits,
            num_features,
            nodes_used: 1, // the root
            importances: vec![0.0; num_features],
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn fit(mut self, indices: Vec<usize>) -> (RegressionTree, Vec<f64>) {
        let root = self.grow(indices);
        (RegressionTree { root }, self.importances)
    }

    fn grow(&mut self, indices: Vec<usize>) -> Node {
        let mean = mean(self.labels, &indices);
        if indices.len() < 2 * self.limits.min_leaf {
            return Node::Leaf { value: mean };
        }
        if let Some(max) = self.limits.max_nodes {
            // a split spends two nodes
            if self.nodes_used + 2 > max {
                return Node::Leaf { value: mean };
            }
        }
        let Some(best) = self.best_split(&indices) else {
            return Node::Leaf { value: mean };
        };

        self.nodes_used += 2;
        self.importances[best.feature] += best.gain;

        let (left_idx, right_idx): (Vec<usize>, Vec<usize>) = indices
            .into_iter()
            .partition(|&i| self.features[i][best.feature] <= best.threshold);
        let left = self.grow(left_idx);
        let right = self.grow(right_idx);
        Node::Split {
            feature: best.feature,
            threshold: best.threshold,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    fn candidate_features(&mut self) -> Vec<usize> {
        match self.limits.variables_per_split {
            Some(m) if m < self.num_features => {
                rand::seq::index::sample(&mut self.rng, self.num_features, m).into_vec()
            }
            _ => (0..self.num_features).collect(),
        }
    }

    fn best_split(&mut self, indices: &[usize]) -> Option<SplitCandidate> {
        let total_sum: f64 = indices.iter().map(|&i| self.labels[i] as f64).sum();
        let total_sq: f64 = indices
            .iter()
            .map(|&i| (self.labels[i] as f64).powi(2))
            .sum();
        let n = indices.len() as f64;
        let parent_sse = total_sq - total_sum * total_sum / n;
        if parent_sse <= 1e-12 {
            return None; // already pure
        }

        let mut best: Option<SplitCandidate> = None;
        for feature in self.candidate_features() {
            let mut order: Vec<usize> = indices.to_vec();
            order.sort_by(|&a, &b| {
                self.features[a][feature]
                    .partial_cmp(&self.features[b][feature])
                    .unwrap_or(std::cmp::Ordering::Equal)
            });

            let mut left_sum = 0.0f64;
            let mut left_sq = 0.0f64;
            for (k, &i) in order.iter().enumerate().take(order.len() - 1) {
                let y = self.labels[i] as f64;
                left_sum += y;
                left_sq += y * y;
                let left_n = (k + 1) as f64;
                let right_n = n - left_n;
                if (k + 1) < self.limits.min_leaf || (order.len() - k - 1) < self.limits.min_leaf
                {
                    continue;
                }
                let here = self.features[i][feature];
                let next = self.features[order[k + 1]][feature];
                if next <= here {
                    continue; // no threshold separates equal values
                }
                let right_sum = total_sum - left_sum;
                let right_sq = total_sq - left_sq;
                let sse = (left_sq - left_sum * left_sum / left_n)
                    + (right_sq - right_sum * right_sum / right_n);
                let gain = parent_sse - sse;
                if gain > best.as_ref().map_or(1e-12, |b| b.gain) {
                    best = Some(SplitCandidate {
                        feature,
                        threshold: (here + next) / 2.0,
                        gain,
                    });
                }
            }
        }
        best
    }
}

struct SplitCandidate {
    feature: usize,
    threshold: f32,
    gain: f64,
}

fn mean(labels: &[f32], indices: &[usize]) -> f32 {
    if indices.is_empty() {
        return 0.0;
    }
    indices.iter().map(|&i| labels[i]).sum::<f32>() / indices.len() as f32
}

/// How tree outputs combine into one prediction.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Aggregation {
    /// Mean over trees (CART degenerates to a single-tree mean).
    Mean,
    /// Bias plus shrinkage-weighted sum (boosting).
    WeightedSum { bias: f32, weight: f32 },
}

/// A configured, not-yet-trained regressor.
#[derive(Debug, Clone)]
pub struct Regressor {
    family: ModelFamily,
    rf: RandomForestParams,
    gbm: GradientBoostParams,
    cart: CartParams,
}

impl Regressor {
    pub fn random_forest(params: RandomForestParams) -> Self {
        Self {
            family: ModelFamily::RandomForest,
            rf: params,
            gbm: GradientBoostParams::default(),
            cart: CartParams::default(),
        }
    }

    pub fn gradient_boost(params: GradientBoostParams) -> Self {
        Self {
            family: ModelFamily::GradientTreeBoost,
            rf: RandomForestParams::default(),
            gbm: params,
            cart: CartParams::default(),
        }
    }

    pub fn cart(params: CartParams) -> Self {
        Self {
            family: ModelFamily::Cart,
            rf: RandomForestParams::default(),
            gbm: GradientBoostParams::default(),
            cart: params,
        }
    }

    pub fn family(&self) -> ModelFamily {
        self.family
    }

    /// One-shot transition to a trained model.
    ///
    /// `label` names the label column; `predictors` fixes the predictor
    /// list, and their order must match the band order used at predict
    /// time.
    pub fn train(
        &self,
        training: &ReferenceTable,
        label: &str,
        predictors: &[String],
    ) -> ChResult<TrainedModel> {
        if training.is_empty() {
            return Err(ChError::Training("training set is empty".to_string()));
        }
        if predictors.is_empty() {
            return Err(ChError::Training("predictor list is empty".to_string()));
        }
        let label_idx = training
            .column_index(label)
            .ok_or_else(|| ChError::Training(format!("label column '{label}' not found")))?;
        let predictor_idx: Vec<usize> = predictors
            .iter()
            .map(|name| {
                training.column_index(name).ok_or_else(|| {
                    ChError::Training(format!("predictor column '{name}' not found"))
                })
            })
            .collect::<ChResult<Vec<usize>>>()?;

        let features: Vec<Vec<f32>> = training
            .rows
            .iter()
            .map(|r| predictor_idx.iter().map(|&i| r.values[i]).collect())
            .collect();
        let labels: Vec<f32> = training.rows.iter().map(|r| r.values[label_idx]).collect();
        log::info!(
            "training {:?} on {} samples, {} predictors",
            self.family,
            labels.len(),
            predictors.len()
        );

        let (trees, aggregation, raw_importances) = match self.family {
            ModelFamily::Cart => self.train_cart(&features, &labels),
            ModelFamily::RandomForest => self.train_forest(&features, &labels),
            ModelFamily::GradientTreeBoost => self.train_boost(&features, &labels),
        };

        let importances = normalized_importances(predictors, &raw_importances);
        Ok(TrainedModel {
            family: self.family,
            trees,
            aggregation,
            predictor_names: predictors.to_vec(),
            importances,
        })
    }

    fn train_cart(
        &self,
        features: &[Vec<f32>],
        labels: &[f32],
    ) -> (Vec<RegressionTree>, Aggregation, Vec<f64>) {
        let limits = GrowthLimits {
            min_leaf: self.cart.min_leaf_population,
            max_nodes: self.cart.max_nodes,
            variables_per_split: None,
        };
        let builder = TreeBuilder::new(features, labels, limits, 0);
        let (tree, importances) = builder.fit((0..labels.len()).collect());
        (vec![tree], Aggregation::Mean, importances)
    }

    fn train_forest(
        &self,
        features: &[Vec<f32>],
        labels: &[f32],
    ) -> (Vec<RegressionTree>, Aggregation, Vec<f64>) {
        let n = labels.len();
        let p = features.first().map_or(0, Vec::len);
        let mtry = self
            .rf
            .variables_per_split
            .unwrap_or_else(|| ((p as f64).sqrt().floor() as usize).max(1));
        let bag_size = ((self.rf.bag_fraction * n as f64).ceil() as usize).max(1);
        let limits = GrowthLimits {
            min_leaf: self.rf.min_leaf_population,
            max_nodes: self.rf.max_nodes,
            variables_per_split: Some(mtry),
        };

        let results: Vec<(RegressionTree, Vec<f64>)> = (0..self.rf.number_of_trees)
            .into_par_iter()
            .map(|t| {
                let seed = t as u64;
                let mut rng = StdRng::seed_from_u64(seed);
                let bag: Vec<usize> = (0..bag_size).map(|_| rng.gen_range(0..n)).collect();
                TreeBuilder::new(features, labels, limits, seed).fit(bag)
            })
            .collect();

        let mut trees = Vec::with_capacity(results.len());
        let mut importances = vec![0.0; p];
        for (tree, tree_importance) in results {
            trees.push(tree);
            for (total, part) in importances.iter_mut().zip(&tree_importance) {
                *total += part;
            }
        }
        (trees, Aggregation::Mean, importances)
    }

    fn train_boost(
        &self,
        features: &[Vec<f32>],
        labels: &[f32],
    ) -> (Vec<RegressionTree>, Aggregation, Vec<f64>) {
        // The configured loss is accepted but not applied; boosting always
        // minimizes squared error. See DESIGN.md.
        log::debug!("GBM loss '{}' accepted but not applied", self.gbm.loss);

        let n = labels.len();
        let p = features.first().map_or(0, Vec::len);
        let bias = labels.iter().sum::<f32>() / n as f32;
        let subsample = ((self.gbm.sampling_rate * n as f64).floor() as usize).clamp(1, n);
        let shrinkage = self.gbm.shrinkage as f32;
        let limits = GrowthLimits {
            min_leaf: 1,
            max_nodes: self.gbm.max_nodes,
            variables_per_split: None,
        };

        let mut predictions = vec![bias; n];
        let mut residuals = vec![0.0f32; n];
        let mut trees = Vec::with_capacity(self.gbm.number_of_trees);
        let mut importances = vec![0.0; p];
        for t in 0..self.gbm.number_of_trees {
            for i in 0..n {
                residuals[i] = labels[i] - predictions[i];
            }
            let seed = t as u64;
            let mut rng = StdRng::seed_from_u64(seed);
            let bag = if subsample < n {
                rand::seq::index::sample(&mut rng, n, subsample).into_vec()
            } else {
                (0..n).collect()
            };
            let (tree, tree_importance) =
                TreeBuilder::new(features, &residuals, limits, seed).fit(bag);
            for (i, prediction) in predictions.iter_mut().enumerate() {
                *prediction += shrinkage * tree.predict(&features[i]);
            }
            for (total, part) in importances.iter_mut().zip(&tree_importance) {
                *total += part;
            }
            trees.push(tree);
        }
        (
            trees,
            Aggregation::WeightedSum {
                bias,
                weight: shrinkage,
            },
            importances,
        )
    }
}

fn normalized_importances(predictors: &[String], raw: &[f64]) -> HashMap<String, f64> {
    let total: f64 = raw.iter().sum();
    predictors
        .iter()
        .zip(raw)
        .map(|(name, &v)| {
            let scaled = if total > 0.0 { v / total } else { 0.0 };
            (name.clone(), scaled)
        })
        .collect()
}

/// A trained regressor: an opaque, stateless predictor bound to its
/// predictor band list.
#[derive(Debug, Clone)]
pub struct TrainedModel {
    family: ModelFamily,
    trees: Vec<RegressionTree>,
    aggregation: Aggregation,
    predictor_names: Vec<String>,
    importances: HashMap<String, f64>,
}

impl TrainedModel {
    pub fn family(&self) -> ModelFamily {
        self.family
    }

    pub fn predictor_names(&self) -> &[String] {
        &self.predictor_names
    }

    /// Relative importance per predictor, from accumulated split gains.
    pub fn importances(&self) -> &HashMap<String, f64> {
        &self.importances
    }

    /// Predict one feature vector, ordered like the predictor list.
    pub fn predict(&self, features: &[f32]) -> f32 {
        match self.aggregation {
            Aggregation::Mean => {
                let sum: f32 = self.trees.iter().map(|t| t.predict(features)).sum();
                sum / self.trees.len() as f32
            }
            Aggregation::WeightedSum { bias, weight } => {
                bias + weight
                    * self
                        .trees
                        .iter()
                        .map(|t| t.predict(features))
                        .sum::<f32>()
            }
        }
    }

    /// Apply the model to every pixel of the band stack, producing the
    /// canopy-height prediction raster. Pixels missing any predictor stay
    /// no-data; no further masking is applied.
    pub fn classify(&self, stack: &BandStack) -> ChResult<Raster> {
        let indices: Vec<usize> = self
            .predictor_names
            .iter()
            .map(|name| {
                stack.band_index(name).ok_or_else(|| {
                    ChError::BandStack(format!(
                        "stack is missing predictor band '{name}' the model was trained on"
                    ))
                })
            })
            .collect::<ChResult<Vec<usize>>>()?;

        let grid = *stack.grid();
        let rows: Vec<Vec<f32>> = (0..grid.rows)
            .into_par_iter()
            .map(|row| {
                let mut out = vec![f32::NAN; grid.cols];
                let mut features = vec![0.0f32; indices.len()];
                for (col, slot) in out.iter_mut().enumerate() {
                    let values = stack.pixel_values(row, col);
                    let mut complete = true;
                    for (k, &band) in indices.iter().enumerate() {
                        let v = values[band];
                        if v.is_nan() {
                            complete = false;
                            break;
                        }
                        features[k] = v;
                    }
                    if complete {
                        *slot = self.predict(&features);
                    }
                }
                out
            })
            .collect();

        let flat: Vec<f32> = rows.into_iter().flatten().collect();
        let data = Array2::from_shape_vec((grid.rows, grid.cols), flat)
            .map_err(|e| ChError::BandStack(e.to_string()))?;
        Raster::from_band(grid, data)
    }

    /// Predict each table row, pairing observed label with prediction.
    pub fn classify_table(&self, table: &ReferenceTable, label: &str) -> ChResult<Vec<(f32, f32)>> {
        let label_idx = table
            .column_index(label)
            .ok_or_else(|| ChError::Training(format!("label column '{label}' not found")))?;
        let indices: Vec<usize> = self
            .predictor_names
            .iter()
            .map(|name| {
                table.column_index(name).ok_or_else(|| {
                    ChError::Training(format!("predictor column '{name}' not found"))
                })
            })
            .collect::<ChResult<Vec<usize>>>()?;

        Ok(table
            .rows
            .iter()
            .map(|r| {
                let features: Vec<f32> = indices.iter().map(|&i| r.values[i]).collect();
                (r.values[label_idx], self.predict(&features))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SampleRecord;
    use approx::assert_relative_eq;

    /// rh = 2 * B4 + noiseless offset, two informative-free columns.
    fn table(n: usize) -> ReferenceTable {
        let mut table = ReferenceTable::new(vec![
            "B4".to_string(),
            "VH".to_string(),
            "rh".to_string(),
        ]);
        for i in 0..n {
            let x = i as f32 / n as f32 * 10.0;
            table.rows.push(SampleRecord {
                x: i as f64,
                y: 0.0,
                values: vec![x, 0.5, 2.0 * x + 1.0],
                random: 0.0,
            });
        }
        table
    }

    fn predictors() -> Vec<String> {
        vec!["B4".to_string(), "VH".to_string()]
    }

    #[test]
    fn cart_fits_monotone_function() {
        let model = Regressor::cart(CartParams::default())
            .train(&table(200), "rh", &predictors())
            .unwrap();
        let low = model.predict(&[1.0, 0.5]);
        let high = model.predict(&[9.0, 0.5]);
        assert!(low < high);
        assert_relative_eq!(low, 3.0, epsilon = 1.0);
        assert_relative_eq!(high, 19.0, epsilon = 1.0);
    }

    #[test]
    fn cart_max_nodes_limits_growth() {
        let stump = Regressor::cart(CartParams {
            max_nodes: Some(3),
            min_leaf_population: 1,
        })
        .train(&table(200), "rh", &predictors())
        .unwrap();
        // One split only: exactly two distinct outputs.
        let mut outputs: Vec<f32> = (0..100)
            .map(|i| stump.predict(&[i as f32 / 10.0, 0.5]))
            .collect();
        outputs.sort_by(|a, b| a.partial_cmp(b).unwrap());
        outputs.dedup();
        assert!(outputs.len() <= 2);
    }

    #[test]
    fn forest_training_is_deterministic() {
        let params = RandomForestParams {
            number_of_trees: 10,
            ..RandomForestParams::default()
        };
        let a = Regressor::random_forest(params.clone())
            .train(&table(100), "rh", &predictors())
            .unwrap();
        let b = Regressor::random_forest(params)
            .train(&table(100), "rh", &predictors())
            .unwrap();
        for x in [0.5f32, 3.0, 7.5] {
            assert_eq!(a.predict(&[x, 0.5]), b.predict(&[x, 0.5]));
        }
    }

    #[test]
    fn forest_importance_favors_informative_band() {
        let model = Regressor::random_forest(RandomForestParams {
            number_of_trees: 20,
            ..RandomForestParams::default()
        })
        .train(&table(200), "rh", &predictors())
        .unwrap();
        let importances = model.importances();
        assert!(importances["B4"] > importances["VH"]);
        let sum: f64 = importances.values().sum();
        assert_relative_eq!(sum, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn boosting_reduces_error_over_iterations() {
        let few = Regressor::gradient_boost(GradientBoostParams {
            number_of_trees: 1,
            shrinkage: 0.3,
            ..GradientBoostParams::default()
        })
        .train(&table(200), "rh", &predictors())
        .unwrap();
        let many = Regressor::gradient_boost(GradientBoostParams {
            number_of_trees: 40,
            shrinkage: 0.3,
            ..GradientBoostParams::default()
        })
        .train(&table(200), "rh", &predictors())
        .unwrap();
        let sse = |m: &TrainedModel| -> f32 {
            (0..50)
                .map(|i| {
                    let x = i as f32 / 5.0;
                    let err = m.predict(&[x, 0.5]) - (2.0 * x + 1.0);
                    err * err
                })
                .sum()
        };
        assert!(sse(&many) < sse(&few));
    }

    #[test]
    fn empty_training_set_is_an_error() {
        let empty = ReferenceTable::new(vec!["B4".to_string(), "rh".to_string()]);
        let result = Regressor::cart(CartParams::default()).train(
            &empty,
            "rh",
            &["B4".to_string()],
        );
        assert!(matches!(result, Err(ChError::Training(_))));
    }

    #[test]
    fn missing_label_column_is_an_error() {
        let result = Regressor::cart(CartParams::default()).train(
            &table(10),
            "height",
            &predictors(),
        );
        assert!(matches!(result, Err(ChError::Training(_))));
    }

    #[test]
    fn constant_labels_collapse_to_single_leaf() {
        let mut t = table(50);
        let rh = t.column_index("rh").unwrap();
        for r in &mut t.rows {
            r.values[rh] = 7.0;
        }
        let model = Regressor::cart(CartParams::default())
            .train(&t, "rh", &predictors())
            .unwrap();
        assert_relative_eq!(model.predict(&[0.0, 0.5]), 7.0);
        assert_relative_eq!(model.predict(&[100.0, 0.5]), 7.0);
    }

    #[test]
    fn classify_missing_band_is_structured_error() {
        use crate::types::{Aoi, BandStack};
        use ndarray::Array2;
        let model = Regressor::cart(CartParams::default())
            .train(&table(50), "rh", &predictors())
            .unwrap();
        let grid = Aoi::rectangle(0.0, 0.0, 30.0, 30.0)
            .unwrap()
            .grid(10.0)
            .unwrap();
        let mut stack = BandStack::new(grid);
        stack
            .push_band("B4", Array2::from_elem((3, 3), 1.0))
            .unwrap();
        assert!(matches!(
            model.classify(&stack),
            Err(ChError::BandStack(_))
        ));
    }

    #[test]
    fn classify_predicts_everywhere_bands_are_complete() {
        use crate::types::{Aoi, BandStack};
        use ndarray::Array2;
        let model = Regressor::cart(CartParams::default())
            .train(&table(200), "rh", &predictors())
            .unwrap();
        let grid = Aoi::rectangle(0.0, 0.0, 30.0, 30.0)
            .unwrap()
            .grid(10.0)
            .unwrap();
        let mut b4 = Array2::from_elem((3, 3), 5.0f32);
        b4[[0, 0]] = f32::NAN;
        let mut stack = BandStack::new(grid);
        stack.push_band("B4", b4).unwrap();
        stack
            .push_band("VH", Array2::from_elem((3, 3), 0.5))
            .unwrap();
        let prediction = model.classify(&stack).unwrap();
        assert!(prediction.data[[0, 0]].is_nan());
        assert_relative_eq!(prediction.data[[1, 1]], 11.0, epsilon = 1.5);
    }
}
