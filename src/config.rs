//! Run configuration.
//!
//! One explicit struct enumerates every option the mapper understands: AOI,
//! date windows, mask and model selection, label aggregation, and the full
//! hyperparameter set of all three model families. Validation happens once,
//! up front; the pipeline itself assumes a valid configuration.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::types::{Aoi, ChError, ChResult, GediAggregation, MaskMode, ModelFamily};

/// GEDI relative-height metrics a label can be drawn from.
pub const HEIGHT_METRICS: [&str; 8] = [
    "rh10", "rh25", "rh50", "rh75", "rh90", "rh95", "rh98", "rh100",
];

/// Random Forest hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForestParams {
    pub number_of_trees: usize,
    /// Predictors tried per split; `None` means floor(sqrt(p)).
    pub variables_per_split: Option<usize>,
    pub min_leaf_population: usize,
    pub bag_fraction: f64,
    /// Node budget per tree; `None` means unbounded.
    pub max_nodes: Option<usize>,
}

impl Default for RandomForestParams {
    fn default() -> Self {
        Self {
            number_of_trees: 100,
            variables_per_split: None,
            min_leaf_population: 1,
            bag_fraction: 0.5,
            max_nodes: None,
        }
    }
}

/// Gradient Tree Boost hyperparameters.
///
/// `loss` is accepted from configuration but not wired into training; the
/// trainer always minimizes squared error. See DESIGN.md.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradientBoostParams {
    pub number_of_trees: usize,
    pub shrinkage: f64,
    pub sampling_rate: f64,
    pub max_nodes: Option<usize>,
    pub loss: String,
}

impl Default for GradientBoostParams {
    fn default() -> Self {
        Self {
            number_of_trees: 50,
            shrinkage: 0.05,
            sampling_rate: 0.7,
            max_nodes: None,
            loss: "LeastSquares".to_string(),
        }
    }
}

/// CART hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartParams {
    pub max_nodes: Option<usize>,
    pub min_leaf_population: usize,
}

impl Default for CartParams {
    fn default() -> Self {
        Self {
            max_nodes: None,
            min_leaf_population: 1,
        }
    }
}

/// Complete mapper configuration. Immutable for the duration of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapperConfig {
    pub aoi: Aoi,
    /// Year the composite month-day window is anchored to.
    pub year: i32,
    /// Composite window start as "MM-DD".
    pub start_date: String,
    /// Composite window end as "MM-DD".
    pub end_date: String,
    pub gedi_start_date: NaiveDate,
    pub gedi_end_date: NaiveDate,
    /// Scene-level cloudy pixel percentage cutoff.
    pub cloud_threshold: f32,
    /// Metric used when `gedi_aggregation` is `Single`, e.g. "rh95".
    pub height_quantile: String,
    pub model_family: ModelFamily,
    pub mask_mode: MaskMode,
    pub gedi_aggregation: GediAggregation,
    pub rf: RandomForestParams,
    pub gbm: GradientBoostParams,
    pub cart: CartParams,
}

impl MapperConfig {
    /// Validate every field. Called once when the mapper is constructed;
    /// range violations fail fast with a structured error.
    pub fn validate(&self) -> ChResult<()> {
        self.composite_window()?;
        if self.gedi_end_date < self.gedi_start_date {
            return Err(ChError::Config(format!(
                "GEDI window ends ({}) before it starts ({})",
                self.gedi_end_date, self.gedi_start_date
            )));
        }
        if !(self.cloud_threshold > 0.0 && self.cloud_threshold <= 100.0) {
            return Err(ChError::Config(format!(
                "cloud threshold must be in (0, 100], got {}",
                self.cloud_threshold
            )));
        }
        if !HEIGHT_METRICS.contains(&self.height_quantile.as_str()) {
            return Err(ChError::Config(format!(
                "unknown height metric '{}'",
                self.height_quantile
            )));
        }

        let rf = &self.rf;
        if rf.number_of_trees == 0 {
            return Err(ChError::Config("RF needs at least one tree".to_string()));
        }
        if !(rf.bag_fraction > 0.0 && rf.bag_fraction <= 1.0) {
            return Err(ChError::Config(format!(
                "RF bag fraction must be in (0, 1], got {}",
                rf.bag_fraction
            )));
        }
        if rf.min_leaf_population == 0 {
            return Err(ChError::Config(
                "RF minimum leaf population must be positive".to_string(),
            ));
        }
        if let Some(m) = rf.max_nodes {
            if m < 2 {
                return Err(ChError::Config(format!(
                    "RF max nodes must be at least 2, got {m}"
                )));
            }
        }
        if rf.variables_per_split == Some(0) {
            return Err(ChError::Config(
                "RF variables per split must be positive when set".to_string(),
            ));
        }

        let gbm = &self.gbm;
        if gbm.number_of_trees == 0 {
            return Err(ChError::Config("GBM needs at least one tree".to_string()));
        }
        if !(gbm.shrinkage > 0.0 && gbm.shrinkage <= 1.0) {
            return Err(ChError::Config(format!(
                "GBM shrinkage must be in (0, 1], got {}",
                gbm.shrinkage
            )));
        }
        if !(gbm.sampling_rate > 0.0 && gbm.sampling_rate <= 1.0) {
            return Err(ChError::Config(format!(
                "GBM sampling rate must be in (0, 1], got {}",
                gbm.sampling_rate
            )));
        }
        if let Some(m) = gbm.max_nodes {
            if m < 2 {
                return Err(ChError::Config(format!(
                    "GBM max nodes must be at least 2, got {m}"
                )));
            }
        }

        let cart = &self.cart;
        if cart.min_leaf_population == 0 {
            return Err(ChError::Config(
                "CART minimum leaf population must be positive".to_string(),
            ));
        }
        if let Some(m) = cart.max_nodes {
            if m < 2 {
                return Err(ChError::Config(format!(
                    "CART max nodes must be at least 2, got {m}"
                )));
            }
        }
        Ok(())
    }

    /// Composite date window with the year applied to the month-day bounds.
    pub fn composite_window(&self) -> ChResult<(NaiveDate, NaiveDate)> {
        let start = parse_month_day(self.year, &self.start_date)?;
        let end = parse_month_day(self.year, &self.end_date)?;
        if end < start {
            return Err(ChError::Config(format!(
                "composite window ends ({end}) before it starts ({start})"
            )));
        }
        Ok((start, end))
    }
}

fn parse_month_day(year: i32, month_day: &str) -> ChResult<NaiveDate> {
    let composed = format!("{year}-{month_day}");
    NaiveDate::parse_from_str(&composed, "%Y-%m-%d")
        .map_err(|e| ChError::Config(format!("bad month-day '{month_day}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Aoi;

    fn base_config() -> MapperConfig {
        MapperConfig {
            aoi: Aoi::rectangle(0.0, 0.0, 600.0, 600.0).unwrap(),
            year: 2022,
            start_date: "06-01".to_string(),
            end_date: "09-30".to_string(),
            gedi_start_date: NaiveDate::from_ymd_opt(2022, 1, 1).unwrap(),
            gedi_end_date: NaiveDate::from_ymd_opt(2022, 12, 31).unwrap(),
            cloud_threshold: 65.0,
            height_quantile: "rh95".to_string(),
            model_family: ModelFamily::RandomForest,
            mask_mode: MaskMode::None,
            gedi_aggregation: GediAggregation::Single,
            rf: RandomForestParams::default(),
            gbm: GradientBoostParams::default(),
            cart: CartParams::default(),
        }
    }

    #[test]
    fn default_config_is_valid() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn composite_window_composes_year() {
        let (start, end) = base_config().composite_window().unwrap();
        assert_eq!(start, NaiveDate::from_ymd_opt(2022, 6, 1).unwrap());
        assert_eq!(end, NaiveDate::from_ymd_opt(2022, 9, 30).unwrap());
    }

    #[test]
    fn bag_fraction_range_is_enforced() {
        let mut cfg = base_config();
        cfg.rf.bag_fraction = 0.0;
        assert!(matches!(cfg.validate(), Err(ChError::Config(_))));
        cfg.rf.bag_fraction = 1.5;
        assert!(matches!(cfg.validate(), Err(ChError::Config(_))));
        cfg.rf.bag_fraction = 1.0;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_trees_rejected() {
        let mut cfg = base_config();
        cfg.rf.number_of_trees = 0;
        assert!(cfg.validate().is_err());
        let mut cfg = base_config();
        cfg.gbm.number_of_trees = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unknown_height_metric_rejected() {
        let mut cfg = base_config();
        cfg.height_quantile = "rh42".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn inverted_windows_rejected() {
        let mut cfg = base_config();
        cfg.start_date = "10-01".to_string();
        assert!(cfg.validate().is_err());
        let mut cfg = base_config();
        cfg.gedi_end_date = NaiveDate::from_ymd_opt(2021, 1, 1).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bad_month_day_rejected() {
        let mut cfg = base_config();
        cfg.end_date = "13-40".to_string();
        assert!(cfg.validate().is_err());
    }
}
