//! Pipeline orchestrator.
//!
//! One run is a pure function of (AOI, date windows, hyperparameters,
//! seeds, model choice): forest mask, band stack, sampling design, sample
//! extraction and split, training, then prediction over the full stack
//! with the RMSE and importance diagnostics on the side. The stages run as
//! a single logical pipeline; only the diagnostic branch is
//! order-insensitive.

use crate::config::MapperConfig;
use crate::core::evaluate::{rank_importances, rmse, RmseReport};
use crate::core::forest_mask::forest_mask;
use crate::core::sampling::{
    cell_size_for_area, generate_sampling_sites, render_scale_for_area, DESIGN_SEED,
};
use crate::core::splitter::{
    attach_random_column, extract_reference, split, SamplingStrategy, SAMPLE_SEED,
    SPLIT_THRESHOLD,
};
use crate::core::trainer::{Regressor, TrainedModel};
use crate::io::catalog::SceneCatalog;
use crate::io::fetch::RetryPolicy;
use crate::types::{ChResult, ModelFamily, Raster, BASE_RESOLUTION_M, LABEL_BAND};

/// Legend parameters for the rendered height layer. Rendering itself is
/// the presentation layer's business; only the ramp is decided here.
#[derive(Debug, Clone, PartialEq)]
pub struct LegendSpec {
    pub title: String,
    pub min: f64,
    pub max: f64,
    /// Color ramp, dark-to-light hex codes.
    pub palette: Vec<&'static str>,
    pub steps: usize,
}

impl Default for LegendSpec {
    fn default() -> Self {
        Self {
            title: "Canopy Height Map (m)".to_string(),
            min: 0.0,
            max: 50.0,
            palette: vec![
                "FDE725", "8ED542", "36B677", "218F8B", "30678D", "433982", "440154",
            ],
            steps: 20,
        }
    }
}

/// Everything a run produces: the deliverable prediction raster plus the
/// diagnostic side channel.
#[derive(Debug, Clone)]
pub struct MapperOutput {
    pub prediction: Raster,
    pub rmse: RmseReport,
    /// Predictor importances, ranked descending.
    pub importances: Vec<(String, f64)>,
    pub legend: LegendSpec,
    pub area_ha: f64,
    pub render_scale: f64,
    pub cell_size: f64,
    pub strategy: SamplingStrategy,
    pub training_size: usize,
    pub validation_size: usize,
}

/// Canopy height mapping pipeline.
pub struct CanopyHeightMapper<'a, C: SceneCatalog> {
    config: MapperConfig,
    catalog: &'a C,
    retry: RetryPolicy,
}

impl<'a, C: SceneCatalog> CanopyHeightMapper<'a, C> {
    /// Validate the configuration and bind the catalog.
    pub fn new(config: MapperConfig, catalog: &'a C) -> ChResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            catalog,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &MapperConfig {
        &self.config
    }

    /// Run the full pipeline.
    pub fn run(&self) -> ChResult<MapperOutput> {
        let aoi = &self.config.aoi;

        // Scalar pulls that gate all later branching.
        let area_ha = aoi.area_ha();
        let render_scale = render_scale_for_area(area_ha);
        let cell_size = cell_size_for_area(area_ha, render_scale);
        let strategy = SamplingStrategy::for_area(area_ha);
        log::info!(
            "run: {area_ha} ha, render scale {render_scale} m, cell size {cell_size} m, {strategy:?} sampling"
        );

        let grid = aoi.grid(BASE_RESOLUTION_M)?;
        let mask = forest_mask(
            self.catalog,
            aoi,
            self.config.mask_mode,
            grid,
            &self.retry,
        )?;
        let stack = crate::core::assembler::assemble_band_stack(
            self.catalog,
            aoi,
            grid,
            &self.config,
            &mask,
            &self.retry,
        )?;

        let sites = generate_sampling_sites(aoi, &grid, cell_size, DESIGN_SEED, &mask)?;

        let reference = extract_reference(&stack, aoi, strategy, &sites, render_scale)?;
        let reference = attach_random_column(reference, SAMPLE_SEED);
        let (training, validation) = split(reference, SPLIT_THRESHOLD);
        let training_size = training.len();
        let validation_size = validation.len();

        let predictors = stack.predictor_names(LABEL_BAND);
        let model = self.regressor().train(&training, LABEL_BAND, &predictors)?;

        // Diagnostic branch: reads the model and validation set only.
        let validated = model.classify_table(&validation, LABEL_BAND)?;
        let report = rmse(&validated);
        let importances = rank_importances(model.importances());
        log::info!("validation: {report}");

        let prediction = self.predict(&model, &stack)?;

        Ok(MapperOutput {
            prediction,
            rmse: report,
            importances,
            legend: LegendSpec::default(),
            area_ha,
            render_scale,
            cell_size,
            strategy,
            training_size,
            validation_size,
        })
    }

    fn regressor(&self) -> Regressor {
        match self.config.model_family {
            ModelFamily::RandomForest => Regressor::random_forest(self.config.rf.clone()),
            ModelFamily::GradientTreeBoost => Regressor::gradient_boost(self.config.gbm.clone()),
            ModelFamily::Cart => Regressor::cart(self.config.cart.clone()),
        }
    }

    fn predict(&self, model: &TrainedModel, stack: &crate::types::BandStack) -> ChResult<Raster> {
        log::info!("predicting canopy height over the full band stack");
        model.classify(stack)
    }
}
