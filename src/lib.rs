//! Canomap: A Modular Canopy Height Regression Mapper
//!
//! This library implements the full canopy height mapping workflow over
//! multi-sensor Earth observation data: an area-adaptive spatial sampling
//! design, band-stack assembly from optical, radar, terrain and spaceborne
//! lidar sources, train/validation splitting, regression-tree model
//! fitting, and prediction over the full stack with RMSE and variable
//! importance diagnostics.

pub mod config;
pub mod core;
pub mod io;
pub mod types;

// Re-export main types and functions for easier access
pub use config::{
    CartParams, GradientBoostParams, MapperConfig, RandomForestParams, HEIGHT_METRICS,
};
pub use crate::core::{CanopyHeightMapper, LegendSpec, MapperOutput, RmseReport};
pub use io::{MemoryCatalog, RetryPolicy, SceneCatalog};
pub use types::{
    Aoi, Band, BandStack, ChError, ChResult, GediAggregation, Grid, MaskMode, ModelFamily,
    Raster, ReferenceTable, SamplePolygon, SampleRecord, BASE_RESOLUTION_M, LABEL_BAND,
    OPTICAL_BANDS, RADAR_BANDS, TERRAIN_BANDS,
};
