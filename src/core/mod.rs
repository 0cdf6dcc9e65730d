//! Core canopy mapping modules

pub mod assembler;
pub mod evaluate;
pub mod forest_mask;
pub mod mapper;
pub mod sampling;
pub mod splitter;
pub mod trainer;

// Re-export main types
pub use assembler::{assemble_band_stack, MAX_CLOUD_PROBABILITY, MEAN_GEDI_METRICS};
pub use evaluate::{rank_importances, rmse, RmseReport};
pub use forest_mask::forest_mask;
pub use mapper::{CanopyHeightMapper, LegendSpec, MapperOutput};
pub use sampling::{cell_size_for_area, generate_sampling_sites, render_scale_for_area};
pub use splitter::{
    attach_random_column, extract_reference, split, SamplingStrategy, DENSE_AREA_LIMIT_HA,
    SAMPLE_SEED, SPLIT_THRESHOLD,
};
pub use trainer::{Regressor, RegressionTree, TrainedModel};
