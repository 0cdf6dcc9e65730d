//! Scene catalog abstraction.
//!
//! Every raster the pipeline consumes arrives through [`SceneCatalog`]: a
//! date/bounds-filtered query interface standing in for the hosting
//! platform's archive. Implementations own reprojection; the contract is
//! that every returned array is already aligned to the AOI analysis grid.
//! An empty result is not an error: a query window with no coverage
//! returns an empty vector and flows downstream as an empty mask or stack.

use chrono::NaiveDate;
use ndarray::{Array2, Array3};
use std::collections::HashMap;

use crate::types::{Aoi, Band, ChResult};

/// Half-open-free inclusive date window used by catalog queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }
}

/// One multispectral surface-reflectance acquisition: twelve bands on the
/// analysis grid plus a per-pixel cloud probability layer.
#[derive(Debug, Clone)]
pub struct OpticalScene {
    pub date: NaiveDate,
    /// Scene-level cloudy pixel percentage from the archive metadata.
    pub cloudy_percentage: f32,
    /// (band, row, col), ordered as [`crate::types::OPTICAL_BANDS`].
    pub bands: Array3<f32>,
    pub cloud_probability: Band,
}

/// One radar acquisition, terrain-flattened by the archive.
#[derive(Debug, Clone)]
pub struct RadarScene {
    pub date: NaiveDate,
    pub vv: Band,
    pub vh: Band,
    pub angle: Band,
}

/// One spaceborne lidar granule: relative-height metrics plus the shot
/// quality and degrade flags.
#[derive(Debug, Clone)]
pub struct LidarGranule {
    pub date: NaiveDate,
    /// Metric name ("rh95", ...) to gridded height values.
    pub metrics: HashMap<String, Band>,
    /// 1 = usable shot.
    pub quality_flag: Band,
    /// 0 = nominal geolocation.
    pub degrade_flag: Band,
}

/// One land-cover classification scene. `NaN` marks pixels with no
/// classification.
#[derive(Debug, Clone)]
pub struct LandCoverScene {
    pub date: NaiveDate,
    pub labels: Band,
}

/// Query interface over the external scene archive.
pub trait SceneCatalog {
    /// Optical scenes intersecting the AOI within the window, date order.
    fn optical(&self, aoi: &Aoi, window: &DateWindow) -> ChResult<Vec<OpticalScene>>;

    /// Radar scenes intersecting the AOI within the window, date order.
    fn radar(&self, aoi: &Aoi, window: &DateWindow) -> ChResult<Vec<RadarScene>>;

    /// Lidar granules intersecting the AOI within the window, date order.
    fn lidar(&self, aoi: &Aoi, window: &DateWindow) -> ChResult<Vec<LidarGranule>>;

    /// Yearly forest/non-forest classification scenes.
    fn forest_non_forest(&self, aoi: &Aoi, window: &DateWindow)
        -> ChResult<Vec<LandCoverScene>>;

    /// Near-real-time land-cover classification scenes.
    fn land_cover(&self, aoi: &Aoi, window: &DateWindow) -> ChResult<Vec<LandCoverScene>>;

    /// Static DEM on the analysis grid.
    fn dem(&self, aoi: &Aoi) -> ChResult<Array2<f32>>;
}

/// In-memory catalog for tests and demos. Scenes are returned in insertion
/// order after date filtering; bounds filtering is implicit (the instance
/// holds data for a single AOI grid).
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    pub optical_scenes: Vec<OpticalScene>,
    pub radar_scenes: Vec<RadarScene>,
    pub lidar_granules: Vec<LidarGranule>,
    pub fnf_scenes: Vec<LandCoverScene>,
    pub land_cover_scenes: Vec<LandCoverScene>,
    pub dem_tile: Option<Array2<f32>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SceneCatalog for MemoryCatalog {
    fn optical(&self, _aoi: &Aoi, window: &DateWindow) -> ChResult<Vec<OpticalScene>> {
        Ok(self
            .optical_scenes
            .iter()
            .filter(|s| window.contains(s.date))
            .cloned()
            .collect())
    }

    fn radar(&self, _aoi: &Aoi, window: &DateWindow) -> ChResult<Vec<RadarScene>> {
        Ok(self
            .radar_scenes
            .iter()
            .filter(|s| window.contains(s.date))
            .cloned()
            .collect())
    }

    fn lidar(&self, _aoi: &Aoi, window: &DateWindow) -> ChResult<Vec<LidarGranule>> {
        Ok(self
            .lidar_granules
            .iter()
            .filter(|s| window.contains(s.date))
            .cloned()
            .collect())
    }

    fn forest_non_forest(
        &self,
        _aoi: &Aoi,
        window: &DateWindow,
    ) -> ChResult<Vec<LandCoverScene>> {
        Ok(self
            .fnf_scenes
            .iter()
            .filter(|s| window.contains(s.date))
            .cloned()
            .collect())
    }

    fn land_cover(&self, _aoi: &Aoi, window: &DateWindow) -> ChResult<Vec<LandCoverScene>> {
        Ok(self
            .land_cover_scenes
            .iter()
            .filter(|s| window.contains(s.date))
            .cloned()
            .collect())
    }

    fn dem(&self, _aoi: &Aoi) -> ChResult<Array2<f32>> {
        Ok(self.dem_tile.clone().unwrap_or_else(|| Array2::zeros((0, 0))))
    }
}
