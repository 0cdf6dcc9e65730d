use ndarray::{Array2, Array3, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// Single-band raster data. `NaN` marks no-data pixels.
pub type Band = Array2<f32>;

/// Base resolution of the analysis grid in meters (Sentinel-2 native).
pub const BASE_RESOLUTION_M: f64 = 10.0;

/// Sentinel-2 surface-reflectance predictor bands, in stack order.
pub const OPTICAL_BANDS: [&str; 12] = [
    "B1", "B2", "B3", "B4", "B5", "B6", "B7", "B8", "B8A", "B9", "B11", "B12",
];

/// Regression label band (GEDI relative height).
pub const LABEL_BAND: &str = "rh";

/// Terrain predictor bands, in stack order.
pub const TERRAIN_BANDS: [&str; 3] = ["elevation", "slope", "aspect"];

/// Sentinel-1 predictor bands, in stack order.
pub const RADAR_BANDS: [&str; 3] = ["VH", "VV", "angle"];

/// Forest mask source selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaskMode {
    /// JAXA yearly forest/non-forest classification.
    Fnf,
    /// Dynamic World land-cover "trees" class.
    Dw,
    /// No exclusion: every AOI pixel is eligible.
    None,
}

/// Regression-tree model family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelFamily {
    RandomForest,
    GradientTreeBoost,
    Cart,
}

/// How the GEDI label band is derived from the relative-height metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GediAggregation {
    /// A single configured percentile band (e.g. rh95).
    Single,
    /// Mean of the rh75/rh90/rh95/rh100 metrics.
    Mean,
}

/// Affine georeferencing for a north-up grid with square pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub top_left_y: f64,
    pub pixel_size: f64,
}

impl GeoTransform {
    /// Map coordinates of a pixel center.
    pub fn pixel_center(&self, row: usize, col: usize) -> (f64, f64) {
        (
            self.top_left_x + (col as f64 + 0.5) * self.pixel_size,
            self.top_left_y - (row as f64 + 0.5) * self.pixel_size,
        )
    }
}

/// Grid geometry shared by every raster in one run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Grid {
    pub transform: GeoTransform,
    pub rows: usize,
    pub cols: usize,
}

impl Grid {
    pub fn pixel_center(&self, row: usize, col: usize) -> (f64, f64) {
        self.transform.pixel_center(row, col)
    }

    pub fn resolution(&self) -> f64 {
        self.transform.pixel_size
    }
}

/// Area of interest: a closed polygon in projected meter coordinates.
///
/// The ring is immutable once constructed; every derived quantity (area,
/// analysis grid, export bounding box) is recomputed from it on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aoi {
    ring: Vec<(f64, f64)>,
}

impl Aoi {
    /// Build an AOI from a polygon ring. The ring does not need to repeat
    /// its first vertex.
    pub fn new(ring: Vec<(f64, f64)>) -> ChResult<Self> {
        if ring.len() < 3 {
            return Err(ChError::Geometry(format!(
                "polygon needs at least 3 vertices, got {}",
                ring.len()
            )));
        }
        let aoi = Self { ring };
        let (min_x, min_y, max_x, max_y) = aoi.bbox();
        if !(max_x > min_x && max_y > min_y) {
            return Err(ChError::Geometry(
                "polygon bounding box is degenerate".to_string(),
            ));
        }
        Ok(aoi)
    }

    /// Axis-aligned rectangle helper, the shape drawn AOIs usually take.
    pub fn rectangle(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> ChResult<Self> {
        Self::new(vec![
            (min_x, min_y),
            (max_x, min_y),
            (max_x, max_y),
            (min_x, max_y),
        ])
    }

    pub fn ring(&self) -> &[(f64, f64)] {
        &self.ring
    }

    /// Bounding box as (min_x, min_y, max_x, max_y).
    pub fn bbox(&self) -> (f64, f64, f64, f64) {
        let mut min_x = f64::INFINITY;
        let mut min_y = f64::INFINITY;
        let mut max_x = f64::NEG_INFINITY;
        let mut max_y = f64::NEG_INFINITY;
        for &(x, y) in &self.ring {
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
        (min_x, min_y, max_x, max_y)
    }

    /// Polygon area in square meters (shoelace formula).
    pub fn area_m2(&self) -> f64 {
        let n = self.ring.len();
        let mut twice_area = 0.0;
        for i in 0..n {
            let (x1, y1) = self.ring[i];
            let (x2, y2) = self.ring[(i + 1) % n];
            twice_area += x1 * y2 - x2 * y1;
        }
        (twice_area / 2.0).abs()
    }

    /// Area in hectares, rounded to the nearest whole hectare. This is the
    /// scalar every tiering decision keys off.
    pub fn area_ha(&self) -> f64 {
        (self.area_m2() / 10_000.0).round()
    }

    /// Point-in-polygon test (ray casting, boundary-inclusive on crossings).
    pub fn contains(&self, x: f64, y: f64) -> bool {
        let n = self.ring.len();
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let (xi, yi) = self.ring[i];
            let (xj, yj) = self.ring[j];
            if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
                inside = !inside;
            }
            j = i;
        }
        inside
    }

    /// Analysis grid covering the AOI bounding box at the given resolution.
    pub fn grid(&self, resolution: f64) -> ChResult<Grid> {
        if resolution <= 0.0 {
            return Err(ChError::Geometry(format!(
                "grid resolution must be positive, got {resolution}"
            )));
        }
        let (min_x, min_y, max_x, max_y) = self.bbox();
        let cols = ((max_x - min_x) / resolution).ceil() as usize;
        let rows = ((max_y - min_y) / resolution).ceil() as usize;
        Ok(Grid {
            transform: GeoTransform {
                top_left_x: min_x,
                top_left_y: max_y,
                pixel_size: resolution,
            },
            rows: rows.max(1),
            cols: cols.max(1),
        })
    }

    /// Bounding box as a GeoJSON polygon, the shape download requests carry.
    pub fn bbox_geojson(&self) -> serde_json::Value {
        let (min_x, min_y, max_x, max_y) = self.bbox();
        serde_json::json!({
            "type": "Polygon",
            "coordinates": [[
                [min_x, min_y],
                [max_x, min_y],
                [max_x, max_y],
                [min_x, max_y],
                [min_x, min_y],
            ]],
        })
    }
}

/// A single-band georeferenced raster.
#[derive(Debug, Clone)]
pub struct Raster {
    pub grid: Grid,
    pub data: Band,
}

impl Raster {
    /// New raster filled with a constant value.
    pub fn filled(grid: Grid, value: f32) -> Self {
        Self {
            grid,
            data: Array2::from_elem((grid.rows, grid.cols), value),
        }
    }

    /// New raster with every pixel marked no-data.
    pub fn empty(grid: Grid) -> Self {
        Self::filled(grid, f32::NAN)
    }

    pub fn from_band(grid: Grid, data: Band) -> ChResult<Self> {
        if data.dim() != (grid.rows, grid.cols) {
            return Err(ChError::BandStack(format!(
                "band shape {:?} does not match grid {}x{}",
                data.dim(),
                grid.rows,
                grid.cols
            )));
        }
        Ok(Self { grid, data })
    }

    /// Count of pixels holding a value.
    pub fn valid_count(&self) -> usize {
        self.data.iter().filter(|v| !v.is_nan()).count()
    }

    /// True when no pixel holds a value (the empty-result case of a failed
    /// date/bounds query; flows downstream, never raised).
    pub fn is_empty_mask(&self) -> bool {
        self.valid_count() == 0
    }
}

/// Ordered multi-band raster. Band identity is positional: the classifier's
/// predictor list must match this order at train and predict time.
#[derive(Debug, Clone)]
pub struct BandStack {
    grid: Grid,
    names: Vec<String>,
    data: Array3<f32>,
}

impl BandStack {
    pub fn new(grid: Grid) -> Self {
        Self {
            grid,
            names: Vec::new(),
            data: Array3::zeros((0, grid.rows, grid.cols)),
        }
    }

    /// Append a band. Order of insertion fixes the band order.
    pub fn push_band(&mut self, name: &str, band: Band) -> ChResult<()> {
        if band.dim() != (self.grid.rows, self.grid.cols) {
            return Err(ChError::BandStack(format!(
                "band '{}' shape {:?} does not match stack grid {}x{}",
                name,
                band.dim(),
                self.grid.rows,
                self.grid.cols
            )));
        }
        if self.names.iter().any(|n| n == name) {
            return Err(ChError::BandStack(format!("duplicate band '{name}'")));
        }
        self.data
            .append(Axis(0), band.insert_axis(Axis(0)).view())
            .map_err(|e| ChError::BandStack(e.to_string()))?;
        self.names.push(name.to_string());
        Ok(())
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn band_names(&self) -> &[String] {
        &self.names
    }

    /// Every band name except the label: the predictor list, in stack order.
    pub fn predictor_names(&self, label: &str) -> Vec<String> {
        self.names.iter().filter(|n| *n != label).cloned().collect()
    }

    pub fn band_index(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn band(&self, name: &str) -> Option<ArrayView2<'_, f32>> {
        self.band_index(name)
            .map(|i| self.data.index_axis(Axis(0), i))
    }

    pub fn num_bands(&self) -> usize {
        self.names.len()
    }

    /// All band values at a pixel, in stack order.
    pub fn pixel_values(&self, row: usize, col: usize) -> Vec<f32> {
        (0..self.names.len())
            .map(|b| self.data[[b, row, col]])
            .collect()
    }
}

/// One extracted sample: a point location plus one value per stack band and
/// the uniform `random` split value attached after extraction.
#[derive(Debug, Clone)]
pub struct SampleRecord {
    pub x: f64,
    pub y: f64,
    pub values: Vec<f32>,
    pub random: f64,
}

/// Tabular extraction from the band stack, used for training and validation.
#[derive(Debug, Clone, Default)]
pub struct ReferenceTable {
    pub columns: Vec<String>,
    pub rows: Vec<SampleRecord>,
}

impl ReferenceTable {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Column values in row order.
    pub fn column(&self, name: &str) -> Option<Vec<f32>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(|r| r.values[idx]).collect())
    }
}

/// A buffered sampling site produced by the sampling designer: the centroid
/// of a selected pixel buffered by half the grid-cell spacing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplePolygon {
    pub x: f64,
    pub y: f64,
    pub radius: f64,
}

impl SamplePolygon {
    pub fn contains(&self, x: f64, y: f64) -> bool {
        let dx = x - self.x;
        let dy = y - self.y;
        dx * dx + dy * dy <= self.radius * self.radius
    }
}

/// Error types for the canopy mapping pipeline.
#[derive(Debug, thiserror::Error)]
pub enum ChError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid geometry: {0}")]
    Geometry(String),

    #[error("engine query failed at {stage}: {message}")]
    Engine { stage: String, message: String },

    #[error("band stack error: {0}")]
    BandStack(String),

    #[error("training error: {0}")]
    Training(String),

    #[error("export error: {0}")]
    Export(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for canopy mapping operations.
pub type ChResult<T> = Result<T, ChError>;
