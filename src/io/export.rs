//! Export request construction.
//!
//! The byte formats written to cloud storage are the sink's business; this
//! module only builds and validates the request parameters. A malformed or
//! empty AOI bounding box fails here with a descriptive error instead of
//! exporting garbage.

use serde::{Deserialize, Serialize};

use crate::types::{Aoi, ChError, ChResult, Raster};

/// Export resolution in meters.
pub const EXPORT_SCALE_M: f64 = 10.0;

/// Pixel cap forwarded to the export sink.
pub const MAX_EXPORT_PIXELS: u64 = 10_000_000_000_000;

/// CRS used by direct-download requests.
pub const DOWNLOAD_CRS: &str = "EPSG:4326";

/// Parameters for a raster export to cloud storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriveExport {
    pub description: String,
    pub folder: String,
    /// Region bounding box as (min_x, min_y, max_x, max_y).
    pub region: (f64, f64, f64, f64),
    pub scale: f64,
    pub crs: String,
    pub max_pixels: u64,
}

impl DriveExport {
    pub fn new(description: &str, folder: &str, aoi: &Aoi, crs: &str) -> ChResult<Self> {
        if description.trim().is_empty() {
            return Err(ChError::Export("export description is empty".to_string()));
        }
        if crs.trim().is_empty() {
            return Err(ChError::Export("export CRS is empty".to_string()));
        }
        let region = validated_bbox(aoi)?;
        Ok(Self {
            description: description.to_string(),
            folder: folder.to_string(),
            region,
            scale: EXPORT_SCALE_M,
            crs: crs.to_string(),
            max_pixels: MAX_EXPORT_PIXELS,
        })
    }
}

/// Parameters for a direct-download request; the sink answers with a URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub name: String,
    pub crs: String,
    pub scale: f64,
    /// AOI bounding box as a GeoJSON polygon.
    pub region: serde_json::Value,
}

impl DownloadRequest {
    pub fn new(name: &str, aoi: &Aoi) -> ChResult<Self> {
        if name.trim().is_empty() {
            return Err(ChError::Export("download name is empty".to_string()));
        }
        validated_bbox(aoi)?;
        Ok(Self {
            name: name.to_string(),
            crs: DOWNLOAD_CRS.to_string(),
            scale: EXPORT_SCALE_M,
            region: aoi.bbox_geojson(),
        })
    }
}

fn validated_bbox(aoi: &Aoi) -> ChResult<(f64, f64, f64, f64)> {
    let (min_x, min_y, max_x, max_y) = aoi.bbox();
    if !(min_x.is_finite() && min_y.is_finite() && max_x.is_finite() && max_y.is_finite()) {
        return Err(ChError::Export(
            "AOI bounding box has non-finite coordinates".to_string(),
        ));
    }
    if max_x <= min_x || max_y <= min_y {
        return Err(ChError::Export(format!(
            "AOI bounding box is empty or inverted: ({min_x}, {min_y}, {max_x}, {max_y})"
        )));
    }
    Ok((min_x, min_y, max_x, max_y))
}

/// Destination for export submissions.
pub trait ExportSink {
    fn submit(&mut self, raster: &Raster, request: &DriveExport) -> ChResult<()>;
}

/// Sink that records submitted requests; used in tests.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub submitted: Vec<DriveExport>,
}

impl ExportSink for RecordingSink {
    fn submit(&mut self, _raster: &Raster, request: &DriveExport) -> ChResult<()> {
        log::info!(
            "export '{}' to folder '{}' at {} m",
            request.description,
            request.folder,
            request.scale
        );
        self.submitted.push(request.clone());
        Ok(())
    }
}
