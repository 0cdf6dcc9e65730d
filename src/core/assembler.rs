//! Feature/label assembler.
//!
//! Composes the optical median composite, the lidar height label, terrain
//! derivatives, and the radar composite into one ordered band stack. Band
//! identity is positional: any change to the assembly order invalidates
//! trained models, so the order is fixed here and nowhere else.

use ndarray::Array2;

use crate::config::MapperConfig;
use crate::io::catalog::{DateWindow, LidarGranule, OpticalScene, RadarScene, SceneCatalog};
use crate::io::fetch::{fetch_with_retry, RetryPolicy};
use crate::types::{
    Aoi, Band, BandStack, ChResult, GediAggregation, Grid, Raster, LABEL_BAND, OPTICAL_BANDS,
    RADAR_BANDS, TERRAIN_BANDS,
};

/// Per-pixel cloud probability cutoff applied inside the composite.
pub const MAX_CLOUD_PROBABILITY: f32 = 20.0;

/// Metrics averaged for the mean-GEDI label.
pub const MEAN_GEDI_METRICS: [&str; 4] = ["rh75", "rh90", "rh95", "rh100"];

/// Kernel width of the multi-temporal speckle filter.
pub const SPECKLE_WINDOW: usize = 15;

/// Assemble the full band stack for one run: 12 optical bands, the "rh"
/// label, elevation/slope/aspect, and the VH/VV/angle radar means.
pub fn assemble_band_stack<C: SceneCatalog>(
    catalog: &C,
    aoi: &Aoi,
    grid: Grid,
    config: &MapperConfig,
    mask: &Raster,
    retry: &RetryPolicy,
) -> ChResult<BandStack> {
    let (start, end) = config.composite_window()?;
    let composite_window = DateWindow::new(start, end);
    let gedi_window = DateWindow::new(config.gedi_start_date, config.gedi_end_date);

    let optical_scenes = fetch_with_retry("assembler/optical", retry, || {
        catalog.optical(aoi, &composite_window)
    })?;
    let lidar_granules = fetch_with_retry("assembler/lidar", retry, || {
        catalog.lidar(aoi, &gedi_window)
    })?;
    let radar_scenes = fetch_with_retry("assembler/radar", retry, || {
        catalog.radar(aoi, &composite_window)
    })?;
    let dem = fetch_with_retry("assembler/dem", retry, || catalog.dem(aoi))?;

    let optical = optical_composite(&optical_scenes, config.cloud_threshold, mask, aoi, grid);
    let label = lidar_label(
        &lidar_granules,
        config.gedi_aggregation,
        &config.height_quantile,
        mask,
        grid,
    );
    let (elevation, slope, aspect) = terrain_bands(&dem, grid);
    let (vh, vv, angle) = radar_composite(&radar_scenes, mask, aoi, grid);

    let mut stack = BandStack::new(grid);
    for (i, name) in OPTICAL_BANDS.iter().enumerate() {
        stack.push_band(name, optical[i].clone())?;
    }
    stack.push_band(LABEL_BAND, label)?;
    stack.push_band(TERRAIN_BANDS[0], elevation)?;
    stack.push_band(TERRAIN_BANDS[1], slope)?;
    stack.push_band(TERRAIN_BANDS[2], aspect)?;
    stack.push_band(RADAR_BANDS[0], vh)?;
    stack.push_band(RADAR_BANDS[1], vv)?;
    stack.push_band(RADAR_BANDS[2], angle)?;
    log::info!(
        "assembled band stack: {} bands on {}x{} grid",
        stack.num_bands(),
        grid.rows,
        grid.cols
    );
    Ok(stack)
}

fn eligible(mask: &Raster, row: usize, col: usize) -> bool {
    mask.data[[row, col]] == 1.0
}

/// Cloud-filtered, cloud-probability-masked median composite of the twelve
/// optical bands, gated by the forest mask and clipped to the AOI.
pub fn optical_composite(
    scenes: &[OpticalScene],
    cloud_threshold: f32,
    mask: &Raster,
    aoi: &Aoi,
    grid: Grid,
) -> Vec<Band> {
    let kept: Vec<&OpticalScene> = scenes
        .iter()
        .filter(|s| s.cloudy_percentage < cloud_threshold)
        .collect();
    log::debug!(
        "optical composite: {} of {} scenes under {cloud_threshold}% cloud",
        kept.len(),
        scenes.len()
    );

    let mut bands = vec![Array2::from_elem((grid.rows, grid.cols), f32::NAN); OPTICAL_BANDS.len()];
    let mut values: Vec<f32> = Vec::with_capacity(kept.len());
    for row in 0..grid.rows {
        for col in 0..grid.cols {
            let (x, y) = grid.pixel_center(row, col);
            if !aoi.contains(x, y) || !eligible(mask, row, col) {
                continue;
            }
            for (b, band) in bands.iter_mut().enumerate() {
                values.clear();
                for scene in &kept {
                    if scene.cloud_probability[[row, col]] >= MAX_CLOUD_PROBABILITY {
                        continue;
                    }
                    let v = scene.bands[[b, row, col]];
                    if !v.is_nan() {
                        values.push(v);
                    }
                }
                band[[row, col]] = median(&mut values);
            }
        }
    }
    bands
}

fn median(values: &mut [f32]) -> f32 {
    if values.is_empty() {
        return f32::NAN;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        values[mid]
    } else {
        (values[mid - 1] + values[mid]) / 2.0
    }
}

/// Label band from the lidar height metrics. Shots failing the quality or
/// degrade flags, or falling outside the forest mask, contribute nothing.
/// `Single` takes the first non-null value of the configured metric in
/// granule date order; `Mean` averages the first non-null values of the
/// rh75/rh90/rh95/rh100 metrics.
pub fn lidar_label(
    granules: &[LidarGranule],
    aggregation: GediAggregation,
    quantile: &str,
    mask: &Raster,
    grid: Grid,
) -> Band {
    let metrics: Vec<&str> = match aggregation {
        GediAggregation::Single => vec![quantile],
        GediAggregation::Mean => MEAN_GEDI_METRICS.to_vec(),
    };

    let mut label = Array2::from_elem((grid.rows, grid.cols), f32::NAN);
    for row in 0..grid.rows {
        for col in 0..grid.cols {
            if !eligible(mask, row, col) {
                continue;
            }
            let mut found = Vec::with_capacity(metrics.len());
            for metric in &metrics {
                if let Some(v) = first_non_null(granules, metric, row, col) {
                    found.push(v);
                }
            }
            if !found.is_empty() {
                label[[row, col]] = found.iter().sum::<f32>() / found.len() as f32;
            }
        }
    }
    label
}

fn first_non_null(
    granules: &[LidarGranule],
    metric: &str,
    row: usize,
    col: usize,
) -> Option<f32> {
    for granule in granules {
        if granule.quality_flag[[row, col]] != 1.0 || granule.degrade_flag[[row, col]] != 0.0 {
            continue;
        }
        if let Some(band) = granule.metrics.get(metric) {
            let v = band[[row, col]];
            if !v.is_nan() {
                return Some(v);
            }
        }
    }
    None
}

/// Elevation (sea-level masked), slope, and aspect in degrees from the
/// static DEM. Gradients use central differences at the grid resolution;
/// border pixels copy their nearest interior neighbor.
pub fn terrain_bands(dem: &Array2<f32>, grid: Grid) -> (Band, Band, Band) {
    let shape = (grid.rows, grid.cols);
    if dem.dim() != shape {
        log::warn!(
            "DEM shape {:?} does not match grid {}x{}, terrain bands empty",
            dem.dim(),
            grid.rows,
            grid.cols
        );
        let empty = Array2::from_elem(shape, f32::NAN);
        return (empty.clone(), empty.clone(), empty);
    }

    let mut elevation = Array2::from_elem(shape, f32::NAN);
    for ((r, c), &v) in dem.indexed_iter() {
        if v > 0.0 {
            elevation[[r, c]] = v;
        }
    }

    let step = grid.resolution() as f32;
    let mut slope = Array2::from_elem(shape, f32::NAN);
    let mut aspect = Array2::from_elem(shape, f32::NAN);
    for r in 1..grid.rows.saturating_sub(1) {
        for c in 1..grid.cols.saturating_sub(1) {
            let e = |rr: usize, cc: usize| elevation[[rr, cc]];
            let (n, s, w, ee) = (e(r - 1, c), e(r + 1, c), e(r, c - 1), e(r, c + 1));
            if n.is_nan() || s.is_nan() || w.is_nan() || ee.is_nan() {
                continue;
            }
            let dz_dx = (ee - w) / (2.0 * step);
            let dz_dy = (s - n) / (2.0 * step);
            slope[[r, c]] = (dz_dx * dz_dx + dz_dy * dz_dy).sqrt().atan().to_degrees();
            // 0 = north, clockwise positive
            let mut az = dz_dx.atan2(-dz_dy).to_degrees() + 180.0;
            if az >= 360.0 {
                az -= 360.0;
            }
            aspect[[r, c]] = az;
        }
    }
    fill_edges(&mut slope);
    fill_edges(&mut aspect);
    (elevation, slope, aspect)
}

fn fill_edges(band: &mut Band) {
    let (rows, cols) = band.dim();
    if rows < 3 || cols < 3 {
        return;
    }
    for c in 0..cols {
        band[[0, c]] = band[[1, c]];
        band[[rows - 1, c]] = band[[rows - 2, c]];
    }
    for r in 0..rows {
        band[[r, 0]] = band[[r, 1]];
        band[[r, cols - 1]] = band[[r, cols - 2]];
    }
}

/// Speckle-filtered multi-temporal radar composite: the temporal mean of
/// VH, VV, and incidence angle, masked and clipped like the optical bands.
pub fn radar_composite(
    scenes: &[RadarScene],
    mask: &Raster,
    aoi: &Aoi,
    grid: Grid,
) -> (Band, Band, Band) {
    let filtered: Vec<(Band, Band)> = scenes
        .iter()
        .map(|s| {
            (
                mean_filter(&s.vh, SPECKLE_WINDOW),
                mean_filter(&s.vv, SPECKLE_WINDOW),
            )
        })
        .collect();

    let shape = (grid.rows, grid.cols);
    let mut vh = Array2::from_elem(shape, f32::NAN);
    let mut vv = Array2::from_elem(shape, f32::NAN);
    let mut angle = Array2::from_elem(shape, f32::NAN);
    for row in 0..grid.rows {
        for col in 0..grid.cols {
            let (x, y) = grid.pixel_center(row, col);
            if !aoi.contains(x, y) || !eligible(mask, row, col) {
                continue;
            }
            vh[[row, col]] = temporal_mean(filtered.iter().map(|(f, _)| f[[row, col]]));
            vv[[row, col]] = temporal_mean(filtered.iter().map(|(_, f)| f[[row, col]]));
            angle[[row, col]] = temporal_mean(scenes.iter().map(|s| s.angle[[row, col]]));
        }
    }
    (vh, vv, angle)
}

fn temporal_mean(values: impl Iterator<Item = f32>) -> f32 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for v in values {
        if !v.is_nan() {
            sum += v;
            count += 1;
        }
    }
    if count == 0 {
        f32::NAN
    } else {
        sum / count as f32
    }
}

/// No-data-aware boxcar mean over a `window` x `window` neighborhood,
/// truncated at the image border.
pub fn mean_filter(image: &Band, window: usize) -> Band {
    let (rows, cols) = image.dim();
    let half = (window.max(1) - 1) / 2;
    let mut out = Array2::from_elem((rows, cols), f32::NAN);
    for r in 0..rows {
        for c in 0..cols {
            if image[[r, c]].is_nan() {
                continue;
            }
            let r0 = r.saturating_sub(half);
            let r1 = (r + half + 1).min(rows);
            let c0 = c.saturating_sub(half);
            let c1 = (c + half + 1).min(cols);
            let neighborhood = image.slice(ndarray::s![r0..r1, c0..c1]);
            out[[r, c]] = temporal_mean(neighborhood.iter().copied());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Aoi;
    use approx::assert_relative_eq;
    use chrono::NaiveDate;
    use ndarray::Array3;
    use std::collections::HashMap;

    fn fixture() -> (Aoi, Grid, Raster) {
        let aoi = Aoi::rectangle(0.0, 0.0, 60.0, 60.0).unwrap();
        let grid = aoi.grid(10.0).unwrap();
        let mask = Raster::filled(grid, 1.0);
        (aoi, grid, mask)
    }

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2022, 6, d).unwrap()
    }

    fn optical_scene(day: u32, cloudy: f32, value: f32, probability: f32) -> OpticalScene {
        OpticalScene {
            date: date(day),
            cloudy_percentage: cloudy,
            bands: Array3::from_elem((12, 6, 6), value),
            cloud_probability: Array2::from_elem((6, 6), probability),
        }
    }

    #[test]
    fn composite_takes_median_of_clear_scenes() {
        let (aoi, grid, mask) = fixture();
        let scenes = vec![
            optical_scene(1, 10.0, 100.0, 0.0),
            optical_scene(2, 10.0, 300.0, 0.0),
            optical_scene(3, 10.0, 200.0, 0.0),
        ];
        let bands = optical_composite(&scenes, 65.0, &mask, &aoi, grid);
        assert_relative_eq!(bands[0][[3, 3]], 200.0);
        assert_relative_eq!(bands[11][[3, 3]], 200.0);
    }

    #[test]
    fn cloudy_scenes_and_cloudy_pixels_are_dropped() {
        let (aoi, grid, mask) = fixture();
        let scenes = vec![
            optical_scene(1, 90.0, 999.0, 0.0),  // over scene threshold
            optical_scene(2, 10.0, 999.0, 80.0), // over pixel probability
            optical_scene(3, 10.0, 150.0, 0.0),
        ];
        let bands = optical_composite(&scenes, 65.0, &mask, &aoi, grid);
        assert_relative_eq!(bands[4][[2, 2]], 150.0);
    }

    #[test]
    fn composite_with_no_scenes_is_all_nodata() {
        let (aoi, grid, mask) = fixture();
        let bands = optical_composite(&[], 65.0, &mask, &aoi, grid);
        assert!(bands.iter().all(|b| b.iter().all(|v| v.is_nan())));
    }

    fn granule(day: u32, metric: &str, value: f32, quality: f32, degrade: f32) -> LidarGranule {
        let mut metrics = HashMap::new();
        metrics.insert(metric.to_string(), Array2::from_elem((6, 6), value));
        LidarGranule {
            date: date(day),
            metrics,
            quality_flag: Array2::from_elem((6, 6), quality),
            degrade_flag: Array2::from_elem((6, 6), degrade),
        }
    }

    #[test]
    fn single_label_takes_first_good_granule() {
        let (_, grid, mask) = fixture();
        let granules = vec![
            granule(1, "rh95", 10.0, 0.0, 0.0), // fails quality
            granule(2, "rh95", 20.0, 1.0, 1.0), // fails degrade
            granule(3, "rh95", 30.0, 1.0, 0.0),
            granule(4, "rh95", 40.0, 1.0, 0.0), // shadowed by first non-null
        ];
        let label = lidar_label(&granules, GediAggregation::Single, "rh95", &mask, grid);
        assert_relative_eq!(label[[0, 0]], 30.0);
    }

    #[test]
    fn mean_label_averages_the_four_metrics() {
        let (_, grid, mask) = fixture();
        let mut metrics = HashMap::new();
        for (name, value) in [("rh75", 10.0), ("rh90", 20.0), ("rh95", 30.0), ("rh100", 40.0)] {
            metrics.insert(name.to_string(), Array2::from_elem((6, 6), value));
        }
        let granules = vec![LidarGranule {
            date: date(1),
            metrics,
            quality_flag: Array2::from_elem((6, 6), 1.0),
            degrade_flag: Array2::from_elem((6, 6), 0.0),
        }];
        let label = lidar_label(&granules, GediAggregation::Mean, "rh95", &mask, grid);
        assert_relative_eq!(label[[2, 4]], 25.0);
    }

    #[test]
    fn masked_pixels_carry_no_label() {
        let (_, grid, _) = fixture();
        let mask = Raster::empty(grid);
        let granules = vec![granule(1, "rh95", 30.0, 1.0, 0.0)];
        let label = lidar_label(&granules, GediAggregation::Single, "rh95", &mask, grid);
        assert!(label.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn flat_dem_has_zero_slope() {
        let (_, grid, _) = fixture();
        let dem = Array2::from_elem((6, 6), 500.0);
        let (elevation, slope, _) = terrain_bands(&dem, grid);
        assert_relative_eq!(elevation[[3, 3]], 500.0);
        assert_relative_eq!(slope[[3, 3]], 0.0);
    }

    #[test]
    fn sea_level_pixels_are_masked_out() {
        let (_, grid, _) = fixture();
        let mut dem = Array2::from_elem((6, 6), 100.0);
        dem[[2, 2]] = 0.0;
        dem[[2, 3]] = -5.0;
        let (elevation, _, _) = terrain_bands(&dem, grid);
        assert!(elevation[[2, 2]].is_nan());
        assert!(elevation[[2, 3]].is_nan());
        assert_relative_eq!(elevation[[4, 4]], 100.0);
    }

    #[test]
    fn east_facing_ramp_has_east_aspect() {
        let (_, grid, _) = fixture();
        // Elevation increasing westward: downslope faces east.
        let dem = Array2::from_shape_fn((6, 6), |(_, c)| 600.0 - c as f32 * 10.0);
        let (_, slope, aspect) = terrain_bands(&dem, grid);
        assert!(slope[[3, 3]] > 0.0);
        assert_relative_eq!(aspect[[3, 3]], 90.0, epsilon = 1e-3);
    }

    #[test]
    fn radar_composite_is_temporal_mean() {
        let (aoi, grid, mask) = fixture();
        let scene = |day: u32, v: f32| RadarScene {
            date: date(day),
            vv: Array2::from_elem((6, 6), v),
            vh: Array2::from_elem((6, 6), v / 2.0),
            angle: Array2::from_elem((6, 6), 38.0),
        };
        let scenes = vec![scene(1, 0.2), scene(2, 0.4)];
        let (vh, vv, angle) = radar_composite(&scenes, &mask, &aoi, grid);
        assert_relative_eq!(vv[[3, 3]], 0.3, epsilon = 1e-6);
        assert_relative_eq!(vh[[3, 3]], 0.15, epsilon = 1e-6);
        assert_relative_eq!(angle[[3, 3]], 38.0);
    }

    #[test]
    fn mean_filter_smooths_point_target() {
        let mut image = Array2::from_elem((9, 9), 1.0f32);
        image[[4, 4]] = 100.0;
        let filtered = mean_filter(&image, 3);
        assert!(filtered[[4, 4]] < 100.0);
        assert_relative_eq!(filtered[[0, 0]], 1.0); // corner window is truncated
    }
}
