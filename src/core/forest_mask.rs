//! Forest mask provider.
//!
//! Selects the binary forest/non-forest raster gating which pixels are
//! eligible for sampling and training. A pixel holds 1.0 when it is
//! eligible and `NaN` otherwise; downstream consumers test `value == 1.0`.
//! A date window with no coverage yields an all-`NaN` mask, which flows
//! downstream as an empty reference table rather than an error.

use chrono::NaiveDate;
use ndarray::Array2;

use crate::io::catalog::{DateWindow, LandCoverScene, SceneCatalog};
use crate::io::fetch::{fetch_with_retry, RetryPolicy};
use crate::types::{Aoi, ChResult, Grid, MaskMode, Raster};

/// Yearly forest/non-forest query window.
pub const FNF_WINDOW: (i32, u32, u32, i32, u32, u32) = (2017, 1, 1, 2020, 12, 31);

/// Land-cover query window.
pub const DW_WINDOW: (i32, u32, u32, i32, u32, u32) = (2022, 7, 1, 2023, 7, 1);

/// Land-cover class code for trees.
pub const DW_TREES_CLASS: f32 = 1.0;

fn window(bounds: (i32, u32, u32, i32, u32, u32)) -> DateWindow {
    // Constants above are valid calendar dates.
    let start = NaiveDate::from_ymd_opt(bounds.0, bounds.1, bounds.2).unwrap_or_default();
    let end = NaiveDate::from_ymd_opt(bounds.3, bounds.4, bounds.5).unwrap_or_default();
    DateWindow::new(start, end)
}

/// Build the forest mask for the AOI on the analysis grid.
pub fn forest_mask<C: SceneCatalog>(
    catalog: &C,
    aoi: &Aoi,
    mode: MaskMode,
    grid: Grid,
    retry: &RetryPolicy,
) -> ChResult<Raster> {
    log::info!("building forest mask, mode {mode:?}");
    let mask = match mode {
        MaskMode::Fnf => {
            let scenes = fetch_with_retry("forest_mask/fnf", retry, || {
                catalog.forest_non_forest(aoi, &window(FNF_WINDOW))
            })?;
            from_fnf(aoi, grid, &scenes)
        }
        MaskMode::Dw => {
            let scenes = fetch_with_retry("forest_mask/land_cover", retry, || {
                catalog.land_cover(aoi, &window(DW_WINDOW))
            })?;
            from_land_cover(aoi, grid, &scenes)
        }
        MaskMode::None => no_exclusion(aoi, grid),
    };
    log::debug!(
        "forest mask: {} of {} pixels eligible",
        mask.valid_count(),
        grid.rows * grid.cols
    );
    Ok(mask)
}

/// Most recent-window yearly classification: classes 1 and 2 are forest.
/// Pixels outside those classes, without source data, or outside the AOI
/// are genuinely absent, not zero.
fn from_fnf(aoi: &Aoi, grid: Grid, scenes: &[LandCoverScene]) -> Raster {
    let Some(scene) = scenes.first() else {
        log::warn!("no forest/non-forest coverage in query window, mask is empty");
        return Raster::empty(grid);
    };
    build_mask(aoi, grid, &scene.labels, |label| {
        label == 1.0 || label == 2.0
    })
}

/// Land-cover classification: only the trees class is eligible.
fn from_land_cover(aoi: &Aoi, grid: Grid, scenes: &[LandCoverScene]) -> Raster {
    let Some(scene) = scenes.first() else {
        log::warn!("no land-cover coverage in query window, mask is empty");
        return Raster::empty(grid);
    };
    build_mask(aoi, grid, &scene.labels, |label| label == DW_TREES_CLASS)
}

/// Default mode: every AOI pixel is eligible.
fn no_exclusion(aoi: &Aoi, grid: Grid) -> Raster {
    let mut mask = Raster::empty(grid);
    for row in 0..grid.rows {
        for col in 0..grid.cols {
            let (x, y) = grid.pixel_center(row, col);
            if aoi.contains(x, y) {
                mask.data[[row, col]] = 1.0;
            }
        }
    }
    mask
}

fn build_mask<F>(aoi: &Aoi, grid: Grid, labels: &Array2<f32>, eligible: F) -> Raster
where
    F: Fn(f32) -> bool,
{
    let mut mask = Raster::empty(grid);
    if labels.dim() != (grid.rows, grid.cols) {
        log::warn!(
            "classification shape {:?} does not match grid {}x{}, mask is empty",
            labels.dim(),
            grid.rows,
            grid.cols
        );
        return mask;
    }
    for row in 0..grid.rows {
        for col in 0..grid.cols {
            let (x, y) = grid.pixel_center(row, col);
            if !aoi.contains(x, y) {
                continue;
            }
            let label = labels[[row, col]];
            if !label.is_nan() && eligible(label) {
                mask.data[[row, col]] = 1.0;
            }
        }
    }
    mask
}
