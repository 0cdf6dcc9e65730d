//! Spatial sampling designer.
//!
//! Downsamples the dense pixel population to an approximately even spatial
//! distribution at a configurable cell spacing, respecting the forest mask.
//! Used whenever exhaustive per-pixel sampling would be too large.
//!
//! Selection is grid-based local-maximum picking: every pixel gets a
//! deterministic pseudo-random tag, each grid cell elects the pixel holding
//! the locally maximal tag, and a parity filter keeps only cells with even
//! coordinates in both axes to avoid adjacency artifacts. Retained pixels
//! become centroid points buffered by half the cell spacing.

use std::collections::BTreeMap;

use crate::types::{Aoi, ChError, ChResult, Grid, Raster, SamplePolygon};

/// Upper bound of the random tag range. Ties among equal maxima are
/// vanishingly rare at this range and resolved arbitrarily.
pub const TAG_RANGE: u64 = 1_000_000;

/// Fixed seed used by the orchestrator's only call site.
pub const DESIGN_SEED: u64 = 1;

/// Deterministic per-pixel tag in 1..=TAG_RANGE. Pure function of
/// (seed, row, col), so the design never depends on iteration order.
fn pixel_tag(seed: u64, row: usize, col: usize) -> u64 {
    // splitmix64 over the packed coordinates
    let mut z = seed
        .wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .wrapping_add((row as u64).wrapping_mul(0xA24B_AED4_963E_E407))
        .wrapping_add((col as u64).wrapping_mul(0x9FB2_1C65_1E98_DF25));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z = z ^ (z >> 31);
    z % TAG_RANGE + 1
}

/// Rendering scale in meters for the AOI area, in hectares.
pub fn render_scale_for_area(area_ha: f64) -> f64 {
    if area_ha < 2_000.0 {
        10.0
    } else if area_ha < 10_000.0 {
        50.0
    } else if area_ha < 330_000.0 {
        100.0
    } else if area_ha < 2_200_000.0 {
        200.0
    } else {
        250.0
    }
}

/// Sampling cell size in meters for the AOI area, in hectares.
///
/// The tiering is the main area-adaptivity mechanism protecting large AOIs
/// from excessive sample counts; a rendering scale of exactly 100 m forces
/// the 4000 m cell regardless of area.
pub fn cell_size_for_area(area_ha: f64, render_scale: f64) -> f64 {
    if render_scale == 100.0 {
        return 4_000.0;
    }
    if area_ha < 5_000.0 {
        100.0
    } else if area_ha < 1_000_000.0 {
        4_000.0
    } else if area_ha < 3_000_000.0 {
        6_000.0
    } else {
        50_000.0
    }
}

/// Per-cell winners: cell coordinates to (tag, row, col) of the maximal
/// pixel. `BTreeMap` keeps the result ordering deterministic.
type CellWinners = BTreeMap<(i64, i64), (u64, usize, usize)>;

fn local_maxima<F>(aoi: &Aoi, grid: &Grid, cell_size: f64, seed: u64, keep: F) -> CellWinners
where
    F: Fn(usize, usize, i64, i64) -> bool,
{
    let mut winners = CellWinners::new();
    for row in 0..grid.rows {
        for col in 0..grid.cols {
            let (x, y) = grid.pixel_center(row, col);
            if !aoi.contains(x, y) {
                continue;
            }
            let cell = (
                (x / cell_size).floor() as i64,
                (y / cell_size).floor() as i64,
            );
            if !keep(row, col, cell.0, cell.1) {
                continue;
            }
            let tag = pixel_tag(seed, row, col);
            let entry = winners.entry(cell).or_insert((0, row, col));
            if tag > entry.0 {
                *entry = (tag, row, col);
            }
        }
    }
    winners
}

/// Generate buffered sampling sites over the AOI at roughly `cell_size`
/// spacing, constrained to the forest mask.
pub fn generate_sampling_sites(
    aoi: &Aoi,
    grid: &Grid,
    cell_size: f64,
    seed: u64,
    mask: &Raster,
) -> ChResult<Vec<SamplePolygon>> {
    if cell_size <= 0.0 {
        return Err(ChError::Config(format!(
            "sampling cell size must be positive, got {cell_size}"
        )));
    }
    if mask.data.dim() != (grid.rows, grid.cols) {
        return Err(ChError::BandStack(
            "forest mask does not match the analysis grid".to_string(),
        ));
    }

    // First pass: one candidate per cell, no constraints. Only its count is
    // of interest; the strict pass below decides the actual sites.
    let candidates = local_maxima(aoi, grid, cell_size, seed, |_, _, _, _| true);
    log::debug!(
        "sampling design: {} candidate cells at {cell_size} m",
        candidates.len()
    );

    // Strict pass: parity filter (even cell coordinates on both axes)
    // intersected with the forest mask.
    let strict = local_maxima(aoi, grid, cell_size, seed, |row, col, cx, cy| {
        cx.rem_euclid(2) == 0 && cy.rem_euclid(2) == 0 && mask.data[[row, col]] == 1.0
    });

    let sites: Vec<SamplePolygon> = strict
        .values()
        .map(|&(_, row, col)| {
            let (x, y) = grid.pixel_center(row, col);
            SamplePolygon {
                x,
                y,
                radius: cell_size / 2.0,
            }
        })
        .collect();
    log::info!(
        "sampling design: {} sites retained of {} candidates",
        sites.len(),
        candidates.len()
    );
    Ok(sites)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Aoi;

    fn design_fixture() -> (Aoi, Grid, Raster) {
        let aoi = Aoi::rectangle(0.0, 0.0, 800.0, 800.0).unwrap();
        let grid = aoi.grid(10.0).unwrap();
        let mask = Raster::filled(grid, 1.0);
        (aoi, grid, mask)
    }

    #[test]
    fn render_scale_tiers() {
        assert_eq!(render_scale_for_area(1_999.0), 10.0);
        assert_eq!(render_scale_for_area(2_000.0), 50.0);
        assert_eq!(render_scale_for_area(9_999.0), 50.0);
        assert_eq!(render_scale_for_area(10_000.0), 100.0);
        assert_eq!(render_scale_for_area(329_999.0), 100.0);
        assert_eq!(render_scale_for_area(330_000.0), 200.0);
        assert_eq!(render_scale_for_area(2_199_999.0), 200.0);
        assert_eq!(render_scale_for_area(2_200_000.0), 250.0);
    }

    #[test]
    fn cell_size_tier_boundaries() {
        // scale comes from the matching render tier in each case
        assert_eq!(cell_size_for_area(4_999.0, 50.0), 100.0);
        assert_eq!(cell_size_for_area(5_000.0, 50.0), 4_000.0);
        assert_eq!(cell_size_for_area(999_999.0, 200.0), 4_000.0);
        assert_eq!(cell_size_for_area(1_000_000.0, 200.0), 6_000.0);
        assert_eq!(cell_size_for_area(2_999_999.0, 250.0), 6_000.0);
        assert_eq!(cell_size_for_area(3_000_000.0, 250.0), 50_000.0);
    }

    #[test]
    fn scale_100_forces_4000m_cells() {
        assert_eq!(cell_size_for_area(20_000.0, 100.0), 4_000.0);
        assert_eq!(cell_size_for_area(329_000.0, 100.0), 4_000.0);
    }

    #[test]
    fn design_is_deterministic() {
        let (aoi, grid, mask) = design_fixture();
        let a = generate_sampling_sites(&aoi, &grid, 100.0, 1, &mask).unwrap();
        let b = generate_sampling_sites(&aoi, &grid, 100.0, 1, &mask).unwrap();
        assert!(!a.is_empty());
        assert_eq!(a, b);
    }

    #[test]
    fn different_seeds_move_sites() {
        let (aoi, grid, mask) = design_fixture();
        let a = generate_sampling_sites(&aoi, &grid, 100.0, 1, &mask).unwrap();
        let b = generate_sampling_sites(&aoi, &grid, 100.0, 7, &mask).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn sites_sit_on_even_cells_only() {
        let (aoi, grid, mask) = design_fixture();
        let sites = generate_sampling_sites(&aoi, &grid, 100.0, 1, &mask).unwrap();
        for site in &sites {
            let cx = (site.x / 100.0).floor() as i64;
            let cy = (site.y / 100.0).floor() as i64;
            assert_eq!(cx % 2, 0, "odd x cell at {:?}", site);
            assert_eq!(cy % 2, 0, "odd y cell at {:?}", site);
            assert_eq!(site.radius, 50.0);
        }
    }

    #[test]
    fn mask_constrains_site_placement() {
        let (aoi, grid, _) = design_fixture();
        // Only the west half of the AOI is forest.
        let mut mask = Raster::empty(grid);
        for row in 0..grid.rows {
            for col in 0..grid.cols / 2 {
                mask.data[[row, col]] = 1.0;
            }
        }
        let sites = generate_sampling_sites(&aoi, &grid, 100.0, 1, &mask).unwrap();
        assert!(!sites.is_empty());
        for site in &sites {
            assert!(site.x < 400.0, "site east of the mask at {:?}", site);
        }
    }

    #[test]
    fn empty_mask_yields_no_sites() {
        let (aoi, grid, _) = design_fixture();
        let mask = Raster::empty(grid);
        let sites = generate_sampling_sites(&aoi, &grid, 100.0, 1, &mask).unwrap();
        assert!(sites.is_empty());
    }

    #[test]
    fn invalid_cell_size_is_rejected() {
        let (aoi, grid, mask) = design_fixture();
        assert!(generate_sampling_sites(&aoi, &grid, 0.0, 1, &mask).is_err());
        assert!(generate_sampling_sites(&aoi, &grid, -10.0, 1, &mask).is_err());
    }
}
