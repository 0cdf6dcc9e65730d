//! Sample extraction and train/validation splitting.
//!
//! Small AOIs are sampled exhaustively at the base resolution; large AOIs
//! sample only within the designer's buffered sites at the tiered scale.
//! Either way a sample contributes nothing unless every band holds a value,
//! which guarantees a non-null label in every reference-table row. The
//! uniform `random` column is attached once, immediately after extraction,
//! and fully determines the partition at the 0.7 threshold.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::types::{
    Aoi, BandStack, ChResult, ReferenceTable, SamplePolygon, SampleRecord, BASE_RESOLUTION_M,
};

/// Dense/sparse strategy threshold in hectares.
pub const DENSE_AREA_LIMIT_HA: f64 = 4_000.0;

/// Train/validation split threshold on the `random` column.
pub const SPLIT_THRESHOLD: f64 = 0.7;

/// Seed of the `random` column in every call site.
pub const SAMPLE_SEED: u64 = 0;

/// Extraction strategy, decided by AOI area alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingStrategy {
    /// Exhaustive per-pixel sampling at the base resolution.
    Dense,
    /// Sampling restricted to the designer's buffered sites at the
    /// rendering scale.
    Sparse,
}

impl SamplingStrategy {
    pub fn for_area(area_ha: f64) -> Self {
        if area_ha <= DENSE_AREA_LIMIT_HA {
            Self::Dense
        } else {
            Self::Sparse
        }
    }
}

/// Extract the reference table from the band stack.
///
/// `scale` is the sparse-path sampling scale in meters; the dense path
/// always reads every base-resolution pixel inside the AOI.
pub fn extract_reference(
    stack: &BandStack,
    aoi: &Aoi,
    strategy: SamplingStrategy,
    sites: &[SamplePolygon],
    scale: f64,
) -> ChResult<ReferenceTable> {
    let grid = *stack.grid();
    let stride = match strategy {
        SamplingStrategy::Dense => 1,
        SamplingStrategy::Sparse => {
            ((scale / BASE_RESOLUTION_M).round() as usize).max(1)
        }
    };

    let mut table = ReferenceTable::new(stack.band_names().to_vec());
    for row in (0..grid.rows).step_by(stride) {
        for col in (0..grid.cols).step_by(stride) {
            let (x, y) = grid.pixel_center(row, col);
            let in_region = match strategy {
                SamplingStrategy::Dense => aoi.contains(x, y),
                SamplingStrategy::Sparse => sites.iter().any(|s| s.contains(x, y)),
            };
            if !in_region {
                continue;
            }
            let values = stack.pixel_values(row, col);
            // dropNulls: a sample with any missing band is discarded
            if values.iter().any(|v| v.is_nan()) {
                continue;
            }
            table.rows.push(SampleRecord {
                x,
                y,
                values,
                random: 0.0,
            });
        }
    }
    log::info!(
        "extracted {} samples ({:?} path, stride {stride})",
        table.len(),
        strategy
    );
    Ok(table)
}

/// Attach one independent uniform random value per sample. Assignment is
/// fixed at this point and never recomputed.
pub fn attach_random_column(mut table: ReferenceTable, seed: u64) -> ReferenceTable {
    let mut rng = StdRng::seed_from_u64(seed);
    for record in &mut table.rows {
        record.random = rng.gen::<f64>();
    }
    table
}

/// Split into disjoint, covering training (`random` < threshold) and
/// validation (`random` >= threshold) partitions.
pub fn split(table: ReferenceTable, threshold: f64) -> (ReferenceTable, ReferenceTable) {
    let mut training = ReferenceTable::new(table.columns.clone());
    let mut validation = ReferenceTable::new(table.columns.clone());
    for record in table.rows {
        if record.random < threshold {
            training.rows.push(record);
        } else {
            validation.rows.push(record);
        }
    }
    log::info!(
        "split reference table: {} training / {} validation",
        training.len(),
        validation.len()
    );
    (training, validation)
}
