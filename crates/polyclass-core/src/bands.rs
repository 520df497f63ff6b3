/// Band-count gate run before any chip is cut.
use crate::error::{PipelineError, PipelineResult};
use crate::raster::RasterTile;

/// Fail on the first tile whose band count differs from the model's.
pub fn validate_bands<'a>(expected: usize, tiles: impl IntoIterator<Item = &'a RasterTile>) -> PipelineResult<()> {
    for tile in tiles {
        if tile.bands != expected {
            return Err(PipelineError::BandMismatch {
                tile: tile.id.clone(),
                expected,
                actual: tile.bands,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tile(id: &str, bands: usize) -> RasterTile {
        RasterTile::new(id, bands, 2, 2, Some(8), 0.0)
    }

    #[test]
    fn matching_tiles_pass() {
        let tiles = [tile("a", 4), tile("b", 4)];
        assert!(validate_bands(4, &tiles).is_ok());
    }

    #[test]
    fn first_mismatch_is_reported() {
        let tiles = [tile("a", 4), tile("b", 3), tile("c", 5)];
        match validate_bands(4, &tiles) {
            Err(PipelineError::BandMismatch { tile, expected, actual }) => {
                assert_eq!(tile, "b");
                assert_eq!(expected, 4);
                assert_eq!(actual, 3);
            }
            other => panic!("expected band mismatch, got {other:?}"),
        }
    }

    #[test]
    fn no_tiles_is_vacuously_valid() {
        assert!(validate_bands(4, std::iter::empty()).is_ok());
    }
}
