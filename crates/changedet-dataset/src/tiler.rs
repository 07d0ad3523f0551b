//! N-dimensional tiling of channel-first volumes.
//!
//! A [`Tiler`] lays a regular grid of tiles over a `[C, H, W]` volume. Tiles
//! are enumerated row-major over the mosaic shape, so tile `k` always covers
//! the same region for a given configuration regardless of whether the full
//! volume has been decoded yet. Tiles that would cross the volume border are
//! dropped.

use changedet_core::{Error, Result, Volume};

/// Tile grid over a volume of fixed shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tiler {
    data_shape: [usize; 3],
    tile_shape: [usize; 3],
    overlap: [usize; 3],
    mosaic_shape: [usize; 3],
}

impl Tiler {
    /// Creates a tiler; `overlap` must be strictly smaller than `tile_shape` on every axis
    pub fn new(data_shape: [usize; 3], tile_shape: [usize; 3], overlap: [usize; 3]) -> Result<Self> {
        for axis in 0..3 {
            if tile_shape[axis] == 0 {
                return Err(Error::Config(format!(
                    "tile shape {:?} has an empty axis {}",
                    tile_shape, axis
                )));
            }
            if overlap[axis] >= tile_shape[axis] {
                return Err(Error::Config(format!(
                    "overlap {} must be smaller than tile size {} on axis {}",
                    overlap[axis], tile_shape[axis], axis
                )));
            }
        }

        let mut mosaic_shape = [0; 3];
        for axis in 0..3 {
            let step = tile_shape[axis] - overlap[axis];
            mosaic_shape[axis] = if data_shape[axis] < tile_shape[axis] {
                0
            } else {
                (data_shape[axis] - tile_shape[axis]) / step + 1
            };
        }

        Ok(Self {
            data_shape,
            tile_shape,
            overlap,
            mosaic_shape,
        })
    }

    /// Tiler for a `[C, H, W]` volume that keeps every tile at full channel depth
    pub fn full_depth(
        data_shape: [usize; 3],
        tile: (usize, usize),
        overlap: (usize, usize),
    ) -> Result<Self> {
        let channels = data_shape[0];
        if channels == 0 {
            return Err(Error::InvalidArgument(
                "cannot tile a volume without channels".to_string(),
            ));
        }
        Self::new(
            data_shape,
            [channels, tile.0, tile.1],
            [channels - 1, overlap.0, overlap.1],
        )
    }

    pub fn data_shape(&self) -> [usize; 3] {
        self.data_shape
    }

    pub fn tile_shape(&self) -> [usize; 3] {
        self.tile_shape
    }

    pub fn overlap(&self) -> [usize; 3] {
        self.overlap
    }

    /// Number of tiles along each axis
    pub fn mosaic_shape(&self) -> [usize; 3] {
        self.mosaic_shape
    }

    /// Total number of tiles
    pub fn len(&self) -> usize {
        self.mosaic_shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn step(&self, axis: usize) -> usize {
        self.tile_shape[axis] - self.overlap[axis]
    }

    /// Start coordinate of tile `tile_id` along each axis
    pub fn tile_origin(&self, tile_id: usize) -> Result<[usize; 3]> {
        if tile_id >= self.len() {
            return Err(Error::IndexOutOfRange {
                index: tile_id,
                len: self.len(),
            });
        }
        let mut remainder = tile_id;
        let mut origin = [0; 3];
        for axis in (0..3).rev() {
            let position = remainder % self.mosaic_shape[axis];
            remainder /= self.mosaic_shape[axis];
            origin[axis] = position * self.step(axis);
        }
        Ok(origin)
    }

    /// Copies tile `tile_id` out of `data`
    pub fn get_tile<T: Copy>(&self, data: &Volume<T>, tile_id: usize) -> Result<Volume<T>> {
        if data.shape() != self.data_shape {
            return Err(Error::InvalidArgument(format!(
                "tiler configured for {:?}, got volume of shape {:?}",
                self.data_shape,
                data.shape()
            )));
        }
        let [c0, y0, x0] = self.tile_origin(tile_id)?;
        let [tc, th, tw] = self.tile_shape;
        let mut values = Vec::with_capacity(tc * th * tw);
        for c in c0..c0 + tc {
            let plane = data.plane(c);
            for y in y0..y0 + th {
                let row = y * self.data_shape[2];
                values.extend_from_slice(&plane[row + x0..row + x0 + tw]);
            }
        }
        Volume::new(self.tile_shape, values)
    }

    /// Iterates over every tile of `data` in enumeration order
    pub fn tiles<'a, T: Copy>(
        &'a self,
        data: &'a Volume<T>,
    ) -> impl Iterator<Item = Result<Volume<T>>> + 'a {
        (0..self.len()).map(move |tile_id| self.get_tile(data, tile_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(shape: [usize; 3]) -> Volume<u32> {
        let len = shape.iter().product::<usize>();
        Volume::new(shape, (0..len as u32).collect()).unwrap()
    }

    #[test]
    fn test_mosaic_shape_drop_mode() {
        let tiler = Tiler::full_depth([6, 256, 256], (128, 128), (0, 0)).unwrap();
        assert_eq!(tiler.mosaic_shape(), [1, 2, 2]);
        assert_eq!(tiler.len(), 4);

        let overlapping = Tiler::full_depth([6, 300, 200], (128, 128), (64, 64)).unwrap();
        // (300 - 128) / 64 + 1 = 3, (200 - 128) / 64 + 1 = 2
        assert_eq!(overlapping.mosaic_shape(), [1, 3, 2]);
    }

    #[test]
    fn test_small_volume_yields_no_tiles() {
        let tiler = Tiler::full_depth([6, 100, 300], (128, 128), (0, 0)).unwrap();
        assert!(tiler.is_empty());
        assert!(tiler.tile_origin(0).is_err());
    }

    #[test]
    fn test_overlap_must_be_smaller_than_tile() {
        assert!(Tiler::full_depth([3, 64, 64], (32, 32), (32, 0)).is_err());
        assert!(Tiler::new([3, 64, 64], [0, 32, 32], [0, 0, 0]).is_err());
    }

    #[test]
    fn test_tile_origins_row_major() {
        let tiler = Tiler::full_depth([2, 8, 12], (4, 4), (0, 0)).unwrap();
        assert_eq!(tiler.mosaic_shape(), [1, 2, 3]);
        assert_eq!(tiler.tile_origin(0).unwrap(), [0, 0, 0]);
        assert_eq!(tiler.tile_origin(1).unwrap(), [0, 0, 4]);
        assert_eq!(tiler.tile_origin(2).unwrap(), [0, 0, 8]);
        assert_eq!(tiler.tile_origin(3).unwrap(), [0, 4, 0]);
        assert_eq!(tiler.tile_origin(5).unwrap(), [0, 4, 8]);
    }

    #[test]
    fn test_get_tile_content() {
        let data = ramp([2, 4, 4]);
        let tiler = Tiler::full_depth([2, 4, 4], (2, 2), (1, 0)).unwrap();
        // rows step by 1, columns step by 2
        assert_eq!(tiler.mosaic_shape(), [1, 3, 2]);

        let tile = tiler.get_tile(&data, 3).unwrap();
        assert_eq!(tile.shape(), [2, 2, 2]);
        // origin (row 1, col 2)
        assert_eq!(tile.data(), &[6, 7, 10, 11, 22, 23, 26, 27]);
    }

    #[test]
    fn test_get_tile_rejects_wrong_shape() {
        let tiler = Tiler::full_depth([2, 4, 4], (2, 2), (0, 0)).unwrap();
        let data = ramp([3, 4, 4]);
        assert!(tiler.get_tile(&data, 0).is_err());
    }

    #[test]
    fn test_tiles_cover_volume_without_overlap() {
        let data = ramp([1, 6, 6]);
        let tiler = Tiler::full_depth([1, 6, 6], (3, 3), (0, 0)).unwrap();
        let mut seen: Vec<u32> = tiler
            .tiles(&data)
            .flat_map(|tile| tile.unwrap().into_data())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, data.data().to_vec());
    }
}
