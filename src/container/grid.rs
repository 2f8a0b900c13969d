//! Regular chunk grids: positions, and copying a chunk into its array.

use smallvec::SmallVec;

use super::{ArrayValues, Shape};
use crate::util::Result;

/// Number of chunks along each dimension.
pub fn chunk_grid(shape: &[u64], chunks: &[u64]) -> Shape {
    shape
        .iter()
        .zip(chunks)
        .map(|(&s, &c)| s.div_ceil(c))
        .collect()
}

/// Iterator over the positions of a chunk grid in C order.
pub struct GridPositions {
    grid: Shape,
    next: Option<Shape>,
}

/// All grid positions of a chunk grid in C order.
pub fn grid_positions(grid: &[u64]) -> GridPositions {
    let next = if grid.contains(&0) {
        None
    } else {
        Some(SmallVec::from_elem(0, grid.len()))
    };
    GridPositions {
        grid: Shape::from_slice(grid),
        next,
    }
}

impl Iterator for GridPositions {
    type Item = Shape;

    fn next(&mut self) -> Option<Shape> {
        let current = self.next.take()?;
        let mut pos = current.clone();
        for d in (0..self.grid.len()).rev() {
            pos[d] += 1;
            if pos[d] < self.grid[d] {
                self.next = Some(pos);
                return Some(current);
            }
            pos[d] = 0;
        }
        // Wrapped around every dimension (or a scalar grid): done
        Some(current)
    }
}

/// Copy the in-bounds part of chunk `index` into `out`.
///
/// `chunk` holds a full chunk of `chunks` extents in C order; `out` holds the
/// whole array of `shape`. Edge chunks are clipped to the array.
pub fn scatter_chunk(
    shape: &[u64],
    chunks: &[u64],
    index: &[u64],
    chunk: &ArrayValues,
    out: &mut ArrayValues,
) -> Result<()> {
    let ndim = shape.len();
    if ndim == 0 {
        return out.assign(0, chunk, 0);
    }

    let origin: Shape = index.iter().zip(chunks).map(|(i, c)| i * c).collect();
    if origin.iter().zip(shape).any(|(o, s)| o >= s) {
        return Ok(());
    }
    let extent: Shape = (0..ndim).map(|d| chunks[d].min(shape[d] - origin[d])).collect();

    let mut local: Shape = SmallVec::from_elem(0, ndim);
    loop {
        let mut src = 0u64;
        let mut dst = 0u64;
        for d in 0..ndim {
            src = src * chunks[d] + local[d];
            dst = dst * shape[d] + origin[d] + local[d];
        }
        out.assign(dst as usize, chunk, src as usize)?;

        // Odometer increment, last dimension fastest
        let mut d = ndim;
        loop {
            if d == 0 {
                return Ok(());
            }
            d -= 1;
            local[d] += 1;
            if local[d] < extent[d] {
                break;
            }
            local[d] = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_positions() {
        let flat: Vec<Vec<u64>> = grid_positions(&[2, 2]).map(|p| p.to_vec()).collect();
        assert_eq!(flat, vec![vec![0, 0], vec![0, 1], vec![1, 0], vec![1, 1]]);
        assert_eq!(grid_positions(&[]).count(), 1);
        assert_eq!(grid_positions(&[0]).count(), 0);
        assert_eq!(grid_positions(&[3]).count(), 3);
        assert_eq!(chunk_grid(&[10, 4], &[4, 4]).as_slice(), &[3, 1]);
    }

    #[test]
    fn test_scatter_edge_chunk() {
        // 3x3 array in 2x2 chunks; chunk (1,1) holds one in-bounds element
        let mut out = ArrayValues::Int(vec![0; 9]);
        let chunk = ArrayValues::Int(vec![7, 8, 9, 10]);
        scatter_chunk(&[3, 3], &[2, 2], &[1, 1], &chunk, &mut out).unwrap();
        assert_eq!(out, ArrayValues::Int(vec![0, 0, 0, 0, 0, 0, 0, 0, 7]));

        scatter_chunk(&[3, 3], &[2, 2], &[0, 1], &chunk, &mut out).unwrap();
        assert_eq!(out, ArrayValues::Int(vec![0, 0, 7, 0, 0, 9, 0, 0, 7]));

        // Positions past the array are ignored
        scatter_chunk(&[3, 3], &[2, 2], &[5, 0], &chunk, &mut out).unwrap();
        assert_eq!(out, ArrayValues::Int(vec![0, 0, 7, 0, 0, 9, 0, 0, 7]));
    }
}
