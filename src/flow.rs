//! Angle-of-repose flow directions over the 8-neighbourhood of a cell.

use crate::field::Lattice;
use std::f32::consts::SQRT_2;
use tinyvec::ArrayVec;

/// Offsets `(di, dj)` of the 8 neighbours, in enumeration order.
pub const NEIGHBOURS: [(isize, isize); 8] = [
    (1, 0),
    (1, 1),
    (0, 1),
    (-1, 1),
    (-1, 0),
    (-1, -1),
    (0, -1),
    (1, -1),
];

/// Distance to each neighbour of [`NEIGHBOURS`], in grid steps.
pub const DISTANCES: [f32; 8] = [1.0, SQRT_2, 1.0, SQRT_2, 1.0, SQRT_2, 1.0, SQRT_2];

/// Which elevation a flow is computed on.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Layer {
    /// Combined surface, bedrock plus sediment.
    Sediment,
    /// Bedrock alone.
    Bedrock,
}

/// A neighbour receiving material and its normalized share.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct FlowTarget {
    pub i: usize,
    pub j: usize,
    /// Position in [`NEIGHBOURS`].
    pub direction: u8,
    pub share: f32,
}

pub type Flows = ArrayVec<[FlowTarget; 8]>;

/// Finds the neighbours of `(i, j)` that lie below the repose angle.
///
/// A neighbour qualifies when its elevation drop `step` is positive and
/// `step / cell_size * distance > tan_threshold`. Shares are the slopes
/// `step / distance` normalized over the qualifying neighbours, listed in
/// [`NEIGHBOURS`] order. Neighbours off the grid are ignored.
pub fn compute_flow(
    lattice: &Lattice,
    elevation: impl Fn(usize) -> f32,
    i: usize,
    j: usize,
    cell_size: f32,
    tan_threshold: f32,
) -> Flows {
    let z = elevation(lattice.index(i, j));
    let mut flows = Flows::new();
    let mut slope_sum = 0.0;

    for (k, &(di, dj)) in NEIGHBOURS.iter().enumerate() {
        let (ni, nj) = (i as isize + di, j as isize + dj);
        if !lattice.inside(ni, nj) {
            continue;
        }
        let (ni, nj) = (ni as usize, nj as usize);
        let step = z - elevation(lattice.index(ni, nj));
        if step > 0.0 && step / cell_size * DISTANCES[k] > tan_threshold {
            let slope = step / DISTANCES[k];
            slope_sum += slope;
            flows.push(FlowTarget {
                i: ni,
                j: nj,
                direction: k as u8,
                share: slope,
            });
        }
    }

    for flow in flows.iter_mut() {
        flow.share /= slope_sum;
    }
    flows
}

/// Keeps the `count` largest shares. Equal shares keep enumeration order.
pub fn steepest(mut flows: Flows, count: usize) -> Flows {
    flows.sort_by(|a, b| b.share.total_cmp(&a.share));
    flows.truncate(count);
    flows
}
