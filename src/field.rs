//! Dense scalar grids bound to a world-space rectangle.
//!
//! Cells are addressed as `(i, j)` where `i` is the row (world `y` axis,
//! `0..ny`) and `j` the column (world `x` axis, `0..nx`). Storage is row-major,
//! so the linear index of `(i, j)` is `i * nx + j`.
//!
//! Two storages share one [`Lattice`]: [`GridField`] owns plain `f32` values
//! and is copied by value, [`AtomicField`] stores [`AF32`] so that many
//! transport events may mutate it at once.

use crate::error::TerrainError;
use crate::AF32;
use glam::Vec2;
use serde::{Deserialize, Serialize};

/// Value returned by [`GridField::value_bilinear`] when the sampling stencil
/// leaves the grid.
pub const OUTSIDE: f32 = -1.0;

/// Axis aligned world-space rectangle.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq)]
pub struct Box2 {
    pub low: Vec2,
    pub high: Vec2,
}

impl Box2 {
    pub const fn new(low: Vec2, high: Vec2) -> Self {
        Self { low, high }
    }

    /// Square box of half-width `radius` around `center`.
    pub fn around(center: Vec2, radius: f32) -> Self {
        Self::new(center - Vec2::splat(radius), center + Vec2::splat(radius))
    }

    /// Smallest box enclosing both boxes.
    pub fn union(&self, other: &Box2) -> Self {
        Self::new(self.low.min(other.low), self.high.max(other.high))
    }

    pub fn size(&self) -> Vec2 {
        self.high - self.low
    }

    pub fn width(&self) -> f32 {
        self.high.x - self.low.x
    }

    pub fn center(&self) -> Vec2 {
        (self.low + self.high) * 0.5
    }

    /// Inclusive containment test.
    pub fn contains(&self, p: Vec2) -> bool {
        p.x >= self.low.x && p.y >= self.low.y && p.x <= self.high.x && p.y <= self.high.y
    }
}

/// Geometry shared by every layer of a terrain: resolution plus world box.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq)]
pub struct Lattice {
    bounds: Box2,
    nx: usize,
    ny: usize,
}

impl Lattice {
    /// Validates that both axes have at least two samples and that the box
    /// has a positive extent, since world/grid mapping divides by `n - 1`.
    pub fn new(nx: usize, ny: usize, bounds: Box2) -> Result<Self, TerrainError> {
        if nx < 2 || ny < 2 {
            return Err(TerrainError::InvalidResolution { nx, ny });
        }
        let size = bounds.size();
        if !(size.x > 0.0 && size.y > 0.0) {
            return Err(TerrainError::DegenerateBox {
                width: size.x,
                height: size.y,
            });
        }
        Ok(Self { bounds, nx, ny })
    }

    #[inline]
    pub fn nx(&self) -> usize {
        self.nx
    }

    #[inline]
    pub fn ny(&self) -> usize {
        self.ny
    }

    #[inline]
    pub fn bounds(&self) -> Box2 {
        self.bounds
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nx * self.ny
    }

    #[inline]
    pub fn index(&self, i: usize, j: usize) -> usize {
        i * self.nx + j
    }

    #[inline]
    pub fn index_2d(&self, index: usize) -> (usize, usize) {
        (index / self.nx, index % self.nx)
    }

    #[inline]
    pub fn inside(&self, i: isize, j: isize) -> bool {
        i >= 0 && j >= 0 && (i as usize) < self.ny && (j as usize) < self.nx
    }

    /// Whether the cell a world point truncates to lies on the grid.
    pub fn inside_world(&self, p: Vec2) -> bool {
        let (i, j) = self.cell_integer(p);
        self.inside(i, j)
    }

    /// World distance between two adjacent samples along each axis.
    #[inline]
    pub fn spacing(&self) -> Vec2 {
        let size = self.bounds.size();
        Vec2::new(size.x / (self.nx - 1) as f32, size.y / (self.ny - 1) as f32)
    }

    /// World position of a grid sample.
    #[inline]
    pub fn vertex(&self, i: usize, j: usize) -> Vec2 {
        self.bounds.low + Vec2::new(j as f32, i as f32) * self.spacing()
    }

    /// Maps a world point to the cell it falls in, truncating toward zero.
    /// The result may be off the grid; check it with [`Lattice::inside`].
    #[inline]
    pub fn cell_integer(&self, p: Vec2) -> (isize, isize) {
        let local = (p - self.bounds.low) / self.spacing();
        (local.y as isize, local.x as isize)
    }

    /// Central differences inside, one-sided differences on the border.
    /// Returned in world axes: `x` follows columns, `y` follows rows.
    pub fn gradient(&self, i: usize, j: usize, value: impl Fn(usize) -> f32) -> Vec2 {
        let spacing = self.spacing();
        let at = |i: usize, j: usize| value(self.index(i, j));

        let gx = if j == 0 {
            (at(i, j + 1) - at(i, j)) / spacing.x
        } else if j == self.nx - 1 {
            (at(i, j) - at(i, j - 1)) / spacing.x
        } else {
            (at(i, j + 1) - at(i, j - 1)) / (2.0 * spacing.x)
        };

        let gy = if i == 0 {
            (at(i + 1, j) - at(i, j)) / spacing.y
        } else if i == self.ny - 1 {
            (at(i, j) - at(i - 1, j)) / spacing.y
        } else {
            (at(i + 1, j) - at(i - 1, j)) / (2.0 * spacing.y)
        };

        Vec2::new(gx, gy)
    }

    /// Bilinear interpolation at a world point, `None` when the 2x2 stencil
    /// is not fully on the grid.
    pub fn bilinear(&self, p: Vec2, value: impl Fn(usize) -> f32) -> Option<f32> {
        let local = (p - self.bounds.low) / self.spacing();
        let (fi, fj) = (local.y.floor(), local.x.floor());
        let (i, j) = (fi as isize, fj as isize);
        if !self.inside(i, j) || !self.inside(i + 1, j + 1) {
            return None;
        }
        let (i, j) = (i as usize, j as usize);
        let u = local.x - fj;
        let v = local.y - fi;

        let v00 = value(self.index(i, j));
        let v01 = value(self.index(i, j + 1));
        let v10 = value(self.index(i + 1, j));
        let v11 = value(self.index(i + 1, j + 1));

        Some(
            (1.0 - u) * (1.0 - v) * v00
                + u * (1.0 - v) * v01
                + (1.0 - u) * v * v10
                + u * v * v11,
        )
    }
}

/// A value-owned grid of `f32`. Cloning deep-copies the samples.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct GridField {
    lattice: Lattice,
    values: Vec<f32>,
}

impl GridField {
    pub fn new(lattice: Lattice, value: f32) -> Self {
        Self {
            lattice,
            values: vec![value; lattice.len()],
        }
    }

    /// Builds a field by evaluating `f(i, j)` on every sample.
    pub fn from_fn(lattice: Lattice, mut f: impl FnMut(usize, usize) -> f32) -> Self {
        let values = (0..lattice.len())
            .map(|index| {
                let (i, j) = lattice.index_2d(index);
                f(i, j)
            })
            .collect();
        Self { lattice, values }
    }

    #[inline]
    pub fn lattice(&self) -> &Lattice {
        &self.lattice
    }

    #[inline]
    pub fn nx(&self) -> usize {
        self.lattice.nx
    }

    #[inline]
    pub fn ny(&self) -> usize {
        self.lattice.ny
    }

    #[inline]
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    #[inline]
    pub fn values_mut(&mut self) -> &mut [f32] {
        &mut self.values
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> f32 {
        self.values[self.lattice.index(i, j)]
    }

    #[inline]
    pub fn get_index(&self, index: usize) -> f32 {
        self.values[index]
    }

    #[inline]
    pub fn set(&mut self, i: usize, j: usize, value: f32) {
        let index = self.lattice.index(i, j);
        self.values[index] = value;
    }

    #[inline]
    pub fn add(&mut self, i: usize, j: usize, delta: f32) {
        let index = self.lattice.index(i, j);
        self.values[index] += delta;
    }

    #[inline]
    pub fn remove(&mut self, i: usize, j: usize, delta: f32) {
        let index = self.lattice.index(i, j);
        self.values[index] -= delta;
    }

    /// Bounds-checked read for setup and test code.
    pub fn checked_get(&self, i: isize, j: isize) -> Option<f32> {
        self.lattice
            .inside(i, j)
            .then(|| self.get(i as usize, j as usize))
    }

    /// Bounds-checked mutable access for setup and test code.
    pub fn checked_get_mut(&mut self, i: isize, j: isize) -> Option<&mut f32> {
        if !self.lattice.inside(i, j) {
            return None;
        }
        let index = self.lattice.index(i as usize, j as usize);
        self.values.get_mut(index)
    }

    pub fn fill(&mut self, value: f32) {
        self.values.fill(value);
    }

    pub fn min(&self) -> f32 {
        self.values.iter().copied().fold(f32::INFINITY, f32::min)
    }

    pub fn max(&self) -> f32 {
        self.values.iter().copied().fold(f32::NEG_INFINITY, f32::max)
    }

    pub fn sum(&self) -> f64 {
        self.values.iter().map(|&x| x as f64).sum()
    }

    pub fn average(&self) -> f32 {
        (self.sum() / self.values.len() as f64) as f32
    }

    pub fn gradient(&self, i: usize, j: usize) -> Vec2 {
        self.lattice.gradient(i, j, |index| self.values[index])
    }

    pub fn try_value_bilinear(&self, p: Vec2) -> Option<f32> {
        self.lattice.bilinear(p, |index| self.values[index])
    }

    /// Bilinear sample at a world point, or [`OUTSIDE`] when off the grid.
    pub fn value_bilinear(&self, p: Vec2) -> f32 {
        self.try_value_bilinear(p).unwrap_or(OUTSIDE)
    }

    /// Element-wise sum with a co-registered field.
    pub fn add_field(&mut self, other: &GridField) {
        self.values
            .iter_mut()
            .zip(other.values.iter())
            .for_each(|(x, y)| *x += y);
    }

    /// Element-wise difference with a co-registered field.
    pub fn remove_field(&mut self, other: &GridField) {
        self.values
            .iter_mut()
            .zip(other.values.iter())
            .for_each(|(x, y)| *x -= y);
    }

    /// Replaces every value `<= threshold` with `value`.
    pub fn threshold_inferior(&mut self, threshold: f32, value: f32) {
        self.values
            .iter_mut()
            .filter(|x| **x <= threshold)
            .for_each(|x| *x = value);
    }

    /// Rescales the values to `[0, 1]`. A constant field becomes all zeros.
    pub fn normalize(&mut self) {
        let (min, max) = (self.min(), self.max());
        let range = max - min;
        if range <= 0.0 {
            self.fill(0.0);
            return;
        }
        self.values.iter_mut().for_each(|x| *x = (*x - min) / range);
    }

    /// Box blur over a `(2r + 1)^2` window, clamped at the borders.
    pub fn blur(&mut self, radius: usize) {
        if radius == 0 {
            return;
        }
        let (nx, ny) = (self.nx(), self.ny());
        let source = self.values.clone();
        for i in 0..ny {
            let i0 = i.saturating_sub(radius);
            let i1 = (i + radius).min(ny - 1);
            for j in 0..nx {
                let j0 = j.saturating_sub(radius);
                let j1 = (j + radius).min(nx - 1);
                let mut sum = 0.0;
                for a in i0..=i1 {
                    sum += source[a * nx + j0..=a * nx + j1].iter().sum::<f32>();
                }
                let count = ((i1 - i0 + 1) * (j1 - j0 + 1)) as f32;
                self.values[i * nx + j] = sum / count;
            }
        }
    }
}

/// A grid whose samples may be updated concurrently through shared references.
///
/// Every mutation is a single atomic read-modify-write on one cell, so
/// individual updates are never lost, while sequences of updates from
/// different events may interleave.
#[derive(Clone)]
pub struct AtomicField {
    lattice: Lattice,
    values: Vec<AF32>,
}

impl AtomicField {
    pub fn from_field(field: &GridField) -> Self {
        Self {
            lattice: field.lattice,
            values: field.values.iter().map(|&x| AF32::new(x)).collect(),
        }
    }

    pub fn to_field(&self) -> GridField {
        GridField {
            lattice: self.lattice,
            values: self.snapshot(),
        }
    }

    /// Plain copy of the current samples.
    pub fn snapshot(&self) -> Vec<f32> {
        self.values.iter().map(AF32::load).collect()
    }

    #[inline]
    pub fn lattice(&self) -> &Lattice {
        &self.lattice
    }

    /// Exclusive access for phases that write each cell from exactly one task.
    #[inline]
    pub fn values_mut(&mut self) -> &mut [AF32] {
        &mut self.values
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> f32 {
        self.values[self.lattice.index(i, j)].load()
    }

    #[inline]
    pub fn get_index(&self, index: usize) -> f32 {
        self.values[index].load()
    }

    #[inline]
    pub fn add(&self, index: usize, delta: f32) {
        self.values[index].fetch_add(delta);
    }

    #[inline]
    pub fn sub(&self, index: usize, delta: f32) {
        self.values[index].fetch_sub(delta);
    }

    /// Atomically removes up to `amount` from a cell without taking it below
    /// zero. Returns what was actually removed.
    pub fn take(&self, index: usize, amount: f32) -> f32 {
        let previous = self.values[index].fetch_update(|current| {
            if current <= 0.0 {
                None
            } else {
                Some(current - amount.min(current))
            }
        });
        match previous {
            Ok(previous) => amount.min(previous),
            Err(_) => 0.0,
        }
    }

    pub fn sum(&self) -> f64 {
        self.values.iter().map(|x| x.load() as f64).sum()
    }

    pub fn gradient(&self, i: usize, j: usize) -> Vec2 {
        self.lattice.gradient(i, j, |index| self.values[index].load())
    }

    pub fn try_value_bilinear(&self, p: Vec2) -> Option<f32> {
        self.lattice.bilinear(p, |index| self.values[index].load())
    }
}
