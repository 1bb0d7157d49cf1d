//! One stochastic transport event: lift, saltate, reptate, deposit.

use crate::field::Box2;
use crate::flow::{self, Flows, Layer};
use crate::random::UniformSource;
use crate::Terrain;
use glam::Vec2;
use std::sync::atomic::Ordering;

/// Hop count at which reptation moves a full quantum.
const FULL_REPTATION_BOUNCES: usize = 3;
/// Reptation feeds at most this many of the steepest neighbours.
const REPTATION_TARGETS: usize = 2;

/// Wraps a world point into `bounds`, which is treated as a torus.
///
/// Each axis is reduced modulo the box size relative to `bounds.low`; a
/// point exactly on the high edge lands on the low edge.
pub fn snap_world(bounds: Box2, p: Vec2) -> Vec2 {
    let size = bounds.size();
    let wrap = |x: f32, size: f32| {
        let x = x.rem_euclid(size);
        if x >= size {
            0.0
        } else {
            x
        }
    };
    let local = p - bounds.low;
    bounds.low + Vec2::new(wrap(local.x, size.x), wrap(local.y, size.y))
}

/// `0` below `a`, `1` above `b`, cubic Hermite ramp in between.
pub fn smoothstep(x: f32, a: f32, b: f32) -> f32 {
    if x <= a {
        0.0
    } else if x >= b {
        1.0
    } else {
        let t = (x - a) / (b - a);
        t * t * (3.0 - 2.0 * t)
    }
}

/// `+1`, `-1` or `0` depending on the sign of one wind component.
fn axis_step(x: f32) -> f32 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

impl Terrain {
    /// How strongly `(i, j)` is sheltered from `wind`, in `[0, 1]`.
    ///
    /// Walks upwind one world unit per axis at a time, wrapping around the
    /// domain, up to `shadow_radius`. Every sample higher than the cell
    /// casts a shadow ramping from `tan_shadow_min` to `tan_shadow_max`;
    /// the strongest one wins.
    pub fn shadow_probability(&self, i: usize, j: usize, wind: Vec2) -> f32 {
        let step = Vec2::new(axis_step(wind.x), axis_step(wind.y));
        if step == Vec2::ZERO {
            return 0.0;
        }

        let bounds = self.lattice.bounds();
        let p = self.lattice.vertex(i, j);
        let hp = self.height(i, j);
        let mut upwind = p;
        let mut shadow = 0.0f32;
        loop {
            upwind -= step;
            let d = p.distance(upwind);
            if d > self.settings.shadow_radius {
                break;
            }
            let snapped = snap_world(bounds, upwind);
            if snapped.abs_diff_eq(p, 1e-4) {
                break;
            }
            let rise = self.surface_height(snapped) - hp;
            let s = smoothstep(
                rise / d,
                self.settings.tan_shadow_min,
                self.settings.tan_shadow_max,
            );
            shadow = shadow.max(s);
        }
        shadow
    }

    /// Height at an in-domain world point, bilinear where the stencil fits
    /// and nearest-below otherwise.
    fn surface_height(&self, p: Vec2) -> f32 {
        self.height_at(p).unwrap_or_else(|| {
            let (i, j) = self.cell_at(p);
            self.height(i, j)
        })
    }

    /// Grid cell holding a snapped world point.
    fn cell_at(&self, p: Vec2) -> (usize, usize) {
        let (i, j) = self.lattice.cell_integer(p);
        (
            i.clamp(0, self.lattice.ny() as isize - 1) as usize,
            j.clamp(0, self.lattice.nx() as isize - 1) as usize,
        )
    }

    /// Wind at a cell, sped up to twice its base speed where the sediment
    /// surface climbs steeply along it.
    pub fn wind_at_cell(&self, i: usize, j: usize) -> Vec2 {
        let wind = self
            .wind
            .direction(self.lattice.vertex(i, j), self.step_count as f32);
        let g = self.sediments.gradient(i, j);

        let (mut similarity, mut slope) = (0.0, 0.0);
        if g != Vec2::ZERO && wind != Vec2::ZERO {
            similarity = g.normalize().dot(wind.normalize()).clamp(0.0, 1.0);
            slope = g.length().clamp(0.0, 1.0);
        }
        wind.lerp(wind * 2.0, (similarity + slope) / 2.0)
    }

    /// Receivers of the creep after a saltation bounce on `(i, j)`, with
    /// the amount each one gets. The further the grain came, the more sand
    /// it knocks onto the two steepest downhill neighbours in range.
    pub(crate) fn reptation_targets(
        &self,
        i: usize,
        j: usize,
        bounce: usize,
    ) -> Option<(f32, Flows)> {
        let quantum = self.settings.transport_quantum;
        let t = bounce.min(FULL_REPTATION_BOUNCES) as f32 / FULL_REPTATION_BOUNCES as f32;
        let amount = quantum / 2.0 + (quantum - quantum / 2.0) * t;

        let flows = flow::steepest(
            self.compute_flow(Layer::Sediment, i, j, self.settings.tan_repose_sediment),
            REPTATION_TARGETS,
        );
        if flows.is_empty() {
            return None;
        }

        let p = self.lattice.vertex(i, j);
        let per_target = amount / flows.len() as f32;
        let near = flows
            .iter()
            .copied()
            .filter(|f| {
                p.distance_squared(self.lattice.vertex(f.i, f.j))
                    <= self.settings.reptation_radius_squared
            })
            .collect::<Flows>();
        (!near.is_empty()).then_some((per_target, near))
    }

    fn reptation(&self, i: usize, j: usize, bounce: usize) {
        let Some((per_target, near)) = self.reptation_targets(i, j, bounce) else {
            return;
        };
        let taken = self
            .sediments
            .take(self.lattice.index(i, j), per_target * near.len() as f32);
        let share = taken / near.len() as f32;
        for f in near.iter() {
            self.sediments.add(self.lattice.index(f.i, f.j), share);
        }
    }

    /// Bedrock height a grain carried by `wind` grinds off cell `index`.
    pub(crate) fn abrasion_strength(&self, index: usize, wind: Vec2) -> f32 {
        let (i, j) = self.lattice.index_2d(index);
        let vegetation = self.vegetation_cover(index);
        let hardness = self.hardness_at(index, self.lattice.vertex(i, j));
        let speed = wind.length().clamp(0.0, 2.0);
        self.settings.abrasion_epsilon * (1.0 - vegetation) * (1.0 - hardness) * speed
    }

    fn abrade(&self, index: usize, wind: Vec2) {
        let strength = self.abrasion_strength(index, wind);
        if strength <= 0.0 {
            return;
        }
        self.bedrock.sub(index, strength);
        self.abrasion_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Whether a grain landing on `(i, j)` with draw `p` settles there.
    /// Shadowed cells catch it first, then sand catches more than bare rock,
    /// and vegetation raises both odds.
    pub(crate) fn settles(&self, i: usize, j: usize, wind: Vec2, p: f32) -> bool {
        let index = self.lattice.index(i, j);
        let cover = self.vegetation_cover(index);
        let sandy = self.sediments.get_index(index) > 0.0;
        p < self.shadow_probability(i, j, wind)
            || (sandy && p < 0.6 + cover * 0.4)
            || (!sandy && p < 0.4 + cover * 0.6)
    }

    /// Runs one transport event from a random cell.
    ///
    /// Only sediment and bedrock are touched, through atomic updates, so any
    /// number of events may run at once on the same terrain.
    pub fn transport_event<R: UniformSource + ?Sized>(&self, rng: &mut R) {
        let i = rng.integer() as usize % self.lattice.ny();
        let j = rng.integer() as usize % self.lattice.nx();
        let start = self.lattice.index(i, j);
        if self.sediments.get_index(start) <= 0.0 {
            return;
        }

        let wind = self.wind_at_cell(i, j);
        let start_cover = self.vegetation_cover(start);
        let retention = self.shadow_probability(i, j, wind).max(start_cover);
        if rng.uniform() < retention {
            self.stabilize_sediment(i, j);
            return;
        }

        let lifted = self.sediments.take(start, self.settings.transport_quantum);
        if lifted <= 0.0 {
            return;
        }

        let bounds = self.lattice.bounds();
        let mut pos = self.lattice.vertex(i, j);
        let (mut di, mut dj) = (i, j);
        let mut bounce = 0;
        loop {
            let wind = self.wind_at_cell(di, dj);
            pos = snap_world(bounds, pos + wind);
            (di, dj) = self.cell_at(pos);
            let dest = self.lattice.index(di, dj);

            if self.settings.abrasion
                && rng.uniform() < self.settings.abrasion_probability
                && self.sediments.get_index(dest) < self.settings.abrasion_sediment_limit
            {
                self.abrade(dest, wind);
            }

            if self.settles(di, dj, wind, rng.uniform()) {
                self.sediments.add(dest, lifted);
                break;
            }

            bounce += 1;
            if rng.uniform() < 1.0 - start_cover {
                self.reptation(di, dj, bounce);
            }
        }

        if rng.uniform() < 1.0 - start_cover {
            self.reptation(di, dj, bounce);
        }

        self.stabilize_sediment(i, j);
        self.stabilize_sediment(di, dj);
    }
}
