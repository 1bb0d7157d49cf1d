//! How the transport events of one simulation step are scheduled.
//!
//! [`AtomicAccumulate`] runs one [`Terrain::transport_event`] per cell on a
//! thread pool, every event mutating the shared layers through atomics.
//! [`PhaseSplit`] instead sweeps the grid in phases separated by barriers,
//! each task writing only its own cell, which makes a step reproducible
//! bit for bit at the cost of whole-cell hops, a bounded hop count and
//! coarser avalanching.

use crate::field::Lattice;
use crate::flow::{self, Flows, NEIGHBOURS};
use crate::random::{task_rng, UniformSource};
use crate::Terrain;
use glam::Vec2;
use log::debug;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Transport events drawn from one random stream.
pub const EVENTS_PER_TASK: usize = 256;

/// A way of running the transport of one simulation step.
pub trait StepStrategy {
    /// Moves sediment (and abrades bedrock) for one step, without the
    /// end-of-step maintenance.
    fn transport_sweep(&self, terrain: &mut Terrain);

    /// One full step: the sweep followed by [`Terrain::end_of_step`].
    fn run_step(&self, terrain: &mut Terrain) {
        self.transport_sweep(terrain);
        terrain.end_of_step();
    }
}

/// One independent event per cell, in any order, with atomic accumulation.
///
/// Events are grouped in tasks of [`EVENTS_PER_TASK`] sharing a random
/// stream seeded from the step and task number. Run sequentially the result
/// is reproducible; run in parallel the interleaving of events is not.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
pub struct AtomicAccumulate {
    pub parallel: bool,
}

impl Default for AtomicAccumulate {
    fn default() -> Self {
        Self { parallel: true }
    }
}

impl StepStrategy for AtomicAccumulate {
    fn transport_sweep(&self, terrain: &mut Terrain) {
        let terrain = &*terrain;
        let events = terrain.lattice.len();
        let tasks = events.div_ceil(EVENTS_PER_TASK);
        let seed = terrain.settings.seed;
        let step = terrain.step_count as u64;

        let run = |task: usize| {
            let mut rng = task_rng(seed, step, task as u64);
            let count = EVENTS_PER_TASK.min(events - task * EVENTS_PER_TASK);
            for _ in 0..count {
                terrain.transport_event(&mut rng);
            }
        };

        if self.parallel {
            (0..tasks).into_par_iter().for_each(run);
        } else {
            (0..tasks).for_each(run);
        }
    }
}

/// Race-free sweep: decide, settle, then relax slopes.
///
/// 1. Every cell decides from the unchanged layers whether it lifts a
///    quantum, and flies it hop by hop through the local wind (at most
///    `max_bounce` hops), recording where it lands, the creep it knocks
///    loose after each bounce and the bedrock it grinds off.
/// 2. The recorded transfers are sorted by cell and gathered, every cell
///    then writing only itself. A cell asked for more sediment than it
///    holds scales all of its departures down.
/// 3. `stabilization_passes` times, every unstable cell sheds up to one
///    quantum to its downhill neighbours, computed on a snapshot.
///
/// Each hop is the wind at the grain's cell rounded to the grid, at least
/// one cell along its dominant axis. Hops wrap around the index space.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct PhaseSplit {
    pub max_bounce: u8,
    pub stabilization_passes: usize,
}

impl Default for PhaseSplit {
    fn default() -> Self {
        Self {
            max_bounce: 3,
            stabilization_passes: 1,
        }
    }
}

/// Whole-cell displacement of one hop.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Hop {
    di: isize,
    dj: isize,
}

impl Hop {
    fn from_wind(wind: Vec2, spacing: Vec2) -> Option<Self> {
        if wind == Vec2::ZERO {
            return None;
        }
        let mut hop = Self {
            di: (wind.y / spacing.y).round() as isize,
            dj: (wind.x / spacing.x).round() as isize,
        };
        if hop.di == 0 && hop.dj == 0 {
            if wind.x.abs() >= wind.y.abs() {
                hop.dj = wind.x.signum() as isize;
            } else {
                hop.di = wind.y.signum() as isize;
            }
        }
        Some(hop)
    }

    fn apply(&self, lattice: &Lattice, i: usize, j: usize) -> (usize, usize) {
        (
            (i as isize + self.di).rem_euclid(lattice.ny() as isize) as usize,
            (j as isize + self.dj).rem_euclid(lattice.nx() as isize) as usize,
        )
    }
}

/// Sediment one cell hands to another during a phase-split step.
#[derive(Copy, Clone, Debug, PartialEq)]
struct Transfer {
    from: u32,
    to: u32,
    amount: f32,
}

/// Everything one lifted grain does.
#[derive(Clone, Debug, Default)]
struct Flight {
    transfers: Vec<Transfer>,
    /// Bedrock ground off per cell, one entry per abrasion event.
    wear: Vec<(u32, f32)>,
}

impl Flight {
    fn reptate(&mut self, terrain: &Terrain, i: usize, j: usize, bounce: usize) {
        let Some((per_target, near)) = terrain.reptation_targets(i, j, bounce) else {
            return;
        };
        let from = terrain.lattice.index(i, j) as u32;
        self.transfers.extend(near.iter().map(|f| Transfer {
            from,
            to: terrain.lattice.index(f.i, f.j) as u32,
            amount: per_target,
        }));
    }
}

/// Per cell, the sum of `value` over the entries of `sorted` whose `key`
/// is that cell. `sorted` must be ordered by `key`.
fn gather<T: Sync>(
    len: usize,
    sorted: &[T],
    key: impl Fn(&T) -> u32 + Sync,
    value: impl Fn(&T) -> f32 + Sync,
) -> Vec<f32> {
    (0..len)
        .into_par_iter()
        .map(|c| {
            let c = c as u32;
            let lo = sorted.partition_point(|t| key(t) < c);
            let hi = sorted.partition_point(|t| key(t) <= c);
            sorted[lo..hi].iter().map(&value).sum()
        })
        .collect()
}

impl PhaseSplit {
    /// Phase 1: the flight of the grain lifted at every cell, if any.
    fn decide(&self, terrain: &Terrain, step: u64) -> Vec<Option<Flight>> {
        let lattice = &terrain.lattice;
        let spacing = lattice.spacing();
        let settings = &terrain.settings;
        let max_bounce = self.max_bounce.max(1) as usize;

        (0..lattice.len())
            .into_par_iter()
            .map(|c| {
                let amount = terrain
                    .sediments
                    .get_index(c)
                    .min(settings.transport_quantum);
                if amount <= 0.0 {
                    return None;
                }
                let (i, j) = lattice.index_2d(c);
                let mut rng = task_rng(settings.seed, step, c as u64);
                let wind = terrain.wind_at_cell(i, j);
                let cover = terrain.vegetation_cover(c);
                let retention = terrain.shadow_probability(i, j, wind).max(cover);
                if rng.uniform() < retention {
                    return None;
                }
                Hop::from_wind(wind, spacing)?;

                let mut flight = Flight::default();
                let (mut di, mut dj) = (i, j);
                let mut bounce = 0;
                for k in 1..=max_bounce {
                    let wind = terrain.wind_at_cell(di, dj);
                    let Some(hop) = Hop::from_wind(wind, spacing) else {
                        break;
                    };
                    (di, dj) = hop.apply(lattice, di, dj);
                    let dest = lattice.index(di, dj);

                    if settings.abrasion
                        && rng.uniform() < settings.abrasion_probability
                        && terrain.sediments.get_index(dest) < settings.abrasion_sediment_limit
                    {
                        let strength = terrain.abrasion_strength(dest, wind);
                        if strength > 0.0 {
                            flight.wear.push((dest as u32, strength));
                        }
                    }

                    if k == max_bounce || terrain.settles(di, dj, wind, rng.uniform()) {
                        break;
                    }
                    bounce = k;
                    if rng.uniform() < 1.0 - cover {
                        flight.reptate(terrain, di, dj, bounce);
                    }
                }

                flight.transfers.push(Transfer {
                    from: c as u32,
                    to: lattice.index(di, dj) as u32,
                    amount,
                });
                if rng.uniform() < 1.0 - cover {
                    flight.reptate(terrain, di, dj, bounce);
                }
                Some(flight)
            })
            .collect()
    }

    /// Phase 2: every cell applies its departures, its arrivals and its
    /// abrasion. Returns the number of grains lifted.
    fn settle(&self, terrain: &mut Terrain, flights: Vec<Option<Flight>>) -> usize {
        let len = terrain.lattice.len();
        let sediments = terrain.sediments.snapshot();

        let lifted = flights.iter().filter(|f| f.is_some()).count();
        let (mut transfers, mut wear) = (Vec::new(), Vec::new());
        for flight in flights.into_iter().flatten() {
            transfers.extend(flight.transfers);
            wear.extend(flight.wear);
        }

        transfers.par_sort_by_key(|t| t.from);
        let requested = gather(len, &transfers, |t| t.from, |t| t.amount);
        let scale = requested
            .par_iter()
            .zip(sediments.par_iter())
            .map(|(&asked, &held)| if asked > held { held / asked } else { 1.0 })
            .collect::<Vec<f32>>();

        transfers.par_sort_by_key(|t| t.to);
        let arrivals = gather(len, &transfers, |t| t.to, |t| {
            t.amount * scale[t.from as usize]
        });

        terrain
            .sediments
            .values_mut()
            .par_iter_mut()
            .enumerate()
            .for_each(|(c, cell)| {
                let value = sediments[c] - requested[c] * scale[c] + arrivals[c];
                *cell.get_mut() = value.max(0.0);
            });

        if !wear.is_empty() {
            wear.par_sort_by_key(|&(cell, _)| cell);
            let worn = gather(len, &wear, |&(cell, _)| cell, |&(_, strength)| strength);
            terrain
                .bedrock
                .values_mut()
                .par_iter_mut()
                .zip(worn.par_iter())
                .for_each(|(cell, &worn)| *cell.get_mut() -= worn);
            *terrain.abrasion_count.get_mut() += wear.len();
        }

        lifted
    }

    /// Phase 3: one race-free avalanche pass. Returns whether anything moved.
    fn relax(&self, terrain: &mut Terrain) -> bool {
        let lattice = terrain.lattice;
        let quantum = terrain.settings.transport_quantum;
        let tan = terrain.settings.tan_repose_sediment;
        let cell_size = terrain.cell_size;
        let heights = terrain.height_field();
        let sediments = terrain.sediments.snapshot();

        let outflow = (0..lattice.len())
            .into_par_iter()
            .map(|c| {
                if sediments[c] <= 0.0 {
                    return (0.0, Flows::new());
                }
                let (i, j) = lattice.index_2d(c);
                let flows =
                    flow::compute_flow(&lattice, |x| heights.get_index(x), i, j, cell_size, tan);
                if flows.is_empty() {
                    (0.0, flows)
                } else {
                    (sediments[c].min(quantum), flows)
                }
            })
            .collect::<Vec<(f32, Flows)>>();

        if outflow.iter().all(|(moved, _)| *moved <= 0.0) {
            return false;
        }

        let relaxed = (0..lattice.len())
            .into_par_iter()
            .map(|c| {
                let (i, j) = lattice.index_2d(c);
                let mut value = sediments[c] - outflow[c].0;
                for (k, &(di, dj)) in NEIGHBOURS.iter().enumerate() {
                    let (ni, nj) = (i as isize - di, j as isize - dj);
                    if !lattice.inside(ni, nj) {
                        continue;
                    }
                    let (moved, flows) = &outflow[lattice.index(ni as usize, nj as usize)];
                    if let Some(f) = flows.iter().find(|f| f.direction as usize == k) {
                        value += moved * f.share;
                    }
                }
                value.max(0.0)
            })
            .collect::<Vec<f32>>();

        terrain
            .sediments
            .values_mut()
            .par_iter_mut()
            .zip(relaxed.par_iter())
            .for_each(|(cell, &value)| *cell.get_mut() = value);
        true
    }
}

impl StepStrategy for PhaseSplit {
    fn transport_sweep(&self, terrain: &mut Terrain) {
        let step = terrain.step_count as u64;
        let flights = self.decide(terrain, step);
        let lifted = self.settle(terrain, flights);
        debug!("step {step}: {lifted} grains lifted");

        for _ in 0..self.stabilization_passes {
            if !self.relax(terrain) {
                break;
            }
        }
    }
}

/// The strategy a [`Terrain`] uses for [`Terrain::run_step`].
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
pub enum Scheduler {
    AtomicAccumulate(AtomicAccumulate),
    PhaseSplit(PhaseSplit),
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::AtomicAccumulate(AtomicAccumulate::default())
    }
}

impl StepStrategy for Scheduler {
    fn transport_sweep(&self, terrain: &mut Terrain) {
        match self {
            Self::AtomicAccumulate(strategy) => strategy.transport_sweep(terrain),
            Self::PhaseSplit(strategy) => strategy.transport_sweep(terrain),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{Box2, GridField, Lattice};
    use crate::wind::{WindNode, WindTree};
    use crate::SimulationSettings;

    fn terrain(n: usize, sediment: f32) -> Terrain {
        let mut terrain = Terrain::new(
            n,
            n,
            Box2::new(Vec2::ZERO, Vec2::splat((n - 1) as f32)),
            SimulationSettings::default(),
        )
        .unwrap();
        terrain
            .set_sediment_data(GridField::new(*terrain.lattice(), sediment))
            .unwrap();
        terrain
    }

    #[test]
    fn hop_rounds_to_the_grid() {
        let spacing = Vec2::ONE;
        assert_eq!(Hop::from_wind(Vec2::new(3.0, 0.0), spacing), Some(Hop { di: 0, dj: 3 }));
        assert_eq!(Hop::from_wind(Vec2::new(0.2, -0.4), spacing), Some(Hop { di: -1, dj: 0 }));
        assert_eq!(Hop::from_wind(Vec2::new(1.6, 2.4), spacing), Some(Hop { di: 2, dj: 2 }));
        assert_eq!(Hop::from_wind(Vec2::ZERO, spacing), None);
    }

    #[test]
    fn hops_wrap_around() {
        let terrain = terrain(4, 0.0);
        let lattice: &Lattice = terrain.lattice();
        assert_eq!(Hop { di: 1, dj: 3 }.apply(lattice, 3, 2), (0, 1));
        assert_eq!(Hop { di: -2, dj: -1 }.apply(lattice, 1, 0), (3, 3));
    }

    /// Landing cell of the grain lifted at every cell, if any.
    fn landings(terrain: &Terrain) -> Vec<Option<u32>> {
        PhaseSplit::default()
            .decide(terrain, 0)
            .into_iter()
            .enumerate()
            .map(|(c, flight)| {
                flight?
                    .transfers
                    .iter()
                    .find(|t| t.from as usize == c)
                    .map(|t| t.to)
            })
            .collect()
    }

    #[test]
    fn grains_follow_the_local_wind() {
        let bounds = Box2::new(Vec2::ZERO, Vec2::splat(15.0));
        let mut steady = terrain(16, 1.0);
        steady.set_wind_field(WindTree::new(WindNode::uniform(bounds, Vec2::X, 3.0)));
        let mut swirled = terrain(16, 1.0);
        swirled.set_wind_field(
            WindTree::new(WindNode::uniform(bounds, Vec2::X, 3.0))
                .blend(WindNode::vortex(Vec2::splat(7.5), 6.0, 2.0)),
        );
        assert_ne!(landings(&steady), landings(&swirled));

        steady.run_step_with(&PhaseSplit::default());
        swirled.run_step_with(&PhaseSplit::default());
        assert_ne!(steady.sediment_field(), swirled.sediment_field());
    }

    #[test]
    fn centred_vortex_still_moves_sand() {
        let mut terrain = terrain(16, 1.0);
        terrain.set_wind_field(WindTree::new(WindNode::vortex(Vec2::splat(7.5), 6.0, 2.0)));
        let flights = PhaseSplit::default().decide(&terrain, 0);

        let corner = terrain.lattice().index(0, 0);
        assert!(flights[corner].is_none());
        assert!(flights
            .iter()
            .flatten()
            .any(|f| f.transfers.iter().any(|t| t.from != t.to)));
    }

    #[test]
    fn bounces_knock_sand_downhill() {
        let mut terrain = terrain(7, 0.0);
        let mut sand = GridField::new(*terrain.lattice(), 0.0);
        sand.set(3, 3, 4.0);
        terrain.set_sediment_data(sand).unwrap();

        let mut flight = Flight::default();
        flight.reptate(&terrain, 3, 3, 3);
        let from = terrain.lattice().index(3, 3) as u32;
        assert_eq!(flight.transfers.len(), 2);
        assert!(flight.transfers.iter().all(|t| t.from == from && t.to != from));
        let total: f32 = flight.transfers.iter().map(|t| t.amount).sum();
        assert!((total - 0.1).abs() < 1e-6);

        let mut flat = Flight::default();
        flat.reptate(&terrain, 0, 6, 3);
        assert!(flat.transfers.is_empty());
    }

    #[test]
    fn overdrawn_cells_scale_their_departures() {
        let mut terrain = terrain(4, 0.0);
        let mut sand = GridField::new(*terrain.lattice(), 0.0);
        sand.set(0, 0, 0.05);
        terrain.set_sediment_data(sand).unwrap();

        let flight = Flight {
            transfers: vec![
                Transfer { from: 0, to: 1, amount: 0.1 },
                Transfer { from: 0, to: 2, amount: 0.1 },
            ],
            wear: vec![(5, 0.25), (5, 0.25)],
        };
        let lifted = PhaseSplit::default().settle(&mut terrain, vec![None, Some(flight)]);

        assert_eq!(lifted, 1);
        assert_eq!(terrain.sediment(0, 0), 0.0);
        assert!((terrain.sediment(0, 1) - 0.025).abs() < 1e-6);
        assert!((terrain.sediment(0, 2) - 0.025).abs() < 1e-6);
        assert_eq!(terrain.bedrock(1, 1), -0.5);
        assert_eq!(terrain.abrasion_events(), 2);
    }

    #[test]
    fn phase_split_conserves_sediment() {
        let mut terrain = terrain(12, 1.0);
        let before = terrain.total_sediment();
        let strategy = PhaseSplit::default();
        for _ in 0..20 {
            terrain.run_step_with(&strategy);
        }
        assert!((terrain.total_sediment() - before).abs() < 1e-3);
        assert!(terrain.sediment_field().min() >= 0.0);
        assert_eq!(terrain.step_count(), 20);
    }

    #[test]
    fn phase_split_is_reproducible() {
        let run = || {
            let mut terrain = terrain(10, 0.5);
            let mut bedrock = GridField::new(*terrain.lattice(), 0.0);
            bedrock.set(5, 5, 2.0);
            terrain.set_bedrock_data(bedrock).unwrap();
            for _ in 0..10 {
                terrain.run_step_with(&PhaseSplit::default());
            }
            terrain.sediment_field()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn relaxation_flattens_a_spike() {
        let mut terrain = terrain(7, 0.0);
        let mut sand = GridField::new(*terrain.lattice(), 0.0);
        sand.set(3, 3, 4.0);
        terrain.set_sediment_data(sand).unwrap();

        let strategy = PhaseSplit::default();
        assert!(strategy.relax(&mut terrain));
        assert!((terrain.sediment(3, 3) - 3.9).abs() < 1e-5);
        assert!((terrain.total_sediment() - 4.0).abs() < 1e-5);
    }

    #[test]
    fn sequential_atomic_steps_are_reproducible() {
        let run = || {
            let mut terrain = terrain(16, 1.0);
            terrain.set_scheduler(Scheduler::AtomicAccumulate(AtomicAccumulate { parallel: false }));
            for _ in 0..5 {
                terrain.run_step();
            }
            terrain.sediment_field()
        };
        assert_eq!(run(), run());
    }
}
