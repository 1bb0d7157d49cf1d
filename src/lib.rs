//! Aeolian sediment transport over a toroidal heightfield.
//!
//! A [`Terrain`] stacks a sediment layer on a bedrock layer and evolves them
//! with millions of small stochastic events: grains are lifted by the wind,
//! saltate downwind, creep onto steep neighbours and settle, after which
//! slopes steeper than the angle of repose avalanche. Bedrock may be abraded
//! where little sand protects it. Depending on wind, supply and vegetation
//! this grows transverse dunes, barchans, nabkhas or yardangs.

use crate::error::TerrainError;
use crate::field::AtomicField;
use crate::flow::{Flows, Layer};
use crate::noisegen::{Opts, Turbulence};
use crate::random::{task_rng, UniformSource};
use crate::wind::{WindField, WindNode, WindTree};
use atomic_float::AtomicF32;
use glam::Vec2;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

pub mod error;
pub mod export;
pub mod field;
pub mod flow;
pub mod noisegen;
pub mod random;
pub mod schedule;
mod stabilize;
mod transport;
pub mod wind;

pub use field::{Box2, GridField, Lattice};
pub use schedule::{AtomicAccumulate, PhaseSplit, Scheduler, StepStrategy};
pub use transport::{smoothstep, snap_world};

/// Where abrasion reads the bedrock hardness from.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Default)]
pub enum HardnessSource {
    /// The terrain's hardness layer (see [`Terrain::set_hardness_data`]).
    #[default]
    Field,
    /// Procedural turbulence of the world position.
    Turbulence(Opts),
}

/// Global simulation parameters.
///
/// If you're not sure where to begin, `Default::default` for this
/// structure reproduces the reference desert setup.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SimulationSettings {
    /// Tangent of the sediment angle of repose (~33°).
    pub tan_repose_sediment: f32,
    /// Tangent of the bedrock angle of repose (~68°).
    pub tan_repose_bedrock: f32,
    /// Upwind slope tangent below which a cell is never in wind shadow (~5°).
    pub tan_shadow_min: f32,
    /// Upwind slope tangent above which a cell is fully in wind shadow (~15°).
    pub tan_shadow_max: f32,
    /// Height of material moved by one elementary event, in world units.
    pub transport_quantum: f32,
    /// Base wind used to build the default wind field. Its length is the
    /// saltation hop length in world units.
    pub wind: Vec2,
    /// Whether vegetation retains and traps sand.
    pub vegetation: bool,
    /// Whether saltating grains abrade exposed bedrock.
    pub abrasion: bool,
    /// Bedrock height removed by one abrasion event at full exposure.
    pub abrasion_epsilon: f32,
    /// Chance that a hop over a poorly covered cell abrades it.
    pub abrasion_probability: f32,
    /// Cells with less sediment than this are exposed to abrasion.
    pub abrasion_sediment_limit: f32,
    pub hardness: HardnessSource,
    /// How far upwind the shadow test looks, in world units.
    pub shadow_radius: f32,
    /// Squared world distance beyond which reptation does not reach.
    pub reptation_radius_squared: f32,
    /// Maintenance (bedrock sweep, wind terrain refresh) runs every this
    /// many steps.
    pub maintenance_period: usize,
    /// Upper bound on worklist pops in one stabilization call.
    pub stabilization_cap: usize,
    pub scheduler: Scheduler,
    pub seed: u64,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            tan_repose_sediment: 0.60,
            tan_repose_bedrock: 2.5,
            tan_shadow_min: 0.08,
            tan_shadow_max: 0.26,
            transport_quantum: 0.1,
            wind: Vec2::new(3.0, 0.0),
            vegetation: false,
            abrasion: false,
            abrasion_epsilon: 0.5,
            abrasion_probability: 0.2,
            abrasion_sediment_limit: 0.5,
            hardness: HardnessSource::Field,
            shadow_radius: 10.0,
            reptation_radius_squared: 4.0,
            maintenance_period: 5,
            stabilization_cap: 1 << 20,
            scheduler: Scheduler::default(),
            seed: 0,
        }
    }
}

impl SimulationSettings {
    /// Parses settings from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, TerrainError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// All the data associated with a desert.
///
/// Bedrock and sediment are stored as [`AtomicField`]s so that transport
/// events may run on many threads at once. Vegetation and hardness are only
/// read during a step.
pub struct Terrain {
    lattice: Lattice,
    bedrock: AtomicField,
    sediments: AtomicField,
    /// Vegetation cover in `[0, 1]`.
    vegetation: GridField,
    /// Bedrock resistance to abrasion in `[0, 1]`, 1 being unerodible.
    hardness: GridField,
    turbulence: Option<Turbulence>,
    wind: Box<dyn WindField>,
    settings: SimulationSettings,
    /// World length of one grid step.
    cell_size: f32,
    step_count: usize,
    abrasion_count: AtomicUsize,
}

impl Terrain {
    /// Creates a terrain with flat zero bedrock and no sediment.
    pub fn new(
        nx: usize,
        ny: usize,
        bounds: Box2,
        settings: SimulationSettings,
    ) -> Result<Self, TerrainError> {
        let lattice = Lattice::new(nx, ny, bounds)?;
        Ok(Self::from_lattice(lattice, settings))
    }

    /// Creates a terrain whose sediment is drawn uniformly in
    /// `[r_min, r_max)` on every cell, seeded by `settings.seed`.
    pub fn with_sediment_range(
        nx: usize,
        ny: usize,
        bounds: Box2,
        settings: SimulationSettings,
        r_min: f32,
        r_max: f32,
    ) -> Result<Self, TerrainError> {
        let mut terrain = Self::new(nx, ny, bounds, settings)?;
        let mut rng = task_rng(settings.seed, u64::MAX, 0);
        let sediments =
            GridField::from_fn(terrain.lattice, |_, _| rng.uniform_range(r_min, r_max));
        terrain.sediments = AtomicField::from_field(&sediments);
        Ok(terrain)
    }

    /// Creates a bare terrain over an existing lattice, blown by a uniform
    /// `settings.wind`.
    pub fn from_lattice(lattice: Lattice, settings: SimulationSettings) -> Self {
        let zero = GridField::new(lattice, 0.0);
        let bounds = lattice.bounds();
        let wind = WindTree::new(WindNode::uniform(
            bounds,
            settings.wind,
            settings.wind.length(),
        ));
        info!(
            "creating {}x{} terrain over {:?} (cell size {})",
            lattice.nx(),
            lattice.ny(),
            bounds,
            lattice.spacing().x
        );

        Self {
            lattice,
            bedrock: AtomicField::from_field(&zero),
            sediments: AtomicField::from_field(&zero),
            vegetation: zero.clone(),
            hardness: zero,
            turbulence: turbulence_for(settings.hardness),
            wind: Box::new(wind),
            settings,
            cell_size: lattice.spacing().x,
            step_count: 0,
            abrasion_count: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn lattice(&self) -> &Lattice {
        &self.lattice
    }

    #[inline]
    pub fn settings(&self) -> &SimulationSettings {
        &self.settings
    }

    #[inline]
    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    /// Number of completed simulation steps.
    #[inline]
    pub fn step_count(&self) -> usize {
        self.step_count
    }

    /// Number of abrasion events so far.
    pub fn abrasion_events(&self) -> usize {
        self.abrasion_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn height(&self, i: usize, j: usize) -> f32 {
        let index = self.lattice.index(i, j);
        self.bedrock.get_index(index) + self.sediments.get_index(index)
    }

    /// Bilinear height at a world point, `None` off the grid.
    pub fn height_at(&self, p: Vec2) -> Option<f32> {
        Some(self.bedrock.try_value_bilinear(p)? + self.sediments.try_value_bilinear(p)?)
    }

    #[inline]
    pub fn bedrock(&self, i: usize, j: usize) -> f32 {
        self.bedrock.get(i, j)
    }

    #[inline]
    pub fn sediment(&self, i: usize, j: usize) -> f32 {
        self.sediments.get(i, j)
    }

    #[inline]
    pub fn vegetation(&self, i: usize, j: usize) -> f32 {
        self.vegetation.get(i, j)
    }

    #[inline]
    pub fn hardness(&self, i: usize, j: usize) -> f32 {
        self.hardness.get(i, j)
    }

    pub fn set_bedrock_data(&mut self, field: GridField) -> Result<(), TerrainError> {
        self.check_shape(&field)?;
        self.bedrock = AtomicField::from_field(&field);
        Ok(())
    }

    pub fn set_sediment_data(&mut self, field: GridField) -> Result<(), TerrainError> {
        self.check_shape(&field)?;
        self.sediments = AtomicField::from_field(&field);
        Ok(())
    }

    pub fn set_vegetation_data(&mut self, field: GridField) -> Result<(), TerrainError> {
        self.check_shape(&field)?;
        self.vegetation = field;
        Ok(())
    }

    pub fn set_hardness_data(&mut self, field: GridField) -> Result<(), TerrainError> {
        self.check_shape(&field)?;
        self.hardness = field;
        Ok(())
    }

    pub fn set_abrasion_mode(&mut self, on: bool) {
        self.settings.abrasion = on;
    }

    pub fn set_vegetation_mode(&mut self, on: bool) {
        self.settings.vegetation = on;
    }

    pub fn set_hardness_source(&mut self, source: HardnessSource) {
        self.settings.hardness = source;
        self.turbulence = turbulence_for(source);
    }

    pub fn set_scheduler(&mut self, scheduler: Scheduler) {
        self.settings.scheduler = scheduler;
    }

    /// Replaces the wind field and hands it the current heights.
    pub fn set_wind_field(&mut self, wind: impl WindField + 'static) {
        self.wind = Box::new(wind);
        let heights = self.height_field();
        self.wind.set_terrain_data(&heights);
    }

    fn check_shape(&self, field: &GridField) -> Result<(), TerrainError> {
        if field.nx() != self.lattice.nx() || field.ny() != self.lattice.ny() {
            return Err(TerrainError::ShapeMismatch {
                expected_x: self.lattice.nx(),
                expected_y: self.lattice.ny(),
                found_x: field.nx(),
                found_y: field.ny(),
            });
        }
        Ok(())
    }

    pub fn bedrock_field(&self) -> GridField {
        self.bedrock.to_field()
    }

    pub fn sediment_field(&self) -> GridField {
        self.sediments.to_field()
    }

    pub fn vegetation_field(&self) -> &GridField {
        &self.vegetation
    }

    pub fn hardness_field(&self) -> &GridField {
        &self.hardness
    }

    /// Combined bedrock plus sediment elevation.
    pub fn height_field(&self) -> GridField {
        let mut heights = self.bedrock.to_field();
        heights.add_field(&self.sediments.to_field());
        heights
    }

    pub fn total_sediment(&self) -> f64 {
        self.sediments.sum()
    }

    pub fn total_bedrock(&self) -> f64 {
        self.bedrock.sum()
    }

    /// Neighbours receiving material from `(i, j)` on `layer`.
    pub fn compute_flow(&self, layer: Layer, i: usize, j: usize, tan_threshold: f32) -> Flows {
        match layer {
            Layer::Sediment => flow::compute_flow(
                &self.lattice,
                |x| self.bedrock.get_index(x) + self.sediments.get_index(x),
                i,
                j,
                self.cell_size,
                tan_threshold,
            ),
            Layer::Bedrock => flow::compute_flow(
                &self.lattice,
                |x| self.bedrock.get_index(x),
                i,
                j,
                self.cell_size,
                tan_threshold,
            ),
        }
    }

    /// Averages every bedrock sample with its 3x3 neighbourhood.
    pub fn smooth_bedrock(&mut self) {
        let mut field = self.bedrock.to_field();
        field.blur(1);
        self.bedrock = AtomicField::from_field(&field);
    }

    /// Averages every sediment sample with its 3x3 neighbourhood.
    pub fn smooth_sediments(&mut self) {
        let mut field = self.sediments.to_field();
        field.blur(1);
        self.sediments = AtomicField::from_field(&field);
    }

    /// Runs one simulation step with the configured scheduler.
    pub fn run_step(&mut self) {
        let scheduler = self.settings.scheduler;
        scheduler.run_step(self);
    }

    /// Runs one simulation step with an explicit strategy.
    pub fn run_step_with(&mut self, strategy: &dyn StepStrategy) {
        strategy.run_step(self);
    }

    /// Bookkeeping after every step. Every `maintenance_period` steps the
    /// bedrock is re-stabilized (when abrasion may have carved it) and the
    /// wind field receives fresh terrain data.
    pub fn end_of_step(&mut self) {
        self.step_count += 1;
        if self.step_count % self.settings.maintenance_period.max(1) != 0 {
            return;
        }

        if self.settings.abrasion {
            let stable = self.stabilize_bedrock_all();
            debug!(
                "step {}: bedrock sweep done (already stable: {}, abrasion events: {})",
                self.step_count,
                stable,
                self.abrasion_events()
            );
        }

        let heights = self.height_field();
        self.wind.set_terrain_data(&heights);
    }

    /// Vegetation cover of a cell as seen by the transport, zero when
    /// vegetation is switched off.
    #[inline]
    fn vegetation_cover(&self, index: usize) -> f32 {
        if self.settings.vegetation {
            self.vegetation.get_index(index)
        } else {
            0.0
        }
    }

    #[inline]
    fn hardness_at(&self, index: usize, p: Vec2) -> f32 {
        match &self.turbulence {
            Some(turbulence) => turbulence.sample(p),
            None => self.hardness.get_index(index),
        }
    }
}

fn turbulence_for(source: HardnessSource) -> Option<Turbulence> {
    match source {
        HardnessSource::Field => None,
        HardnessSource::Turbulence(opts) => Some(Turbulence::new(opts)),
    }
}

/// An `f32` that may be updated atomically, with every operation relaxed.
pub struct AF32(pub AtomicF32);

impl Clone for AF32 {
    fn clone(&self) -> Self {
        Self::new(self.load())
    }
}

impl AF32 {
    #[inline]
    pub const fn new(float: f32) -> Self {
        Self(AtomicF32::new(float))
    }

    #[inline]
    pub fn get_mut(&mut self) -> &mut f32 {
        self.0.get_mut()
    }

    #[inline]
    pub fn load(&self) -> f32 {
        self.0.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn fetch_update<F>(&self, update: F) -> Result<f32, f32>
    where
        F: FnMut(f32) -> Option<f32>,
    {
        self.0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, update)
    }

    #[inline]
    pub fn fetch_add(&self, val: f32) -> f32 {
        self.0.fetch_add(val, Ordering::Relaxed)
    }

    #[inline]
    pub fn fetch_sub(&self, val: f32) -> f32 {
        self.0.fetch_sub(val, Ordering::Relaxed)
    }
}
