//! Wind fields.
//!
//! The transport engine only needs a [`WindField`]. [`WindTree`] is the
//! stock implementation: a small tree of [`WindNode`]s whose summed
//! intensity is a stream function, so the wind is the orthogonal of its
//! gradient, optionally bent around terrain.

use crate::field::{Box2, GridField};
use glam::Vec2;
use serde::{Deserialize, Serialize};

/// Direction vector per query point. Implementors are shared between the
/// worker threads of a simulation step.
pub trait WindField: Send + Sync {
    /// Wind vector at world point `p`. Its length is the hop length of a
    /// saltating grain.
    fn direction(&self, p: Vec2, t: f32) -> Vec2;

    /// Receives the current combined height field during terrain
    /// maintenance. Fields that ignore terrain keep the default.
    fn set_terrain_data(&mut self, _heights: &GridField) {}
}

/// `(1 - x / r)^3` on `[0, r]`, zero beyond.
fn cubic_smooth_compact(x: f32, r: f32) -> f32 {
    if x > r {
        0.0
    } else {
        let t = 1.0 - x / r;
        t * t * t
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum WindNode {
    /// Constant wind of speed `energy` along `direction` inside `bounds`.
    Uniform {
        bounds: Box2,
        direction: Vec2,
        energy: f32,
    },
    /// Swirl around `center` fading out at `radius`.
    Vortex {
        center: Vec2,
        radius: f32,
        energy: f32,
    },
    /// Sum of two sub-trees.
    Blend(Box<WindNode>, Box<WindNode>),
}

impl WindNode {
    pub fn uniform(bounds: Box2, direction: Vec2, energy: f32) -> Self {
        Self::Uniform {
            bounds,
            direction: direction.normalize_or_zero(),
            energy,
        }
    }

    pub fn vortex(center: Vec2, radius: f32, energy: f32) -> Self {
        Self::Vortex {
            center,
            radius,
            energy,
        }
    }

    pub fn blend(a: WindNode, b: WindNode) -> Self {
        Self::Blend(Box::new(a), Box::new(b))
    }

    pub fn bounds(&self) -> Box2 {
        match self {
            Self::Uniform { bounds, .. } => *bounds,
            Self::Vortex { center, radius, .. } => Box2::around(*center, *radius),
            Self::Blend(a, b) => a.bounds().union(&b.bounds()),
        }
    }

    /// Stream function value at `p`.
    pub fn intensity(&self, p: Vec2, t: f32) -> f32 {
        match self {
            Self::Uniform {
                bounds,
                direction,
                energy,
            } => {
                if !bounds.contains(p) {
                    return 0.0;
                }
                energy * (p - bounds.center()).dot(Self::stream_axis(*direction))
            }
            Self::Vortex {
                center,
                radius,
                energy,
            } => {
                let bounds = self.bounds();
                if !bounds.contains(p) {
                    return 0.0;
                }
                energy
                    * bounds.width()
                    * cubic_smooth_compact((p - *center).length_squared(), radius * radius)
            }
            Self::Blend(a, b) => a.intensity(p, t) + b.intensity(p, t),
        }
    }

    /// Gradient of [`WindNode::intensity`].
    pub fn gradient(&self, p: Vec2, t: f32) -> Vec2 {
        match self {
            Self::Uniform {
                bounds,
                direction,
                energy,
            } => {
                if bounds.contains(p) {
                    *energy * Self::stream_axis(*direction)
                } else {
                    Vec2::ZERO
                }
            }
            Self::Vortex { .. } => self.finite_difference_gradient(p, t),
            Self::Blend(a, b) => a.gradient(p, t) + b.gradient(p, t),
        }
    }

    fn finite_difference_gradient(&self, p: Vec2, t: f32) -> Vec2 {
        const EPSILON: f32 = 1e-2;
        let dx = Vec2::new(EPSILON, 0.0);
        let dy = Vec2::new(0.0, EPSILON);
        Vec2::new(
            self.intensity(p + dx, t) - self.intensity(p - dx, t),
            self.intensity(p + dy, t) - self.intensity(p - dy, t),
        ) / (2.0 * EPSILON)
    }

    /// Axis along which a uniform node's stream function grows, chosen so
    /// that its counter-clockwise orthogonal is `direction`.
    fn stream_axis(direction: Vec2) -> Vec2 {
        Vec2::new(direction.y, -direction.x)
    }

    pub fn energy(&self) -> f32 {
        match self {
            Self::Uniform { energy, .. } | Self::Vortex { energy, .. } => *energy,
            Self::Blend(a, b) => a.energy() + b.energy(),
        }
    }

    pub fn change_strength(&mut self, value: f32) {
        match self {
            Self::Uniform { energy, .. } | Self::Vortex { energy, .. } => *energy = value,
            Self::Blend(a, b) => {
                a.change_strength(value);
                b.change_strength(value);
            }
        }
    }

    pub fn change_direction(&mut self, value: Vec2) {
        match self {
            Self::Uniform { direction, .. } => *direction = value.normalize_or_zero(),
            Self::Vortex { .. } => {}
            Self::Blend(a, b) => {
                a.change_direction(value);
                b.change_direction(value);
            }
        }
    }

    /// Rotates uniform winds counter-clockwise by `degrees`.
    pub fn rotate(&mut self, degrees: f32) {
        match self {
            Self::Uniform { direction, .. } => {
                *direction = Vec2::from_angle(degrees.to_radians()).rotate(*direction);
            }
            Self::Vortex { .. } => {}
            Self::Blend(a, b) => {
                a.rotate(degrees);
                b.rotate(degrees);
            }
        }
    }
}

/// How a [`WindTree`] bends its wind around terrain.
///
/// Two blurred copies of the height field are kept, one coarse and one
/// fine. Each deviates the wind along its contour lines where it is steep
/// and raises the wind speed with elevation (venturi effect); the two
/// results are blended.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq)]
pub struct TerrainAdaptation {
    /// Blur radius of each height layer, in cells.
    pub blur_radius: [usize; 2],
    /// Strength of the deviation along contour lines, per layer.
    pub deviation: [f32; 2],
    /// Blend weight of each layer.
    pub blend: [f32; 2],
    /// Speed gained per unit of elevation.
    pub venturi: f32,
}

impl Default for TerrainAdaptation {
    fn default() -> Self {
        Self {
            blur_radius: [16, 8],
            deviation: [3.0, 1.0],
            blend: [0.8, 0.2],
            venturi: 0.005,
        }
    }
}

/// Components below this magnitude are flushed to zero: tiny cross-wind
/// components stop dunes from forming.
const MIN_COMPONENT: f32 = 1e-3;

pub struct WindTree {
    root: WindNode,
    adaptation: Option<TerrainAdaptation>,
    layers: Option<[GridField; 2]>,
}

impl WindTree {
    pub fn new(root: WindNode) -> Self {
        Self {
            root,
            adaptation: None,
            layers: None,
        }
    }

    pub fn with_adaptation(mut self, adaptation: TerrainAdaptation) -> Self {
        self.adaptation = Some(adaptation);
        self
    }

    /// Adds `node` next to the current root.
    pub fn blend(self, node: WindNode) -> Self {
        Self {
            root: WindNode::blend(self.root, node),
            ..self
        }
    }

    pub fn root(&self) -> &WindNode {
        &self.root
    }

    pub fn intensity(&self, p: Vec2, t: f32) -> f32 {
        self.root.intensity(p, t)
    }

    pub fn change_direction(&mut self, direction: Vec2) {
        self.root.change_direction(direction);
    }

    pub fn change_strength(&mut self, energy: f32) {
        self.root.change_strength(energy);
    }

    pub fn rotate(&mut self, degrees: f32) {
        self.root.rotate(degrees);
    }

    /// The coarse height layer the wind currently adapts to.
    pub fn terrain_data(&self) -> Option<&GridField> {
        self.layers.as_ref().map(|[coarse, _]| coarse)
    }

    fn adapt_to_terrain(
        &self,
        adaptation: &TerrainAdaptation,
        layers: &[GridField; 2],
        p: Vec2,
        d: Vec2,
    ) -> Vec2 {
        let lattice = layers[0].lattice();
        let (i, j) = lattice.cell_integer(p);
        if !lattice.inside(i, j) {
            return d;
        }
        let (i, j) = (i as usize, j as usize);

        let speed = d.length();
        let mut target_speed = 0.0;
        let mut bent = Vec2::ZERO;
        for (k, layer) in layers.iter().enumerate() {
            target_speed += adaptation.blend[k] * (speed + adaptation.venturi * layer.get(i, j));

            let normal = -layer.gradient(i, j);
            let flatness = cubic_smooth_compact(normal.length_squared(), 1.0);
            let mut contour = normal.perp();
            if contour.dot(d) < 0.0 {
                contour = -contour;
            }
            let deviated = flatness * d + (1.0 - flatness) * adaptation.deviation[k] * contour;
            bent += adaptation.blend[k] * deviated;
        }

        bent.normalize_or_zero() * target_speed
    }
}

impl WindField for WindTree {
    fn direction(&self, p: Vec2, t: f32) -> Vec2 {
        let mut d = self.root.gradient(p, t).perp();
        if let (Some(adaptation), Some(layers)) = (&self.adaptation, &self.layers) {
            d = self.adapt_to_terrain(adaptation, layers, p, d);
        }
        if d.x.abs() < MIN_COMPONENT {
            d.x = 0.0;
        }
        if d.y.abs() < MIN_COMPONENT {
            d.y = 0.0;
        }
        d
    }

    fn set_terrain_data(&mut self, heights: &GridField) {
        let Some(adaptation) = self.adaptation else {
            return;
        };
        self.layers = Some(adaptation.blur_radius.map(|radius| {
            let mut layer = heights.clone();
            layer.blur(radius);
            layer
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::Lattice;

    fn bounds() -> Box2 {
        Box2::new(Vec2::ZERO, Vec2::splat(64.0))
    }

    #[test]
    fn uniform_wind_blows_along_its_direction() {
        let tree = WindTree::new(WindNode::uniform(bounds(), Vec2::new(1.0, 0.0), 3.0));
        let d = tree.direction(Vec2::new(10.0, 20.0), 0.0);
        assert!((d - Vec2::new(3.0, 0.0)).length() < 1e-5, "{d:?}");

        let diagonal = WindTree::new(WindNode::uniform(bounds(), Vec2::new(1.0, 1.0), 2.0));
        let d = diagonal.direction(Vec2::splat(32.0), 0.0);
        assert!((d - Vec2::splat(2.0 / 2f32.sqrt())).length() < 1e-5, "{d:?}");
    }

    #[test]
    fn uniform_wind_stops_outside_its_box() {
        let tree = WindTree::new(WindNode::uniform(bounds(), Vec2::X, 3.0));
        assert_eq!(tree.direction(Vec2::new(-5.0, 5.0), 0.0), Vec2::ZERO);
    }

    #[test]
    fn vortex_swirls_tangentially() {
        let vortex = WindNode::vortex(Vec2::splat(32.0), 10.0, 1.0);
        let tree = WindTree::new(vortex);
        let p = Vec2::new(37.0, 32.0);
        let d = tree.direction(p, 0.0);
        assert!(d.length() > 0.0);
        // tangential: orthogonal to the radius
        assert!(d.normalize().dot((p - Vec2::splat(32.0)).normalize()).abs() < 1e-2);
        assert_eq!(tree.direction(Vec2::new(50.0, 32.0), 0.0), Vec2::ZERO);
    }

    #[test]
    fn blend_sums_children() {
        let a = WindNode::uniform(bounds(), Vec2::X, 1.0);
        let b = WindNode::uniform(bounds(), Vec2::Y, 1.0);
        let mut tree = WindTree::new(a).blend(b);
        assert_eq!(tree.root().energy(), 2.0);
        let d = tree.direction(Vec2::splat(10.0), 0.0);
        assert!((d - Vec2::ONE).length() < 1e-5, "{d:?}");

        tree.change_strength(2.0);
        tree.change_direction(Vec2::X);
        let d = tree.direction(Vec2::splat(10.0), 0.0);
        assert!((d - Vec2::new(4.0, 0.0)).length() < 1e-5, "{d:?}");

        tree.rotate(90.0);
        let d = tree.direction(Vec2::splat(10.0), 0.0);
        assert!((d - Vec2::new(0.0, 4.0)).length() < 1e-4, "{d:?}");
    }

    #[test]
    fn flat_terrain_keeps_the_wind() {
        let lattice = Lattice::new(17, 17, bounds()).unwrap();
        let mut tree = WindTree::new(WindNode::uniform(bounds(), Vec2::X, 3.0))
            .with_adaptation(TerrainAdaptation {
                venturi: 0.0,
                ..Default::default()
            });
        tree.set_terrain_data(&GridField::new(lattice, 5.0));
        assert!(tree.terrain_data().is_some());
        let d = tree.direction(Vec2::splat(30.0), 0.0);
        assert!((d - Vec2::new(3.0, 0.0)).length() < 1e-5, "{d:?}");
    }
}
