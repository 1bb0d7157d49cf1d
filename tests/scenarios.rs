//! End-to-end desert runs on small grids.

use aeolian_terrain::wind::{TerrainAdaptation, WindNode, WindTree};
use aeolian_terrain::{
    snap_world, AtomicAccumulate, Box2, GridField, PhaseSplit, Scheduler, SimulationSettings,
    Terrain,
};
use glam::Vec2;

const GRID: usize = 16;

fn bounds() -> Box2 {
    Box2::new(Vec2::ZERO, Vec2::splat(GRID as f32))
}

fn sandy_desert(settings: SimulationSettings) -> Terrain {
    Terrain::with_sediment_range(GRID, GRID, bounds(), settings, 1.0, 3.0).unwrap()
}

fn assert_height_invariant(terrain: &Terrain) {
    for i in 0..GRID {
        for j in 0..GRID {
            let expected = terrain.bedrock(i, j) + terrain.sediment(i, j);
            assert!((terrain.height(i, j) - expected).abs() < 1e-5);
        }
    }
}

#[test]
fn flat_desert_conserves_sand() {
    let mut terrain = sandy_desert(SimulationSettings::default());
    let initial = terrain.total_sediment();

    for _ in 0..300 {
        terrain.run_step();
    }

    assert_eq!(terrain.step_count(), 300);
    assert!(terrain.sediment_field().min() >= 0.0);
    let drift = (terrain.total_sediment() - initial).abs() / initial;
    assert!(drift < 1e-3, "sediment drifted by {drift}");
    assert_height_invariant(&terrain);
}

#[test]
fn abrasion_wears_bedrock_down() {
    let settings = SimulationSettings {
        abrasion: true,
        ..SimulationSettings::default()
    };
    let mut terrain = Terrain::new(GRID, GRID, bounds(), settings).unwrap();
    terrain
        .set_bedrock_data(GridField::new(*terrain.lattice(), 10.0))
        .unwrap();
    terrain
        .set_sediment_data(GridField::new(*terrain.lattice(), 0.3))
        .unwrap();

    let initial = terrain.total_bedrock();
    let mut previous = initial;
    for step in 0..600 {
        terrain.run_step();
        if step % 100 == 99 {
            let current = terrain.total_bedrock();
            assert!(current <= previous + 1e-2, "bedrock grew at step {step}");
            previous = current;
        }
    }

    assert!(terrain.abrasion_events() > 0);
    assert!(terrain.total_bedrock() < initial);
    assert_height_invariant(&terrain);
}

#[test]
fn vegetated_cell_never_lifts() {
    let settings = SimulationSettings {
        vegetation: true,
        ..SimulationSettings::default()
    };
    let mut terrain = Terrain::new(GRID, GRID, bounds(), settings).unwrap();
    let mut sand = GridField::new(*terrain.lattice(), 0.0);
    sand.set(8, 8, 0.3);
    terrain.set_sediment_data(sand).unwrap();
    let mut cover = GridField::new(*terrain.lattice(), 0.0);
    cover.set(8, 8, 1.0);
    terrain.set_vegetation_data(cover).unwrap();

    for _ in 0..50 {
        terrain.run_step();
        assert!(terrain.sediment(8, 8) >= 0.3);
    }
    assert_eq!(terrain.total_sediment(), 0.3f32 as f64);
}

#[test]
fn zero_steps_change_nothing() {
    let settings = SimulationSettings {
        seed: 42,
        ..SimulationSettings::default()
    };
    let terrain = sandy_desert(settings);
    let twin = sandy_desert(settings);

    assert_eq!(terrain.step_count(), 0);
    assert_eq!(terrain.sediment_field(), twin.sediment_field());
    assert_eq!(terrain.bedrock_field(), twin.bedrock_field());
    assert_eq!(terrain.vegetation_field(), twin.vegetation_field());
    assert_eq!(terrain.hardness_field(), twin.hardness_field());
}

#[test]
fn flat_terrain_casts_no_shadow() {
    let terrain = Terrain::new(GRID, GRID, bounds(), SimulationSettings::default()).unwrap();
    for i in 0..GRID {
        for j in 0..GRID {
            for wind in [Vec2::new(3.0, 0.0), Vec2::new(-1.0, 2.0), Vec2::new(0.0, -4.0)] {
                assert_eq!(terrain.shadow_probability(i, j, wind), 0.0);
            }
        }
    }
}

#[test]
fn snapping_is_toroidal() {
    let size = GRID as f32;
    let quantum = 0.1;
    assert_eq!(snap_world(bounds(), Vec2::new(size, 3.0)), Vec2::new(0.0, 3.0));
    assert_eq!(snap_world(bounds(), Vec2::new(3.0, size)), Vec2::new(3.0, 0.0));

    let wrapped = snap_world(bounds(), Vec2::new(-quantum, -quantum));
    assert!((wrapped - Vec2::splat(size - quantum)).abs().max_element() < 1e-5);
}

#[test]
fn sequential_runs_repeat_exactly() {
    let settings = SimulationSettings {
        scheduler: Scheduler::AtomicAccumulate(AtomicAccumulate { parallel: false }),
        seed: 7,
        ..SimulationSettings::default()
    };
    let run = || {
        let mut terrain = sandy_desert(settings);
        for _ in 0..20 {
            terrain.run_step();
        }
        (terrain.sediment_field(), terrain.bedrock_field())
    };
    assert_eq!(run(), run());
}

#[test]
fn phase_split_conserves_sand_under_a_vortex() {
    let settings = SimulationSettings {
        scheduler: Scheduler::PhaseSplit(PhaseSplit::default()),
        ..SimulationSettings::default()
    };
    let mut terrain = sandy_desert(settings);
    let wind = WindTree::new(WindNode::uniform(bounds(), Vec2::new(1.0, 0.5), 2.0))
        .blend(WindNode::vortex(Vec2::splat(8.0), 4.0, 1.0))
        .with_adaptation(TerrainAdaptation::default());
    terrain.set_wind_field(wind);

    let initial = terrain.total_sediment();
    for _ in 0..40 {
        terrain.run_step();
    }
    let drift = (terrain.total_sediment() - initial).abs() / initial;
    assert!(drift < 1e-3, "sediment drifted by {drift}");
    assert!(terrain.sediment_field().min() >= 0.0);
    assert_height_invariant(&terrain);
}

#[test]
fn atomic_run_with_adapted_wind_stays_finite() {
    let mut terrain = sandy_desert(SimulationSettings::default());
    let wind = WindTree::new(WindNode::uniform(bounds(), Vec2::new(0.0, 1.0), 2.5))
        .with_adaptation(TerrainAdaptation::default());
    terrain.set_wind_field(wind);
    for _ in 0..30 {
        terrain.run_step();
    }
    assert!(terrain.height_field().values().iter().all(|h| h.is_finite()));
}

#[test]
fn vortex_reshapes_a_phase_split_desert() {
    let settings = SimulationSettings {
        scheduler: Scheduler::PhaseSplit(PhaseSplit::default()),
        ..SimulationSettings::default()
    };
    let steady = WindTree::new(WindNode::uniform(bounds(), Vec2::X, 3.0));
    let swirled = WindTree::new(WindNode::uniform(bounds(), Vec2::X, 3.0))
        .blend(WindNode::vortex(Vec2::splat(8.0), 6.0, 2.0));

    let run = |wind: WindTree| {
        let mut terrain = sandy_desert(settings);
        terrain.set_wind_field(wind);
        for _ in 0..20 {
            terrain.run_step();
        }
        terrain.sediment_field()
    };
    assert_ne!(run(steady), run(swirled));
}
