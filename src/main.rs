use aeolian_terrain::export::{save_heightfield, TerrainMesh};
use aeolian_terrain::noisegen::{noise_field, Opts};
use aeolian_terrain::*;
use anyhow::{Context, Result};
use glam::Vec2;
use log::info;
use serde::Deserialize;
use std::path::PathBuf;

/// A run described in JSON. Every field is optional.
#[derive(Deserialize, Debug)]
#[serde(default)]
struct Scenario {
    resolution: usize,
    size: f32,
    sediment: [f32; 2],
    steps: usize,
    settings: SimulationSettings,
    vegetation: Option<Opts>,
    hardness: Option<Opts>,
    output: PathBuf,
    heightfield: Option<PathBuf>,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            resolution: 256,
            size: 256.0,
            sediment: [1.0, 5.0],
            steps: 200,
            settings: SimulationSettings::default(),
            vegetation: None,
            hardness: None,
            output: PathBuf::from("desert.obj"),
            heightfield: None,
        }
    }
}

fn load_scenario() -> Result<Scenario> {
    let Some(path) = std::env::args().nth(1) else {
        return Ok(Scenario::default());
    };
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read scenario {path}"))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse scenario {path}"))
}

fn main() -> Result<()> {
    env_logger::init();
    let scenario = load_scenario()?;

    let mut terrain = Terrain::with_sediment_range(
        scenario.resolution,
        scenario.resolution,
        Box2::new(Vec2::ZERO, Vec2::splat(scenario.size)),
        scenario.settings,
        scenario.sediment[0],
        scenario.sediment[1],
    )
    .context("invalid terrain dimensions")?;

    if let Some(opts) = scenario.vegetation {
        terrain.set_vegetation_data(noise_field(*terrain.lattice(), opts))?;
    }
    if let Some(opts) = scenario.hardness {
        terrain.set_hardness_data(noise_field(*terrain.lattice(), opts))?;
    }

    let report = (scenario.steps / 10).max(1);
    for step in 0..scenario.steps {
        terrain.run_step();
        if (step + 1) % report == 0 {
            info!(
                "step {}/{}: sediment {:.3}, bedrock {:.3}, abrasion events {}",
                step + 1,
                scenario.steps,
                terrain.total_sediment(),
                terrain.total_bedrock(),
                terrain.abrasion_events()
            );
        }
    }

    TerrainMesh::from_terrain(&terrain)
        .save_obj(&scenario.output)
        .with_context(|| format!("failed to export {}", scenario.output.display()))?;
    if let Some(path) = &scenario.heightfield {
        save_heightfield(&terrain, path)
            .with_context(|| format!("failed to export {}", path.display()))?;
    }
    Ok(())
}
