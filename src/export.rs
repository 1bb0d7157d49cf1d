//! Read-only exports of a terrain snapshot.

use crate::error::TerrainError;
use crate::Terrain;
use glam::{Vec2, Vec3};
use log::info;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Triangulation of the combined surface over the regular grid.
///
/// One vertex per grid sample, two counter-clockwise triangles per quad.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TerrainMesh {
    pub vertices: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    /// Zero-based, three per triangle.
    pub indices: Vec<u32>,
}

impl TerrainMesh {
    pub fn from_terrain(terrain: &Terrain) -> Self {
        let lattice = *terrain.lattice();
        let (nx, ny) = (lattice.nx(), lattice.ny());
        let bedrock = terrain.bedrock_field();
        let sediments = terrain.sediment_field();

        let mut vertices = Vec::with_capacity(lattice.len());
        let mut normals = Vec::with_capacity(lattice.len());
        for i in 0..ny {
            for j in 0..nx {
                let p = lattice.vertex(i, j);
                vertices.push(p.extend(terrain.height(i, j)));
                let g: Vec2 = bedrock.gradient(i, j) + sediments.gradient(i, j);
                normals.push((-g).extend(2.0).normalize());
            }
        }

        let mut indices = Vec::with_capacity((nx - 1) * (ny - 1) * 6);
        for i in 0..ny - 1 {
            for j in 0..nx - 1 {
                let c = (i * nx + j) as u32;
                let up = c + nx as u32;
                indices.extend_from_slice(&[up + 1, up, c, c, c + 1, up + 1]);
            }
        }

        Self {
            vertices,
            normals,
            indices,
        }
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Writes the mesh as Wavefront OBJ text.
    pub fn write_obj(&self, out: &mut impl Write) -> std::io::Result<()> {
        writeln!(out, "g Obj")?;
        for v in &self.vertices {
            writeln!(out, "v {} {} {}", v.x, v.y, v.z)?;
        }
        for n in &self.normals {
            writeln!(out, "vn {} {} {}", n.x, n.y, n.z)?;
        }
        for t in self.indices.chunks_exact(3) {
            let (a, b, c) = (t[0] + 1, t[1] + 1, t[2] + 1);
            writeln!(out, "f {a}//{a} {b}//{b} {c}//{c}")?;
        }
        Ok(())
    }

    pub fn save_obj(&self, path: impl AsRef<Path>) -> Result<(), TerrainError> {
        let path = path.as_ref();
        let mut out = BufWriter::new(File::create(path)?);
        self.write_obj(&mut out)?;
        out.flush()?;
        info!(
            "wrote {} vertices and {} triangles to {}",
            self.vertices.len(),
            self.triangle_count(),
            path.display()
        );
        Ok(())
    }
}

/// Writes combined heights as text, one grid row per line, rows from
/// `i = 0` upward.
pub fn write_heightfield(terrain: &Terrain, out: &mut impl Write) -> std::io::Result<()> {
    let lattice = terrain.lattice();
    for i in 0..lattice.ny() {
        let row = (0..lattice.nx())
            .map(|j| terrain.height(i, j).to_string())
            .collect::<Vec<_>>();
        writeln!(out, "{}", row.join(" "))?;
    }
    Ok(())
}

pub fn save_heightfield(terrain: &Terrain, path: impl AsRef<Path>) -> Result<(), TerrainError> {
    let path = path.as_ref();
    let mut out = BufWriter::new(File::create(path)?);
    write_heightfield(terrain, &mut out)?;
    out.flush()?;
    info!("wrote heightfield to {}", path.display());
    Ok(())
}
