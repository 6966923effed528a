//! Maps light map texels to surface points.
//!
//! Texel centres are tested against the light map UV triangles of a mesh. A uniform grid over
//! UV space keeps the amount of triangles tested per texel small.

use crate::{math, scene::Mesh};
use nalgebra::{Vector2, Vector3};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RasterizeOptions {
    /// Curves positions of flat triangles towards their vertex normals, so that texels of
    /// coarse meshes sample a smooth surface.
    pub smooth_position: bool,
}

impl Default for RasterizeOptions {
    fn default() -> Self {
        Self {
            smooth_position: true,
        }
    }
}

/// A single texel that has to be shaded.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct TexelJob {
    pub x: u32,
    pub y: u32,
    pub slice: u32,
    /// World space position of the texel centre.
    pub position: Vector3<f32>,
    /// Interpolated unit normal.
    pub normal: Vector3<f32>,
    /// Index of the mesh triangle containing the texel centre.
    pub triangle: u32,
}

struct GridCell {
    // List of triangle indices.
    triangles: Vec<u32>,
}

struct Grid {
    cells: Vec<GridCell>,
    size: usize,
    fsize: f32,
}

impl Grid {
    /// Creates uniform grid where each cell contains list of triangles whose light map
    /// texture coordinates intersect with it.
    fn new(uvs: &[[Vector2<f32>; 3]], size: usize) -> Self {
        let size = size.max(1);
        let fsize = size as f32;
        let mut cells = (0..size * size)
            .map(|_| GridCell {
                triangles: Vec::new(),
            })
            .collect::<Vec<_>>();

        let cell_index = |v: f32| ((v * fsize).floor().max(0.0) as usize).min(size - 1);

        for (triangle_index, [uv_a, uv_b, uv_c]) in uvs.iter().enumerate() {
            let uv_min = uv_a.inf(uv_b).inf(uv_c);
            let uv_max = uv_a.sup(uv_b).sup(uv_c);
            if !uv_min.iter().chain(uv_max.iter()).all(|v| v.is_finite()) {
                continue;
            }
            for y in cell_index(uv_min.y)..=cell_index(uv_max.y) {
                for x in cell_index(uv_min.x)..=cell_index(uv_max.x) {
                    cells[y * size + x].triangles.push(triangle_index as u32);
                }
            }
        }

        Self { cells, size, fsize }
    }

    fn pick(&self, v: Vector2<f32>) -> Option<&GridCell> {
        if v.x < 0.0 || v.y < 0.0 {
            return None;
        }
        let ix = (v.x * self.fsize) as usize;
        let iy = (v.y * self.fsize) as usize;
        if ix >= self.size || iy >= self.size {
            return None;
        }
        self.cells.get(iy * self.size + ix)
    }
}

/// Inclusive barycentric test, so that texel centres lying exactly on an edge shared by two
/// triangles are not lost.
fn is_inside(barycentric: (f32, f32, f32)) -> bool {
    const EPS: f32 = 1.0e-6;
    barycentric.0 >= -EPS && barycentric.1 >= -EPS && barycentric.2 >= -EPS
}

/// Shifts triangle UVs so that its centroid lies in `[0; 1)`. Tiled light map coordinates
/// are common for meshes authored with wrapping samplers.
pub(crate) fn wrap_triangle(uvs: [Vector2<f32>; 3]) -> [Vector2<f32>; 3] {
    let centroid = (uvs[0] + uvs[1] + uvs[2]).scale(1.0 / 3.0);
    let shift = centroid.map(f32::floor);
    if shift.iter().all(|s| s.is_finite()) {
        uvs.map(|uv| uv - shift)
    } else {
        uvs
    }
}

/// Projects `point` on the tangent planes of triangle vertices and blends the projections
/// with barycentric weights.
fn smooth_position(
    point: Vector3<f32>,
    barycentric: (f32, f32, f32),
    positions: [Vector3<f32>; 3],
    normals: [Vector3<f32>; 3],
) -> Vector3<f32> {
    let project = |position: Vector3<f32>, normal: Vector3<f32>| {
        point - normal.scale((point - position).dot(&normal))
    };
    let smooth = math::barycentric_to_world(
        barycentric,
        project(positions[0], normals[0]),
        project(positions[1], normals[1]),
        project(positions[2], normals[2]),
    );
    if smooth.iter().all(|c| c.is_finite()) {
        smooth
    } else {
        point
    }
}

/// Texel rasterizer of one mesh into a `width x height` light map page.
pub struct Rasterizer<'a> {
    mesh: &'a Mesh,
    width: u32,
    height: u32,
    options: RasterizeOptions,
    uvs: Vec<[Vector2<f32>; 3]>,
    grid: Grid,
}

impl<'a> Rasterizer<'a> {
    pub fn new(mesh: &'a Mesh, width: u32, height: u32, options: RasterizeOptions) -> Self {
        let uvs = (0..mesh.triangles.len())
            .map(|i| {
                let [a, b, c] = mesh.triangle(i);
                wrap_triangle([a.lightmap_uv, b.lightmap_uv, c.lightmap_uv])
            })
            .collect::<Vec<_>>();
        let grid = Grid::new(&uvs, (width.max(height) / 32).max(4) as usize);
        Self {
            mesh,
            width,
            height,
            options,
            uvs,
            grid,
        }
    }

    /// Calculates properties of texel (world position, normal) at given position.
    pub fn pick(&self, x: u32, y: u32) -> Option<TexelJob> {
        let uv = Vector2::new(
            (x as f32 + 0.5) / self.width as f32,
            (y as f32 + 0.5) / self.height as f32,
        );
        let cell = self.grid.pick(uv)?;
        for &triangle_index in cell.triangles.iter() {
            let [uv_a, uv_b, uv_c] = self.uvs[triangle_index as usize];
            let barycentric = math::get_barycentric_coords_2d(uv, uv_a, uv_b, uv_c);
            if !is_inside(barycentric) {
                continue;
            }

            let [a, b, c] = self.mesh.triangle(triangle_index as usize);
            let positions = [a.position, b.position, c.position];
            let normals = [a.normal, b.normal, c.normal];

            let mut position =
                math::barycentric_to_world(barycentric, positions[0], positions[1], positions[2]);
            let normal =
                math::barycentric_to_world(barycentric, normals[0], normals[1], normals[2])
                    .try_normalize(f32::EPSILON)
                    .unwrap_or_else(|| crate::raytracer::face_normal(&positions));
            if self.options.smooth_position {
                position = smooth_position(position, barycentric, positions, normals);
            }

            return Some(TexelJob {
                x,
                y,
                slice: self.mesh.lightmap_page,
                position,
                normal,
                triangle: triangle_index,
            });
        }
        None
    }

    /// Lazily visits every texel whose centre lies inside one of the mesh triangles.
    pub fn texels(&self) -> impl Iterator<Item = TexelJob> + '_ {
        (0..self.height).flat_map(move |y| (0..self.width).filter_map(move |x| self.pick(x, y)))
    }
}

/// Shorthand for [`Rasterizer::texels`] over a freshly built rasterizer.
pub fn rasterize(
    mesh: &Mesh,
    width: u32,
    height: u32,
    options: RasterizeOptions,
) -> impl Iterator<Item = TexelJob> + '_ {
    let rasterizer = Rasterizer::new(mesh, width, height, options);
    (0..height).flat_map(move |y| {
        (0..width)
            .filter_map(|x| rasterizer.pick(x, y))
            .collect::<Vec<_>>()
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::scene::{Material, Vertex};
    use std::sync::Arc;

    fn quad(uv_offset: Vector2<f32>) -> Mesh {
        let vertex = |x: f32, z: f32| Vertex {
            position: Vector3::new(x, 0.0, z),
            normal: Vector3::new(0.0, 1.0, 0.0),
            uv: Vector2::new(x, z),
            lightmap_uv: Vector2::new(x, z) + uv_offset,
        };
        Mesh::new(
            vec![vertex(0.0, 0.0), vertex(1.0, 0.0), vertex(1.0, 1.0), vertex(0.0, 1.0)],
            vec![[0, 2, 1], [0, 3, 2]],
            Arc::new(Material::default()),
        )
        .unwrap()
    }

    #[test]
    fn full_quad_covers_every_texel() {
        let mesh = quad(Vector2::zeros());
        let jobs = rasterize(&mesh, 8, 8, RasterizeOptions::default()).collect::<Vec<_>>();
        assert_eq!(jobs.len(), 64);
        for job in jobs {
            let expected =
                Vector3::new((job.x as f32 + 0.5) / 8.0, 0.0, (job.y as f32 + 0.5) / 8.0);
            assert!((job.position - expected).norm() < 1.0e-5);
            assert_eq!(job.normal, Vector3::new(0.0, 1.0, 0.0));
            assert_eq!(job.slice, 0);
        }
    }

    #[test]
    fn triangle_covers_half_of_texels() {
        let mut mesh = quad(Vector2::zeros());
        mesh.triangles.truncate(1);
        let jobs = rasterize(&mesh, 16, 16, RasterizeOptions::default()).collect::<Vec<_>>();
        // Centres on the diagonal are counted by at most one side.
        assert!(jobs.len() >= 120 && jobs.len() <= 136, "{}", jobs.len());
        assert!(jobs.iter().all(|j| j.triangle == 0 && j.x >= j.y));
    }

    #[test]
    fn tiled_uvs_are_wrapped() {
        let mesh = quad(Vector2::new(2.0, -3.0)).with_lightmap_page(2);
        let jobs = rasterize(&mesh, 4, 4, RasterizeOptions::default()).collect::<Vec<_>>();
        assert_eq!(jobs.len(), 16);
        assert!(jobs.iter().all(|j| j.slice == 2));
    }

    #[test]
    fn smooth_position_bends_towards_normals() {
        let vertex = |x: f32, nx: f32| Vertex {
            position: Vector3::new(x, 0.0, 0.0),
            normal: Vector3::new(nx, 1.0, 0.0).normalize(),
            uv: Vector2::zeros(),
            lightmap_uv: Vector2::new(x, 0.0),
        };
        let mut top = vertex(0.5, 0.0);
        top.position.z = 1.0;
        top.lightmap_uv = Vector2::new(0.5, 1.0);
        let mesh = Mesh::new(
            vec![vertex(0.0, -1.0), vertex(1.0, 1.0), top],
            vec![[0, 1, 2]],
            Arc::new(Material::default()),
        )
        .unwrap();

        let flat = Rasterizer::new(&mesh, 8, 8, RasterizeOptions { smooth_position: false });
        let smooth = Rasterizer::new(&mesh, 8, 8, RasterizeOptions { smooth_position: true });
        let a = flat.pick(4, 1).unwrap();
        let b = smooth.pick(4, 1).unwrap();
        assert_eq!(a.position.y, 0.0);
        assert!(b.position.y > 0.0);
    }

    #[test]
    fn texels_outside_triangles_are_skipped() {
        let mesh = quad(Vector2::new(0.0, 0.0));
        let rasterizer = Rasterizer::new(&mesh, 4, 4, RasterizeOptions::default());
        assert!(rasterizer.pick(4, 0).is_none());
        assert_eq!(rasterizer.texels().count(), 16);
    }
}
