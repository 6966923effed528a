//! Seam optimization.
//!
//! Edges that are shared in 3D but split in light map UV space are sampled from two distant
//! texel rows, which shows up as visible discontinuities after bilinear filtering. The
//! optimizer walks both sides of every such seam in lockstep and pulls the texel pairs
//! towards their common average.

use crate::{bitmap::Bitmap, rasterizer::wrap_triangle, scene::Mesh};
use fxhash::FxHashMap;
use nalgebra::{Vector2, Vector3, Vector4};

const POSITION_TOLERANCE: f32 = 1.0e-4;
const NORMAL_TOLERANCE: f32 = 0.99;
const UV_TOLERANCE: f32 = 1.0e-6;

/// One side of a seam in light map UV space.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct UvSegment {
    pub begin: Vector2<f32>,
    pub end: Vector2<f32>,
    /// Unit vector perpendicular to the segment, pointing into its triangle.
    pub inward: Vector2<f32>,
    pub slice: u32,
}

impl UvSegment {
    fn lerp(&self, t: f32) -> Vector2<f32> {
        self.begin.lerp(&self.end, t)
    }

    fn pixel_length(&self, width: u32, height: u32) -> f32 {
        let d = self.end - self.begin;
        Vector2::new(d.x * width as f32, d.y * height as f32).norm()
    }

    fn matches(&self, other: &UvSegment) -> bool {
        self.slice == other.slice
            && (self.begin - other.begin).norm() <= UV_TOLERANCE
            && (self.end - other.end).norm() <= UV_TOLERANCE
    }
}

/// A 3D edge with two different light map UV segments. Both segments go from the same 3D
/// endpoint to the same other 3D endpoint.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Seam {
    pub a: UvSegment,
    pub b: UvSegment,
}

/// Welds vertices with equal positions and similar normals.
struct VertexWelder {
    cells: FxHashMap<[i64; 3], Vec<usize>>,
    vertices: Vec<(Vector3<f32>, Vector3<f32>)>,
    tolerance: f32,
}

impl VertexWelder {
    fn new(tolerance: f32) -> Self {
        Self {
            cells: FxHashMap::default(),
            vertices: Vec::new(),
            tolerance,
        }
    }

    fn cell(&self, position: &Vector3<f32>) -> [i64; 3] {
        position.map(|c| (c / self.tolerance).floor() as i64).into()
    }

    /// Returns welded index of a vertex, registering it when no close vertex exists yet.
    fn find_vertex(&mut self, position: Vector3<f32>, normal: Vector3<f32>) -> usize {
        let [cx, cy, cz] = self.cell(&position);
        for dz in -1..=1 {
            for dy in -1..=1 {
                for dx in -1..=1 {
                    let Some(indices) = self.cells.get(&[cx + dx, cy + dy, cz + dz]) else {
                        continue;
                    };
                    for &index in indices {
                        let (other_position, other_normal) = &self.vertices[index];
                        if (other_position - position).norm() <= self.tolerance
                            && other_normal.dot(&normal) >= NORMAL_TOLERANCE
                        {
                            return index;
                        }
                    }
                }
            }
        }
        let index = self.vertices.len();
        self.vertices.push((position, normal));
        self.cells.entry([cx, cy, cz]).or_default().push(index);
        index
    }
}

#[derive(Debug, Default)]
pub struct SeamOptimizer {
    seams: Vec<Seam>,
    width: u32,
    height: u32,
}

impl SeamOptimizer {
    /// Finds every seam of the mesh for a light map of given size.
    pub fn new(mesh: &Mesh, width: u32, height: u32) -> Self {
        let extent = mesh
            .vertices
            .iter()
            .fold(0.0f32, |acc, v| acc.max(v.position.amax()));
        let mut welder = VertexWelder::new(POSITION_TOLERANCE * extent.max(1.0));

        let welded = mesh
            .vertices
            .iter()
            .map(|v| {
                let normal = v.normal.try_normalize(f32::EPSILON).unwrap_or_else(Vector3::zeros);
                welder.find_vertex(v.position, normal)
            })
            .collect::<Vec<_>>();

        let mut edges: FxHashMap<(usize, usize), Vec<UvSegment>> = FxHashMap::default();
        for (triangle_index, triangle) in mesh.triangles.iter().enumerate() {
            let [a, b, c] = mesh.triangle(triangle_index);
            let uvs = wrap_triangle([a.lightmap_uv, b.lightmap_uv, c.lightmap_uv]);
            for k in 0..3 {
                let (i0, i1, opposite) = (k, (k + 1) % 3, (k + 2) % 3);
                let (w0, w1) = (welded[triangle[i0] as usize], welded[triangle[i1] as usize]);
                if w0 == w1 {
                    continue;
                }
                let (begin, end) = if w0 < w1 {
                    (uvs[i0], uvs[i1])
                } else {
                    (uvs[i1], uvs[i0])
                };
                let direction = end - begin;
                let mut inward = Vector2::new(-direction.y, direction.x)
                    .try_normalize(f32::EPSILON)
                    .unwrap_or_else(Vector2::zeros);
                if inward.dot(&(uvs[opposite] - begin)) < 0.0 {
                    inward = -inward;
                }
                edges.entry((w0.min(w1), w0.max(w1))).or_default().push(UvSegment {
                    begin,
                    end,
                    inward,
                    slice: mesh.lightmap_page,
                });
            }
        }

        let mut keys = edges.keys().copied().collect::<Vec<_>>();
        keys.sort_unstable();

        let mut seams = Vec::new();
        for key in keys {
            let segments = &edges[&key];
            let Some((first, rest)) = segments.split_first() else {
                continue;
            };
            for other in rest {
                if !first.matches(other) {
                    seams.push(Seam {
                        a: *first,
                        b: *other,
                    });
                }
            }
        }

        Self {
            seams,
            width,
            height,
        }
    }

    pub fn seams(&self) -> &[Seam] {
        &self.seams
    }

    /// Amount of lockstep samples taken along a seam, at least 2.
    pub fn compute_step_count(seam: &Seam, width: u32, height: u32) -> u32 {
        let length = seam
            .a
            .pixel_length(width, height)
            .max(seam.b.pixel_length(width, height));
        if !length.is_finite() {
            return 2;
        }
        ((length * 3.0).ceil() as u32 + 1).max(2)
    }

    fn texel_index(&self, segment: &UvSegment, t: f32, bitmap: &Bitmap) -> Option<usize> {
        let half_texel = Vector2::new(0.5 / self.width as f32, 0.5 / self.height as f32);
        let uv = segment.lerp(t) + segment.inward.component_mul(&half_texel);
        if !uv.x.is_finite() || !uv.y.is_finite() {
            return None;
        }
        let x = ((uv.x * self.width as f32).floor().max(0.0) as u32).min(self.width - 1);
        let y = ((uv.y * self.height as f32).floor().max(0.0) as u32).min(self.height - 1);
        bitmap.index(x, y, segment.slice).ok()
    }

    /// Blends texels on both sides of every seam. Returns amount of texels changed.
    pub fn optimize(&self, bitmap: &mut Bitmap) -> usize {
        if self.seams.is_empty()
            || self.width == 0
            || self.height == 0
            || bitmap.width() != self.width
            || bitmap.height() != self.height
        {
            return 0;
        }

        let mut targets = vec![(Vector4::<f32>::zeros(), 0u32); bitmap.data().len()];
        for seam in self.seams.iter() {
            let steps = Self::compute_step_count(seam, self.width, self.height);
            for step in 0..steps {
                let t = step as f32 / (steps - 1) as f32;
                let (Some(ia), Some(ib)) = (
                    self.texel_index(&seam.a, t, bitmap),
                    self.texel_index(&seam.b, t, bitmap),
                ) else {
                    continue;
                };
                if ia == ib {
                    continue;
                }
                let (ta, tb) = (bitmap.data()[ia], bitmap.data()[ib]);
                if !Bitmap::is_populated(&ta) || !Bitmap::is_populated(&tb) {
                    continue;
                }
                let average = (ta + tb).scale(0.5);
                for index in [ia, ib] {
                    let (sum, count) = &mut targets[index];
                    *sum += average;
                    *count += 1;
                }
            }
        }

        let mut changed = 0;
        for (texel, (sum, count)) in bitmap.data_mut().iter_mut().zip(targets) {
            if count == 0 {
                continue;
            }
            let mean = sum / count as f32;
            texel.x = mean.x;
            texel.y = mean.y;
            texel.z = mean.z;
            changed += 1;
        }
        changed
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::scene::{Material, Vertex};
    use std::sync::Arc;

    /// Two quads sharing the edge x = 1, with their light map islands apart from each other.
    fn split_strip() -> Mesh {
        let vertex = |x: f32, z: f32, u: f32| Vertex {
            position: Vector3::new(x, 0.0, z),
            normal: Vector3::new(0.0, 1.0, 0.0),
            uv: Vector2::zeros(),
            lightmap_uv: Vector2::new(u, z),
        };
        Mesh::new(
            vec![
                vertex(0.0, 0.0, 0.0),
                vertex(1.0, 0.0, 0.25),
                vertex(1.0, 1.0, 0.25),
                vertex(0.0, 1.0, 0.0),
                vertex(1.0, 0.0, 0.5),
                vertex(2.0, 0.0, 0.75),
                vertex(2.0, 1.0, 0.75),
                vertex(1.0, 1.0, 0.5),
            ],
            vec![[0, 2, 1], [0, 3, 2], [4, 6, 5], [4, 7, 6]],
            Arc::new(Material::default()),
        )
        .unwrap()
    }

    fn split_bitmap() -> Bitmap {
        let mut bitmap = Bitmap::new(8, 8, 1);
        for y in 0..8 {
            for x in 0..2 {
                bitmap.set(x, y, 0, Vector4::new(1.0, 1.0, 1.0, 1.0)).unwrap();
            }
            for x in 4..6 {
                bitmap.set(x, y, 0, Vector4::new(0.0, 0.0, 0.0, 1.0)).unwrap();
            }
        }
        bitmap
    }

    #[test]
    fn shared_edge_with_split_uvs_is_seam() {
        let optimizer = SeamOptimizer::new(&split_strip(), 8, 8);
        assert_eq!(optimizer.seams().len(), 1);
        let seam = optimizer.seams()[0];
        assert_eq!(seam.a.begin.x, 0.25);
        assert_eq!(seam.b.begin.x, 0.5);
        // Both sides go from z = 0 to z = 1.
        assert_eq!(seam.a.begin.y, seam.b.begin.y);
        assert_eq!(seam.a.inward, Vector2::new(-1.0, 0.0));
        assert_eq!(seam.b.inward, Vector2::new(1.0, 0.0));
    }

    #[test]
    fn continuous_mesh_has_no_seams() {
        let mut mesh = split_strip();
        for v in mesh.vertices.iter_mut() {
            v.lightmap_uv.x = v.position.x / 2.0;
        }
        assert!(SeamOptimizer::new(&mesh, 8, 8).seams().is_empty());
    }

    #[test]
    fn different_normals_are_not_welded() {
        let mut mesh = split_strip();
        for v in mesh.vertices[4..].iter_mut() {
            v.normal = Vector3::new(1.0, 1.0, 0.0).normalize();
        }
        assert!(SeamOptimizer::new(&mesh, 8, 8).seams().is_empty());
    }

    #[test]
    fn step_count() {
        let optimizer = SeamOptimizer::new(&split_strip(), 8, 8);
        assert_eq!(SeamOptimizer::compute_step_count(&optimizer.seams()[0], 8, 8), 25);
        let point = UvSegment {
            begin: Vector2::zeros(),
            end: Vector2::zeros(),
            inward: Vector2::zeros(),
            slice: 0,
        };
        let seam = Seam { a: point, b: point };
        assert_eq!(SeamOptimizer::compute_step_count(&seam, 8, 8), 2);
    }

    #[test]
    fn seam_texels_meet_in_the_middle() {
        let optimizer = SeamOptimizer::new(&split_strip(), 8, 8);
        let mut bitmap = split_bitmap();
        assert_eq!(optimizer.optimize(&mut bitmap), 16);
        for y in 0..8 {
            assert_eq!(bitmap.get(1, y, 0).unwrap(), Vector4::new(0.5, 0.5, 0.5, 1.0));
            assert_eq!(bitmap.get(4, y, 0).unwrap(), Vector4::new(0.5, 0.5, 0.5, 1.0));
            assert_eq!(bitmap.get(0, y, 0).unwrap().x, 1.0);
            assert_eq!(bitmap.get(5, y, 0).unwrap().x, 0.0);
        }
    }

    #[test]
    fn optimization_is_deterministic() {
        let mesh = split_strip();
        let mut first = split_bitmap();
        let mut second = split_bitmap();
        SeamOptimizer::new(&mesh, 8, 8).optimize(&mut first);
        SeamOptimizer::new(&mesh, 8, 8).optimize(&mut second);
        assert_eq!(first, second);
    }

    #[test]
    fn holes_are_left_untouched() {
        let optimizer = SeamOptimizer::new(&split_strip(), 8, 8);
        let mut bitmap = Bitmap::new(8, 8, 1);
        assert_eq!(optimizer.optimize(&mut bitmap), 0);
        assert_eq!(bitmap, Bitmap::new(8, 8, 1));
    }
}
