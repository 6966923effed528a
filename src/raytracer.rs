//! Scene geometry index: bounding volume hierarchy over every world-space triangle of a scene.
//!
//! The hierarchy is built once, before baking starts, and is never mutated afterwards, so any
//! amount of threads may query it concurrently without locking.
//!
//! Rays are [`Ray`] segments: a hit is only reported between `ray.origin` and
//! `ray.origin + ray.dir`, so the length of `dir` is the maximum query distance.

use crate::math::{self, aabb::AxisAlignedBoundingBox, plane::Plane, ray::Ray};
use arrayvec::ArrayVec;
use nalgebra::Vector3;

/// Nodes deeper than this become leaves; keeps traversal stack within its fixed capacity.
const MAX_DEPTH: u32 = 48;
const MAX_LEAF_SIZE: usize = 4;
const STACK_SIZE: usize = 64;
/// Node bounds are inflated by this fraction of their largest coordinate.
const BOUNDS_MARGIN: f32 = 1.0e-5;
/// Hits slightly outside of a triangle still count, so shared edges never leak rays.
const EDGE_TOLERANCE: f32 = 1.0e-6;

/// Identifies a triangle in the scene: instance, mesh of the instance, triangle of the mesh.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TriangleId {
    pub instance: u32,
    pub mesh: u32,
    pub triangle: u32,
}

/// Result of [`GeometryIndex::closest_hit`].
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Hit {
    /// World-space distance from the ray origin.
    pub distance: f32,
    pub id: TriangleId,
    /// Barycentric coordinates of the hit point relative to the triangle vertices.
    pub barycentric: (f32, f32, f32),
    /// Unit geometric normal of the hit triangle (winding order defines its side).
    pub geometric_normal: Vector3<f32>,
}

/// Result of [`GeometryIndex::closest_point_on_surface`].
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SurfacePoint {
    pub position: Vector3<f32>,
    pub geometric_normal: Vector3<f32>,
    pub id: TriangleId,
    pub barycentric: (f32, f32, f32),
    pub distance: f32,
}

/// Size of the box, zero for a box that has not seen any point yet.
pub fn bounds_extent(bounds: &AxisAlignedBoundingBox) -> Vector3<f32> {
    let size = bounds.max - bounds.min;
    if size.iter().all(|s| *s >= 0.0) {
        size
    } else {
        Vector3::zeros()
    }
}

/// Squared distance from the point to the box, zero if the point is inside.
fn sqr_distance_to_bounds(bounds: &AxisAlignedBoundingBox, point: &Vector3<f32>) -> f32 {
    let below = bounds.min - point;
    let above = point - bounds.max;
    below.sup(&above).sup(&Vector3::zeros()).norm_squared()
}

/// Grows the box a little so that points lying exactly on a face are strictly inside.
fn with_margin(mut bounds: AxisAlignedBoundingBox) -> AxisAlignedBoundingBox {
    let scale = bounds.min.amax().max(bounds.max.amax()).max(1.0);
    bounds.inflate(Vector3::repeat(2.0 * BOUNDS_MARGIN * scale));
    bounds
}

/// Segment parameter at which the ray enters the box, if it does so before `t_limit`.
fn segment_entry(ray: &Ray, bounds: &AxisAlignedBoundingBox, t_limit: f32) -> Option<f32> {
    ray.aabb_intersection(bounds)
        .filter(|hit| hit.min <= t_limit)
        .map(|hit| hit.min.max(0.0))
}

#[derive(Copy, Clone, Debug)]
enum Node {
    Branch {
        bounds: AxisAlignedBoundingBox,
        left: u32,
        right: u32,
    },
    Leaf {
        bounds: AxisAlignedBoundingBox,
        first: u32,
        count: u32,
    },
}

impl Node {
    fn bounds(&self) -> &AxisAlignedBoundingBox {
        match self {
            Node::Branch { bounds, .. } | Node::Leaf { bounds, .. } => bounds,
        }
    }
}

/// Triangle stored in the index.
#[derive(Clone, Debug)]
pub struct IndexedTriangle {
    pub id: TriangleId,
    pub vertices: [Vector3<f32>; 3],
}

#[derive(Clone, Debug, Default)]
pub struct GeometryIndex {
    nodes: Vec<Node>,
    triangles: Vec<IndexedTriangle>,
    bounds: AxisAlignedBoundingBox,
}

struct BuildItem {
    bounds: AxisAlignedBoundingBox,
    centroid: Vector3<f32>,
}

impl GeometryIndex {
    /// Builds the hierarchy with median splits along the longest centroid axis.
    pub fn new(triangles: Vec<IndexedTriangle>) -> Self {
        let items = triangles
            .iter()
            .map(|t| BuildItem {
                bounds: AxisAlignedBoundingBox::from_points(&t.vertices),
                centroid: (t.vertices[0] + t.vertices[1] + t.vertices[2]).scale(1.0 / 3.0),
            })
            .collect::<Vec<_>>();

        let mut order = (0..triangles.len() as u32).collect::<Vec<_>>();
        let mut nodes = Vec::with_capacity(triangles.len().max(1) * 2);
        if !triangles.is_empty() {
            build_recursive(&items, &mut order, 0, &mut nodes, 0);
        }

        let mut slots = triangles.into_iter().map(Some).collect::<Vec<_>>();
        let triangles = order
            .iter()
            .filter_map(|&i| slots[i as usize].take())
            .collect::<Vec<_>>();

        let bounds = nodes.first().map(|n| *n.bounds()).unwrap_or_default();

        Self {
            nodes,
            triangles,
            bounds,
        }
    }

    pub fn bounds(&self) -> &AxisAlignedBoundingBox {
        &self.bounds
    }

    pub fn triangle_count(&self) -> usize {
        self.triangles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triangles.is_empty()
    }

    /// Finds nearest intersection along the segment.
    pub fn closest_hit(&self, ray: &Ray) -> Option<Hit> {
        let mut best: Option<(f32, usize, (f32, f32, f32))> = None;
        self.traverse(ray, |t_limit, index, triangle| {
            if let Some((t, barycentric)) = intersect_triangle(ray, &triangle.vertices) {
                if t < t_limit {
                    best = Some((t, index, barycentric));
                    return Some(t);
                }
            }
            None
        });

        let (t, index, barycentric) = best?;
        let triangle = &self.triangles[index];
        Some(Hit {
            distance: t * ray.dir.norm(),
            id: triangle.id,
            barycentric,
            geometric_normal: face_normal(&triangle.vertices),
        })
    }

    /// Returns true if anything blocks the segment. Stops at the first found intersection.
    pub fn any_hit(&self, ray: &Ray) -> bool {
        let mut found = false;
        self.traverse(ray, |_, _, triangle| {
            if intersect_triangle(ray, &triangle.vertices).is_some() {
                found = true;
                // Collapsing the limit to zero terminates traversal.
                return Some(0.0);
            }
            None
        });
        found
    }

    /// Walks nodes intersected by the segment front to back. `visit` may shrink the segment by
    /// returning new parametric limit.
    fn traverse<F>(&self, ray: &Ray, mut visit: F)
    where
        F: FnMut(f32, usize, &IndexedTriangle) -> Option<f32>,
    {
        if self.nodes.is_empty() {
            return;
        }
        // The slab test picks slab order by the sign of each direction component, negative
        // zero must not reach it.
        let ray = Ray::new(ray.origin, ray.dir.map(|c| if c == 0.0 { 0.0 } else { c }));
        let mut t_limit = 1.0f32;
        let mut stack = ArrayVec::<u32, STACK_SIZE>::new();
        stack.push(0);

        while let Some(node_index) = stack.pop() {
            let node = &self.nodes[node_index as usize];
            if segment_entry(&ray, node.bounds(), t_limit).is_none() {
                continue;
            }
            match *node {
                Node::Leaf { first, count, .. } => {
                    for index in first as usize..(first + count) as usize {
                        if let Some(limit) = visit(t_limit, index, &self.triangles[index]) {
                            t_limit = limit;
                            if t_limit <= 0.0 {
                                return;
                            }
                        }
                    }
                }
                Node::Branch { left, right, .. } => {
                    let entry = |child: u32| {
                        segment_entry(&ray, self.nodes[child as usize].bounds(), t_limit)
                    };
                    match (entry(left), entry(right)) {
                        (Some(l), Some(r)) => {
                            // Push far child first so that near one is visited first.
                            if l <= r {
                                stack.push(right);
                                stack.push(left);
                            } else {
                                stack.push(left);
                                stack.push(right);
                            }
                        }
                        (Some(_), None) => stack.push(left),
                        (None, Some(_)) => stack.push(right),
                        (None, None) => (),
                    }
                }
            }
        }
    }

    /// Finds the point on the scene surface closest to `point`.
    pub fn closest_point_on_surface(&self, point: &Vector3<f32>) -> Option<SurfacePoint> {
        if self.nodes.is_empty() {
            return None;
        }
        let mut best_sqr_distance = f32::INFINITY;
        let mut best: Option<(usize, Vector3<f32>, (f32, f32, f32))> = None;
        let mut stack = ArrayVec::<u32, STACK_SIZE>::new();
        stack.push(0);

        while let Some(node_index) = stack.pop() {
            let node = &self.nodes[node_index as usize];
            if sqr_distance_to_bounds(node.bounds(), point) >= best_sqr_distance {
                continue;
            }
            match *node {
                Node::Leaf { first, count, .. } => {
                    for index in first as usize..(first + count) as usize {
                        let [a, b, c] = &self.triangles[index].vertices;
                        let (closest, barycentric) = closest_point_on_triangle(point, a, b, c);
                        let sqr_distance = (closest - point).norm_squared();
                        if sqr_distance < best_sqr_distance {
                            best_sqr_distance = sqr_distance;
                            best = Some((index, closest, barycentric));
                        }
                    }
                }
                Node::Branch { left, right, .. } => {
                    let dl = sqr_distance_to_bounds(self.nodes[left as usize].bounds(), point);
                    let dr = sqr_distance_to_bounds(self.nodes[right as usize].bounds(), point);
                    if dl <= dr {
                        stack.push(right);
                        stack.push(left);
                    } else {
                        stack.push(left);
                        stack.push(right);
                    }
                }
            }
        }

        best.map(|(index, position, barycentric)| {
            let triangle = &self.triangles[index];
            SurfacePoint {
                position,
                geometric_normal: face_normal(&triangle.vertices),
                id: triangle.id,
                barycentric,
                distance: best_sqr_distance.sqrt(),
            }
        })
    }
}

fn build_recursive(
    items: &[BuildItem],
    order: &mut [u32],
    first: u32,
    nodes: &mut Vec<Node>,
    depth: u32,
) -> u32 {
    let mut bounds = AxisAlignedBoundingBox::default();
    let mut centroid_bounds = AxisAlignedBoundingBox::default();
    for &i in order.iter() {
        bounds.add_box(items[i as usize].bounds);
        centroid_bounds.add_point(items[i as usize].centroid);
    }
    let bounds = with_margin(bounds);

    let node_index = nodes.len() as u32;
    let leaf = Node::Leaf {
        bounds,
        first,
        count: order.len() as u32,
    };

    let extent = bounds_extent(&centroid_bounds);
    if order.len() <= MAX_LEAF_SIZE || depth >= MAX_DEPTH || extent.max() <= f32::EPSILON {
        nodes.push(leaf);
        return node_index;
    }

    let axis = extent.imax();
    let mid = order.len() / 2;
    order.select_nth_unstable_by(mid, |a, b| {
        items[*a as usize].centroid[axis].total_cmp(&items[*b as usize].centroid[axis])
    });

    // Reserve slot for this node, children are appended after it.
    nodes.push(leaf);
    let (left_order, right_order) = order.split_at_mut(mid);
    let left = build_recursive(items, left_order, first, nodes, depth + 1);
    let right = build_recursive(items, right_order, first + mid as u32, nodes, depth + 1);
    nodes[node_index as usize] = Node::Branch {
        bounds,
        left,
        right,
    };
    node_index
}

pub fn face_normal(vertices: &[Vector3<f32>; 3]) -> Vector3<f32> {
    (vertices[1] - vertices[0])
        .cross(&(vertices[2] - vertices[0]))
        .try_normalize(f32::EPSILON)
        .unwrap_or_else(Vector3::zeros)
}

/// Intersection of a segment with a triangle. Returns the segment parameter in `(0; 1]` and
/// barycentric coordinates of the hit point. Both triangle sides are hit.
pub fn intersect_triangle(
    ray: &Ray,
    vertices: &[Vector3<f32>; 3],
) -> Option<(f32, (f32, f32, f32))> {
    let [a, b, c] = vertices;
    let plane = Plane::from_normal_and_point(&(b - a).cross(&(c - a)), a)?;
    let t = ray.plane_intersection(&plane);
    if !(t > 0.0 && t <= 1.0) {
        return None;
    }
    let barycentric = math::get_barycentric_coords(&ray.get_point(t), a, b, c);
    let (u, v, w) = barycentric;
    (u >= -EDGE_TOLERANCE && v >= -EDGE_TOLERANCE && w >= -EDGE_TOLERANCE)
        .then_some((t, barycentric))
}

/// Closest point on triangle `abc` to `p` (Ericson, Real-Time Collision Detection 5.1.5).
/// Returns the point and its barycentric coordinates.
pub fn closest_point_on_triangle(
    p: &Vector3<f32>,
    a: &Vector3<f32>,
    b: &Vector3<f32>,
    c: &Vector3<f32>,
) -> (Vector3<f32>, (f32, f32, f32)) {
    let ab = b - a;
    let ac = c - a;
    let ap = p - a;
    let d1 = ab.dot(&ap);
    let d2 = ac.dot(&ap);
    if d1 <= 0.0 && d2 <= 0.0 {
        return (*a, (1.0, 0.0, 0.0));
    }

    let bp = p - b;
    let d3 = ab.dot(&bp);
    let d4 = ac.dot(&bp);
    if d3 >= 0.0 && d4 <= d3 {
        return (*b, (0.0, 1.0, 0.0));
    }

    let vc = d1 * d4 - d3 * d2;
    if vc <= 0.0 && d1 >= 0.0 && d3 <= 0.0 {
        let v = d1 / (d1 - d3);
        return (a + ab.scale(v), (1.0 - v, v, 0.0));
    }

    let cp = p - c;
    let d5 = ab.dot(&cp);
    let d6 = ac.dot(&cp);
    if d6 >= 0.0 && d5 <= d6 {
        return (*c, (0.0, 0.0, 1.0));
    }

    let vb = d5 * d2 - d1 * d6;
    if vb <= 0.0 && d2 >= 0.0 && d6 <= 0.0 {
        let w = d2 / (d2 - d6);
        return (a + ac.scale(w), (1.0 - w, 0.0, w));
    }

    let va = d3 * d6 - d5 * d4;
    if va <= 0.0 && (d4 - d3) >= 0.0 && (d5 - d6) >= 0.0 {
        let w = (d4 - d3) / ((d4 - d3) + (d5 - d6));
        return (b + (c - b).scale(w), (0.0, 1.0 - w, w));
    }

    let denom = va + vb + vc;
    if denom.abs() <= f32::EPSILON {
        // Degenerate triangle.
        return (*a, (1.0, 0.0, 0.0));
    }
    let denom = 1.0 / denom;
    let v = vb * denom;
    let w = vc * denom;
    (a + ab.scale(v) + ac.scale(w), (1.0 - v - w, v, w))
}
