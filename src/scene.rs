//! Baker input: instanced meshes, lights and light field volumes of a single stage.
//!
//! A [`Scene`] is built once at load time and stays immutable while a bake runs, bakes share it
//! through an `Arc`.

use crate::{
    bitmap::Bitmap,
    error::PreconditionError,
    light::Light,
    math::{self, aabb::AxisAlignedBoundingBox},
    params::BakeParams,
    raytracer::{bounds_extent, GeometryIndex, Hit, IndexedTriangle, TriangleId},
};
use nalgebra::{Matrix3, Matrix4, Point3, UnitQuaternion, Vector2, Vector3};
use std::sync::Arc;

/// Rec. 709 luma weights.
pub const LUMINANCE: [f32; 3] = [0.2126, 0.7152, 0.0722];

pub fn luminance(color: &Vector3<f32>) -> f32 {
    color.x * LUMINANCE[0] + color.y * LUMINANCE[1] + color.z * LUMINANCE[2]
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Vertex {
    pub position: Vector3<f32>,
    pub normal: Vector3<f32>,
    /// Material texture coordinates.
    pub uv: Vector2<f32>,
    /// Coordinates in the light map atlas.
    pub lightmap_uv: Vector2<f32>,
}

/// Render group of a mesh. Does not affect baking.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum MeshGroup {
    #[default]
    Opaque,
    Transparent,
    PunchThrough,
    Special,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Material {
    pub name: String,
    pub diffuse: Vector3<f32>,
    pub diffuse_texture: Option<Arc<Bitmap>>,
    pub emission: Vector3<f32>,
}

impl Default for Material {
    fn default() -> Self {
        Self {
            name: String::new(),
            diffuse: Vector3::repeat(1.0),
            diffuse_texture: None,
            emission: Vector3::zeros(),
        }
    }
}

impl Material {
    pub fn diffuse(name: impl Into<String>, diffuse: Vector3<f32>) -> Self {
        Self {
            name: name.into(),
            diffuse,
            ..Default::default()
        }
    }

    pub fn with_emission(mut self, emission: Vector3<f32>) -> Self {
        self.emission = emission;
        self
    }

    pub fn with_texture(mut self, texture: Arc<Bitmap>) -> Self {
        self.diffuse_texture = Some(texture);
        self
    }

    /// Surface reflectance at given texture coordinates, adjusted by diffuse strength and
    /// saturation and clamped to `[0; 1]`.
    pub fn albedo_at(&self, uv: Vector2<f32>, params: &BakeParams) -> Vector3<f32> {
        let mut color = self.diffuse;
        if let Some(texture) = self.diffuse_texture.as_ref() {
            color.component_mul_assign(&texture.sample_nearest(uv, 0).xyz());
        }
        let luminance = luminance(&color);
        let saturated = Vector3::repeat(luminance).lerp(&color, params.diffuse_saturation);
        saturated
            .scale(params.diffuse_strength)
            .map(|c| c.clamp(0.0, 1.0))
    }

    pub fn emission_at(&self, params: &BakeParams) -> Vector3<f32> {
        self.emission.scale(params.emission_strength).map(|c| c.max(0.0))
    }
}

#[derive(Clone, Debug)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub triangles: Vec<[u32; 3]>,
    pub material: Arc<Material>,
    pub group: MeshGroup,
    /// Array slice of the instance light map this mesh is baked into.
    pub lightmap_page: u32,
}

impl Mesh {
    pub fn new(
        vertices: Vec<Vertex>,
        triangles: Vec<[u32; 3]>,
        material: Arc<Material>,
    ) -> Result<Self, PreconditionError> {
        if triangles
            .iter()
            .flatten()
            .any(|&i| i as usize >= vertices.len())
        {
            return Err(PreconditionError::InvalidIndex);
        }
        Ok(Self {
            vertices,
            triangles,
            material,
            group: MeshGroup::Opaque,
            lightmap_page: 0,
        })
    }

    pub fn with_group(mut self, group: MeshGroup) -> Self {
        self.group = group;
        self
    }

    pub fn with_lightmap_page(mut self, page: u32) -> Self {
        self.lightmap_page = page;
        self
    }

    pub fn triangle(&self, index: usize) -> [&Vertex; 3] {
        let [a, b, c] = self.triangles[index];
        [
            &self.vertices[a as usize],
            &self.vertices[b as usize],
            &self.vertices[c as usize],
        ]
    }

    pub fn area(&self) -> f32 {
        (0..self.triangles.len())
            .map(|i| {
                let [a, b, c] = self.triangle(i);
                math::triangle_area(a.position, b.position, c.position)
            })
            .sum()
    }

    fn transformed(mut self, transform: &Matrix4<f32>) -> Self {
        let normal_matrix = transform
            .fixed_view::<3, 3>(0, 0)
            .into_owned()
            .try_inverse()
            .map(|m| m.transpose())
            .unwrap_or_else(Matrix3::identity);
        for vertex in self.vertices.iter_mut() {
            vertex.position = transform
                .transform_point(&Point3::from(vertex.position))
                .coords;
            vertex.normal = (normal_matrix * vertex.normal)
                .try_normalize(f32::EPSILON)
                .unwrap_or_else(Vector3::zeros);
        }
        self
    }
}

/// Placed mesh geometry. Vertices are stored in world space.
#[derive(Clone, Debug)]
pub struct Instance {
    pub name: String,
    pub meshes: Vec<Mesh>,
    pub transform: Matrix4<f32>,
    pub resolution_override: Option<u16>,
}

impl Instance {
    /// Creates an instance, moving local-space meshes into world space.
    pub fn new(name: impl Into<String>, meshes: Vec<Mesh>, transform: Matrix4<f32>) -> Self {
        Self {
            name: name.into(),
            meshes: meshes
                .into_iter()
                .map(|mesh| mesh.transformed(&transform))
                .collect(),
            transform,
            resolution_override: None,
        }
    }

    pub fn with_resolution_override(mut self, resolution: u16) -> Self {
        self.resolution_override = Some(resolution);
        self
    }

    /// Amount of light map array slices used by the meshes of the instance.
    pub fn page_count(&self) -> u32 {
        self.meshes
            .iter()
            .map(|m| m.lightmap_page + 1)
            .max()
            .unwrap_or(1)
    }

    pub fn world_area(&self) -> f32 {
        self.meshes.iter().map(Mesh::area).sum()
    }
}

/// Spherical harmonics light field volume: a box of cells with regular spacing.
#[derive(Clone, Debug, PartialEq)]
pub struct ShLightField {
    pub name: String,
    pub position: Vector3<f32>,
    pub rotation: UnitQuaternion<f32>,
    /// Full size of the box along its local axes.
    pub scale: Vector3<f32>,
    /// Explicit amount of cells per axis.
    pub resolution: Option<[u32; 3]>,
}

impl ShLightField {
    pub fn new(name: impl Into<String>, position: Vector3<f32>, scale: Vector3<f32>) -> Self {
        Self {
            name: name.into(),
            position,
            rotation: UnitQuaternion::identity(),
            scale,
            resolution: None,
        }
    }

    pub fn with_rotation(mut self, rotation: UnitQuaternion<f32>) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_resolution(mut self, resolution: [u32; 3]) -> Self {
        self.resolution = Some(resolution);
        self
    }

    /// Amount of cells per axis. Derived from the cell radius when not given explicitly.
    pub fn cell_resolution(&self, params: &BakeParams) -> [u32; 3] {
        if let Some(resolution) = self.resolution {
            return resolution.map(|r| r.max(1));
        }
        let cell = 2.0 * params.light_field_min_cell_radius.max(f32::EPSILON);
        let axis = |size: f32| {
            ((size.abs() * params.light_field_aabb_size_multiplier / cell).ceil() as u32).max(1)
        };
        [axis(self.scale.x), axis(self.scale.y), axis(self.scale.z)]
    }

    /// World position of the centre of cell `(x, y, z)`.
    pub fn cell_position(&self, resolution: [u32; 3], x: u32, y: u32, z: u32) -> Vector3<f32> {
        let local = Vector3::new(
            (x as f32 + 0.5) / resolution[0] as f32 - 0.5,
            (y as f32 + 0.5) / resolution[1] as f32 - 0.5,
            (z as f32 + 0.5) / resolution[2] as f32 - 0.5,
        )
        .component_mul(&self.scale);
        self.position + self.rotation * local
    }
}

/// Instanced props whose lighting is sampled once per placement.
#[derive(Clone, Debug, PartialEq)]
pub struct MetaInstancer {
    pub name: String,
    pub positions: Vec<Vector3<f32>>,
}

/// Everything needed to build a [`Scene`].
#[derive(Clone, Debug, Default)]
pub struct SceneInput {
    pub instances: Vec<Instance>,
    pub lights: Vec<Light>,
    pub light_fields: Vec<ShLightField>,
    pub meta_instancers: Vec<MetaInstancer>,
}

/// Immutable stage data with a ray queryable index over it.
#[derive(Debug, Default)]
pub struct Scene {
    instances: Vec<Instance>,
    lights: Vec<Light>,
    light_fields: Vec<ShLightField>,
    meta_instancers: Vec<MetaInstancer>,
    index: GeometryIndex,
}

impl Scene {
    pub fn new(input: SceneInput) -> Self {
        let SceneInput {
            instances,
            lights,
            light_fields,
            meta_instancers,
        } = input;

        let mut triangles = Vec::new();
        for (instance_index, instance) in instances.iter().enumerate() {
            for (mesh_index, mesh) in instance.meshes.iter().enumerate() {
                for (triangle_index, triangle) in mesh.triangles.iter().enumerate() {
                    triangles.push(IndexedTriangle {
                        id: TriangleId {
                            instance: instance_index as u32,
                            mesh: mesh_index as u32,
                            triangle: triangle_index as u32,
                        },
                        vertices: triangle.map(|i| mesh.vertices[i as usize].position),
                    });
                }
            }
        }

        Self {
            index: GeometryIndex::new(triangles),
            instances,
            lights,
            light_fields,
            meta_instancers,
        }
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    pub fn lights(&self) -> &[Light] {
        &self.lights
    }

    pub fn light_fields(&self) -> &[ShLightField] {
        &self.light_fields
    }

    pub fn meta_instancers(&self) -> &[MetaInstancer] {
        &self.meta_instancers
    }

    pub fn index(&self) -> &GeometryIndex {
        &self.index
    }

    pub fn bounds(&self) -> &AxisAlignedBoundingBox {
        self.index.bounds()
    }

    /// Length of the scene bounds diagonal, used as "infinite" ray length.
    pub fn ray_length(&self) -> f32 {
        (bounds_extent(self.index.bounds()).norm() * 2.0).max(1.0)
    }

    pub fn mesh(&self, id: &TriangleId) -> &Mesh {
        &self.instances[id.instance as usize].meshes[id.mesh as usize]
    }

    /// Shading attributes at a hit point: position, interpolated normal, material uv.
    pub fn surface(
        &self,
        hit: &Hit,
        origin: &Vector3<f32>,
        direction: &Vector3<f32>,
    ) -> SurfaceSample<'_> {
        let mesh = self.mesh(&hit.id);
        let [a, b, c] = mesh.triangle(hit.id.triangle as usize);
        let bary = hit.barycentric;
        let normal = math::barycentric_to_world(bary, a.normal, b.normal, c.normal)
            .try_normalize(f32::EPSILON)
            .unwrap_or(hit.geometric_normal);
        let uv = a.uv.scale(bary.0) + b.uv.scale(bary.1) + c.uv.scale(bary.2);
        SurfaceSample {
            position: origin + direction.scale(hit.distance),
            normal,
            uv,
            material: &mesh.material,
        }
    }
}

/// Shading attributes of a surface point.
#[derive(Copy, Clone, Debug)]
pub struct SurfaceSample<'a> {
    pub position: Vector3<f32>,
    pub normal: Vector3<f32>,
    pub uv: Vector2<f32>,
    pub material: &'a Material,
}
