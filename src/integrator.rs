//! Path tracing kernel of the baker.
//!
//! Light map texels store irradiance-like values which are multiplied by surface albedo at
//! runtime: direct light is `color * max(0, N.L) * attenuation * visibility` per light, and
//! indirect light is the average incoming radiance over cosine weighted directions (the
//! cosine term and the pdf cancel out).

use crate::{
    light::Light,
    math::ray::Ray,
    params::BakeParams,
    sampler::{
        orthonormal_basis, sample_cosine_weighted_hemisphere, sample_direction_hemisphere,
        sample_stratified_cosine_weighted_hemisphere, sample_vogel_disk, tangent_to_world,
        Sampler,
    },
    scene::{Material, Scene},
};
use nalgebra::Vector3;
use std::f32::consts::PI;

/// Result of a single traced path.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PathSample {
    /// Radiance carried back to the path origin.
    pub radiance: Vector3<f32>,
    /// Amount of rays traced.
    pub depth: u32,
    /// Depth at which the first russian roulette decision was taken.
    pub first_roulette_depth: Option<u32>,
}

pub struct Integrator<'a> {
    scene: &'a Scene,
    params: &'a BakeParams,
    ray_length: f32,
}

fn is_finite(v: &Vector3<f32>) -> bool {
    v.iter().all(|c| c.is_finite())
}

/// Normalizes shading normal, degenerate normals are rejected.
fn sanitize_normal(normal: &Vector3<f32>) -> Option<Vector3<f32>> {
    if !is_finite(normal) {
        return None;
    }
    normal.try_normalize(1.0e-12)
}

impl<'a> Integrator<'a> {
    pub fn new(scene: &'a Scene, params: &'a BakeParams) -> Self {
        Self {
            scene,
            params,
            ray_length: scene.ray_length(),
        }
    }

    pub fn scene(&self) -> &'a Scene {
        self.scene
    }

    pub fn params(&self) -> &'a BakeParams {
        self.params
    }

    fn segment(&self, origin: Vector3<f32>, direction: &Vector3<f32>) -> Ray {
        Ray::from_two_points(origin, origin + direction.scale(self.ray_length))
    }

    /// Fraction of `light` visible from the point, in `[0; 1]`. Points facing away from the
    /// light are fully shadowed.
    pub fn compute_shadow(
        &self,
        position: &Vector3<f32>,
        normal: &Vector3<f32>,
        light: &Light,
        sampler: &mut Sampler,
    ) -> f32 {
        let Some(normal) = sanitize_normal(normal) else {
            return 0.0;
        };
        let Some((to_light, distance, _)) = light.incidence(position) else {
            return 0.0;
        };
        if normal.dot(&to_light) <= 0.0 {
            return 0.0;
        }
        if !light.cast_shadow {
            return 1.0;
        }

        let origin = position + normal.scale(self.params.shadow_bias);
        let (tangent, bitangent) = orthonormal_basis(&to_light);
        let sample_count = self.params.shadow_sample_count.max(1);
        let phi = sampler.next() * 2.0 * PI;

        let mut visible = 0u32;
        for i in 0..sample_count {
            let disk = sample_vogel_disk(i, sample_count, phi);
            let offset = tangent.scale(disk.x) + bitangent.scale(disk.y);
            let ray = if distance.is_finite() {
                // Point light: aim at a point of the light disk, stop right before it.
                let target =
                    position + to_light.scale(distance) + offset.scale(light.shadow_radius);
                let d = target - origin;
                let length = d.norm();
                if length <= self.params.shadow_bias {
                    visible += 1;
                    continue;
                }
                let end = origin + d.scale((length - self.params.shadow_bias) / length);
                Ray::from_two_points(origin, end)
            } else {
                let direction = (to_light + offset.scale(self.params.shadow_search_radius))
                    .try_normalize(f32::EPSILON)
                    .unwrap_or(to_light);
                self.segment(origin, &direction)
            };
            if !self.scene.index().any_hit(&ray) {
                visible += 1;
            }
        }

        visible as f32 / sample_count as f32
    }

    /// Direct light arriving at the point from every light of the scene.
    pub fn compute_direct(
        &self,
        position: &Vector3<f32>,
        normal: &Vector3<f32>,
        sampler: &mut Sampler,
    ) -> Vector3<f32> {
        let Some(normal) = sanitize_normal(normal) else {
            return Vector3::zeros();
        };
        let mut color = Vector3::zeros();
        for light in self.scene.lights() {
            let Some((to_light, _, attenuation)) = light.incidence(position) else {
                continue;
            };
            let n_dot_l = normal.dot(&to_light).max(0.0);
            let strength = n_dot_l * attenuation * light.intensity_factor(self.params);
            if strength <= 0.0 {
                continue;
            }
            let visibility = self.compute_shadow(position, &normal, light, sampler);
            color += light.color.scale(strength * visibility);
        }
        color
    }

    /// Traces a path starting at `origin` in `direction` and returns radiance arriving at the
    /// origin. At least one ray is traced, at most `lightBounceCount`.
    pub fn trace_path(
        &self,
        origin: Vector3<f32>,
        direction: Vector3<f32>,
        sampler: &mut Sampler,
    ) -> PathSample {
        let params = self.params;
        let mut radiance = Vector3::zeros();
        let mut throughput = Vector3::repeat(1.0f32);
        let mut first_roulette_depth = None;
        let mut ray_origin = origin;
        let mut direction = direction;
        let mut depth = 0;

        loop {
            depth += 1;

            let Some(hit) = self.scene.index().closest_hit(&self.segment(ray_origin, &direction))
            else {
                // Escaped rays see the sky.
                radiance += throughput.component_mul(&params.environment_color);
                break;
            };

            let surface = self.scene.surface(&hit, &ray_origin, &direction);
            let normal = if surface.normal.dot(&direction) > 0.0 {
                -surface.normal
            } else {
                surface.normal
            };
            let albedo = surface.material.albedo_at(surface.uv, params);
            let direct = self.compute_direct(&surface.position, &normal, sampler);

            radiance += throughput.component_mul(
                &(surface.material.emission_at(params) + albedo.component_mul(&direct)),
            );
            throughput.component_mul_assign(&albedo);

            if depth >= params.light_bounce_count.max(1) {
                break;
            }

            if depth >= params.russian_roulette_max_depth {
                first_roulette_depth.get_or_insert(depth);
                let probability = throughput.max().clamp(0.0, 1.0);
                if sampler.next() >= probability {
                    break;
                }
                throughput /= probability;
            }

            let (u1, u2) = sampler.next_2d();
            direction = tangent_to_world(&normal, &sample_cosine_weighted_hemisphere(u1, u2))
                .try_normalize(f32::EPSILON)
                .unwrap_or(normal);
            ray_origin = surface.position + normal.scale(params.shadow_bias);
        }

        PathSample {
            radiance,
            depth,
            first_roulette_depth,
        }
    }

    /// Indirect light: average radiance over `lightSampleCount` stratified cosine weighted
    /// paths. Zero when bouncing is disabled.
    pub fn compute_indirect(
        &self,
        position: &Vector3<f32>,
        normal: &Vector3<f32>,
        sampler: &mut Sampler,
    ) -> Vector3<f32> {
        let Some(normal) = sanitize_normal(normal) else {
            return Vector3::zeros();
        };
        if self.params.light_bounce_count == 0 || self.params.light_sample_count == 0 {
            return Vector3::zeros();
        }

        let sample_count = self.params.light_sample_count;
        let sqrt_sample_count = (sample_count as f32).sqrt().ceil() as u32;
        let origin = position + normal.scale(self.params.shadow_bias);

        let mut sum = Vector3::zeros();
        for index in 0..sample_count {
            let (u1, u2) = sampler.next_2d();
            let local =
                sample_stratified_cosine_weighted_hemisphere(index, sqrt_sample_count, u1, u2);
            let direction = tangent_to_world(&normal, &local)
                .try_normalize(f32::EPSILON)
                .unwrap_or(normal);
            sum += self.trace_path(origin, direction, sampler).radiance;
        }
        sum.scale(1.0 / sample_count as f32)
    }

    /// Total light at a surface point: direct + indirect + emission of its own material.
    pub fn compute_irradiance(
        &self,
        position: &Vector3<f32>,
        normal: &Vector3<f32>,
        material: Option<&Material>,
        sampler: &mut Sampler,
    ) -> Vector3<f32> {
        let emission = material
            .map(|m| m.emission_at(self.params))
            .unwrap_or_else(Vector3::zeros);
        if !is_finite(position) {
            return emission;
        }
        let Some(normal) = sanitize_normal(normal) else {
            return emission;
        };

        let color = self.compute_direct(position, &normal, sampler)
            + self.compute_indirect(position, &normal, sampler)
            + emission;
        color.map(|c| if c.is_finite() { c.max(0.0) } else { 0.0 })
    }

    /// Radiance arriving at `origin` from `direction`. Used for light field cells.
    pub fn compute_radiance(
        &self,
        origin: &Vector3<f32>,
        direction: &Vector3<f32>,
        sampler: &mut Sampler,
    ) -> Vector3<f32> {
        let Some(direction) = sanitize_normal(direction) else {
            return Vector3::zeros();
        };
        self.trace_path(*origin, direction, sampler)
            .radiance
            .map(|c| if c.is_finite() { c.max(0.0) } else { 0.0 })
    }

    /// Ambient occlusion factor in `[0; 1]`, 1 means fully unoccluded.
    pub fn compute_ao(
        &self,
        position: &Vector3<f32>,
        normal: &Vector3<f32>,
        sampler: &mut Sampler,
    ) -> f32 {
        let params = self.params;
        if params.ao_sample_count == 0 {
            return 1.0;
        }
        let Some(normal) = sanitize_normal(normal) else {
            return 1.0;
        };

        let origin = position + normal.scale(params.shadow_bias);
        let mut occlusion = 0.0;
        for _ in 0..params.ao_sample_count {
            let (u1, u2) = sampler.next_2d();
            let direction = tangent_to_world(&normal, &sample_direction_hemisphere(u1, u2));
            if let Some(hit) = self
                .scene
                .index()
                .closest_hit(&self.segment(origin, &direction))
            {
                let d = hit.distance;
                let fade = params.ao_fade_constant
                    + params.ao_fade_linear * d
                    + params.ao_fade_quadratic * d * d;
                if fade > 0.0 {
                    occlusion += (1.0 / fade).clamp(0.0, 1.0);
                } else {
                    occlusion += 1.0;
                }
            }
        }

        let ao = 1.0 - occlusion / params.ao_sample_count as f32;
        ao.clamp(0.0, 1.0).powf(params.ao_strength)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::scene::{Instance, Mesh, SceneInput, Vertex};
    use nalgebra::{Matrix4, Vector2};
    use std::sync::Arc;

    fn quad_mesh(size: f32, y: f32, albedo: f32, flip: bool) -> Mesh {
        let normal = if flip { -1.0 } else { 1.0 };
        let vertex = |x: f32, z: f32, u: f32, v: f32| Vertex {
            position: Vector3::new(x, y, z),
            normal: Vector3::new(0.0, normal, 0.0),
            uv: Vector2::new(u, v),
            lightmap_uv: Vector2::new(u, v),
        };
        let vertices = vec![
            vertex(-size, -size, 0.0, 0.0),
            vertex(size, -size, 1.0, 0.0),
            vertex(size, size, 1.0, 1.0),
            vertex(-size, size, 0.0, 1.0),
        ];
        let triangles = if flip {
            vec![[0, 1, 2], [0, 2, 3]]
        } else {
            vec![[0, 2, 1], [0, 3, 2]]
        };
        Mesh::new(
            vertices,
            triangles,
            Arc::new(Material::diffuse("m", Vector3::repeat(albedo))),
        )
        .unwrap()
    }

    fn floor_scene(lights: Vec<Light>) -> Scene {
        Scene::new(SceneInput {
            instances: vec![Instance::new(
                "floor",
                vec![quad_mesh(10.0, 0.0, 0.5, false)],
                Matrix4::identity(),
            )],
            lights,
            ..Default::default()
        })
    }

    /// Floor with a roof hovering above it.
    fn covered_scene() -> Scene {
        Scene::new(SceneInput {
            instances: vec![
                Instance::new("floor", vec![quad_mesh(10.0, 0.0, 0.5, false)], Matrix4::identity()),
                Instance::new("roof", vec![quad_mesh(1.0, 1.0, 0.5, true)], Matrix4::identity()),
            ],
            ..Default::default()
        })
    }

    fn black_params() -> BakeParams {
        BakeParams {
            environment_color: Vector3::zeros(),
            light_sample_count: 16,
            shadow_sample_count: 4,
            ..Default::default()
        }
    }

    #[test]
    fn no_lights_and_black_sky_give_zero() {
        let scene = covered_scene();
        let params = black_params();
        let integrator = Integrator::new(&scene, &params);
        let mut sampler = Sampler::with_seed(7);
        for x in [-5.0, 0.0, 0.3] {
            let irradiance = integrator.compute_irradiance(
                &Vector3::new(x, 0.0, 0.0),
                &Vector3::new(0.0, 1.0, 0.0),
                Some(&Material::default()),
                &mut sampler,
            );
            assert_eq!(irradiance, Vector3::zeros());
        }
    }

    #[test]
    fn degenerate_normal_does_not_produce_nan() {
        let scene = floor_scene(vec![Light::directional(
            "sun",
            Vector3::new(0.0, -1.0, 0.0),
            Vector3::repeat(1.0),
        )]);
        let params = BakeParams::default();
        let integrator = Integrator::new(&scene, &params);
        let mut sampler = Sampler::with_seed(1);
        let zero = Vector3::zeros();
        let nan = Vector3::repeat(f32::NAN);
        for normal in [zero, nan] {
            let c = integrator.compute_irradiance(&zero, &normal, None, &mut sampler);
            assert!(c.iter().all(|v| v.is_finite()));
            assert!(integrator.compute_ao(&zero, &normal, &mut sampler).is_finite());
            let light = &scene.lights()[0];
            assert_eq!(integrator.compute_shadow(&zero, &normal, light, &mut sampler), 0.0);
        }
    }

    #[test]
    fn direct_light_under_open_sky() {
        let color = Vector3::new(2.0, 1.0, 0.5);
        let scene = floor_scene(vec![Light::directional(
            "sun",
            Vector3::new(0.0, -1.0, 0.0),
            color,
        )]);
        let params = BakeParams {
            light_bounce_count: 0,
            shadow_sample_count: 1,
            ao_sample_count: 0,
            environment_color: Vector3::zeros(),
            light_strength: 0.5,
            ..Default::default()
        };
        let integrator = Integrator::new(&scene, &params);
        let mut sampler = Sampler::with_seed(3);
        let c = integrator.compute_irradiance(
            &Vector3::new(1.0, 0.0, 1.0),
            &Vector3::new(0.0, 1.0, 0.0),
            None,
            &mut sampler,
        );
        assert!((c - color.scale(0.5)).norm() < 1.0e-5);
    }

    #[test]
    fn roof_casts_shadow() {
        let scene = Scene::new(SceneInput {
            instances: covered_scene().instances().to_vec(),
            lights: vec![Light::directional(
                "sun",
                Vector3::new(0.0, -1.0, 0.0),
                Vector3::repeat(1.0),
            )],
            ..Default::default()
        });
        let params = black_params();
        let integrator = Integrator::new(&scene, &params);
        let mut sampler = Sampler::with_seed(3);
        let up = Vector3::new(0.0, 1.0, 0.0);
        let light = &scene.lights()[0];
        assert_eq!(integrator.compute_shadow(&Vector3::zeros(), &up, light, &mut sampler), 0.0);
        let open = Vector3::new(5.0, 0.0, 0.0);
        assert_eq!(integrator.compute_shadow(&open, &up, light, &mut sampler), 1.0);
        // Facing away from the light.
        assert_eq!(integrator.compute_shadow(&open, &-up, light, &mut sampler), 0.0);
    }

    #[test]
    fn sky_light_is_reduced_by_roof() {
        let scene = covered_scene();
        let params = BakeParams {
            environment_color: Vector3::repeat(1.0),
            light_bounce_count: 1,
            light_sample_count: 256,
            ..Default::default()
        };
        let integrator = Integrator::new(&scene, &params);
        let mut sampler = Sampler::with_seed(11);
        let up = Vector3::new(0.0, 1.0, 0.0);
        let open = integrator.compute_indirect(&Vector3::new(8.0, 0.0, 8.0), &up, &mut sampler);
        let covered = integrator.compute_indirect(&Vector3::zeros(), &up, &mut sampler);
        assert!((open.x - 1.0).abs() < 0.05);
        assert!(covered.x < 0.5);
    }

    #[test]
    fn variance_decreases_with_sample_count() {
        let scene = covered_scene();
        let variance = |sample_count: u32| {
            let params = BakeParams {
                environment_color: Vector3::repeat(1.0),
                light_bounce_count: 2,
                light_sample_count: sample_count,
                ..Default::default()
            };
            let integrator = Integrator::new(&scene, &params);
            let values = (0..32)
                .map(|seed| {
                    let mut sampler = Sampler::with_seed(seed);
                    integrator
                        .compute_indirect(
                            &Vector3::new(0.5, 0.0, 0.5),
                            &Vector3::new(0.0, 1.0, 0.0),
                            &mut sampler,
                        )
                        .x
                })
                .collect::<Vec<_>>();
            let mean = values.iter().sum::<f32>() / values.len() as f32;
            values.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / values.len() as f32
        };
        let low = variance(4);
        let high = variance(64);
        assert!(high < low, "variance {high} with 64 samples, {low} with 4");
    }

    #[test]
    fn russian_roulette_respects_depth_limits() {
        // Closed box of white walls, paths never escape.
        let scene = Scene::new(SceneInput {
            instances: vec![
                Instance::new(
                    "floor",
                    vec![quad_mesh(100.0, 0.0, 1.0, false)],
                    Matrix4::identity(),
                ),
                Instance::new(
                    "roof",
                    vec![quad_mesh(100.0, 0.01, 1.0, true)],
                    Matrix4::identity(),
                ),
            ],
            ..Default::default()
        });
        for (bounces, roulette) in [(8, 3), (5, 10), (12, 1)] {
            let params = BakeParams {
                environment_color: Vector3::zeros(),
                light_bounce_count: bounces,
                russian_roulette_max_depth: roulette,
                ..Default::default()
            };
            let integrator = Integrator::new(&scene, &params);
            let mut sampler = Sampler::with_seed(5);
            for _ in 0..200 {
                let (u1, u2) = sampler.next_2d();
                let direction = sample_cosine_weighted_hemisphere(u1, u2);
                let direction = Vector3::new(direction.x, direction.z, direction.y);
                let path =
                    integrator.trace_path(Vector3::new(0.0, 0.005, 0.0), direction, &mut sampler);
                assert!(path.depth <= bounces);
                if let Some(first) = path.first_roulette_depth {
                    assert!(first >= roulette);
                }
                if roulette >= bounces {
                    assert_eq!(path.first_roulette_depth, None);
                }
                // Albedo is one, so roulette never terminates and every path reaches the cap.
                assert_eq!(path.depth, bounces);
            }
        }
    }

    #[test]
    fn russian_roulette_terminates_grey_paths_without_bias() {
        // Glowing grey plates facing each other, every bounce hits an emitter.
        let glowing = |mut mesh: Mesh| {
            mesh.material = Arc::new(
                Material::diffuse("glow", Vector3::repeat(0.5)).with_emission(Vector3::repeat(1.0)),
            );
            mesh
        };
        let scene = Scene::new(SceneInput {
            instances: vec![
                Instance::new(
                    "floor",
                    vec![glowing(quad_mesh(100.0, 0.0, 0.5, false))],
                    Matrix4::identity(),
                ),
                Instance::new(
                    "roof",
                    vec![glowing(quad_mesh(100.0, 0.01, 0.5, true))],
                    Matrix4::identity(),
                ),
            ],
            ..Default::default()
        });

        let bounces = 8;
        let mean_radiance = |roulette: u32| {
            let params = BakeParams {
                environment_color: Vector3::zeros(),
                light_bounce_count: bounces,
                russian_roulette_max_depth: roulette,
                ..Default::default()
            };
            let integrator = Integrator::new(&scene, &params);
            let mut sampler = Sampler::with_seed(17);
            let path_count = 20000;
            let mut stopped_early = 0;
            let mut sum = 0.0;
            for _ in 0..path_count {
                let (u1, u2) = sampler.next_2d();
                let direction = sample_cosine_weighted_hemisphere(u1, u2);
                let direction = Vector3::new(direction.x, direction.z, direction.y);
                let path =
                    integrator.trace_path(Vector3::new(0.0, 0.005, 0.0), direction, &mut sampler);
                assert!(path.depth <= bounces);
                if path.depth < bounces {
                    // Only the roulette ends a path before the cap in a closed scene.
                    assert!(path.depth >= roulette);
                    stopped_early += 1;
                }
                sum += path.radiance.x;
            }
            (sum / path_count as f32, stopped_early)
        };

        // Without roulette every path is the same geometric series.
        let (reference, stopped_early) = mean_radiance(bounces);
        assert_eq!(stopped_early, 0);
        let expected = (1.0 - 0.5f32.powi(bounces as i32)) / (1.0 - 0.5);
        assert!((reference - expected).abs() < 1.0e-3, "{reference} vs {expected}");

        let (estimate, stopped_early) = mean_radiance(2);
        assert!(stopped_early > 0);
        assert!(
            (estimate - reference).abs() < 0.05 * reference,
            "roulette estimate {estimate}, reference {reference}"
        );
    }

    #[test]
    fn ao_fades_with_distance() {
        let scene = covered_scene();
        let params = BakeParams {
            ao_sample_count: 128,
            ao_fade_constant: 1.0,
            ao_fade_linear: 0.0,
            ao_fade_quadratic: 0.0,
            ..Default::default()
        };
        let integrator = Integrator::new(&scene, &params);
        let mut sampler = Sampler::with_seed(9);
        let up = Vector3::new(0.0, 1.0, 0.0);
        assert_eq!(integrator.compute_ao(&Vector3::new(8.0, 0.0, 8.0), &up, &mut sampler), 1.0);
        let covered = integrator.compute_ao(&Vector3::zeros(), &up, &mut sampler);
        assert!(covered < 0.8);

        let disabled = BakeParams {
            ao_sample_count: 0,
            ..Default::default()
        };
        let integrator = Integrator::new(&scene, &disabled);
        assert_eq!(integrator.compute_ao(&Vector3::zeros(), &up, &mut sampler), 1.0);
    }
}
