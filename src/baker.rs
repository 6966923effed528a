//! Per-entity bake work: light maps of instances and spherical harmonics light fields.

use crate::{
    bitmap::Bitmap,
    denoise::DenoiserRegistry,
    error::BakeError,
    integrator::Integrator,
    logger::Logger,
    params::BakeParams,
    postprocess,
    rasterizer::{rasterize, RasterizeOptions, TexelJob},
    sampler::{sample_sphere, with_thread_sampler},
    scene::{Instance, Scene, ShLightField},
    seam::SeamOptimizer,
};
use nalgebra::{Vector3, Vector4};
use rayon::prelude::*;
use std::f32::consts::PI;

/// Amount of spherical harmonics coefficients stored per cell (L2).
pub const SH_COEFFICIENT_COUNT: usize = 9;

/// Final maps of an instance. Both have identical dimensions.
#[derive(Clone, Debug, PartialEq)]
pub struct BakedInstance {
    /// Irradiance multiplied by ambient occlusion.
    pub light_map: Bitmap,
    /// Visibility of the main directional light, replicated into the color channels.
    pub shadow_map: Bitmap,
}

/// Real spherical harmonics basis up to band 2, evaluated for a unit direction.
pub fn sh_basis(direction: &Vector3<f32>) -> [f32; SH_COEFFICIENT_COUNT] {
    let (x, y, z) = (direction.x, direction.y, direction.z);
    [
        0.282095,
        0.488603 * y,
        0.488603 * z,
        0.488603 * x,
        1.092548 * x * y,
        1.092548 * y * z,
        0.315392 * (3.0 * z * z - 1.0),
        1.092548 * x * z,
        0.546274 * (x * x - y * y),
    ]
}

/// Per-entity baking with shared, read-only inputs.
pub struct Baker<'a> {
    scene: &'a Scene,
    params: &'a BakeParams,
    denoisers: &'a DenoiserRegistry,
    logger: &'a Logger,
}

impl<'a> Baker<'a> {
    pub fn new(
        scene: &'a Scene,
        params: &'a BakeParams,
        denoisers: &'a DenoiserRegistry,
        logger: &'a Logger,
    ) -> Self {
        Self {
            scene,
            params,
            denoisers,
            logger,
        }
    }

    /// Light map size of an instance. An explicit override (per instance first, then global)
    /// is used as is, otherwise the size grows with the world space surface area:
    /// `base ^ (log2(sqrt(area)) + bias)` rounded up to a power of two and clamped to
    /// `[minimum; maximum]`.
    pub fn resolution(instance: &Instance, params: &BakeParams) -> u32 {
        if let Some(resolution) = instance
            .resolution_override
            .filter(|r| *r > 0)
            .or_else(|| params.resolution_override())
        {
            return resolution as u32;
        }

        let minimum = (params.resolution_minimum as u32).max(1);
        let maximum = (params.resolution_maximum as u32).max(minimum);

        let area = instance.world_area();
        if !(area > 0.0) || !area.is_finite() {
            return minimum;
        }
        let exponent = area.sqrt().log2() + params.resolution_bias;
        let size = params.resolution_base.powf(exponent);
        if !size.is_finite() {
            return if size > 0.0 { maximum } else { minimum };
        }
        // Tolerate rounding noise of `powf`, exact powers of two must not double.
        let size = ((size * (1.0 - 1.0e-4)).ceil().clamp(1.0, maximum as f32) as u32)
            .next_power_of_two();
        size.clamp(minimum, maximum)
    }

    /// Bakes light and shadow maps of the instance at `index`.
    pub fn bake_instance(&self, index: usize) -> Result<BakedInstance, BakeError> {
        let instance = &self.scene.instances()[index];
        let params = self.params;
        let size = Self::resolution(instance, params);
        let pages = instance.page_count();

        self.logger.info(format_args!(
            "Baking instance {} ({}x{}, {} page(s))",
            instance.name, size, size, pages
        ));

        let mut light_map = Bitmap::new(size, size, pages);
        let mut shadow_map = Bitmap::new(size, size, pages);

        // First mesh covering a texel owns it.
        let mut jobs: Vec<Option<(TexelJob, usize)>> = vec![None; light_map.data().len()];
        let options = RasterizeOptions {
            smooth_position: params.smooth_position,
        };
        for (mesh_index, mesh) in instance.meshes.iter().enumerate() {
            for job in rasterize(mesh, size, size, options) {
                let slot = &mut jobs[light_map.index(job.x, job.y, job.slice)?];
                if slot.is_none() {
                    *slot = Some((job, mesh_index));
                }
            }
        }

        let shadow_light = self
            .scene
            .lights()
            .iter()
            .find(|light| light.is_directional() && light.cast_shadow);

        let integrator = Integrator::new(self.scene, params);
        light_map
            .data_mut()
            .par_iter_mut()
            .zip(shadow_map.data_mut().par_iter_mut())
            .zip(jobs.par_iter())
            .for_each(|((light, shadow), job)| {
                let Some((job, mesh_index)) = job else {
                    return;
                };
                with_thread_sampler(|sampler| {
                    let material = &instance.meshes[*mesh_index].material;
                    let irradiance = integrator.compute_irradiance(
                        &job.position,
                        &job.normal,
                        Some(material.as_ref()),
                        sampler,
                    );
                    let ao = integrator.compute_ao(&job.position, &job.normal, sampler);
                    let color = irradiance.scale(ao);
                    *light = Vector4::new(color.x, color.y, color.z, 1.0);

                    let visibility = shadow_light
                        .map(|l| integrator.compute_shadow(&job.position, &job.normal, l, sampler))
                        .unwrap_or(1.0);
                    *shadow = Vector4::new(visibility, visibility, visibility, 1.0);
                });
            });

        if params.optimize_seams {
            let mut changed = 0;
            for mesh in instance.meshes.iter() {
                let optimizer = SeamOptimizer::new(mesh, size, size);
                changed += optimizer.optimize(&mut light_map);
                optimizer.optimize(&mut shadow_map);
            }
            self.logger
                .debug(format_args!("{} seam texels optimized", changed));
        }

        postprocess::dilate(&mut light_map)?;
        postprocess::dilate(&mut shadow_map)?;

        let light_map = postprocess::denoise(
            &light_map,
            self.denoisers,
            params.denoiser_type,
            false,
            self.logger,
        );
        let shadow_map = if params.denoise_shadow_map {
            postprocess::denoise(
                &shadow_map,
                self.denoisers,
                params.denoiser_type,
                false,
                self.logger,
            )
        } else {
            shadow_map
        };

        Ok(BakedInstance {
            light_map,
            shadow_map,
        })
    }

    /// Moves a cell centre lying right behind a surface to its front side.
    fn push_out_of_geometry(&self, position: Vector3<f32>, cell_radius: f32) -> Vector3<f32> {
        let Some(surface) = self.scene.index().closest_point_on_surface(&position) else {
            return position;
        };
        if surface.distance > cell_radius {
            return position;
        }
        let normal = surface.geometric_normal;
        if (position - surface.position).dot(&normal) >= 0.0 {
            return position;
        }
        surface.position + normal.scale(self.params.shadow_bias.max(1.0e-4) * 10.0)
    }

    /// Bakes the light field at `index`. Every cell stores 9 coefficients in consecutive
    /// texels of a row: width is `res.x * 9`, height is `res.y`, array size is `res.z`.
    pub fn bake_light_field(&self, index: usize) -> Result<Bitmap, BakeError> {
        let light_field: &ShLightField = &self.scene.light_fields()[index];
        let resolution = light_field.cell_resolution(self.params);
        let [rx, ry, rz] = resolution;

        self.logger.info(format_args!(
            "Baking light field {} ({}x{}x{} cells)",
            light_field.name, rx, ry, rz
        ));

        let cell_radius = Vector3::new(
            light_field.scale.x / rx as f32,
            light_field.scale.y / ry as f32,
            light_field.scale.z / rz as f32,
        )
        .norm()
            * 0.5;

        let sample_count = self.params.light_sample_count.max(1);
        let integrator = Integrator::new(self.scene, self.params);

        let cells = (0..rx as usize * ry as usize * rz as usize)
            .into_par_iter()
            .map(|i| {
                let x = (i % rx as usize) as u32;
                let y = (i / rx as usize % ry as usize) as u32;
                let z = (i / (rx as usize * ry as usize)) as u32;
                let position = self.push_out_of_geometry(
                    light_field.cell_position(resolution, x, y, z),
                    cell_radius,
                );

                with_thread_sampler(|sampler| {
                    let mut coefficients = [Vector3::<f32>::zeros(); SH_COEFFICIENT_COUNT];
                    for s in 0..sample_count {
                        let direction = sample_sphere(s, sample_count);
                        let radiance = integrator.compute_radiance(&position, &direction, sampler);
                        for (c, basis) in coefficients.iter_mut().zip(sh_basis(&direction)) {
                            *c += radiance.scale(basis);
                        }
                    }
                    let weight = 4.0 * PI / sample_count as f32;
                    coefficients.map(|c| c.scale(weight))
                })
            })
            .collect::<Vec<_>>();

        let mut bitmap = Bitmap::new(rx * SH_COEFFICIENT_COUNT as u32, ry, rz);
        for (i, coefficients) in cells.iter().enumerate() {
            let x = (i % rx as usize) as u32;
            let y = (i / rx as usize % ry as usize) as u32;
            let z = (i / (rx as usize * ry as usize)) as u32;
            for (k, c) in coefficients.iter().enumerate() {
                bitmap.set(
                    x * SH_COEFFICIENT_COUNT as u32 + k as u32,
                    y,
                    z,
                    Vector4::new(c.x, c.y, c.z, 1.0),
                )?;
            }
        }
        Ok(bitmap)
    }

    /// Light arriving at every placement of the meta instancer at `index`, sampled with an
    /// upwards facing normal.
    pub fn bake_meta_instancer(&self, index: usize) -> Vec<Vector3<f32>> {
        let instancer = &self.scene.meta_instancers()[index];
        let integrator = Integrator::new(self.scene, self.params);
        let up = Vector3::new(0.0, 1.0, 0.0);
        instancer
            .positions
            .par_iter()
            .map(|position| {
                with_thread_sampler(|sampler| {
                    integrator.compute_irradiance(position, &up, None, sampler)
                })
            })
            .collect()
    }
}
