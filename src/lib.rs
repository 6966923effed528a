//! Crate to bake global illumination of stage geometry.
//!
//! Given a [`Scene`](scene::Scene) of instanced meshes, materials and lights, the baker path
//! traces irradiance for every light map texel (direct light with soft shadows, indirect
//! bounces, ambient occlusion), blends texels across UV seams, fills holes, denoises and packs
//! the results. Spherical harmonics light field volumes are baked the same way.
//!
//! # Performance
//!
//! This is CPU baker, its performance is linear with core count of your CPU. Texels of an
//! instance are shaded in parallel on the rayon thread pool.
//!
//! # Usage
//!
//! ```no_run
//! use gi_baker::{params::BakeParams, scene::{Scene, SceneInput}, service::BakeService};
//! use std::sync::Arc;
//!
//! let scene = Scene::new(SceneInput::default());
//! let service = Arc::new(BakeService::new(Arc::new(scene), Arc::new(BakeParams::default())));
//! let task = service.spawn(service.params().target).unwrap();
//! task.join().unwrap();
//! ```

#![forbid(unsafe_code)]

pub use fyrox_math as math;

pub mod baker;
pub mod bitmap;
pub mod denoise;
pub mod error;
pub mod integrator;
pub mod light;
pub mod logger;
pub mod pack;
pub mod params;
pub mod postprocess;
pub mod progress;
pub mod property_bag;
pub mod rasterizer;
pub mod raytracer;
pub mod sampler;
pub mod scene;
pub mod seam;
pub mod service;

pub use crate::{
    baker::{BakedInstance, Baker},
    bitmap::Bitmap,
    error::{BakeError, DenoiseError, PreconditionError},
    params::{BakeParams, BakeTarget},
    progress::{BakeProgress, BakeState, CancellationToken},
    service::{BakeService, BakeTask},
};
