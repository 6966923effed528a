//! Bake configuration.
//!
//! Parameters are loaded before a bake starts and are never mutated while it runs, every worker
//! thread reads the same immutable snapshot.
//!
//! Two sources are supported: a human-editable TOML file with one key per option and the
//! binary [`PropertyBag`]. Malformed input never aborts loading, each bad or missing option
//! falls back to its default.

use crate::{denoise::DenoiserType, property_bag::PropertyBag};
use log::warn;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::path::Path;
use toml::{value::Table, Value};

/// What kind of entities a bake iterates over.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BakeTarget {
    /// Surface light maps of every instance.
    #[default]
    GlobalIllumination,
    /// Spherical harmonics light field volumes.
    LightField,
}

impl BakeTarget {
    fn index(self) -> i64 {
        match self {
            Self::GlobalIllumination => 0,
            Self::LightField => 1,
        }
    }

    fn from_index(index: i64) -> Option<Self> {
        match index {
            0 => Some(Self::GlobalIllumination),
            1 => Some(Self::LightField),
            _ => None,
        }
    }
}

/// Converts 0..255 environment color components into linear color.
fn environment_component(value: f32) -> f32 {
    (value / 255.0).max(0.0).powf(2.2)
}

fn environment_component_to_config(value: f32) -> f32 {
    value.max(0.0).powf(1.0 / 2.2) * 255.0
}

#[derive(Clone, Debug, PartialEq)]
pub struct BakeParams {
    pub target: BakeTarget,

    /// Linear color of rays escaping the scene.
    pub environment_color: Vector3<f32>,

    pub light_bounce_count: u32,
    pub light_sample_count: u32,
    pub russian_roulette_max_depth: u32,

    pub shadow_sample_count: u32,
    pub shadow_search_radius: f32,
    pub shadow_bias: f32,

    pub ao_sample_count: u32,
    pub ao_fade_constant: f32,
    pub ao_fade_linear: f32,
    pub ao_fade_quadratic: f32,
    pub ao_strength: f32,

    pub diffuse_strength: f32,
    pub diffuse_saturation: f32,
    pub light_strength: f32,
    pub emission_strength: f32,

    pub resolution_base: f32,
    pub resolution_bias: f32,
    /// Negative value means "no override".
    pub resolution_override: i16,
    pub resolution_minimum: u16,
    pub resolution_maximum: u16,

    pub denoise_shadow_map: bool,
    pub optimize_seams: bool,
    pub smooth_position: bool,
    pub denoiser_type: DenoiserType,

    pub light_field_min_cell_radius: f32,
    pub light_field_aabb_size_multiplier: f32,
}

impl Default for BakeParams {
    fn default() -> Self {
        Self {
            target: BakeTarget::GlobalIllumination,
            environment_color: Vector3::repeat(environment_component(255.0)),
            light_bounce_count: 10,
            light_sample_count: 32,
            russian_roulette_max_depth: 4,
            shadow_sample_count: 64,
            shadow_search_radius: 0.01,
            shadow_bias: 0.001,
            ao_sample_count: 64,
            ao_fade_constant: 1.0,
            ao_fade_linear: 0.01,
            ao_fade_quadratic: 0.01,
            ao_strength: 1.0,
            diffuse_strength: 1.0,
            diffuse_saturation: 1.0,
            light_strength: 1.0,
            emission_strength: 1.0,
            resolution_base: 2.0,
            resolution_bias: 3.0,
            resolution_override: -1,
            resolution_minimum: 16,
            resolution_maximum: 2048,
            denoise_shadow_map: true,
            optimize_seams: true,
            smooth_position: true,
            denoiser_type: DenoiserType::Optix,
            light_field_min_cell_radius: 5.0,
            light_field_aabb_size_multiplier: 1.0,
        }
    }
}

/// Per-key reader which logs and falls back to defaults on bad input.
struct ConfigReader<'a> {
    table: &'a Table,
}

impl<'a> ConfigReader<'a> {
    fn value(&self, key: &str) -> Option<&'a Value> {
        self.table.get(key)
    }

    fn bad(key: &str, value: &Value) {
        warn!("Invalid value {value} of config option {key}, using default.");
    }

    fn f32(&self, key: &str, default: f32) -> f32 {
        match self.value(key) {
            None => default,
            Some(Value::Float(v)) => *v as f32,
            Some(Value::Integer(v)) => *v as f32,
            Some(v) => {
                Self::bad(key, v);
                default
            }
        }
    }

    fn integer<T: TryFrom<i64>>(&self, key: &str, default: T) -> T {
        match self.value(key) {
            None => default,
            Some(Value::Integer(v)) => match T::try_from(*v) {
                Ok(v) => v,
                Err(_) => {
                    Self::bad(key, &Value::Integer(*v));
                    default
                }
            },
            Some(v) => {
                Self::bad(key, v);
                default
            }
        }
    }

    fn bool(&self, key: &str, default: bool) -> bool {
        match self.value(key) {
            None => default,
            Some(Value::Boolean(v)) => *v,
            Some(Value::Integer(v)) => *v != 0,
            Some(v) => {
                Self::bad(key, v);
                default
            }
        }
    }

    fn denoiser(&self, key: &str, default: DenoiserType) -> DenoiserType {
        match self.value(key) {
            None => default,
            Some(Value::Integer(v)) => DenoiserType::from_index(*v).unwrap_or_else(|| {
                Self::bad(key, &Value::Integer(*v));
                default
            }),
            Some(Value::String(name)) => DenoiserType::from_name(name)
                .or_else(|| Value::String(name.clone()).try_into::<DenoiserType>().ok())
                .unwrap_or_else(|| {
                    Self::bad(key, &Value::String(name.clone()));
                    default
                }),
            Some(v) => {
                Self::bad(key, v);
                default
            }
        }
    }

    fn target(&self, key: &str, default: BakeTarget) -> BakeTarget {
        match self.value(key) {
            None => default,
            Some(v) => v.clone().try_into::<BakeTarget>().unwrap_or_else(|_| {
                Self::bad(key, v);
                default
            }),
        }
    }

    fn environment_color(&self, key: &str, default: Vector3<f32>) -> Vector3<f32> {
        match self.value(key) {
            None => default,
            Some(Value::Table(components)) => {
                let reader = ConfigReader { table: components };
                let component = |name: &str, default: f32| {
                    environment_component(
                        reader.f32(name, environment_component_to_config(default)),
                    )
                };
                Vector3::new(
                    component("R", default.x),
                    component("G", default.y),
                    component("B", default.z),
                )
            }
            Some(v) => {
                Self::bad(key, v);
                default
            }
        }
    }
}

impl BakeParams {
    /// Reads parameters from TOML text. Never fails, see module docs.
    pub fn from_toml_str(text: &str) -> Self {
        let defaults = Self::default();
        let root = match text.parse::<Value>() {
            Ok(Value::Table(table)) => table,
            Ok(_) => Table::new(),
            Err(err) => {
                warn!("Unable to parse bake config: {err}. Using defaults.");
                return defaults;
            }
        };

        let r = ConfigReader { table: &root };
        Self {
            target: r.target("target", defaults.target),
            environment_color: r.environment_color("environmentColor", defaults.environment_color),
            light_bounce_count: r.integer("lightBounceCount", defaults.light_bounce_count),
            light_sample_count: r.integer("lightSampleCount", defaults.light_sample_count),
            russian_roulette_max_depth: r.integer(
                "russianRouletteMaxDepth",
                defaults.russian_roulette_max_depth,
            ),
            shadow_sample_count: r.integer("shadowSampleCount", defaults.shadow_sample_count),
            shadow_search_radius: r.f32("shadowSearchRadius", defaults.shadow_search_radius),
            shadow_bias: r.f32("shadowBias", defaults.shadow_bias),
            ao_sample_count: r.integer("aoSampleCount", defaults.ao_sample_count),
            ao_fade_constant: r.f32("aoFadeConstant", defaults.ao_fade_constant),
            ao_fade_linear: r.f32("aoFadeLinear", defaults.ao_fade_linear),
            ao_fade_quadratic: r.f32("aoFadeQuadratic", defaults.ao_fade_quadratic),
            ao_strength: r.f32("aoStrength", defaults.ao_strength),
            diffuse_strength: r.f32("diffuseStrength", defaults.diffuse_strength),
            diffuse_saturation: r.f32("diffuseSaturation", defaults.diffuse_saturation),
            light_strength: r.f32("lightStrength", defaults.light_strength),
            emission_strength: r.f32("emissionStrength", defaults.emission_strength),
            resolution_base: r.f32("resolutionBase", defaults.resolution_base),
            resolution_bias: r.f32("resolutionBias", defaults.resolution_bias),
            resolution_override: r.integer("resolutionOverride", defaults.resolution_override),
            resolution_minimum: r.integer("resolutionMinimum", defaults.resolution_minimum),
            resolution_maximum: r.integer("resolutionMaximum", defaults.resolution_maximum),
            denoise_shadow_map: r.bool("denoiseShadowMap", defaults.denoise_shadow_map),
            optimize_seams: r.bool("optimizeSeams", defaults.optimize_seams),
            smooth_position: r.bool("smoothPosition", defaults.smooth_position),
            denoiser_type: r.denoiser("denoiserType", defaults.denoiser_type),
            light_field_min_cell_radius: r.f32(
                "lightFieldMinCellRadius",
                defaults.light_field_min_cell_radius,
            ),
            light_field_aabb_size_multiplier: r.f32(
                "lightFieldAabbSizeMultiplier",
                defaults.light_field_aabb_size_multiplier,
            ),
        }
    }

    /// Reads parameters from a TOML file. A missing or unreadable file yields defaults.
    pub fn load(path: impl AsRef<Path>) -> Self {
        match std::fs::read_to_string(path.as_ref()) {
            Ok(text) => Self::from_toml_str(&text),
            Err(err) => {
                warn!(
                    "Unable to read bake config {}: {err}. Using defaults.",
                    path.as_ref().display()
                );
                Self::default()
            }
        }
    }

    /// Writes parameters in the format understood by [`Self::from_toml_str`].
    pub fn to_toml_string(&self) -> String {
        let mut table = Table::new();
        let mut put = |key: &str, value: Value| {
            table.insert(key.to_string(), value);
        };
        let mut color = Table::new();
        color.insert(
            "R".into(),
            Value::Float(environment_component_to_config(self.environment_color.x) as f64),
        );
        color.insert(
            "G".into(),
            Value::Float(environment_component_to_config(self.environment_color.y) as f64),
        );
        color.insert(
            "B".into(),
            Value::Float(environment_component_to_config(self.environment_color.z) as f64),
        );
        put("target", Value::String(format!("{:?}", self.target)));
        put("environmentColor", Value::Table(color));
        put("lightBounceCount", Value::Integer(self.light_bounce_count as i64));
        put("lightSampleCount", Value::Integer(self.light_sample_count as i64));
        put(
            "russianRouletteMaxDepth",
            Value::Integer(self.russian_roulette_max_depth as i64),
        );
        put("shadowSampleCount", Value::Integer(self.shadow_sample_count as i64));
        put("shadowSearchRadius", Value::Float(self.shadow_search_radius as f64));
        put("shadowBias", Value::Float(self.shadow_bias as f64));
        put("aoSampleCount", Value::Integer(self.ao_sample_count as i64));
        put("aoFadeConstant", Value::Float(self.ao_fade_constant as f64));
        put("aoFadeLinear", Value::Float(self.ao_fade_linear as f64));
        put("aoFadeQuadratic", Value::Float(self.ao_fade_quadratic as f64));
        put("aoStrength", Value::Float(self.ao_strength as f64));
        put("diffuseStrength", Value::Float(self.diffuse_strength as f64));
        put("diffuseSaturation", Value::Float(self.diffuse_saturation as f64));
        put("lightStrength", Value::Float(self.light_strength as f64));
        put("emissionStrength", Value::Float(self.emission_strength as f64));
        put("resolutionBase", Value::Float(self.resolution_base as f64));
        put("resolutionBias", Value::Float(self.resolution_bias as f64));
        put("resolutionOverride", Value::Integer(self.resolution_override as i64));
        put("resolutionMinimum", Value::Integer(self.resolution_minimum as i64));
        put("resolutionMaximum", Value::Integer(self.resolution_maximum as i64));
        put("denoiseShadowMap", Value::Boolean(self.denoise_shadow_map));
        put("optimizeSeams", Value::Boolean(self.optimize_seams));
        put("smoothPosition", Value::Boolean(self.smooth_position));
        put("denoiserType", Value::String(format!("{:?}", self.denoiser_type)));
        put(
            "lightFieldMinCellRadius",
            Value::Float(self.light_field_min_cell_radius as f64),
        );
        put(
            "lightFieldAabbSizeMultiplier",
            Value::Float(self.light_field_aabb_size_multiplier as f64),
        );
        Value::Table(table).to_string()
    }

    /// Reads parameters stored under `bakeParams.*` keys, missing keys keep their defaults.
    pub fn load_from_bag(bag: &PropertyBag) -> Self {
        let d = Self::default();
        let key = |name: &str| format!("bakeParams.{name}");
        Self {
            target: bag
                .get::<i64>(&key("target"))
                .and_then(BakeTarget::from_index)
                .unwrap_or(d.target),
            environment_color: Vector3::new(
                bag.get_or(&key("environmentColor.r"), d.environment_color.x),
                bag.get_or(&key("environmentColor.g"), d.environment_color.y),
                bag.get_or(&key("environmentColor.b"), d.environment_color.z),
            ),
            light_bounce_count: bag.get_or(&key("lightBounceCount"), d.light_bounce_count),
            light_sample_count: bag.get_or(&key("lightSampleCount"), d.light_sample_count),
            russian_roulette_max_depth: bag.get_or(
                &key("russianRouletteMaxDepth"),
                d.russian_roulette_max_depth,
            ),
            shadow_sample_count: bag.get_or(&key("shadowSampleCount"), d.shadow_sample_count),
            shadow_search_radius: bag.get_or(&key("shadowSearchRadius"), d.shadow_search_radius),
            shadow_bias: bag.get_or(&key("shadowBias"), d.shadow_bias),
            ao_sample_count: bag.get_or(&key("aoSampleCount"), d.ao_sample_count),
            ao_fade_constant: bag.get_or(&key("aoFadeConstant"), d.ao_fade_constant),
            ao_fade_linear: bag.get_or(&key("aoFadeLinear"), d.ao_fade_linear),
            ao_fade_quadratic: bag.get_or(&key("aoFadeQuadratic"), d.ao_fade_quadratic),
            ao_strength: bag.get_or(&key("aoStrength"), d.ao_strength),
            diffuse_strength: bag.get_or(&key("diffuseStrength"), d.diffuse_strength),
            diffuse_saturation: bag.get_or(&key("diffuseSaturation"), d.diffuse_saturation),
            light_strength: bag.get_or(&key("lightStrength"), d.light_strength),
            emission_strength: bag.get_or(&key("emissionStrength"), d.emission_strength),
            resolution_base: bag.get_or(&key("resolutionBase"), d.resolution_base),
            resolution_bias: bag.get_or(&key("resolutionBias"), d.resolution_bias),
            resolution_override: bag.get_or(&key("resolutionOverride"), d.resolution_override),
            resolution_minimum: bag.get_or(&key("resolutionMinimum"), d.resolution_minimum),
            resolution_maximum: bag.get_or(&key("resolutionMaximum"), d.resolution_maximum),
            denoise_shadow_map: bag.get_or(&key("denoiseShadowMap"), d.denoise_shadow_map),
            optimize_seams: bag.get_or(&key("optimizeSeams"), d.optimize_seams),
            smooth_position: bag.get_or(&key("smoothPosition"), d.smooth_position),
            denoiser_type: bag
                .get::<i64>(&key("denoiserType"))
                .and_then(DenoiserType::from_index)
                .unwrap_or(d.denoiser_type),
            light_field_min_cell_radius: bag.get_or(
                &key("lightFieldMinCellRadius"),
                d.light_field_min_cell_radius,
            ),
            light_field_aabb_size_multiplier: bag.get_or(
                &key("lightFieldAabbSizeMultiplier"),
                d.light_field_aabb_size_multiplier,
            ),
        }
    }

    pub fn store_to_bag(&self, bag: &mut PropertyBag) {
        let key = |name: &str| format!("bakeParams.{name}");
        bag.set(&key("target"), self.target.index());
        bag.set(&key("environmentColor.r"), self.environment_color.x);
        bag.set(&key("environmentColor.g"), self.environment_color.y);
        bag.set(&key("environmentColor.b"), self.environment_color.z);
        bag.set(&key("lightBounceCount"), self.light_bounce_count);
        bag.set(&key("lightSampleCount"), self.light_sample_count);
        bag.set(&key("russianRouletteMaxDepth"), self.russian_roulette_max_depth);
        bag.set(&key("shadowSampleCount"), self.shadow_sample_count);
        bag.set(&key("shadowSearchRadius"), self.shadow_search_radius);
        bag.set(&key("shadowBias"), self.shadow_bias);
        bag.set(&key("aoSampleCount"), self.ao_sample_count);
        bag.set(&key("aoFadeConstant"), self.ao_fade_constant);
        bag.set(&key("aoFadeLinear"), self.ao_fade_linear);
        bag.set(&key("aoFadeQuadratic"), self.ao_fade_quadratic);
        bag.set(&key("aoStrength"), self.ao_strength);
        bag.set(&key("diffuseStrength"), self.diffuse_strength);
        bag.set(&key("diffuseSaturation"), self.diffuse_saturation);
        bag.set(&key("lightStrength"), self.light_strength);
        bag.set(&key("emissionStrength"), self.emission_strength);
        bag.set(&key("resolutionBase"), self.resolution_base);
        bag.set(&key("resolutionBias"), self.resolution_bias);
        bag.set(&key("resolutionOverride"), self.resolution_override);
        bag.set(&key("resolutionMinimum"), self.resolution_minimum);
        bag.set(&key("resolutionMaximum"), self.resolution_maximum);
        bag.set(&key("denoiseShadowMap"), self.denoise_shadow_map);
        bag.set(&key("optimizeSeams"), self.optimize_seams);
        bag.set(&key("smoothPosition"), self.smooth_position);
        bag.set(&key("denoiserType"), self.denoiser_type.index());
        bag.set(&key("lightFieldMinCellRadius"), self.light_field_min_cell_radius);
        bag.set(
            &key("lightFieldAabbSizeMultiplier"),
            self.light_field_aabb_size_multiplier,
        );
    }

    /// Explicit resolution override, if any.
    pub fn resolution_override(&self) -> Option<u16> {
        u16::try_from(self.resolution_override)
            .ok()
            .filter(|r| *r > 0)
    }
}
