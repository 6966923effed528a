use crate::params::BakeParams;
use nalgebra::Vector3;

/// Shape of a light source.
#[derive(Clone, Debug, PartialEq)]
pub enum LightKind {
    /// Directional light is a light source with parallel rays. Example: Sun.
    Directional {
        /// Direction the light rays travel in (from the light towards the scene), normalized.
        direction: Vector3<f32>,
    },
    /// Point light is a spherical light source. Example: light bulb.
    Point {
        /// Position of light in world coordinates.
        position: Vector3<f32>,
        /// Distance up to which light is not attenuated.
        inner_range: f32,
        /// Distance at which light intensity decays to zero.
        outer_range: f32,
    },
}

/// Light definition for baking. Immutable once loaded.
#[derive(Clone, Debug, PartialEq)]
pub struct Light {
    pub name: String,
    pub kind: LightKind,
    /// Linear color, unclamped. Values above 1.0 encode intensity.
    pub color: Vector3<f32>,
    /// Whether the light is occluded by scene geometry.
    pub cast_shadow: bool,
    /// Radius of the disk sampled for soft shadows of point lights.
    pub shadow_radius: f32,
}

impl Light {
    pub fn directional(
        name: impl Into<String>,
        direction: Vector3<f32>,
        color: Vector3<f32>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: LightKind::Directional {
                direction: direction
                    .try_normalize(f32::EPSILON)
                    .unwrap_or_else(|| Vector3::new(0.0, -1.0, 0.0)),
            },
            color,
            cast_shadow: true,
            shadow_radius: 0.0,
        }
    }

    pub fn point(
        name: impl Into<String>,
        position: Vector3<f32>,
        color: Vector3<f32>,
        inner_range: f32,
        outer_range: f32,
    ) -> Self {
        Self {
            name: name.into(),
            kind: LightKind::Point {
                position,
                inner_range: inner_range.max(0.0),
                outer_range: outer_range.max(inner_range.max(0.0)),
            },
            color,
            cast_shadow: true,
            shadow_radius: 0.0,
        }
    }

    pub fn with_shadow(mut self, cast_shadow: bool, shadow_radius: f32) -> Self {
        self.cast_shadow = cast_shadow;
        self.shadow_radius = shadow_radius.max(0.0);
        self
    }

    pub fn is_directional(&self) -> bool {
        matches!(self.kind, LightKind::Directional { .. })
    }

    /// Scale applied to the light color when it is integrated.
    pub fn intensity_factor(&self, params: &BakeParams) -> f32 {
        params.light_strength
    }

    /// Splits unbounded color into a normalized color and its intensity, so that
    /// `color == normalized * intensity`.
    pub fn normalized(&self) -> (Vector3<f32>, f32) {
        let intensity = self.color.max();
        if intensity > 1.0 {
            (self.color.scale(1.0 / intensity), intensity)
        } else {
            (self.color, 1.0)
        }
    }

    /// Returns unit vector from `point` towards the light, distance to the light and
    /// distance attenuation.
    pub fn incidence(&self, point: &Vector3<f32>) -> Option<(Vector3<f32>, f32, f32)> {
        match self.kind {
            LightKind::Directional { direction } => Some((-direction, f32::INFINITY, 1.0)),
            LightKind::Point {
                position,
                inner_range,
                outer_range,
            } => {
                let d = position - point;
                let distance = d.norm();
                if distance <= f32::EPSILON {
                    return None;
                }
                let range = outer_range - inner_range;
                let attenuation = if range <= f32::EPSILON {
                    if distance <= outer_range {
                        1.0
                    } else {
                        0.0
                    }
                } else {
                    distance_attenuation((distance - inner_range).max(0.0), range * range)
                };
                Some((d.scale(1.0 / distance), distance, attenuation))
            }
        }
    }
}

/// Calculates distance attenuation for a point using given distance to the point and
/// squared radius of a light.
pub fn distance_attenuation(distance: f32, sqr_radius: f32) -> f32 {
    let attenuation = (1.0 - distance * distance / sqr_radius).clamp(0.0, 1.0);
    attenuation * attenuation
}
