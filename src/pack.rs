//! Packing of bake results into files.
//!
//! Every resource kind has its own mode, [`PackService::pack`] writes all of them. Files go to
//! an [`ArchiveWriter`], either a directory on disk or memory.

use crate::{
    baker::Baker,
    bitmap::Bitmap,
    denoise::DenoiserRegistry,
    error::{BakeError, PreconditionError},
    light::LightKind,
    logger::Logger,
    params::BakeParams,
    postprocess::{self, EncodeReadyFlags},
    scene::Scene,
    service::BakeResults,
};
use fxhash::FxHashMap;
use image::{ImageFormat, RgbaImage};
use nalgebra::Vector4;
use std::{
    fmt::Write as _,
    fs,
    io::Cursor,
    path::{Path, PathBuf},
    sync::Arc,
};

/// Kind of resources to pack.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PackMode {
    /// Light maps with shadow in alpha, plus light definitions.
    Light,
    /// Spherical harmonics light fields.
    LightField,
    /// Per-placement lighting of meta instancers.
    MetaInstancer,
}

impl PackMode {
    pub const ALL: [PackMode; 3] = [PackMode::Light, PackMode::LightField, PackMode::MetaInstancer];
}

/// Destination of packed files.
pub trait ArchiveWriter {
    fn write_file(&mut self, name: &str, data: &[u8]) -> Result<(), BakeError>;
}

/// Writes files into a directory, creating it when needed.
#[derive(Clone, Debug)]
pub struct DirectoryArchive {
    root: PathBuf,
}

impl DirectoryArchive {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

impl ArchiveWriter for DirectoryArchive {
    fn write_file(&mut self, name: &str, data: &[u8]) -> Result<(), BakeError> {
        fs::create_dir_all(&self.root)?;
        fs::write(self.root.join(name), data)?;
        Ok(())
    }
}

/// Keeps files in memory.
#[derive(Clone, Debug, Default)]
pub struct MemoryArchive {
    files: FxHashMap<String, Vec<u8>>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.files.get(name).map(Vec::as_slice)
    }

    /// Sorted names of stored files.
    pub fn names(&self) -> Vec<&str> {
        let mut names = self.files.keys().map(String::as_str).collect::<Vec<_>>();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl ArchiveWriter for MemoryArchive {
    fn write_file(&mut self, name: &str, data: &[u8]) -> Result<(), BakeError> {
        self.files.insert(name.to_string(), data.to_vec());
        Ok(())
    }
}

fn sorted_keys<V>(map: &FxHashMap<usize, V>) -> Vec<usize> {
    let mut keys = map.keys().copied().collect::<Vec<_>>();
    keys.sort_unstable();
    keys
}

/// Encodes a slice of the bitmap as RGBA8 PNG.
fn encode_png(bitmap: &Bitmap, slice: u32) -> Result<Vec<u8>, BakeError> {
    let image = RgbaImage::from_raw(bitmap.width(), bitmap.height(), bitmap.to_rgba8(slice))
        .ok_or(PreconditionError::TexelOutOfRange {
            x: bitmap.width(),
            y: bitmap.height(),
            slice,
            width: bitmap.width(),
            height: bitmap.height(),
            array_size: bitmap.array_size(),
        })?;
    let mut bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
    Ok(bytes)
}

/// Raw light field: `width, height, array_size` as little-endian u32 followed by RGBA f32
/// texels.
fn encode_light_field(bitmap: &Bitmap) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(12 + bitmap.data().len() * 16);
    for value in [bitmap.width(), bitmap.height(), bitmap.array_size()] {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    for texel in bitmap.data() {
        for value in texel.iter() {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
    }
    bytes
}

pub struct PackService {
    scene: Arc<Scene>,
    params: Arc<BakeParams>,
    results: BakeResults,
    logger: Logger,
}

impl PackService {
    pub fn new(
        scene: Arc<Scene>,
        params: Arc<BakeParams>,
        results: BakeResults,
        logger: Logger,
    ) -> Self {
        Self {
            scene,
            params,
            results,
            logger,
        }
    }

    pub fn results(&self) -> &BakeResults {
        &self.results
    }

    /// Packs every resource kind. Returns amount of written files.
    pub fn pack(&self, archive: &mut dyn ArchiveWriter) -> Result<usize, BakeError> {
        let mut written = 0;
        for mode in PackMode::ALL {
            written += self.pack_resources(mode, archive)?;
        }
        Ok(written)
    }

    /// Packs resources of a single kind. Returns amount of written files.
    pub fn pack_resources(
        &self,
        mode: PackMode,
        archive: &mut dyn ArchiveWriter,
    ) -> Result<usize, BakeError> {
        let written = match mode {
            PackMode::Light => self.pack_light(archive)?,
            PackMode::LightField => self.pack_light_fields(archive)?,
            PackMode::MetaInstancer => self.pack_meta_instancers(archive)?,
        };
        self.logger
            .info(format_args!("Packed {:?}: {} file(s)", mode, written));
        Ok(written)
    }

    fn pack_light(&self, archive: &mut dyn ArchiveWriter) -> Result<usize, BakeError> {
        let mut written = 0;
        for index in sorted_keys(&self.results.instances) {
            let Some(instance) = self.scene.instances().get(index) else {
                continue;
            };
            let baked = &self.results.instances[&index];
            let mut combined = postprocess::combine(&baked.light_map, &baked.shadow_map)?;
            postprocess::make_encode_ready(
                &mut combined,
                EncodeReadyFlags {
                    srgb: true,
                    sqrt: false,
                },
            );
            for slice in 0..combined.array_size() {
                let name = if combined.array_size() > 1 {
                    format!("{}_lightmap_{}.png", instance.name, slice)
                } else {
                    format!("{}_lightmap.png", instance.name)
                };
                archive.write_file(&name, &encode_png(&combined, slice)?)?;
                written += 1;
            }
        }

        archive.write_file("lights.txt", self.light_records().as_bytes())?;
        Ok(written + 1)
    }

    /// One line per light: name, kind, normalized color, intensity, shadow flag and radius,
    /// then the kind specific values.
    fn light_records(&self) -> String {
        let mut text = String::new();
        for light in self.scene.lights() {
            let (color, intensity) = light.normalized();
            let intensity = intensity * light.intensity_factor(&self.params);
            let _ = write!(
                text,
                "{} {} {} {} {} {} {} {}",
                light.name,
                if light.is_directional() {
                    "directional"
                } else {
                    "point"
                },
                color.x,
                color.y,
                color.z,
                intensity,
                light.cast_shadow as u8,
                light.shadow_radius
            );
            let _ = match light.kind {
                LightKind::Directional { direction } => {
                    writeln!(text, " {} {} {}", direction.x, direction.y, direction.z)
                }
                LightKind::Point {
                    position,
                    inner_range,
                    outer_range,
                } => writeln!(
                    text,
                    " {} {} {} {} {}",
                    position.x, position.y, position.z, inner_range, outer_range
                ),
            };
        }
        text
    }

    fn pack_light_fields(&self, archive: &mut dyn ArchiveWriter) -> Result<usize, BakeError> {
        let mut written = 0;
        for index in sorted_keys(&self.results.light_fields) {
            let Some(light_field) = self.scene.light_fields().get(index) else {
                continue;
            };
            let bitmap = &self.results.light_fields[&index];
            archive.write_file(
                &format!("{}.shlf", light_field.name),
                &encode_light_field(bitmap),
            )?;
            written += 1;
        }
        Ok(written)
    }

    /// Meta instancers are sampled at pack time: `u32` placement count followed by one RGBA8
    /// color per placement.
    fn pack_meta_instancers(&self, archive: &mut dyn ArchiveWriter) -> Result<usize, BakeError> {
        let denoisers = DenoiserRegistry::new();
        let baker = Baker::new(&self.scene, &self.params, &denoisers, &self.logger);
        let mut written = 0;
        for (index, instancer) in self.scene.meta_instancers().iter().enumerate() {
            let colors = baker.bake_meta_instancer(index);
            let mut bitmap = Bitmap::new(colors.len() as u32, 1, 1);
            for (texel, color) in bitmap.data_mut().iter_mut().zip(colors) {
                *texel = Vector4::new(color.x, color.y, color.z, 1.0);
            }
            postprocess::make_encode_ready(
                &mut bitmap,
                EncodeReadyFlags {
                    srgb: true,
                    sqrt: false,
                },
            );

            let mut bytes = (instancer.positions.len() as u32).to_le_bytes().to_vec();
            bytes.extend_from_slice(&bitmap.to_rgba8(0));
            archive.write_file(&format!("{}.mti", instancer.name), &bytes)?;
            written += 1;
        }
        Ok(written)
    }
}
