use gi_baker::{
    denoise::DenoiserType,
    light::Light,
    pack::{DirectoryArchive, MemoryArchive, PackMode},
    scene::{Instance, Material, MetaInstancer, Mesh, Scene, SceneInput, ShLightField, Vertex},
    BakeParams, BakeService,
};
use nalgebra::{Matrix4, Vector2, Vector3};
use std::sync::Arc;

fn scene() -> Scene {
    let vertex = |x: f32, z: f32| Vertex {
        position: Vector3::new(x, 0.0, z),
        normal: Vector3::new(0.0, 1.0, 0.0),
        uv: Vector2::new(x, z),
        lightmap_uv: Vector2::new(x, z),
    };
    let mesh = Mesh::new(
        vec![
            vertex(0.0, 0.0),
            vertex(1.0, 0.0),
            vertex(1.0, 1.0),
            vertex(0.0, 1.0),
        ],
        vec![[0, 2, 1], [0, 3, 2]],
        Arc::new(Material::diffuse("stone", Vector3::repeat(0.5))),
    )
    .unwrap();

    Scene::new(SceneInput {
        instances: vec![Instance::new("ground", vec![mesh], Matrix4::identity())],
        lights: vec![
            Light::directional("sun", Vector3::new(0.3, -1.0, 0.2), Vector3::repeat(1.0)),
            Light::point("lamp", Vector3::new(0.5, 2.0, 0.5), Vector3::new(2.0, 1.0, 1.0), 1.0, 5.0)
                .with_shadow(true, 0.1),
        ],
        light_fields: vec![ShLightField::new(
            "volume",
            Vector3::new(0.5, 1.0, 0.5),
            Vector3::repeat(2.0),
        )
        .with_resolution([2, 2, 2])],
        meta_instancers: vec![MetaInstancer {
            name: "grass".to_string(),
            positions: vec![Vector3::new(0.2, 0.0, 0.2), Vector3::new(0.8, 0.0, 0.8)],
        }],
    })
}

fn params() -> BakeParams {
    BakeParams {
        light_bounce_count: 1,
        light_sample_count: 4,
        shadow_sample_count: 4,
        ao_sample_count: 4,
        resolution_override: 8,
        denoiser_type: DenoiserType::None,
        ..Default::default()
    }
}

#[test]
fn baked_stage_is_packed() {
    let service = BakeService::new(Arc::new(scene()), Arc::new(params()));
    service.bake_gi().unwrap();
    service.bake_light_field().unwrap();

    let packer = service.pack_service();
    let mut archive = MemoryArchive::new();
    assert_eq!(packer.pack(&mut archive).unwrap(), 4);
    assert_eq!(
        archive.names(),
        vec!["grass.mti", "ground_lightmap.png", "lights.txt", "volume.shlf"]
    );

    let image = image::load_from_memory(archive.get("ground_lightmap.png").unwrap()).unwrap();
    assert_eq!((image.width(), image.height()), (8, 8));

    let shlf = archive.get("volume.shlf").unwrap();
    assert_eq!(shlf.len(), 12 + 2 * 9 * 2 * 2 * 16);

    let lights = String::from_utf8(archive.get("lights.txt").unwrap().to_vec()).unwrap();
    let lamp = lights.lines().nth(1).unwrap();
    // Color is normalized, intensity moves into its own column.
    assert!(lamp.starts_with("lamp point 1 0.5 0.5 2 1 0.1"), "{lamp}");
}

#[test]
fn packing_without_results_writes_only_derived_files() {
    let service = BakeService::new(Arc::new(scene()), Arc::new(params()));
    let packer = service.pack_service();
    let mut archive = MemoryArchive::new();
    assert_eq!(packer.pack_resources(PackMode::Light, &mut archive).unwrap(), 1);
    assert_eq!(packer.pack_resources(PackMode::LightField, &mut archive).unwrap(), 0);
    assert_eq!(archive.names(), vec!["lights.txt"]);
}

#[test]
fn packs_into_directory() {
    let root = std::env::temp_dir().join(format!("gi-baker-stage-{}", std::process::id()));
    let service = BakeService::new(Arc::new(scene()), Arc::new(params()));
    service.bake_gi().unwrap();

    let mut archive = DirectoryArchive::new(&root);
    service
        .pack_service()
        .pack_resources(PackMode::Light, &mut archive)
        .unwrap();
    assert!(root.join("ground_lightmap.png").exists());
    assert!(root.join("lights.txt").exists());
    std::fs::remove_dir_all(&root).unwrap();
}
