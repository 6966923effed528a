//! Bake orchestration.
//!
//! [`BakeService`] owns the scene, the parameters and the results of the last bake. A bake
//! iterates over the entities of the selected target (instances or light fields), either on
//! the calling thread ([`BakeService::bake`]) or on a dedicated thread
//! ([`BakeService::spawn`]). Per-texel work inside an entity runs on the rayon pool.
//!
//! Cancellation is checked once per entity. A cancelled bake keeps the results of every
//! entity finished before the cancellation was observed.

use crate::{
    baker::{BakedInstance, Baker},
    bitmap::Bitmap,
    denoise::DenoiserRegistry,
    error::BakeError,
    logger::Logger,
    pack::PackService,
    params::{BakeParams, BakeTarget},
    progress::{BakeProgress, BakeState, CancellationToken},
    scene::{Instance, Scene, ShLightField},
};
use fxhash::FxHashMap;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::{
    ops::Deref,
    sync::Arc,
    thread::{self, JoinHandle},
};

/// Output of bakes, keyed by entity index in the scene.
#[derive(Clone, Debug, Default)]
pub struct BakeResults {
    pub instances: FxHashMap<usize, BakedInstance>,
    pub light_fields: FxHashMap<usize, Bitmap>,
}

impl BakeResults {
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty() && self.light_fields.is_empty()
    }

    fn clear(&mut self, target: BakeTarget) {
        match target {
            BakeTarget::GlobalIllumination => self.instances.clear(),
            BakeTarget::LightField => self.light_fields.clear(),
        }
    }
}

/// Entity that has just been baked.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BakedEntity {
    Instance(usize),
    LightField(usize),
}

type EntityBakedHook = Arc<dyn Fn(BakedEntity) + Send + Sync>;

/// Borrow of a scene entity that keeps its scene alive.
pub struct EntityRef<T> {
    scene: Arc<Scene>,
    index: usize,
    get: fn(&Scene, usize) -> &T,
}

impl<T> EntityRef<T> {
    pub fn index(&self) -> usize {
        self.index
    }
}

impl<T> Deref for EntityRef<T> {
    type Target = T;

    fn deref(&self) -> &T {
        (self.get)(&self.scene, self.index)
    }
}

fn instance_at(scene: &Scene, index: usize) -> &Instance {
    &scene.instances()[index]
}

fn light_field_at(scene: &Scene, index: usize) -> &ShLightField {
    &scene.light_fields()[index]
}

fn entity_count(scene: &Scene, target: BakeTarget) -> usize {
    match target {
        BakeTarget::GlobalIllumination => scene.instances().len(),
        BakeTarget::LightField => scene.light_fields().len(),
    }
}

pub struct BakeService {
    scene: RwLock<Arc<Scene>>,
    params: RwLock<Arc<BakeParams>>,
    denoisers: DenoiserRegistry,
    logger: Logger,
    progress: BakeProgress,
    cancellation: CancellationToken,
    results: Mutex<BakeResults>,
    hooks: Mutex<Vec<EntityBakedHook>>,
}

impl BakeService {
    pub fn new(scene: Arc<Scene>, params: Arc<BakeParams>) -> Self {
        Self {
            scene: RwLock::new(scene),
            params: RwLock::new(params),
            denoisers: DenoiserRegistry::default(),
            logger: Logger::new(),
            progress: BakeProgress::new(),
            cancellation: CancellationToken::new(),
            results: Mutex::new(BakeResults::default()),
            hooks: Mutex::new(Vec::new()),
        }
    }

    pub fn with_denoisers(mut self, denoisers: DenoiserRegistry) -> Self {
        self.denoisers = denoisers;
        self
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn scene(&self) -> Arc<Scene> {
        self.scene.read().clone()
    }

    pub fn params(&self) -> Arc<BakeParams> {
        self.params.read().clone()
    }

    /// Replaces the scene. Rejected while a bake is running. Results of the previous scene
    /// are dropped.
    pub fn set_scene(&self, scene: Arc<Scene>) -> Result<(), BakeError> {
        let mut current = self.scene.write();
        if self.progress.state() == BakeState::Running {
            return Err(BakeError::BakeInProgress);
        }
        *current = scene;
        *self.results.lock() = BakeResults::default();
        Ok(())
    }

    /// Replaces the parameters. Rejected while a bake is running.
    pub fn set_params(&self, params: Arc<BakeParams>) -> Result<(), BakeError> {
        let _scene = self.scene.write();
        if self.progress.state() == BakeState::Running {
            return Err(BakeError::BakeInProgress);
        }
        *self.params.write() = params;
        Ok(())
    }

    /// Registers an observer called on the bake thread after every baked entity.
    pub fn on_entity_baked<F>(&self, hook: F)
    where
        F: Fn(BakedEntity) + Send + Sync + 'static,
    {
        self.hooks.lock().push(Arc::new(hook));
    }

    pub fn progress(&self) -> &BakeProgress {
        &self.progress
    }

    pub fn state(&self) -> BakeState {
        self.progress.state()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Asks a running (or the next) bake to stop before its next entity.
    pub fn request_cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn is_pending_cancel(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn results(&self) -> MutexGuard<'_, BakeResults> {
        self.results.lock()
    }

    /// Packer over a snapshot of current results.
    pub fn pack_service(&self) -> PackService {
        PackService::new(
            self.scene(),
            self.params(),
            self.results.lock().clone(),
            self.logger.clone(),
        )
    }

    /// Instance currently being baked, or the last one of a finished bake.
    pub fn last_baked_instance(&self) -> Option<EntityRef<Instance>> {
        let scene = self.scene();
        let index = self.progress.last_instance()?;
        (index < scene.instances().len()).then(|| EntityRef {
            scene,
            index,
            get: instance_at,
        })
    }

    pub fn last_baked_shlf(&self) -> Option<EntityRef<ShLightField>> {
        let scene = self.scene();
        let index = self.progress.last_light_field()?;
        (index < scene.light_fields().len()).then(|| EntityRef {
            scene,
            index,
            get: light_field_at,
        })
    }

    /// Bakes the target selected in the parameters. Returns amount of baked entities.
    pub fn bake(&self) -> Result<usize, BakeError> {
        let target = self.params.read().target;
        self.bake_target(target)
    }

    /// Bakes light maps of every instance.
    pub fn bake_gi(&self) -> Result<usize, BakeError> {
        self.bake_target(BakeTarget::GlobalIllumination)
    }

    /// Bakes every spherical harmonics light field.
    pub fn bake_light_field(&self) -> Result<usize, BakeError> {
        self.bake_target(BakeTarget::LightField)
    }

    /// Runs a bake of `target` on a dedicated thread.
    pub fn spawn(self: &Arc<Self>, target: BakeTarget) -> Result<BakeTask, BakeError> {
        let (scene, params) = self.begin(target)?;
        let service = self.clone();
        let spawned = thread::Builder::new()
            .name("gi-bake".to_string())
            .spawn(move || service.run(&scene, &params, target));
        match spawned {
            Ok(handle) => Ok(BakeTask {
                handle: Some(handle),
                result: None,
            }),
            Err(err) => {
                self.progress.set_state(BakeState::Idle);
                Err(err.into())
            }
        }
    }

    fn bake_target(&self, target: BakeTarget) -> Result<usize, BakeError> {
        let (scene, params) = self.begin(target)?;
        self.run(&scene, &params, target)
    }

    /// Switches to the running state and takes snapshots of the inputs.
    fn begin(&self, target: BakeTarget) -> Result<(Arc<Scene>, Arc<BakeParams>), BakeError> {
        let scene = self.scene.read();
        let count = entity_count(&scene, target);
        if !self.progress.try_start(count as u32) {
            return Err(BakeError::BakeInProgress);
        }
        self.results.lock().clear(target);
        Ok((scene.clone(), self.params.read().clone()))
    }

    fn run(
        &self,
        scene: &Scene,
        params: &BakeParams,
        target: BakeTarget,
    ) -> Result<usize, BakeError> {
        let count = entity_count(scene, target);
        self.logger
            .info(format_args!("Bake of {:?} started, {} entities", target, count));

        let baker = Baker::new(scene, params, &self.denoisers, &self.logger);
        for index in 0..count {
            if self.cancellation.is_cancelled() {
                self.cancellation.reset();
                self.progress.set_state(BakeState::Cancelled);
                self.logger
                    .info(format_args!("Bake cancelled after {} entities", index));
                return Err(BakeError::Cancelled);
            }

            let entity = match self.bake_entity(&baker, target, index) {
                Ok(entity) => entity,
                Err(err) => {
                    self.progress.set_state(BakeState::Idle);
                    self.logger
                        .warn(format_args!("Bake failed at entity {}: {}", index, err));
                    return Err(err);
                }
            };

            self.progress.advance_progress();
            let hooks = self.hooks.lock().clone();
            for hook in hooks.iter() {
                hook(entity);
            }
        }

        // A cancel raised during the last entity has nothing left to stop.
        self.cancellation.reset();
        self.progress.set_state(BakeState::Completed);
        self.logger.info(format_args!("Bake completed"));
        Ok(count)
    }

    fn bake_entity(
        &self,
        baker: &Baker,
        target: BakeTarget,
        index: usize,
    ) -> Result<BakedEntity, BakeError> {
        match target {
            BakeTarget::GlobalIllumination => {
                self.progress.set_last_instance(index);
                let baked = baker.bake_instance(index)?;
                self.results.lock().instances.insert(index, baked);
                Ok(BakedEntity::Instance(index))
            }
            BakeTarget::LightField => {
                self.progress.set_last_light_field(index);
                let baked = baker.bake_light_field(index)?;
                self.results.lock().light_fields.insert(index, baked);
                Ok(BakedEntity::LightField(index))
            }
        }
    }
}

/// Handle of a bake running on its own thread.
pub struct BakeTask {
    handle: Option<JoinHandle<Result<usize, BakeError>>>,
    result: Option<Result<usize, BakeError>>,
}

impl BakeTask {
    fn collect(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.result = Some(handle.join().unwrap_or(Err(BakeError::TaskPanicked)));
        }
    }

    /// Non-blocking check. Returns the result once the bake has finished.
    pub fn poll(&mut self) -> Option<&Result<usize, BakeError>> {
        if self.handle.as_ref().is_some_and(|h| h.is_finished()) {
            self.collect();
        }
        self.result.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Blocks until the bake ends.
    pub fn join(mut self) -> Result<usize, BakeError> {
        self.collect();
        self.result.take().unwrap_or(Err(BakeError::TaskPanicked))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        denoise::{Denoiser, DenoiserType},
        error::DenoiseError,
        scene::{Material, Mesh, SceneInput, Vertex},
    };
    use nalgebra::{Matrix4, Vector2, Vector3};
    use std::sync::Weak;

    fn quad_instance(name: &str, offset: f32) -> Instance {
        let vertex = |x: f32, z: f32| Vertex {
            position: Vector3::new(x + offset, 0.0, z),
            normal: Vector3::new(0.0, 1.0, 0.0),
            uv: Vector2::new(x, z),
            lightmap_uv: Vector2::new(x, z),
        };
        let mesh = Mesh::new(
            vec![vertex(0.0, 0.0), vertex(1.0, 0.0), vertex(1.0, 1.0), vertex(0.0, 1.0)],
            vec![[0, 2, 1], [0, 3, 2]],
            Arc::new(Material::default()),
        )
        .unwrap();
        Instance::new(name, vec![mesh], Matrix4::identity())
    }

    fn cheap_params() -> BakeParams {
        BakeParams {
            light_bounce_count: 0,
            shadow_sample_count: 1,
            ao_sample_count: 0,
            resolution_override: 4,
            denoiser_type: DenoiserType::None,
            ..Default::default()
        }
    }

    fn service(instances: usize) -> Arc<BakeService> {
        let scene = Scene::new(SceneInput {
            instances: (0..instances)
                .map(|i| quad_instance(&format!("quad{i}"), i as f32 * 2.0))
                .collect(),
            light_fields: vec![ShLightField::new("field", Vector3::zeros(), Vector3::repeat(1.0))
                .with_resolution([1, 1, 1])],
            ..Default::default()
        });
        Arc::new(BakeService::new(Arc::new(scene), Arc::new(cheap_params())))
    }

    #[test]
    fn bake_dispatches_on_target() {
        let service = service(2);
        assert_eq!(service.bake().unwrap(), 2);
        assert_eq!(service.results().instances.len(), 2);
        assert!(service.results().light_fields.is_empty());
        assert_eq!(service.state(), BakeState::Completed);
        assert_eq!(service.last_baked_instance().unwrap().name, "quad1");

        assert_eq!(service.bake_light_field().unwrap(), 1);
        assert_eq!(service.results().light_fields.len(), 1);
        assert_eq!(service.last_baked_shlf().unwrap().name, "field");
        // Results of the other target are kept.
        assert_eq!(service.results().instances.len(), 2);
    }

    #[test]
    fn second_bake_is_rejected_while_running() {
        let service = service(3);
        let weak: Weak<BakeService> = Arc::downgrade(&service);
        let nested = Arc::new(Mutex::new(Vec::new()));
        let sink = nested.clone();
        service.on_entity_baked(move |_| {
            if let Some(service) = weak.upgrade() {
                sink.lock().push((
                    matches!(service.bake_gi(), Err(BakeError::BakeInProgress)),
                    matches!(
                        service.set_scene(Arc::new(Scene::default())),
                        Err(BakeError::BakeInProgress)
                    ),
                ));
            }
        });
        assert_eq!(service.bake_gi().unwrap(), 3);
        assert_eq!(*nested.lock(), vec![(true, true); 3]);
    }

    #[test]
    fn spawned_bake_can_be_polled() {
        let service = service(2);
        let mut task = service.spawn(BakeTarget::GlobalIllumination).unwrap();
        while task.poll().is_none() {
            thread::yield_now();
        }
        assert!(task.is_finished());
        assert_eq!(task.join().unwrap(), 2);
        assert_eq!(service.progress().progress_percent(), 100);
    }

    #[test]
    fn set_scene_drops_results() {
        let service = service(1);
        service.bake_gi().unwrap();
        service.set_scene(Arc::new(Scene::default())).unwrap();
        assert!(service.results().is_empty());
        assert!(service.last_baked_instance().is_none());
    }

    #[test]
    fn late_cancel_does_not_leak_into_next_bake() {
        let service = service(2);
        let token = service.cancellation_token().clone();
        service.on_entity_baked(move |entity| {
            if entity == BakedEntity::Instance(1) {
                token.cancel();
            }
        });

        assert_eq!(service.bake_gi().unwrap(), 2);
        assert_eq!(service.state(), BakeState::Completed);
        assert!(!service.is_pending_cancel());

        service.hooks.lock().clear();
        assert_eq!(service.bake_gi().unwrap(), 2);
        assert_eq!(service.results().instances.len(), 2);
    }

    /// Records which instance the progress reports while texels are being processed.
    #[derive(Debug)]
    struct ProgressRecorder {
        progress: BakeProgress,
        seen: Mutex<Vec<Option<usize>>>,
    }

    impl Denoiser for ProgressRecorder {
        fn denoise(&self, bitmap: &Bitmap, _: bool) -> Result<Bitmap, DenoiseError> {
            self.seen.lock().push(self.progress.last_instance());
            Ok(bitmap.clone())
        }
    }

    #[test]
    fn last_instance_is_published_before_its_bake() {
        let scene = Scene::new(SceneInput {
            instances: vec![quad_instance("a", 0.0), quad_instance("b", 2.0)],
            ..Default::default()
        });
        let params = BakeParams {
            denoiser_type: DenoiserType::Oidn,
            denoise_shadow_map: false,
            ..cheap_params()
        };
        let service = BakeService::new(Arc::new(scene), Arc::new(params));
        let recorder = Arc::new(ProgressRecorder {
            progress: service.progress().clone(),
            seen: Mutex::new(Vec::new()),
        });
        let service = service.with_denoisers(
            DenoiserRegistry::new().with(DenoiserType::Oidn, recorder.clone()),
        );

        assert_eq!(service.bake_gi().unwrap(), 2);
        assert_eq!(*recorder.seen.lock(), vec![Some(0), Some(1)]);
    }

    #[test]
    fn hook_may_register_another_hook() {
        let service = service(2);
        let weak = Arc::downgrade(&service);
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        service.on_entity_baked(move |_| {
            *counter.lock() += 1;
            if let Some(service) = weak.upgrade() {
                service.on_entity_baked(|_| {});
            }
        });
        assert_eq!(service.bake_gi().unwrap(), 2);
        assert_eq!(*calls.lock(), 2);
        assert_eq!(service.hooks.lock().len(), 3);
    }
}
