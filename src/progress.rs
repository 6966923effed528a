//! Progress reporting and cancellation of a running bake.
//!
//! Everything here is shared between the bake thread and observers through atomics. Values
//! are meant for display only: an observer may see the counter and the "last baked" indices
//! of slightly different moments.

use std::{
    fmt::{Display, Formatter},
    ops::Deref,
    sync::{
        atomic::{self, AtomicBool, AtomicU32, AtomicUsize},
        Arc,
    },
};

/// Small helper that allows you stop baking at any time.
#[derive(Clone, Default, Debug)]
pub struct CancellationToken(pub Arc<AtomicBool>);

impl CancellationToken {
    /// Creates new cancellation token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks if baking was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(atomic::Ordering::SeqCst)
    }

    /// Raises cancellation flag, actual cancellation is not immediate! The bake stops before
    /// the next entity.
    pub fn cancel(&self) {
        self.0.store(true, atomic::Ordering::SeqCst)
    }

    /// Lowers cancellation flag, so the token can be used for a new bake.
    pub fn reset(&self) {
        self.0.store(false, atomic::Ordering::SeqCst)
    }
}

/// Lifecycle of a bake.
#[derive(Copy, Clone, Debug, PartialOrd, PartialEq, Ord, Eq)]
#[repr(u32)]
pub enum BakeState {
    /// Nothing was baked yet.
    Idle = 0,
    /// Entities are being baked.
    Running = 1,
    /// Every entity was baked.
    Completed = 2,
    /// Bake was stopped on request, results of entities baked so far are kept.
    Cancelled = 3,
}

impl Display for BakeState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            BakeState::Idle => write!(f, "Idle"),
            BakeState::Running => write!(f, "Baking"),
            BakeState::Completed => write!(f, "Completed"),
            BakeState::Cancelled => write!(f, "Cancelled"),
        }
    }
}

const NONE: usize = usize::MAX;

/// Progress internals.
#[derive(Debug)]
pub struct ProgressData {
    state: AtomicU32,
    // Range is [0; max_iterations]
    progress: AtomicU32,
    max_iterations: AtomicU32,
    last_instance: AtomicUsize,
    last_light_field: AtomicUsize,
}

impl Default for ProgressData {
    fn default() -> Self {
        Self {
            state: AtomicU32::new(BakeState::Idle as u32),
            progress: AtomicU32::new(0),
            max_iterations: AtomicU32::new(0),
            last_instance: AtomicUsize::new(NONE),
            last_light_field: AtomicUsize::new(NONE),
        }
    }
}

fn load_index(index: &AtomicUsize) -> Option<usize> {
    match index.load(atomic::Ordering::SeqCst) {
        NONE => None,
        index => Some(index),
    }
}

impl ProgressData {
    /// Returns progress percentage in [0; 100] range.
    pub fn progress_percent(&self) -> u32 {
        let iterations = self.max_iterations.load(atomic::Ordering::SeqCst);
        if iterations > 0 {
            (self.progress.load(atomic::Ordering::SeqCst) as u64 * 100 / iterations as u64) as u32
        } else {
            0
        }
    }

    /// Amount of entities baked by the current (or last) bake.
    pub fn progress(&self) -> u32 {
        self.progress.load(atomic::Ordering::SeqCst)
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations.load(atomic::Ordering::SeqCst)
    }

    /// Returns current state.
    pub fn state(&self) -> BakeState {
        match self.state.load(atomic::Ordering::SeqCst) {
            1 => BakeState::Running,
            2 => BakeState::Completed,
            3 => BakeState::Cancelled,
            _ => BakeState::Idle,
        }
    }

    pub fn set_state(&self, state: BakeState) {
        self.state.store(state as u32, atomic::Ordering::SeqCst);
    }

    /// Atomically switches `Idle | Completed | Cancelled` to `Running`. Returns false if a
    /// bake is already running.
    pub fn try_start(&self, max_iterations: u32) -> bool {
        let mut current = self.state.load(atomic::Ordering::SeqCst);
        loop {
            if current == BakeState::Running as u32 {
                return false;
            }
            match self.state.compare_exchange(
                current,
                BakeState::Running as u32,
                atomic::Ordering::SeqCst,
                atomic::Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.max_iterations
            .store(max_iterations, atomic::Ordering::SeqCst);
        self.progress.store(0, atomic::Ordering::SeqCst);
        self.last_instance.store(NONE, atomic::Ordering::SeqCst);
        self.last_light_field.store(NONE, atomic::Ordering::SeqCst);
        true
    }

    /// Advances progress.
    pub fn advance_progress(&self) {
        self.progress.fetch_add(1, atomic::Ordering::SeqCst);
    }

    /// Index of the instance whose bake started most recently.
    pub fn last_instance(&self) -> Option<usize> {
        load_index(&self.last_instance)
    }

    pub fn set_last_instance(&self, index: usize) {
        self.last_instance.store(index, atomic::Ordering::SeqCst);
    }

    /// Index of the light field whose bake started most recently.
    pub fn last_light_field(&self) -> Option<usize> {
        load_index(&self.last_light_field)
    }

    pub fn set_last_light_field(&self, index: usize) {
        self.last_light_field.store(index, atomic::Ordering::SeqCst);
    }
}

/// Small helper that allows you to track progress of a bake.
#[derive(Clone, Default, Debug)]
pub struct BakeProgress(pub Arc<ProgressData>);

impl BakeProgress {
    /// Creates new progress indicator.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Deref for BakeProgress {
    type Target = ProgressData;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
