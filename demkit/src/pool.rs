//! Checkout/checkin pool of [`DemHandler`]s.
//!
//! Every handler lives in a [`HandlerSlot`]. A slot is either *parked* (its
//! handler sits in the slot, free for any worker) or *claimed* (an
//! [`ElevationWorker`] has taken it out). Claiming is a `take()` on the parked
//! handler, so a slot is claimed by at most one worker by construction.
//!
//! # Refresh protocol
//!
//! Configuration lives behind the registry mutex. A writer changes it while
//! holding the mutex, then sets every slot's `stale` flag with `Release`
//! ordering. A worker checks its flag with a `Relaxed` load before each query
//! (the common, lock-free case) and, when set, clears it with an `Acquire`
//! swap and re-reads the configuration under the registry mutex. The mutex is
//! what publishes the configuration itself; the flag only has to become
//! visible eventually, and a writer racing a refresh simply leaves the flag
//! set for the next query.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::handler::DemHandler;
use crate::registry::Shared;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Pool entry owning one handler while it is parked.
pub(crate) struct HandlerSlot {
    stale: AtomicBool,
    parked: Mutex<Option<DemHandler>>,
}

impl HandlerSlot {
    /// A new, claimed slot. It starts stale so the first use applies the
    /// current configuration.
    pub(crate) fn new() -> Self {
        Self {
            stale: AtomicBool::new(true),
            parked: Mutex::new(None),
        }
    }

    pub(crate) fn mark_stale(&self) {
        self.stale.store(true, Ordering::Release);
    }

    pub(crate) fn take_stale(&self) -> bool {
        self.stale.load(Ordering::Relaxed) && self.stale.swap(false, Ordering::Acquire)
    }

    /// Claim the parked handler, if the slot is free.
    pub(crate) fn checkout(&self) -> Option<DemHandler> {
        lock(&self.parked).take()
    }

    fn check_in(&self, handler: DemHandler) {
        let previous = lock(&self.parked).replace(handler);
        debug_assert!(previous.is_none(), "handler slot claimed twice");
    }

    /// Run `f` on the handler if it is parked.
    pub(crate) fn with_parked(&self, f: impl FnOnce(&mut DemHandler)) {
        if let Some(handler) = lock(&self.parked).as_mut() {
            f(handler);
        }
    }

    pub(crate) fn is_parked(&self) -> bool {
        lock(&self.parked).is_some()
    }
}

/// A handler checked out of a registry's pool.
///
/// The worker is the per-thread query context: hold one per thread (or per
/// task) and query through it. Dropping it returns the handler to the pool,
/// where the next [`Registry::acquire`](crate::Registry::acquire) reuses it.
///
/// # Example
///
/// ```no_run
/// use demkit::Registry;
///
/// # fn main() -> demkit::Result<()> {
/// # let points: Vec<(f64, f64)> = Vec::new();
/// let registry = Registry::new()?;
/// registry.open_dem_directory("/data/srtm");
///
/// std::thread::scope(|s| {
///     for chunk in points.chunks(1000) {
///         let registry = &registry;
///         s.spawn(move || {
///             let mut worker = registry.acquire();
///             for &(lon, lat) in chunk {
///                 println!("{}", worker.height_above_ellipsoid(lon, lat));
///             }
///         });
///     }
/// });
/// # Ok(())
/// # }
/// ```
pub struct ElevationWorker {
    shared: Arc<Shared>,
    slot: Arc<HandlerSlot>,
    handler: Option<DemHandler>,
}

impl ElevationWorker {
    pub(crate) fn new(shared: Arc<Shared>, slot: Arc<HandlerSlot>, handler: DemHandler) -> Self {
        Self {
            shared,
            slot,
            handler: Some(handler),
        }
    }

    fn handler(&mut self) -> &mut DemHandler {
        let Some(handler) = self.handler.as_mut() else {
            unreachable!("worker handler is only taken on drop");
        };
        if self.slot.take_stale() {
            let state = self.shared.lock_state();
            handler.apply(&state.handler_config());
        }
        handler
    }

    /// Height above mean sea level, or `None` where the DEM has no value.
    pub fn height_above_msl(&mut self, lon: f64, lat: f64) -> Option<f64> {
        self.handler().height_above_msl(lon, lat)
    }

    /// Geoid undulation, or `None` where the geoid has no value.
    pub fn geoid_height(&mut self, lon: f64, lat: f64) -> Option<f64> {
        self.handler().geoid_height(lon, lat)
    }

    /// Height above the WGS84 ellipsoid.
    ///
    /// Sums whichever of DEM and geoid have a value at the point; falls back
    /// to the registry's default height only when neither does.
    pub fn height_above_ellipsoid(&mut self, lon: f64, lat: f64) -> f64 {
        let default_height = self.shared.default_height();
        self.handler().height_above_ellipsoid(lon, lat, default_height)
    }

    pub(crate) fn registry_id(&self) -> u64 {
        self.shared.id()
    }

    /// True once the registry the worker came from has been dropped.
    pub(crate) fn is_orphaned(&self) -> bool {
        self.shared.is_closed()
    }
}

impl Drop for ElevationWorker {
    fn drop(&mut self) {
        if let Some(handler) = self.handler.take() {
            self.slot.check_in(handler);
        }
    }
}

impl std::fmt::Debug for ElevationWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElevationWorker")
            .field("registry", &self.shared.id())
            .finish_non_exhaustive()
    }
}
