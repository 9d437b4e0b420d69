//! Process runtime: engines, host allocator and hooks for one device.
//!
//! A [`Runtime`] is an ordinary value. The C ABI keeps the one it is
//! currently serving in a process slot ([`install`], [`current`],
//! [`cleanup`]); Rust embedders may own theirs directly.

use crate::allocator::HostAllocator;
use crate::pressure::PressureHandler;
use crate::{HostError, HostResult};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use vbar_core::{DeviceEngine, EngineConfig, EngineRegistry};
use vbar_driver::{DeviceId, DriverBackend};
use vbar_hooks::{router, AllocatorHookInstaller};

/// Environment variable holding a `tracing` filter directive.
pub const LOG_ENV: &str = "VBAR_LOG";

static RUNTIME: RwLock<Option<Arc<Runtime>>> = parking_lot::const_rwlock(None);
static PRESSURE: RwLock<Option<Arc<dyn PressureHandler>>> = parking_lot::const_rwlock(None);

/// Install the stderr subscriber. Later calls, or a subscriber installed by
/// the embedding process, win.
pub fn init_logging(config: &EngineConfig) {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_env_filter(filter)
        .try_init();
}

/// Everything the host integration needs for one device.
pub struct Runtime {
    device: DeviceId,
    registry: Arc<EngineRegistry>,
    allocator: Arc<HostAllocator>,
    hooks: Box<dyn AllocatorHookInstaller>,
}

impl Runtime {
    /// Bring up the engine for `device`, install `hooks` and route
    /// intercepted allocations to the host allocator.
    ///
    /// # Errors
    ///
    /// Returns the engine failure if the device cannot be initialized, or
    /// the hook failure if the allocation entry points cannot be redirected.
    pub fn start(
        driver: Arc<dyn DriverBackend>,
        config: EngineConfig,
        device: DeviceId,
        hooks: Box<dyn AllocatorHookInstaller>,
    ) -> HostResult<Self> {
        let registry = Arc::new(EngineRegistry::new(driver, config)?);
        let engine = registry.engine(device)?;
        let info = engine.device_info();
        tracing::info!(
            backend = registry.driver().name(),
            "VBAR initialized for {}: {} (VRAM: {} MB)",
            device,
            info.name,
            info.memory_total_mb()
        );

        let allocator = Arc::new(HostAllocator::new(Arc::clone(&registry), device));
        if let Some(handler) = PRESSURE.read().clone() {
            allocator.set_pressure_handler(handler);
        }

        if let Err(err) = hooks.install() {
            tracing::error!("failed to install allocation hooks ({}): {}", hooks.name(), err);
            if let Err(shutdown_err) = registry.shutdown() {
                tracing::warn!("engine shutdown after failed init: {}", shutdown_err);
            }
            return Err(err.into());
        }
        router::set_router(Arc::clone(&allocator) as Arc<dyn router::AllocationRouter>);
        tracing::debug!(hooks = hooks.name(), "allocation routing enabled");

        Ok(Self {
            device,
            registry,
            allocator,
            hooks,
        })
    }

    /// Device this runtime was initialized for.
    #[must_use]
    pub const fn device(&self) -> DeviceId {
        self.device
    }

    /// Engines of the process.
    #[must_use]
    pub fn registry(&self) -> &Arc<EngineRegistry> {
        &self.registry
    }

    /// Host allocator of the runtime's device.
    #[must_use]
    pub fn allocator(&self) -> &Arc<HostAllocator> {
        &self.allocator
    }

    /// Engine of `device`, created on first use.
    ///
    /// # Errors
    ///
    /// See [`EngineRegistry::engine`].
    pub fn engine(&self, device: DeviceId) -> HostResult<Arc<DeviceEngine>> {
        Ok(self.registry.engine(device)?)
    }

    /// Remove the hooks and shut every engine down. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns the first failure; later steps still run.
    pub fn shutdown(&self) -> HostResult<()> {
        router::clear_router();
        let unhook = self.hooks.uninstall().map_err(HostError::from);
        let engines = self.registry.shutdown().map_err(HostError::from);
        tracing::debug!(device = %self.device, "VBAR runtime shut down");
        unhook.and(engines)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if !self.registry.is_shut_down() {
            if let Err(err) = self.shutdown() {
                tracing::warn!("runtime teardown: {}", err);
            }
        }
    }
}

/// Initialize the process runtime for `device` from the environment:
/// configuration layers, logging, the compiled-in driver and the platform
/// hook installer.
///
/// # Errors
///
/// See [`install`]; also fails if the configuration or driver cannot be
/// loaded.
pub fn init(device: DeviceId) -> HostResult<Arc<Runtime>> {
    let config = EngineConfig::from_env()?;
    init_logging(&config);
    let driver = vbar_driver::native_driver()?;
    install(driver, config, device, vbar_hooks::platform_installer())
}

/// Start a runtime and place it in the process slot.
///
/// Installing again for the same device returns the existing runtime.
///
/// # Errors
///
/// Returns [`HostError::AlreadyInitialized`] if the slot serves another
/// device, or the [`Runtime::start`] failure.
pub fn install(
    driver: Arc<dyn DriverBackend>,
    config: EngineConfig,
    device: DeviceId,
    hooks: Box<dyn AllocatorHookInstaller>,
) -> HostResult<Arc<Runtime>> {
    let mut slot = RUNTIME.write();
    if let Some(existing) = slot.as_ref() {
        if existing.device == device {
            return Ok(Arc::clone(existing));
        }
        return Err(HostError::AlreadyInitialized(existing.device));
    }
    let runtime = Arc::new(Runtime::start(driver, config, device, hooks)?);
    *slot = Some(Arc::clone(&runtime));
    Ok(runtime)
}

/// The runtime in the process slot.
///
/// # Errors
///
/// Returns [`HostError::NotInitialized`] before [`install`] or after
/// [`cleanup`].
pub fn current() -> HostResult<Arc<Runtime>> {
    RUNTIME.read().clone().ok_or(HostError::NotInitialized)
}

/// Shut down and clear the process runtime, if any.
///
/// # Errors
///
/// See [`Runtime::shutdown`].
pub fn cleanup() -> HostResult<()> {
    let runtime = RUNTIME.write().take();
    match runtime {
        Some(runtime) => runtime.shutdown(),
        None => Ok(()),
    }
}

/// Register the pressure handler for the current and every later runtime.
pub fn set_pressure_handler(handler: Option<Arc<dyn PressureHandler>>) {
    *PRESSURE.write() = handler.clone();
    if let Some(runtime) = RUNTIME.read().as_ref() {
        match handler {
            Some(handler) => runtime.allocator.set_pressure_handler(handler),
            None => runtime.allocator.clear_pressure_handler(),
        }
    }
}
