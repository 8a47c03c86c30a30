//! Run-time device selection.
//!
//! Code that is generic over [`DeviceAdapter`] is packaged as a
//! [`DeviceFunctor`] and handed to a [`DeviceRegistry`], which tries the
//! forced device (if configured) or every adapter in priority order
//! (accelerator, threaded, serial). An adapter that is unavailable, or whose
//! attempt fails with [`DeviceError::BadDevice`], is skipped; any other error
//! ends the search.

use crate::adapter::{DeviceAdapter, DeviceAdapterId};
use crate::adapters::{AcceleratorAdapter, SerialAdapter, ThreadedAdapter};
use crate::config::RuntimeConfig;
use crate::error::{AsDeviceError, DeviceError, Result};

/// Device-generic work dispatched through a [`DeviceRegistry`]
pub trait DeviceFunctor {
    type Output;
    type Error: From<DeviceError> + AsDeviceError;

    fn call<D: DeviceAdapter>(&mut self, device: &D) -> std::result::Result<Self::Output, Self::Error>;
}

/// The adapters available to this process
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    config: RuntimeConfig,
    serial: SerialAdapter,
    threaded: ThreadedAdapter,
    accelerator: AcceleratorAdapter,
}

impl DeviceRegistry {
    pub fn from_config(config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        let threaded = ThreadedAdapter::with_config(&config.threaded)?;
        let accelerator = AcceleratorAdapter::with_config(config.accelerator.clone())?;
        tracing::debug!(
            forced = ?config.device,
            threads = threaded.num_threads(),
            accelerator = accelerator.is_available(),
            "device registry ready"
        );
        Ok(Self {
            config,
            serial: SerialAdapter,
            threaded,
            accelerator,
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::from_config(RuntimeConfig::from_env()?)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn serial(&self) -> &SerialAdapter {
        &self.serial
    }

    pub fn threaded(&self) -> &ThreadedAdapter {
        &self.threaded
    }

    pub fn accelerator(&self) -> &AcceleratorAdapter {
        &self.accelerator
    }

    pub fn is_available(&self, id: DeviceAdapterId) -> bool {
        match id {
            DeviceAdapterId::Serial => self.serial.is_available(),
            DeviceAdapterId::Threaded => self.threaded.is_available(),
            DeviceAdapterId::Accelerator => self.accelerator.is_available(),
        }
    }

    /// Run `functor` on one specific adapter.
    pub fn execute_on<F: DeviceFunctor>(
        &self,
        id: DeviceAdapterId,
        functor: &mut F,
    ) -> std::result::Result<F::Output, F::Error> {
        if !self.is_available(id) {
            return Err(DeviceError::bad_device(format!("{id} adapter is not available")).into());
        }
        match id {
            DeviceAdapterId::Serial => functor.call(&self.serial),
            DeviceAdapterId::Threaded => functor.call(&self.threaded),
            DeviceAdapterId::Accelerator => functor.call(&self.accelerator),
        }
    }

    /// Adapters `try_execute` visits, in order
    pub fn candidates(&self) -> Vec<DeviceAdapterId> {
        match self.config.device {
            Some(forced) => vec![forced],
            None => DeviceAdapterId::PRIORITY.to_vec(),
        }
    }

    /// Run `functor` on the first adapter that accepts it.
    pub fn try_execute<F: DeviceFunctor>(&self, functor: &mut F) -> std::result::Result<F::Output, F::Error> {
        for id in self.candidates() {
            if !self.is_available(id) {
                tracing::debug!(device = %id, "skipping unavailable device adapter");
                continue;
            }
            match self.execute_on(id, functor) {
                Ok(output) => return Ok(output),
                Err(err) if err.as_device_error().is_some_and(DeviceError::is_bad_device) => {
                    tracing::warn!(device = %id, "device adapter rejected work, trying the next one");
                }
                Err(err) => return Err(err),
            }
        }
        Err(DeviceError::bad_device(format!(
            "no device adapter could run the functor (tried {:?})",
            self.candidates()
        ))
        .into())
    }
}
