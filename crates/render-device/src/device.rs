use std::rc::Rc;

use log::{debug, info};

use crate::{
    backend::{AdapterInfo, Backend, FeatureLevel},
    Error, GraphicsConfig, Result,
};

/// The logical device and its command objects. Created once; nothing here is
/// ever recreated.
pub struct DeviceContext {
    backend: Rc<dyn Backend>,
    adapter: AdapterInfo,
    feature_level: FeatureLevel,
}

impl DeviceContext {
    /// Picks the first hardware adapter in preference order and creates a
    /// device on it at the highest feature level it accepts, then creates the
    /// queue, allocator and list.
    ///
    /// Every failure here is fatal.
    pub fn new(backend: Rc<dyn Backend>, config: &GraphicsConfig) -> Result<Self> {
        let adapters = backend.enumerate_adapters(config.power_preference)?;

        let adapter = adapters
            .into_iter()
            .inspect(|adapter| {
                if adapter.is_software {
                    debug!("skipping software adapter '{}'", adapter.name);
                }
            })
            .find(|adapter| !adapter.is_software)
            .ok_or(Error::NoAdapter)?;

        let mut levels = config.feature_levels.clone();
        levels.sort_unstable_by(|a, b| b.cmp(a));
        levels.dedup();

        let feature_level = levels
            .into_iter()
            .find(|&level| match backend.create_device(adapter.id, level) {
                Ok(()) => true,
                Err(e) => {
                    debug!("{level:?} rejected by '{}': {e}", adapter.name);
                    false
                }
            })
            .ok_or_else(|| Error::DeviceCreation {
                adapter: adapter.name.clone(),
            })?;

        backend.create_command_objects()?;

        info!(
            "using adapter '{}' ({} MiB) at {:?} on the {} backend",
            adapter.name,
            adapter.dedicated_video_memory / (1024 * 1024),
            feature_level,
            backend.name()
        );

        Ok(Self {
            backend,
            adapter,
            feature_level,
        })
    }

    #[must_use]
    pub fn backend(&self) -> &Rc<dyn Backend> {
        &self.backend
    }

    #[must_use]
    pub fn adapter(&self) -> &AdapterInfo {
        &self.adapter
    }

    #[must_use]
    pub fn feature_level(&self) -> FeatureLevel {
        self.feature_level
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        headless::{HeadlessBackend, HeadlessConfig},
        AdapterId,
    };

    fn context(config: HeadlessConfig, graphics: &GraphicsConfig) -> Result<DeviceContext> {
        DeviceContext::new(Rc::new(HeadlessBackend::new(config)), graphics)
    }

    #[test]
    fn skips_software_adapters() {
        let mut config = HeadlessConfig::default();
        config.adapters.reverse();

        let device = context(config, &GraphicsConfig::default()).unwrap();
        assert_eq!(device.adapter().name, "Headless GPU");
        assert_eq!(device.adapter().id, AdapterId(1));
        assert!(!device.adapter().is_software);
    }

    #[test]
    fn software_only_is_no_adapter() {
        let mut config = HeadlessConfig::default();
        config.adapters.retain(|adapter| adapter.is_software);

        assert!(matches!(
            context(config, &GraphicsConfig::default()),
            Err(Error::NoAdapter)
        ));
    }

    #[test]
    fn highest_supported_level_wins() {
        let device = context(HeadlessConfig::default(), &GraphicsConfig::default()).unwrap();
        assert_eq!(device.feature_level(), FeatureLevel::Level12_1);

        let graphics = GraphicsConfig {
            feature_levels: vec![FeatureLevel::Level12_0, FeatureLevel::Level12_2],
            ..GraphicsConfig::default()
        };
        let device = context(HeadlessConfig::default(), &graphics).unwrap();
        assert_eq!(device.feature_level(), FeatureLevel::Level12_0);
    }

    #[test]
    fn no_supported_level_is_fatal() {
        let config = HeadlessConfig {
            feature_levels: vec![],
            ..HeadlessConfig::default()
        };

        let error = context(config, &GraphicsConfig::default()).err().unwrap();
        assert!(matches!(error, Error::DeviceCreation { ref adapter } if adapter == "Headless GPU"));
        assert!(!error.is_recoverable());
    }
}
