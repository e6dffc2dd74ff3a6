use crate::errorhandler::ErrorHandlerConfig;
use crate::logger::LoggingLevel;
use crate::processor::threads::ThreadPoolConfig;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// Settings of a [`RoutingContext`](crate::context::RoutingContext).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub name: String,
    #[serde(alias = "messageHistory")]
    pub message_history: bool,
    #[serde(alias = "streamCaching")]
    pub stream_caching: bool,
    pub tracing: bool,
    #[serde(alias = "tracingLevel")]
    pub tracing_level: LoggingLevel,
    #[serde(alias = "structuredLogging")]
    pub structured_logging: bool,
    #[serde(alias = "producerCacheSize")]
    pub producer_cache_size: usize,
    #[serde(alias = "errorHandler")]
    pub error_handler: ErrorHandlerConfig,
    #[serde(alias = "threadPools")]
    pub thread_pools: Vec<ThreadPoolConfig>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            name: "idemio-route".to_string(),
            message_history: false,
            stream_caching: false,
            tracing: false,
            tracing_level: LoggingLevel::INFO,
            structured_logging: false,
            producer_cache_size: 100,
            error_handler: ErrorHandlerConfig::default(),
            thread_pools: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct Config<C> {
    config: C,
}

impl<C> Config<C>
where
    C: Default + DeserializeOwned,
{
    pub fn new(provider: impl ConfigProvider<C>) -> Result<Self, ConfigProviderError> {
        provider.load().map(|config| Config { config })
    }

    pub fn get(&self) -> &C {
        &self.config
    }

    pub fn get_mut(&mut self) -> &mut C {
        &mut self.config
    }

    pub fn into_inner(self) -> C {
        self.config
    }
}

pub trait ConfigProvider<C>
where
    C: Default + DeserializeOwned,
{
    fn load(&self) -> Result<C, ConfigProviderError>;
}

pub struct DefaultConfigProvider;

impl<C> ConfigProvider<C> for DefaultConfigProvider
where
    C: Default + DeserializeOwned,
{
    fn load(&self) -> Result<C, ConfigProviderError> {
        Ok(C::default())
    }
}

/// Reads a JSON document from `base_path/config_name`.
pub struct FileConfigProvider {
    pub base_path: String,
    pub config_name: String,
}

impl<C> ConfigProvider<C> for FileConfigProvider
where
    C: Default + DeserializeOwned,
{
    fn load(&self) -> Result<C, ConfigProviderError> {
        let config_path = Path::new(&self.base_path).join(&self.config_name);
        let file = File::open(&config_path).map_err(|e| {
            let msg = format!("Could not open config file {}: {}", config_path.display(), e);
            ConfigProviderError::load_error(msg)
        })?;
        serde_json::from_reader(file).map_err(|e| {
            let msg = format!("Could not parse config file {}: {}", config_path.display(), e);
            ConfigProviderError::load_error(msg)
        })
    }
}

pub struct ProgrammaticConfigProvider<C> {
    pub config: C,
}

impl<C> ConfigProvider<C> for ProgrammaticConfigProvider<C>
where
    C: Default + DeserializeOwned + Clone,
{
    fn load(&self) -> Result<C, ConfigProviderError> {
        Ok(self.config.clone())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigProviderError {
    #[error("Could not load config. {message}")]
    Load { message: String },
    #[error("Invalid config. {message}")]
    Invalid { message: String },
}

impl ConfigProviderError {
    #[inline]
    pub(crate) fn load_error(msg: impl Into<String>) -> Self {
        Self::Load {
            message: msg.into(),
        }
    }

    #[inline]
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid {
            message: msg.into(),
        }
    }
}
