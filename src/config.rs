//! Run configuration file and the wiring it drives.
//!
//! A run file names the questionnaire, the persona directory, the model ids,
//! the export root and the backend. Relative paths are resolved against the
//! directory containing the run file. Credentials stay in the environment.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::gateway::{
    ChatGateway, GatewayConfig, ProviderError, ProviderGateway, ProviderKind, UsageSink,
};
use crate::inference::{client_for, AnswerStrategy, ClientOptions, DEFAULT_TEMPERATURE};
use crate::persona::{model_descriptors, ModelDescriptor, Persona, PersonaError};
use crate::questionnaire::{Questionnaire, QuestionnaireError};
use crate::store::SampleStore;
use crate::survey::{
    configuration_status, ConfigurationStatus, QuotaPolicy, SurveyConfig, SurveyError,
    SurveyPipeline,
};

const DEFAULT_ENDPOINT_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read run config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid run config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid run config: {0}")]
    Invalid(String),
    #[error(transparent)]
    Questionnaire(#[from] QuestionnaireError),
    #[error(transparent)]
    Persona(#[from] PersonaError),
    #[error("failed to build gateway: {0}")]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Survey(#[from] SurveyError),
}

/// Where inference requests go.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendSpec {
    /// OpenRouter, configured from `OPENROUTER_*` environment variables.
    #[serde(rename = "openrouter")]
    OpenRouter,
    /// Self-hosted `{model, messages} -> {response}` endpoint.
    Endpoint {
        url: String,
        #[serde(default = "default_endpoint_timeout")]
        timeout_seconds: u64,
    },
}

impl BackendSpec {
    pub fn provider_kind(&self) -> ProviderKind {
        match self {
            BackendSpec::OpenRouter => ProviderKind::OpenRouter,
            BackendSpec::Endpoint { .. } => ProviderKind::Endpoint,
        }
    }
}

fn default_endpoint_timeout() -> u64 {
    DEFAULT_ENDPOINT_TIMEOUT_SECS
}

fn default_temperature() -> f32 {
    DEFAULT_TEMPERATURE
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurveyRunConfig {
    pub iterations: usize,
    pub questionnaire: PathBuf,
    /// Directory of persona files.
    pub personas: PathBuf,
    pub models: Vec<String>,
    pub export_path: PathBuf,
    #[serde(default)]
    pub quota_policy: QuotaPolicy,
    #[serde(default)]
    pub max_passes: Option<usize>,
    #[serde(default)]
    pub strategy: AnswerStrategy,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Gateway retries per call for retryable failures.
    #[serde(default)]
    pub max_retries: u32,
    pub backend: BackendSpec,
}

/// Everything loaded from disk before the first call is made.
#[derive(Debug, Clone)]
pub struct SurveyInputs {
    pub questionnaire: Questionnaire,
    pub personas: Vec<Persona>,
    pub models: Vec<ModelDescriptor>,
}

impl SurveyRunConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: SurveyRunConfig =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        config.validate()?;
        Ok(config)
    }

    /// Make relative paths relative to `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        for p in [
            &mut self.questionnaire,
            &mut self.personas,
            &mut self.export_path,
        ] {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.models.is_empty() {
            return Err(ConfigError::Invalid("models must not be empty".into()));
        }
        if self.max_passes == Some(0) {
            return Err(ConfigError::Invalid("max_passes must be at least 1".into()));
        }
        if self.quota_policy == QuotaPolicy::CompletePasses && self.max_passes.is_none() {
            return Err(ConfigError::Invalid(
                "quota_policy complete_passes requires max_passes".into(),
            ));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::Invalid(format!(
                "temperature {} outside 0.0..=2.0",
                self.temperature
            )));
        }
        if let BackendSpec::Endpoint { url, .. } = &self.backend {
            if url.trim().is_empty() {
                return Err(ConfigError::Invalid("endpoint url must not be empty".into()));
            }
        }
        Ok(())
    }

    pub fn load_inputs(&self) -> Result<SurveyInputs, ConfigError> {
        Ok(SurveyInputs {
            questionnaire: Questionnaire::from_path(&self.questionnaire)?,
            personas: Persona::from_directory(&self.personas)?,
            models: model_descriptors(self.models.iter().cloned())?,
        })
    }

    pub fn store(&self) -> SampleStore {
        SampleStore::new(&self.export_path)
    }

    pub fn survey_config(&self) -> SurveyConfig {
        let config = SurveyConfig::new(self.iterations).quota_policy(self.quota_policy);
        match self.max_passes {
            Some(max) => config.max_passes(max),
            None => config,
        }
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            provider: self.backend.provider_kind(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            max_retries: self.max_retries,
            ..GatewayConfig::default()
        }
    }

    pub fn build_gateway<U: UsageSink + 'static>(
        &self,
        usage_sink: Arc<U>,
    ) -> Result<Arc<dyn ChatGateway>, ConfigError> {
        let config = self.gateway_config();
        let gateway: Arc<dyn ChatGateway> = match &self.backend {
            BackendSpec::OpenRouter => {
                Arc::new(ProviderGateway::openrouter_from_env(usage_sink, config)?)
            }
            BackendSpec::Endpoint {
                url,
                timeout_seconds,
            } => Arc::new(ProviderGateway::endpoint(
                url.clone(),
                Duration::from_secs(*timeout_seconds),
                usage_sink,
                config,
            )?),
        };
        Ok(gateway)
    }

    /// Stored progress per configuration. Loads inputs but builds no client.
    pub fn status(&self) -> Result<Vec<ConfigurationStatus>, ConfigError> {
        let inputs = self.load_inputs()?;
        configuration_status(
            &self.store(),
            &inputs.personas,
            &inputs.models,
            &self.survey_config(),
        )
        .map_err(|e| ConfigError::Survey(SurveyError::Store(e)))
    }

    /// Load inputs and assemble the pipeline over `gateway`.
    pub fn build_pipeline(
        &self,
        gateway: Arc<dyn ChatGateway>,
    ) -> Result<SurveyPipeline, ConfigError> {
        let inputs = self.load_inputs()?;
        let client = client_for(self.strategy, gateway, self.client_options());
        Ok(SurveyPipeline::new(
            inputs.questionnaire,
            inputs.personas,
            inputs.models,
            client,
            self.store(),
            self.survey_config(),
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "iterations": 3,
        "questionnaire": "questionnaire.json",
        "personas": "personas",
        "models": ["llama3.1:8b"],
        "export_path": "/data/out",
        "backend": {"type": "endpoint", "url": "http://localhost:11434/api/chat"}
    }"#;

    #[test]
    fn defaults_apply_to_minimal_config() {
        let config: SurveyRunConfig = serde_json::from_str(MINIMAL).unwrap();
        assert_eq!(config.quota_policy, QuotaPolicy::AllPasses);
        assert_eq!(config.strategy, AnswerStrategy::Text);
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.temperature, DEFAULT_TEMPERATURE);
        assert_eq!(
            config.backend,
            BackendSpec::Endpoint {
                url: "http://localhost:11434/api/chat".into(),
                timeout_seconds: DEFAULT_ENDPOINT_TIMEOUT_SECS,
            }
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn relative_paths_resolve_against_config_dir() {
        let mut config: SurveyRunConfig = serde_json::from_str(MINIMAL).unwrap();
        config.resolve_paths(Path::new("/runs/mfq"));
        assert_eq!(config.questionnaire, PathBuf::from("/runs/mfq/questionnaire.json"));
        assert_eq!(config.personas, PathBuf::from("/runs/mfq/personas"));
        assert_eq!(config.export_path, PathBuf::from("/data/out"));
    }

    #[test]
    fn rejects_empty_model_list_and_zero_pass_cap() {
        let mut config: SurveyRunConfig = serde_json::from_str(MINIMAL).unwrap();
        config.max_passes = Some(0);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.max_passes = None;
        config.models.clear();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn complete_passes_requires_a_pass_cap() {
        let mut config: SurveyRunConfig = serde_json::from_str(MINIMAL).unwrap();
        config.quota_policy = QuotaPolicy::CompletePasses;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.max_passes = Some(10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn openrouter_backend_parses_from_tag() {
        let spec: BackendSpec = serde_json::from_str(r#"{"type": "openrouter"}"#).unwrap();
        assert_eq!(spec.provider_kind(), ProviderKind::OpenRouter);
    }
}
