//! Survey execution: persona × model configurations sampled until each
//! partition holds its quota of samples.
//!
//! The loop is sequential and stateless between runs. Progress lives only in
//! the sample store, re-counted before every pass, so an interrupted run is
//! resumed by running it again.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::gateway::Attribution;
use crate::inference::{AnswerRequest, InferenceClient, InferenceError};
use crate::persona::{ensure_distinct_partitions, ModelDescriptor, Persona, PersonaError};
use crate::questionnaire::Questionnaire;
use crate::store::{ConfigurationKey, Observation, Sample, SampleStore, StoreError};

// =============================================================================
// Configuration
// =============================================================================

/// Which stored samples count toward the quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaPolicy {
    /// Every written sample counts, including ones with null responses.
    #[default]
    AllPasses,
    /// Only samples without a single null response count.
    CompletePasses,
}

#[derive(Debug, Clone)]
pub struct SurveyConfig {
    /// Target number of counted samples per configuration.
    pub iterations: usize,
    pub quota_policy: QuotaPolicy,
    /// Cap on passes per configuration within one run.
    pub max_passes: Option<usize>,
    pub run_id: Uuid,
}

impl SurveyConfig {
    pub fn new(iterations: usize) -> Self {
        Self {
            iterations,
            quota_policy: QuotaPolicy::default(),
            max_passes: None,
            run_id: Uuid::new_v4(),
        }
    }

    pub fn quota_policy(mut self, policy: QuotaPolicy) -> Self {
        self.quota_policy = policy;
        self
    }

    pub fn max_passes(mut self, max: usize) -> Self {
        self.max_passes = Some(max);
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SurveyError {
    #[error(transparent)]
    Persona(#[from] PersonaError),
    #[error("sample store failure: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
}

// =============================================================================
// Progress
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigurationState {
    /// No counted samples yet.
    Pending,
    /// Some counted samples, fewer than the quota.
    Sampling,
    Satisfied,
    /// Pass cap reached before the quota.
    Stopped,
}

impl ConfigurationState {
    fn from_count(counted: usize, iterations: usize) -> Self {
        if counted >= iterations {
            ConfigurationState::Satisfied
        } else if counted == 0 {
            ConfigurationState::Pending
        } else {
            ConfigurationState::Sampling
        }
    }
}

#[derive(Debug, Clone)]
pub enum SurveyEvent {
    ConfigurationStarted {
        key: ConfigurationKey,
        existing: usize,
        remaining: usize,
    },
    PassCompleted {
        key: ConfigurationKey,
        sample_id: Uuid,
        null_count: usize,
    },
    ConfigurationFinished {
        key: ConfigurationKey,
        state: ConfigurationState,
        count: usize,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ObserverError {
    #[error("{0}")]
    Message(String),
}

/// Progress hook. Failures are logged and never stop sampling.
#[async_trait::async_trait]
pub trait SurveyObserver: Send + Sync {
    async fn on_event(&self, event: SurveyEvent) -> Result<(), ObserverError>;
}

/// Outcome of one configuration within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigurationOutcome {
    pub key: ConfigurationKey,
    /// Counted samples before this run touched the configuration.
    pub existing: usize,
    pub passes: usize,
    /// Counted samples afterwards.
    pub count: usize,
    pub state: ConfigurationState,
}

#[derive(Debug, Clone, Serialize)]
pub struct SurveyRunSummary {
    pub run_id: Uuid,
    pub configurations: Vec<ConfigurationOutcome>,
    /// Questions put to the inference client. Gateway retries are not
    /// included; the usage sink tallies provider attempts.
    pub questions_asked: usize,
}

impl SurveyRunSummary {
    pub fn total_passes(&self) -> usize {
        self.configurations.iter().map(|c| c.passes).sum()
    }

    pub fn all_satisfied(&self) -> bool {
        self.configurations
            .iter()
            .all(|c| c.state == ConfigurationState::Satisfied)
    }
}

/// Store-only view of a configuration, used by `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigurationStatus {
    pub key: ConfigurationKey,
    /// All sample files in the partition.
    pub stored: usize,
    /// Samples that count under the active quota policy.
    pub counted: usize,
    pub state: ConfigurationState,
}

// =============================================================================
// Pipeline
// =============================================================================

pub struct SurveyPipeline {
    questionnaire: Questionnaire,
    personas: Vec<Persona>,
    models: Vec<ModelDescriptor>,
    client: Arc<dyn InferenceClient>,
    store: SampleStore,
    config: SurveyConfig,
    observer: Option<Arc<dyn SurveyObserver>>,
}

impl SurveyPipeline {
    /// Fails when two models share a partition directory.
    pub fn new(
        questionnaire: Questionnaire,
        personas: Vec<Persona>,
        models: Vec<ModelDescriptor>,
        client: Arc<dyn InferenceClient>,
        store: SampleStore,
        config: SurveyConfig,
    ) -> Result<Self, SurveyError> {
        ensure_distinct_partitions(&models)?;
        Ok(Self {
            questionnaire,
            personas,
            models,
            client,
            store,
            config,
            observer: None,
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn SurveyObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn store(&self) -> &SampleStore {
        &self.store
    }

    /// Configuration keys in traversal order: persona-major, then model.
    pub fn configurations(&self) -> Vec<ConfigurationKey> {
        self.pairs()
            .map(|(p, m)| ConfigurationKey::for_pair(p, m))
            .collect()
    }

    /// Sample every configuration up to its quota.
    pub async fn run(&self) -> Result<SurveyRunSummary, SurveyError> {
        info!(
            run_id = %self.config.run_id,
            personas = self.personas.len(),
            models = self.models.len(),
            iterations = self.config.iterations,
            questions = self.questionnaire.len(),
            "starting survey"
        );

        let mut configurations = Vec::new();
        for (persona, model) in self.pairs() {
            let outcome = match self.process_configuration(persona, model).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    error!(
                        configuration = %ConfigurationKey::for_pair(persona, model),
                        error = %err,
                        "survey aborted"
                    );
                    return Err(err);
                }
            };
            configurations.push(outcome);
        }

        let summary = SurveyRunSummary {
            run_id: self.config.run_id,
            questions_asked: configurations.iter().map(|c| c.passes).sum::<usize>()
                * self.questionnaire.len(),
            configurations,
        };
        info!(
            run_id = %summary.run_id,
            passes = summary.total_passes(),
            questions = summary.questions_asked,
            "survey finished"
        );
        Ok(summary)
    }

    /// Current progress of every configuration, read from the store only.
    pub fn status(&self) -> Result<Vec<ConfigurationStatus>, SurveyError> {
        Ok(configuration_status(
            &self.store,
            &self.personas,
            &self.models,
            &self.config,
        )?)
    }

    /// Sample one configuration until its quota (or the pass cap) is reached.
    pub async fn process_configuration(
        &self,
        persona: &Persona,
        model: &ModelDescriptor,
    ) -> Result<ConfigurationOutcome, SurveyError> {
        let key = ConfigurationKey::for_pair(persona, model);
        self.store.ensure_partition(&key)?;

        let iterations = self.config.iterations;
        let existing = self.quota_count(&key)?;
        let remaining = iterations.saturating_sub(existing);
        info!(configuration = %key, existing, remaining, "configuration started");
        self.emit(SurveyEvent::ConfigurationStarted {
            key: key.clone(),
            existing,
            remaining,
        })
        .await;

        let mut passes = 0;
        let mut count = existing;
        let state = loop {
            if count >= iterations {
                break ConfigurationState::Satisfied;
            }
            if let Some(max) = self.config.max_passes {
                if passes >= max {
                    warn!(
                        configuration = %key,
                        passes,
                        count,
                        iterations,
                        "pass cap reached before quota"
                    );
                    break ConfigurationState::Stopped;
                }
            }

            let sample = self.run_one_pass(persona, model).await?;
            let sample_id = self.store.write(&sample, &key)?;
            passes += 1;
            let null_count = sample.null_count();
            debug!(configuration = %key, %sample_id, null_count, "pass written");
            self.emit(SurveyEvent::PassCompleted {
                key: key.clone(),
                sample_id,
                null_count,
            })
            .await;

            count = self.quota_count(&key)?;
        };

        info!(configuration = %key, count, ?state, "configuration finished");
        self.emit(SurveyEvent::ConfigurationFinished {
            key: key.clone(),
            state,
            count,
        })
        .await;

        Ok(ConfigurationOutcome {
            key,
            existing,
            passes,
            count,
            state,
        })
    }

    /// One traversal of the questionnaire: one inference call per question,
    /// one observation per question, in segment-then-question order.
    pub async fn run_one_pass(
        &self,
        persona: &Persona,
        model: &ModelDescriptor,
    ) -> Result<Sample, SurveyError> {
        let key = ConfigurationKey::for_pair(persona, model);
        let mut observations = Vec::with_capacity(self.questionnaire.len());

        for (segment, question) in self.questionnaire.items() {
            let attribution = Attribution::new("survey::pass")
                .with_run(self.config.run_id)
                .with_configuration(key.to_string());
            let req = AnswerRequest {
                persona,
                model,
                segment,
                question,
            };
            let outcome = self.client.answer(req, attribution).await?;

            observations.push(Observation {
                segment: segment.label.clone(),
                id: question.id,
                dimension: question.dimension.clone(),
                model: model.id().to_string(),
                persona: persona.id.clone(),
                response: outcome.response().cloned(),
                flag: outcome.flag(),
            });
        }

        Ok(Sample::new(observations))
    }

    fn pairs(&self) -> impl Iterator<Item = (&Persona, &ModelDescriptor)> {
        self.personas
            .iter()
            .flat_map(move |p| self.models.iter().map(move |m| (p, m)))
    }

    fn quota_count(&self, key: &ConfigurationKey) -> Result<usize, StoreError> {
        quota_count(&self.store, key, self.config.quota_policy)
    }

    async fn emit(&self, event: SurveyEvent) {
        if let Some(observer) = &self.observer {
            if let Err(e) = observer.on_event(event).await {
                warn!(error = %e, "survey observer failed");
            }
        }
    }
}

fn quota_count(
    store: &SampleStore,
    key: &ConfigurationKey,
    policy: QuotaPolicy,
) -> Result<usize, StoreError> {
    match policy {
        QuotaPolicy::AllPasses => store.count(key),
        QuotaPolicy::CompletePasses => store.count_complete(key),
    }
}

/// Progress of every persona × model configuration, without a client.
pub fn configuration_status(
    store: &SampleStore,
    personas: &[Persona],
    models: &[ModelDescriptor],
    config: &SurveyConfig,
) -> Result<Vec<ConfigurationStatus>, StoreError> {
    let mut statuses = Vec::with_capacity(personas.len() * models.len());
    for persona in personas {
        for model in models {
            let key = ConfigurationKey::for_pair(persona, model);
            let stored = store.count(&key)?;
            let counted = quota_count(store, &key, config.quota_policy)?;
            statuses.push(ConfigurationStatus {
                state: ConfigurationState::from_count(counted, config.iterations),
                key,
                stored,
                counted,
            });
        }
    }
    Ok(statuses)
}
