#![forbid(unsafe_code)]

//! # persona-survey
//!
//! Runs questionnaires against language models that impersonate personas,
//! many times over, and keeps every answer sheet on disk.
//!
//! Each (persona, model) pair is a configuration with its own directory of
//! samples. The survey pipeline asks every question once per pass, extracts
//! an answer from the reply, writes the pass as one JSON file and repeats
//! until the configuration holds its quota. The directory is the only
//! progress record, so re-running a survey fills in what is missing and
//! nothing more. The `report` module turns a finished store into tables.

pub mod config;
pub mod extract;
pub mod gateway;
pub mod inference;
pub mod persona;
pub mod prompts;
pub mod questionnaire;
pub mod report;
pub mod store;
pub mod survey;

pub use config::{BackendSpec, ConfigError, SurveyRunConfig};
pub use extract::extract_numeric_answer;
pub use gateway::{Attribution, ChatGateway, ProviderGateway, UsageSink};
pub use inference::{
    AnswerFailure, AnswerOutcome, AnswerStrategy, ConstrainedInferenceClient, InferenceClient,
    InferenceError, ObservationFlag, TextInferenceClient,
};
pub use persona::{ModelDescriptor, Persona, PersonaError};
pub use questionnaire::{AnswerValue, Question, Questionnaire, QuestionnaireError, Scale, Segment};
pub use report::{write_reports, ReportError};
pub use store::{ConfigurationKey, Observation, Sample, SampleStore, StoreError};
pub use survey::{
    ConfigurationState, ObserverError, QuotaPolicy, SurveyConfig, SurveyError, SurveyEvent,
    SurveyObserver, SurveyPipeline, SurveyRunSummary,
};
