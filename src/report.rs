//! Post-run aggregation of the sample store.
//!
//! Collates every stored sample into a long table (numeric responses only),
//! aggregates per (model, persona, dimension), summarizes answer variance per
//! model and, given human reference norms, scores each configuration by its
//! mean absolute distance to each reference group.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::info;

use crate::persona::model_name;
use crate::store::{Sample, SampleStore, StoreError};

pub const LONG_CSV: &str = "dataset.long.csv";
pub const AGG_DIM_CSV: &str = "dataset.agg_dim.csv";
pub const VARIANCE_REPORT: &str = "survey.report.txt";
pub const CROSS_EVALUATION_CSV: &str = "cross_evaluation.csv";

/// Attention-check dimension, excluded from cross-evaluation.
pub const CATCH_DIMENSION: &str = "catch";

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid reference file {path}: {source}")]
    Reference {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

// =============================================================================
// Long table
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LongRow {
    /// Model name (id without its version suffix).
    pub model: String,
    pub persona: String,
    pub segment: String,
    pub id: i64,
    pub dimension: String,
    pub response: f64,
}

#[derive(Debug, Clone, Default)]
pub struct SurveyDataset {
    rows: Vec<LongRow>,
    samples: usize,
}

impl SurveyDataset {
    pub fn from_store(store: &SampleStore) -> Result<Self, ReportError> {
        let mut samples = Vec::new();
        for path in store.list_all()? {
            samples.push(store.read(&path)?);
        }
        Ok(Self::from_samples(samples))
    }

    /// Observations without a numeric response are dropped.
    pub fn from_samples(samples: impl IntoIterator<Item = Sample>) -> Self {
        let mut rows = Vec::new();
        let mut count = 0;
        for sample in samples {
            count += 1;
            for obs in sample.observations {
                let Some(response) = obs.response.as_ref().and_then(|r| r.as_f64()) else {
                    continue;
                };
                rows.push(LongRow {
                    model: model_name(&obs.model).to_string(),
                    persona: obs.persona,
                    segment: obs.segment,
                    id: obs.id,
                    dimension: obs.dimension,
                    response,
                });
            }
        }
        rows.sort_by(|a, b| {
            (&a.segment, a.id, &a.model, &a.persona).cmp(&(&b.segment, b.id, &b.model, &b.persona))
        });
        Self {
            rows,
            samples: count,
        }
    }

    pub fn rows(&self) -> &[LongRow] {
        &self.rows
    }

    pub fn sample_count(&self) -> usize {
        self.samples
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Mean and sample variance per (model, persona, dimension).
    pub fn aggregate_by_dimension(&self) -> Vec<DimensionAggregate> {
        let mut groups: BTreeMap<(&str, &str, &str), Vec<f64>> = BTreeMap::new();
        for row in &self.rows {
            groups
                .entry((row.model.as_str(), row.persona.as_str(), row.dimension.as_str()))
                .or_default()
                .push(row.response);
        }
        groups
            .into_iter()
            .map(|((model, persona, dimension), values)| DimensionAggregate {
                model: model.to_string(),
                persona: persona.to_string(),
                dimension: dimension.to_string(),
                n: values.len(),
                mean: mean(&values),
                var: sample_variance(&values),
            })
            .collect()
    }

    /// Sample variance of every (segment, question, model, persona) item.
    pub fn item_variances(&self) -> Vec<ItemVariance> {
        let mut groups: BTreeMap<(&str, i64, &str, &str), Vec<f64>> = BTreeMap::new();
        for row in &self.rows {
            groups
                .entry((row.segment.as_str(), row.id, row.model.as_str(), row.persona.as_str()))
                .or_default()
                .push(row.response);
        }
        groups
            .into_iter()
            .map(|((segment, id, model, persona), values)| ItemVariance {
                segment: segment.to_string(),
                id,
                model: model.to_string(),
                persona: persona.to_string(),
                var: sample_variance(&values),
            })
            .collect()
    }
}

// =============================================================================
// Aggregates
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DimensionAggregate {
    pub model: String,
    pub persona: String,
    pub dimension: String,
    pub n: usize,
    pub mean: f64,
    /// `None` for a single observation.
    pub var: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemVariance {
    pub segment: String,
    pub id: i64,
    pub model: String,
    pub persona: String,
    pub var: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelVarianceSummary {
    pub model: String,
    /// Items whose answers never varied.
    pub zero_variance: usize,
    pub items: usize,
    pub mean_variance: Option<f64>,
    /// Items above the 90th variance percentile, highest first.
    pub top_decile: Vec<ItemVariance>,
}

pub fn variance_summary(dataset: &SurveyDataset) -> Vec<ModelVarianceSummary> {
    let mut by_model: BTreeMap<String, Vec<ItemVariance>> = BTreeMap::new();
    for item in dataset.item_variances() {
        by_model.entry(item.model.clone()).or_default().push(item);
    }

    by_model
        .into_iter()
        .map(|(model, items)| {
            let vars: Vec<f64> = items.iter().filter_map(|i| i.var).collect();
            let zero_variance = vars.iter().filter(|v| **v == 0.0).count();
            let mean_variance = (!vars.is_empty()).then(|| mean(&vars));
            let top_decile = match quantile(&vars, 0.9) {
                Some(q) => {
                    let mut top: Vec<ItemVariance> = items
                        .iter()
                        .filter(|i| i.var.is_some_and(|v| v > q))
                        .cloned()
                        .collect();
                    top.sort_by(|a, b| {
                        b.var
                            .partial_cmp(&a.var)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    });
                    top
                }
                None => Vec::new(),
            };
            ModelVarianceSummary {
                model,
                zero_variance,
                items: items.len(),
                mean_variance,
                top_decile,
            }
        })
        .collect()
}

pub fn render_variance_report(summaries: &[ModelVarianceSummary]) -> String {
    let mut out = String::new();
    for s in summaries {
        let _ = writeln!(out, "{:-^42}", s.model);
        let _ = writeln!(out, "answers w/o variance: {}/{}", s.zero_variance, s.items);
        match s.mean_variance {
            Some(v) => {
                let _ = writeln!(out, "mean variance: {v:.3}");
            }
            None => out.push_str("mean variance: n/a\n"),
        }
        out.push_str("answers with variance (10 decile):\n");
        for item in &s.top_decile {
            let _ = writeln!(
                out,
                "{}\t{}\t{}\t{:.3}",
                item.segment,
                item.id,
                item.persona,
                item.var.unwrap_or_default()
            );
        }
        out.push_str("\n\n");
    }
    out
}

// =============================================================================
// Cross-evaluation
// =============================================================================

/// Human norms: sample label → group → dimension → mean score.
pub type ReferenceNorms = BTreeMap<String, BTreeMap<String, BTreeMap<String, f64>>>;

pub fn load_reference(path: impl AsRef<Path>) -> Result<ReferenceNorms, ReportError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| ReportError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ReportError::Reference {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrossEvaluationRow {
    pub sample: String,
    pub group: String,
    pub model: String,
    pub persona: String,
    /// Mean absolute difference over the model's dimensions. `None` when the
    /// model lacks a dimension the reference group reports.
    pub value: Option<f64>,
}

pub fn cross_evaluate(
    aggregates: &[DimensionAggregate],
    reference: &ReferenceNorms,
) -> Vec<CrossEvaluationRow> {
    let mut configurations: BTreeMap<(&str, &str), BTreeMap<&str, f64>> = BTreeMap::new();
    for agg in aggregates {
        let dims = configurations
            .entry((agg.model.as_str(), agg.persona.as_str()))
            .or_default();
        if agg.dimension != CATCH_DIMENSION {
            dims.insert(agg.dimension.as_str(), agg.mean);
        }
    }

    let mut rows = Vec::new();
    for (sample, groups) in reference {
        for (group, human) in groups {
            for ((model, persona), dims) in &configurations {
                rows.push(CrossEvaluationRow {
                    sample: sample.clone(),
                    group: group.clone(),
                    model: model.to_string(),
                    persona: persona.to_string(),
                    value: distance(human, dims),
                });
            }
        }
    }
    rows
}

fn distance(human: &BTreeMap<String, f64>, model: &BTreeMap<&str, f64>) -> Option<f64> {
    if model.is_empty() {
        return None;
    }
    let mut total = 0.0;
    for (dimension, value) in human {
        if dimension == CATCH_DIMENSION {
            continue;
        }
        total += (value - model.get(dimension.as_str())?).abs();
    }
    Some(total / model.len() as f64)
}

// =============================================================================
// Output
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ReportSummary {
    pub samples: usize,
    pub rows: usize,
    pub files: Vec<PathBuf>,
}

/// Write every report for the store at `store` into `out_dir`.
pub fn write_reports(
    store: &SampleStore,
    out_dir: impl AsRef<Path>,
    reference: Option<&Path>,
) -> Result<ReportSummary, ReportError> {
    let out_dir = out_dir.as_ref();
    std::fs::create_dir_all(out_dir).map_err(|source| ReportError::Io {
        path: out_dir.to_path_buf(),
        source,
    })?;

    let dataset = SurveyDataset::from_store(store)?;
    let aggregates = dataset.aggregate_by_dimension();
    let mut files = Vec::new();

    files.push(write_file(out_dir.join(LONG_CSV), &long_csv(&dataset))?);
    files.push(write_file(out_dir.join(AGG_DIM_CSV), &aggregate_csv(&aggregates))?);
    files.push(write_file(
        out_dir.join(VARIANCE_REPORT),
        &render_variance_report(&variance_summary(&dataset)),
    )?);

    if let Some(path) = reference {
        let norms = load_reference(path)?;
        let rows = cross_evaluate(&aggregates, &norms);
        files.push(write_file(
            out_dir.join(CROSS_EVALUATION_CSV),
            &cross_evaluation_csv(&rows),
        )?);
    }

    info!(
        samples = dataset.sample_count(),
        rows = dataset.len(),
        out = %out_dir.display(),
        "reports written"
    );
    Ok(ReportSummary {
        samples: dataset.sample_count(),
        rows: dataset.len(),
        files,
    })
}

fn write_file(path: PathBuf, contents: &str) -> Result<PathBuf, ReportError> {
    std::fs::write(&path, contents).map_err(|source| ReportError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}

pub fn long_csv(dataset: &SurveyDataset) -> String {
    let mut out = String::from("segment,id,model,persona,dimension,response\n");
    for row in dataset.rows() {
        let _ = writeln!(
            out,
            "{},{},{},{},{},{}",
            csv_field(&row.segment),
            row.id,
            csv_field(&row.model),
            csv_field(&row.persona),
            csv_field(&row.dimension),
            row.response
        );
    }
    out
}

pub fn aggregate_csv(aggregates: &[DimensionAggregate]) -> String {
    let mut out = String::from("model,persona,dimension,n,mean,var\n");
    for agg in aggregates {
        let _ = writeln!(
            out,
            "{},{},{},{},{:.4},{}",
            csv_field(&agg.model),
            csv_field(&agg.persona),
            csv_field(&agg.dimension),
            agg.n,
            agg.mean,
            opt_number(agg.var)
        );
    }
    out
}

pub fn cross_evaluation_csv(rows: &[CrossEvaluationRow]) -> String {
    let mut out = String::from("sample,group,model,persona,value\n");
    for row in rows {
        let _ = writeln!(
            out,
            "{},{},{},{},{}",
            csv_field(&row.sample),
            csv_field(&row.group),
            csv_field(&row.model),
            csv_field(&row.persona),
            opt_number(row.value)
        );
    }
    out
}

fn opt_number(v: Option<f64>) -> String {
    v.map(|v| format!("{v:.4}")).unwrap_or_default()
}

fn csv_field(s: &str) -> String {
    if s.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

// =============================================================================
// Statistics
// =============================================================================

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Unbiased (n - 1) variance; `None` below two values.
fn sample_variance(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values);
    let ss: f64 = values.iter().map(|v| (v - m).powi(2)).sum();
    Some(ss / (values.len() - 1) as f64)
}

/// Linear-interpolated quantile, `q` in [0, 1].
fn quantile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64))
}
