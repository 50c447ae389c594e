use std::fs;

use persona_survey::questionnaire::AnswerValue;
use persona_survey::report::{
    aggregate_csv, cross_evaluate, load_reference, render_variance_report, variance_summary,
    write_reports, ReportError, SurveyDataset, AGG_DIM_CSV, CROSS_EVALUATION_CSV, LONG_CSV,
    VARIANCE_REPORT,
};
use persona_survey::store::{ConfigurationKey, Observation, Sample, SampleStore};
use tempfile::tempdir;

const MODEL: &str = "llama3.1:8b-instruct-q6_K";

/// One pass over care (1), fairness (2) and the catch item (3).
fn pass(persona: &str, care: Option<&str>, fairness: &str, catch: &str) -> Sample {
    let obs = |id: i64, dimension: &str, response: Option<&str>| Observation {
        segment: "relevance".into(),
        id,
        dimension: dimension.into(),
        model: MODEL.into(),
        persona: persona.into(),
        response: response.map(|r| AnswerValue::Text(r.into())),
        flag: None,
    };
    Sample::new(vec![
        obs(1, "care", care),
        obs(2, "fairness", Some(fairness)),
        obs(3, "catch", Some(catch)),
    ])
}

fn dataset() -> SurveyDataset {
    SurveyDataset::from_samples(vec![
        pass("base", Some("4"), "3", "5"),
        pass("base", Some("2"), "3", "5"),
        pass("base", None, "3", "5"),
    ])
}

const REFERENCE: &str = r#"{
    "US": {
        "liberals": {"care": 3.5, "fairness": 3.0, "catch": 1.0},
        "conservatives": {"care": 3.0, "fairness": 3.0, "purity": 4.0}
    }
}"#;

#[test]
fn long_table_drops_null_responses_and_strips_model_version() {
    let data = dataset();
    assert_eq!(data.sample_count(), 3);
    assert_eq!(data.len(), 8);
    assert!(data.rows().iter().all(|r| r.model == "llama3.1:8b"));

    let ids: Vec<i64> = data.rows().iter().map(|r| r.id).collect();
    assert_eq!(ids, [1, 1, 2, 2, 2, 3, 3, 3]);
}

#[test]
fn aggregates_mean_and_sample_variance_per_dimension() {
    let aggregates = dataset().aggregate_by_dimension();
    let dims: Vec<&str> = aggregates.iter().map(|a| a.dimension.as_str()).collect();
    assert_eq!(dims, ["care", "catch", "fairness"]);

    let care = &aggregates[0];
    assert_eq!(care.n, 2);
    assert_eq!(care.mean, 3.0);
    assert_eq!(care.var, Some(2.0));

    let fairness = &aggregates[2];
    assert_eq!(fairness.n, 3);
    assert_eq!(fairness.var, Some(0.0));

    let csv = aggregate_csv(&aggregates);
    let mut lines = csv.lines();
    assert_eq!(lines.next(), Some("model,persona,dimension,n,mean,var"));
    assert_eq!(lines.next(), Some("llama3.1:8b,base,care,2,3.0000,2.0000"));
}

#[test]
fn single_observation_has_no_variance() {
    let data = SurveyDataset::from_samples(vec![pass("base", Some("4"), "3", "5")]);
    let aggregates = data.aggregate_by_dimension();
    assert!(aggregates.iter().all(|a| a.var.is_none()));
    assert!(aggregate_csv(&aggregates)
        .lines()
        .nth(1)
        .is_some_and(|l| l.ends_with("4.0000,")));
}

#[test]
fn variance_report_lists_constant_items_and_top_decile() {
    let summaries = variance_summary(&dataset());
    assert_eq!(summaries.len(), 1);

    let s = &summaries[0];
    assert_eq!(s.model, "llama3.1:8b");
    assert_eq!(s.items, 3);
    assert_eq!(s.zero_variance, 2);
    assert_eq!(s.top_decile.len(), 1);
    assert_eq!(s.top_decile[0].id, 1);

    let text = render_variance_report(&summaries);
    assert!(text.contains("llama3.1:8b"));
    assert!(text.contains("answers w/o variance: 2/3"));
    assert!(text.contains("mean variance: 0.667"));
    assert!(text.contains("answers with variance (10 decile):\nrelevance\t1\tbase\t2.000"));
}

#[test]
fn cross_evaluation_skips_catch_and_needs_every_reference_dimension() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("reference.json");
    fs::write(&path, REFERENCE).unwrap();
    let norms = load_reference(&path).unwrap();

    let rows = cross_evaluate(&dataset().aggregate_by_dimension(), &norms);
    assert_eq!(rows.len(), 2);

    assert_eq!(rows[0].group, "conservatives");
    assert_eq!(rows[0].value, None);

    assert_eq!(rows[1].sample, "US");
    assert_eq!(rows[1].group, "liberals");
    assert_eq!(rows[1].model, "llama3.1:8b");
    assert_eq!(rows[1].persona, "base");
    assert_eq!(rows[1].value, Some(0.25));
}

#[test]
fn malformed_reference_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("reference.json");
    fs::write(&path, r#"{"US": ["not", "a", "map"]}"#).unwrap();
    assert!(matches!(
        load_reference(&path),
        Err(ReportError::Reference { .. })
    ));
}

#[test]
fn write_reports_produces_every_table() {
    let store_dir = tempdir().unwrap();
    let out_dir = tempdir().unwrap();
    let store = SampleStore::new(store_dir.path());
    let key = ConfigurationKey::new("base", "llama3.1-8b");
    store.write(&pass("base", Some("4"), "3", "5"), &key).unwrap();
    store.write(&pass("base", Some("2"), "3", "5"), &key).unwrap();

    let reference = store_dir.path().join("reference.json");
    fs::write(&reference, REFERENCE).unwrap();

    let summary = write_reports(&store, out_dir.path(), Some(reference.as_path())).unwrap();
    assert_eq!(summary.samples, 2);
    assert_eq!(summary.rows, 6);
    assert_eq!(summary.files.len(), 4);

    for name in [LONG_CSV, AGG_DIM_CSV, VARIANCE_REPORT, CROSS_EVALUATION_CSV] {
        assert!(out_dir.path().join(name).is_file(), "{name} missing");
    }

    let long = fs::read_to_string(out_dir.path().join(LONG_CSV)).unwrap();
    assert_eq!(long.lines().count(), 7);
    assert!(long.starts_with("segment,id,model,persona,dimension,response\n"));
    assert!(long.contains("relevance,1,llama3.1:8b,base,care,4\n"));

    let cross = fs::read_to_string(out_dir.path().join(CROSS_EVALUATION_CSV)).unwrap();
    assert!(cross.contains("US,conservatives,llama3.1:8b,base,\n"));
    assert!(cross.contains("US,liberals,llama3.1:8b,base,0.2500\n"));
}

#[test]
fn write_reports_on_empty_store_writes_headers_only() {
    let root = tempdir().unwrap();
    let out = root.path().join("reports");
    let summary = write_reports(&SampleStore::new(root.path().join("empty")), &out, None).unwrap();

    assert_eq!(summary.samples, 0);
    assert_eq!(summary.files.len(), 3);
    let agg = fs::read_to_string(out.join(AGG_DIM_CSV)).unwrap();
    assert_eq!(agg, "model,persona,dimension,n,mean,var\n");
    assert!(!out.join(CROSS_EVALUATION_CSV).exists());
}

#[test]
fn vendor_prefixed_models_are_reported_separately() {
    let sample = |model: &str, response: &str| {
        Sample::new(vec![Observation {
            segment: "relevance".into(),
            id: 1,
            dimension: "care".into(),
            model: model.into(),
            persona: "base".into(),
            response: Some(AnswerValue::Text(response.into())),
            flag: None,
        }])
    };
    let data = SurveyDataset::from_samples(vec![
        sample("meta-llama/llama-3.1-8b-instruct", "2"),
        sample("meta-llama/llama-3.1-70b-instruct", "4"),
    ]);

    let aggregates = data.aggregate_by_dimension();
    let models: Vec<&str> = aggregates.iter().map(|a| a.model.as_str()).collect();
    assert_eq!(
        models,
        ["meta-llama/llama-3.1-70b-instruct", "meta-llama/llama-3.1-8b-instruct"]
    );
    assert_eq!(aggregates[0].mean, 4.0);
    assert_eq!(aggregates[1].mean, 2.0);
}
