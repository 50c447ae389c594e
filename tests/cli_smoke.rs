use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use persona_survey::questionnaire::AnswerValue;
use persona_survey::store::{ConfigurationKey, Observation, Sample, SampleStore};
use serde_json::json;
use tempfile::tempdir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const QUESTIONNAIRE: &str = r#"[{
    "label": "relevance",
    "task": "Rate how relevant each consideration is.",
    "questions": [
        {"id": 1, "content": "Whether someone suffered emotionally", "dimension": "care"},
        {"id": 2, "content": "Whether someone acted unfairly", "dimension": "fairness"}
    ],
    "scale": {"1": "not at all", "2": "slightly", "3": "somewhat", "4": "very", "5": "extremely"}
}]"#;

fn survey(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_survey"))
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap()
}

fn path_arg(p: &Path) -> &str {
    p.to_str().unwrap()
}

/// Questionnaire, two personas and a run file pointing at `url`.
fn write_inputs(root: &Path, url: &str, iterations: usize) -> std::path::PathBuf {
    fs::write(root.join("questionnaire.json"), QUESTIONNAIRE).unwrap();
    let personas = root.join("personas");
    fs::create_dir(&personas).unwrap();
    fs::write(
        personas.join("base.json"),
        r#"{"id": "base", "content": ""}"#,
    )
    .unwrap();
    fs::write(
        personas.join("liberal.json"),
        r#"{"id": "liberal", "content": "You are politically liberal."}"#,
    )
    .unwrap();

    let config = root.join("run.json");
    fs::write(
        &config,
        serde_json::to_string_pretty(&json!({
            "iterations": iterations,
            "questionnaire": "questionnaire.json",
            "personas": "personas",
            "models": ["llama3.1:8b-instruct-q6_K"],
            "export_path": "out",
            "backend": {"type": "endpoint", "url": url, "timeout_seconds": 5}
        }))
        .unwrap(),
    )
    .unwrap();
    config
}

fn stored_sample(persona: &str) -> Sample {
    Sample::new(vec![Observation {
        segment: "relevance".into(),
        id: 1,
        dimension: "care".into(),
        model: "llama3.1:8b-instruct-q6_K".into(),
        persona: persona.into(),
        response: Some(AnswerValue::Text("3".into())),
        flag: None,
    }])
}

#[test]
fn validate_reports_counts() {
    let dir = tempdir().unwrap();
    write_inputs(dir.path(), "http://127.0.0.1:9/api/chat", 1);

    let out = survey(&[
        "validate",
        "--questionnaire",
        path_arg(&dir.path().join("questionnaire.json")),
        "--personas",
        path_arg(&dir.path().join("personas")),
    ]);
    assert!(out.status.success());
    let stdout = String::from_utf8(out.stdout).unwrap();
    assert!(stdout.contains("questionnaire ok: 1 segments, 2 questions"));
    assert!(stdout.contains("personas ok: 2"));
}

#[test]
fn validate_rejects_broken_questionnaire() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("questionnaire.json");
    fs::write(&path, r#"[{"label": "x", "task": "t", "questions": [], "scale": {"1": "a"}}]"#)
        .unwrap();

    let out = survey(&["validate", "--questionnaire", path_arg(&path)]);
    assert!(!out.status.success());
}

#[test]
fn status_counts_existing_samples_without_calling_the_backend() {
    let dir = tempdir().unwrap();
    // Nothing listens on the discard port; a call would fail the run, not status.
    let config = write_inputs(dir.path(), "http://127.0.0.1:9/api/chat", 2);
    let store = SampleStore::new(dir.path().join("out"));
    store
        .write(
            &stored_sample("liberal"),
            &ConfigurationKey::new("liberal", "llama3.1-8b-instruct-q6_K"),
        )
        .unwrap();

    let out = survey(&["status", "--config", path_arg(&config)]);
    assert!(out.status.success());
    let stdout = String::from_utf8(out.stdout).unwrap();
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(
        lines,
        [
            "base/llama3.1-8b-instruct-q6_K\t0/2\tPending",
            "liberal/llama3.1-8b-instruct-q6_K\t1/2\tSampling",
        ]
    );
}

#[test]
fn report_aggregates_a_store() {
    let dir = tempdir().unwrap();
    let store = SampleStore::new(dir.path().join("samples"));
    let key = ConfigurationKey::new("base", "llama3.1-8b");
    store.write(&stored_sample("base"), &key).unwrap();
    store.write(&stored_sample("base"), &key).unwrap();
    let reports = dir.path().join("reports");

    let out = survey(&[
        "report",
        "--store",
        path_arg(store.root()),
        "--out",
        path_arg(&reports),
    ]);
    assert!(out.status.success());

    let summary: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(summary["samples"], 2);
    assert_eq!(summary["rows"], 2);
    let agg = fs::read_to_string(reports.join("dataset.agg_dim.csv")).unwrap();
    assert!(agg.contains("llama3.1:8b,base,care,2,3.0000,0.0000"));
}

#[tokio::test]
async fn run_samples_against_endpoint_and_writes_reports() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"response": "4"})))
        .expect(4)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let config = write_inputs(dir.path(), &format!("{}/api/chat", server.uri()), 1);
    let reports = dir.path().join("reports");

    let args = vec![
        "run".to_string(),
        "--config".into(),
        path_arg(&config).into(),
        "--report".into(),
        path_arg(&reports).into(),
    ];
    let out = tokio::task::spawn_blocking(move || {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        survey(&args)
    })
    .await
    .unwrap();
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let summary: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(summary["questions_asked"], 4);
    assert_eq!(summary["configurations"][0]["state"], "satisfied");
    assert_eq!(summary["configurations"][1]["key"]["persona_id"], "liberal");

    let store = SampleStore::new(dir.path().join("out"));
    assert_eq!(store.list_all().unwrap().len(), 2);
    assert!(reports.join("dataset.long.csv").is_file());
    assert!(reports.join("survey.report.txt").is_file());
}
