// tests/cli_run.rs
mod common;

use common::{spawn_ws_server, WsBehavior};
use rustlite_probe::cli::Cli;
use serde_json::{json, Value};
use std::fs;

#[tokio::test]
async fn runs_definitions_file_and_writes_results() {
    let addr = spawn_ws_server(WsBehavior::Echo).await;
    let dir = tempfile::tempdir().unwrap();
    let defs = json!([
        {
            "id": "echo",
            "type": "websocket",
            "displayName": "Echo",
            "parameters": { "url": format!("ws://127.0.0.1:{}/", addr.port()), "message": "hi", "expectedResponse": "hi" }
        },
        {
            "id": "bad",
            "type": "websocket",
            "displayName": "Wrong reply",
            "parameters": { "url": format!("ws://127.0.0.1:{}/", addr.port()), "message": "hi", "expectedResponse": "bye" }
        },
        {
            "id": "skipped-by-filter",
            "type": "tls-certificate",
            "displayName": "Not selected",
            "parameters": { "host": "127.0.0.1", "port": 1 }
        }
    ]);
    let def_path = dir.path().join("defs.json");
    fs::write(&def_path, serde_json::to_string(&defs).unwrap()).unwrap();
    let out_path = dir.path().join("results.json");

    let cli = Cli {
        definition: def_path.to_str().unwrap().to_string(),
        only: vec!["echo".into(), "bad".into()],
        json: true,
        json_out: out_path.to_str().unwrap().to_string(),
        ..Default::default()
    };
    let failed = rustlite_probe::run(cli).await.unwrap();
    assert_eq!(failed, 1);

    let results: Value = serde_json::from_str(&fs::read_to_string(&out_path).unwrap()).unwrap();
    let results = results.as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["testId"], "echo");
    assert_eq!(results[0]["status"], "Pass");
    assert_eq!(results[1]["status"], "Fail");
    assert_eq!(results[1]["error"]["category"], "Validation");
}

#[tokio::test]
async fn unknown_filter_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let def_path = dir.path().join("one.json");
    let one = json!({"id": "a", "type": "websocket", "displayName": "A", "parameters": {"url": "ws://127.0.0.1:1/"}});
    fs::write(&def_path, one.to_string()).unwrap();

    let cli = Cli {
        definition: def_path.to_str().unwrap().to_string(),
        only: vec!["nope".into()],
        ..Default::default()
    };
    assert!(rustlite_probe::run(cli).await.is_err());
}
