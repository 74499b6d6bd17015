use anyhow::{bail, Context, Result};
use colored::*;
use serde_json::Value;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use tokio::signal;
use tokio_util::sync::CancellationToken;

use crate::cli::Cli;
use crate::probes::ProbeRegistry;
use crate::types::{ExecutionContext, TestDefinition, TestResult, TestStatus};

/// A definitions file holds either one definition object or an array of them.
pub fn parse_definitions(raw: &str) -> Result<Vec<TestDefinition>> {
    let value: Value = serde_json::from_str(raw).context("definition file is not valid JSON")?;
    let defs = match value {
        Value::Array(_) => serde_json::from_value::<Vec<TestDefinition>>(value)?,
        Value::Object(_) => vec![serde_json::from_value::<TestDefinition>(value)?],
        _ => bail!("definition file must contain an object or an array of objects"),
    };
    Ok(defs)
}

pub fn load_definitions(path: &str) -> Result<Vec<TestDefinition>> {
    let raw = fs::read_to_string(path).with_context(|| format!("could not read {}", path))?;
    parse_definitions(&raw).with_context(|| format!("could not load definitions from {}", path))
}

/// Passwords only ever come from the environment, never from argv.
pub fn build_context(cli: &Cli) -> Result<Option<ExecutionContext>> {
    let password = match &cli.password_env {
        Some(var) => Some(std::env::var(var).with_context(|| format!("environment variable {} is not set", var))?),
        None => None,
    };
    if cli.username.is_none() && password.is_none() {
        return Ok(None);
    }
    Ok(Some(ExecutionContext { username: cli.username.clone(), password }))
}

pub fn write_json_file_atomic(path: &str, value: &serde_json::Value) -> Result<()> {
    let tmp = format!("{}.tmp", path);
    let f = File::create(&tmp)?;
    let mut w = BufWriter::new(f);
    serde_json::to_writer_pretty(&mut w, value)?;
    w.flush()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn print_result(r: &TestResult) {
    let status = match r.status {
        TestStatus::Pass => r.status.to_string().green(),
        TestStatus::Fail => r.status.to_string().red(),
        TestStatus::Skipped => r.status.to_string().yellow(),
    };
    println!("{} {} {}  {}", status, r.test_type.cyan(), r.display_name.bold(), r.human_summary);
    if let Some(err) = &r.error {
        println!("  {} [{}] {}", "error:".bold(), err.category, err.message);
    }
    if let Some(ev) = &r.evidence {
        for line in ev.to_display_text().lines() {
            println!("    {}", line);
        }
    }
}

/// Run every selected definition once, in file order. Returns how many failed.
pub async fn run(cli: Cli) -> Result<usize> {
    let mut defs = load_definitions(&cli.definition)?;
    if !cli.only.is_empty() {
        defs.retain(|d| cli.only.iter().any(|id| id == &d.id));
    }
    if defs.is_empty() {
        bail!("no test definitions selected");
    }
    let ctx = build_context(&cli)?;
    let registry = ProbeRegistry::default();

    let cancel = CancellationToken::new();
    {
        let c = cancel.clone();
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                eprintln!("Received interrupt, cancelling remaining probes...");
                c.cancel();
            }
        });
    }

    let mut results = Vec::with_capacity(defs.len());
    for def in &defs {
        let result = registry.execute(def, ctx.as_ref(), &cancel).await;
        if !cli.json {
            print_result(&result);
        }
        results.push(result);
    }

    let value = serde_json::to_value(&results)?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    if !cli.json_out.is_empty() {
        write_json_file_atomic(&cli.json_out, &value)
            .with_context(|| format!("could not write {}", cli.json_out))?;
    }

    let failed = results.iter().filter(|r| r.status == TestStatus::Fail).count();
    if !cli.json {
        println!(
            "{} passed, {} failed, {} skipped",
            results.iter().filter(|r| r.status == TestStatus::Pass).count(),
            failed,
            results.iter().filter(|r| r.status == TestStatus::Skipped).count()
        );
    }
    Ok(failed)
}
