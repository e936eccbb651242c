//! Parses two CSV files and merges them by key, with implementations synthesized by a
//! local Ollama model (or DeepSeek when `DEEPSEEK_API_KEY` is set).
//!
//! Run with `cargo run --example csv_session --features llm`. The second run is served
//! entirely from `.lambdai/`.

use lambdai::llm::{Client, LlmBackend};
use lambdai::prelude::*;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

// ============================================================================
// Sample data
// ============================================================================

fn write_samples(dir: &Path) -> std::io::Result<(String, String)> {
    std::fs::create_dir_all(dir)?;
    let first = dir.join("1.csv");
    let second = dir.join("2.csv");
    std::fs::write(&first, "身份证号,姓名,年龄\n001,张三,20\n002,李四,21\n")?;
    std::fs::write(&second, "身份证号,专业\n001,数学\n002,物理\n")?;
    Ok((
        first.to_string_lossy().into_owned(),
        second.to_string_lossy().into_owned(),
    ))
}

async fn parse_csv(session: &Session, path: &str) -> Result<LambdaValue, ExecuteError> {
    session
        .call("parse csv file {fname}, return [header, rows]. Header is a list")
        .arg(path)
        .shape(shape!("tuple[list[str], list[list[str]]]"))
        .await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== lambdai CSV Session Example ===\n");

    let backend = LlmBackend::new(Client::from_env()).temperature(0.1);
    let engine = Engine::builder(Arc::new(backend))
        .config(EngineConfig::from_env())
        .file_traces()
        .build();
    let session = engine.session("csv-demo");

    let (first, second) = write_samples(Path::new("target/csv_demo"))?;

    // Same task, different file: the second call reuses the first implementation
    let one = parse_csv(&session, &first).await?;
    let two = parse_csv(&session, &second).await?;
    println!("1.csv -> {}", one);
    println!("2.csv -> {}", two);

    let merged = session
        .call(
            "merge tables {r1} and {r2} (headers {h1} and {h2}) on the key column '身份证号'. \
             The header is the union of both headers; return [header, row, row, ...]",
        )
        .arg(one[1].clone())
        .arg(two[1].clone())
        .arg(one[0].clone())
        .arg(two[0].clone())
        .shape(shape!("list[list[str]]"))
        .oracle(|f: &Callable| {
            let out = f.call(&[
                json!([["1", "a"]]),
                json!([["1", "b"]]),
                json!(["身份证号", "x"]),
                json!(["身份证号", "y"]),
            ]);
            matches!(out, Ok(rows) if rows.get(0).and_then(|h| h.as_array()).is_some_and(|h| h.len() == 3))
        })
        .await?;

    println!("\nmerged:");
    for row in merged.as_array().into_iter().flatten() {
        println!("  {}", row);
    }

    println!("\ncached implementations:");
    for entry in engine.entries() {
        println!("  {}  {:?}  {}", &entry.key[..12], entry.trust, entry.prompt);
    }

    session.close();
    Ok(())
}
