use dotenv::dotenv;
use fin_report_extractor::*;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

// Usage: cargo run --example extract_workbook --features gemini -- <workbook> [config.json]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args().skip(1);
    let path = args
        .next()
        .ok_or_else(|| anyhow::anyhow!("usage: extract_workbook <workbook> [config.json]"))?;
    let config = match args.next() {
        Some(config_path) => PipelineConfig::from_json_file(config_path)?,
        None => PipelineConfig::default(),
    };

    let model = std::env::var("GEMINI_MODEL").unwrap_or_else(|_| DEFAULT_GEMINI_MODEL.to_string());
    let adapter = GeminiAdapter::from_env(model)?;
    let repository = Arc::new(InMemoryReportRepository::new());

    let (tx, mut rx) = tokio::sync::mpsc::channel(256);
    let pipeline = ReportPipeline::new(
        config,
        MetricSchema::default_financial(),
        Arc::new(adapter),
        repository.clone(),
    )?
    .with_progress(tx);

    let progress = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                ExtractionEvent::Starting { tables } => println!("📋 {} tables located", tables),
                ExtractionEvent::TableStarted { table } => println!("⏳ table {} started", table),
                ExtractionEvent::Retry { table, attempt, error } => {
                    println!("🔁 table {} retry {}: {}", table, attempt, error)
                }
                ExtractionEvent::CorrectionNeeded { table, reason } => {
                    println!("🩹 table {} needs repair: {}", table, reason)
                }
                ExtractionEvent::TableFinished { table, success } => {
                    println!("{} table {} finished", if success { "✅" } else { "❌" }, table)
                }
                ExtractionEvent::Finished => println!("🏁 all tables processed"),
            }
        }
    });

    // Ctrl-C cancels the run; finished tables are still reported.
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let bytes = std::fs::read(&path)?;
    let upload = UploadedFile::new(path.clone(), None, bytes);
    let report = pipeline.process_upload(&upload, &cancel).await?;
    drop(pipeline);
    let _ = progress.await;

    println!("\nStatus: {}", report.status);
    for candidate in report.candidates() {
        println!(
            "  {:<24} {:?} (previous {:?}) from {}!{} [confidence {:.2}]",
            candidate.field,
            candidate.value,
            candidate.previous,
            candidate.provenance.sheet_name,
            candidate.provenance.region.a1(),
            candidate.confidence
        );
    }
    for failure in report.failures() {
        if let TableOutcome::Failed { kind, reason } = &failure.outcome {
            println!(
                "  ⚠️  {}!{}: {} ({})",
                failure.sheet_name,
                failure.region.a1(),
                kind,
                reason
            );
        }
    }

    let stored = repository.get(report.upload_id).await?;
    println!("\nPersisted: {}", stored.is_some());
    std::fs::write("report.json", report.to_json()?)?;
    println!("💾 Saved report.json");

    Ok(())
}
