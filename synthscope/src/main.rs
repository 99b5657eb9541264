// This file is an example runner for the `synthscope` library.
// The main library entry point is `src/lib.rs`.
//
// Usage:
//   synthscope analyze <image>
//   synthscope feedback <image> <real|synthetic>
//   synthscope retrain
//   synthscope reload
//   synthscope extract <dataset_root> [--train]

use std::path::PathBuf;

use anyhow::{Context, bail};
use synthscope::{Config, ExtractionOptions, ForensicPipeline, Label, logging};
use tokio_util::sync::CancellationToken;
use tracing::info;

const USAGE: &str = "usage: synthscope <analyze <image> | feedback <image> <real|synthetic> | retrain | reload | extract <dataset_root> [--train]>";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init()?;
    let config = Config::from_env().context("loading configuration")?;
    let pipeline = ForensicPipeline::from_config(config)?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        ["analyze", image] => {
            let bytes = std::fs::read(image).with_context(|| format!("reading {image}"))?;
            let report = pipeline.analyze(&bytes).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        ["feedback", image, label] => {
            let label: Label = label.parse()?;
            let bytes = std::fs::read(image).with_context(|| format!("reading {image}"))?;
            let receipt = pipeline.submit_feedback(&bytes, label).await?;
            println!("{}", serde_json::to_string_pretty(&receipt)?);
        }
        ["retrain"] => {
            let report = pipeline.retrain().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        ["reload"] => {
            let receipt = pipeline.reload_model().await?;
            println!("{}", serde_json::to_string_pretty(&receipt)?);
        }
        ["extract", root, rest @ ..] => {
            let train = match rest {
                [] => false,
                ["--train"] => true,
                _ => bail!(USAGE),
            };
            let batch = pipeline.batch_extractor(PathBuf::from(root));

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Interrupt received, checkpointing");
                    on_signal.cancel();
                }
            });

            let report = batch
                .run(ExtractionOptions {
                    cancel,
                    on_progress: None,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);

            if train && report.state == synthscope::BatchState::Done {
                let handle = batch.train(pipeline.model_manager()).await?;
                pipeline.reload_model().await?;
                println!("{}", serde_json::to_string_pretty(&handle)?);
            }
        }
        _ => bail!(USAGE),
    }
    Ok(())
}
