mod config;
mod logging;
mod output;

use std::{process, sync::Arc};

use config::{CliConfig, OutputFormat};
use dispatch_core::{
    PipelineHandle, QueryPipeline, QueryResult, SharedQueryService, TokioTimeSource,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

enum Step {
    Line(std::io::Result<Option<String>>),
    Delivered(Option<QueryResult>),
}

#[tokio::main]
async fn main() {
    logging::init();

    let config = match CliConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Failed to load configuration: {err}");
            process::exit(1);
        }
    };

    let time = TokioTimeSource::shared();
    let service = match config.simulator(Arc::clone(&time)) {
        Ok(service) => Arc::new(service),
        Err(err) => {
            eprintln!("Failed to build simulated backend: {err}");
            process::exit(1);
        }
    };
    info!(
        output = ?config.output,
        reliability = ?config.sim_reliability,
        "autocomplete ready; type a term per line"
    );

    let handle = QueryPipeline::new(
        config.pipeline.clone(),
        Arc::clone(&service) as SharedQueryService,
        time,
    )
    .spawn();

    run(handle, config.output).await;
    info!(invocations = service.invocations(), "autocomplete finished");
}

/// Feed stdin lines into the pipeline and print results as they arrive.
async fn run(mut handle: PipelineHandle, format: OutputFormat) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let step = tokio::select! {
            line = lines.next_line() => Step::Line(line),
            delivered = handle.next_result() => Step::Delivered(delivered),
        };

        match step {
            Step::Line(Ok(Some(line))) => {
                if handle.submit(line).await.is_err() {
                    warn!("pipeline stopped accepting input");
                    break;
                }
            }
            Step::Line(Ok(None)) => break,
            Step::Line(Err(err)) => {
                error!(error = %err, "failed to read stdin");
                break;
            }
            Step::Delivered(Some(result)) => print_result(&result, format),
            Step::Delivered(None) => {
                warn!("pipeline stopped delivering results");
                return;
            }
        }
    }

    for result in handle.close().await {
        print_result(&result, format);
    }
}

fn print_result(result: &QueryResult, format: OutputFormat) {
    match output::render(result, format) {
        Ok(line) => println!("{line}"),
        Err(err) => error!(error = %err, term = %result.term, "failed to render result"),
    }
}
