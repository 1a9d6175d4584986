use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use dkit::config::HttpConfig;
use dkit::dispatcher::Dispatcher;
use dkit::executor::Executor;
use dkit::types::job::Job;
use tracing::{error, info, warn, Level};

#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
struct Args {
    /// Per-request timeout in seconds.
    #[arg(short, long)]
    timeout: Option<u64>,
    /// Enables human-friendly logging.
    #[arg(short, long, default_value_t)]
    debug: bool,
    /// URLs to fetch concurrently.
    #[arg(required = true)]
    urls: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logging
    if args.debug {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .init();
    } else {
        tracing_subscriber::fmt().json().init();
    }

    match begin(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(error) => {
            error!(error = %format!("{error:#}"), "encountered runtime error");
            ExitCode::FAILURE
        },
    }
}

/// Fetches every URL, returning whether all of them got a response.
async fn begin(args: Args) -> Result<bool> {
    let executor = Executor::new(&HttpConfig {
        timeout_secs: args.timeout,
        user_agent: None,
    })
    .context("building HTTP client")?;

    let dispatcher = Dispatcher::with_callback(executor, |done| {
        match serde_json::to_string(done) {
            Ok(summary) => info!(%summary, "job done"),
            Err(error) => warn!(id = %done.id, %error, "job done"),
        }
    });

    let ids: Vec<_> = args
        .urls
        .into_iter()
        .map(|url| dispatcher.register_job(Job::get(url)))
        .collect();
    for &id in &ids {
        dispatcher.start_job(id);
    }
    dispatcher.wait_sync_for_jobs().await;

    // Shutting down first lets every completion callback run.
    let jobs: Vec<_> = ids
        .into_iter()
        .filter_map(|id| dispatcher.job(id).map(|handle| (id, handle)))
        .collect();
    dispatcher.shutdown().await;

    let mut all_ok = true;
    for (id, handle) in jobs {
        let job = handle.lock().await;

        match (job.status(), job.error()) {
            (Some(status), None) => println!(
                "{id}\t{}\t{} bytes\t{}",
                status.as_u16(),
                job.raw_response().map_or(0, |b| b.len()),
                job.url,
            ),
            (_, error) => {
                all_ok = false;
                println!(
                    "{id}\terror\t{}\t{}",
                    error.unwrap_or("no response"),
                    job.url
                );
            },
        }
    }

    Ok(all_ok)
}
