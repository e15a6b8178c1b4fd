//! CLI command handling
//!
//! Resolves the requested features, runs them one after another and
//! reports each outcome on stdout and to the summary sink.

pub mod tls;

use std::sync::Arc;

use colored::Colorize;
use reqwest::Url;

use crate::commands::{Commands, RunArgs, LOOPBACK_SERVER};
use crate::common::{Config, Error, Result};
use crate::features;
use crate::harness::{run_feature, Outcome, PreparedFeature, SummaryEntry, SummarySink};
use crate::sdk::Sdk;
use crate::testing::LoopbackSdk;

/// Dispatch a CLI command
pub async fn dispatch(command: Commands) -> Result<()> {
    match command {
        Commands::Run(args) => run(args).await,

        Commands::List => {
            for feature in features::all() {
                println!("{}", feature.dir);
            }
            Ok(())
        }
    }
}

/// A feature to run and the task queue it runs on
#[derive(Debug, Clone)]
pub struct FeatureSpec {
    pub prepared: &'static PreparedFeature,
    pub task_queue: String,
}

/// Resolve `<dir>[:<task-queue>]` arguments against the registry
///
/// An empty list selects every registered feature. Features without an
/// explicit task queue get one derived from their directory and `run_id`.
pub fn resolve_features(args: &[String], run_id: &str) -> Result<Vec<FeatureSpec>> {
    let requested: Vec<(String, Option<String>)> = if args.is_empty() {
        features::all()
            .iter()
            .map(|f| (f.dir.to_string(), None))
            .collect()
    } else {
        args.iter()
            .map(|arg| match arg.split_once(':') {
                Some((dir, queue)) if !queue.is_empty() => (dir.to_string(), Some(queue.to_string())),
                Some((dir, _)) => (dir.to_string(), None),
                None => (arg.clone(), None),
            })
            .collect()
    };

    requested
        .into_iter()
        .map(|(dir, task_queue)| {
            let prepared =
                features::find(&dir).ok_or_else(|| Error::FeatureNotFound(dir.clone()))?;
            let task_queue = task_queue
                .unwrap_or_else(|| format!("features-{}-{}", dir.replace('/', "-"), run_id));
            Ok(FeatureSpec {
                prepared,
                task_queue,
            })
        })
        .collect()
}

/// Pick the SDK for a server target
fn sdk_for(server: &str) -> Result<Arc<dyn Sdk>> {
    if server == LOOPBACK_SERVER {
        return Ok(Arc::new(LoopbackSdk::new()));
    }
    Err(Error::Config(format!(
        "no SDK transport is available for server {}, use --server {}",
        server, LOOPBACK_SERVER
    )))
}

fn base_config(args: &RunArgs) -> Result<Config> {
    let tls = tls::load(args.client_cert_path.as_deref(), args.client_key_path.as_deref())?;
    let proxy_control = args
        .proxy_control_uri
        .as_deref()
        .map(|uri| {
            Url::parse(uri)
                .map_err(|e| Error::Config(format!("Invalid proxy control URI '{}': {}", uri, e)))
        })
        .transpose()?;

    let mut config = Config::new(&args.server, &args.namespace, "")
        .with_tls(tls)
        .with_proxy_control(proxy_control)
        .with_fixtures_dir(&args.fixtures_dir)
        .with_generate_history(args.generate_history);
    if let Some(direct) = &args.direct_server {
        config = config.with_direct_server(direct);
    }
    Ok(config)
}

/// Run features and report; fails when any feature failed
pub async fn run(args: RunArgs) -> Result<()> {
    let run_id = std::process::id().to_string();
    let specs = resolve_features(&args.features, &run_id)?;
    let base = base_config(&args)?;
    let sdk = sdk_for(&args.server)?;
    tracing::info!(
        sdk = sdk.name(),
        version = %sdk.version(),
        features = specs.len(),
        "Running features"
    );

    let mut summary = match &args.summary_uri {
        Some(uri) => Some(SummarySink::connect(uri).await?),
        None => None,
    };

    let mut failed = 0usize;
    for spec in &specs {
        let config = base.for_task_queue(&spec.task_queue);
        let outcome = run_feature(Arc::clone(&sdk), config, spec.prepared).await;
        print_outcome(spec.prepared.dir, &outcome);
        if outcome.is_failed() {
            failed += 1;
        }

        if let Some(sink) = summary.as_mut() {
            if let Err(e) = sink.write(&SummaryEntry::new(spec.prepared.dir, &outcome)).await {
                tracing::warn!("Failed to write summary entry: {}", e);
            }
        }
    }

    if let Some(sink) = summary {
        sink.close().await?;
    }

    println!();
    if failed == 0 {
        println!("{} {} feature(s) ran", "✓".green().bold(), specs.len());
        Ok(())
    } else {
        println!(
            "{} {} of {} feature(s) failed",
            "✗".red().bold(),
            failed,
            specs.len()
        );
        Err(Error::FeaturesFailed(failed))
    }
}

fn print_outcome(dir: &str, outcome: &Outcome) {
    match outcome {
        Outcome::Passed => println!("  {} {}", "✓".green(), dir),
        Outcome::Skipped(reason) => {
            println!("  {} {} {}", "-".yellow(), dir, format!("(skipped: {})", reason).dimmed())
        }
        Outcome::Failed(message) => println!("  {} {}: {}", "✗".red(), dir, message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_with_task_queue() {
        let specs =
            resolve_features(&["activity/worker_restart:q1".to_string()], "7").unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].prepared.dir, "activity/worker_restart");
        assert_eq!(specs[0].task_queue, "q1");
    }

    #[test]
    fn test_resolve_generates_task_queue() {
        let specs = resolve_features(&["activity/worker_restart".to_string()], "7").unwrap();
        assert_eq!(specs[0].task_queue, "features-activity-worker_restart-7");
    }

    #[test]
    fn test_resolve_all_when_empty() {
        let specs = resolve_features(&[], "7").unwrap();
        assert_eq!(specs.len(), features::all().len());
    }

    #[test]
    fn test_unknown_feature_is_fatal() {
        let err = resolve_features(&["nope/missing:q".to_string()], "7").unwrap_err();
        assert!(matches!(err, Error::FeatureNotFound(ref dir) if dir == "nope/missing"));
    }

    #[test]
    fn test_non_loopback_server_needs_transport() {
        let err = sdk_for("localhost:7233").err().unwrap();
        assert!(err.to_string().contains("localhost:7233"));
        assert!(sdk_for(LOOPBACK_SERVER).is_ok());
    }
}
