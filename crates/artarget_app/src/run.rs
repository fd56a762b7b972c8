use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use artarget_core::Notice;
use artarget_engine::{
    CancellationTokenManager, CommandCompute, CompileEngine, EngineEvent, EngineParts,
    EngineSettings, HttpCompileApi, HttpConnectivityProbe, HttpMetadataStore, HttpObjectStore,
    JobMetadataStore, NetworkAwareExecutor, NetworkMonitor, PreloadedModule, SourceImage,
    StatusReconciler, TokenOptions, UploadPipeline,
};
use artarget_logging::{pipeline_debug, pipeline_error, pipeline_info, pipeline_warn};
use tokio::task::JoinHandle;

use crate::config::AppConfig;

/// Exit code for a run interrupted with Ctrl-C.
const INTERRUPTED: u8 = 130;

/// Monitor plus executor, with the connectivity probe running when a health
/// URL is configured.
struct Network {
    executor: NetworkAwareExecutor,
    probe: Option<JoinHandle<()>>,
}

fn start_network(settings: &EngineSettings, tokens: &CancellationTokenManager) -> anyhow::Result<Network> {
    let monitor = NetworkMonitor::new(settings.network.clone());
    let probe = match &settings.endpoints.health_url {
        Some(url) => {
            let probe = HttpConnectivityProbe::new(url, &settings.network)
                .context("invalid health endpoint")?;
            let token = tokens.create("network-probe", TokenOptions::default());
            Some(monitor.spawn_probe_loop(Arc::new(probe), token))
        }
        None => None,
    };
    Ok(Network {
        executor: NetworkAwareExecutor::new(monitor, settings.executor.clone()),
        probe,
    })
}

fn metadata_store(settings: &EngineSettings) -> anyhow::Result<Arc<dyn JobMetadataStore>> {
    let store = HttpMetadataStore::new(
        &settings.endpoints.metadata_url,
        settings.endpoints.auth_token.clone(),
        Duration::from_millis(settings.reconcile.request_timeout_ms),
    )
    .context("invalid metadata endpoint")?;
    Ok(Arc::new(store))
}

/// Compiles `bytes` with the configured external compiler, uploads the
/// artifact and prints its URL.
pub(crate) async fn compile(
    config: &AppConfig,
    job_id: String,
    name: String,
    bytes: Vec<u8>,
) -> anyhow::Result<ExitCode> {
    let settings = &config.engine;
    let tokens = CancellationTokenManager::new();
    let network = start_network(settings, &tokens)?;

    let store = HttpObjectStore::new(
        &settings.endpoints.storage_url,
        settings.endpoints.auth_token.clone(),
        settings.upload.chunk_size,
    )
    .context("invalid storage endpoint")?;
    let uploads = Arc::new(UploadPipeline::new(
        Arc::new(store),
        network.executor.clone(),
        tokens.clone(),
        settings.upload.clone(),
        settings.validation.clone(),
    ));
    let compute = CommandCompute::new(config.compiler.program.clone(), config.compiler.args.clone());
    let (engine, mut events) = CompileEngine::new(EngineParts {
        loader: Arc::new(PreloadedModule(Arc::new(compute))),
        uploads,
        metadata: Some(metadata_store(settings)?),
        tokens: tokens.clone(),
        policy: settings.retry.policy(),
        validation: settings.validation.clone(),
    });

    pipeline_info!("compiling {} from {} ({} bytes)", job_id, name, bytes.len());
    engine.trigger(job_id.clone(), SourceImage::new(name, bytes));

    let mut reported = 0u8;
    let code = loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                pipeline_warn!("interrupted, cancelling {}", job_id);
                engine.cancel(job_id.clone());
                break ExitCode::from(INTERRUPTED);
            }
        };
        let Some(event) = event else {
            pipeline_error!("engine stopped before {} settled", job_id);
            break ExitCode::FAILURE;
        };
        match event {
            EngineEvent::Progress {
                job_id: id,
                phase,
                progress,
            } if id == job_id => {
                let percent = (progress * 100.0).round() as u8;
                // Every tenth percent is enough for a terminal.
                if percent >= reported.saturating_add(10) || (percent == 100 && reported < 100) {
                    reported = percent;
                    pipeline_info!("{} {:?} {}%", id, phase, percent);
                } else {
                    pipeline_debug!("{} {:?} {:.3}", id, phase, progress);
                }
            }
            EngineEvent::Progress { .. } => {}
            EngineEvent::Notice(Notice::Retrying {
                next_attempt,
                delay,
                error,
                ..
            }) => {
                reported = 0;
                eprintln!(
                    "{} Retrying (attempt {}) in {}s",
                    error.user_message(),
                    next_attempt,
                    delay.as_secs()
                );
            }
            EngineEvent::Notice(Notice::Completed { url, attempt, .. }) => {
                pipeline_info!("{} completed on attempt {}", job_id, attempt);
                println!("{url}");
                break ExitCode::SUCCESS;
            }
            EngineEvent::Notice(Notice::Failed { error, attempt, .. }) => {
                pipeline_error!("{} failed on attempt {}: {}", job_id, attempt, error);
                eprintln!("{}", error.user_message());
                break ExitCode::FAILURE;
            }
        }
    };

    engine.shutdown();
    stop_probe(&tokens, network.probe).await;
    Ok(code)
}

/// Kicks off a server-side compile for `job_id` and waits for the outcome.
pub(crate) async fn remote(config: &AppConfig, job_id: &str) -> anyhow::Result<ExitCode> {
    let settings = &config.engine;
    let tokens = CancellationTokenManager::new();
    let network = start_network(settings, &tokens)?;

    let api = HttpCompileApi::new(
        &settings.endpoints.compile_url,
        settings.endpoints.auth_token.clone(),
        Duration::from_millis(settings.reconcile.request_timeout_ms),
    )
    .context("invalid compile endpoint")?;
    let reconciler = StatusReconciler::new(
        Arc::new(api),
        network.executor.clone(),
        settings.reconcile.clone(),
    )
    .with_metadata(metadata_store(settings)?);

    let token_id = format!("reconcile:{job_id}");
    let token = tokens.create(token_id.clone(), TokenOptions::default());
    let outcome = tokio::select! {
        outcome = reconciler.reconcile(job_id, &token) => outcome,
        _ = tokio::signal::ctrl_c() => {
            tokens.abort(&token_id);
            pipeline_warn!("interrupted while reconciling {}", job_id);
            stop_probe(&tokens, network.probe).await;
            return Ok(ExitCode::from(INTERRUPTED));
        }
    };
    tokens.release(&token);
    stop_probe(&tokens, network.probe).await;

    match outcome {
        Ok(reconciled) => {
            pipeline_info!(
                "{} kickoff {:?}, settled {:?}",
                job_id,
                reconciled.kickoff,
                reconciled.status.status
            );
            if reconciled.status.ready {
                println!("ready");
                Ok(ExitCode::SUCCESS)
            } else {
                let detail = reconciled
                    .status
                    .error_message
                    .unwrap_or_else(|| format!("{:?}", reconciled.status.status));
                eprintln!("{job_id}: {detail}");
                Ok(ExitCode::FAILURE)
            }
        }
        Err(err) => {
            pipeline_error!("{} reconcile failed: {}", job_id, err);
            eprintln!("{}", err.user_message());
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn stop_probe(tokens: &CancellationTokenManager, probe: Option<JoinHandle<()>>) {
    let Some(handle) = probe else {
        return;
    };
    tokens.abort("network-probe");
    if let Err(err) = handle.await {
        pipeline_warn!("probe task ended abnormally: {}", err);
    }
}
