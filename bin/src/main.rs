#![allow(clippy::cognitive_complexity)]
use std::{process::ExitCode, sync::Arc};

use anyhow::{Context, Result, anyhow};

use alloc_engine::AllocEngine;
use config::DhcpConfig;
use external_api::{ExternalApi, Health};
use hearth_core::{
    Register, Server,
    chrono::{TimeDelta, Utc},
    config::{
        cli::{self, Parser},
        trace,
    },
    perfmon::{Family, MonitoredDurationStore},
    proto::{v4, v6},
    stats::StatsMgr,
    tokio::{self, runtime::Builder, signal, task::JoinHandle},
    tracing::*,
};
use lease_store::LeaseStore;
use leases::Leases;
use leases_v6::LeasesV6;
use message_type::MsgType;
use static_addr::StaticAddr;

#[cfg(not(target_env = "musl"))]
use jemallocator::Jemalloc;
use tokio_util::sync::CancellationToken;

#[cfg(not(target_env = "musl"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// how often the duration monitor rotates its reporting intervals
const DURATION_INTERVAL_SECS: i64 = 60;

fn main() -> ExitCode {
    // parses from cli or environment var
    let config = cli::Config::parse();
    let trace_config = match trace::Config::parse(&config.hearth_log) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("failed to configure logging: {err:#}");
            return ExitCode::FAILURE;
        }
    };
    debug!(?config, ?trace_config);
    if let Err(err) = dotenv::dotenv() {
        debug!(?err, ".env file not loaded");
    }

    let mut builder = Builder::new_multi_thread();
    // configure thread name & enable IO/time
    builder.thread_name(&config.thread_name).enable_all();
    // default num threads will be num logical CPUs
    if let Some(num) = config.threads {
        builder.worker_threads(num);
    }
    let rt = match builder.build() {
        Ok(rt) => rt,
        Err(err) => {
            error!(?err, "failed to build runtime");
            return ExitCode::FAILURE;
        }
    };

    let result = rt.block_on(async move {
        match tokio::spawn(async move { start(config).await }).await {
            Err(err) => Err(anyhow!(err)).context("failed to start server"),
            Ok(res) => res,
        }
    });

    match result {
        Ok(()) => {
            debug!("exiting...");
            ExitCode::SUCCESS
        }
        // config failure, bind failure, or a live lease-file cleanup
        // instance all land here
        Err(err) => {
            error!(?err, "exited with error");
            ExitCode::FAILURE
        }
    }
}

async fn start(config: cli::Config) -> Result<()> {
    debug!("parsing DHCP config");
    let dhcp_cfg = Arc::new(DhcpConfig::parse(&config.config_path)?);

    debug!(dir = %config.lease_dir.display(), "opening lease journals");
    std::fs::create_dir_all(&config.lease_dir)
        .with_context(|| format!("cannot create lease dir {}", config.lease_dir.display()))?;
    // refuses to start while a lease-file cleanup process holds the pid
    // file
    let store = Arc::new(LeaseStore::with_memfile(
        config.lease_dir.join("leases4.csv"),
        config.lease_dir.join("leases6.csv"),
    )?);
    info!(v4 = store.len4(), v6 = store.len6(), "lease store loaded");

    let stats = Arc::new(StatsMgr::new());
    let durations4 = Arc::new(
        MonitoredDurationStore::new(Family::V4, TimeDelta::seconds(DURATION_INTERVAL_SECS))
            .map_err(|err| anyhow!(err))?,
    );
    let durations6 = Arc::new(
        MonitoredDurationStore::new(Family::V6, TimeDelta::seconds(DURATION_INTERVAL_SECS))
            .map_err(|err| anyhow!(err))?,
    );
    let engine = Arc::new(AllocEngine::new(
        Arc::clone(&store),
        dhcp_cfg.v4().cache_threshold(),
    ));

    // control channel & health
    let api = ExternalApi::new(
        config.external_api,
        Arc::clone(&dhcp_cfg),
        Arc::clone(&store),
        Arc::clone(&stats),
    );

    // start v4 server
    debug!("starting v4 server");
    let mut v4: Server<v4::Message> = Server::new(
        config.clone(),
        dhcp_cfg.v4().interfaces().to_owned(),
        Arc::clone(&stats),
        durations4,
    )?;
    debug!("starting v4 plugins");
    MsgType::new(Arc::clone(&dhcp_cfg))?.register(&mut v4);
    StaticAddr::new(Arc::clone(&dhcp_cfg))?.register(&mut v4);
    Leases::new(Arc::clone(&dhcp_cfg), Arc::clone(&engine)).register(&mut v4);

    let v6 = if dhcp_cfg.has_v6() {
        info!("starting v6 server");
        let mut v6: Server<v6::Message> = Server::new(
            config.clone(),
            dhcp_cfg.v6().interfaces().to_owned(),
            Arc::clone(&stats),
            durations6,
        )?;
        info!("starting v6 plugins");
        MsgType::new(Arc::clone(&dhcp_cfg))?.register(&mut v6);
        LeasesV6::new(Arc::clone(&dhcp_cfg), Arc::clone(&engine)).register(&mut v6);
        Some(v6)
    } else {
        None
    };

    let token = CancellationToken::new();
    let api_sender = api.sender();
    let api_guard = api.start(token.clone());

    let mut reclaim_task = spawn_reclaim_task(
        Arc::clone(&store),
        Arc::clone(&stats),
        config.reclaim_interval(),
        config.reclaim_batch,
        config.reclaim_high_water,
        token.clone(),
    );

    let mut v4_task = tokio::spawn(v4.start(shutdown_signal(token.clone())));
    let mut v6_task = v6.map(|v6| tokio::spawn(v6.start(shutdown_signal(token.clone()))));

    // the servers fail fast on bind errors; give them a beat before
    // reporting healthy
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    if v4_task.is_finished() {
        let res = flatten(&mut v4_task).await;
        token.cancel();
        return res.context("v4 server failed during startup");
    }
    if let Some(task) = v6_task.as_mut() {
        if task.is_finished() {
            let res = flatten(task).await;
            token.cancel();
            return res.context("v6 server failed during startup");
        }
    }
    if reclaim_task.is_finished() {
        token.cancel();
        return Err(anyhow!("reclaim task failed during startup"));
    }

    debug!("changing health to good after startup checks passed");
    api_sender
        .send(Health::Good)
        .await
        .context("error occurred in changing health status to Good")?;

    let server_result = match v6_task {
        Some(mut v6_task) => {
            let v4_res = flatten(&mut v4_task).await;
            let v6_res = flatten(&mut v6_task).await;
            v4_res.and(v6_res)
        }
        None => flatten(&mut v4_task).await,
    };

    if let Err(err) = server_result {
        let _ = api_sender.send(Health::Bad).await;
        token.cancel();
        return Err(err);
    }
    token.cancel();
    if let Err(err) = reclaim_task.await {
        error!(?err, "error waiting for reclaim task");
    }
    drop(api_guard);
    Ok(())
}

/// Periodic expiry sweep. Moves up to `batch` expired leases per tick to
/// the reclaimed state; when the expired backlog passes `high_water` it
/// additionally recovers declined addresses whose probation has elapsed.
fn spawn_reclaim_task(
    store: Arc<LeaseStore>,
    stats: Arc<StatsMgr>,
    interval: std::time::Duration,
    batch: usize,
    high_water: usize,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("reclaim task stopping");
                    return;
                }
                _ = ticker.tick() => {
                    let now = Utc::now();
                    let swept = store.reclaim_expired(now, batch);
                    if swept.reclaimed4 + swept.reclaimed6 > 0 {
                        stats.inc_by(
                            "reclaimed-leases",
                            (swept.reclaimed4 + swept.reclaimed6) as u64,
                        );
                        debug!(
                            v4 = swept.reclaimed4,
                            v6 = swept.reclaimed6,
                            backlog = swept.remaining,
                            "reclaimed expired leases"
                        );
                    }
                    if swept.remaining >= high_water {
                        let recovered = store.recover_declined(now);
                        if recovered > 0 {
                            stats.inc_by("reclaimed-declined-addresses", recovered as u64);
                            info!(recovered, "recovered declined addresses past probation");
                        }
                    }
                }
            }
        }
    })
}

async fn flatten(handle: &mut JoinHandle<Result<(), anyhow::Error>>) -> Result<(), anyhow::Error> {
    match handle.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(err),
        Err(err) => Err(anyhow!(err)),
    }
}

async fn shutdown_signal(token: CancellationToken) -> Result<()> {
    let ret = signal::ctrl_c().await.map_err(|err| anyhow!(err));
    token.cancel();
    ret
}
