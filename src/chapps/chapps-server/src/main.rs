/*
 * CHAPPS Postfix policy delegation service
 * Copyright (C) 2023 Team CHAPPS
 *
 * This program is free software: you can redistribute it and/or modify it under
 * the terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or any later version.
 *
 * This program is distributed in the hope that it will be useful, but WITHOUT
 * ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
 * FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * this program. If not, see https://www.gnu.org/licenses/.
 *
*/

use anyhow::Context as _;
use chapps_server::{
    server::Server,
    service::{build_handler, ServiceContext, ServiceKind},
    session::SessionParams,
    REQUEST_BUDGET,
};
use clap::Parser;

#[derive(Parser)]
#[command(
    name = "chappsd",
    about = "Caching, highly-available Postfix policy delegation service",
    version
)]
struct Args {
    /// Which policy composition this process serves.
    #[arg(value_enum)]
    service: ServiceKind,

    /// Configuration file, overriding $CHAPPS_CONFIG and the default path.
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Worker threads; defaults to max(4, 2 x CPUs).
    #[arg(long)]
    workers: Option<usize>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let workers = args.workers.unwrap_or_else(|| (2 * num_cpus::get()).max(4));
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .enable_all()
        .build()
        .context("building the runtime")?
        .block_on(run(args))
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<chapps_config::Config> {
    match path {
        Some(path) => chapps_config::Config::load(path),
        None => chapps_config::Config::from_env(),
    }
    .context("loading configuration")
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = load_config(args.config.as_deref())?;
    tracing::info!(
        config = %config.path.display(),
        service = ?args.service,
        "CHAPPS service starting.",
    );

    let ctx = ServiceContext::init(&config).await?;
    let handler = std::sync::Arc::new(build_handler(args.service, &config, &ctx)?);

    let (handler_tx, handler_rx) = tokio::sync::watch::channel(handler);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let listen = args.service.listen(&config).clone();
    let server = Server::bind(
        &listen.address,
        listen.port,
        SessionParams {
            handler: handler_rx,
            shutdown: shutdown_rx,
            request_budget: REQUEST_BUDGET,
            request_size_max: chapps_protocol::DEFAULT_REQUEST_SIZE_MAX,
            fallback: chapps_common::Action::Dunno,
        },
    )
    .await?;

    tokio::spawn(handle_signals(
        args.service,
        args.config.clone(),
        ctx,
        handler_tx,
        shutdown_tx,
    ));

    server.listen().await?;

    // sessions watch the same shutdown channel; give them one request
    // budget to finish what they are doing
    tokio::time::sleep(REQUEST_BUDGET).await;
    tracing::info!("CHAPPS service drained, exiting.");
    Ok(())
}

/// `SIGHUP` re-reads the configuration and swaps the pipeline snapshot;
/// `SIGTERM`/`SIGINT` raise the drain flag.
async fn handle_signals(
    service: ServiceKind,
    config_path: Option<std::path::PathBuf>,
    ctx: ServiceContext,
    handler_tx: tokio::sync::watch::Sender<
        std::sync::Arc<chapps_policy::CascadingPolicyHandler>,
    >,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(error) => {
            tracing::error!(%error, "Cannot install the SIGHUP handler.");
            return;
        }
    };
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(error) => {
            tracing::error!(%error, "Cannot install the SIGTERM handler.");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = hangup.recv() => {
                match load_config(config_path.as_deref())
                    .and_then(|config| build_handler(service, &config, &ctx))
                {
                    Ok(handler) => {
                        tracing::info!("Configuration reloaded on SIGHUP.");
                        let _ = handler_tx.send(std::sync::Arc::new(handler));
                    }
                    Err(error) => {
                        // the running snapshot stays in place
                        tracing::error!(%error, "SIGHUP reload failed, keeping old config.");
                    }
                }
            }
            _ = terminate.recv() => {
                tracing::info!("CHAPPS exiting on SIGTERM.");
                let _ = shutdown_tx.send(true);
                return;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("CHAPPS exiting on SIGINT.");
                let _ = shutdown_tx.send(true);
                return;
            }
        }
    }
}
