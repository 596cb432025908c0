/********************************************************************************
 * Copyright (c) 2025 Contributors to the Eclipse Foundation
 *
 * See the NOTICE file(s) distributed with this work for additional
 * information regarding copyright ownership.
 *
 * This program and the accompanying materials are made available under the
 * terms of the Apache License Version 2.0 which is available at
 * https://www.apache.org/licenses/LICENSE-2.0
 *
 * SPDX-License-Identifier: Apache-2.0
 ********************************************************************************/

//! The NimsForest daemon: wires a forest from a configuration file, serves
//! the management surface on loopback and runs until signalled.
//!
//! Exit codes: 0 on normal shutdown, 1 on unrecoverable startup failure,
//! 2 when a reload failed and left no live instances.

use clap::Parser;
use nimsforest::bus::{Bus, NatsBus, NatsBusConfig};
use nimsforest::config::ForestConfig;
use nimsforest::mgmt::{self, MgmtState};
use nimsforest::viewmodel::{BeatConfig, ViewmodelPublisher};
use nimsforest::Forest;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "forestd", about = "NimsForest event-orchestration daemon")]
struct Args {
    /// Forest configuration file.
    #[arg(short, long, default_value = "forest.yaml")]
    config: PathBuf,

    /// NATS broker URL.
    #[arg(long, default_value = "nats://localhost:4222")]
    nats_url: String,

    /// JetStream stream backing the durable log.
    #[arg(long, default_value = "river")]
    log_stream: String,

    /// Management API port, bound to loopback only.
    #[arg(long, default_value_t = 4646)]
    mgmt_port: u16,

    /// Heartbeat rate on dance.beat.
    #[arg(long, default_value_t = 90)]
    beat_hz: u32,

    /// Beats between viewmodel snapshots.
    #[arg(long, default_value_t = 90)]
    snapshot_every: u32,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    std::process::exit(run(args).await);
}

async fn run(args: Args) -> i32 {
    nimsforest::llm::register_builtin_providers();

    let config = match ForestConfig::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            error!(path = %args.config.display(), err = %err, "invalid configuration");
            return 1;
        }
    };

    let bus = match NatsBus::connect(NatsBusConfig {
        url: args.nats_url.clone(),
        log_stream: args.log_stream.clone(),
    })
    .await
    {
        Ok(bus) => bus,
        Err(err) => {
            error!(url = %args.nats_url, err = %err, "bus unavailable");
            return 1;
        }
    };
    let bus: Arc<dyn Bus> = Arc::new(bus);

    let forest = Arc::new(Forest::new(bus.clone(), config));
    if let Err(err) = forest.start().await {
        error!(err = %err, "forest failed to start");
        return 1;
    }

    let cancel = CancellationToken::new();

    let publisher = ViewmodelPublisher::new(
        forest.clone(),
        bus.clone(),
        BeatConfig {
            hz: args.beat_hz,
            snapshot_every: args.snapshot_every,
        },
    );
    let viewmodel_task = tokio::spawn(publisher.run(cancel.child_token()));

    let (fatal_sender, mut fatal_receiver) = mpsc::channel(1);
    let state = MgmtState {
        forest: forest.clone(),
        config_path: args.config.clone(),
        fatal: fatal_sender,
    };

    let mgmt_addr = SocketAddr::from(([127, 0, 0, 1], args.mgmt_port));
    let listener = match tokio::net::TcpListener::bind(mgmt_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(addr = %mgmt_addr, err = %err, "unable to bind management surface");
            forest.stop().await;
            return 1;
        }
    };
    info!(addr = %mgmt_addr, "management surface listening");

    let server_cancel = cancel.child_token();
    let server_task = tokio::spawn(async move {
        axum::serve(listener, mgmt::router(state))
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
    });

    let exit_code = tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown signal received");
            0
        }
        fatal = fatal_receiver.recv() => {
            match fatal {
                Some(_) => {
                    error!("reload failure with no live instances remaining");
                    2
                }
                None => 0,
            }
        }
    };

    cancel.cancel();
    forest.stop().await;
    let _ = viewmodel_task.await;
    if let Ok(Err(err)) = server_task.await {
        error!(err = %err, "management surface exited with error");
    }

    exit_code
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
