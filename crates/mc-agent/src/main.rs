// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{io, process::ExitCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, subscriber::SetGlobalDefaultError};
use tracing_subscriber::EnvFilter;

use mc_agent_core::{logger::Formatter, Agent, AgentConfig};

#[tokio::main]
pub async fn main() -> ExitCode {
    let config = AgentConfig::from_env();

    // Configuration errors are logged too, at the default level
    let log_level = config.as_ref().map_or("info", |c| c.log_level.as_str());
    if let Err(e) = init_logging(log_level) {
        eprintln!("setting default subscriber failed: {e}");
        return ExitCode::FAILURE;
    }

    debug!("Logging subsystem enabled");

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("Error loading configuration on agent startup: {e}");
            return ExitCode::FAILURE;
        }
    };

    let agent = match Agent::from_config(config) {
        Ok(agent) => agent,
        Err(e) if e.is_config() => {
            error!("Invalid agent configuration: {e}");
            return ExitCode::FAILURE;
        }
        Err(e) => {
            error!("Error starting agent: {e}");
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        match wait_for_shutdown_signal().await {
            Ok(()) => {
                info!("Shutdown signal received, stopping agent");
                signal_cancel.cancel();
            }
            Err(e) => error!("Unable to listen for shutdown signals: {e}"),
        }
    });

    match agent.run(cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Agent stopped with an error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn wait_for_shutdown_signal() -> io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = term.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

fn init_logging(log_level: &str) -> Result<(), SetGlobalDefaultError> {
    let env_filter = format!("h2=off,hyper=off,hyper_util=off,rustls=off,{log_level}");

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .event_format(Formatter)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
}
