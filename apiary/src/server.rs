// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Entry points for running the broker as a process.

use clap::Parser;
use std::path::PathBuf;
use tokio::runtime::Runtime;

use crate::broker::Broker;
use crate::config::Config;
use crate::error::{Error, ErrorKind};

#[derive(Debug, Parser)]
#[command(name = "apiary", version, about = "Embeddable MQTT 3.1.1 broker")]
struct Arguments {
    /// Config file path.
    #[arg(short, long, value_name = "config_file")]
    config: Option<PathBuf>,

    /// Test the config file and exit.
    #[arg(short, long)]
    test: bool,
}

/// Entry point of the server binary.
///
/// # Errors
///
/// Returns error if the config file is invalid or the broker fails to bind.
pub fn run_server() -> Result<(), Error> {
    let arguments = Arguments::parse();

    let config = if let Some(config_file) = &arguments.config {
        let config_content = std::fs::read_to_string(config_file)?;
        let config: Config = toml::from_str(&config_content).map_err(|err| {
            Error::from_string(ErrorKind::ConfigError, format!("Invalid config: {err}"))
        })?;
        config.validate()?;

        if arguments.test {
            println!(
                "The configuration file {} syntax is Ok",
                config_file.display()
            );
            return Ok(());
        }
        config
    } else {
        Config::default()
    };

    env_logger::Builder::new()
        .filter_level(config.log_level().to_level_filter())
        .parse_default_env()
        .init();

    let runtime = Runtime::new()?;
    runtime.block_on(run_with_config(config))
}

/// Run a broker with an already built config until ctrl-c.
///
/// Useful for embedding and integration tests.
///
/// # Errors
///
/// Returns error if the listener cannot be bound.
pub async fn run_with_config(config: Config) -> Result<(), Error> {
    config.validate()?;
    let broker = Broker::bind(config).await?;
    let handle = broker.handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("server: Received ctrl-c, shutting down");
            handle.shutdown();
        }
    });

    broker.run_loop().await;
    Ok(())
}
