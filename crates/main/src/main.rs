/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::process::ExitCode;

use clap::Parser;
use common::{config::Config, Core};
use store::{
    blob::{ContentStore, DiskCache, S3Settings, Staging},
    PgConfig, PgStore, Store,
};
use tracing_subscriber::EnvFilter;

mod admin;
mod cli;
mod serve;

use cli::{Cli, Commands};

const EXIT_USER_ERROR: u8 = 1;
const EXIT_SERVER_ERROR: u8 = 2;
const EXIT_NOT_FOUND: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Cli::parse();
    let config = match load_config(&args) {
        Ok(config) => config,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::from(EXIT_USER_ERROR);
        }
    };

    let core = match build_core(&config, matches!(args.command, Commands::Migrate)).await {
        Ok(core) => std::sync::Arc::new(core),
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::from(EXIT_SERVER_ERROR);
        }
    };

    let result = match args.command {
        Commands::Serve => serve::serve(core).await,
        Commands::Migrate => {
            // Schema creation already ran during store open.
            println!("Schema is up to date.");
            Ok(())
        }
        Commands::Account { command } => admin::account(&core, command).await,
        Commands::Credential { command } => admin::credential(&core, command).await,
        Commands::Cache { command } => admin::cache(&core, command).await,
        Commands::Import {
            address,
            mailbox,
            path,
        } => admin::import(&core, &address, &mailbox, &path).await,
        Commands::Export { address, path } => admin::export(&core, &address, &path).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(admin::CommandError::NotFound(message)) => {
            eprintln!("{message}");
            ExitCode::from(EXIT_NOT_FOUND)
        }
        Err(admin::CommandError::User(message)) => {
            eprintln!("{message}");
            ExitCode::from(EXIT_USER_ERROR)
        }
        Err(admin::CommandError::Server(message)) => {
            eprintln!("{message}");
            ExitCode::from(EXIT_SERVER_ERROR)
        }
    }
}

fn load_config(args: &Cli) -> Result<Config, String> {
    let contents = std::fs::read_to_string(&args.config).map_err(|err| {
        format!(
            "Failed to read configuration {}: {err}",
            args.config.display()
        )
    })?;
    Config::parse(&contents)
        .map_err(|err| format!("Invalid configuration {}: {err}", args.config.display()))
}

async fn build_core(config: &Config, force_create_tables: bool) -> Result<Core, String> {
    let instance_id = config
        .hostname
        .clone()
        .unwrap_or_else(|| format!("sora-{}", std::process::id()));

    let pg = PgStore::open(PgConfig {
        host: config.database.host.clone(),
        port: config.database.port,
        database: config.database.database.clone(),
        user: config.database.user.clone(),
        password: config.database.password.clone(),
        read_host: config.database.read_host.clone(),
        max_connections: config.database.max_connections,
        connect_timeout: config.database.connect_timeout,
        create_tables: config.database.create_tables || force_create_tables,
        instance_id,
    })
    .await
    .map_err(|err| format!("Failed to open database: {err}"))?;
    let store = Store::new(pg);

    let cache = DiskCache::open(
        config.cache.path.clone(),
        config.cache.max_size_bytes,
        config.cache.max_object_bytes,
    )
    .await
    .map_err(|err| format!("Failed to open disk cache: {err}"))?;
    let staging = Staging::open(config.uploader.staging_path.clone())
        .await
        .map_err(|err| format!("Failed to open staging directory: {err}"))?;
    let blob = ContentStore::open(
        S3Settings {
            endpoint: config.s3.endpoint.clone(),
            region: config.s3.region.clone(),
            bucket: config.s3.bucket.clone(),
            access_key: config.s3.access_key.clone(),
            secret_key: config.s3.secret_key.clone(),
            timeout: config.s3.timeout,
        },
        cache,
        staging,
    )
    .map_err(|err| format!("Failed to open content store: {err}"))?;

    Ok(Core::new(config.clone(), store, blob))
}
