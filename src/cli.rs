//! The `pode` binary: a static file server over the core runtime.
//!
//! `start` reads `server.json`, binds the configured (or default) endpoint
//! and serves a directory; `init` scaffolds a starter configuration. Exit
//! code 0 on clean shutdown, non-zero on bind or configuration failure.

use crate::config::ServerConfig;
use crate::endpoint::{Endpoint, Protocol};
use crate::pipeline::handler;
use crate::router::Route;
use crate::server::Server;
use crate::static_files::StaticMount;
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use tracing::error;

#[derive(Parser)]
#[command(name = "pode", about = "Multi-protocol application server", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a server from a configuration file.
    Start(StartArgs),
    /// Write a starter server.json in the current directory.
    Init(InitArgs),
}

#[derive(Args)]
pub struct StartArgs {
    /// Configuration file.
    #[arg(short, long, default_value = "server.json")]
    pub config: PathBuf,

    /// Directory served at the root path.
    #[arg(short, long, default_value = ".")]
    pub root: PathBuf,

    /// Bind address.
    #[arg(short, long, default_value = "127.0.0.1")]
    pub address: String,

    /// Bind port.
    #[arg(short, long, default_value_t = 8080)]
    pub port: u16,

    /// Restart automatically when files under the served root change.
    #[arg(long)]
    pub watch: bool,
}

#[derive(Args)]
pub struct InitArgs {
    /// Where to write the configuration.
    #[arg(default_value = "server.json")]
    pub path: PathBuf,
}

pub fn start(args: StartArgs) -> i32 {
    let config = if args.config.is_file() {
        match ServerConfig::load(&args.config) {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "invalid configuration");
                return 2;
            }
        }
    } else {
        ServerConfig::default()
    };

    let address = args.address.clone();
    let port = args.port;
    let root = args.root.clone();

    let mut server = Server::new(config, move |ctx| {
        ctx.endpoints
            .add(Endpoint::new(Protocol::Http, &address, port)?)?;

        let cache = ctx.config.web.r#static.cache.clone();
        let defaults = ctx.config.web.r#static.defaults.clone();
        ctx.router.add(
            Route::new(Some(http::Method::GET), "/**", crate::pipeline::noop_handler())?
                .with_static(
                    StaticMount::new(root.clone())
                        .with_defaults(defaults)
                        .with_cache(cache),
                ),
        )?;

        ctx.router.add(Route::new(
            Some(http::Method::GET),
            "/_pode/health",
            handler(|event| {
                event.response.json(&json!({ "status": "ok" }));
                Ok(())
            }),
        )?)?;
        Ok(())
    });

    if args.watch {
        server = server.watch(args.root);
    }

    match server.run() {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "server failed");
            1
        }
    }
}

pub fn init(args: InitArgs) -> i32 {
    if args.path.exists() {
        error!(path = %args.path.display(), "refusing to overwrite existing configuration");
        return 2;
    }
    let starter = json!({
        "server": {
            "request": { "timeout": 30, "bodySize": 104_857_600 }
        },
        "web": {
            "static": { "cache": { "enable": true, "maxAge": 3600 } }
        }
    });
    match std::fs::write(&args.path, serde_json::to_string_pretty(&starter).unwrap_or_default()) {
        Ok(()) => {
            println!("wrote {}", args.path.display());
            0
        }
        Err(e) => {
            error!(error = %e, "cannot write configuration");
            1
        }
    }
}
