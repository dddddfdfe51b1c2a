//! # etude
//!
//! ```bash
//! etude 8080
//! RUST_LOG=debug ETUDE_WORKERS=8 etude 9006
//! ```
//!
//! Serves `./resources` and the uploads in `./filedir` unless overridden by
//! `ETUDE_SITE_*` variables; engine settings come from `ETUDE_*`.

use etude_core::logging::{init_file_logging, init_logging};
use etude_core::{Server, ServerConfig};
use etude_site::{SiteConfig, SiteHandler};
use mimalloc::MiMalloc;
use std::process::ExitCode;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let port = match args.as_slice() {
        [_, port] => port.parse::<u16>(),
        _ => {
            let prog = args.first().map(String::as_str).unwrap_or("etude");
            eprintln!("usage: {} port_number", prog);
            return ExitCode::FAILURE;
        }
    };
    let Ok(port) = port else {
        eprintln!("invalid port: {}", args[1]);
        return ExitCode::FAILURE;
    };

    let site = SiteConfig::from_env();
    let _guard = match &site.log_dir {
        Some(dir) => Some(init_file_logging(dir, "etude.log")),
        None => {
            init_logging();
            None
        }
    };

    match run(port, &site) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(port: u16, site: &SiteConfig) -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig {
        port,
        ..ServerConfig::from_env()?
    };
    let handler = SiteHandler::new(site)?;
    Server::new(config).serve(handler)?;
    Ok(())
}
