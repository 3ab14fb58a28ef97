//! kitworker - sandboxed single-document engine host
//!
//! One worker process serves one document: it builds a chroot jail from the
//! prepared templates, hosts the office engine inside it, and mediates
//! rendering and editing commands between the controller and the engine
//! over a single framed connection.

mod channel;
mod cli;
mod document;
mod engine;
mod error;
mod jail;
mod logging;
mod pngenc;
mod protocol;
mod queue;
mod session;
mod tiles;
mod worker;

use anyhow::{Context, Result};
use clap::Parser;

use cli::Cli;
use worker::KitConfig;

fn main() {
    let cli = Cli::parse();
    logging::init(&logging::LogConfig::from_env());

    if let Err(e) = run(&cli) {
        eprintln!("error: {e}");
        for cause in e.chain().skip(1) {
            eprintln!("  caused by: {cause}");
        }
        std::process::exit(error::EXIT_SOFTWARE);
    }
}

fn run(cli: &Cli) -> Result<()> {
    if cli.preinit {
        let lo_template = cli
            .lotemplate
            .as_deref()
            .context("--lotemplate is required for --preinit")?;
        engine::preinit::global_preinit(lo_template)?;
        return Ok(());
    }

    let config = KitConfig {
        child_root: cli
            .childroot
            .clone()
            .context("--childroot is required")?,
        sys_template: cli
            .systemplate
            .clone()
            .context("--systemplate is required")?,
        lo_template: cli
            .lotemplate
            .clone()
            .context("--lotemplate is required")?,
        lo_sub_path: cli.losubpath.clone(),
        master_port: cli.masterport,
        no_capabilities: cli.nocaps,
        query_version: cli.queryversion || cli.displayversion,
        display_version: cli.displayversion,
    };

    worker::kit_main(config)
}
