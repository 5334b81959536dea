//! mackerel-plugin-multicore - CPU usage per core and load average per core
//!
//! SPDX-License-Identifier: LGPL-3.0-only

#![warn(missing_docs)]

use anyhow::Result;
use clap::Parser;
use log::{trace, LevelFilter};
use mackerel_plugin_helper::{
    multicore::{MulticoreArgs, MulticorePlugin},
    Config, MackerelPlugin,
};
use simple_logger::SimpleLogger;
use std::{env, process};

/// Log level from MACKEREL_PLUGIN_LOG, warn if unset or unknown
fn log_level() -> LevelFilter {
    env::var("MACKEREL_PLUGIN_LOG")
        .ok()
        .and_then(|level| level.parse().ok())
        .unwrap_or(LevelFilter::Warn)
}

fn run(args: MulticoreArgs) -> Result<bool> {
    let mut config = Config::new(String::from("multicore"));
    if let Some(tempfile) = args.tempfile {
        config = config.with_tempfile(tempfile);
    }
    trace!("Checkpoints in {:?}", config.tempfile);
    MulticorePlugin::default().start(config)
}

fn main() {
    let args = MulticoreArgs::parse();
    if let Err(e) = SimpleLogger::new().with_level(log_level()).init() {
        eprintln!("mackerel-plugin-multicore: could not set up logging: {}", e);
    }

    if let Err(e) = run(args) {
        eprintln!("mackerel-plugin-multicore: {:#}", e);
        process::exit(1);
    }
}
