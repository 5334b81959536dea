//! mackerel-plugin-accesslog - Status classes and request times from an access log
//!
//! SPDX-License-Identifier: LGPL-3.0-only

#![warn(missing_docs)]

use anyhow::Result;
use clap::Parser;
use log::{trace, LevelFilter};
use mackerel_plugin_helper::{
    accesslog::{AccesslogArgs, AccesslogPlugin},
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

fn run(args: AccesslogArgs) -> Result<bool> {
    let mut plugin = AccesslogPlugin::from(args);
    trace!("Plugin: {:?}", plugin);
    plugin.start(Config::new(String::from("accesslog")))
}

fn main() {
    let args = AccesslogArgs::parse();
    if let Err(e) = SimpleLogger::new().with_level(log_level()).init() {
        eprintln!("mackerel-plugin-accesslog: could not set up logging: {}", e);
    }

    if let Err(e) = run(args) {
        eprintln!("mackerel-plugin-accesslog: {:#}", e);
        process::exit(1);
    }
}
