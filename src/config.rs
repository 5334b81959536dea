//! Config data for a mackerel plugin

// We do not want to write unsafe code
#![forbid(unsafe_code)]

use crate::diff::RateScale;
use log::trace;
use std::{env, path::PathBuf, time::Duration};

/// Plugin configuration.
///
/// Built fresh for every invocation and handed to the plugin by
/// reference, nothing in here is ever mutated behind the plugins back.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Config {
    /// The name of the plugin.
    ///
    /// Default is "plugin"
    pub plugin_name: String,

    /// Plugins working directory
    ///
    /// Taken from the environment variable MACKEREL_PLUGIN_WORKDIR,
    /// falling back to the temp directory of the system.
    pub workdir: PathBuf,

    /// Checkpoint file for the plugin
    ///
    /// Holds the last seen values of all counter metrics, so the next
    /// run can calculate a difference. The default is
    /// [Config::workdir] joined with `mackerel-plugin-` and the
    /// [Config::plugin_name].
    pub tempfile: PathBuf,

    /// Maximum age of a position file before its state is considered
    /// stale and no metrics are reported for a round.
    ///
    /// Defaults to 2 minutes.
    pub staleness_window: Duration,

    /// Maximum time between two checkpoints, that still gives a
    /// trustworthy difference.
    ///
    /// Defaults to 10 minutes.
    pub max_gap: Duration,

    /// How differences of counter metrics are reported.
    ///
    /// Defaults to [RateScale::PerMinute].
    pub rate_scale: RateScale,

    /// Should the plugin print its graph definitions instead of values?
    ///
    /// Checks MACKEREL_AGENT_PLUGIN_META environment variable, if set
    /// to 1, this is true, otherwise false.
    pub meta: bool,

    /// Size of buffer for BufWriter for [MackerelPlugin::start](super::MackerelPlugin::start).
    ///
    /// Defaults to 8192, plugins with lots of metrics may want to
    /// increase this.
    pub fetch_size: usize,
}

impl Config {
    /// Return the plugin working directory as the agent wants it - or
    /// the system temp dir if no environment variable is set.
    fn get_workdir() -> PathBuf {
        env::var_os("MACKEREL_PLUGIN_WORKDIR")
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(env::temp_dir)
    }

    /// Create a new Config with defined plugin_name, also setting
    /// [Config::tempfile] to a sensible value using the
    /// [Config::plugin_name].
    ///
    /// # Examples
    ///
    /// ```
    /// # use mackerel_plugin_helper::config::Config;
    /// let config = Config::new(String::from("great-plugin"));
    /// println!("My checkpoints live in {:?}", config.tempfile);
    /// ```
    pub fn new(plugin_name: String) -> Self {
        trace!("Creating new config for plugin {plugin_name}");
        let defaults = Config::default();
        let tempfile = defaults
            .workdir
            .join(format!("mackerel-plugin-{}", plugin_name));
        Self {
            plugin_name,
            tempfile,
            ..defaults
        }
    }

    /// Replace the checkpoint file, for plugins that monitor more than
    /// one target and need one file per target.
    pub fn with_tempfile(mut self, tempfile: impl Into<PathBuf>) -> Self {
        self.tempfile = tempfile.into();
        self
    }
}

/// Useful defaults, if possible based on the agent environment.
impl Default for Config {
    fn default() -> Self {
        let workdir = Config::get_workdir();
        Self {
            plugin_name: String::from("plugin"),
            tempfile: workdir.join("mackerel-plugin-plugin"),
            workdir,
            staleness_window: Duration::from_secs(120),
            max_gap: Duration::from_secs(600),
            rate_scale: RateScale::PerMinute,
            meta: match env::var("MACKEREL_AGENT_PLUGIN_META") {
                Ok(val) => val.eq("1"),
                Err(_) => false,
            },
            fetch_size: 8192,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modconfig() {
        // Whole set of defaults
        let config = Config {
            ..Default::default()
        };
        assert_eq!(config.plugin_name, String::from("plugin"));
        assert_eq!(config.staleness_window, Duration::from_secs(120));
        assert_eq!(config.max_gap, Duration::from_secs(600));
        assert_eq!(config.rate_scale, RateScale::PerMinute);
        assert_eq!(config.fetch_size, 8192);

        // Use defaults (except for name)
        let mut config2 = Config {
            plugin_name: String::from("Lala"),
            ..Default::default()
        };
        assert_eq!(config2.plugin_name, String::from("Lala"));

        let config3 = Config::new(String::from("Lala"));
        // At this point, the tempfile should be different
        assert_ne!(config2, config3);
        config2.tempfile = config2.workdir.join("mackerel-plugin-Lala");
        assert_eq!(config2, config3);
    }

    #[test]
    fn test_with_tempfile() {
        let config = Config::new(String::from("redis")).with_tempfile("/var/tmp/redis-6379");
        assert_eq!(config.plugin_name, String::from("redis"));
        assert_eq!(config.tempfile, PathBuf::from("/var/tmp/redis-6379"));
    }
}
