//! 🔧 App Configuration: the sacred TOML-to-struct pipeline.
//!
//! 📡 "Config not found: We looked everywhere. Under the couch. Behind the fridge.
//! In the junk drawer. Nothing." (every developer at 3am) 🦆
//!
//! 🏗️ Powered by Figment. `DBROKER_*` environment variables form the base layer, nested keys
//! spelled with a double underscore (`DBROKER_ELASTICSEARCH__URL`), and an optional TOML file
//! is merged on top.

use std::path::Path;

use anyhow::Context;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use tracing::info;

use crate::backends::{ElasticsearchConfig, QueryDefaults, SplunkConfig};

/// 📦 Everything the broker needs to know about itself before the first query.
///
/// Connection blocks are optional: a config that only talks to Splunk has no business
/// carrying an Elasticsearch URL.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct AppConfig {
    /// 📄 Paging and batching defaults shared by every backend.
    #[serde(default)]
    pub query: QueryDefaults,
    #[serde(default)]
    pub elasticsearch: Option<ElasticsearchConfig>,
    #[serde(default)]
    pub splunk: Option<SplunkConfig>,
}

/// 🚀 Load the config from env vars, plus a TOML file when one is given.
///
/// 📐 `None` means env vars only. No file, no assumptions, no silent "config.toml" fallback.
/// `Some(path)` merges the file over the environment, so the file wins on conflicts.
pub fn load_config(config_file_name: Option<&Path>) -> anyhow::Result<AppConfig> {
    info!(
        "🔧 Loading configuration: {:#?}",
        config_file_name.unwrap_or(Path::new(""))
    );

    let config = Figment::new().merge(Env::prefixed("DBROKER_").split("__"));
    let config = match config_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    };

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from file '{}' and environment variables (DBROKER_*). \
             The file exists in our hearts, but apparently not in a shape serde recognizes.",
            path.display()
        ),
        None => "💀 Failed to parse configuration from environment variables (DBROKER_*). \
                 No file was provided, so this one's all on the environment."
            .to_string(),
    };

    config.extract().context(context_msg)
}
