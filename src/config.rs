/*
 * Copyright 2025 Google LLC All Rights Reserved.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::{net::SocketAddr, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

/// Runtime configuration, read from an optional YAML file and overridable
/// from the command line.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// The namespace whose game servers and sets this instance manages.
    pub namespace: String,
    /// Bind address for the allocation endpoint.
    pub allocation_address: SocketAddr,
    /// Bind address for the admin endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_address: Option<SocketAddr>,
    /// Seconds between periodic reconciliation passes. Change-feed events
    /// trigger passes in between.
    pub reconcile_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: "default".into(),
            allocation_address: (std::net::Ipv6Addr::UNSPECIFIED, 7777).into(),
            admin_address: None,
            reconcile_interval_secs: 30,
        }
    }
}

impl Config {
    /// Reads the configuration file, falling back to defaults when the file
    /// does not exist.
    pub fn read(path: &Path) -> crate::Result<Self> {
        match std::fs::File::open(path) {
            Ok(file) => {
                tracing::info!(path = %path.display(), "loading configuration");
                serde_yaml::from_reader(file).map_err(From::from)
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no configuration file, using defaults");
                Ok(Self::default())
            }
            Err(error) => Err(error.into()),
        }
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_partial_yaml_over_defaults() {
        let config: Config = serde_yaml::from_str("namespace: games\n").unwrap();
        assert_eq!(config.namespace, "games");
        assert_eq!(config.reconcile_interval_secs, 30);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::read(Path::new("/definitely/not/here.yaml")).unwrap();
        assert_eq!(config, Config::default());
    }
}
