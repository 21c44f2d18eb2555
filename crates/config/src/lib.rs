use alloy::primitives::ChainId;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

const DEFAULT_DB_BACKEND: &str = "redb";
const DEFAULT_QUERY_RPC_COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read config: {0}")]
    Read(#[from] std::io::Error),
    #[error("parse json config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("parse yaml config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("unsupported config file format: {0}")]
    UnsupportedFormat(PathBuf),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub db_dir: Option<PathBuf>,
    #[serde(default = "default_db_backend")]
    pub db_backend: String,
    #[serde(default = "default_query_rpc_cooldown")]
    pub query_rpc_cooldown: humantime_serde::Serde<Duration>,
    pub networks: Vec<Network>,
}

#[derive(Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Network {
    pub chain_id: ChainId,
    pub rpcs: Vec<Url>,
    pub required_confirmations: Option<u64>,
    pub nary: Option<usize>,
}

fn default_db_backend() -> String {
    DEFAULT_DB_BACKEND.to_string()
}

fn default_query_rpc_cooldown() -> humantime_serde::Serde<Duration> {
    DEFAULT_QUERY_RPC_COOLDOWN.into()
}

impl Config {
    /// Reads a `.json` or `.yaml`/`.yml` config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path)?;
        let extension = path.extension().and_then(|ext| ext.to_str());
        if extension.is_some_and(|ext| ext.eq_ignore_ascii_case("json")) {
            Ok(serde_json::from_str(&data)?)
        } else if extension
            .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
        {
            Ok(serde_yaml::from_str(&data)?)
        } else {
            Err(ConfigError::UnsupportedFormat(path.to_path_buf()))
        }
    }

    pub fn db_dir(&self) -> PathBuf {
        self.db_dir.clone().unwrap_or_else(|| PathBuf::from("db"))
    }

    pub fn network(&self, chain_id: ChainId) -> Option<&Network> {
        self.networks
            .iter()
            .find(|network| network.chain_id == chain_id)
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, ConfigError};
    use std::fs;
    use std::path::PathBuf;
    use std::time::Duration;

    fn write_temp(name: &str, contents: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|duration| duration.as_nanos())
            .unwrap_or(0);
        let dir = std::env::temp_dir()
            .join("chaincache-tests")
            .join(format!("config-{}-{nanos}-{name}", std::process::id()));
        fs::create_dir_all(&dir).expect("create temp dir");
        let path = dir.join(name);
        fs::write(&path, contents).expect("write config");
        path
    }

    #[test]
    fn loads_yaml_with_defaults() {
        let path = write_temp(
            "config.yaml",
            "networks:\n  - chain_id: 1\n    rpcs: [\"https://eth.llamarpc.com\"]\n    nary: 4\n",
        );
        let cfg = Config::load(&path).expect("load yaml");
        assert_eq!(cfg.db_backend, "redb");
        assert_eq!(*cfg.query_rpc_cooldown, Duration::from_secs(30));
        assert_eq!(cfg.db_dir(), PathBuf::from("db"));
        let network = cfg.network(1).expect("network 1");
        assert_eq!(network.nary, Some(4));
        assert_eq!(network.required_confirmations, None);
        assert!(cfg.network(10).is_none());

        fs::remove_dir_all(path.parent().expect("temp dir")).expect("remove temp dir");
    }

    #[test]
    fn loads_json_and_rejects_unknown_fields() {
        let path = write_temp(
            "config.json",
            r#"{"db_dir": "/tmp/cache", "query_rpc_cooldown": "1m", "networks": [{"chain_id": 137, "rpcs": [], "required_confirmations": 128}]}"#,
        );
        let cfg = Config::load(&path).expect("load json");
        assert_eq!(cfg.db_dir(), PathBuf::from("/tmp/cache"));
        assert_eq!(*cfg.query_rpc_cooldown, Duration::from_secs(60));
        assert_eq!(cfg.networks[0].required_confirmations, Some(128));

        let bad = write_temp("bad.json", r#"{"networks": [], "fees": {}}"#);
        assert!(matches!(Config::load(&bad), Err(ConfigError::Json(_))));

        let toml = write_temp("config.toml", "networks = []");
        assert!(matches!(
            Config::load(&toml),
            Err(ConfigError::UnsupportedFormat(_))
        ));

        for path in [path, bad, toml] {
            fs::remove_dir_all(path.parent().expect("temp dir")).expect("remove temp dir");
        }
    }
}
