//! StoryCheck configuration
//!
//! Loaded from a TOML file (`storycheck.toml` by default). Every section and
//! field is optional; missing values fall back to the defaults below.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::error::{Result, StoryError};

/// Placeholder substituted from the environment in chain RPC URLs
pub const API_KEY_PLACEHOLDER: &str = "{ALCHEMY_API_KEY}";

/// Environment variable holding the RPC provider key
pub const API_KEY_ENV: &str = "ALCHEMY_API_KEY";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoryCheckConfig {
    /// Local chain fork
    pub fork: ForkConfig,

    /// Browser session
    pub browser: BrowserConfig,

    /// Remote UI grounding model
    pub grounding: GroundingConfig,

    /// Expected-result verifier scripts
    pub verifier: VerifierConfig,
}

impl StoryCheckConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| StoryError::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Fork process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForkConfig {
    /// Fork binary (resolved through PATH when not absolute)
    pub binary: String,

    /// Bind host
    pub host: String,

    /// Bind port
    pub port: u16,

    /// Seconds to wait for the fork to answer JSON-RPC
    pub ready_timeout_secs: u64,

    /// Delay between readiness checks
    pub poll_interval_ms: u64,

    /// Seconds between SIGTERM and SIGKILL on stop
    pub stop_grace_secs: u64,

    /// Seconds to wait for exit after SIGKILL
    pub kill_wait_secs: u64,

    /// Chain id to remote RPC URL
    pub chains: BTreeMap<String, String>,
}

impl Default for ForkConfig {
    fn default() -> Self {
        let chains = [
            ("1", "https://eth-mainnet.g.alchemy.com/v2/"),
            ("5", "https://eth-goerli.g.alchemy.com/v2/"),
            ("11155111", "https://eth-sepolia.g.alchemy.com/v2/"),
            ("42161", "https://arb-mainnet.g.alchemy.com/v2/"),
            ("10", "https://opt-mainnet.g.alchemy.com/v2/"),
            ("324", "https://zksync-mainnet.g.alchemy.com/v2/"),
            ("300", "https://zksync-sepolia.g.alchemy.com/v2/"),
            ("280", "https://zksync-goerli.g.alchemy.com/v2/"),
        ]
        .into_iter()
        .map(|(id, base)| (id.to_string(), format!("{}{}", base, API_KEY_PLACEHOLDER)))
        .collect();

        Self {
            binary: "anvil".to_string(),
            host: "127.0.0.1".to_string(),
            port: 8545,
            ready_timeout_secs: 30,
            poll_interval_ms: 500,
            stop_grace_secs: 3,
            kill_wait_secs: 1,
            chains,
        }
    }
}

impl ForkConfig {
    /// URL the fork answers on
    pub fn local_rpc_url(&self) -> String {
        let host = match self.host.as_str() {
            "0.0.0.0" => "127.0.0.1",
            "::" => "[::1]",
            other => other,
        };
        format!("http://{}:{}", host, self.port)
    }

    /// Remote RPC URL for a chain id, with the API key placeholder filled in
    pub fn resolve_rpc_url(&self, chain_id: &str) -> Result<String> {
        let template = self
            .chains
            .get(chain_id)
            .ok_or_else(|| StoryError::UnknownChain(chain_id.to_string()))?;

        if !template.contains(API_KEY_PLACEHOLDER) {
            return Ok(template.clone());
        }
        match std::env::var(API_KEY_ENV) {
            Ok(key) => Ok(template.replace(API_KEY_PLACEHOLDER, &key)),
            Err(_) => {
                warn!("{} is not set; chain {} RPC URL will not resolve", API_KEY_ENV, chain_id);
                Ok(template.replace(API_KEY_PLACEHOLDER, ""))
            }
        }
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn kill_wait(&self) -> Duration {
        Duration::from_secs(self.kill_wait_secs)
    }
}

/// Emulated device
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceProfile {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub device_scale_factor: f64,
    pub is_mobile: bool,
    pub has_touch: bool,
    pub user_agent: String,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            name: "Pixel 5".to_string(),
            width: 393,
            height: 727,
            device_scale_factor: 2.75,
            is_mobile: true,
            has_touch: true,
            user_agent: "Mozilla/5.0 (Linux; Android 11; Pixel 5) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/120.0.0.0 Mobile Safari/537.36"
                .to_string(),
        }
    }
}

/// Browser session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    /// Chromium executable (auto-detected when unset)
    pub executable: Option<PathBuf>,

    pub headless: bool,

    /// Pass --no-sandbox to Chromium
    pub no_sandbox: bool,

    pub device: DeviceProfile,

    /// Record screencast frames under `videos/`
    pub record_video: bool,

    /// Pause after the page reports loaded, before a step acts
    pub settle_delay_ms: u64,

    pub load_timeout_secs: u64,

    /// Delay between typed characters
    pub type_delay_ms: u64,

    /// Wallet bundle injected after the bootstrap prelude. The built-in
    /// impersonating wallet is used when unset.
    pub wallet_script: Option<PathBuf>,

    /// Balance given to the mock wallet account, hex wei
    pub wallet_balance: String,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            executable: None,
            headless: true,
            no_sandbox: false,
            device: DeviceProfile::default(),
            record_video: true,
            settle_delay_ms: 2000,
            load_timeout_secs: 30,
            type_delay_ms: 50,
            wallet_script: None,
            wallet_balance: "0x56BC75E2D63100000".to_string(),
        }
    }
}

impl BrowserConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_secs(self.load_timeout_secs)
    }

    pub fn type_delay(&self) -> Duration {
        Duration::from_millis(self.type_delay_ms)
    }
}

/// Square or rectangular canvas a grounding model encodes images onto
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanvasSize {
    pub width: u32,
    pub height: u32,
}

/// Remote UI grounding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GroundingConfig {
    /// Prediction endpoint receiving `{"data": [...]}`
    pub endpoint: String,

    /// Model revision sent with every request
    pub revision: String,

    /// Letterbox screenshots onto this canvas before sending
    pub encoder_canvas: Option<CanvasSize>,

    /// Longest referring expression sent to the model
    pub max_expression_chars: usize,

    pub timeout_secs: u64,
}

impl Default for GroundingConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:7860/run/predict".to_string(),
            revision: "main".to_string(),
            encoder_canvas: None,
            max_expression_chars: 80,
            timeout_secs: 60,
        }
    }
}

/// Verifier script configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    pub timeout_secs: u64,

    /// File extension to interpreter. Extensions are tried in this order
    /// when a result has no explicit link.
    pub interpreters: BTreeMap<String, String>,

    /// Extension search order for implicit verifier paths
    pub search_order: Vec<String>,

    /// Directory under the story holding verifiers
    pub directory: String,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        let interpreters = [("py", "python3"), ("js", "node"), ("sh", "sh")]
            .into_iter()
            .map(|(ext, cmd)| (ext.to_string(), cmd.to_string()))
            .collect();
        Self {
            timeout_secs: 120,
            interpreters,
            search_order: vec!["py".into(), "js".into(), "sh".into(), String::new()],
            directory: "verifiers".to_string(),
        }
    }
}

impl VerifierConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StoryCheckConfig::default();
        assert_eq!(config.fork.binary, "anvil");
        assert_eq!(config.fork.port, 8545);
        assert_eq!(config.fork.ready_timeout_secs, 30);
        assert_eq!(config.fork.poll_interval_ms, 500);
        assert_eq!(config.browser.device.width, 393);
        assert_eq!(config.grounding.revision, "main");
        assert_eq!(config.verifier.interpreters.get("py").map(String::as_str), Some("python3"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: StoryCheckConfig = toml::from_str(
            r#"
            [fork]
            port = 9545

            [fork.chains]
            31337 = "http://127.0.0.1:9999"

            [grounding]
            encoder_canvas = { width = 1024, height = 1024 }
            "#,
        )
        .unwrap();
        assert_eq!(config.fork.port, 9545);
        assert_eq!(config.fork.host, "127.0.0.1");
        assert_eq!(config.fork.chains.len(), 1);
        assert_eq!(
            config.grounding.encoder_canvas,
            Some(CanvasSize { width: 1024, height: 1024 })
        );
        assert!(config.browser.headless);
    }

    #[test]
    fn test_local_rpc_url_for_wildcard_host() {
        let mut fork = ForkConfig::default();
        assert_eq!(fork.local_rpc_url(), "http://127.0.0.1:8545");
        fork.host = "0.0.0.0".into();
        fork.port = 9000;
        assert_eq!(fork.local_rpc_url(), "http://127.0.0.1:9000");
    }

    #[test]
    fn test_resolve_unknown_chain() {
        let fork = ForkConfig::default();
        let err = fork.resolve_rpc_url("999999").unwrap_err();
        assert!(matches!(err, StoryError::UnknownChain(ref id) if id == "999999"));
    }

    #[test]
    fn test_resolve_literal_url() {
        let mut fork = ForkConfig::default();
        fork.chains.insert("31337".into(), "http://10.0.0.2:8545".into());
        assert_eq!(fork.resolve_rpc_url("31337").unwrap(), "http://10.0.0.2:8545");
    }

    #[test]
    fn test_save_and_load_roundtrip_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storycheck.toml");
        let mut config = StoryCheckConfig::default();
        config.browser.record_video = false;
        config.save(&path).unwrap();

        let loaded = StoryCheckConfig::load(&path).unwrap();
        assert!(!loaded.browser.record_video);
        assert_eq!(loaded.fork.chains.len(), 8);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoryCheckConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.fork.port, 8545);
    }
}
