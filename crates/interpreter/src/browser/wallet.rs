//! Mock wallet injected into every document
//!
//! Each session gets a fresh signing key and the account derived from it. The bootstrap script sets
//! `window.__storycheck__` with the identity and fork details, then runs the
//! wallet bundle, which is either the configured script or the built-in
//! provider that impersonates the account on the fork.

use k256::ecdsa::SigningKey;
use rand::rngs::OsRng;
use sha3::{Digest, Keccak256};
use serde_json::json;
use std::path::Path;
use storycheck_common::{ChainEndpoints, Result, StoryError};

/// Binding the wallet calls with each transaction record (a JSON string)
pub const LOG_TX_BINDING: &str = "__storycheck__logTx";

/// Binding the wallet calls once it is ready for rerouted RPC traffic
pub const REROUTE_BINDING: &str = "__storycheck__enableRpcReroute";

const BUILTIN_WALLET: &str = include_str!("../../assets/mock_wallet.js");

/// Throwaway wallet key and the account it controls
#[derive(Debug, Clone)]
pub struct WalletIdentity {
    pub private_key: String,
    pub account: String,
}

impl WalletIdentity {
    pub fn generate() -> Self {
        Self::from_signing_key(&SigningKey::random(&mut OsRng))
    }

    /// Account is the last 20 bytes of keccak256 over the uncompressed public key
    fn from_signing_key(key: &SigningKey) -> Self {
        let public = key.verifying_key().to_encoded_point(false);
        let digest = Keccak256::digest(&public.as_bytes()[1..]);
        Self {
            private_key: format!("0x{}", hex::encode(key.to_bytes())),
            account: format!("0x{}", hex::encode(&digest[12..])),
        }
    }
}

pub struct WalletBootstrap {
    identity: WalletIdentity,
    rpc_url: String,
    chain_id: Option<u64>,
    balance: String,
    bundle: Option<String>,
}

impl WalletBootstrap {
    pub fn new(
        identity: WalletIdentity,
        rpc_url: impl Into<String>,
        endpoints: Option<&ChainEndpoints>,
        balance: impl Into<String>,
    ) -> Self {
        Self {
            identity,
            rpc_url: rpc_url.into(),
            chain_id: endpoints.and_then(|e| e.chain_id.parse().ok()),
            balance: balance.into(),
            bundle: None,
        }
    }

    /// Use a prebuilt wallet bundle instead of the built-in provider
    pub fn with_bundle(mut self, source: String) -> Self {
        self.bundle = Some(source);
        self
    }

    pub fn load_bundle(path: &Path) -> Result<String> {
        std::fs::read_to_string(path).map_err(|e| {
            StoryError::Config(format!("cannot read wallet script {}: {}", path.display(), e))
        })
    }

    pub fn identity(&self) -> &WalletIdentity {
        &self.identity
    }

    /// Script to evaluate on every new document
    pub fn script(&self) -> Result<String> {
        let prelude = json!({
            "privateKey": self.identity.private_key,
            "account": self.identity.account,
            "rpcUrl": self.rpc_url,
            "chainId": self.chain_id,
            "initialBalance": self.balance,
            "bindings": {
                "logTx": LOG_TX_BINDING,
                "enableRpcReroute": REROUTE_BINDING,
            },
        });
        Ok(format!(
            "window.__storycheck__ = Object.freeze({});\n{}",
            serde_json::to_string(&prelude)?,
            self.bundle.as_deref().unwrap_or(BUILTIN_WALLET)
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints() -> ChainEndpoints {
        ChainEndpoints {
            chain_id: "137".into(),
            remote_rpc_url: "https://polygon.example".into(),
            local_rpc_url: "http://127.0.0.1:8545".into(),
        }
    }

    #[test]
    fn test_identities_are_fresh() {
        let a = WalletIdentity::generate();
        let b = WalletIdentity::generate();
        assert_eq!(a.private_key.len(), 66);
        assert_eq!(a.account.len(), 42);
        assert!(a.account.starts_with("0x"));
        assert!(hex::decode(&a.private_key[2..]).is_ok());
        assert_ne!(a.private_key, b.private_key);
        assert_ne!(a.account, b.account);
    }

    #[test]
    fn test_account_derived_from_key() {
        // anvil's first dev account
        let key = hex::decode("ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80").unwrap();
        let identity = WalletIdentity::from_signing_key(&SigningKey::from_slice(&key).unwrap());
        assert_eq!(identity.account, "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266");
        assert_eq!(
            identity.private_key,
            "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80"
        );
    }

    #[test]
    fn test_script_prelude_then_builtin_wallet() {
        let identity = WalletIdentity::generate();
        let account = identity.account.clone();
        let script = WalletBootstrap::new(identity, "http://127.0.0.1:8545", Some(&endpoints()), "0x1")
            .script()
            .unwrap();

        let (first_line, rest) = script.split_once('\n').unwrap();
        assert!(first_line.starts_with("window.__storycheck__ = Object.freeze({"));
        assert!(first_line.contains(&account));
        assert!(first_line.contains(r#""chainId":137"#));
        assert!(first_line.contains(LOG_TX_BINDING));
        assert!(rest.contains("anvil_impersonateAccount"));
    }

    #[test]
    fn test_custom_bundle_replaces_builtin() {
        let script = WalletBootstrap::new(WalletIdentity::generate(), "http://127.0.0.1:8545", None, "0x1")
            .with_bundle("console.log('custom');".into())
            .script()
            .unwrap();
        assert!(script.contains(r#""chainId":null"#));
        assert!(script.ends_with("console.log('custom');"));
        assert!(!script.contains("anvil_impersonateAccount"));
    }

    #[test]
    fn test_missing_bundle_is_config_error() {
        let err = WalletBootstrap::load_bundle(Path::new("/nonexistent/wallet.js")).unwrap_err();
        assert!(matches!(err, StoryError::Config(_)));
    }
}
