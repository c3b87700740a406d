//! Daemon configuration: TOML file with environment overrides.
//! Loading hierarchy: env > file > defaults.

use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

pub const DEFAULT_GRE_MTU: u32 = 1562;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Space-separated `phy:vif` backhaul bootstrap tokens.
    pub bootstrap: String,
    /// MTU configured on derived GRE tunnels.
    pub gre_mtu: u32,
    /// Default tracing filter, overridable via RUST_LOG.
    pub log_filter: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bootstrap: String::new(),
            gre_mtu: DEFAULT_GRE_MTU,
            log_filter: "info".to_string(),
        }
    }
}

impl DaemonConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                toml::from_str(&content)
                    .with_context(|| format!("parsing config {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("AIRMESHD_BOOTSTRAP") {
            self.bootstrap = v;
        }
        if let Ok(v) = std::env::var("AIRMESHD_GRE_MTU") {
            if let Ok(mtu) = v.parse() {
                self.gre_mtu = mtu;
            }
        }
        if let Ok(v) = std::env::var("AIRMESHD_LOG_FILTER") {
            self.log_filter = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = DaemonConfig::default();
        assert_eq!(c.gre_mtu, DEFAULT_GRE_MTU);
        assert!(c.bootstrap.is_empty());
    }

    #[test]
    fn parses_toml() {
        let c: DaemonConfig = toml::from_str(
            r#"
            bootstrap = "phy0:bhaul-sta-24 phy1:bhaul-sta-5"
            gre_mtu = 1500
            log_filter = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(c.gre_mtu, 1500);
        assert_eq!(c.bootstrap, "phy0:bhaul-sta-24 phy1:bhaul-sta-5");
    }
}
