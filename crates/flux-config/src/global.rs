use flux_logging::LoggingConfig;
use serde::Deserialize;

/// 全局配置
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    pub system: SystemConfig,
    pub logging: LoggingConfig,
}

/// 系统配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub name: String,
    pub version: String,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            name: "FLUX GB28181 Gateway".to_string(),
            version: "1.0.0".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_global_config() {
        let config = GlobalConfig::default();
        assert_eq!(config.system.name, "FLUX GB28181 Gateway");
        assert_eq!(config.logging.level, "info");
    }
}
