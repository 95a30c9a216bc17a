use anyhow::{anyhow, Result};
use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use std::path::{Path, PathBuf};

use crate::GlobalConfig;

/// 环境变量前缀，层级之间用双下划线分隔，例如 `FLUX__SERVER__SIP__PORT`
pub const ENV_PREFIX: &str = "FLUX";
const ENV_SEPARATOR: &str = "__";

/// 配置加载器
pub struct ConfigLoader {
    config_dir: PathBuf,
}

impl ConfigLoader {
    /// 创建配置加载器
    pub fn new<P: AsRef<Path>>(config_dir: P) -> Self {
        Self {
            config_dir: config_dir.as_ref().to_path_buf(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// 加载全局配置
    pub fn load_global(&self) -> Result<GlobalConfig> {
        let config_path = self.config_dir.join("global.toml");

        if !config_path.exists() {
            // 如果配置文件不存在，返回默认配置
            return Ok(GlobalConfig::default());
        }

        let config = Self::file_source(&config_path)?.build()?;
        Ok(config.try_deserialize()?)
    }

    /// 加载协议配置，环境变量覆盖文件中的同名字段
    pub fn load_protocol<T>(&self, protocol_name: &str) -> Result<crate::ProtocolConfig<T>>
    where
        T: serde::de::DeserializeOwned,
    {
        let config_path = self.protocol_path(protocol_name);
        if !config_path.exists() {
            return Err(anyhow!("Protocol config not found: {}", protocol_name));
        }

        let config = Self::file_source(&config_path)?
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// 协议配置文件路径：`{config_dir}/protocols/{name}.toml`
    pub fn protocol_path(&self, protocol_name: &str) -> PathBuf {
        self.config_dir
            .join("protocols")
            .join(format!("{}.toml", protocol_name))
    }

    fn file_source(path: &Path) -> Result<ConfigBuilder<config::builder::DefaultState>> {
        Ok(Config::builder().add_source(File::new(
            path.to_str().ok_or_else(|| anyhow!("Invalid config path"))?,
            FileFormat::Toml,
        )))
    }
}
