use anyhow::Context;
use clap::Parser;
use flux_config::{ConfigLoader, GlobalConfig};
use flux_gb28181::{Gateway, GatewayConfig};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// 配置目录，包含 global.toml 与 protocols/gb28181.toml
    #[arg(long, default_value = "./config")]
    config_dir: PathBuf,

    #[arg(long)]
    sip_port: Option<u16>,

    #[arg(long)]
    media_port: Option<u16>,

    /// 覆盖配置中的日志级别
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn apply_logging(&self, global: &mut GlobalConfig) {
        if let Some(level) = &self.log_level {
            global.logging.level = level.clone();
        }
    }

    fn apply_gateway(&self, config: &mut GatewayConfig) {
        if let Some(port) = self.sip_port {
            config.sip.port = port;
        }
        if let Some(port) = self.media_port {
            config.media.port = port;
        }
    }
}

/// 加载网关配置
///
/// 协议配置文件不存在时使用默认值；文件存在但无法解析时返回错误。
fn load_gateway_config(loader: &ConfigLoader, args: &Args) -> anyhow::Result<GatewayConfig> {
    let path = loader.protocol_path("gb28181");
    let mut config = if path.exists() {
        loader
            .load_protocol::<GatewayConfig>("gb28181")
            .with_context(|| format!("invalid gb28181 config: {}", path.display()))?
            .server
    } else {
        tracing::warn!(target: "gb28181d", path = %path.display(), "gb28181 config not found, using defaults");
        GatewayConfig::default()
    };
    args.apply_gateway(&mut config);
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let loader = ConfigLoader::new(&args.config_dir);
    let mut global = loader.load_global()?;
    args.apply_logging(&mut global);
    flux_logging::init(&global.logging)?;

    let config = load_gateway_config(&loader, &args)?;
    tracing::info!(
        target: "gb28181d",
        name = %global.system.name,
        sip_port = config.sip.port,
        sip_network = %config.sip.network,
        media_port = config.media.port,
        media_network = %config.media.network,
        auth = config.auth.is_required(),
        "Starting GB28181 gateway"
    );

    let gateway = Gateway::bind(config).await?;

    tokio::select! {
        result = gateway.run() => {
            result?;
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!(target: "gb28181d", "Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn args(config_dir: &std::path::Path) -> Args {
        Args::parse_from([
            "flux-gb28181d",
            "--config-dir",
            config_dir.to_str().unwrap(),
            "--sip-port",
            "15060",
            "--log-level",
            "debug",
        ])
    }

    #[test]
    fn test_cli_overrides_protocol_file() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("protocols")).unwrap();
        fs::write(
            dir.path().join("protocols").join("gb28181.toml"),
            r#"
[server]
heartbeat_interval_secs = 30

[server.sip]
port = 5060
network = "tcp"

[server.media]
port = 30000
"#,
        )
        .unwrap();

        let args = args(dir.path());
        let config = load_gateway_config(&ConfigLoader::new(dir.path()), &args).unwrap();

        assert_eq!(config.sip.port, 15060);
        assert_eq!(config.sip.network, flux_gb28181::Network::Tcp);
        assert_eq!(config.media.port, 30000);
        assert_eq!(config.heartbeat_interval_secs, 30);
    }

    #[test]
    fn test_missing_protocol_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let args = args(dir.path());
        let loader = ConfigLoader::new(dir.path());

        let config = load_gateway_config(&loader, &args).unwrap();
        assert_eq!(config.sip.port, 15060);
        assert_eq!(config.media.port, 58200);

        let mut global = loader.load_global().unwrap();
        args.apply_logging(&mut global);
        assert_eq!(global.logging.level, "debug");
    }

    #[test]
    fn test_malformed_protocol_file_is_error() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("protocols")).unwrap();
        fs::write(
            dir.path().join("protocols").join("gb28181.toml"),
            "[server.auth]\nusername = \"admin\"\npassword = 12345678 oops\n",
        )
        .unwrap();

        let args = args(dir.path());
        assert!(load_gateway_config(&ConfigLoader::new(dir.path()), &args).is_err());

        fs::write(
            dir.path().join("protocols").join("gb28181.toml"),
            "[server.sip]\nport = \"not a port\"\n",
        )
        .unwrap();
        assert!(load_gateway_config(&ConfigLoader::new(dir.path()), &args).is_err());
    }
}
