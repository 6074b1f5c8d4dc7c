use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::ChatError;

pub const DEFAULT_CONFIG_PATH: &str = "config/nodechat.json";
pub const DEFAULT_API_PORT: u16 = 8080;
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 5 << 20;

#[derive(Parser, Debug, Default)]
#[command(name = "nodechat", version, about = "Chat node: REST + WebSocket API with peer relay")]
pub struct Cli {
    /// Path to JSON config file
    #[arg(long, env = "NODECHAT_CONFIG", default_value = DEFAULT_CONFIG_PATH, value_name = "FILE")]
    pub config: String,
    /// Username this node speaks for
    #[arg(long, env = "NODECHAT_USERNAME")]
    pub username: Option<String>,
    /// Port to listen on for peer links
    #[arg(long, env = "NODECHAT_PORT")]
    pub port: Option<u16>,
    /// Peer to connect to (ip:port), may be repeated
    #[arg(long)]
    pub connect: Vec<String>,
    /// Port for the HTTP/WebSocket API
    #[arg(long, env = "NODECHAT_API_PORT")]
    pub api_port: Option<u16>,
    #[arg(long, env = "NODECHAT_DATA_DIR")]
    pub data_dir: Option<PathBuf>,
    #[arg(long, env = "NODECHAT_UPLOADS_DIR")]
    pub uploads_dir: Option<PathBuf>,
    /// Directory holding the built web client
    #[arg(long, env = "NODECHAT_STATIC_DIR")]
    pub static_dir: Option<PathBuf>,
    #[arg(long, env = "NODECHAT_MAX_UPLOAD_BYTES")]
    pub max_upload_bytes: Option<u64>,
    #[arg(long, env = "NODECHAT_TLS_CERT")]
    pub tls_cert: Option<PathBuf>,
    #[arg(long, env = "NODECHAT_TLS_KEY")]
    pub tls_key: Option<PathBuf>,
}

/// Settings as read from the config file; every field may be left out.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub username: Option<String>,
    pub port: Option<u16>,
    pub connect: Vec<String>,
    pub api_port: Option<u16>,
    pub data_dir: Option<PathBuf>,
    pub uploads_dir: Option<PathBuf>,
    pub static_dir: Option<PathBuf>,
    pub max_upload_bytes: Option<u64>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub username: String,
    pub p2p_port: u16,
    pub peers: Vec<String>,
    pub api_port: u16,
    pub data_dir: PathBuf,
    pub uploads_dir: PathBuf,
    pub static_dir: PathBuf,
    pub max_upload_bytes: u64,
    pub tls: Option<TlsPaths>,
}

impl NodeConfig {
    /// Merges the config file under the command line; flags win.
    pub fn resolve(cli: Cli) -> Result<Self, ChatError> {
        let file = load_config(&cli.config);
        Self::merge(cli, file)
    }

    fn merge(cli: Cli, file: FileConfig) -> Result<Self, ChatError> {
        let username = cli
            .username
            .or(file.username)
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| ChatError::Config("--username is required".to_string()))?;
        let p2p_port = cli
            .port
            .or(file.port)
            .ok_or_else(|| ChatError::Config("--port is required".to_string()))?;

        let mut peers = file.connect;
        for peer in cli.connect {
            if !peers.contains(&peer) {
                peers.push(peer);
            }
        }

        let tls = match (cli.tls_cert.or(file.tls_cert), cli.tls_key.or(file.tls_key)) {
            (Some(cert), Some(key)) => Some(TlsPaths { cert, key }),
            (None, None) => None,
            _ => {
                return Err(ChatError::Config(
                    "--tls-cert and --tls-key must be given together".to_string(),
                ))
            }
        };

        Ok(Self {
            username,
            p2p_port,
            peers,
            api_port: cli.api_port.or(file.api_port).unwrap_or(DEFAULT_API_PORT),
            data_dir: cli
                .data_dir
                .or(file.data_dir)
                .unwrap_or_else(|| PathBuf::from("databases")),
            uploads_dir: cli
                .uploads_dir
                .or(file.uploads_dir)
                .unwrap_or_else(|| PathBuf::from("uploads")),
            static_dir: cli
                .static_dir
                .or(file.static_dir)
                .unwrap_or_else(|| PathBuf::from("ui/build")),
            max_upload_bytes: cli
                .max_upload_bytes
                .or(file.max_upload_bytes)
                .unwrap_or(DEFAULT_MAX_UPLOAD_BYTES),
            tls,
        })
    }

    /// One database per node username.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}.db", self.username))
    }

    pub fn api_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.api_port))
    }

    pub fn p2p_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.p2p_port))
    }
}

pub fn load_config(path: &str) -> FileConfig {
    let path = Path::new(path);
    match fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<FileConfig>(&content) {
            Ok(config) => config,
            Err(err) => {
                log::warn!("Failed to parse config file {}: {err}", path.display());
                FileConfig::default()
            }
        },
        Err(err) => {
            log::info!(
                "Config file {} not found ({err}); using defaults",
                path.display()
            );
            FileConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli() -> Cli {
        Cli {
            config: DEFAULT_CONFIG_PATH.to_string(),
            ..Cli::default()
        }
    }

    #[test]
    fn flags_override_file_values() {
        let file = FileConfig {
            username: Some("from-file".to_string()),
            port: Some(9000),
            api_port: Some(9100),
            connect: vec!["10.0.0.1:9000".to_string()],
            ..FileConfig::default()
        };
        let cli = Cli {
            username: Some("alice".to_string()),
            connect: vec!["10.0.0.2:9000".to_string(), "10.0.0.1:9000".to_string()],
            ..cli()
        };

        let config = NodeConfig::merge(cli, file).unwrap();
        assert_eq!(config.username, "alice");
        assert_eq!(config.p2p_port, 9000);
        assert_eq!(config.api_port, 9100);
        assert_eq!(config.peers, vec!["10.0.0.1:9000", "10.0.0.2:9000"]);
        assert_eq!(config.database_path(), PathBuf::from("databases/alice.db"));
        assert_eq!(config.max_upload_bytes, DEFAULT_MAX_UPLOAD_BYTES);
    }

    #[test]
    fn username_and_port_are_required() {
        let missing_user = Cli { port: Some(1), ..cli() };
        assert!(matches!(
            NodeConfig::merge(missing_user, FileConfig::default()),
            Err(ChatError::Config(_))
        ));

        let missing_port = Cli { username: Some("bob".to_string()), ..cli() };
        assert!(matches!(
            NodeConfig::merge(missing_port, FileConfig::default()),
            Err(ChatError::Config(_))
        ));
    }

    #[test]
    fn tls_needs_both_paths() {
        let half = Cli {
            username: Some("bob".to_string()),
            port: Some(1),
            tls_cert: Some(PathBuf::from("cert.pem")),
            ..cli()
        };
        assert!(NodeConfig::merge(half, FileConfig::default()).is_err());
    }

    #[test]
    fn unreadable_config_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{ not json").unwrap();
        let config = load_config(path.to_str().unwrap());
        assert!(config.username.is_none());

        let missing = load_config(dir.path().join("absent.json").to_str().unwrap());
        assert!(missing.connect.is_empty());
    }
}
