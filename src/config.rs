use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub crypto: CryptoConfig,
    pub oauth: OAuthConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CryptoConfig {
    /// Master secret the vault key is derived from. Rotating it invalidates
    /// every stored credential blob; each account then needs reconnecting.
    pub master_key: String,
}

/// Deployment-level OAuth application credentials for the cloud provider.
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub tenant_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Accounts synced in parallel within one batch invocation.
    pub max_concurrency: usize,
    /// Max messages fetched per cycle per account.
    pub fetch_limit: usize,
    /// Per-call timeout for cloud API requests, seconds.
    pub api_timeout_secs: u64,
    /// Per-call timeout for IMAP operations, seconds.
    pub imap_timeout_secs: u64,
    /// Overall deadline for a batch invocation, seconds.
    pub batch_deadline_secs: u64,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            server: ServerConfig {
                host: std::env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: std::env::var("SERVER_PORT")
                    .unwrap_or_else(|_| "3000".to_string())
                    .parse()?,
            },
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")?,
            },
            crypto: CryptoConfig {
                master_key: std::env::var("EMAIL_ENCRYPTION_KEY")?,
            },
            oauth: OAuthConfig {
                client_id: std::env::var("MICROSOFT_CLIENT_ID").unwrap_or_default(),
                client_secret: std::env::var("MICROSOFT_CLIENT_SECRET").unwrap_or_default(),
                tenant_id: std::env::var("MICROSOFT_TENANT_ID")
                    .unwrap_or_else(|_| "common".to_string()),
            },
            sync: SyncConfig {
                max_concurrency: std::env::var("SYNC_MAX_CONCURRENCY")
                    .unwrap_or_else(|_| "4".to_string())
                    .parse()?,
                fetch_limit: std::env::var("SYNC_FETCH_LIMIT")
                    .unwrap_or_else(|_| "50".to_string())
                    .parse()?,
                api_timeout_secs: std::env::var("SYNC_API_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()?,
                imap_timeout_secs: std::env::var("SYNC_IMAP_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "60".to_string())
                    .parse()?,
                batch_deadline_secs: std::env::var("SYNC_BATCH_DEADLINE_SECS")
                    .unwrap_or_else(|_| "300".to_string())
                    .parse()?,
            },
        })
    }
}
