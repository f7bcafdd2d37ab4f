use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub db_url: String,
    pub db_max_connections: u32,
    pub db_timeout_ms: u64,
    pub admin_secret: Option<String>,
    pub intake_backend: IntakeBackend,
    pub intake_max_keys: usize,
    pub view_cache_ttl_ms: u64,
    pub view_cache_max_entries: usize,
    pub recent_reports_max: i64,
    pub metrics_require_admin: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntakeBackend {
    Database,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for StartupError {}

impl GatewayConfig {
    pub fn load() -> Result<Self, StartupError> {
        let mut merged = HashMap::new();

        if let Ok(config_path) = std::env::var("TRANSIT_CONFIG_PATH") {
            let config_path = config_path.trim();
            if !config_path.is_empty() {
                let file_kv = parse_env_file(config_path)?;
                merged.extend(file_kv);
            }
        }

        merged.extend(std::env::vars());

        Self::from_kv(&merged)
    }

    pub fn from_kv(kv: &HashMap<String, String>) -> Result<Self, StartupError> {
        let bind_addr = parse_socket_addr(
            kv.get("TRANSIT_BIND_ADDR"),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080),
            "TRANSIT_BIND_ADDR",
        )?;

        let admin_secret = kv
            .get("TRANSIT_ADMIN_SECRET")
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());

        let dev_allow_nonlocal_bind =
            parse_bool(kv.get("TRANSIT_DEV_ALLOW_NONLOCAL_BIND")).unwrap_or(false);

        if !bind_addr.ip().is_loopback() && admin_secret.is_none() {
            if dev_allow_nonlocal_bind && is_unspecified_ip(bind_addr.ip()) {
                // Dev-only escape hatch for local containers.
            } else {
                return Err(StartupError {
                    code: "ERR_NONLOCAL_BIND_REQUIRES_ADMIN_SECRET",
                    message: "non-local bind requires TRANSIT_ADMIN_SECRET; refuse startup"
                        .to_string(),
                });
            }
        }

        let db_url = require_nonempty(kv, "TRANSIT_DB_URL")?;

        let db_max_connections = parse_u32(
            kv.get("TRANSIT_DB_MAX_CONNECTIONS"),
            8,
            "TRANSIT_DB_MAX_CONNECTIONS",
        )?;
        if db_max_connections == 0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "TRANSIT_DB_MAX_CONNECTIONS must be >= 1".to_string(),
            });
        }

        let db_timeout_ms = parse_u64(kv.get("TRANSIT_DB_TIMEOUT_MS"), 2000, "TRANSIT_DB_TIMEOUT_MS")?;
        if db_timeout_ms == 0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "TRANSIT_DB_TIMEOUT_MS must be >= 1".to_string(),
            });
        }

        let intake_backend = parse_intake_backend(kv.get("TRANSIT_INTAKE_BACKEND"))?;
        let intake_max_keys = parse_usize(
            kv.get("TRANSIT_INTAKE_MAX_KEYS"),
            16_384,
            "TRANSIT_INTAKE_MAX_KEYS",
        )?;
        if intake_max_keys == 0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "TRANSIT_INTAKE_MAX_KEYS must be >= 1".to_string(),
            });
        }

        let view_cache_ttl_ms = parse_u64(
            kv.get("TRANSIT_VIEW_CACHE_TTL_MS"),
            5000,
            "TRANSIT_VIEW_CACHE_TTL_MS",
        )?;
        let view_cache_max_entries = parse_usize(
            kv.get("TRANSIT_VIEW_CACHE_MAX_ENTRIES"),
            256,
            "TRANSIT_VIEW_CACHE_MAX_ENTRIES",
        )?;

        let recent_reports_max = parse_u32(
            kv.get("TRANSIT_RECENT_REPORTS_MAX"),
            100,
            "TRANSIT_RECENT_REPORTS_MAX",
        )?;
        if recent_reports_max == 0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "TRANSIT_RECENT_REPORTS_MAX must be >= 1".to_string(),
            });
        }

        let metrics_require_admin =
            parse_bool(kv.get("TRANSIT_METRICS_REQUIRE_ADMIN")).unwrap_or(false);
        if metrics_require_admin && admin_secret.is_none() {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "TRANSIT_METRICS_REQUIRE_ADMIN requires TRANSIT_ADMIN_SECRET".to_string(),
            });
        }

        Ok(Self {
            bind_addr,
            db_url,
            db_max_connections,
            db_timeout_ms,
            admin_secret,
            intake_backend,
            intake_max_keys,
            view_cache_ttl_ms,
            view_cache_max_entries,
            recent_reports_max: i64::from(recent_reports_max),
            metrics_require_admin,
        })
    }
}

fn parse_env_file(path: &str) -> Result<HashMap<String, String>, StartupError> {
    let contents = std::fs::read_to_string(path).map_err(|_| StartupError {
        code: "ERR_CONFIG_FILE_READ",
        message: format!("failed to read config file at {}", path),
    })?;

    let mut kv = HashMap::new();

    for (idx, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| StartupError {
            code: "ERR_CONFIG_FILE_PARSE",
            message: format!("invalid config line {} (expected KEY=VALUE)", idx + 1),
        })?;

        let key = key.trim();
        if key.is_empty() {
            return Err(StartupError {
                code: "ERR_CONFIG_FILE_PARSE",
                message: format!("invalid config line {} (empty key)", idx + 1),
            });
        }

        kv.insert(key.to_string(), strip_quotes(value.trim()));
    }

    Ok(kv)
}

fn strip_quotes(s: &str) -> String {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return s[1..bytes.len() - 1].to_string();
        }
    }
    s.to_string()
}

fn require_nonempty(
    kv: &HashMap<String, String>,
    key: &'static str,
) -> Result<String, StartupError> {
    kv.get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(|value| value.to_string())
        .ok_or_else(|| StartupError {
            code: "ERR_MISSING_CONFIG",
            message: format!("missing required config key {}", key),
        })
}

fn parse_socket_addr(
    value: Option<&String>,
    default: SocketAddr,
    key: &'static str,
) -> Result<SocketAddr, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<SocketAddr>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be a valid host:port socket address", key),
        }),
    }
}

fn parse_usize(
    value: Option<&String>,
    default: usize,
    key: &'static str,
) -> Result<usize, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<usize>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn parse_u64(value: Option<&String>, default: u64, key: &'static str) -> Result<u64, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<u64>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn parse_u32(value: Option<&String>, default: u32, key: &'static str) -> Result<u32, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<u32>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn parse_intake_backend(value: Option<&String>) -> Result<IntakeBackend, StartupError> {
    let backend = value
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or("database");

    match backend {
        "database" => Ok(IntakeBackend::Database),
        "memory" => Ok(IntakeBackend::Memory),
        _ => Err(StartupError {
            code: "ERR_INVALID_CONFIG",
            message: "TRANSIT_INTAKE_BACKEND must be database or memory".to_string(),
        }),
    }
}

fn parse_bool(value: Option<&String>) -> Option<bool> {
    let value = value.map(|v| v.trim()).filter(|v| !v.is_empty())?;

    match value {
        "1" | "true" | "TRUE" | "yes" | "YES" => Some(true),
        "0" | "false" | "FALSE" | "no" | "NO" => Some(false),
        _ => None,
    }
}

fn is_unspecified_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_unspecified(),
        IpAddr::V6(v6) => v6.is_unspecified(),
    }
}
