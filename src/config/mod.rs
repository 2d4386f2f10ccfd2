use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::error;

const DEFAULT_SESSION_TIMEOUT: u64 = 600;
const DEFAULT_MISMATCH_DEPTH: usize = 2;
const DEFAULT_MAX_REACTORS: usize = 5;
const DEFAULT_MAX_PAYLOAD: usize = 1 << 20;
const DEFAULT_GC_INTERVAL: u64 = 10;

// ─── TOML config file ─────────────────────────────────────────────────────────

/// One `[[listener]]` section: a TLS endpoint devices connect to.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    pub address: String,
    pub port: u16,
    /// Accept backlog (default 64).
    pub backlog: Option<u32>,
    /// Server private key (PEM).
    pub key: PathBuf,
    /// Server certificate (PEM).
    pub cert: PathBuf,
    /// Optional intermediate chain appended to the server certificate.
    pub chain: Option<PathBuf>,
    /// Optional client CA bundle; unused entries are harmless.
    pub ca: Option<PathBuf>,
    /// Certificate every device certificate must be issued by.
    pub issuer: PathBuf,
}

#[derive(Deserialize, Default)]
struct CertificatesToml {
    /// Admit devices whose certificate CN does not match the claimed serial
    /// (recorded as a mismatch rather than rejected). Default: true.
    allow_mismatch: Option<bool>,
    /// Trailing hex digits of the serial that may differ from the CN before
    /// a mismatch is declared. Default: 2.
    mismatch_depth: Option<usize>,
}

#[derive(Deserialize, Default)]
struct AutoProvisioningToml {
    /// Comma list containing `prov` and/or `default`.
    process: Option<String>,
}

/// `{data_dir}/gateway.toml` — all fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// Log level filter string, e.g. "debug", "info,apgwd=trace" (default: "info").
    log: Option<String>,
    /// Idle threshold in seconds before GC reaps a session (default: 600).
    session_timeout: Option<u64>,
    /// I/O worker threads for the connection reactor pool (default: 5).
    max_reactors: Option<usize>,
    /// Maximum WebSocket payload size in bytes (default: 1 MiB).
    max_payload: Option<usize>,
    /// Non-empty marks this instance as a simulator peer.
    simulator_id: Option<String>,
    certificates: Option<CertificatesToml>,
    autoprovisioning: Option<AutoProvisioningToml>,
    #[serde(default)]
    listener: Vec<ListenerConfig>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("gateway.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse gateway.toml — using defaults");
            None
        }
    }
}

// ─── GatewayConfig ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub data_dir: PathBuf,
    pub log: String,
    pub listeners: Vec<ListenerConfig>,
    /// Admit CN↔serial mismatches (flagged, not rejected).
    pub allow_mismatch: bool,
    /// Tolerated trailing-digit difference in the CN↔serial comparison.
    pub mismatch_depth: usize,
    /// Idle threshold in seconds used by the registry GC.
    pub session_timeout: u64,
    /// Seconds between GC ticks.
    pub gc_interval: u64,
    /// Reactor pool size (tokio worker threads for connection I/O).
    pub max_reactors: usize,
    /// Maximum inbound WebSocket payload; oversized frames close the connection.
    pub max_payload: usize,
    /// Create a default device record on first connect of an unknown serial.
    pub use_default_config: bool,
    /// Defer unknown serials to the provisioning service.
    pub look_at_provisioning: bool,
    /// Non-empty marks this instance as a simulator peer.
    pub simulator_id: String,
}

impl GatewayConfig {
    /// Build config from CLI/env args + optional TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env — passed as `Some(value)` from clap
    ///   2. TOML file at `{data_dir}/gateway.toml`
    ///   3. Built-in defaults
    pub fn new(data_dir: Option<PathBuf>, log: Option<String>) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();

        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());
        let session_timeout = toml.session_timeout.unwrap_or(DEFAULT_SESSION_TIMEOUT);
        let max_reactors = toml.max_reactors.unwrap_or(DEFAULT_MAX_REACTORS);
        let max_payload = toml.max_payload.unwrap_or(DEFAULT_MAX_PAYLOAD);
        let simulator_id = toml.simulator_id.unwrap_or_default();

        let certs = toml.certificates.unwrap_or_default();
        let allow_mismatch = certs.allow_mismatch.unwrap_or(true);
        let mismatch_depth = certs.mismatch_depth.unwrap_or(DEFAULT_MISMATCH_DEPTH);

        let (look_at_provisioning, use_default_config) = parse_provisioning(
            toml.autoprovisioning
                .unwrap_or_default()
                .process
                .as_deref()
                .unwrap_or("default"),
        );

        Self {
            data_dir,
            log,
            listeners: toml.listener,
            allow_mismatch,
            mismatch_depth,
            session_timeout,
            gc_interval: DEFAULT_GC_INTERVAL,
            max_reactors,
            max_payload,
            use_default_config,
            look_at_provisioning,
            simulator_id,
        }
    }

    pub fn simulator_enabled(&self) -> bool {
        !self.simulator_id.is_empty()
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".apgwd"),
            log: "info".to_string(),
            listeners: Vec::new(),
            allow_mismatch: true,
            mismatch_depth: DEFAULT_MISMATCH_DEPTH,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            gc_interval: DEFAULT_GC_INTERVAL,
            max_reactors: DEFAULT_MAX_REACTORS,
            max_payload: DEFAULT_MAX_PAYLOAD,
            use_default_config: true,
            look_at_provisioning: false,
            simulator_id: String::new(),
        }
    }
}

/// `"default"` (or an unset key) enables default-device creation; a comma
/// list may add `prov` to defer unknown serials to provisioning.
fn parse_provisioning(process: &str) -> (bool, bool) {
    if process == "default" {
        return (false, true);
    }
    let mut prov = false;
    let mut default_config = false;
    for token in process.split(',') {
        match token.trim() {
            "prov" => prov = true,
            "" => {}
            _ => default_config = true,
        }
    }
    (prov, default_config)
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        // $XDG_DATA_HOME/apgwd or ~/.local/share/apgwd
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("apgwd");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("apgwd");
        }
    }
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("apgwd");
        }
    }
    // Fallback
    PathBuf::from(".apgwd")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisioning_modes() {
        assert_eq!(parse_provisioning("default"), (false, true));
        assert_eq!(parse_provisioning("prov"), (true, false));
        assert_eq!(parse_provisioning("prov,default"), (true, true));
    }

    #[test]
    fn toml_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("gateway.toml"),
            r#"
session_timeout = 120
max_reactors = 3

[certificates]
allow_mismatch = false
mismatch_depth = 4
"#,
        )
        .unwrap();

        let cfg = GatewayConfig::new(Some(dir.path().to_path_buf()), None);
        assert_eq!(cfg.session_timeout, 120);
        assert_eq!(cfg.max_reactors, 3);
        assert!(!cfg.allow_mismatch);
        assert_eq!(cfg.mismatch_depth, 4);
        // Untouched fields keep their defaults.
        assert!(cfg.use_default_config);
        assert_eq!(cfg.max_payload, 1 << 20);
    }
}
