//! Configuration loading and profile resolution
//!
//! The raw TOML surface mirrors the deployment format: `mode`, `listen`,
//! `psk`, client `paths`, server `maps`/`forward` listeners, and the
//! `mimic`/`obfs`/`smux`/`fragment` knob sections. A human `profile` tag
//! expands into concrete knobs first, then explicit fields override it.

use crate::mimic::MimicParams;
use crate::obfs::ObfsParams;
use crate::transport::tls::BrowserProfile;
use crate::transport::FragmentParams;
use crate::tunnel::MuxConfig;
use crate::Error;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Process role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Server,
    Client,
}

/// Transport kind of a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Plain TCP carrying the HTTP mimicry
    HttpMimic,
    /// TLS with a browser fingerprint around the HTTP mimicry
    TlsHttpMimic,
}

/// One candidate route to the peer. Immutable after load.
#[derive(Debug, Clone)]
pub struct PathSettings {
    pub transport: TransportKind,
    pub addr: String,
    pub connection_pool: usize,
    pub aggressive: bool,
    pub retry_interval: Duration,
    pub dial_timeout: Duration,
}

/// Protocol of a server listener map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapProto {
    Tcp,
    Udp,
}

/// One `bind -> target` listener
#[derive(Debug, Clone)]
pub struct MapEntry {
    pub proto: MapProto,
    pub bind: String,
    pub target: String,
}

/// Human preset tags expanding into concrete knobs for every layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Profile {
    Speed,
    Gaming,
    Streaming,
    LowCpu,
    #[default]
    Balanced,
}

struct Preset {
    pool: usize,
    retry: Duration,
    dial_timeout: Duration,
    recv_buf: usize,
    keepalive: Duration,
    tcp_keepalive: Option<Duration>,
}

impl Profile {
    pub fn from_tag(tag: &str) -> Self {
        match tag.to_lowercase().as_str() {
            "speed" | "aggressive" => Self::Speed,
            "gaming" | "latency" => Self::Gaming,
            "streaming" => Self::Streaming,
            "lowcpu" => Self::LowCpu,
            "" | "balanced" => Self::Balanced,
            other => {
                warn!("unknown profile {:?}, using balanced", other);
                Self::Balanced
            }
        }
    }

    fn preset(self) -> Preset {
        let secs = Duration::from_secs;
        match self {
            Self::Speed => Preset {
                pool: 4,
                retry: secs(2),
                dial_timeout: secs(10),
                recv_buf: 512 * 1024,
                keepalive: secs(1),
                tcp_keepalive: None,
            },
            Self::Gaming => Preset {
                pool: 4,
                retry: secs(1),
                dial_timeout: secs(5),
                recv_buf: 512 * 1024,
                keepalive: secs(1),
                tcp_keepalive: Some(secs(1)),
            },
            Self::Streaming => Preset {
                pool: 3,
                retry: secs(2),
                dial_timeout: secs(10),
                recv_buf: 1024 * 1024,
                keepalive: secs(1),
                tcp_keepalive: None,
            },
            Self::LowCpu => Preset {
                pool: 2,
                retry: secs(5),
                dial_timeout: secs(15),
                recv_buf: 256 * 1024,
                keepalive: secs(3),
                tcp_keepalive: None,
            },
            Self::Balanced => Preset {
                pool: 3,
                retry: secs(3),
                dial_timeout: secs(10),
                recv_buf: 512 * 1024,
                keepalive: secs(1),
                tcp_keepalive: None,
            },
        }
    }
}

/// Resolved runtime configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub listen: String,
    pub psk: String,
    pub profile: Profile,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub tls_profile: BrowserProfile,
    pub paths: Vec<PathSettings>,
    pub maps: Vec<MapEntry>,
    pub mimic: MimicParams,
    pub obfs: ObfsParams,
    pub mux: MuxConfig,
    pub fragment: FragmentParams,
    pub tcp_keepalive: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        let preset = Profile::Balanced.preset();
        Self {
            mode: Mode::Client,
            listen: String::new(),
            psk: String::new(),
            profile: Profile::Balanced,
            tls_cert: None,
            tls_key: None,
            tls_profile: BrowserProfile::Chrome,
            paths: Vec::new(),
            maps: Vec::new(),
            mimic: MimicParams::default(),
            obfs: ObfsParams::default(),
            mux: MuxConfig {
                keepalive: preset.keepalive,
                max_recv: preset.recv_buf,
                max_stream: preset.recv_buf,
                frame_size: 2048,
                version: 1,
            },
            fragment: FragmentParams::default(),
            tcp_keepalive: None,
        }
    }
}

impl Config {
    /// Load and resolve configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("failed to read config: {}", e)))?;
        Self::parse(&content)
    }

    /// Parse and resolve configuration from a TOML string.
    pub fn parse(content: &str) -> crate::Result<Self> {
        let raw: RawConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;
        resolve(raw)
    }
}

// ---------------------------------------------------------------------------
// raw TOML surface

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawConfig {
    mode: String,
    listen: String,
    psk: String,
    profile: String,
    tls_cert: Option<String>,
    tls_key: Option<String>,
    tls_profile: Option<String>,
    paths: Vec<RawPath>,
    maps: Vec<RawMap>,
    forward: RawForward,
    mimic: RawMimic,
    obfs: RawObfs,
    smux: RawMux,
    fragment: RawFragment,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawPath {
    transport: String,
    addr: String,
    connection_pool: Option<usize>,
    #[serde(alias = "aggressive_pool")]
    aggressive: bool,
    /// seconds
    retry_interval: Option<u64>,
    /// seconds
    dial_timeout: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawMap {
    #[serde(rename = "type")]
    kind: String,
    bind: String,
    target: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawForward {
    tcp: Vec<String>,
    udp: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawMimic {
    fake_domain: String,
    fake_path: String,
    user_agent: String,
    custom_headers: Vec<String>,
    session_cookie: bool,
    chunked: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawObfs {
    enabled: bool,
    min_padding: Option<usize>,
    max_padding: Option<usize>,
    min_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawMux {
    /// seconds
    keepalive: Option<u64>,
    max_recv: Option<usize>,
    max_stream: Option<usize>,
    frame_size: Option<usize>,
    version: Option<u8>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawFragment {
    enabled: bool,
    min_size: Option<usize>,
    max_size: Option<usize>,
    /// milliseconds
    min_delay: Option<u64>,
    max_delay: Option<u64>,
}

// ---------------------------------------------------------------------------
// resolution

fn resolve(raw: RawConfig) -> crate::Result<Config> {
    let mode = match raw.mode.trim().to_lowercase().as_str() {
        "server" => Mode::Server,
        "client" => Mode::Client,
        other => {
            return Err(Error::Config(format!(
                "mode must be \"server\" or \"client\", got {:?}",
                other
            )))
        }
    };

    let profile = Profile::from_tag(&raw.profile);
    let preset = profile.preset();

    if raw.psk.is_empty() {
        warn!("empty psk: envelope runs in pass-through mode (diagnostics only)");
    }

    let mux = MuxConfig {
        keepalive: raw
            .smux
            .keepalive
            .map(Duration::from_secs)
            .unwrap_or(preset.keepalive),
        max_recv: raw.smux.max_recv.unwrap_or(preset.recv_buf),
        max_stream: raw.smux.max_stream.unwrap_or(preset.recv_buf),
        frame_size: raw.smux.frame_size.unwrap_or(2048),
        version: raw.smux.version.unwrap_or(1),
    };

    let obfs = ObfsParams {
        enabled: raw.obfs.enabled,
        min_padding: raw.obfs.min_padding.unwrap_or(16),
        max_padding: raw.obfs.max_padding.unwrap_or(128),
        min_delay_ms: raw.obfs.min_delay_ms.unwrap_or(0),
        max_delay_ms: raw.obfs.max_delay_ms.unwrap_or(0),
    };

    let fragment_defaults = FragmentParams::default();
    let fragment = FragmentParams {
        enabled: raw.fragment.enabled,
        min_size: raw.fragment.min_size.unwrap_or(fragment_defaults.min_size),
        max_size: raw.fragment.max_size.unwrap_or(fragment_defaults.max_size),
        min_delay_ms: raw
            .fragment
            .min_delay
            .unwrap_or(fragment_defaults.min_delay_ms),
        max_delay_ms: raw
            .fragment
            .max_delay
            .unwrap_or(fragment_defaults.max_delay_ms),
    };

    let mimic_defaults = MimicParams::default();
    let mimic = MimicParams {
        fake_domain: non_empty(raw.mimic.fake_domain, mimic_defaults.fake_domain),
        fake_path: normalize_path(non_empty(raw.mimic.fake_path, mimic_defaults.fake_path)),
        user_agent: non_empty(raw.mimic.user_agent, mimic_defaults.user_agent),
        custom_headers: raw.mimic.custom_headers,
        session_cookie: raw.mimic.session_cookie,
        chunked: raw.mimic.chunked,
    };

    let mut paths = Vec::with_capacity(raw.paths.len());
    for (i, p) in raw.paths.into_iter().enumerate() {
        if p.addr.is_empty() {
            return Err(Error::Config(format!("paths[{}] is missing addr", i)));
        }
        paths.push(PathSettings {
            transport: parse_transport(&p.transport)?,
            addr: p.addr,
            connection_pool: p.connection_pool.unwrap_or(preset.pool).max(1),
            aggressive: p.aggressive,
            retry_interval: p
                .retry_interval
                .map(Duration::from_secs)
                .unwrap_or(preset.retry),
            dial_timeout: p
                .dial_timeout
                .map(Duration::from_secs)
                .unwrap_or(preset.dial_timeout),
        });
    }

    let mut maps = Vec::new();
    for (i, m) in raw.maps.into_iter().enumerate() {
        if m.bind.is_empty() || m.target.is_empty() {
            return Err(Error::Config(format!("maps[{}] needs bind and target", i)));
        }
        let bind = normalize_bind(&m.bind);
        match m.kind.trim().to_lowercase().as_str() {
            "udp" => maps.push(MapEntry {
                proto: MapProto::Udp,
                bind,
                target: m.target,
            }),
            "both" => {
                maps.push(MapEntry {
                    proto: MapProto::Tcp,
                    bind: bind.clone(),
                    target: m.target.clone(),
                });
                maps.push(MapEntry {
                    proto: MapProto::Udp,
                    bind,
                    target: m.target,
                });
            }
            // unlabelled maps forward tcp
            _ => maps.push(MapEntry {
                proto: MapProto::Tcp,
                bind,
                target: m.target,
            }),
        }
    }
    for entry in &raw.forward.tcp {
        let (bind, target) = split_map(entry)
            .ok_or_else(|| Error::Config(format!("bad forward.tcp entry {:?}", entry)))?;
        maps.push(MapEntry {
            proto: MapProto::Tcp,
            bind,
            target,
        });
    }
    for entry in &raw.forward.udp {
        let (bind, target) = split_map(entry)
            .ok_or_else(|| Error::Config(format!("bad forward.udp entry {:?}", entry)))?;
        maps.push(MapEntry {
            proto: MapProto::Udp,
            bind,
            target,
        });
    }

    Ok(Config {
        mode,
        listen: raw.listen,
        psk: raw.psk,
        profile,
        tls_cert: raw.tls_cert,
        tls_key: raw.tls_key,
        tls_profile: BrowserProfile::from_tag(raw.tls_profile.as_deref().unwrap_or("chrome")),
        paths,
        maps,
        mimic,
        obfs,
        mux,
        fragment,
        tcp_keepalive: preset.tcp_keepalive,
    })
}

fn parse_transport(tag: &str) -> crate::Result<TransportKind> {
    match tag.trim().to_lowercase().as_str() {
        "" | "httpmux" | "http" => Ok(TransportKind::HttpMimic),
        "httpsmux" | "https" | "tls" => Ok(TransportKind::TlsHttpMimic),
        other => Err(Error::Config(format!("unknown transport {:?}", other))),
    }
}

fn non_empty(value: String, fallback: String) -> String {
    if value.is_empty() {
        fallback
    } else {
        value
    }
}

fn normalize_path(mut p: String) -> String {
    if !p.starts_with('/') {
        p.insert(0, '/');
    }
    p
}

fn normalize_bind(bind: &str) -> String {
    if bind.contains(':') {
        bind.to_string()
    } else {
        format!("0.0.0.0:{}", bind)
    }
}

/// Parse a `bind->target` mapping. A bare port on the bind side defaults to
/// all interfaces.
fn split_map(entry: &str) -> Option<(String, String)> {
    let (bind, target) = entry.split_once("->")?;
    let bind = bind.trim();
    let target = target.trim();
    if bind.is_empty() || target.is_empty() {
        return None;
    }
    Some((normalize_bind(bind), target.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_table() {
        let speed = Profile::Speed.preset();
        assert_eq!(speed.pool, 4);
        assert_eq!(speed.retry, Duration::from_secs(2));
        assert_eq!(speed.recv_buf, 512 * 1024);

        let gaming = Profile::Gaming.preset();
        assert_eq!(gaming.pool, 4);
        assert_eq!(gaming.dial_timeout, Duration::from_secs(5));
        assert_eq!(gaming.tcp_keepalive, Some(Duration::from_secs(1)));

        let streaming = Profile::Streaming.preset();
        assert_eq!(streaming.recv_buf, 1024 * 1024);

        let lowcpu = Profile::LowCpu.preset();
        assert_eq!(lowcpu.pool, 2);
        assert_eq!(lowcpu.keepalive, Duration::from_secs(3));

        let balanced = Profile::Balanced.preset();
        assert_eq!(balanced.pool, 3);
        assert_eq!(balanced.retry, Duration::from_secs(3));
    }

    #[test]
    fn test_profile_tags() {
        assert_eq!(Profile::from_tag("aggressive"), Profile::Speed);
        assert_eq!(Profile::from_tag("latency"), Profile::Gaming);
        assert_eq!(Profile::from_tag(""), Profile::Balanced);
        assert_eq!(Profile::from_tag("whatever"), Profile::Balanced);
    }

    #[test]
    fn test_minimal_client_config() {
        let cfg = Config::parse(
            r#"
mode = "client"
psk = "secret"

[[paths]]
addr = "198.51.100.7:443"
transport = "httpsmux"
"#,
        )
        .unwrap();

        assert_eq!(cfg.mode, Mode::Client);
        assert_eq!(cfg.paths.len(), 1);
        assert_eq!(cfg.paths[0].transport, TransportKind::TlsHttpMimic);
        // balanced preset fills the rest
        assert_eq!(cfg.paths[0].connection_pool, 3);
        assert_eq!(cfg.paths[0].retry_interval, Duration::from_secs(3));
        assert_eq!(cfg.mux.frame_size, 2048);
        assert_eq!(cfg.mux.keepalive, Duration::from_secs(1));
    }

    #[test]
    fn test_explicit_fields_override_preset() {
        let cfg = Config::parse(
            r#"
mode = "client"
psk = "secret"
profile = "lowcpu"

[[paths]]
addr = "198.51.100.7:80"
connection_pool = 7
retry_interval = 1

[smux]
keepalive = 9
max_recv = 65536
"#,
        )
        .unwrap();

        // explicit values win over the lowcpu preset
        assert_eq!(cfg.paths[0].connection_pool, 7);
        assert_eq!(cfg.paths[0].retry_interval, Duration::from_secs(1));
        assert_eq!(cfg.mux.keepalive, Duration::from_secs(9));
        assert_eq!(cfg.mux.max_recv, 65536);
        // untouched fields still come from the preset
        assert_eq!(cfg.paths[0].dial_timeout, Duration::from_secs(15));
    }

    #[test]
    fn test_maps_and_forward_merge() {
        let cfg = Config::parse(
            r#"
mode = "server"
listen = "0.0.0.0:2020"
psk = "secret"

[[maps]]
type = "both"
bind = "7000"
target = "127.0.0.1:22"

[forward]
tcp = ["0.0.0.0:1457->127.0.0.1:1457"]
udp = ["5353 -> 127.0.0.1:53"]
"#,
        )
        .unwrap();

        assert_eq!(cfg.maps.len(), 4);
        assert_eq!(cfg.maps[0].proto, MapProto::Tcp);
        assert_eq!(cfg.maps[0].bind, "0.0.0.0:7000");
        assert_eq!(cfg.maps[1].proto, MapProto::Udp);
        assert_eq!(cfg.maps[2].bind, "0.0.0.0:1457");
        assert_eq!(cfg.maps[3].proto, MapProto::Udp);
        assert_eq!(cfg.maps[3].bind, "0.0.0.0:5353");
        assert_eq!(cfg.maps[3].target, "127.0.0.1:53");
    }

    #[test]
    fn test_aggressive_pool_alias() {
        let cfg = Config::parse(
            r#"
mode = "client"
psk = "s"

[[paths]]
addr = "h:1"
aggressive_pool = true
"#,
        )
        .unwrap();
        assert!(cfg.paths[0].aggressive);
    }

    #[test]
    fn test_mimic_path_normalized() {
        let cfg = Config::parse(
            r#"
mode = "server"
listen = ":1"
psk = "s"

[mimic]
fake_domain = "cdn.example.com"
fake_path = "assets/{rand}"
"#,
        )
        .unwrap();
        assert_eq!(cfg.mimic.fake_path, "/assets/{rand}");
        assert_eq!(cfg.mimic.path_prefix(), "/assets/");
    }

    #[test]
    fn test_bad_mode_rejected() {
        assert!(Config::parse("mode = \"relay\"").is_err());
        assert!(Config::parse("").is_err());
    }

    #[test]
    fn test_unknown_top_level_key_rejected() {
        assert!(Config::parse("mode = \"client\"\nbogus = 1").is_err());
    }
}
