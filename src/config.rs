use std::net::SocketAddr;
use std::{env, fs};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use rtsp::Codec;

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub udp: Udp,
    #[serde(default)]
    pub rtsp: Rtsp,
    #[serde(default)]
    pub registry: Registry,
    #[serde(default)]
    pub codec: CodecPriority,
    #[serde(default)]
    pub log: Log,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Udp {
    /// Loopback glue port range, `"MIN-MAX"` inclusive.
    #[serde(default = "default_port_range")]
    pub port_range: String,
}

impl Udp {
    pub fn range(&self) -> Result<(u16, u16)> {
        let (min, max) = self
            .port_range
            .split_once('-')
            .ok_or_else(|| anyhow!("udp.port_range is not MIN-MAX: {}", self.port_range))?;
        let min: u16 = min.trim().parse()?;
        let max: u16 = max.trim().parse()?;
        if min == 0 || min > max {
            return Err(anyhow!("invalid udp.port_range: {}", self.port_range));
        }
        Ok((min, max))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Rtsp {
    #[serde(default = "default_rtsp_listen")]
    pub listen: String,
    /// IP the RTSP server advertises in stream URLs.
    #[serde(default = "default_interface")]
    pub interface: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Registry {
    #[serde(default)]
    pub status_service_url: Option<String>,
    #[serde(default)]
    pub keepalive_service_url: Option<String>,
    /// Heartbeat period in seconds.
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CodecPriority {
    /// Comma-separated video codec preference over {VP8, VP9, H264}.
    /// Absent means no prioritization.
    #[serde(default)]
    pub video_priority: Option<String>,
}

impl CodecPriority {
    pub fn list(&self) -> Vec<Codec> {
        self.video_priority
            .as_deref()
            .unwrap_or("")
            .split(',')
            .filter_map(Codec::from_name)
            .filter(Codec::is_video)
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Log {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_port_range() -> String {
    "4000-5000".to_string()
}

fn default_rtsp_listen() -> String {
    "0.0.0.0:8554".to_string()
}

fn default_interface() -> String {
    "localhost".to_string()
}

fn default_keepalive_interval() -> u64 {
    5
}

fn default_log_level() -> String {
    env::var("LOG_LEVEL").unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            "debug".to_string()
        } else {
            "info".to_string()
        }
    })
}

impl Default for Udp {
    fn default() -> Self {
        Udp {
            port_range: default_port_range(),
        }
    }
}

impl Default for Rtsp {
    fn default() -> Self {
        Rtsp {
            listen: default_rtsp_listen(),
            interface: default_interface(),
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry {
            status_service_url: None,
            keepalive_service_url: None,
            keepalive_interval: default_keepalive_interval(),
        }
    }
}

impl Default for Log {
    fn default() -> Self {
        Log {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn parse(path: Option<String>) -> Result<Self> {
        let result = fs::read_to_string(path.unwrap_or_else(|| String::from("config.toml")))
            .or_else(|_| fs::read_to_string("/etc/livebridge/config.toml"))
            .unwrap_or_default();
        let cfg: Self = toml::from_str(result.as_str())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let _ = self.udp.range()?;
        let _ = self.rtsp_listen()?;
        if self.registry.keepalive_interval == 0 {
            return Err(anyhow!("registry.keepalive_interval cannot be 0"));
        }
        Ok(())
    }

    pub fn rtsp_listen(&self) -> Result<SocketAddr> {
        self.rtsp
            .listen
            .parse()
            .map_err(|e| anyhow!("invalid rtsp.listen [{}]: {}", self.rtsp.listen, e))
    }
}
