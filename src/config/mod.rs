//! Configuration storage

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::calling::codec::codecs_by_name;
use crate::calling::ice::DEFAULT_STUN_SERVER;
use crate::calling::media_attribute::MediaType;
use crate::calling::ports::{PortRange, AUDIO_PORT_RANGE, VIDEO_PORT_RANGE};
use crate::calling::rtp_session::DEFAULT_MTU;
use crate::calling::sip_call::CallConfig;

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address advertised in SDP (`o=` and `c=` lines)
    pub published_address: IpAddr,
    pub audio_port_range: PortRange,
    pub video_port_range: PortRange,
    /// Offer SDES-SRTP on every media
    pub srtp_enabled: bool,
    pub ice_enabled: bool,
    /// How long to wait for ICE candidate gathering
    pub ice_init_timeout_secs: u64,
    /// `host:port` of the STUN server used for server-reflexive candidates
    pub stun_server: Option<String>,
    /// Allows codecs that need hardware support (H265)
    pub hardware_acceleration: bool,
    pub mtu: u16,
    /// Audio codecs in preference order; empty means all
    pub audio_codecs: Vec<String>,
    /// Video codecs in preference order; empty means all
    pub video_codecs: Vec<String>,
    pub default_video_source: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            published_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            audio_port_range: AUDIO_PORT_RANGE,
            video_port_range: VIDEO_PORT_RANGE,
            srtp_enabled: true,
            ice_enabled: true,
            ice_init_timeout_secs: 35,
            stun_server: Some(DEFAULT_STUN_SERVER.to_string()),
            hardware_acceleration: false,
            mtu: DEFAULT_MTU,
            audio_codecs: Vec::new(),
            video_codecs: Vec::new(),
            default_video_source: "camera://default".to_string(),
        }
    }
}

impl Config {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("net", "ringd", "ringd")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Get config file path
    fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from `path`, defaults when it does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir).context("Failed to create config directory")?;
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content).context("Failed to write config file")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(path, perms).context("Failed to set config permissions")?;
        }

        Ok(())
    }

    fn validate(&self) -> Result<()> {
        for (name, range) in [
            ("audio_port_range", self.audio_port_range),
            ("video_port_range", self.video_port_range),
        ] {
            anyhow::ensure!(
                range.start < range.end,
                "{} is empty ({}-{})",
                name,
                range.start,
                range.end
            );
        }
        anyhow::ensure!(self.ice_init_timeout_secs > 0, "ice_init_timeout_secs must be positive");
        Ok(())
    }

    /// Settings for one call.
    pub fn call_config(&self) -> CallConfig {
        CallConfig {
            published_addr: self.published_address,
            audio_range: self.audio_port_range,
            video_range: self.video_port_range,
            audio_codecs: codecs_by_name(&self.audio_codecs, MediaType::Audio, false),
            video_codecs: codecs_by_name(
                &self.video_codecs,
                MediaType::Video,
                self.hardware_acceleration,
            ),
            secure: self.srtp_enabled,
            ice_enabled: self.ice_enabled,
            ice_init_timeout: Duration::from_secs(self.ice_init_timeout_secs),
            mtu: self.mtu,
            stun_server: self.stun_server.clone().filter(|s| !s.is_empty()),
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            default_video_source: self.default_video_source.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("ringd-{}-{}.toml", name, uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = Config::load_from(&temp_path("missing")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.mtu, 1280);
        assert_eq!(config.ice_init_timeout_secs, 35);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let path = temp_path("partial");
        fs::write(
            &path,
            "published_address = \"192.0.2.10\"\nice_enabled = false\nvideo_codecs = [\"VP8\"]\n",
        )
        .unwrap();
        let config = Config::load_from(&path).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(config.published_address, "192.0.2.10".parse::<IpAddr>().unwrap());
        assert!(!config.ice_enabled);
        assert!(config.srtp_enabled);

        let call = config.call_config();
        assert_eq!(call.video_codecs.len(), 1);
        assert_eq!(call.video_codecs[0].name, "VP8");
        assert_eq!(call.video_codecs[0].payload_type, 96);
        assert!(!call.audio_codecs.is_empty());
        assert_eq!(call.ice_init_timeout, Duration::from_secs(35));
    }

    #[test]
    fn test_save_and_reload() {
        let path = temp_path("save");
        let mut config = Config::default();
        config.hardware_acceleration = true;
        config.audio_port_range = PortRange::new(20000, 20100);
        config.save_to(&path).unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
        let loaded = Config::load_from(&path).unwrap();
        fs::remove_file(&path).unwrap();
        assert_eq!(loaded, config);
        assert!(loaded
            .call_config()
            .video_codecs
            .iter()
            .any(|c| c.name == "H265"));
    }

    #[test]
    fn test_rejects_empty_port_range() {
        let path = temp_path("range");
        fs::write(&path, "[audio_port_range]\nstart = 3000\nend = 3000\n").unwrap();
        let err = Config::load_from(&path).unwrap_err();
        fs::remove_file(&path).unwrap();
        assert!(err.to_string().contains("audio_port_range"));
    }
}
