//! Configuration module
//!
//! This module handles loading and validating configuration from files and
//! command line arguments.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize)]
pub struct HexframeConfig {
    pub general: GeneralConfig,
    pub capture: CaptureConfig,
    pub decode: DecodeConfig,
    pub logging: LoggingConfig,
}

/// General configuration options
#[derive(Debug, Serialize, Deserialize)]
pub struct GeneralConfig {
    pub threads: usize,
}

/// Frame capture configuration
#[derive(Debug, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub interface: Option<String>,
    pub pcap_file: Option<String>,
    pub bpf_filter: Option<String>,
    pub promiscuous: bool,
}

/// Decoder configuration
#[derive(Debug, Serialize, Deserialize)]
pub struct DecodeConfig {
    /// Verify IPv4/ICMP/TCP/UDP checksums while decoding
    pub verify_checksums: bool,
    /// Reassemble fragmented IPv4 datagrams
    pub reassemble_ip: bool,
    /// Seconds an incomplete reassembly may wait for its fragments
    pub reassembly_timeout: u64,
    /// Group decoded frames into flows
    pub track_flows: bool,
    /// Seconds a flow may stay idle before being pruned
    pub flow_timeout: u64,
    /// Soft cap on concurrently tracked flows
    pub max_flows: usize,
}

/// Logging configuration
#[derive(Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub log_level: String,
    pub log_file: Option<String>,
}

impl Default for HexframeConfig {
    fn default() -> Self {
        Self {
            general: GeneralConfig {
                threads: num_cpus::get(),
            },
            capture: CaptureConfig {
                interface: None,
                pcap_file: None,
                bpf_filter: None,
                promiscuous: true,
            },
            decode: DecodeConfig {
                verify_checksums: true,
                reassemble_ip: true,
                reassembly_timeout: 60,
                track_flows: true,
                flow_timeout: 60,
                max_flows: 65536,
            },
            logging: LoggingConfig {
                log_level: "info".to_string(),
                log_file: None,
            },
        }
    }
}

impl HexframeConfig {
    /// Load configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config_str = std::fs::read_to_string(path)?;
        let config: HexframeConfig = toml::from_str(&config_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.general.threads == 0 {
            return Err(ConfigError::ValidationError(
                "Number of threads must be greater than 0".to_string(),
            ));
        }

        if self.capture.interface.is_none() && self.capture.pcap_file.is_none() {
            return Err(ConfigError::ValidationError(
                "Either interface or pcap_file must be specified".to_string(),
            ));
        }

        if self.decode.reassemble_ip && self.decode.reassembly_timeout == 0 {
            return Err(ConfigError::ValidationError(
                "Reassembly timeout must be greater than 0".to_string(),
            ));
        }

        if self.decode.track_flows && self.decode.max_flows == 0 {
            return Err(ConfigError::ValidationError(
                "max_flows must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_needs_a_source() {
        // The default has neither interface nor file, so it fails validation
        let config: HexframeConfig = HexframeConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml_str: &str = r#"
            [general]
            threads = 2

            [capture]
            pcap_file = "traffic.pcap"
            promiscuous = false

            [decode]
            verify_checksums = true
            reassemble_ip = true
            reassembly_timeout = 30
            track_flows = false
            flow_timeout = 60
            max_flows = 1024

            [logging]
            log_level = "debug"
        "#;
        let config: HexframeConfig = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.general.threads, 2);
        assert_eq!(config.capture.pcap_file.as_deref(), Some("traffic.pcap"));
        assert_eq!(config.decode.reassembly_timeout, 30);
    }

    #[test]
    fn test_zero_reassembly_timeout_rejected() {
        let mut config: HexframeConfig = HexframeConfig::default();
        config.capture.pcap_file = Some("traffic.pcap".to_string());
        config.decode.reassembly_timeout = 0;
        assert!(config.validate().is_err());
    }
}
