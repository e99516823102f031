//! Service-node configuration file (servicenode.conf) support
//!
//! Format: alias IP:port nodeprivkey collateral_txid collateral_output_index
//!
//! Example:
//! sn1 51.15.0.9:29100 f0e1...9c secretc84f87eaa86e4e56834c92927a07f9e18718810b92e0d0324456a67c 0

use meridian_core::TxId;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("duplicate alias: {0}")]
    DuplicateAlias(String),
}

/// Single service-node configuration entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceNodeConfigEntry {
    /// Alias/name for this service node
    pub alias: String,

    /// Advertised address, e.g. "51.15.0.9:29100"
    pub address: SocketAddr,

    /// Hex-encoded secret half of the node key (for signing messages)
    pub node_privkey: String,

    /// Collateral transaction id
    pub collateral_txid: TxId,

    /// Collateral output index
    pub collateral_index: u32,
}

impl ServiceNodeConfigEntry {
    /// Parse a single line from servicenode.conf
    pub fn parse_line(line: &str, line_num: usize) -> Result<Option<Self>, ConfigError> {
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(ConfigError::Parse {
                line: line_num,
                message: format!(
                    "expected 5 fields, got {}. Format: alias IP:port privkey txid index",
                    parts.len()
                ),
            });
        }

        let alias = parts[0].to_string();
        let address: SocketAddr = parts[1].parse().map_err(|_| ConfigError::Parse {
            line: line_num,
            message: format!("invalid IP:port: {}", parts[1]),
        })?;
        let node_privkey = parts[2].to_string();
        let collateral_txid: TxId = parts[3].parse().map_err(|_| ConfigError::Parse {
            line: line_num,
            message: format!("invalid transaction id: {}", parts[3]),
        })?;
        let collateral_index = parts[4].parse::<u32>().map_err(|_| ConfigError::Parse {
            line: line_num,
            message: format!("invalid output index: {}", parts[4]),
        })?;

        Ok(Some(Self {
            alias,
            address,
            node_privkey,
            collateral_txid,
            collateral_index,
        }))
    }

    /// Format as a servicenode.conf line
    pub fn to_line(&self) -> String {
        format!(
            "{} {} {} {} {}",
            self.alias, self.address, self.node_privkey, self.collateral_txid, self.collateral_index
        )
    }
}

/// Parsed servicenode.conf
#[derive(Debug, Clone, Default)]
pub struct ServiceNodeConfig {
    pub entries: Vec<ServiceNodeConfigEntry>,
}

impl ServiceNodeConfig {
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let mut entries: Vec<ServiceNodeConfigEntry> = Vec::new();
        for (idx, line) in contents.lines().enumerate() {
            if let Some(entry) = ServiceNodeConfigEntry::parse_line(line, idx + 1)? {
                if entries.iter().any(|e| e.alias == entry.alias) {
                    return Err(ConfigError::DuplicateAlias(entry.alias));
                }
                entries.push(entry);
            }
        }
        Ok(Self { entries })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn find(&self, alias: &str) -> Option<&ServiceNodeConfigEntry> {
        self.entries.iter().find(|e| e.alias == alias)
    }
}
