//! Process configuration, read from an INI file
//!
//! ```ini
//! [dht]
//! role = node
//! peer_id = n10
//! listen_address = 0.0.0.0:8888
//! coordinator = bootstrap
//! object_file = objects.txt
//! delay = 0.5
//!
//! [addresses]
//! bootstrap = 127.0.0.1:8000
//! ```
//! Only `role` is required (plus `peer_id` for nodes). Address tokens without an entry in
//! `[addresses]` are dialed as `token:peer_port`.

use std::collections::HashMap;
use std::fmt::Display;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use ini::{ini, inistr};

use crate::peer_communication::peer_messages::PeerId;
use crate::peer_communication::{AddressBook, DEFAULT_PEER_PORT, DEFAULT_RETRY_DELAY};

type Sections = HashMap<String, HashMap<String, Option<String>>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Coordinator,
    Node(PeerId),
    Client {
        client_id: u64,
        /// Selects the scripted request, see [`scripted_request`](crate::client::scripted_request)
        testcase: Option<u32>,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub role: Role,
    pub listen_address: SocketAddr,
    /// Port used to reach address tokens that have no explicit address
    pub peer_port: u16,
    pub coordinator: String,
    pub client: String,
    pub object_file: PathBuf,
    /// Waited before doing anything else at startup
    pub delay: Duration,
    pub retry_delay: Duration,
    pub addresses: HashMap<String, SocketAddr>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let path_str = path
            .to_str()
            .ok_or_else(|| anyhow!("Config path {} is not valid UTF-8", path.display()))?;
        let sections = ini!(safe path_str)
            .map_err(|e| anyhow!("Failed to read config {}: {}", path.display(), e))?;
        Config::from_sections(sections)
            .with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let sections = inistr!(safe text).map_err(|e| anyhow!("Failed to parse config: {}", e))?;
        Config::from_sections(sections)
    }

    fn from_sections(sections: Sections) -> Result<Self> {
        let empty = HashMap::new();
        let dht = sections
            .get("dht")
            .ok_or_else(|| anyhow!("Missing [dht] section"))?;

        let testcase: Option<u32> = parse_value(dht, "testcase")?;
        let role = match value(dht, "role") {
            Some("coordinator") | Some("bootstrap") => Role::Coordinator,
            Some("node") | Some("peer") => Role::Node(
                parse_value(dht, "peer_id")?
                    .ok_or_else(|| anyhow!("Nodes need a peer_id"))?,
            ),
            Some("client") => Role::Client {
                client_id: match parse_value(dht, "client_id")? {
                    Some(client_id) => client_id,
                    None => testcase.map_or(1, |testcase| u64::from(testcase.saturating_sub(2))),
                },
                testcase,
            },
            Some(other) => return Err(anyhow!("Unknown role {:?}", other)),
            None => return Err(anyhow!("Missing role")),
        };

        let peer_port = parse_value(dht, "peer_port")?.unwrap_or(DEFAULT_PEER_PORT);
        let delay = match parse_value::<f64>(dht, "delay")? {
            Some(seconds) => Duration::try_from_secs_f64(seconds)
                .map_err(|e| anyhow!("Invalid delay {}: {}", seconds, e))?,
            None => Duration::ZERO,
        };

        let mut addresses = HashMap::new();
        for (token, address) in sections.get("addresses").unwrap_or(&empty) {
            let address = address
                .as_deref()
                .ok_or_else(|| anyhow!("Address of {} is empty", token))?;
            let address = address
                .trim()
                .parse()
                .with_context(|| format!("Invalid address for {}", token))?;
            addresses.insert(token.clone(), address);
        }

        Ok(Config {
            role,
            listen_address: parse_value(dht, "listen_address")?
                .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], peer_port))),
            peer_port,
            coordinator: value(dht, "coordinator").unwrap_or("bootstrap").to_string(),
            client: value(dht, "client").unwrap_or("client").to_string(),
            object_file: value(dht, "object_file")
                .unwrap_or("objects.txt")
                .into(),
            delay,
            retry_delay: parse_value(dht, "retry_delay_ms")?
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_RETRY_DELAY),
            addresses,
        })
    }

    /// Address book resolving tokens with this config's port and explicit addresses
    pub fn address_book(&self) -> AddressBook {
        let address_book = AddressBook::new(self.peer_port);
        for (token, address) in &self.addresses {
            address_book.insert(token.clone(), *address);
        }
        address_book
    }
}

fn value<'a>(section: &'a HashMap<String, Option<String>>, key: &str) -> Option<&'a str> {
    section
        .get(key)
        .and_then(|value| value.as_deref())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn parse_value<T>(section: &HashMap<String, Option<String>>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    value(section, key)
        .map(|raw| {
            raw.parse()
                .map_err(|e| anyhow!("Invalid value {:?} for {}: {}", raw, key, e))
        })
        .transpose()
}
