//! Configuration & CLI (C10).
//!
//! `DaemonConfig` is the single source of truth the core reads from.
//! It is built by parsing process arguments with `getopts`, with an
//! optional `--config FILE` TOML file applied first so flags always
//! win over the file.

use std::fs;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;

use getopts::Options;
use serde::Deserialize;

use crate::dns::errors::DaemonError;

#[derive(Debug, Clone, PartialEq)]
pub struct ServerSpec {
    pub addr: SocketAddrV4,
    pub interface: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpecialHost {
    pub name: String,
    pub interface: String,
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub bind_address: SocketAddr,
    pub servers: Vec<ServerSpec>,
    pub default_interfaces: Vec<String>,
    pub special_hosts: Vec<SpecialHost>,
    pub forward_timeout: i64,
    pub retry_interval: i64,
    pub max_sockets: usize,
    pub excluded_ports: Vec<u16>,
    /// Accepted from `-l`/`load_balance`, stored on `Interface`;
    /// currently a no-op (§9 Open Questions).
    pub round_robin: bool,
    pub ignore_inactive_cache_hits: bool,
    pub masterfile_path: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            bind_address: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 53)),
            servers: Vec::new(),
            default_interfaces: Vec::new(),
            special_hosts: Vec::new(),
            forward_timeout: 10,
            retry_interval: 60,
            max_sockets: 512,
            excluded_ports: Vec::new(),
            round_robin: false,
            ignore_inactive_cache_hits: false,
            masterfile_path: None,
        }
    }
}

/// Mirrors `DaemonConfig`'s shape for the optional TOML file. Every
/// field is optional since the file may set only a subset, with flags
/// applied afterward to override it.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    bind_address: Option<String>,
    servers: Option<Vec<String>>,
    default_interfaces: Option<Vec<String>>,
    special_hosts: Option<Vec<String>>,
    forward_timeout: Option<i64>,
    retry_interval: Option<i64>,
    max_sockets: Option<usize>,
    exclude_port: Option<Vec<u16>>,
    load_balance: Option<bool>,
    ignore_inactive_cache_hits: Option<bool>,
    masterfile: Option<String>,
}

fn parse_server_spec(s: &str) -> Result<ServerSpec, DaemonError> {
    let (addr_part, iface) = s
        .split_once('@')
        .ok_or_else(|| DaemonError::Config(format!("invalid server spec {:?}, expected ip[:port]@iface", s)))?;
    let addr = if addr_part.contains(':') {
        addr_part
            .parse::<SocketAddrV4>()
            .map_err(|e| DaemonError::Config(format!("invalid server address {:?}: {}", addr_part, e)))?
    } else {
        let ip: Ipv4Addr = addr_part
            .parse()
            .map_err(|e| DaemonError::Config(format!("invalid server address {:?}: {}", addr_part, e)))?;
        SocketAddrV4::new(ip, 53)
    };
    Ok(ServerSpec {
        addr,
        interface: iface.to_string(),
    })
}

fn parse_special_host(s: &str) -> Result<SpecialHost, DaemonError> {
    let (name, iface) = s
        .split_once('@')
        .ok_or_else(|| DaemonError::Config(format!("invalid special-host spec {:?}, expected name@iface", s)))?;
    Ok(SpecialHost {
        name: name.to_string(),
        interface: iface.to_string(),
    })
}

impl DaemonConfig {
    fn options() -> Options {
        let mut opts = Options::new();
        opts.optopt("b", "bind-address", "local bind address", "ADDR");
        opts.optmulti("s", "server", "upstream ip[:port]@iface (repeatable)", "SPEC");
        opts.optmulti("i", "default-interface", "default egress interface (repeatable)", "IFACE");
        opts.optmulti("", "special-host", "pin a name to an interface: name@iface", "SPEC");
        opts.optopt("t", "forward-timeout", "per-query TTL in seconds", "SECS");
        opts.optopt("r", "retry-interval", "deactivated-server retry delay; 0 disables", "SECS");
        opts.optopt("m", "max-sockets", "concurrent upstream socket ceiling", "N");
        opts.optmulti("x", "exclude-port", "exclude a source port (repeatable)", "PORT");
        opts.optflag("l", "load-balance", "enable per-interface round robin (accepted, currently a no-op)");
        opts.optflag(
            "",
            "ignore-inactive-cache-hits",
            "bypass the cache for queries a deactivated server would have served",
        );
        opts.optopt("", "config", "load a TOML config file before applying flags", "FILE");
        opts.optopt("", "masterfile", "optional don't-know/blacklist zone file", "FILE");
        opts.optflag("h", "help", "print usage and exit");
        opts
    }

    pub fn usage(program: &str) -> String {
        Self::options().usage(&format!("Usage: {} [options]", program))
    }

    pub fn from_args(args: &[String]) -> Result<DaemonConfig, DaemonError> {
        let opts = Self::options();
        let matches = opts.parse(args).map_err(|e| DaemonError::Config(e.to_string()))?;

        let mut config = DaemonConfig::default();

        if let Some(path) = matches.opt_str("config") {
            config.apply_file(&PathBuf::from(path))?;
        }

        if let Some(addr) = matches.opt_str("b") {
            config.bind_address = addr
                .parse()
                .map_err(|e| DaemonError::Config(format!("invalid bind address {:?}: {}", addr, e)))?;
        }
        for spec in matches.opt_strs("s") {
            config.servers.push(parse_server_spec(&spec)?);
        }
        for iface in matches.opt_strs("i") {
            config.default_interfaces.push(iface);
        }
        for spec in matches.opt_strs("special-host") {
            config.special_hosts.push(parse_special_host(&spec)?);
        }
        if let Some(v) = matches.opt_str("t") {
            config.forward_timeout = v
                .parse()
                .map_err(|e| DaemonError::Config(format!("invalid --forward-timeout {:?}: {}", v, e)))?;
        }
        if let Some(v) = matches.opt_str("r") {
            config.retry_interval = v
                .parse()
                .map_err(|e| DaemonError::Config(format!("invalid --retry-interval {:?}: {}", v, e)))?;
        }
        if let Some(v) = matches.opt_str("m") {
            config.max_sockets = v
                .parse()
                .map_err(|e| DaemonError::Config(format!("invalid --max-sockets {:?}: {}", v, e)))?;
        }
        for p in matches.opt_strs("x") {
            config
                .excluded_ports
                .push(p.parse().map_err(|e| DaemonError::Config(format!("invalid --exclude-port {:?}: {}", p, e)))?);
        }
        if matches.opt_present("l") {
            config.round_robin = true;
        }
        if matches.opt_present("ignore-inactive-cache-hits") {
            config.ignore_inactive_cache_hits = true;
        }
        if let Some(path) = matches.opt_str("masterfile") {
            config.masterfile_path = Some(PathBuf::from(path));
        }

        Ok(config)
    }

    fn apply_file(&mut self, path: &PathBuf) -> Result<(), DaemonError> {
        let text = fs::read_to_string(path).map_err(DaemonError::Io)?;
        let file: FileConfig = toml::from_str(&text).map_err(|e| DaemonError::Config(e.to_string()))?;

        if let Some(addr) = file.bind_address {
            self.bind_address = addr
                .parse()
                .map_err(|e| DaemonError::Config(format!("invalid bind_address {:?}: {}", addr, e)))?;
        }
        if let Some(servers) = file.servers {
            for spec in servers {
                self.servers.push(parse_server_spec(&spec)?);
            }
        }
        if let Some(v) = file.default_interfaces {
            self.default_interfaces.extend(v);
        }
        if let Some(hosts) = file.special_hosts {
            for spec in hosts {
                self.special_hosts.push(parse_special_host(&spec)?);
            }
        }
        if let Some(v) = file.forward_timeout {
            self.forward_timeout = v;
        }
        if let Some(v) = file.retry_interval {
            self.retry_interval = v;
        }
        if let Some(v) = file.max_sockets {
            self.max_sockets = v;
        }
        if let Some(v) = file.exclude_port {
            self.excluded_ports.extend(v);
        }
        if let Some(v) = file.load_balance {
            self.round_robin = v;
        }
        if let Some(v) = file.ignore_inactive_cache_hits {
            self.ignore_inactive_cache_hits = v;
        }
        if let Some(v) = file.masterfile {
            self.masterfile_path = Some(PathBuf::from(v));
        }

        Ok(())
    }
}
