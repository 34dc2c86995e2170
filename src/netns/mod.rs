//! Network namespace installation.
//!
//! Namespaces are addressed through a named handle, a symlink
//! `<netns_dir>/<container id>` pointing at the runtime's namespace path, so
//! `ip netns` and later invocations can find them by container id alone.

use ipnetwork::Ipv4Network;
use nix::fcntl::{open, OFlag};
use nix::sched::{setns, CloneFlags};
use nix::sys::stat::Mode;
use nix::unistd::close;
use std::fs;
use std::io::ErrorKind;
use std::net::Ipv4Addr;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

use crate::error::{EniError, Result};

/// Addressing captured from the host-side link before it is moved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkFacts {
    pub address: Ipv4Network,
    pub broadcast: Ipv4Addr,
    pub gateway: Ipv4Addr,
}

impl LinkFacts {
    /// Facts for an address when only the CIDR is known
    pub fn from_network(address: Ipv4Network) -> Self {
        Self {
            address,
            broadcast: address.broadcast(),
            gateway: subnet_gateway(address),
        }
    }
}

/// Kernel-side operations of the installer
pub trait NetworkStack {
    /// Name of the host link carrying `mac`, if it has appeared
    fn link_by_mac(&self, mac: &str) -> Result<Option<String>>;

    /// IPv4 addressing of a host link; `None` until it has an address
    fn link_facts(&self, link: &str) -> Result<Option<LinkFacts>>;

    fn create_handle(&self, container_id: &str, netns_path: &str) -> Result<()>;

    fn remove_handle(&self, container_id: &str) -> Result<()>;

    /// Move `link` into the container namespace, rename it to `target` and
    /// bring loopback and `target` up
    fn move_interface(&self, link: &str, container_id: &str, target: &str) -> Result<()>;

    fn configure_address(&self, container_id: &str, target: &str, address: Ipv4Network, broadcast: Ipv4Addr) -> Result<()>;

    /// Replace the namespace's default route with one via `gateway`
    fn install_default_route(&self, container_id: &str, target: &str, gateway: Ipv4Addr) -> Result<()>;
}

/// First host address of a subnet, where the provider places its router
pub fn subnet_gateway(network: Ipv4Network) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(network.network()).saturating_add(1))
}

/// Find the link carrying `mac` in `ip -j link show` output
pub fn parse_link_by_mac(json: &str, mac: &str) -> Result<Option<String>> {
    let links: Vec<serde_json::Value> = parse_json("link show", json)?;
    Ok(links
        .iter()
        .find(|link| {
            link.get("address")
                .and_then(|a| a.as_str())
                .map(|a| a.eq_ignore_ascii_case(mac))
                .unwrap_or(false)
        })
        .and_then(|link| link.get("ifname"))
        .and_then(|n| n.as_str())
        .map(str::to_string))
}

/// First IPv4 address and broadcast in `ip -j -4 addr show` output
pub fn parse_address(json: &str) -> Result<Option<(Ipv4Network, Option<Ipv4Addr>)>> {
    let links: Vec<serde_json::Value> = parse_json("addr show", json)?;
    for info in links
        .iter()
        .filter_map(|l| l.get("addr_info").and_then(|a| a.as_array()))
        .flatten()
    {
        if info.get("family").and_then(|f| f.as_str()) != Some("inet") {
            continue;
        }
        let local = info.get("local").and_then(|v| v.as_str()).and_then(|v| v.parse().ok());
        let prefix = info.get("prefixlen").and_then(|v| v.as_u64());
        if let (Some(local), Some(prefix)) = (local, prefix) {
            let network = Ipv4Network::new(local, prefix as u8).map_err(|e| EniError::Namespace {
                op: "addr show",
                reason: e.to_string(),
            })?;
            let broadcast = info.get("broadcast").and_then(|v| v.as_str()).and_then(|v| v.parse().ok());
            return Ok(Some((network, broadcast)));
        }
    }
    Ok(None)
}

/// Gateway of the first default route in `ip -j -4 route show default` output
pub fn parse_gateway(json: &str) -> Result<Option<Ipv4Addr>> {
    let routes: Vec<serde_json::Value> = parse_json("route show", json)?;
    Ok(routes
        .iter()
        .filter_map(|r| r.get("gateway").and_then(|g| g.as_str()))
        .find_map(|g| g.parse().ok()))
}

fn parse_json(op: &'static str, json: &str) -> Result<Vec<serde_json::Value>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(json).map_err(|e| EniError::Namespace {
        op,
        reason: format!("unparseable ip output: {}", e),
    })
}

/// [`NetworkStack`] backed by iproute2 and setns(2)
#[derive(Debug, Clone)]
pub struct IpRoute2 {
    ip: String,
    netns_dir: PathBuf,
}

impl IpRoute2 {
    pub fn new(ip: &str, netns_dir: &Path) -> Self {
        Self {
            ip: ip.to_string(),
            netns_dir: netns_dir.to_path_buf(),
        }
    }

    pub fn handle_path(&self, container_id: &str) -> PathBuf {
        self.netns_dir.join(container_id)
    }

    fn ip(&self, op: &'static str, args: &[&str]) -> Result<String> {
        debug!(op, ?args, "Running ip");
        let output = Command::new(&self.ip)
            .args(args)
            .output()
            .map_err(|e| EniError::Spawn {
                program: self.ip.clone(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(EniError::Namespace {
                op,
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Execute a function inside the namespace behind a handle
    fn in_netns<T, F>(&self, container_id: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let target = self.handle_path(container_id);
        let nix_err = |op: &'static str| move |e: nix::Error| EniError::Namespace { op, reason: e.to_string() };

        // Save the current network namespace of this thread
        let orig_fd = open("/proc/thread-self/ns/net", OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty())
            .map_err(nix_err("open current netns"))?;

        let netns_fd = match open(target.as_path(), OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty()) {
            Ok(fd) => fd,
            Err(e) => {
                let _ = close(orig_fd);
                return Err(EniError::Namespace {
                    op: "open netns",
                    reason: format!("{}: {}", target.display(), e),
                });
            }
        };

        let entered = setns(netns_fd, CloneFlags::CLONE_NEWNET);
        let _ = close(netns_fd);
        if let Err(e) = entered {
            let _ = close(orig_fd);
            return Err(nix_err("setns")(e));
        }

        let result = f();

        // Return to original namespace
        let restored = setns(orig_fd, CloneFlags::CLONE_NEWNET);
        let _ = close(orig_fd);
        restored.map_err(nix_err("restore netns"))?;

        result
    }
}

impl NetworkStack for IpRoute2 {
    fn link_by_mac(&self, mac: &str) -> Result<Option<String>> {
        let json = self.ip("link show", &["-j", "link", "show"])?;
        parse_link_by_mac(&json, mac)
    }

    fn link_facts(&self, link: &str) -> Result<Option<LinkFacts>> {
        let json = self.ip("addr show", &["-j", "-4", "addr", "show", "dev", link])?;
        let Some((address, broadcast)) = parse_address(&json)? else {
            return Ok(None);
        };

        let json = self.ip("route show", &["-j", "-4", "route", "show", "default", "dev", link])?;
        let gateway = parse_gateway(&json)?.unwrap_or_else(|| subnet_gateway(address));

        Ok(Some(LinkFacts {
            address,
            broadcast: broadcast.unwrap_or_else(|| address.broadcast()),
            gateway,
        }))
    }

    fn create_handle(&self, container_id: &str, netns_path: &str) -> Result<()> {
        let handle = self.handle_path(container_id);
        let handle_err = |e: std::io::Error| EniError::Namespace {
            op: "create handle",
            reason: format!("{}: {}", handle.display(), e),
        };

        if !Path::new(netns_path).exists() {
            return Err(EniError::Namespace {
                op: "create handle",
                reason: format!("namespace {} does not exist", netns_path),
            });
        }

        fs::create_dir_all(&self.netns_dir).map_err(handle_err)?;

        // Replace a stale handle left by an earlier attempt
        match fs::symlink_metadata(&handle) {
            Ok(_) => {
                debug!(handle = %handle.display(), "Replacing existing namespace handle");
                fs::remove_file(&handle).map_err(handle_err)?;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(handle_err(e)),
        }

        symlink(netns_path, &handle).map_err(handle_err)?;
        info!(handle = %handle.display(), netns = netns_path, "Registered namespace handle");
        Ok(())
    }

    fn remove_handle(&self, container_id: &str) -> Result<()> {
        let handle = self.handle_path(container_id);
        match fs::remove_file(&handle) {
            Ok(()) => {
                info!(handle = %handle.display(), "Removed namespace handle");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EniError::Namespace {
                op: "remove handle",
                reason: format!("{}: {}", handle.display(), e),
            }),
        }
    }

    fn move_interface(&self, link: &str, container_id: &str, target: &str) -> Result<()> {
        let handle = self.handle_path(container_id);
        let handle = handle.to_string_lossy();

        // A namespace argument containing '/' is taken as a path by iproute2
        self.ip("link set netns", &["link", "set", "dev", link, "netns", &handle])?;

        self.in_netns(container_id, || {
            if link != target {
                self.ip("link rename", &["link", "set", "dev", link, "name", target])?;
            }
            self.ip("link set up", &["link", "set", "dev", "lo", "up"])?;
            self.ip("link set up", &["link", "set", "dev", target, "up"])?;
            Ok(())
        })?;

        info!(link, target, container_id, "Moved interface into container namespace");
        Ok(())
    }

    fn configure_address(&self, container_id: &str, target: &str, address: Ipv4Network, broadcast: Ipv4Addr) -> Result<()> {
        let cidr = address.to_string();
        let brd = broadcast.to_string();

        self.in_netns(container_id, || {
            match self.ip("addr add", &["addr", "add", &cidr, "broadcast", &brd, "dev", target]) {
                Err(EniError::Namespace { reason, .. }) if reason.contains("File exists") => {
                    debug!(address = %cidr, target, "Address already present");
                    Ok(())
                }
                other => other.map(|_| ()),
            }
        })?;

        info!(address = %cidr, broadcast = %brd, target, "Configured address");
        Ok(())
    }

    fn install_default_route(&self, container_id: &str, target: &str, gateway: Ipv4Addr) -> Result<()> {
        let gw = gateway.to_string();

        self.in_netns(container_id, || {
            if let Err(e) = self.ip("route del", &["route", "del", "default"]) {
                debug!(error = %e, "No default route to remove");
            }
            self.ip("route add", &["route", "add", "default", "via", &gw, "dev", target])?;
            Ok(())
        })?;

        info!(gateway = %gw, target, "Installed default route");
        Ok(())
    }
}
