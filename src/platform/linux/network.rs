use std::collections::BTreeMap;
use std::ffi::CString;
use std::fs;
use std::io;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::process::Command;

use log::debug;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use crate::core::config::{NetworkSpec, Route};
use crate::core::error::{Error, Result};

const RTF_UP: libc::c_ushort = 0x0001;
const RTF_GATEWAY: libc::c_ushort = 0x0002;

/// Opaque per-network record emitted by a strategy during creation and
/// consumed for interior setup and statistics. Entries keep the order of
/// the configured networks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkState {
    /// Strategy tag that produced this record.
    pub kind: String,
    /// Interface name inside the container, if one exists.
    #[serde(default)]
    pub interface: Option<String>,
    /// Strategy-private data.
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

/// Per-interface counters reported by `stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStats {
    pub interface: String,
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
}

/// Capability set of a network driver.
///
/// `create` runs on the host side of the bootstrap with the child's pid;
/// it is responsible for moving interfaces into the child's network
/// namespace and appending its state to the accumulator.
pub trait NetworkStrategy: Send + Sync + std::fmt::Debug {
    fn create(&self, spec: &NetworkSpec, pid: Pid, state: &mut Vec<NetworkState>) -> Result<()>;
    fn stats(&self, state: &NetworkState) -> Result<NetworkStats>;
}

/// Registry resolving a network-type tag to its strategy. The core never
/// names a concrete driver.
#[derive(Default)]
pub struct NetworkRegistry {
    strategies: BTreeMap<String, Box<dyn NetworkStrategy>>,
}

impl NetworkRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Registry preloaded with the built-in strategies.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("loopback", Box::new(Loopback));
        registry.register("veth", Box::new(Veth));
        registry
    }

    pub fn register(&mut self, kind: impl Into<String>, strategy: Box<dyn NetworkStrategy>) {
        self.strategies.insert(kind.into(), strategy);
    }

    pub fn resolve(&self, kind: &str) -> Result<&dyn NetworkStrategy> {
        self.strategies
            .get(kind)
            .map(|s| s.as_ref())
            .ok_or_else(|| Error::mismatch(format!("unknown network type {kind:?}")))
    }
}

/// The in-namespace loopback device. Nothing to create host-side; the
/// interior pass brings it up.
#[derive(Debug)]
pub struct Loopback;

impl NetworkStrategy for Loopback {
    fn create(&self, _spec: &NetworkSpec, _pid: Pid, state: &mut Vec<NetworkState>) -> Result<()> {
        state.push(NetworkState {
            kind: "loopback".into(),
            interface: Some("lo".into()),
            data: BTreeMap::new(),
        });
        Ok(())
    }

    fn stats(&self, state: &NetworkState) -> Result<NetworkStats> {
        // Loopback traffic is only visible inside the namespace; report
        // the interface with zeroed counters.
        Ok(NetworkStats {
            interface: state.interface.clone().unwrap_or_else(|| "lo".into()),
            ..Default::default()
        })
    }
}

/// A veth pair: the host end stays outside (optionally enslaved to a
/// bridge), the peer is moved into the child's network namespace.
///
/// Parameters: `host` (required host-side name), `name` (container-side
/// name, default eth0), `bridge` (optional), `address` (optional
/// `a.b.c.d/len`, assigned by the interior pass).
#[derive(Debug)]
pub struct Veth;

impl NetworkStrategy for Veth {
    fn create(&self, spec: &NetworkSpec, pid: Pid, state: &mut Vec<NetworkState>) -> Result<()> {
        let host = spec
            .params
            .get("host")
            .ok_or_else(|| Error::mismatch("veth network requires a \"host\" interface name"))?;
        let name = spec
            .params
            .get("name")
            .map(String::as_str)
            .unwrap_or("eth0");

        run_ip(&["link", "add", host, "type", "veth", "peer", "name", name])?;
        if let Some(bridge) = spec.params.get("bridge") {
            run_ip(&["link", "set", host, "master", bridge])?;
        }
        run_ip(&["link", "set", host, "up"])?;
        run_ip(&["link", "set", name, "netns", &pid.to_string()])?;
        debug!("moved veth peer {name} into netns of pid {pid}");

        let mut data = BTreeMap::from([("host".to_string(), host.clone())]);
        if let Some(address) = spec.params.get("address") {
            data.insert("address".to_string(), address.clone());
        }
        state.push(NetworkState {
            kind: "veth".into(),
            interface: Some(name.to_string()),
            data,
        });
        Ok(())
    }

    fn stats(&self, state: &NetworkState) -> Result<NetworkStats> {
        let host = state
            .data
            .get("host")
            .ok_or_else(|| Error::mismatch("veth state is missing its host interface"))?;
        Ok(NetworkStats {
            interface: state.interface.clone().unwrap_or_default(),
            rx_bytes: read_interface_counter(host, "rx_bytes")?,
            rx_packets: read_interface_counter(host, "rx_packets")?,
            tx_bytes: read_interface_counter(host, "tx_bytes")?,
            tx_packets: read_interface_counter(host, "tx_packets")?,
        })
    }
}

fn run_ip(args: &[&str]) -> Result<()> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .map_err(|e| Error::system(format!("run ip {}", args.join(" ")), e))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::system(
            format!("ip {}", args.join(" ")),
            io::Error::other(stderr.trim().to_string()),
        ));
    }
    Ok(())
}

fn read_interface_counter(interface: &str, counter: &str) -> Result<u64> {
    let path = format!("/sys/class/net/{interface}/statistics/{counter}");
    let data =
        fs::read_to_string(&path).map_err(|e| Error::system(format!("read {path}"), e))?;
    data.trim()
        .parse()
        .map_err(|_| Error::system(format!("parse {path}"), malformed()))
}

fn malformed() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "malformed value")
}

// ─── interior setup ─────────────────────────────────────────────────────────
//
// Runs inside the container's network namespace: in the init when there is
// no user namespace, in the setup helper otherwise.

/// Bring up loopback plus every interface recorded in the network state,
/// assign recorded addresses, then install the configured routes in order.
pub fn setup_interior(state: &[NetworkState], routes: &[Route]) -> Result<()> {
    interface_up("lo")?;
    for entry in state {
        let Some(interface) = &entry.interface else {
            continue;
        };
        if interface != "lo" {
            if let Some(address) = entry.data.get("address") {
                interface_addr(interface, address)?;
            }
            interface_up(interface)?;
        }
    }
    apply_routes(routes)
}

fn inet_socket() -> Result<OwnedFd> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if fd == -1 {
        return Err(Error::system(
            "open AF_INET control socket",
            io::Error::last_os_error(),
        ));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn ifreq_for(name: &str) -> Result<libc::ifreq> {
    if name.len() >= libc::IFNAMSIZ {
        return Err(Error::mismatch(format!("interface name {name:?} too long")));
    }
    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    for (i, b) in name.as_bytes().iter().enumerate() {
        ifr.ifr_name[i] = *b as libc::c_char;
    }
    Ok(ifr)
}

/// Set IFF_UP on an interface in the current network namespace.
pub fn interface_up(name: &str) -> Result<()> {
    let socket = inet_socket()?;
    let mut ifr = ifreq_for(name)?;

    if unsafe { libc::ioctl(socket.as_raw_fd(), libc::SIOCGIFFLAGS, &mut ifr) } == -1 {
        return Err(Error::system(
            format!("read flags of {name}"),
            io::Error::last_os_error(),
        ));
    }
    unsafe {
        ifr.ifr_ifru.ifru_flags |= (libc::IFF_UP | libc::IFF_RUNNING) as libc::c_short;
    }
    if unsafe { libc::ioctl(socket.as_raw_fd(), libc::SIOCSIFFLAGS, &ifr) } == -1 {
        return Err(Error::system(
            format!("bring up {name}"),
            io::Error::last_os_error(),
        ));
    }
    Ok(())
}

/// Assign an `a.b.c.d/len` address to an interface in the current network
/// namespace.
pub fn interface_addr(name: &str, address: &str) -> Result<()> {
    let (addr, prefix) = parse_destination(address)?;
    let socket = inet_socket()?;

    let mut ifr = ifreq_for(name)?;
    ifr.ifr_ifru.ifru_addr = inet_sockaddr(addr);
    if unsafe { libc::ioctl(socket.as_raw_fd(), libc::SIOCSIFADDR, &ifr) } == -1 {
        return Err(Error::system(
            format!("set address of {name}"),
            io::Error::last_os_error(),
        ));
    }

    let mut ifr = ifreq_for(name)?;
    ifr.ifr_ifru.ifru_netmask = inet_sockaddr(mask_from_prefix(prefix));
    if unsafe { libc::ioctl(socket.as_raw_fd(), libc::SIOCSIFNETMASK, &ifr) } == -1 {
        return Err(Error::system(
            format!("set netmask of {name}"),
            io::Error::last_os_error(),
        ));
    }
    Ok(())
}

/// Install the configured routes, in order.
pub fn apply_routes(routes: &[Route]) -> Result<()> {
    for route in routes {
        add_route(route)?;
    }
    Ok(())
}

fn add_route(route: &Route) -> Result<()> {
    let (dst, prefix) = parse_destination(&route.destination)?;

    let mut rt: libc::rtentry = unsafe { std::mem::zeroed() };
    rt.rt_dst = inet_sockaddr(dst);
    rt.rt_genmask = inet_sockaddr(mask_from_prefix(prefix));
    rt.rt_flags = RTF_UP;
    if let Some(gateway) = &route.gateway {
        rt.rt_gateway = inet_sockaddr(parse_ipv4(gateway)?);
        rt.rt_flags |= RTF_GATEWAY;
    }
    // The CString must outlive the ioctl.
    let device = match &route.interface {
        Some(name) => Some(CString::new(name.as_bytes()).map_err(|_| {
            Error::mismatch(format!("embedded NUL in interface name {name:?}"))
        })?),
        None => None,
    };
    if let Some(device) = &device {
        rt.rt_dev = device.as_ptr() as *mut libc::c_char;
    }

    let socket = inet_socket()?;
    if unsafe { libc::ioctl(socket.as_raw_fd(), libc::SIOCADDRT, &rt) } == -1 {
        return Err(Error::system(
            format!("add route to {}", route.destination),
            io::Error::last_os_error(),
        ));
    }
    Ok(())
}

fn inet_sockaddr(addr: Ipv4Addr) -> libc::sockaddr {
    let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_addr = libc::in_addr {
        s_addr: u32::from(addr).to_be(),
    };
    // sockaddr_in and sockaddr have identical size and layout prefix.
    unsafe { std::mem::transmute::<libc::sockaddr_in, libc::sockaddr>(sin) }
}

fn parse_ipv4(s: &str) -> Result<Ipv4Addr> {
    s.parse()
        .map_err(|_| Error::mismatch(format!("invalid IPv4 address {s:?}")))
}

/// Parse `a.b.c.d/len`, bare `a.b.c.d` (len 32), or `default` (0.0.0.0/0).
fn parse_destination(s: &str) -> Result<(Ipv4Addr, u8)> {
    if s == "default" {
        return Ok((Ipv4Addr::UNSPECIFIED, 0));
    }
    match s.split_once('/') {
        Some((addr, prefix)) => {
            let prefix: u8 = prefix
                .parse()
                .map_err(|_| Error::mismatch(format!("invalid prefix length in {s:?}")))?;
            if prefix > 32 {
                return Err(Error::mismatch(format!("invalid prefix length in {s:?}")));
            }
            Ok((parse_ipv4(addr)?, prefix))
        }
        None => Ok((parse_ipv4(s)?, 32)),
    }
}

fn mask_from_prefix(prefix: u8) -> Ipv4Addr {
    if prefix == 0 {
        Ipv4Addr::UNSPECIFIED
    } else {
        Ipv4Addr::from(u32::MAX << (32 - u32::from(prefix)))
    }
}
