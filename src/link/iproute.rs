use ipnetwork::Ipv4Network;
use nix::sched::{setns, CloneFlags};
use serde::Deserialize;
use std::fs::File;
use std::net::Ipv4Addr;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::runtime::{Builder, Runtime};
use tracing::debug;

use super::{is_missing_device, Link, LinkKind, LinkOps};
use crate::error::{Error, Result};

const THREAD_NETNS: &str = "/proc/thread-self/ns/net";

/// An open network namespace file.
#[derive(Debug)]
pub struct NetnsHandle {
    file: File,
    path: PathBuf,
}

impl NetnsHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A path to the open descriptor that child processes can open, even after
    /// the calling thread has switched namespaces.
    fn fd_path(&self) -> String {
        format!("/proc/{}/fd/{}", std::process::id(), self.file.as_raw_fd())
    }
}

#[derive(Debug, Deserialize)]
struct IpLink {
    ifname: String,
    ifindex: u32,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    mtu: u32,
    master: Option<String>,
    linkinfo: Option<IpLinkInfo>,
}

#[derive(Debug, Deserialize)]
struct IpLinkInfo {
    info_kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IpAddrEntry {
    #[serde(default)]
    addr_info: Vec<IpAddrInfo>,
}

#[derive(Debug, Deserialize)]
struct IpAddrInfo {
    family: Option<String>,
    local: Option<String>,
    prefixlen: Option<u8>,
}

impl From<IpLink> for Link {
    fn from(l: IpLink) -> Self {
        Link {
            up: l.flags.iter().any(|f| f == "UP"),
            kind: LinkKind::from_info_kind(l.linkinfo.as_ref().and_then(|i| i.info_kind.as_deref())),
            name: l.ifname,
            index: l.ifindex,
            mtu: l.mtu,
            master: l.master,
        }
    }
}

/// [`LinkOps`] backed by the iproute2 `ip` tool.
///
/// Each invocation is bounded by a timeout and killed when it expires. Child
/// processes are forked from the calling thread, so they inherit whatever
/// network namespace that thread is in.
pub struct IpRoute {
    binary: PathBuf,
    timeout: Duration,
    runtime: Runtime,
}

impl IpRoute {
    pub fn new(timeout: Duration) -> Result<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::Namespace(format!("failed to create command runtime: {e}")))?;

        Ok(Self {
            binary: PathBuf::from("ip"),
            timeout,
            runtime,
        })
    }

    /// Use a specific `ip` binary instead of the one found on `PATH`.
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let cmd = format!("{} {}", self.binary.display(), args.join(" "));
        debug!("Executing: {}", cmd);

        let output = self.runtime.block_on(async {
            let child = Command::new(&self.binary)
                .args(args)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output();
            tokio::time::timeout(self.timeout, child).await
        });

        let output = match output {
            Err(_) => {
                return Err(Error::Timeout {
                    cmd,
                    secs: self.timeout.as_secs(),
                })
            }
            Ok(Err(e)) => {
                return Err(Error::Command {
                    cmd,
                    stderr: e.to_string(),
                })
            }
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            return Err(Error::Command {
                cmd,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn open(path: &Path) -> Result<NetnsHandle> {
        let file = File::open(path).map_err(|e| {
            Error::Namespace(format!("failed to open network namespace {}: {}", path.display(), e))
        })?;
        Ok(NetnsHandle {
            file,
            path: path.to_path_buf(),
        })
    }
}

fn parse_links(json: &str) -> Result<Vec<IpLink>> {
    serde_json::from_str(json).map_err(|e| Error::Command {
        cmd: "ip -j link show".to_string(),
        stderr: format!("unparseable output: {e}"),
    })
}

fn parse_addrs(json: &str) -> Result<Vec<Ipv4Network>> {
    let entries: Vec<IpAddrEntry> = serde_json::from_str(json).map_err(|e| Error::Command {
        cmd: "ip -j addr show".to_string(),
        stderr: format!("unparseable output: {e}"),
    })?;

    entries
        .into_iter()
        .flat_map(|entry| entry.addr_info)
        .filter(|info| info.family.as_deref().map_or(true, |f| f == "inet"))
        .filter_map(|info| Some((info.local?, info.prefixlen?)))
        .map(|(ip, prefix)| {
            let bad = |e: String| Error::Command {
                cmd: "ip -j addr show".to_string(),
                stderr: format!("bad address {ip}/{prefix}: {e}"),
            };
            let addr = ip.parse::<Ipv4Addr>().map_err(|e| bad(e.to_string()))?;
            Ipv4Network::new(addr, prefix).map_err(|e| bad(e.to_string()))
        })
        .collect()
}

impl LinkOps for IpRoute {
    type Netns = NetnsHandle;

    fn current_netns(&self) -> Result<NetnsHandle> {
        Self::open(Path::new(THREAD_NETNS))
    }

    fn open_netns(&self, path: &Path) -> Result<NetnsHandle> {
        Self::open(path)
    }

    fn enter_netns(&self, ns: &NetnsHandle) -> Result<()> {
        setns(&ns.file, CloneFlags::CLONE_NEWNET).map_err(|e| {
            Error::Namespace(format!("setns into {} failed: {}", ns.path.display(), e))
        })
    }

    fn link_by_name(&self, name: &str) -> Result<Option<Link>> {
        let json = match self.run(&["-j", "-d", "link", "show", "dev", name]) {
            Ok(json) => json,
            Err(e) if is_missing_device(&e) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(parse_links(&json)?.into_iter().next().map(Link::from))
    }

    fn add_bridge(&self, name: &str, mtu: u32) -> Result<()> {
        let mtu = mtu.to_string();
        self.run(&["link", "add", "name", name, "mtu", &mtu, "type", "bridge"])
            .map(drop)
    }

    fn add_veth(&self, name: &str, peer: &str, mtu: u32) -> Result<()> {
        let mtu = mtu.to_string();
        self.run(&[
            "link", "add", "name", name, "mtu", &mtu, "type", "veth", "peer", "name", peer, "mtu",
            &mtu,
        ])
        .map(drop)
    }

    fn delete_link(&self, name: &str) -> Result<()> {
        self.run(&["link", "delete", "dev", name]).map(drop)
    }

    fn set_link_up(&self, name: &str) -> Result<()> {
        self.run(&["link", "set", "dev", name, "up"]).map(drop)
    }

    fn set_link_master(&self, name: &str, master: &str) -> Result<()> {
        self.run(&["link", "set", "dev", name, "master", master])
            .map(drop)
    }

    fn move_link_to_netns(&self, name: &str, ns: &NetnsHandle) -> Result<()> {
        let target = ns.fd_path();
        self.run(&["link", "set", "dev", name, "netns", &target])
            .map(drop)
    }

    fn addr_list(&self, name: &str) -> Result<Vec<Ipv4Network>> {
        let json = self.run(&["-4", "-j", "addr", "show", "dev", name])?;
        parse_addrs(&json)
    }

    fn addr_add(&self, name: &str, addr: &Ipv4Network) -> Result<()> {
        let addr = addr.to_string();
        self.run(&["addr", "add", &addr, "dev", name]).map(drop)
    }

    fn addr_del(&self, name: &str, addr: &Ipv4Network) -> Result<()> {
        let addr = addr.to_string();
        self.run(&["addr", "del", &addr, "dev", name]).map(drop)
    }
}
