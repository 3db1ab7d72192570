//! In-memory [`LinkOps`] used by unit tests.

use ipnetwork::Ipv4Network;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use super::{Link, LinkKind, LinkOps};
use crate::error::{Error, Result};

pub(crate) const HOST_NS: u32 = 0;

#[derive(Debug, Clone)]
struct FakeLink {
    link: Link,
    addrs: Vec<Ipv4Network>,
    peer: Option<String>,
}

#[derive(Debug, Default)]
struct FakeState {
    namespaces: HashMap<u32, BTreeMap<String, FakeLink>>,
    paths: HashMap<PathBuf, u32>,
    current: u32,
    next_ns: u32,
    next_index: u32,
    mutations: usize,
    fail_on: Option<&'static str>,
    fail_stderr: &'static str,
    fail_once: bool,
}

impl FakeState {
    fn links(&mut self) -> &mut BTreeMap<String, FakeLink> {
        let current = self.current;
        self.namespaces.entry(current).or_default()
    }

    fn check_fault(&mut self, op: &'static str) -> Result<()> {
        if self.fail_on != Some(op) {
            return Ok(());
        }
        if self.fail_once {
            self.fail_on = None;
        }
        let stderr = if self.fail_stderr.is_empty() {
            "injected failure"
        } else {
            self.fail_stderr
        };
        Err(Error::Command {
            cmd: op.to_string(),
            stderr: stderr.to_string(),
        })
    }

    fn mutate(&mut self, op: &'static str) -> Result<()> {
        self.check_fault(op)?;
        self.mutations += 1;
        Ok(())
    }

    fn new_link(&mut self, name: &str, kind: LinkKind, mtu: u32, peer: Option<&str>) -> FakeLink {
        self.next_index += 1;
        FakeLink {
            link: Link {
                name: name.to_string(),
                index: self.next_index,
                kind,
                up: false,
                mtu,
                master: None,
            },
            addrs: Vec::new(),
            peer: peer.map(str::to_string),
        }
    }

    fn get_mut(&mut self, name: &str) -> Result<&mut FakeLink> {
        self.links()
            .get_mut(name)
            .ok_or_else(|| Error::Command {
                cmd: format!("ip link dev {name}"),
                stderr: format!("Device \"{name}\" does not exist."),
            })
    }

    fn remove_peer_of(&mut self, name: &str, peer: &str) {
        for links in self.namespaces.values_mut() {
            if links.get(peer).and_then(|l| l.peer.as_deref()) == Some(name) {
                links.remove(peer);
            }
        }
    }
}

/// Models namespaces, devices, and addresses well enough to exercise the
/// bridge and veth procedures. Fault injection fails a named operation.
#[derive(Debug, Default)]
pub(crate) struct FakeLinks {
    state: RefCell<FakeState>,
}

impl FakeLinks {
    pub(crate) fn new() -> Self {
        let fake = Self::default();
        {
            let mut st = fake.state.borrow_mut();
            st.namespaces.insert(HOST_NS, BTreeMap::new());
            st.next_ns = HOST_NS + 1;
        }
        fake
    }

    pub(crate) fn add_namespace(&self, path: &str) -> u32 {
        let mut st = self.state.borrow_mut();
        let id = st.next_ns;
        st.next_ns += 1;
        st.namespaces.insert(id, BTreeMap::new());
        st.paths.insert(PathBuf::from(path), id);
        id
    }

    /// Destroy a namespace the way the kernel does: its veths take their peers with them.
    pub(crate) fn destroy_namespace(&self, path: &str) {
        let id = self.state.borrow_mut().paths.remove(Path::new(path));
        if let Some(id) = id {
            self.drop_namespace(id);
        }
    }

    /// Destroy a namespace but leave its path openable, like a stale bind mount.
    pub(crate) fn unmount_namespace(&self, path: &str) {
        let id = self.state.borrow().paths.get(Path::new(path)).copied();
        if let Some(id) = id {
            self.drop_namespace(id);
        }
    }

    fn drop_namespace(&self, id: u32) {
        let mut st = self.state.borrow_mut();
        let links = st.namespaces.remove(&id).unwrap_or_default();
        for (name, link) in links {
            if let Some(peer) = link.peer {
                st.remove_peer_of(&name, &peer);
            }
        }
    }

    pub(crate) fn fail_on(&self, op: &'static str) {
        self.fail_with(op, "");
    }

    /// Fail `op` with `stderr`, the way `ip` reports it.
    pub(crate) fn fail_with(&self, op: &'static str, stderr: &'static str) {
        let mut st = self.state.borrow_mut();
        st.fail_on = Some(op);
        st.fail_stderr = stderr;
        st.fail_once = false;
    }

    /// Fail the next `op` only.
    pub(crate) fn fail_once(&self, op: &'static str) {
        self.fail_on(op);
        self.state.borrow_mut().fail_once = true;
    }

    pub(crate) fn clear_faults(&self) {
        self.state.borrow_mut().fail_on = None;
    }

    pub(crate) fn mutations(&self) -> usize {
        self.state.borrow().mutations
    }

    pub(crate) fn current(&self) -> u32 {
        self.state.borrow().current
    }

    pub(crate) fn link_in(&self, ns: u32, name: &str) -> Option<Link> {
        self.state
            .borrow()
            .namespaces
            .get(&ns)
            .and_then(|links| links.get(name))
            .map(|l| l.link.clone())
    }

    pub(crate) fn addrs_in(&self, ns: u32, name: &str) -> Vec<Ipv4Network> {
        self.state
            .borrow()
            .namespaces
            .get(&ns)
            .and_then(|links| links.get(name))
            .map(|l| l.addrs.clone())
            .unwrap_or_default()
    }

    pub(crate) fn link_names(&self, ns: u32) -> Vec<String> {
        self.state
            .borrow()
            .namespaces
            .get(&ns)
            .map(|links| links.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Create a device directly, bypassing fault injection and the mutation counter.
    pub(crate) fn seed_link(&self, ns: u32, name: &str, kind: LinkKind, addrs: &[&str]) {
        let mut st = self.state.borrow_mut();
        let mut link = st.new_link(name, kind, 1500, None);
        link.addrs = addrs.iter().map(|a| a.parse().unwrap()).collect();
        st.namespaces.entry(ns).or_default().insert(name.to_string(), link);
    }
}

impl LinkOps for FakeLinks {
    type Netns = u32;

    fn current_netns(&self) -> Result<u32> {
        Ok(self.state.borrow().current)
    }

    fn open_netns(&self, path: &Path) -> Result<u32> {
        self.state
            .borrow()
            .paths
            .get(path)
            .copied()
            .ok_or_else(|| {
                Error::Namespace(format!("failed to open network namespace {}", path.display()))
            })
    }

    fn enter_netns(&self, ns: &u32) -> Result<()> {
        let mut st = self.state.borrow_mut();
        st.check_fault("enter_netns")?;
        if !st.namespaces.contains_key(ns) {
            return Err(Error::Namespace(format!("namespace {ns} is gone")));
        }
        st.current = *ns;
        Ok(())
    }

    fn link_by_name(&self, name: &str) -> Result<Option<Link>> {
        Ok(self
            .state
            .borrow_mut()
            .links()
            .get(name)
            .map(|l| l.link.clone()))
    }

    fn add_bridge(&self, name: &str, mtu: u32) -> Result<()> {
        let mut st = self.state.borrow_mut();
        st.mutate("add_bridge")?;
        if st.links().contains_key(name) {
            return Err(Error::Command {
                cmd: "add_bridge".into(),
                stderr: "File exists".into(),
            });
        }
        let link = st.new_link(name, LinkKind::Bridge, mtu, None);
        st.links().insert(name.to_string(), link);
        Ok(())
    }

    fn add_veth(&self, name: &str, peer: &str, mtu: u32) -> Result<()> {
        let mut st = self.state.borrow_mut();
        st.mutate("add_veth")?;
        if st.links().contains_key(name) || st.links().contains_key(peer) {
            return Err(Error::Command {
                cmd: "add_veth".into(),
                stderr: "File exists".into(),
            });
        }
        let end = st.new_link(name, LinkKind::Veth, mtu, Some(peer));
        let other = st.new_link(peer, LinkKind::Veth, mtu, Some(name));
        st.links().insert(name.to_string(), end);
        st.links().insert(peer.to_string(), other);
        Ok(())
    }

    fn delete_link(&self, name: &str) -> Result<()> {
        let mut st = self.state.borrow_mut();
        st.mutate("delete_link")?;
        let link = st.get_mut(name)?.clone();
        st.links().remove(name);
        if let Some(peer) = link.peer {
            st.remove_peer_of(name, &peer);
        }
        Ok(())
    }

    fn set_link_up(&self, name: &str) -> Result<()> {
        let mut st = self.state.borrow_mut();
        st.mutate("set_link_up")?;
        st.get_mut(name)?.link.up = true;
        Ok(())
    }

    fn set_link_master(&self, name: &str, master: &str) -> Result<()> {
        let mut st = self.state.borrow_mut();
        st.mutate("set_link_master")?;
        match st.links().get(master) {
            Some(l) if l.link.kind == LinkKind::Bridge => {}
            _ => {
                return Err(Error::Command {
                    cmd: "set_link_master".into(),
                    stderr: format!("bridge {master} not found"),
                })
            }
        }
        st.get_mut(name)?.link.master = Some(master.to_string());
        Ok(())
    }

    fn move_link_to_netns(&self, name: &str, ns: &u32) -> Result<()> {
        let mut st = self.state.borrow_mut();
        st.mutate("move_link_to_netns")?;
        let mut link = st.get_mut(name)?.clone();
        let target = st
            .namespaces
            .get_mut(ns)
            .ok_or_else(|| Error::Namespace(format!("namespace {ns} is gone")))?;
        if target.contains_key(name) {
            return Err(Error::Command {
                cmd: "move_link_to_netns".into(),
                stderr: "File exists".into(),
            });
        }
        link.link.up = false;
        link.link.master = None;
        target.insert(name.to_string(), link);
        st.links().remove(name);
        Ok(())
    }

    fn addr_list(&self, name: &str) -> Result<Vec<Ipv4Network>> {
        Ok(self.state.borrow_mut().get_mut(name)?.addrs.clone())
    }

    fn addr_add(&self, name: &str, addr: &Ipv4Network) -> Result<()> {
        let mut st = self.state.borrow_mut();
        st.mutate("addr_add")?;
        let link = st.get_mut(name)?;
        if link.addrs.contains(addr) {
            return Err(Error::Command {
                cmd: "addr_add".into(),
                stderr: "RTNETLINK answers: File exists".into(),
            });
        }
        link.addrs.push(*addr);
        Ok(())
    }

    fn addr_del(&self, name: &str, addr: &Ipv4Network) -> Result<()> {
        let mut st = self.state.borrow_mut();
        st.mutate("addr_del")?;
        let link = st.get_mut(name)?;
        let before = link.addrs.len();
        link.addrs.retain(|a| a != addr);
        if link.addrs.len() == before {
            return Err(Error::Command {
                cmd: "addr_del".into(),
                stderr: "RTNETLINK answers: Cannot assign requested address".into(),
            });
        }
        Ok(())
    }
}
