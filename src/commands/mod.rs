use anyhow::Result;
use std::collections::HashMap;
use std::env;
use std::io::{self, Read};
use std::str::FromStr;
use tracing::debug;

use crate::config::{NetConf, PluginConfig};
use crate::error::Error;
use crate::link::IpRoute;
use crate::plugin::BridgePlugin;
use crate::types::{CmdArgs, VersionInfo};

/// CNI operation selected by `CNI_COMMAND`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Add,
    Del,
    Check,
    Version,
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ADD" => Ok(Command::Add),
            "DEL" => Ok(Command::Del),
            "CHECK" => Ok(Command::Check),
            "VERSION" => Ok(Command::Version),
            other => Err(Error::Environment(format!("unknown CNI command {other:?}"))),
        }
    }
}

impl Command {
    /// Variables that must be present and non-empty for this command
    fn required_vars(self) -> &'static [&'static str] {
        match self {
            Command::Add | Command::Check => &["CNI_CONTAINERID", "CNI_NETNS", "CNI_IFNAME"],
            Command::Del => &["CNI_CONTAINERID"],
            Command::Version => &[],
        }
    }
}

/// Parse command arguments from `lookup` (normally the process environment)
/// and the network configuration from `stdin`.
///
/// Every missing required variable is named in the returned error.
pub fn parse_args_from<F, R>(command: Command, lookup: F, mut stdin: R) -> crate::Result<CmdArgs>
where
    F: Fn(&str) -> Option<String>,
    R: Read,
{
    let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

    let missing: Vec<&str> = command
        .required_vars()
        .iter()
        .copied()
        .filter(|&key| get(key).is_none())
        .collect();
    if !missing.is_empty() {
        return Err(Error::Environment(format!(
            "missing required variables: {}",
            missing.join(", ")
        )));
    }

    let args = parse_cni_args(&get("CNI_ARGS").unwrap_or_default())?;

    let mut stdin_data = Vec::new();
    stdin
        .read_to_end(&mut stdin_data)
        .map_err(|e| Error::Config(format!("failed to read network configuration: {e}")))?;

    Ok(CmdArgs {
        container_id: get("CNI_CONTAINERID").unwrap_or_default(),
        netns: get("CNI_NETNS"),
        ifname: get("CNI_IFNAME"),
        args,
        path: get("CNI_PATH").unwrap_or_default(),
        stdin_data,
    })
}

/// Parse command arguments from the environment and stdin
pub fn parse_args(command: Command) -> crate::Result<CmdArgs> {
    parse_args_from(command, |key| env::var(key).ok(), io::stdin().lock())
}

/// Parse CNI_ARGS string into key-value pairs
fn parse_cni_args(args_str: &str) -> crate::Result<HashMap<String, String>> {
    args_str
        .split(';')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| Error::Environment(format!("malformed CNI_ARGS entry {pair:?}")))
        })
        .collect()
}

fn build_plugin(args: CmdArgs) -> Result<BridgePlugin<IpRoute>> {
    let conf = NetConf::parse(&args.stdin_data)?;
    let defaults = PluginConfig::default();
    let ops = IpRoute::new(conf.timeout(&defaults))?;
    debug!("Loaded network {} on subnet {}", conf.name, conf.subnet);
    Ok(BridgePlugin::new(conf, args, defaults, ops))
}

/// Execute the add command
pub fn cmd_add(args: CmdArgs) -> Result<()> {
    let plugin = build_plugin(args)?;
    let result = plugin.add_network()?;

    // Output result as JSON
    result.print()
}

/// Execute the delete command
pub fn cmd_del(args: CmdArgs) -> Result<()> {
    build_plugin(args)?.del_network()?;
    Ok(())
}

/// Execute the check command
pub fn cmd_check(args: CmdArgs) -> Result<()> {
    build_plugin(args)?.check_network()?;
    Ok(())
}

/// Main entry point for the CNI plugin
pub fn run_cni() -> Result<()> {
    let cmd = env::var("CNI_COMMAND")
        .map_err(|_| Error::Environment("CNI_COMMAND is required".to_string()))?;
    let command: Command = cmd.parse()?;

    match command {
        // VERSION touches neither stdin nor the host
        Command::Version => VersionInfo::default().print(),
        Command::Add => cmd_add(parse_args(command)?),
        Command::Del => cmd_del(parse_args(command)?),
        Command::Check => cmd_check(parse_args(command)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_command_names() {
        assert_eq!("ADD".parse::<Command>().unwrap(), Command::Add);
        assert_eq!("VERSION".parse::<Command>().unwrap(), Command::Version);
        let err = "add".parse::<Command>().unwrap_err();
        assert_eq!(err.code(), 4);
    }

    #[test]
    fn test_add_collects_everything() {
        let lookup = env_of(&[
            ("CNI_CONTAINERID", "c1"),
            ("CNI_NETNS", "/var/run/netns/c1"),
            ("CNI_IFNAME", "eth0"),
            ("CNI_PATH", "/opt/cni/bin"),
            ("CNI_ARGS", "IgnoreUnknown=1;K8S_POD_NAME=web"),
        ]);
        let args = parse_args_from(Command::Add, lookup, &b"{}"[..]).unwrap();

        assert_eq!(args.container_id, "c1");
        assert_eq!(args.netns.as_deref(), Some("/var/run/netns/c1"));
        assert_eq!(args.ifname.as_deref(), Some("eth0"));
        assert_eq!(args.args.get("K8S_POD_NAME").map(String::as_str), Some("web"));
        assert_eq!(args.stdin_data, b"{}");
    }

    #[test]
    fn test_missing_variables_reported_together() {
        let err = parse_args_from(Command::Add, env_of(&[("CNI_NETNS", "")]), io::empty())
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("CNI_CONTAINERID"));
        assert!(msg.contains("CNI_NETNS"));
        assert!(msg.contains("CNI_IFNAME"));
        assert_eq!(err.code(), 4);
    }

    #[test]
    fn test_del_only_needs_container_id() {
        let args =
            parse_args_from(Command::Del, env_of(&[("CNI_CONTAINERID", "c1")]), io::empty())
                .unwrap();
        assert_eq!(args.netns, None);
        assert_eq!(args.ifname, None);
    }

    #[test]
    fn test_cni_args_parsing() {
        assert!(parse_cni_args("").unwrap().is_empty());
        let args = parse_cni_args("A=1;B=x=y;").unwrap();
        assert_eq!(args["A"], "1");
        assert_eq!(args["B"], "x=y");
        assert!(parse_cni_args("A=1;garbage").is_err());
    }
}
