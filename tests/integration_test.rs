use minicni::config::{NetConf, PluginConfig};
use minicni::ipam::{load_reservations, save_reservations, Owner, Reservation, ReservationSet};
use minicni::link::IpRoute;
use minicni::plugin::BridgePlugin;
use minicni::types::CmdArgs;
use std::collections::HashMap;
use std::process::Command;
use std::time::Duration;
use tempfile::TempDir;

const BRIDGE: &str = "mcnitest0";

// Function to create a test netns
fn create_test_netns(name: &str) -> Result<(), Box<dyn std::error::Error>> {
    let _ = Command::new("ip").args(["netns", "delete", name]).output();

    let output = Command::new("ip").args(["netns", "add", name]).output()?;
    if !output.status.success() {
        return Err(format!(
            "Failed to create netns: {}",
            String::from_utf8_lossy(&output.stderr)
        )
        .into());
    }

    Ok(())
}

fn delete_test_netns(name: &str) {
    let _ = Command::new("ip").args(["netns", "delete", name]).output();
}

fn delete_test_bridge() {
    let _ = Command::new("ip").args(["link", "delete", "dev", BRIDGE]).output();
}

fn plugin_for(
    conf: &NetConf,
    defaults: &PluginConfig,
    netns: &str,
) -> Result<BridgePlugin<IpRoute>, Box<dyn std::error::Error>> {
    let args = CmdArgs {
        container_id: "test-container".to_string(),
        netns: Some(netns.to_string()),
        ifname: Some("eth1".to_string()),
        args: HashMap::new(),
        path: "/opt/cni/bin".to_string(),
        stdin_data: serde_json::to_vec(conf)?,
    };
    let ops = IpRoute::new(Duration::from_secs(10))?;
    Ok(BridgePlugin::new(conf.clone(), args, defaults.clone(), ops))
}

// This test requires root privileges to run
#[test]
#[ignore]
fn test_bridge_cni_lifecycle() -> Result<(), Box<dyn std::error::Error>> {
    // Skip if not running as root
    if !nix::unistd::geteuid().is_root() {
        println!("Skipping test_bridge_cni_lifecycle: not running as root");
        return Ok(());
    }

    let data_dir = TempDir::new()?;
    let defaults = PluginConfig {
        data_dir: data_dir.path().to_path_buf(),
        ..PluginConfig::default()
    };
    let conf = NetConf::new_default("test-bridge", "10.213.0.0/30", Some(BRIDGE), None);

    let netns_name = "test_minicni_netns";
    create_test_netns(netns_name)?;
    let netns_path = format!("/var/run/netns/{}", netns_name);

    let outcome = (|| -> Result<(), Box<dyn std::error::Error>> {
        let plugin = plugin_for(&conf, &defaults, &netns_path)?;

        let result = plugin.add_network()?;
        println!("CNI result: {:?}", result);
        assert_eq!(result.ips.address, "10.213.0.2/30");
        assert_eq!(result.ips.gateway, "10.213.0.1/30");

        plugin.check_network()?;

        plugin.del_network()?;
        assert!(load_reservations(conf.ledger_path(&defaults))?.is_empty());

        // a second DEL finds nothing and still succeeds
        plugin.del_network()?;
        Ok(())
    })();

    // Clean up
    delete_test_netns(netns_name);
    delete_test_bridge();

    outcome
}

// Needs no privileges: setns on a plain file fails before any device is touched.
#[test]
fn test_del_with_stale_netns_path_releases_reservation() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let defaults = PluginConfig {
        data_dir: dir.path().join("data"),
        ..PluginConfig::default()
    };
    let conf = NetConf::new_default("test-bridge", "10.10.0.0/24", None, None);

    let set: ReservationSet = [
        Reservation::new("10.10.0.2/24".parse()?, Some(Owner::new("test-container", "eth1"))),
        Reservation::new("10.10.0.3/24".parse()?, Some(Owner::new("other", "eth1"))),
    ]
    .into_iter()
    .collect();
    save_reservations(conf.ledger_path(&defaults), &set)?;

    // what a netns bind mount looks like once the namespace itself is gone
    let stale = dir.path().join("stale-netns");
    std::fs::write(&stale, b"")?;

    let plugin = plugin_for(&conf, &defaults, &stale.to_string_lossy())?;
    plugin.del_network()?;

    let left: Vec<String> = load_reservations(conf.ledger_path(&defaults))?
        .iter()
        .map(|r| r.to_string())
        .collect();
    assert_eq!(left, vec!["10.10.0.3/24 other/eth1"]);

    Ok(())
}
