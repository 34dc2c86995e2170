use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use eni_cni::config::{NetConf, NetConfList, PLUGIN_TYPE};
use eni_cni::types::{CmdArgs, ErrorResult, IPConfig, Interface, Result as CniResult, Route};

#[test]
fn test_net_conf_parsing() -> Result<(), Box<dyn std::error::Error>> {
    let conf = NetConf::parse(
        br#"{
            "cniVersion": "1.0.0",
            "name": "eni-net",
            "type": "eni-cni",
            "securityGroups": ["sg-0abc"],
            "tags": {"team": "payments"},
            "stateDir": "/tmp/eni-state",
            "attachTimeoutSecs": 30,
            "logLevel": "debug"
        }"#,
    )?;

    assert_eq!(conf.cni_version, "1.0.0");
    assert_eq!(conf.name, "eni-net");
    assert_eq!(conf.plugin_type, PLUGIN_TYPE);
    assert!(conf.prev_result.is_none());

    let settings = conf.settings();
    assert_eq!(settings.state_dir, PathBuf::from("/tmp/eni-state"));
    assert_eq!(settings.netns_dir, PathBuf::from("/var/run/netns"));
    assert_eq!(settings.security_groups, vec!["sg-0abc".to_string()]);
    assert_eq!(settings.tags.get("team").map(String::as_str), Some("payments"));
    assert_eq!(settings.attach_timeout, Duration::from_secs(30));
    assert_eq!(settings.log_level.as_deref(), Some("debug"));

    Ok(())
}

#[test]
fn test_net_conf_rejects_bad_values() {
    assert!(NetConf::parse(br#"{"name":"n"}"#).is_err());
    assert!(NetConf::parse(br#"{"cniVersion":"","name":"n"}"#).is_err());
    assert!(NetConf::parse(br#"{"cniVersion":"1.0.0","detachTimeoutSecs":0}"#).is_err());
}

#[test]
fn test_cmd_args_creation() -> Result<(), Box<dyn std::error::Error>> {
    let conf = NetConf::new_default("eni-net", "1.0.0");

    let args = CmdArgs {
        container_id: "test-container".to_string(),
        netns: "/var/run/netns/test".to_string(),
        ifname: "eth1".to_string(),
        args: HashMap::new(),
        path: "/opt/cni/bin".to_string(),
        stdin_data: serde_json::to_vec(&conf)?,
    };

    let parsed = NetConf::parse(&args.stdin_data)?;
    assert_eq!(parsed.name, "eni-net");
    assert_eq!(parsed.plugin_type, PLUGIN_TYPE);
    // Unset options stay out of the encoded configuration
    let encoded: serde_json::Value = serde_json::from_slice(&args.stdin_data)?;
    assert!(encoded.get("stateDir").is_none());
    assert!(encoded.get("prevResult").is_none());

    Ok(())
}

#[test]
fn test_result_serialization() -> Result<(), Box<dyn std::error::Error>> {
    let mut result = CniResult::new("1.0.0");
    result.add_interface(Interface {
        name: "eth1".to_string(),
        mac: Some("02:00:00:00:00:01".to_string()),
        sandbox: Some("/var/run/netns/test".to_string()),
    });
    result.add_ip(IPConfig {
        interface: Some(0),
        address: "10.0.1.11/24".to_string(),
        gateway: Some("10.0.1.1".to_string()),
    });
    result.add_route(Route {
        dst: "0.0.0.0/0".to_string(),
        gw: Some("10.0.1.1".to_string()),
    });

    let json: serde_json::Value = serde_json::to_value(&result)?;
    assert_eq!(json["cniVersion"], "1.0.0");
    assert_eq!(json["interfaces"][0]["name"], "eth1");
    assert_eq!(json["ips"][0]["interface"], 0);
    assert_eq!(json["routes"][0]["gw"], "10.0.1.1");

    let empty = serde_json::to_value(CniResult::new("0.4.0"))?;
    assert_eq!(empty, serde_json::json!({"cniVersion": "0.4.0"}));

    Ok(())
}

#[test]
fn test_error_envelope_shape() -> Result<(), Box<dyn std::error::Error>> {
    let envelope = serde_json::to_value(ErrorResult::new("1.0.0", 1, "attach failed"))?;
    assert_eq!(
        envelope,
        serde_json::json!({"cniVersion": "1.0.0", "code": 1, "msg": "attach failed"})
    );
    Ok(())
}

#[test]
fn test_chained_config_list() -> Result<(), Box<dyn std::error::Error>> {
    let mut eni = NetConf::new_default("eni-net", "1.0.0");
    eni.tags = Some(BTreeMap::from([("env".to_string(), "prod".to_string())]));
    let primary = serde_json::json!({"type": "bridge", "bridge": "cni0"});

    let list = NetConfList::chained("eni-net", primary.clone(), &eni)?;
    assert_eq!(list.cni_version, "1.0.0");
    assert_eq!(list.plugins.len(), 2);
    assert_eq!(list.plugins[0], primary);
    assert_eq!(list.plugins[1]["type"], PLUGIN_TYPE);
    assert_eq!(list.plugins[1]["tags"]["env"], "prod");

    let dir = tempfile::TempDir::new()?;
    let path = dir.path().join("10-eni.conflist");
    list.save(&path)?;
    let saved: NetConfList = serde_json::from_slice(&std::fs::read(&path)?)?;
    assert_eq!(saved.name, "eni-net");

    Ok(())
}
