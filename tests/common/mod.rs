// Shared fakes for the lifecycle tests
#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use eni_cni::commands::Backends;
use eni_cni::config::Settings;
use eni_cni::ec2::{ApiResult, Attachment, CreateRequest, CreatedInterface, Ec2Api, InterfaceStatus};
use eni_cni::error::{ApiError, EniError, Result};
use eni_cni::metadata::MetadataSource;
use eni_cni::netns::{IpRoute2, LinkFacts, NetworkStack};
use eni_cni::types::CmdArgs;
use ipnetwork::Ipv4Network;
use tempfile::TempDir;

pub type CallLog = Rc<RefCell<Vec<String>>>;

pub struct FakeMetadata {
    values: HashMap<String, String>,
}

impl FakeMetadata {
    pub fn new() -> Self {
        let mac = "02:aa:bb:cc:dd:ee";
        let values = HashMap::from([
            ("instance-id".to_string(), "i-0123456789".to_string()),
            ("placement/availability-zone".to_string(), "us-east-1a".to_string()),
            ("mac".to_string(), mac.to_string()),
            (format!("network/interfaces/macs/{}/subnet-id", mac), "subnet-1".to_string()),
            (format!("network/interfaces/macs/{}/subnet-ipv4-cidr-block", mac), "10.0.1.0/24".to_string()),
            (format!("network/interfaces/macs/{}/security-group-ids", mac), "sg-1\nsg-2\n".to_string()),
            ("network/interfaces/macs/".to_string(), format!("{}/\n", mac)),
        ]);
        Self { values }
    }
}

impl MetadataSource for FakeMetadata {
    fn get(&self, path: &str) -> Result<String> {
        self.values.get(path).cloned().ok_or_else(|| EniError::Metadata {
            path: path.to_string(),
            reason: "404 Not Found".to_string(),
        })
    }
}

/// Provisioning API that hands out `eni-N` / `attach-N` and logs every call
#[derive(Clone, Default)]
pub struct FakeEc2 {
    pub calls: CallLog,
    next_interface: Rc<Cell<u32>>,
    pub attach_errors: Rc<RefCell<VecDeque<ApiError>>>,
    pub detach_errors: Rc<RefCell<VecDeque<ApiError>>>,
    pub delete_errors: Rc<RefCell<VecDeque<ApiError>>>,
    /// Statuses reported before `settled_status`
    pub statuses: Rc<RefCell<VecDeque<InterfaceStatus>>>,
    settled_status: Rc<RefCell<Option<InterfaceStatus>>>,
}

impl FakeEc2 {
    pub fn new() -> Self {
        Self::default()
    }

    /// Status reported once `statuses` is drained; `Available` unless set
    pub fn settle_at(&self, status: InterfaceStatus) {
        *self.settled_status.borrow_mut() = Some(status);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    /// Only the lifecycle-changing calls
    pub fn lifecycle_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| ["create", "attach", "detach", "delete"].iter().any(|p| c.starts_with(p)))
            .collect()
    }

    fn log(&self, call: String) {
        self.calls.borrow_mut().push(call);
    }
}

impl Ec2Api for FakeEc2 {
    fn create_interface(&self, request: &CreateRequest<'_>) -> ApiResult<CreatedInterface> {
        let n = self.next_interface.get() + 1;
        self.next_interface.set(n);
        self.log(format!("create {}", request.subnet_id));

        let interface_id = format!("eni-{}", n);
        let mac_address = format!("02:00:00:00:00:{:02x}", n);
        let raw = serde_json::json!({
            "NetworkInterface": {"NetworkInterfaceId": interface_id, "MacAddress": mac_address}
        })
        .to_string();
        Ok(CreatedInterface {
            interface_id,
            mac_address,
            private_ip: Some(format!("10.0.1.{}", 10 + n)),
            raw,
        })
    }

    fn attach_interface(
        &self,
        _region: &str,
        interface_id: &str,
        _instance_id: &str,
        device_index: u32,
    ) -> ApiResult<Attachment> {
        self.log(format!("attach {} {}", interface_id, device_index));
        if let Some(err) = self.attach_errors.borrow_mut().pop_front() {
            return Err(err);
        }
        let attachment_id = interface_id.replace("eni-", "attach-");
        Ok(Attachment {
            raw: format!(r#"{{"AttachmentId":"{}"}}"#, attachment_id),
            attachment_id,
        })
    }

    fn set_delete_on_termination(&self, _region: &str, interface_id: &str, _attachment_id: &str) -> ApiResult<()> {
        self.log(format!("modify {}", interface_id));
        Ok(())
    }

    fn detach_interface(&self, _region: &str, attachment_id: &str) -> ApiResult<String> {
        self.log(format!("detach {}", attachment_id));
        match self.detach_errors.borrow_mut().pop_front() {
            Some(err) => Err(err),
            None => Ok(String::new()),
        }
    }

    fn delete_interface(&self, _region: &str, interface_id: &str) -> ApiResult<String> {
        self.log(format!("delete {}", interface_id));
        match self.delete_errors.borrow_mut().pop_front() {
            Some(err) => Err(err),
            None => Ok(String::new()),
        }
    }

    fn interface_status(&self, _region: &str, interface_id: &str) -> ApiResult<InterfaceStatus> {
        self.log(format!("status {}", interface_id));
        if let Some(status) = self.statuses.borrow_mut().pop_front() {
            return Ok(status);
        }
        Ok(self
            .settled_status
            .borrow()
            .clone()
            .unwrap_or(InterfaceStatus::Available))
    }
}

/// Network stack with real handle symlinks and logged kernel operations
#[derive(Clone)]
pub struct FakeStack {
    pub calls: CallLog,
    handles: IpRoute2,
    pub fail_on: Rc<Cell<Option<&'static str>>>,
    /// Lookups by MAC that find nothing before the device appears
    pub pending_links: Rc<Cell<u32>>,
    /// Address lookups that find nothing before the host addresses the device
    pub pending_addresses: Rc<Cell<u32>>,
}

impl FakeStack {
    pub fn new(netns_dir: &Path) -> Self {
        Self {
            calls: CallLog::default(),
            handles: IpRoute2::new("ip", netns_dir),
            fail_on: Rc::new(Cell::new(None)),
            pending_links: Rc::new(Cell::new(0)),
            pending_addresses: Rc::new(Cell::new(0)),
        }
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls().iter().filter(|c| c.split(' ').next() == Some(op)).count()
    }

    fn still_pending(counter: &Cell<u32>) -> bool {
        match counter.get() {
            0 => false,
            u32::MAX => true,
            n => {
                counter.set(n - 1);
                true
            }
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    fn step(&self, op: &'static str, call: String) -> Result<()> {
        self.calls.borrow_mut().push(call);
        if self.fail_on.get() == Some(op) {
            return Err(EniError::Namespace {
                op,
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

impl NetworkStack for FakeStack {
    fn link_by_mac(&self, mac: &str) -> Result<Option<String>> {
        self.step("link_by_mac", format!("link_by_mac {}", mac))?;
        if Self::still_pending(&self.pending_links) {
            return Ok(None);
        }
        Ok(Some("ens6".to_string()))
    }

    fn link_facts(&self, link: &str) -> Result<Option<LinkFacts>> {
        self.step("link_facts", format!("link_facts {}", link))?;
        if Self::still_pending(&self.pending_addresses) {
            return Ok(None);
        }
        let address: Ipv4Network = "10.0.1.11/24".parse().expect("valid network");
        Ok(Some(LinkFacts::from_network(address)))
    }

    fn create_handle(&self, container_id: &str, netns_path: &str) -> Result<()> {
        self.step("create_handle", format!("create_handle {}", container_id))?;
        self.handles.create_handle(container_id, netns_path)
    }

    fn remove_handle(&self, container_id: &str) -> Result<()> {
        self.step("remove_handle", format!("remove_handle {}", container_id))?;
        self.handles.remove_handle(container_id)
    }

    fn move_interface(&self, link: &str, container_id: &str, target: &str) -> Result<()> {
        self.step("move_interface", format!("move_interface {} {} {}", link, container_id, target))
    }

    fn configure_address(&self, _container_id: &str, target: &str, address: Ipv4Network, broadcast: Ipv4Addr) -> Result<()> {
        self.step("configure_address", format!("configure_address {} {} {}", target, address, broadcast))
    }

    fn install_default_route(&self, _container_id: &str, target: &str, gateway: Ipv4Addr) -> Result<()> {
        self.step("install_default_route", format!("install_default_route {} {}", target, gateway))
    }
}

pub struct FakeBackends {
    pub metadata_available: bool,
    pub api: FakeEc2,
    pub stack: FakeStack,
}

impl Backends for FakeBackends {
    type Metadata = FakeMetadata;
    type Api = FakeEc2;
    type Stack = FakeStack;

    fn metadata(&self, _settings: &Settings) -> Result<FakeMetadata> {
        if self.metadata_available {
            Ok(FakeMetadata::new())
        } else {
            Err(EniError::Metadata {
                path: "instance-id".to_string(),
                reason: "connection refused".to_string(),
            })
        }
    }

    fn api(&self, _settings: &Settings) -> FakeEc2 {
        self.api.clone()
    }

    fn stack(&self, _settings: &Settings) -> FakeStack {
        self.stack.clone()
    }
}

/// Temporary host: state directory, namespace handle directory and a
/// stand-in namespace file
pub struct Host {
    pub tmp: TempDir,
    pub state_dir: PathBuf,
    pub netns_dir: PathBuf,
    pub netns_path: PathBuf,
}

impl Host {
    pub fn new() -> Self {
        let tmp = TempDir::new().expect("tempdir");
        let state_dir = tmp.path().join("state");
        let netns_dir = tmp.path().join("netns");
        let netns_path = tmp.path().join("container-netns");
        fs::write(&netns_path, b"").expect("netns stand-in");
        Self {
            tmp,
            state_dir,
            netns_dir,
            netns_path,
        }
    }

    pub fn backends(&self) -> FakeBackends {
        FakeBackends {
            metadata_available: true,
            api: FakeEc2::new(),
            stack: FakeStack::new(&self.netns_dir),
        }
    }

    pub fn prev_result() -> serde_json::Value {
        serde_json::json!({
            "cniVersion": "1.0.0",
            "interfaces": [{"name": "eth0", "sandbox": "/var/run/netns/x"}],
            "ips": [{"address": "10.22.0.5/16", "gateway": "10.22.0.1", "interface": 0}]
        })
    }

    pub fn config(&self, prev_result: Option<serde_json::Value>) -> Vec<u8> {
        self.config_with_timeout(prev_result, 2)
    }

    pub fn config_with_timeout(&self, prev_result: Option<serde_json::Value>, timeout_secs: u64) -> Vec<u8> {
        let mut conf = serde_json::json!({
            "cniVersion": "1.0.0",
            "name": "eni-test",
            "type": "eni-cni",
            "stateDir": self.state_dir,
            "netnsDir": self.netns_dir,
            "attachTimeoutSecs": timeout_secs,
            "detachTimeoutSecs": timeout_secs
        });
        if let Some(prev) = prev_result {
            conf["prevResult"] = prev;
        }
        serde_json::to_vec(&conf).expect("encode config")
    }

    pub fn args(&self, container_id: &str, stdin_data: Vec<u8>) -> CmdArgs {
        CmdArgs {
            container_id: container_id.to_string(),
            netns: self.netns_path.to_string_lossy().into_owned(),
            ifname: "eth1".to_string(),
            args: HashMap::new(),
            path: "/opt/cni/bin".to_string(),
            stdin_data,
        }
    }

    pub fn work_dir(&self, container_id: &str) -> PathBuf {
        self.state_dir.join(eni_cni::state::work_dir_name(container_id))
    }

    pub fn handle(&self, container_id: &str) -> PathBuf {
        self.netns_dir.join(container_id)
    }

    pub fn has_handle(&self, container_id: &str) -> bool {
        fs::symlink_metadata(self.handle(container_id)).is_ok()
    }
}
