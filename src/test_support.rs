//! In-memory device used by the unit tests

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use crate::bridge::{AfcFopenMode, DeviceBridge, LinkType, NativeCode, StatusCallback};

pub const DEFAULT_UDID: &str = "00008030-001A2D3E0C38802E";
pub const SERVICE_PORT: u16 = 49152;

/// Largest write the fake AFC accepts per call, to exercise short writes
const MAX_WRITE: usize = 32 * 1024;

#[derive(Debug)]
pub struct MockState {
    pub devices: Vec<String>,
    pub handshake_code: Option<i32>,
    /// Result code per service identifier
    pub service_codes: HashMap<String, i32>,

    pub dirs: BTreeSet<String>,
    pub files: BTreeMap<String, Vec<u8>>,
    pub links: BTreeMap<String, String>,
    /// Paths whose open fails with permission denied
    pub unwritable: HashSet<String>,
    /// Paths that open fine but reject every write
    pub failing_writes: HashSet<String>,
    pub open_files: HashMap<u64, String>,
    next_fd: u64,

    /// Status dictionaries delivered, in order, after an upgrade is submitted
    pub install_script: Vec<plist::Value>,
    pub install_requests: Vec<(String, plist::Dictionary)>,
    pub callbacks_delivered: usize,
    pub apps: Vec<plist::Value>,

    pub connection: Option<tokio::io::DuplexStream>,
    pub connected_ports: Vec<u16>,
    pub started_services: Vec<String>,

    pub devices_freed: usize,
    pub lockdowns_freed: usize,
    pub services_freed: usize,
    pub afc_freed: usize,
    pub instproxy_freed: usize,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            devices: vec![DEFAULT_UDID.to_string()],
            handshake_code: None,
            service_codes: HashMap::new(),
            dirs: BTreeSet::new(),
            files: BTreeMap::new(),
            links: BTreeMap::new(),
            unwritable: HashSet::new(),
            failing_writes: HashSet::new(),
            open_files: HashMap::new(),
            next_fd: 1,
            install_script: Vec::new(),
            install_requests: Vec::new(),
            callbacks_delivered: 0,
            apps: Vec::new(),
            connection: None,
            connected_ports: Vec::new(),
            started_services: Vec::new(),
            devices_freed: 0,
            lockdowns_freed: 0,
            services_freed: 0,
            afc_freed: 0,
            instproxy_freed: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockBridge {
    state: Arc<Mutex<MockState>>,
}

#[derive(Debug)]
pub struct MockService {
    name: String,
}

impl MockBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }
}

impl DeviceBridge for MockBridge {
    type Device = String;
    type Lockdown = u32;
    type Service = MockService;
    type Afc = u32;
    type InstProxy = u32;
    type Connection = tokio::io::DuplexStream;

    async fn device_list(&self) -> Result<Vec<String>, NativeCode> {
        Ok(self.state().devices.clone())
    }

    async fn device_new(&self, udid: &str) -> Result<String, NativeCode> {
        if self.state().devices.iter().any(|d| d == udid) {
            Ok(udid.to_string())
        } else {
            Err(NativeCode(-2))
        }
    }

    fn device_free(&self, _device: String) {
        self.state().devices_freed += 1;
    }

    async fn device_connect(
        &self,
        _device: &String,
        port: u16,
    ) -> Result<tokio::io::DuplexStream, NativeCode> {
        let mut state = self.state();
        state.connected_ports.push(port);
        state.connection.take().ok_or(NativeCode(-3))
    }

    async fn lockdown_handshake(&self, _device: &String, _label: &str) -> Result<u32, NativeCode> {
        match self.state().handshake_code {
            Some(code) => Err(NativeCode(code)),
            None => Ok(1),
        }
    }

    fn lockdown_free(&self, _lockdown: u32) {
        self.state().lockdowns_freed += 1;
    }

    async fn lockdown_start_service(
        &self,
        _lockdown: &u32,
        name: &str,
    ) -> Result<MockService, NativeCode> {
        let mut state = self.state();
        if let Some(code) = state.service_codes.get(name) {
            return Err(NativeCode(*code));
        }
        state.started_services.push(name.to_string());
        Ok(MockService {
            name: name.to_string(),
        })
    }

    fn service_port(&self, _service: &MockService) -> u16 {
        SERVICE_PORT
    }

    fn service_free(&self, _service: MockService) {
        self.state().services_freed += 1;
    }

    async fn afc_client_new(
        &self,
        _device: &String,
        service: &MockService,
    ) -> Result<u32, NativeCode> {
        assert_eq!(service.name, "com.apple.afc");
        Ok(2)
    }

    fn afc_client_free(&self, _afc: u32) {
        self.state().afc_freed += 1;
    }

    async fn afc_make_directory(&self, _afc: &u32, path: &str) -> Result<(), NativeCode> {
        if self.state().dirs.insert(path.to_string()) {
            Ok(())
        } else {
            Err(NativeCode(16))
        }
    }

    async fn afc_make_link(
        &self,
        _afc: &u32,
        link_type: LinkType,
        target: &str,
        link_name: &str,
    ) -> Result<(), NativeCode> {
        assert_eq!(link_type, LinkType::Symlink);
        self.state()
            .links
            .insert(link_name.to_string(), target.to_string());
        Ok(())
    }

    async fn afc_file_open(
        &self,
        _afc: &u32,
        path: &str,
        mode: AfcFopenMode,
    ) -> Result<u64, NativeCode> {
        let mut state = self.state();
        if state.unwritable.contains(path) {
            return Err(NativeCode(10));
        }
        if mode == AfcFopenMode::WrOnly {
            state.files.insert(path.to_string(), Vec::new());
        }
        let fd = state.next_fd;
        state.next_fd += 1;
        state.open_files.insert(fd, path.to_string());
        Ok(fd)
    }

    async fn afc_file_write(&self, _afc: &u32, fd: u64, data: &[u8]) -> Result<usize, NativeCode> {
        let mut state = self.state();
        let path = state.open_files.get(&fd).cloned().ok_or(NativeCode(7))?;
        if state.failing_writes.contains(&path) {
            return Err(NativeCode(5));
        }
        let n = data.len().min(MAX_WRITE);
        state
            .files
            .entry(path)
            .or_default()
            .extend_from_slice(&data[..n]);
        Ok(n)
    }

    async fn afc_file_close(&self, _afc: &u32, fd: u64) -> Result<(), NativeCode> {
        match self.state().open_files.remove(&fd) {
            Some(_) => Ok(()),
            None => Err(NativeCode(7)),
        }
    }

    async fn instproxy_client_new(
        &self,
        _device: &String,
        service: &MockService,
    ) -> Result<u32, NativeCode> {
        assert_eq!(service.name, "com.apple.mobile.installation_proxy");
        Ok(3)
    }

    fn instproxy_client_free(&self, _client: u32) {
        self.state().instproxy_freed += 1;
    }

    async fn instproxy_browse(
        &self,
        _client: &u32,
        _options: plist::Dictionary,
    ) -> Result<Vec<plist::Value>, NativeCode> {
        Ok(self.state().apps.clone())
    }

    async fn instproxy_upgrade(
        &self,
        _client: &u32,
        package_path: &str,
        options: plist::Dictionary,
        callback: StatusCallback,
    ) -> Result<(), NativeCode> {
        let script = {
            let mut state = self.state();
            state
                .install_requests
                .push((package_path.to_string(), options));
            state.install_script.clone()
        };
        // status arrives on a thread the caller doesn't own
        let state = self.state.clone();
        std::thread::spawn(move || {
            for status in script {
                std::thread::sleep(Duration::from_millis(5));
                callback(plist::Value::String("Upgrade".into()), status);
                if let Ok(mut state) = state.lock() {
                    state.callbacks_delivered += 1;
                }
            }
        });
        Ok(())
    }
}

pub fn progress(status: &str, percent: u64) -> plist::Value {
    let mut d = plist::Dictionary::new();
    d.insert("Status".into(), status.into());
    d.insert("PercentComplete".into(), percent.into());
    plist::Value::Dictionary(d)
}

pub fn complete() -> plist::Value {
    let mut d = plist::Dictionary::new();
    d.insert("Status".into(), "Complete".into());
    plist::Value::Dictionary(d)
}

pub fn failure(error: &str, description: Option<&str>) -> plist::Value {
    let mut d = plist::Dictionary::new();
    d.insert("Error".into(), error.into());
    if let Some(description) = description {
        d.insert("ErrorDescription".into(), description.into());
    }
    plist::Value::Dictionary(d)
}

pub fn app_entry(bundle_id: &str, path: &str, executable: &str) -> plist::Value {
    let mut d = plist::Dictionary::new();
    d.insert("CFBundleIdentifier".into(), bundle_id.into());
    d.insert("Path".into(), path.into());
    d.insert("CFBundleExecutable".into(), executable.into());
    plist::Value::Dictionary(d)
}

#[cfg(feature = "debug_proxy")]
pub use debugserver::*;

#[cfg(feature = "debug_proxy")]
mod debugserver {
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use crate::services::debug_proxy::packet::{FrameBuffer, Incoming, encode_frame};

    /// One scripted exchange: the packet prefix the client must send and the raw bytes
    /// written back
    pub struct Step {
        expect: &'static str,
        reply: Vec<u8>,
    }

    impl Step {
        pub fn new(expect: &'static str, reply: Vec<u8>) -> Self {
            Self { expect, reply }
        }
    }

    pub fn frame(payload: &str) -> Vec<u8> {
        encode_frame(payload)
    }

    /// Steps answering a launch handshake with `env_vars` environment packets, up to and
    /// including `qLaunchSuccess`
    pub fn handshake(env_vars: usize) -> Vec<Step> {
        let mut steps = vec![
            // the device still acks this one
            Step::new("QStartNoAckMode", b"+$OK#9a".to_vec()),
            Step::new("QEnvironment:NSUnbufferedIO=YES", frame("OK")),
        ];
        for _ in 0..env_vars {
            steps.push(Step::new("QEnvironmentHexEncoded:", frame("OK")));
        }
        steps.push(Step::new("QListThreadsInStopReply", frame("OK")));
        steps.push(Step::new("A", frame("OK")));
        steps.push(Step::new("qLaunchSuccess", frame("OK")));
        steps
    }

    /// Plays `script` against the client, then keeps reading until the client hangs up
    ///
    /// Returns everything received in order: packet payloads, plus `"+"` and `"-"` for
    /// acks and naks.
    pub async fn fake_debugserver(mut io: DuplexStream, script: Vec<Step>) -> Vec<String> {
        let mut buffer = FrameBuffer::new();
        let mut script = script.into_iter();
        let mut received = Vec::new();
        let mut chunk = [0u8; 1024];

        loop {
            while let Some(incoming) = buffer.next_packet().unwrap() {
                let packet = match incoming {
                    Incoming::Ack => {
                        received.push("+".to_string());
                        continue;
                    }
                    Incoming::Nak => {
                        received.push("-".to_string());
                        continue;
                    }
                    Incoming::Frame(packet) => packet,
                };
                if let Some(step) = script.next() {
                    assert!(
                        packet.starts_with(step.expect),
                        "expected {} but got {packet}",
                        step.expect
                    );
                    let _ = io.write_all(&step.reply).await;
                }
                received.push(packet);
            }
            match io.read(&mut chunk).await {
                Ok(0) | Err(_) => return received,
                Ok(n) => buffer.extend(&chunk[..n]),
            }
        }
    }
}
