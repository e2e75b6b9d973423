//! Pipeline and stage tests against fake collaborators.
//!
//! Every external subsystem (hypervisor, remote transport, servicing
//! tools) is replaced with a scripted fake that records its calls, so the
//! provisioning state machine can be exercised end-to-end on any platform:
//! resource discipline (mount/dismount pairing, VM-name uniqueness), the
//! guest-readiness retry budget, the shutdown wait, and the full build
//! scenarios.
//!
//! Timing-sensitive waits run under tokio's paused virtual clock, so polls
//! that would take minutes of wall time finish in milliseconds.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use tempfile::TempDir;

use vmseal::hypervisor::{Hypervisor, ServiceStatus, VmSpec};
use vmseal::provision::pipeline::REPORT_FILE;
use vmseal::provision::{
    DiskImageStager, GuestReadinessProbe, PipelineOptions, ProvisioningPipeline,
    ProvisioningRequest, SysprepOrchestrator, TemplateSealer, VmHandle, VmLifecycleController,
};
use vmseal::remoting::{Credential, RemoteSession, RemoteTransport};
use vmseal::tools::{ConvertSpec, PatchSpec, ServicingTools};

// ---------------------------------------------------------------------------
// FakeHypervisor
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeHvState {
    vms: HashSet<(String, String)>,
    running: HashSet<(String, String)>,
    mounted: HashSet<PathBuf>,
}

/// Scripted hypervisor. Query responses pop from per-query scripts; an
/// empty script yields a "healthy booted guest" default so only the
/// behavior under test needs scripting.
struct FakeHypervisor {
    state: Mutex<FakeHvState>,
    mount_root: PathBuf,
    mount_calls: AtomicUsize,
    dismount_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    address_polls: AtomicUsize,
    status_polls: AtomicUsize,
    macs: Mutex<Vec<String>>,
    data_disks: Mutex<Vec<(PathBuf, u64)>>,
    heartbeat_script: Mutex<VecDeque<String>>,
    address_script: Mutex<VecDeque<Vec<String>>>,
    status_script: Mutex<VecDeque<Vec<ServiceStatus>>>,
}

impl FakeHypervisor {
    fn new(mount_root: &Path) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::default(),
            mount_root: mount_root.to_path_buf(),
            mount_calls: AtomicUsize::new(0),
            dismount_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
            address_polls: AtomicUsize::new(0),
            status_polls: AtomicUsize::new(0),
            macs: Mutex::new(Vec::new()),
            data_disks: Mutex::new(Vec::new()),
            heartbeat_script: Mutex::new(VecDeque::new()),
            address_script: Mutex::new(VecDeque::new()),
            status_script: Mutex::new(VecDeque::new()),
        })
    }

    fn seed_vm(&self, name: &str, host: &str, running: bool) {
        let mut state = self.state.lock().unwrap();
        state.vms.insert((name.to_string(), host.to_string()));
        if running {
            state.running.insert((name.to_string(), host.to_string()));
        }
    }

    fn vm_count(&self, name: &str, host: &str) -> usize {
        let state = self.state.lock().unwrap();
        usize::from(state.vms.contains(&(name.to_string(), host.to_string())))
    }

    fn push_addresses(&self, addresses: &[&str]) {
        self.address_script
            .lock()
            .unwrap()
            .push_back(addresses.iter().map(|a| a.to_string()).collect());
    }

    fn push_statuses(&self, statuses: &[(&str, &str)]) {
        self.status_script.lock().unwrap().push_back(
            statuses
                .iter()
                .map(|(service, status)| ServiceStatus {
                    service: service.to_string(),
                    status: status.to_string(),
                })
                .collect(),
        );
    }

    fn mounts(&self) -> usize {
        self.mount_calls.load(Ordering::SeqCst)
    }

    fn dismounts(&self) -> usize {
        self.dismount_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn vm_exists(&self, name: &str, host: &str) -> Result<bool> {
        Ok(self.vm_count(name, host) == 1)
    }

    async fn force_stop_vm(&self, name: &str, host: &str) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        // A hard power-off succeeds whether or not the VM is running.
        state.running.remove(&(name.to_string(), host.to_string()));
        Ok(())
    }

    async fn delete_vm(&self, name: &str, host: &str) -> Result<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        let key = (name.to_string(), host.to_string());
        if state.running.contains(&key) {
            bail!("cannot delete running VM {name}");
        }
        if !state.vms.remove(&key) {
            bail!("no VM named {name} on {host}");
        }
        Ok(())
    }

    async fn first_switch(&self, _host: &str) -> Result<String> {
        Ok("External".to_string())
    }

    async fn create_vm(&self, spec: &VmSpec) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let key = (spec.name.clone(), spec.host.clone());
        if !state.vms.insert(key) {
            bail!("VM {} already exists on {}", spec.name, spec.host);
        }
        Ok(())
    }

    async fn set_fixed_mac(&self, _name: &str, _host: &str, mac: &str) -> Result<()> {
        self.macs.lock().unwrap().push(mac.to_string());
        Ok(())
    }

    async fn attach_data_disk(
        &self,
        _name: &str,
        _host: &str,
        disk_path: &Path,
        size_bytes: u64,
    ) -> Result<()> {
        self.data_disks
            .lock()
            .unwrap()
            .push((disk_path.to_path_buf(), size_bytes));
        Ok(())
    }

    async fn start_vm(&self, name: &str, host: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let key = (name.to_string(), host.to_string());
        if !state.vms.contains(&key) {
            bail!("cannot start missing VM {name}");
        }
        state.running.insert(key);
        Ok(())
    }

    async fn heartbeat(&self, _name: &str, _host: &str) -> Result<String> {
        Ok(self
            .heartbeat_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| "OkApplicationsHealthy".to_string()))
    }

    async fn guest_addresses(&self, _name: &str, _host: &str) -> Result<Vec<String>> {
        self.address_polls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .address_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| vec!["192.0.2.50".to_string()]))
    }

    async fn integration_statuses(&self, name: &str, host: &str) -> Result<Vec<ServiceStatus>> {
        self.status_polls.fetch_add(1, Ordering::SeqCst);
        let statuses = self.status_script.lock().unwrap().pop_front().unwrap_or_default();
        if statuses.iter().all(ServiceStatus::is_silent) {
            // All-silent statuses mean the guest has powered off.
            let mut state = self.state.lock().unwrap();
            state.running.remove(&(name.to_string(), host.to_string()));
        }
        Ok(statuses)
    }

    async fn mount_disk(&self, disk_path: &Path) -> Result<PathBuf> {
        self.mount_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if !state.mounted.insert(disk_path.to_path_buf()) {
            bail!("disk already mounted: {}", disk_path.display());
        }
        Ok(self.mount_root.clone())
    }

    async fn dismount_disk(&self, disk_path: &Path) -> Result<()> {
        self.dismount_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if !state.mounted.remove(&disk_path.to_path_buf()) {
            bail!("disk was not mounted: {}", disk_path.display());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeTransport
// ---------------------------------------------------------------------------

struct FakeTransport {
    reachable_script: Mutex<VecDeque<bool>>,
    /// Number of `open_session` calls that fail before one succeeds.
    session_failures: AtomicUsize,
    open_calls: AtomicUsize,
    commands: Mutex<Vec<String>>,
}

impl FakeTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            reachable_script: Mutex::new(VecDeque::new()),
            session_failures: AtomicUsize::new(0),
            open_calls: AtomicUsize::new(0),
            commands: Mutex::new(Vec::new()),
        })
    }

    fn fail_sessions(&self, count: usize) {
        self.session_failures.store(count, Ordering::SeqCst);
    }

    fn ran_commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteTransport for FakeTransport {
    async fn is_reachable(&self, _address: &str) -> Result<bool> {
        Ok(self
            .reachable_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(true))
    }

    async fn open_session(&self, address: &str, credential: &Credential) -> Result<RemoteSession> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.session_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.session_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(anyhow!("connection reset by guest reboot"));
        }
        Ok(RemoteSession::new(
            format!("fake/{address}"),
            address,
            credential.clone(),
        ))
    }

    async fn run(&self, _session: &RemoteSession, command: &str, _label: &str) -> Result<()> {
        self.commands.lock().unwrap().push(command.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeTools
// ---------------------------------------------------------------------------

struct FakeTools {
    convert_calls: Mutex<Vec<ConvertSpec>>,
    patch_calls: Mutex<Vec<PatchSpec>>,
    cleanup_calls: AtomicUsize,
    defrag_calls: AtomicUsize,
    fail_component_cleanup: bool,
}

impl FakeTools {
    fn with_cleanup_failure(fail_component_cleanup: bool) -> Arc<Self> {
        Arc::new(Self {
            convert_calls: Mutex::new(Vec::new()),
            patch_calls: Mutex::new(Vec::new()),
            cleanup_calls: AtomicUsize::new(0),
            defrag_calls: AtomicUsize::new(0),
            fail_component_cleanup,
        })
    }

    fn new() -> Arc<Self> {
        Self::with_cleanup_failure(false)
    }

    fn failing_cleanup() -> Arc<Self> {
        Self::with_cleanup_failure(true)
    }
}

#[async_trait]
impl ServicingTools for FakeTools {
    async fn convert_image(&self, spec: &ConvertSpec) -> Result<()> {
        if let Some(parent) = spec.output_disk.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&spec.output_disk, b"vhdx-image-bytes")?;
        self.convert_calls.lock().unwrap().push(spec.clone());
        Ok(())
    }

    async fn apply_patches(&self, spec: &PatchSpec) -> Result<()> {
        // The real tool drops its logs beside the disk it serviced.
        if let Some(beside) = spec.disk_path.parent() {
            std::fs::write(beside.join("offline-servicing.log"), b"patched\n")?;
        }
        self.patch_calls.lock().unwrap().push(spec.clone());
        Ok(())
    }

    async fn component_cleanup(&self, _mount_root: &Path) -> Result<()> {
        self.cleanup_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_component_cleanup {
            bail!("component store is corrupt");
        }
        Ok(())
    }

    async fn defragment(&self, _mount_root: &Path) -> Result<()> {
        self.defrag_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Test environment
// ---------------------------------------------------------------------------

/// Scratch layout for one build: source image, config dir with an answer
/// file, a mount root populated like a just-installed guest, and a request
/// wired to all of it.
struct BuildEnv {
    _tmp: TempDir,
    mount_root: PathBuf,
    request: ProvisioningRequest,
}

impl BuildEnv {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();

        std::fs::write(root.join("install.wim"), b"wim-bytes").unwrap();

        let config_dir = root.join("config");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(config_dir.join("unattend.xml"), b"<unattend/>").unwrap();

        let mount_root = root.join("mount");
        populate_guest_tree(&mount_root);

        let request = ProvisioningRequest {
            image_path: root.join("install.wim"),
            edition: "ServerStandard".to_string(),
            config_dir,
            machine_name: "tmpl-build".to_string(),
            credential: Credential::new("administrator", "pw"),
            disk_path: root.join("disks").join("build.vhdx"),
            host: "buildhost01".to_string(),
            fixed_mac: None,
            patch_server: "wsus01".to_string(),
            patch_group: "Templates".to_string(),
            work_dir: root.join("work"),
            log_dir: root.join("logs"),
            template_path: root.join("templates").join("sealed.vhdx"),
            data_disk_sizes: Vec::new(),
        };

        Self {
            _tmp: tmp,
            mount_root,
            request,
        }
    }

    fn handle(&self) -> VmHandle {
        VmHandle {
            name: self.request.machine_name.clone(),
            host: self.request.host.clone(),
        }
    }
}

/// Lay out the parts of a guest filesystem the seal stage touches.
fn populate_guest_tree(mount_root: &Path) {
    for dir in [
        "Users/Administrator/AppData",
        "Users/Default",
        "Users/Public",
        "Windows/Panther",
        "Windows/System32/winevt/Logs",
        "Windows/Temp",
        "Windows/SoftwareDistribution/Download",
    ] {
        std::fs::create_dir_all(mount_root.join(dir)).unwrap();
    }
    std::fs::write(mount_root.join("pagefile.sys"), b"page").unwrap();
    std::fs::write(mount_root.join("Users/Administrator/secret.txt"), b"x").unwrap();
    std::fs::write(mount_root.join("Windows/Panther/setupact.log"), b"setup").unwrap();
    std::fs::write(
        mount_root.join("Windows/System32/winevt/Logs/Application.evtx"),
        b"evtx",
    )
    .unwrap();
    std::fs::write(
        mount_root.join("Windows/System32/winevt/Logs/System.evtx"),
        b"evtx",
    )
    .unwrap();
    std::fs::write(mount_root.join("Windows/Temp/leftover.tmp"), b"t").unwrap();
}

fn fast_options() -> PipelineOptions {
    PipelineOptions::default()
}

// ---------------------------------------------------------------------------
// End-to-end scenarios
// ---------------------------------------------------------------------------

/// Scenario: valid image, config dir with only `unattend.xml`, one virtual
/// switch — the pipeline produces the template file and a non-empty log
/// directory.
#[tokio::test]
async fn pipeline_produces_template_and_logs() {
    let env = BuildEnv::new();
    let hv = FakeHypervisor::new(&env.mount_root);
    let transport = FakeTransport::new();
    let tools = FakeTools::new();

    let pipeline = ProvisioningPipeline::new(
        hv.clone(),
        transport.clone(),
        tools.clone(),
        fast_options(),
    );
    let report = pipeline.run(&env.request).await.unwrap();

    assert!(env.request.template_path.is_file(), "template disk must exist");
    assert!(report.succeeded);
    assert_eq!(report.stages.len(), 6);

    let log_entries: Vec<_> = std::fs::read_dir(&env.request.log_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    assert!(!log_entries.is_empty(), "log directory must not be empty");
    assert!(log_entries.iter().any(|n| n == REPORT_FILE));
    assert!(
        log_entries.iter().any(|n| n == "offline-servicing-patch.log"),
        "patch tool log must be relocated with stage suffix, got {log_entries:?}"
    );
    assert!(
        log_entries.iter().any(|n| n == "setupact-panther.log"),
        "guest setup log must be collected, got {log_entries:?}"
    );

    // Resource discipline over the whole run: one mount for staging, one
    // for sealing, each paired with a dismount.
    assert_eq!(hv.mounts(), 2);
    assert_eq!(hv.dismounts(), 2);

    // The sealer deleted the VM shell after capture.
    assert_eq!(hv.vm_count("tmpl-build", "buildhost01"), 0);

    // Generalization ran through the remote session.
    let commands = transport.ran_commands();
    assert!(
        commands.iter().any(|c| c.contains("sysprep")),
        "sysprep must run remotely, got {commands:?}"
    );

    // Cleanup really happened on the mounted disk.
    assert!(!env.mount_root.join("pagefile.sys").exists());
    assert!(!env.mount_root.join("Users/Administrator").exists());
    assert!(env.mount_root.join("Users/Default").exists());
    assert!(env.mount_root.join("Users/Public").exists());
    assert!(
        !env
            .mount_root
            .join("Windows/System32/winevt/Logs/Application.evtx")
            .exists()
    );
    assert_eq!(tools.cleanup_calls.load(Ordering::SeqCst), 1);
    assert_eq!(tools.defrag_calls.load(Ordering::SeqCst), 1);

    // The patch stage ran once against the staged disk.
    let patched = tools.patch_calls.lock().unwrap();
    assert_eq!(patched.len(), 1);
    assert_eq!(patched[0].disk_path, env.request.disk_path);
}

/// Scenario: a running VM already holds the target name — it is powered
/// off, deleted, and exactly one fresh instance remains.
#[tokio::test]
async fn colliding_vm_is_replaced_exactly_once() {
    let env = BuildEnv::new();
    let hv = FakeHypervisor::new(&env.mount_root);
    hv.seed_vm("tmpl-build", "buildhost01", true);

    let lifecycle = VmLifecycleController::new(hv.clone());
    let handle = lifecycle.create_and_start(&env.request).await.unwrap();

    assert_eq!(handle.name, "tmpl-build");
    assert_eq!(hv.stop_calls.load(Ordering::SeqCst), 1);
    assert_eq!(hv.delete_calls.load(Ordering::SeqCst), 1);
    assert_eq!(hv.vm_count("tmpl-build", "buildhost01"), 1);
}

/// Scenario: heartbeat OK, then the address query comes back empty twice
/// before the third poll reports one — the probe succeeds with that
/// address after exactly three address polls.
#[tokio::test(start_paused = true)]
async fn probe_takes_third_poll_address() {
    let env = BuildEnv::new();
    let hv = FakeHypervisor::new(&env.mount_root);
    hv.push_addresses(&[]);
    hv.push_addresses(&[]);
    hv.push_addresses(&["10.1.2.3"]);
    let transport = FakeTransport::new();

    let probe = GuestReadinessProbe::new(hv.clone(), transport, fast_options());
    let connection = probe
        .establish(&env.handle(), &env.request.credential)
        .await
        .unwrap()
        .expect("probe must succeed");

    assert_eq!(connection.address, "10.1.2.3");
    assert_eq!(hv.address_polls.load(Ordering::SeqCst), 3);
}

/// Scenario: two integration services, one already silent and one still
/// reporting — not stopped yet; next poll both silent — stopped.
#[tokio::test(start_paused = true)]
async fn shutdown_wait_requires_every_service_silent() {
    let env = BuildEnv::new();
    let hv = FakeHypervisor::new(&env.mount_root);
    hv.push_statuses(&[("Heartbeat", ""), ("Shutdown", "OK")]);
    hv.push_statuses(&[("Heartbeat", ""), ("Shutdown", "")]);
    let transport = FakeTransport::new();

    let sysprep = SysprepOrchestrator::new(hv.clone(), transport.clone(), fast_options());
    let connection = vmseal::provision::ConnectionInfo {
        machine_name: "tmpl-build".to_string(),
        address: "192.0.2.50".to_string(),
        session: RemoteSession::new("fake/1", "192.0.2.50", env.request.credential.clone()),
    };

    sysprep
        .generalize(&env.handle(), &connection)
        .await
        .unwrap();

    assert_eq!(transport.ran_commands().len(), 1);
    assert_eq!(
        hv.status_polls.load(Ordering::SeqCst),
        2,
        "the mixed-status poll must not count as stopped"
    );
}

// ---------------------------------------------------------------------------
// Retry budget
// ---------------------------------------------------------------------------

/// When every session establishment fails, the probe makes exactly the
/// configured number of attempts and reports no session without erroring.
#[tokio::test]
async fn readiness_retry_budget_is_exact() {
    let env = BuildEnv::new();
    let hv = FakeHypervisor::new(&env.mount_root);
    let transport = FakeTransport::new();
    transport.fail_sessions(usize::MAX);

    let probe = GuestReadinessProbe::new(hv, transport.clone(), fast_options());
    let result = probe
        .establish(&env.handle(), &env.request.credential)
        .await
        .unwrap();

    assert!(result.is_none(), "exhausted probe must report no session");
    assert_eq!(
        transport.open_calls.load(Ordering::SeqCst),
        10,
        "exactly one session attempt per readiness attempt"
    );
}

/// A mid-budget recovery uses the remaining attempts normally.
#[tokio::test]
async fn readiness_recovers_after_transient_session_failures() {
    let env = BuildEnv::new();
    let hv = FakeHypervisor::new(&env.mount_root);
    let transport = FakeTransport::new();
    transport.fail_sessions(3);

    let probe = GuestReadinessProbe::new(hv, transport.clone(), fast_options());
    let connection = probe
        .establish(&env.handle(), &env.request.credential)
        .await
        .unwrap();

    assert!(connection.is_some());
    assert_eq!(transport.open_calls.load(Ordering::SeqCst), 4);
}

// ---------------------------------------------------------------------------
// Resource discipline
// ---------------------------------------------------------------------------

/// A successful disk staging pairs its mount with a dismount.
#[tokio::test]
async fn build_disk_pairs_mount_and_dismount() {
    let env = BuildEnv::new();
    let hv = FakeHypervisor::new(&env.mount_root);
    let tools = FakeTools::new();

    let stager = DiskImageStager::new(hv.clone(), tools);
    stager.build_disk(&env.request).await.unwrap();

    assert_eq!(hv.mounts(), 1);
    assert_eq!(hv.dismounts(), 1);
    assert!(
        env.mount_root
            .join("Windows/Setup/Scripts/unattend.xml")
            .is_file(),
        "config payload must land in the resource directory"
    );
}

/// A disk staging that fails after the mount succeeded still dismounts.
#[tokio::test]
async fn failed_build_disk_still_dismounts() {
    let env = BuildEnv::new();
    // A plain file where the mount root should be makes the payload copy
    // fail after the mount itself succeeded.
    let blocked_root = env.mount_root.parent().unwrap().join("blocked-mount");
    std::fs::write(&blocked_root, b"not a directory").unwrap();
    let hv = FakeHypervisor::new(&blocked_root);

    let stager = DiskImageStager::new(hv.clone(), FakeTools::new());
    let result = stager.build_disk(&env.request).await;

    assert!(result.is_err());
    assert_eq!(hv.mounts(), 1);
    assert_eq!(hv.dismounts(), 1, "dismount must run on the failure path");
}

/// A seal run that fails mid-cleanup still dismounts, and no template is
/// published.
#[tokio::test]
async fn failed_seal_still_dismounts_and_publishes_nothing() {
    let env = BuildEnv::new();
    let hv = FakeHypervisor::new(&env.mount_root);
    hv.seed_vm("tmpl-build", "buildhost01", false);
    std::fs::create_dir_all(env.request.disk_path.parent().unwrap()).unwrap();
    std::fs::write(&env.request.disk_path, b"vhdx").unwrap();
    std::fs::create_dir_all(&env.request.log_dir).unwrap();

    let sealer = TemplateSealer::new(hv.clone(), FakeTools::failing_cleanup(), fast_options());
    let result = sealer.seal(&env.handle(), &env.request).await;

    assert!(result.is_err());
    assert_eq!(hv.mounts(), 1);
    assert_eq!(hv.dismounts(), 1, "dismount must run on the failure path");
    assert!(
        !env.request.template_path.exists(),
        "no partial template may be published"
    );
}

/// A missing answer file is a configuration failure caught before any
/// external tool runs.
#[tokio::test]
async fn missing_answer_file_fails_before_conversion() {
    let env = BuildEnv::new();
    std::fs::remove_file(env.request.config_dir.join("unattend.xml")).unwrap();
    let hv = FakeHypervisor::new(&env.mount_root);
    let tools = FakeTools::new();

    let stager = DiskImageStager::new(hv.clone(), tools.clone());
    let err = stager.build_disk(&env.request).await.unwrap_err();

    assert!(err.to_string().contains("unattend.xml"), "got: {err}");
    assert!(tools.convert_calls.lock().unwrap().is_empty());
    assert_eq!(hv.mounts(), 0);
}

// ---------------------------------------------------------------------------
// Lifecycle details
// ---------------------------------------------------------------------------

/// Extra data disks take sequential identifiers after the boot disk.
#[tokio::test]
async fn data_disks_are_attached_in_order() {
    let mut env = BuildEnv::new();
    env.request.data_disk_sizes = vec![10 * 1024 * 1024, 20 * 1024 * 1024];
    let hv = FakeHypervisor::new(&env.mount_root);

    let lifecycle = VmLifecycleController::new(hv.clone());
    lifecycle.create_and_start(&env.request).await.unwrap();

    let disks = hv.data_disks.lock().unwrap().clone();
    assert_eq!(disks.len(), 2);
    assert!(disks[0].0.to_string_lossy().ends_with("tmpl-build-d.vhdx"));
    assert!(disks[1].0.to_string_lossy().ends_with("tmpl-build-e.vhdx"));
    assert_eq!(disks[0].1, 10 * 1024 * 1024);
    assert_eq!(disks[1].1, 20 * 1024 * 1024);
}

/// More data disks than there are drive letters left after the boot disk
/// is rejected before any attachment.
#[tokio::test]
async fn too_many_data_disks_fail_before_attachment() {
    let mut env = BuildEnv::new();
    env.request.data_disk_sizes = vec![1024; 24];
    let hv = FakeHypervisor::new(&env.mount_root);

    let lifecycle = VmLifecycleController::new(hv.clone());
    let err = lifecycle.create_and_start(&env.request).await.unwrap_err();

    assert!(err.to_string().contains("data disks"), "got: {err}");
    assert!(hv.data_disks.lock().unwrap().is_empty());
}

/// A requested fixed hardware address is applied before start.
#[tokio::test]
async fn fixed_mac_is_applied_when_requested() {
    let mut env = BuildEnv::new();
    env.request.fixed_mac = Some("00155D0A1234".to_string());
    let hv = FakeHypervisor::new(&env.mount_root);

    let lifecycle = VmLifecycleController::new(hv.clone());
    lifecycle.create_and_start(&env.request).await.unwrap();

    assert_eq!(*hv.macs.lock().unwrap(), vec!["00155D0A1234".to_string()]);
}

/// An exhausted readiness probe aborts the pipeline with the stage named,
/// and the run report still lands in the log directory.
#[tokio::test]
async fn exhausted_probe_aborts_pipeline_with_stage_name() {
    let env = BuildEnv::new();
    let hv = FakeHypervisor::new(&env.mount_root);
    let transport = FakeTransport::new();
    transport.fail_sessions(usize::MAX);
    let tools = FakeTools::new();

    let pipeline = ProvisioningPipeline::new(hv, transport, tools, fast_options());
    let err = pipeline.run(&env.request).await.unwrap_err();

    let message = format!("{err:#}");
    assert!(message.contains("guest-readiness"), "got: {message}");
    assert!(message.contains("tmpl-build"), "got: {message}");
    assert!(
        !env.request.template_path.exists(),
        "failed run must not publish a template"
    );
    assert!(env.request.log_dir.join(REPORT_FILE).is_file());
}
