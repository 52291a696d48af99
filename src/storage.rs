//! The storage facade: owns the named device graphs and the pools, drives
//! probing and committing, and holds the advisory lock while the system
//! may be modified.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::Path;

use log::{debug, info};
use nix::fcntl::{Flock, FlockArg};

use osutils::mockup;

use crate::{
    actiongraph::ActionGraph,
    actions::CommitData,
    commit::{self, CommitCallbacks},
    devicegraph::DeviceGraph,
    environment::{Environment, ProbeMode},
    error::{Result, StorageError},
    pool::Pool,
    prober::{ProbeCallbacks, Prober, SystemInfo},
};

pub const PROBED: &str = "probed";
pub const SYSTEM: &str = "system";
pub const STAGING: &str = "staging";

const LOCK_FILE: &str = "/run/ballast.lock";

pub struct Storage {
    environment: Environment,
    devicegraphs: BTreeMap<String, DeviceGraph>,
    pools: BTreeMap<String, Pool>,
    // Held for the lifetime of the object; dropping releases the flock.
    _lock: Option<Flock<File>>,
}

impl Storage {
    pub fn new(environment: Environment) -> Result<Storage> {
        let lock = if !environment.read_only && environment.probe_mode.probes_system() {
            Some(Self::acquire_lock()?)
        } else {
            None
        };

        let mut devicegraphs = BTreeMap::new();
        devicegraphs.insert(PROBED.to_owned(), DeviceGraph::new());
        devicegraphs.insert(SYSTEM.to_owned(), DeviceGraph::new());
        devicegraphs.insert(STAGING.to_owned(), DeviceGraph::new());

        Ok(Storage {
            environment,
            devicegraphs,
            pools: BTreeMap::new(),
            _lock: lock,
        })
    }

    fn acquire_lock() -> Result<Flock<File>> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(LOCK_FILE)?;
        Flock::lock(file, FlockArg::LockExclusiveNonblock)
            .map_err(|(_, errno)| StorageError::Lock(errno.to_string()))
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    /// Probe the system (or a recorded stand-in, per the probe mode) and
    /// reset `probed`, `system` and `staging` to the result.
    pub fn probe(&mut self, callbacks: &dyn ProbeCallbacks) -> Result<()> {
        info!("probe begin, mode {:?}", self.environment.probe_mode);
        callbacks.begin();
        let result = self.probe_internal(callbacks);
        callbacks.end();
        info!("probe end");
        result
    }

    fn probe_internal(&mut self, callbacks: &dyn ProbeCallbacks) -> Result<()> {
        let system = match self.environment.probe_mode {
            ProbeMode::None => DeviceGraph::new(),

            ProbeMode::ReadDevicegraph => {
                let filename = self.environment.devicegraph_filename.clone().ok_or(
                    StorageError::InvariantViolation(
                        "probe mode read-devicegraph needs a devicegraph filename".to_owned(),
                    ),
                )?;
                DeviceGraph::load(filename)?
            }

            ProbeMode::ReadMockup => {
                let filename = self.environment.mockup_filename.clone().ok_or(
                    StorageError::InvariantViolation(
                        "probe mode read-mockup needs a mockup filename".to_owned(),
                    ),
                )?;
                mockup::load(Path::new(&filename))?;
                mockup::set_mode(mockup::Mode::Playback);
                self.run_prober(callbacks)?
            }

            ProbeMode::Standard => self.run_prober(callbacks)?,

            ProbeMode::StandardWriteDevicegraph => {
                let graph = self.run_prober(callbacks)?;
                let filename = self.environment.devicegraph_filename.clone().ok_or(
                    StorageError::InvariantViolation(
                        "probe mode standard-write-devicegraph needs a devicegraph filename"
                            .to_owned(),
                    ),
                )?;
                graph.save(filename)?;
                graph
            }

            ProbeMode::StandardWriteMockup => {
                mockup::set_mode(mockup::Mode::Record);
                mockup::clear();
                let graph = self.run_prober(callbacks)?;
                let filename = self.environment.mockup_filename.clone().ok_or(
                    StorageError::InvariantViolation(
                        "probe mode standard-write-mockup needs a mockup filename".to_owned(),
                    ),
                )?;
                mockup::save(Path::new(&filename))?;
                graph
            }
        };

        system.check()?;

        self.devicegraphs.insert(PROBED.to_owned(), system.clone());
        self.devicegraphs.insert(STAGING.to_owned(), system.clone());
        self.devicegraphs.insert(SYSTEM.to_owned(), system);
        Ok(())
    }

    fn run_prober(&self, callbacks: &dyn ProbeCallbacks) -> Result<DeviceGraph> {
        let mut graph = DeviceGraph::new();
        let mut system_info = SystemInfo::new();
        Prober::new(&mut graph, &mut system_info, callbacks).run()?;
        Ok(graph)
    }

    // Device graph management.

    pub fn devicegraph_names(&self) -> Vec<&str> {
        self.devicegraphs.keys().map(String::as_str).collect()
    }

    pub fn exist_devicegraph(&self, name: &str) -> bool {
        self.devicegraphs.contains_key(name)
    }

    pub fn get_devicegraph(&self, name: &str) -> Result<&DeviceGraph> {
        self.devicegraphs
            .get(name)
            .ok_or_else(|| StorageError::GraphNotFound(name.to_owned()))
    }

    pub fn get_devicegraph_mut(&mut self, name: &str) -> Result<&mut DeviceGraph> {
        if name == PROBED {
            return Err(StorageError::InvalidGraphName(
                "probed is immutable".to_owned(),
            ));
        }
        self.devicegraphs
            .get_mut(name)
            .ok_or_else(|| StorageError::GraphNotFound(name.to_owned()))
    }

    pub fn probed(&self) -> Result<&DeviceGraph> {
        self.get_devicegraph(PROBED)
    }

    pub fn system(&self) -> Result<&DeviceGraph> {
        self.get_devicegraph(SYSTEM)
    }

    pub fn staging(&self) -> Result<&DeviceGraph> {
        self.get_devicegraph(STAGING)
    }

    pub fn staging_mut(&mut self) -> Result<&mut DeviceGraph> {
        self.get_devicegraph_mut(STAGING)
    }

    fn check_name(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(StorageError::InvalidGraphName(name.to_owned()));
        }
        if name == PROBED {
            return Err(StorageError::InvalidGraphName(
                "probed cannot be recreated".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn create_devicegraph(&mut self, name: &str) -> Result<&mut DeviceGraph> {
        Self::check_name(name)?;
        if self.devicegraphs.contains_key(name) {
            return Err(StorageError::GraphExists(name.to_owned()));
        }
        Ok(self
            .devicegraphs
            .entry(name.to_owned())
            .or_insert_with(DeviceGraph::new))
    }

    pub fn copy_devicegraph(&mut self, source: &str, destination: &str) -> Result<()> {
        Self::check_name(destination)?;
        let copy = self.get_devicegraph(source)?.clone();
        self.devicegraphs.insert(destination.to_owned(), copy);
        Ok(())
    }

    pub fn remove_devicegraph(&mut self, name: &str) -> Result<()> {
        Self::check_name(name)?;
        self.devicegraphs
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StorageError::GraphNotFound(name.to_owned()))
    }

    pub fn rename_devicegraph(&mut self, old_name: &str, new_name: &str) -> Result<()> {
        Self::check_name(old_name)?;
        Self::check_name(new_name)?;
        if self.devicegraphs.contains_key(new_name) {
            return Err(StorageError::GraphExists(new_name.to_owned()));
        }
        let graph = self
            .devicegraphs
            .remove(old_name)
            .ok_or_else(|| StorageError::GraphNotFound(old_name.to_owned()))?;
        self.devicegraphs.insert(new_name.to_owned(), graph);
        Ok(())
    }

    /// Replace staging with a copy of the named graph.
    pub fn restore_devicegraph(&mut self, name: &str) -> Result<()> {
        let copy = self.get_devicegraph(name)?.clone();
        self.devicegraphs.insert(STAGING.to_owned(), copy);
        Ok(())
    }

    /// Cross-graph invariant: a sid names the same kind of device in every
    /// graph it appears in. Also checks each graph on its own.
    pub fn check(&self) -> Result<()> {
        for graph in self.devicegraphs.values() {
            graph.check()?;
        }

        let names: Vec<&String> = self.devicegraphs.keys().collect();
        for (position, first) in names.iter().enumerate() {
            for second in names.iter().skip(position + 1) {
                let a = &self.devicegraphs[*first];
                let b = &self.devicegraphs[*second];
                for sid in a.all_sids() {
                    if !b.has_device(sid) {
                        continue;
                    }
                    let variant_a = a.device(sid)?.kind.variant_name();
                    let variant_b = b.device(sid)?.kind.variant_name();
                    if variant_a != variant_b {
                        return Err(StorageError::InvariantViolation(format!(
                            "sid {sid} is a {variant_a} in '{first}' but a {variant_b} in \
                             '{second}'"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    // Planning and committing.

    /// The plan transforming the current system state into staging.
    pub fn calculate_actiongraph(&self) -> Result<ActionGraph> {
        debug!("calculating action graph");
        ActionGraph::build(self.system()?, self.staging()?)
    }

    pub fn commit(&mut self, callbacks: &dyn CommitCallbacks) -> Result<()> {
        if self.environment.read_only {
            return Err(StorageError::InvariantViolation(
                "storage object is read-only".to_owned(),
            ));
        }

        let actiongraph = self.calculate_actiongraph()?;
        let data = CommitData {
            lhs: self.system()?,
            rhs: self.staging()?,
        };
        commit::commit(data, &actiongraph, callbacks)
    }

    // Pool management.

    pub fn pool_names(&self) -> Vec<&str> {
        self.pools.keys().map(String::as_str).collect()
    }

    pub fn create_pool(&mut self, name: &str) -> Result<&mut Pool> {
        if name.is_empty() {
            return Err(StorageError::InvalidGraphName(name.to_owned()));
        }
        if self.pools.contains_key(name) {
            return Err(StorageError::PoolExists(name.to_owned()));
        }
        Ok(self.pools.entry(name.to_owned()).or_default())
    }

    pub fn get_pool(&self, name: &str) -> Result<&Pool> {
        self.pools
            .get(name)
            .ok_or_else(|| StorageError::PoolNotFound(name.to_owned()))
    }

    pub fn get_pool_mut(&mut self, name: &str) -> Result<&mut Pool> {
        self.pools
            .get_mut(name)
            .ok_or_else(|| StorageError::PoolNotFound(name.to_owned()))
    }

    pub fn remove_pool(&mut self, name: &str) -> Result<()> {
        self.pools
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StorageError::PoolNotFound(name.to_owned()))
    }

    pub fn rename_pool(&mut self, old_name: &str, new_name: &str) -> Result<()> {
        if new_name.is_empty() {
            return Err(StorageError::InvalidGraphName(new_name.to_owned()));
        }
        if self.pools.contains_key(new_name) {
            return Err(StorageError::PoolExists(new_name.to_owned()));
        }
        let pool = self
            .pools
            .remove(old_name)
            .ok_or_else(|| StorageError::PoolNotFound(old_name.to_owned()))?;
        self.pools.insert(new_name.to_owned(), pool);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::io::Write;

    use super::*;
    use crate::environment::TargetMode;
    use osutils::mockup::Mode;

    fn environment(probe_mode: ProbeMode) -> Environment {
        Environment::new(true, probe_mode, TargetMode::Direct)
    }

    #[test]
    fn test_stock_graphs_exist() {
        let storage = Storage::new(environment(ProbeMode::None)).unwrap();
        assert!(storage.exist_devicegraph(PROBED));
        assert!(storage.exist_devicegraph(SYSTEM));
        assert!(storage.exist_devicegraph(STAGING));
        storage.check().unwrap();
    }

    #[test]
    fn test_devicegraph_management() {
        let mut storage = Storage::new(environment(ProbeMode::None)).unwrap();

        assert!(matches!(
            storage.create_devicegraph(""),
            Err(StorageError::InvalidGraphName(_))
        ));
        assert!(matches!(
            storage.create_devicegraph(PROBED),
            Err(StorageError::InvalidGraphName(_))
        ));

        storage.create_devicegraph("backup").unwrap();
        assert!(matches!(
            storage.create_devicegraph("backup"),
            Err(StorageError::GraphExists(_))
        ));

        storage
            .staging_mut()
            .unwrap()
            .create_disk("/dev/sda", sysdefs::bytes::ByteCount(1 << 30));
        storage.copy_devicegraph(STAGING, "backup").unwrap();
        assert_eq!(storage.get_devicegraph("backup").unwrap().num_devices(), 1);
        assert_eq!(
            storage.staging().unwrap(),
            storage.get_devicegraph("backup").unwrap()
        );

        // Restoring overwrites staging from the named graph.
        storage
            .staging_mut()
            .unwrap()
            .create_disk("/dev/sdb", sysdefs::bytes::ByteCount(1 << 30));
        storage.restore_devicegraph("backup").unwrap();
        assert_eq!(storage.staging().unwrap().num_devices(), 1);

        storage.rename_devicegraph("backup", "archive").unwrap();
        assert!(storage.exist_devicegraph("archive"));
        assert!(!storage.exist_devicegraph("backup"));

        storage.remove_devicegraph("archive").unwrap();
        assert!(!storage.exist_devicegraph("archive"));
        assert!(matches!(
            storage.remove_devicegraph(PROBED),
            Err(StorageError::InvalidGraphName(_))
        ));
    }

    #[test]
    fn test_removed_stock_graphs_surface_errors() {
        // "system" and "staging" are ordinary names to the management API,
        // so removing them is legal; the accessors must report that instead
        // of blowing up.
        let mut storage = Storage::new(environment(ProbeMode::None)).unwrap();

        storage.remove_devicegraph(STAGING).unwrap();
        assert!(matches!(
            storage.staging(),
            Err(StorageError::GraphNotFound(_))
        ));
        assert!(matches!(
            storage.staging_mut(),
            Err(StorageError::GraphNotFound(_))
        ));

        storage.remove_devicegraph(SYSTEM).unwrap();
        assert!(matches!(
            storage.system(),
            Err(StorageError::GraphNotFound(_))
        ));
        assert!(matches!(
            storage.calculate_actiongraph(),
            Err(StorageError::GraphNotFound(_))
        ));

        assert!(storage.probed().is_ok());
    }

    #[test]
    fn test_pool_management() {
        let mut storage = Storage::new(environment(ProbeMode::None)).unwrap();

        storage.create_pool("hdds").unwrap();
        assert!(matches!(
            storage.create_pool("hdds"),
            Err(StorageError::PoolExists(_))
        ));

        storage.rename_pool("hdds", "ssds").unwrap();
        assert!(storage.get_pool("ssds").is_ok());
        assert!(storage.get_pool("hdds").is_err());

        storage.remove_pool("ssds").unwrap();
        assert_eq!(storage.pool_names().len(), 0);
    }

    struct ProbeRecorder {
        messages: RefCell<Vec<String>>,
    }

    impl ProbeRecorder {
        fn new() -> Self {
            ProbeRecorder { messages: RefCell::new(Vec::new()) }
        }
    }

    impl ProbeCallbacks for ProbeRecorder {
        fn begin(&self) {
            self.messages.borrow_mut().push("begin:".to_owned());
        }

        fn end(&self) {
            self.messages.borrow_mut().push("end:".to_owned());
        }

        fn error(&self, message: &str, what: &str) -> bool {
            self.messages
                .borrow_mut()
                .push(format!("error: message = '{message}', what = '{what}'"));
            true
        }
    }

    const LSBLK_KEY: &str = "lsblk --json --bytes --paths --output \
         NAME,KNAME,TYPE,SIZE,FSTYPE,LABEL,UUID,PTTYPE,PTUUID,PARTUUID,PKNAME,MOUNTPOINT,RO,ROTA,LOG-SEC";
    const PVS_KEY: &str = "pvs --reportformat json --config \
         'log { command_names = 0 prefix = \"\" }' --units b --nosuffix --all --options \
         pv_name,pv_uuid,vg_name,vg_uuid,pv_attr,pe_start";
    const VGS_KEY: &str = "vgs --reportformat json --config \
         'log { command_names = 0 prefix = \"\" }' --units b --nosuffix --all --options \
         vg_name,vg_uuid,vg_attr,vg_extent_size,vg_extent_count,vg_free_count";
    const LVS_KEY: &str = "lvs --reportformat json --config \
         'log { command_names = 0 prefix = \"\" }' --units b --nosuffix --all --options \
         lv_name,lv_uuid,vg_name,vg_uuid,lv_attr,lv_size";

    fn write_mockup(entries: &[(&str, &str)]) -> tempfile::NamedTempFile {
        let commands: Vec<String> = entries
            .iter()
            .map(|(key, stdout)| {
                let lines: Vec<String> = if stdout.is_empty() {
                    Vec::new()
                } else {
                    stdout.lines().map(str::to_owned).collect()
                };
                format!(
                    "{}: {}",
                    serde_json::to_string(key).unwrap(),
                    serde_json::to_string(&serde_json::json!({
                        "stdout": lines, "stderr": [], "exit_code": 0
                    }))
                    .unwrap()
                )
            })
            .collect();
        let text = format!(
            "{{\"commands\": {{{}}}, \"files\": {{}}}}",
            commands.join(", ")
        );

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_probe_read_mockup_empty_system() {
        let _guard = osutils::testing::playback_lock();

        let mockup_file = write_mockup(&[
            (LSBLK_KEY, "{\"blockdevices\": []}"),
            (PVS_KEY, "{\"report\": []}"),
            (VGS_KEY, "{\"report\": []}"),
            (LVS_KEY, "{\"report\": []}"),
        ]);

        let mut env = environment(ProbeMode::ReadMockup);
        env.mockup_filename = Some(mockup_file.path().to_string_lossy().to_string());

        let mut storage = Storage::new(env).unwrap();
        let recorder = ProbeRecorder::new();
        storage.probe(&recorder).unwrap();

        let messages = recorder.messages.borrow();
        assert_eq!(*messages, vec!["begin:".to_owned(), "end:".to_owned()]);
        assert!(storage.probed().unwrap().is_empty());
        assert!(storage.staging().unwrap().is_empty());
        assert_eq!(storage.probed().unwrap(), storage.system().unwrap());

        mockup::set_mode(Mode::None);
    }

    #[test]
    fn test_probe_error_surfaced_exactly_once() {
        let _guard = osutils::testing::playback_lock();

        // No pvs entry: probing LVM fails, the callback accepts it, and
        // probing carries on to the end.
        let mockup_file = write_mockup(&[(LSBLK_KEY, "{\"blockdevices\": []}")]);

        let mut env = environment(ProbeMode::ReadMockup);
        env.mockup_filename = Some(mockup_file.path().to_string_lossy().to_string());

        let mut storage = Storage::new(env).unwrap();
        let recorder = ProbeRecorder::new();
        storage.probe(&recorder).unwrap();

        let messages = recorder.messages.borrow();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0], "begin:");
        assert!(messages[1].starts_with("error: message = 'Probing LVM failed'"));
        assert!(messages[1].contains("no mockup entry for command 'pvs"));
        assert_eq!(messages[2], "end:");

        mockup::set_mode(Mode::None);
    }

    #[test]
    fn test_probe_error_aborts_when_callback_rejects() {
        let _guard = osutils::testing::playback_lock();

        struct Reject;
        impl ProbeCallbacks for Reject {}

        let mockup_file = write_mockup(&[(LSBLK_KEY, "{\"blockdevices\": []}")]);

        let mut env = environment(ProbeMode::ReadMockup);
        env.mockup_filename = Some(mockup_file.path().to_string_lossy().to_string());

        let mut storage = Storage::new(env).unwrap();
        assert!(matches!(
            storage.probe(&Reject),
            Err(StorageError::Aborted(_))
        ));

        mockup::set_mode(Mode::None);
    }
}
