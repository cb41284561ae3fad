//! In-memory bindings of projects to live processes, persisted after every change.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use gwtd_types::{PersistedBinding, PersistedState, ProjectDescriptor, Role};
use tracing::{debug, warn};

use crate::launcher::ProcessHandle;

/// Notified after each committed mutation, with the new revision.
pub trait StateObserver {
    fn state_changed(&mut self, revision: u64, state: &PersistedState) -> Result<()>;
}

/// Persists registry state as pretty JSON, replacing the file atomically.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn load(&self) -> Result<PersistedState> {
        if !self.path.exists() {
            return Ok(PersistedState::default());
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read state file: {}", self.path.display()))?;
        if raw.trim().is_empty() {
            return Ok(PersistedState::default());
        }
        serde_json::from_str(&raw).context("failed to parse persisted state")
    }
}

impl StateObserver for JsonFileStore {
    fn state_changed(&mut self, _revision: u64, state: &PersistedState) -> Result<()> {
        let data =
            serde_json::to_string_pretty(state).context("failed to serialize daemon state")?;
        atomic_write_file(&self.path, data.as_bytes())
    }
}

fn atomic_write_file(target: &Path, data: &[u8]) -> Result<()> {
    let parent = target
        .parent()
        .with_context(|| format!("cannot determine parent directory for {}", target.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create directory: {}", parent.display()))?;
    let tmp_path = target.with_extension("tmp");
    fs::write(&tmp_path, data)
        .with_context(|| format!("failed to write temporary file: {}", tmp_path.display()))?;
    fs::rename(&tmp_path, target).with_context(|| {
        format!(
            "failed to rename {} to {}",
            tmp_path.display(),
            target.display()
        )
    })?;
    Ok(())
}

#[derive(Debug, Default)]
struct RoleSlot {
    handle: Option<ProcessHandle>,
    was_active: bool,
}

#[derive(Debug)]
struct ProjectEntry {
    descriptor: ProjectDescriptor,
    slots: BTreeMap<Role, RoleSlot>,
    discovered_port: Option<u16>,
}

impl ProjectEntry {
    fn new(descriptor: ProjectDescriptor) -> Self {
        Self {
            descriptor,
            slots: BTreeMap::new(),
            discovered_port: None,
        }
    }

    fn live_count(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| slot.handle.is_some())
            .count()
    }
}

/// Single source of truth for which process runs for which (project, role).
pub struct Registry {
    entries: BTreeMap<String, ProjectEntry>,
    observers: Vec<Box<dyn StateObserver>>,
    revision: u64,
}

impl Registry {
    /// Restores beliefs from a previous run. No handle exists yet.
    pub fn new(persisted: PersistedState) -> Self {
        let PersistedState {
            projects,
            mut bindings,
        } = persisted;
        let mut entries = BTreeMap::new();
        for descriptor in projects {
            let mut entry = ProjectEntry::new(descriptor);
            if let Some(binding) = bindings.remove(&entry.descriptor.key) {
                entry.discovered_port = binding.discovered_port;
                for (role, active) in binding.role_active {
                    entry.slots.insert(
                        role,
                        RoleSlot {
                            handle: None,
                            was_active: active,
                        },
                    );
                }
            }
            entries.insert(entry.descriptor.key.clone(), entry);
        }
        Self {
            entries,
            observers: Vec::new(),
            revision: 0,
        }
    }

    pub fn add_observer(&mut self, observer: Box<dyn StateObserver>) {
        self.observers.push(observer);
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Replaces the project set, carrying bindings of surviving keys forward.
    /// Returns how many live handles were discarded with vanished projects.
    pub fn set_projects(&mut self, projects: Vec<ProjectDescriptor>) -> usize {
        let mut previous = std::mem::take(&mut self.entries);
        for descriptor in projects {
            let key = descriptor.key.clone();
            if let Some(existing) = self.entries.get_mut(&key) {
                existing.descriptor = descriptor;
                continue;
            }
            let entry = match previous.remove(&key) {
                Some(mut existing) => {
                    existing.descriptor = descriptor;
                    existing
                }
                None => ProjectEntry::new(descriptor),
            };
            self.entries.insert(key, entry);
        }

        let mut discarded = 0;
        for (key, entry) in previous {
            let live = entry.live_count();
            if live > 0 {
                warn!("project '{key}' vanished with {live} live process(es); handles discarded");
            }
            discarded += live;
        }
        self.commit();
        discarded
    }

    /// Sets or clears the handle for (key, role) and returns the handle the
    /// caller now owns: the previous one, or the given one when `key` is unknown.
    pub fn bind(
        &mut self,
        key: &str,
        role: Role,
        handle: Option<ProcessHandle>,
    ) -> Option<ProcessHandle> {
        let Some(entry) = self.entries.get_mut(key) else {
            debug!("ignoring bind for unknown project '{key}'");
            return handle;
        };
        let active = handle.is_some();
        let already_clear = entry
            .slots
            .get(&role)
            .map_or(true, |slot| slot.handle.is_none() && !slot.was_active);
        if !active && already_clear {
            return None;
        }
        let slot = entry.slots.entry(role).or_default();
        let previous = std::mem::replace(&mut slot.handle, handle);
        slot.was_active = active;
        self.commit();
        previous
    }

    pub fn get_handle(&self, key: &str, role: Role) -> Option<&ProcessHandle> {
        self.slot(key, role).and_then(|slot| slot.handle.as_ref())
    }

    pub fn was_active(&self, key: &str, role: Role) -> bool {
        self.slot(key, role).is_some_and(|slot| slot.was_active)
    }

    pub fn get_discovered_port(&self, key: &str) -> Option<u16> {
        self.entries.get(key).and_then(|entry| entry.discovered_port)
    }

    pub fn set_discovered_port(&mut self, key: &str, port: u16) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        if entry.discovered_port == Some(port) {
            return;
        }
        entry.discovered_port = Some(port);
        self.commit();
    }

    pub fn all_live_handles(&self) -> Vec<(&str, Role, &ProcessHandle)> {
        let mut handles = Vec::new();
        for (key, entry) in &self.entries {
            for (role, slot) in &entry.slots {
                if let Some(handle) = &slot.handle {
                    handles.push((key.as_str(), *role, handle));
                }
            }
        }
        handles
    }

    /// Takes every live handle and clears every "was active" flag at once.
    pub fn drain_handles(&mut self) -> Vec<ProcessHandle> {
        let mut handles = Vec::new();
        let mut changed = false;
        for entry in self.entries.values_mut() {
            for slot in entry.slots.values_mut() {
                if let Some(handle) = slot.handle.take() {
                    handles.push(handle);
                }
                changed |= slot.was_active;
                slot.was_active = false;
            }
        }
        if changed {
            self.commit();
        }
        handles
    }

    /// (key, role) pairs believed active without a live handle.
    pub fn orphaned_beliefs(&self) -> Vec<(String, Role)> {
        let mut beliefs = Vec::new();
        for (key, entry) in &self.entries {
            for (role, slot) in &entry.slots {
                if slot.was_active && slot.handle.is_none() {
                    beliefs.push((key.clone(), *role));
                }
            }
        }
        beliefs
    }

    pub fn project(&self, key: &str) -> Option<&ProjectDescriptor> {
        self.entries.get(key).map(|entry| &entry.descriptor)
    }

    pub fn projects(&self) -> impl Iterator<Item = &ProjectDescriptor> {
        self.entries.values().map(|entry| &entry.descriptor)
    }

    pub fn snapshot(&self) -> PersistedState {
        let mut bindings = BTreeMap::new();
        for (key, entry) in &self.entries {
            let role_active = entry
                .slots
                .iter()
                .map(|(role, slot)| (*role, slot.was_active))
                .collect();
            bindings.insert(
                key.clone(),
                PersistedBinding {
                    role_active,
                    discovered_port: entry.discovered_port,
                },
            );
        }
        PersistedState {
            projects: self.projects().cloned().collect(),
            bindings,
        }
    }

    fn slot(&self, key: &str, role: Role) -> Option<&RoleSlot> {
        self.entries.get(key).and_then(|entry| entry.slots.get(&role))
    }

    fn commit(&mut self) {
        self.revision += 1;
        if self.observers.is_empty() {
            return;
        }
        let state = self.snapshot();
        for observer in &mut self.observers {
            if let Err(err) = observer.state_changed(self.revision, &state) {
                warn!("failed to publish registry state: {err:#}");
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::memory::MemoryStore;
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn descriptor(key: &str) -> ProjectDescriptor {
        ProjectDescriptor {
            key: key.to_string(),
            name: key.trim_end_matches("/pom.xml").to_string(),
            plugin_version: "1.1.0".to_string(),
            codeserver_port: None,
            devmode_port: None,
            roles: Role::ALL.to_vec(),
        }
    }

    fn registry_with(keys: &[&str]) -> (Registry, MemoryStore) {
        let store = MemoryStore::default();
        let mut registry = Registry::new(PersistedState::default());
        registry.add_observer(Box::new(store.clone()));
        registry.set_projects(keys.iter().map(|key| descriptor(key)).collect());
        (registry, store)
    }

    #[test]
    fn bind_tracks_handle_and_belief() {
        let (mut registry, store) = registry_with(&["/a/pom.xml"]);
        assert!(registry
            .bind("/a/pom.xml", Role::Devmode, Some(ProcessHandle::new(1, 100)))
            .is_none());
        assert_eq!(registry.get_handle("/a/pom.xml", Role::Devmode).unwrap().pid(), 100);
        assert!(registry.was_active("/a/pom.xml", Role::Devmode));
        let persisted = store.last().unwrap();
        assert_eq!(
            persisted.bindings["/a/pom.xml"].role_active.get(&Role::Devmode),
            Some(&true)
        );

        let previous = registry.bind("/a/pom.xml", Role::Devmode, None);
        assert_eq!(previous, Some(ProcessHandle::new(1, 100)));
        assert!(!registry.was_active("/a/pom.xml", Role::Devmode));
    }

    #[test]
    fn clearing_twice_is_observably_idempotent() {
        let (mut registry, store) = registry_with(&["/a/pom.xml"]);
        registry.bind("/a/pom.xml", Role::Jetty, Some(ProcessHandle::new(1, 7)));
        registry.bind("/a/pom.xml", Role::Jetty, None);
        let commits = store.commits();
        let revision = registry.revision();
        let snapshot = registry.snapshot();

        assert!(registry.bind("/a/pom.xml", Role::Jetty, None).is_none());
        assert_eq!(store.commits(), commits);
        assert_eq!(registry.revision(), revision);
        assert_eq!(registry.snapshot(), snapshot);
    }

    #[test]
    fn refresh_preserves_surviving_bindings() {
        let (mut registry, _store) = registry_with(&["/a/pom.xml", "/b/pom.xml"]);
        registry.bind("/a/pom.xml", Role::Codeserver, Some(ProcessHandle::new(1, 11)));
        registry.bind("/b/pom.xml", Role::Codeserver, Some(ProcessHandle::new(2, 22)));
        registry.set_discovered_port("/a/pom.xml", 9876);

        let discarded =
            registry.set_projects(vec![descriptor("/a/pom.xml"), descriptor("/c/pom.xml")]);
        assert_eq!(discarded, 1);
        assert_eq!(
            registry.get_handle("/a/pom.xml", Role::Codeserver).map(ProcessHandle::pid),
            Some(11)
        );
        assert_eq!(registry.get_discovered_port("/a/pom.xml"), Some(9876));
        assert!(registry.project("/b/pom.xml").is_none());
        assert!(registry.get_handle("/c/pom.xml", Role::Codeserver).is_none());
        assert!(!registry.was_active("/c/pom.xml", Role::Codeserver));
    }

    #[test]
    fn persisted_beliefs_survive_without_handles() {
        let (mut registry, store) = registry_with(&["/a/pom.xml"]);
        registry.bind("/a/pom.xml", Role::Devmode, Some(ProcessHandle::new(1, 5)));
        registry.set_discovered_port("/a/pom.xml", 9876);

        let restored = Registry::new(store.last().unwrap());
        assert!(restored.get_handle("/a/pom.xml", Role::Devmode).is_none());
        assert!(restored.was_active("/a/pom.xml", Role::Devmode));
        assert_eq!(restored.get_discovered_port("/a/pom.xml"), Some(9876));
        assert_eq!(
            restored.orphaned_beliefs(),
            vec![("/a/pom.xml".to_string(), Role::Devmode)]
        );
    }

    #[test]
    fn drain_takes_every_handle_and_clears_beliefs() {
        let (mut registry, _store) = registry_with(&["/a/pom.xml", "/b/pom.xml"]);
        registry.bind("/a/pom.xml", Role::Devmode, Some(ProcessHandle::new(1, 5)));
        registry.bind("/b/pom.xml", Role::Jetty, Some(ProcessHandle::new(2, 6)));
        assert_eq!(registry.all_live_handles().len(), 2);

        let drained = registry.drain_handles();
        assert_eq!(drained.len(), 2);
        assert!(registry.all_live_handles().is_empty());
        assert!(registry.orphaned_beliefs().is_empty());
        assert!(!registry.was_active("/a/pom.xml", Role::Devmode));
    }

    #[test]
    fn bind_on_unknown_project_hands_the_handle_back() {
        let (mut registry, _store) = registry_with(&[]);
        let returned = registry.bind("/x/pom.xml", Role::Compile, Some(ProcessHandle::new(9, 9)));
        assert_eq!(returned, Some(ProcessHandle::new(9, 9)));
    }

    #[test]
    fn json_store_round_trips_through_disk() {
        let dir = unique_temp_dir("registry-store");
        let path = dir.join("state.json");
        let mut registry = Registry::new(JsonFileStore::new(path.clone()).load().unwrap());
        registry.add_observer(Box::new(JsonFileStore::new(path.clone())));
        registry.set_projects(vec![descriptor("/a/pom.xml")]);
        registry.bind("/a/pom.xml", Role::Codeserver, Some(ProcessHandle::new(1, 3)));

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"codeserver\": true"));
        assert!(!path.with_extension("tmp").exists());
        let loaded = JsonFileStore::new(path).load().unwrap();
        assert_eq!(loaded, registry.snapshot());
        let _ = fs::remove_dir_all(&dir);
    }

    fn unique_temp_dir(label: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("gwtd-{label}-{nanos}"))
    }
}
