//! In-memory [`BootHost`] for resolver tests.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::host::BootHost;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Mounted(String, PathBuf),
    Unmounted(PathBuf),
    ChangedDir(PathBuf),
    Loader(Vec<String>),
}

#[derive(Default)]
pub struct FakeHost {
    labels: HashMap<String, String>,
    disks: HashMap<String, Vec<(String, String)>>,
    exits: Mutex<VecDeque<i32>>,
    events: Mutex<Vec<Event>>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `label` to `device` without backing files
    pub fn label(mut self, label: &str, device: &str) -> Self {
        self.labels.insert(label.to_string(), device.to_string());
        self
    }

    /// Resolve `label` to `device` holding `files`
    pub fn disk(mut self, label: &str, device: &str, files: &[(&str, &str)]) -> Self {
        self.labels.insert(label.to_string(), device.to_string());
        self.disks.insert(
            device.to_string(),
            files
                .iter()
                .map(|(name, body)| (name.to_string(), body.to_string()))
                .collect(),
        );
        self
    }

    /// Exit codes returned by successive loader runs, zero once exhausted
    pub fn loader_exits(self, codes: &[i32]) -> Self {
        self.exits.lock().extend(codes.iter().copied());
        self
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn loader_calls(&self) -> Vec<Vec<String>> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Event::Loader(args) => Some(args.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn mounts(&self) -> usize {
        self.count(|event| matches!(event, Event::Mounted(..)))
    }

    pub fn unmounts(&self) -> usize {
        self.count(|event| matches!(event, Event::Unmounted(_)))
    }

    pub fn chdirs_to_root(&self) -> usize {
        self.count(|event| matches!(event, Event::ChangedDir(dir) if dir == Path::new("/")))
    }

    fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().iter().filter(|event| pred(event)).count()
    }
}

#[async_trait]
impl BootHost for FakeHost {
    async fn find_partition(&self, label: &str) -> String {
        self.labels.get(label).cloned().unwrap_or_default()
    }

    fn mount_readonly(&self, device: &str, target: &Path) -> io::Result<()> {
        let files = self
            .disks
            .get(device)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no filesystem"))?;

        fs::create_dir_all(target)?;
        for (name, body) in files {
            fs::write(target.join(name), body)?;
        }
        self.events
            .lock()
            .push(Event::Mounted(device.to_string(), target.to_path_buf()));
        Ok(())
    }

    fn unmount(&self, target: &Path) -> io::Result<()> {
        self.events.lock().push(Event::Unmounted(target.to_path_buf()));
        if target.exists() {
            fs::remove_dir_all(target)?;
            fs::create_dir_all(target)?;
        }
        Ok(())
    }

    fn change_dir(&self, dir: &Path) -> io::Result<()> {
        self.events.lock().push(Event::ChangedDir(dir.to_path_buf()));
        Ok(())
    }

    async fn kexec(&self, args: &[String]) -> i32 {
        self.events.lock().push(Event::Loader(args.to_vec()));
        self.exits.lock().pop_front().unwrap_or(0)
    }
}
