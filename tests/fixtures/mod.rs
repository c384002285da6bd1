//! Shared test doubles: mock peripherals and an in-memory upload backend.

use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use cardrelay::session::BackendError;
use cardrelay::store::UnixTs;
use cardrelay::{BusMux, CardFilesystem, PulseCounter, Scheduler, UploadBackend, Watchdog};

/// Pulse counter that always reads zero: a permanently silent bus.
pub struct SilentBus;

impl PulseCounter for SilentBus {
    fn begin(&mut self) {}
    fn read_and_clear(&mut self) -> u32 {
        0
    }
}

#[derive(Clone, Default)]
pub struct MockMux {
    pub host_active: Rc<Cell<bool>>,
}

impl BusMux for MockMux {
    fn grant_uploader(&mut self) {}
    fn grant_host(&mut self) {}
    fn host_active(&self) -> bool {
        self.host_active.get()
    }
}

/// Card backed by a real directory tree.
pub struct DirCard {
    pub root: PathBuf,
}

impl CardFilesystem for DirCard {
    fn mount(&mut self) -> std::io::Result<()> {
        Ok(())
    }
    fn unmount(&mut self) {}
    fn card_present(&self) -> bool {
        true
    }
    fn root(&self) -> &Path {
        &self.root
    }
}

/// Records every transfer; can be told to fail.
#[derive(Clone, Default)]
pub struct MockBackend {
    pub uploads: Rc<RefCell<Vec<(String, Vec<u8>)>>>,
    pub fail_uploads: Rc<Cell<bool>>,
    connected: Rc<Cell<bool>>,
}

impl MockBackend {
    pub fn upload_count(&self) -> usize {
        self.uploads.borrow().len()
    }

    pub fn remote_paths(&self) -> Vec<String> {
        self.uploads
            .borrow()
            .iter()
            .map(|(remote, _)| remote.clone())
            .collect()
    }
}

impl UploadBackend for MockBackend {
    fn connect(&mut self) -> Result<(), BackendError> {
        self.connected.set(true);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.get()
    }

    fn create_directory(&mut self, _remote_dir: &str) -> Result<(), BackendError> {
        Ok(())
    }

    fn upload(&mut self, local: &Path, remote: &str, _size: u64) -> Result<u64, BackendError> {
        if self.fail_uploads.get() {
            return Err(BackendError("injected upload failure".into()));
        }
        let bytes = std::fs::read(local).map_err(|e| BackendError(e.to_string()))?;
        let len = bytes.len() as u64;
        self.uploads.borrow_mut().push((remote.to_string(), bytes));
        Ok(len)
    }
}

pub struct AlwaysOpen;

impl Scheduler for AlwaysOpen {
    fn window_open(&self, _now: UnixTs) -> bool {
        true
    }

    fn secs_until_window(&self, _now: UnixTs) -> u64 {
        0
    }
}

pub struct NoopWatchdog;

impl Watchdog for NoopWatchdog {
    fn feed(&mut self) {}
}

/// Writes a dated recording folder onto the card tree.
pub fn write_day_folder(card_root: &Path, day: u32, files: &[(&str, &[u8])]) {
    let dir = card_root.join("DATALOG").join(format!("{day:08}"));
    std::fs::create_dir_all(&dir).unwrap();
    for (name, contents) in files {
        std::fs::write(dir.join(name), contents).unwrap();
    }
}
