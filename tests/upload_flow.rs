//! End-to-end session flow over a real on-disk card tree.

mod fixtures;

use std::time::{Duration, Instant};

use tempfile::TempDir;

use cardrelay::{
    BusActivitySensor, BusSwitch, Config, Orchestrator, SessionOutcome, SessionState, StagingBuffer,
    StateStore,
};
use fixtures::{write_day_folder, AlwaysOpen, DirCard, MockBackend, MockMux, NoopWatchdog, SilentBus};

type TestOrchestrator =
    Orchestrator<SilentBus, MockMux, DirCard, MockBackend, AlwaysOpen, NoopWatchdog>;

struct Harness {
    tmp: TempDir,
    now: Instant,
}

impl Harness {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("card/DATALOG")).unwrap();
        Self {
            tmp,
            now: Instant::now(),
        }
    }

    fn card_root(&self) -> std::path::PathBuf {
        self.tmp.path().join("card")
    }

    /// Fresh orchestrator over the same persistent state directory, the way
    /// a reboot would rebuild it.
    fn orchestrator(&self, backend: MockBackend, staging: bool) -> TestOrchestrator {
        let config = Config {
            bus_silence_ms: 0,
            settle_ms: 0,
            staging_enabled: staging,
            ..Config::default()
        };
        let staging = staging.then(|| {
            StagingBuffer::open(self.tmp.path().join("staging"), 1024 * 1024, 0).unwrap()
        });
        let store = StateStore::open(self.tmp.path().join("state")).unwrap();
        let switch = BusSwitch::new(
            MockMux::default(),
            DirCard {
                root: self.card_root(),
            },
            Duration::ZERO,
        );
        let mut orch = Orchestrator::new(
            config,
            BusActivitySensor::new(SilentBus),
            switch,
            store,
            staging,
            backend,
            AlwaysOpen,
            NoopWatchdog,
        );
        orch.begin();
        orch
    }

    /// Ticks one full session through to the post-release cooldown.
    fn run_session(&mut self, orch: &mut TestOrchestrator, wall: u64) -> SessionOutcome {
        for _ in 0..20 {
            self.now += Duration::from_millis(100);
            orch.tick_at(self.now, wall);
            if orch.state() == SessionState::Cooldown {
                return orch.last_outcome().expect("session must record an outcome");
            }
        }
        panic!("session never finished, state={:?}", orch.state());
    }
}

#[test]
fn staged_uploads_deliver_exact_card_contents() {
    let mut harness = Harness::new();
    write_day_folder(
        &harness.card_root(),
        20240110,
        &[("rec1.edf", b"night one data"), ("rec2.edf", b"more samples")],
    );

    let backend = MockBackend::default();
    let mut orch = harness.orchestrator(backend.clone(), true);
    let outcome = harness.run_session(&mut orch, 1_700_000_000);
    assert_eq!(outcome, SessionOutcome::Completed);

    let uploads = backend.uploads.borrow();
    assert_eq!(uploads.len(), 2);
    assert_eq!(uploads[0].0, "/DATALOG/20240110/rec1.edf");
    assert_eq!(uploads[0].1, b"night one data");
    assert_eq!(uploads[1].1, b"more samples");
    drop(uploads);

    // Staged copies are removed once transferred.
    let staging_dir = harness.tmp.path().join("staging");
    assert_eq!(std::fs::read_dir(staging_dir).unwrap().count(), 0);
}

#[test]
fn completed_folders_are_skipped_after_restart() {
    let mut harness = Harness::new();
    write_day_folder(&harness.card_root(), 20240110, &[("a.edf", b"data")]);

    let backend = MockBackend::default();
    let mut orch = harness.orchestrator(backend.clone(), false);
    assert_eq!(
        harness.run_session(&mut orch, 1_700_000_000),
        SessionOutcome::Completed
    );
    assert_eq!(backend.upload_count(), 1);
    drop(orch);

    // New folder appears, device reboots: only the new folder transfers.
    write_day_folder(&harness.card_root(), 20240111, &[("b.edf", b"fresh")]);
    let backend2 = MockBackend::default();
    let mut orch = harness.orchestrator(backend2.clone(), false);
    assert_eq!(
        harness.run_session(&mut orch, 1_700_090_000),
        SessionOutcome::Completed
    );
    assert_eq!(backend2.remote_paths(), vec!["/DATALOG/20240111/b.edf"]);
}

#[test]
fn failed_session_retries_after_reboot_with_context_intact() {
    let mut harness = Harness::new();
    write_day_folder(&harness.card_root(), 20240110, &[("a.edf", b"data")]);

    let backend = MockBackend::default();
    backend.fail_uploads.set(true);
    let mut orch = harness.orchestrator(backend.clone(), false);
    assert_eq!(
        harness.run_session(&mut orch, 1_700_000_000),
        SessionOutcome::Failed
    );
    drop(orch);

    // The retry context was persisted before the reboot.
    let backend2 = MockBackend::default();
    let mut orch = harness.orchestrator(backend2.clone(), false);
    assert_eq!(orch.store().current_retry_folder(), Some(20240110));
    assert_eq!(orch.store().current_retry_count(), 1);

    assert_eq!(
        harness.run_session(&mut orch, 1_700_001_000),
        SessionOutcome::Completed
    );
    assert!(orch.store().is_folder_completed(20240110));
    assert_eq!(orch.store().current_retry_folder(), None);
}

#[test]
fn host_activity_defers_the_whole_session() {
    let mut harness = Harness::new();
    write_day_folder(&harness.card_root(), 20240110, &[("a.edf", b"data")]);

    let backend = MockBackend::default();
    let mux = MockMux::default();
    mux.host_active.set(true);
    let config = Config {
        bus_silence_ms: 0,
        settle_ms: 0,
        staging_enabled: false,
        ..Config::default()
    };
    let store = StateStore::open(harness.tmp.path().join("state")).unwrap();
    let switch = BusSwitch::new(
        mux.clone(),
        DirCard {
            root: harness.card_root(),
        },
        Duration::ZERO,
    );
    let mut orch = Orchestrator::new(
        config,
        BusActivitySensor::new(SilentBus),
        switch,
        store,
        None,
        backend.clone(),
        AlwaysOpen,
        NoopWatchdog,
    );
    orch.begin();

    for _ in 0..10 {
        harness.now += Duration::from_millis(100);
        orch.tick_at(harness.now, 1_700_000_000);
    }
    assert_eq!(backend.upload_count(), 0);
    assert_ne!(orch.state(), SessionState::Uploading);

    // Host goes quiet: the next attempts succeed.
    mux.host_active.set(false);
    assert_eq!(
        harness.run_session(&mut orch, 1_700_000_000),
        SessionOutcome::Completed
    );
    assert_eq!(backend.upload_count(), 1);
}
