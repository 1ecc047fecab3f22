//! Shared setup for the kernel integration tests.
//!
//! Every fixture gets its own data directory and a fake copy program: a POSIX
//! shell script that speaks `rsync --info=progress2` well enough for the
//! engine. The script is run through `/bin/sh` so it needs no exec bit.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use hearth_kernel::{Hearth, HearthConfig};
use hearth_types::{JobId, LogicalPath, TransferJob};
use tempfile::TempDir;

const FAKE_COPY: &str = include_str!("fake-rsync.sh");

pub const WAIT: Duration = Duration::from_secs(10);

pub struct Fixture {
    pub tmp: TempDir,
    pub hearth: Hearth,
    /// While this file exists the fake copy program pauses after writing a
    /// partial target.
    pub gate: PathBuf,
}

/// Route kernel logs through the test harness. `RUST_LOG=hearth_kernel=debug`
/// shows them for a failing test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn lp(s: &str) -> LogicalPath {
    LogicalPath::parse(s).unwrap()
}

pub async fn fixture() -> Fixture {
    fixture_with(|_| {}).await
}

pub async fn fixture_with(tweak: impl FnOnce(&mut HearthConfig)) -> Fixture {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let root = dunce::canonicalize(tmp.path()).unwrap();
    let script = root.join("fake-rsync.sh");
    std::fs::write(&script, FAKE_COPY).unwrap();
    let gate = root.join("gate");

    let mut config = HearthConfig::with_data_directory(root.join("data"));
    config.transfer.program = "/bin/sh".into();
    config.transfer.extra_args = vec![
        script.to_string_lossy().into_owned(),
        format!("--fake-gate={}", gate.display()),
    ];
    config.transfer.space_reserve_bytes = 0;
    tweak(&mut config);

    let hearth = Hearth::new(config).unwrap();
    hearth.prepare().await.unwrap();
    Fixture { tmp, hearth, gate }
}

impl Fixture {
    pub fn physical(&self, logical: &str) -> PathBuf {
        self.hearth.mapper().defaults().to_physical(&lp(logical)).unwrap()
    }

    pub fn write(&self, logical: &str, contents: &[u8]) {
        let path = self.physical(logical);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    pub fn mkdir(&self, logical: &str) {
        std::fs::create_dir_all(self.physical(logical)).unwrap();
    }

    pub fn read(&self, logical: &str) -> Vec<u8> {
        std::fs::read(self.physical(logical)).unwrap()
    }

    pub fn exists(&self, logical: &str) -> bool {
        std::fs::symlink_metadata(self.physical(logical)).is_ok()
    }

    pub fn close_gate(&self) {
        std::fs::write(&self.gate, b"").unwrap();
    }

    pub fn open_gate(&self) {
        let _ = std::fs::remove_file(&self.gate);
    }

    pub async fn wait(&self, id: JobId) -> TransferJob {
        tokio::time::timeout(WAIT, self.hearth.engine().wait(id))
            .await
            .expect("job did not finish in time")
            .unwrap()
    }
}

/// Poll until `path` exists.
pub async fn wait_for_path(path: &Path) {
    tokio::time::timeout(WAIT, async {
        while std::fs::symlink_metadata(path).is_err() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("path never appeared");
}
