//! Shared fixtures for engine integration tests

#![allow(dead_code)]

use deckvolt_engine::config::EngineConfig;
use deckvolt_engine::hardware::sim::SimulatedHardware;
use deckvolt_engine::hardware::Hardware;
use deckvolt_engine::limits::{PlatformLimits, PlatformModel};
use deckvolt_engine::Engine;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Engine on a simulated 4-core LCD unit with its own state directory
pub struct TestEngine {
    pub dir: TempDir,
    pub sim: Arc<SimulatedHardware>,
    pub engine: Engine,
}

pub fn lcd_limits() -> PlatformLimits {
    PlatformLimits::for_model(PlatformModel::Lcd, false)
}

pub async fn open_at(dir: &Path, sim: Arc<SimulatedHardware>) -> Engine {
    Engine::open(
        EngineConfig::default(),
        Hardware::simulated(sim),
        lcd_limits(),
        dir,
    )
    .await
    .unwrap()
}

pub async fn engine() -> TestEngine {
    let dir = tempfile::tempdir().unwrap();
    let sim = Arc::new(SimulatedHardware::new(4));
    let engine = open_at(dir.path(), sim.clone()).await;
    TestEngine { dir, sim, engine }
}

/// Sleep in 100 ms steps until no calibration holds the slot
pub async fn wait_for_calibration(engine: &Engine, limit: Duration) {
    let mut waited = Duration::ZERO;
    while engine.calibration_running().is_some() {
        assert!(waited < limit, "calibration still running after {:?}", limit);
        tokio::time::sleep(Duration::from_millis(100)).await;
        waited += Duration::from_millis(100);
    }
}

/// Copy of `dir` as it stands now, the state a power cut would leave behind
pub fn disk_image(dir: &Path) -> TempDir {
    let image = tempfile::tempdir().unwrap();
    copy_tree(dir, image.path());
    image
}

fn copy_tree(from: &Path, to: &Path) {
    for entry in std::fs::read_dir(from).unwrap() {
        let entry = entry.unwrap();
        let target = to.join(entry.file_name());
        if entry.file_type().unwrap().is_dir() {
            std::fs::create_dir_all(&target).unwrap();
            copy_tree(&entry.path(), &target);
        } else {
            std::fs::copy(entry.path(), &target).unwrap();
        }
    }
}
