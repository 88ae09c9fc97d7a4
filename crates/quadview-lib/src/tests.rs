//! Cross-module behavior tests: the pipeline pieces wired together the way
//! the decode loop wires them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use quadview_types::{Config, SourceConfig, TileSize};

use crate::device::DeviceManager;
use crate::pipeline::Pipeline;
use crate::telemetry::{RateWindow, DECODE_WINDOW};
use crate::throttle::PushThrottle;

/// Scenario: decode sustains 30 fps while the consumer throttle is 90 ms.
/// Telemetry sees the full decode rate; the consumer sees at most ~11 Hz.
#[test]
fn throttle_paces_consumer_without_touching_telemetry() {
    let t0 = Instant::now();
    let mut window = RateWindow::opened_at(DECODE_WINDOW, t0);
    let mut throttle = PushThrottle::new(Duration::from_millis(90));

    let mut pushed = 0u64;
    let mut report = None;
    for i in 1..=310u64 {
        let now = t0 + Duration::from_millis(i * 33);
        if throttle.admit(now) {
            pushed += 1;
        }
        if let Some(r) = window.record(now) {
            report = Some(r);
        }
    }

    let report = report.expect("10 s window elapsed within 310 frames");
    assert!(
        (report.fps() - 30.3).abs() < 0.5,
        "telemetry reports the decode rate, got {:.1}",
        report.fps()
    );
    // 10.2 s of input at one admitted push per 99 ms.
    assert_eq!(pushed, 104);
    assert!(pushed as f64 / 10.23 <= 1000.0 / 90.0);
}

/// Scenario: two sessions both meet the resolution threshold; only the
/// first probe to finish wins the device, the loser proceeds without error.
#[test]
fn second_eligible_session_is_refused_without_error() {
    let manager = DeviceManager::with_node("/dev/dri/test-node-that-does-not-exist");

    // With no device present neither claim succeeds, and the refusal is a
    // plain None either way.
    assert!(manager.try_assign(1920 * 1080).is_none());
    assert!(manager.try_assign(1920 * 1080).is_none());
    assert!(!manager.is_assigned());
}

#[tokio::test]
async fn shutdown_joins_a_failed_stream_session() {
    let config = Config {
        cameras: vec![
            SourceConfig {
                name: "refused-stream".to_string(),
                url: "rtsp://127.0.0.1:1/stream".to_string(),
            },
            SourceConfig {
                name: "refused-poll".to_string(),
                url: "http://127.0.0.1:1/snapshot.jpg".to_string(),
            },
        ],
        tile_size: TileSize::P360,
        push_interval_ms: 90,
        snapshot_interval_ms: 200,
    };

    let pipeline = Pipeline::start(&config).expect("start");
    let tiles = pipeline.tiles();
    assert_eq!(tiles.len(), 2);
    assert_eq!(pipeline.session_states().len(), 1);

    // Both endpoints refuse connections; neither tile ever gets a frame
    // and shutdown still completes within the bounded join.
    tokio::time::sleep(Duration::from_millis(100)).await;
    pipeline.shutdown().await;
    for tile in &tiles {
        assert!(tile.frames.borrow().is_none());
    }
}

#[test]
fn device_manager_is_shared_not_global() {
    // Two managers are independent claims; sessions only contend when they
    // are handed the same Arc.
    let a = Arc::new(DeviceManager::with_node("/dev/dri/test-node-a"));
    let b = Arc::new(DeviceManager::with_node("/dev/dri/test-node-b"));
    assert!(!a.acquire());
    assert!(!b.acquire());
    assert!(!a.is_assigned());
    assert!(!b.is_assigned());
}
