//! Capture workflow against a live stream wall.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use aquarium_stream::capture::{CaptureBackend, CaptureError, CaptureWorkflow};
use aquarium_stream::client::{CaptureRecord, DeviceInfo};
use aquarium_stream::connection::{ConnectionConfig, Phase};
use aquarium_stream::error::ClientError;
use aquarium_stream::transport::mock::MockTransport;
use aquarium_stream::wall::StreamWall;
use async_trait::async_trait;
use tokio::runtime::Handle;

/// Records how many camera streams were still open when each capture ran.
struct CountingBackend {
    transport: MockTransport,
    failing: Vec<u32>,
    seen: Arc<Mutex<Vec<(u32, usize)>>>,
}

#[async_trait]
impl CaptureBackend for CountingBackend {
    async fn capture(&self, index: u32) -> Result<CaptureRecord, ClientError> {
        self.seen
            .lock()
            .unwrap()
            .push((index, self.transport.live_sources()));
        if self.failing.contains(&index) {
            return Err(ClientError::Status {
                status: 500,
                detail: format!("Failed to capture image from device {index}"),
            });
        }
        Ok(CaptureRecord {
            id: format!("img-{index}"),
            filepath: format!("/data/images/cam{index}.jpg"),
            width: 1280,
            height: 720,
            file_size: 4096,
            device_id: Some(index),
            timestamp: None,
        })
    }
}

fn devices() -> Vec<DeviceInfo> {
    vec![
        DeviceInfo {
            index: 0,
            name: "Reef".into(),
            active: true,
        },
        DeviceInfo {
            index: 1,
            name: "Sump".into(),
            active: true,
        },
        DeviceInfo {
            index: 2,
            name: "Spare".into(),
            active: false,
        },
    ]
}

async fn run_tasks() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

fn setup(failing: Vec<u32>) -> (MockTransport, StreamWall, CountingBackend) {
    let transport = MockTransport::new();
    let wall = StreamWall::new(
        Arc::new(transport.clone()),
        ConnectionConfig::default(),
        Handle::current(),
    );
    let backend = CountingBackend {
        transport: transport.clone(),
        failing,
        seen: Arc::default(),
    };
    (transport, wall, backend)
}

#[tokio::test(start_paused = true)]
async fn streams_are_released_during_capture_and_resumed_after() {
    let (transport, mut wall, backend) = setup(vec![]);
    let seen = Arc::clone(&backend.seen);

    wall.sync_devices(&devices());
    run_tasks().await;
    assert_eq!(transport.live_sources(), 2);

    let workflow = CaptureWorkflow::new(backend, Duration::from_millis(500));
    let report = workflow.capture_active(&devices(), &mut wall).await.unwrap();

    assert!(!report.is_partial());
    assert_eq!(report.succeeded().map(|(i, _)| i).collect::<Vec<_>>(), vec![0, 1]);
    assert_eq!(*seen.lock().unwrap(), vec![(0, 0), (1, 0)]);

    // Tiles reconnect after the capture
    assert!(wall
        .states()
        .iter()
        .all(|(_, s)| !s.paused && s.phase == Phase::Connecting));
    run_tasks().await;
    assert_eq!(transport.live_sources(), 2);
    assert_eq!(transport.connect_count(), 4);
}

#[tokio::test(start_paused = true)]
async fn partial_failure_keeps_successes() {
    let (_transport, mut wall, backend) = setup(vec![1]);
    wall.sync_devices(&devices());

    let workflow = CaptureWorkflow::new(backend, Duration::from_millis(500));
    let report = workflow.capture_active(&devices(), &mut wall).await.unwrap();

    assert!(report.is_partial());
    let failed: Vec<String> = report.failed().map(|(_, e)| e.to_string()).collect();
    assert_eq!(
        failed,
        vec!["Server error (500): Failed to capture image from device 1"]
    );
    assert!(wall.states().iter().all(|(_, s)| !s.paused));
}

#[tokio::test(start_paused = true)]
async fn all_failed_is_an_error_and_streams_resume() {
    let (_transport, mut wall, backend) = setup(vec![0, 1]);
    wall.sync_devices(&devices());

    let workflow = CaptureWorkflow::new(backend, Duration::from_millis(500));
    let err = workflow
        .capture_active(&devices(), &mut wall)
        .await
        .unwrap_err();

    assert!(matches!(err, CaptureError::AllFailed { ref failures } if failures.len() == 2));
    assert!(err.to_string().starts_with("Failed to capture images from all devices"));
    assert!(wall.states().iter().all(|(_, s)| !s.paused));
}

#[tokio::test(start_paused = true)]
async fn settle_delay_elapses_before_capture() {
    let (_transport, mut wall, backend) = setup(vec![]);
    wall.sync_devices(&devices());

    let workflow = CaptureWorkflow::new(backend, Duration::from_millis(500));
    let started = tokio::time::Instant::now();
    workflow.capture(&[0], &mut wall).await.unwrap();

    assert!(started.elapsed() >= Duration::from_millis(500));
}
