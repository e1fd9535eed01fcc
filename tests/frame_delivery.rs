use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use stereocam::capture::{CameraState, PoolCensus, ReceiveStatus};
use stereocam::driver::sim::{SimDriver, SimulatorConfig};
use stereocam::{Camera, CameraConfig, DriverSession, FrameHook, SessionConfig};

fn open_camera(driver: &Arc<SimDriver>, width: u32, height: u32) -> Camera {
    driver.add_camera("cam", width, height);
    let session =
        DriverSession::startup(driver.clone(), &SessionConfig::default()).expect("session");
    Camera::open(&session, "cam", &CameraConfig::default()).expect("open camera")
}

#[test]
fn mixed_receive_statuses_yield_clean_images_in_order() {
    let driver = SimDriver::new(SimulatorConfig::manual());
    let mut camera = open_camera(&driver, 10, 10);
    assert_eq!(camera.geometry().payload_size, 100);

    camera.start_capture(None).expect("start");
    driver.script_statuses(
        "cam",
        [
            ReceiveStatus::Complete,
            ReceiveStatus::Incomplete,
            ReceiveStatus::Complete,
            ReceiveStatus::Complete,
            ReceiveStatus::TooSmall,
        ],
    );
    for _ in 0..5 {
        assert!(driver.deliver_next("cam").expect("deliver"));
    }

    let ids: Vec<u64> = (0..3)
        .map(|_| camera.get_image().expect("image").frame_id())
        .collect();
    assert_eq!(ids, vec![1, 3, 4]);
    assert!(camera.try_get_image().is_none());

    let metrics = camera.metrics();
    assert_eq!(metrics.delivered, 5);
    assert_eq!(metrics.dropped, 2);
    assert_eq!(metrics.requeued, 5);

    // 3 initial submissions plus one resubmission per delivery
    assert_eq!(driver.counters("cam").queued, 8);
    assert_eq!(driver.pending_len("cam"), 3);
    assert_eq!(
        camera.pool_census(),
        Some(PoolCensus {
            idle: 0,
            queued: 3,
            delivered: 0
        })
    );
}

#[test]
fn consecutive_errors_never_shrink_the_pool() {
    let driver = SimDriver::new(SimulatorConfig::manual());
    let mut camera = open_camera(&driver, 16, 16);
    camera.start_capture(None).expect("start");

    driver.script_statuses("cam", std::iter::repeat(ReceiveStatus::Incomplete).take(50));
    for _ in 0..50 {
        assert!(driver.deliver_next("cam").expect("deliver"));
        assert_eq!(camera.pool_census().map(|c| c.total()), Some(3));
    }
    assert_eq!(driver.pending_len("cam"), 3);
    assert!(camera.try_get_image().is_none());

    for _ in 0..3 {
        assert!(driver.deliver_next("cam").expect("deliver"));
    }
    assert_eq!(camera.get_image().expect("image").frame_id(), 51);
    assert_eq!(camera.metrics().dropped, 50);
}

#[test]
fn images_are_unaffected_by_buffer_reuse() {
    let driver = SimDriver::new(SimulatorConfig::manual());
    let mut camera = open_camera(&driver, 8, 4);
    camera.start_capture(None).expect("start");

    // Six deliveries through three buffers: every buffer is refilled twice
    for _ in 0..6 {
        driver.deliver_next("cam").expect("deliver");
    }
    for expected in 1..=6u64 {
        let image = camera.get_image().expect("image");
        assert_eq!(image.frame_id(), expected);
        assert!(image.as_raw().iter().all(|&px| px == expected as u8));
        assert_eq!((image.width(), image.height(), image.stride()), (8, 4, 8));
    }
}

#[test]
fn free_running_frames_arrive_in_capture_order() {
    let driver = SimDriver::new(SimulatorConfig::free_running(Duration::from_millis(1)));
    let mut camera = open_camera(&driver, 32, 24);
    camera.start_capture(None).expect("start");

    let mut last = 0;
    for _ in 0..30 {
        let image = camera
            .get_image_timeout(Duration::from_secs(2))
            .expect("frame before timeout");
        assert!(image.frame_id() > last);
        last = image.frame_id();
    }

    camera.stop_capture().expect("stop");
    assert_eq!(camera.state(), CameraState::Stopped);
    assert_eq!(driver.pending_len("cam"), 0);
    assert_eq!(driver.counters("cam").revoked, 3);
}

#[test]
fn stop_waits_out_a_callback_in_progress() {
    let driver = SimDriver::new(SimulatorConfig::free_running(Duration::from_millis(1)));
    let mut camera = open_camera(&driver, 16, 16);

    let calls = Arc::new(AtomicUsize::new(0));
    let hook: FrameHook = {
        let calls = calls.clone();
        Arc::new(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
        })
    };
    camera.start_capture(Some(hook)).expect("start");

    while calls.load(Ordering::SeqCst) == 0 {
        thread::sleep(Duration::from_millis(1));
    }
    camera.stop_capture().expect("stop while callback runs");

    let counters = driver.counters("cam");
    assert_eq!(counters.revoked, 3);
    assert_eq!(driver.pending_len("cam"), 0);

    // The pool is rebuilt on the next start
    camera.start_capture(None).expect("restart");
    assert_eq!(camera.pool_census().map(|c| c.queued), Some(3));
}

#[test]
fn close_releases_a_blocked_consumer() {
    let driver = SimDriver::new(SimulatorConfig::manual());
    let mut camera = open_camera(&driver, 16, 16);
    camera.start_capture(None).expect("start");

    let queue = camera.image_queue();
    let consumer = thread::spawn(move || queue.pop());

    thread::sleep(Duration::from_millis(10));
    camera.close().expect("close");

    assert!(consumer.join().expect("consumer thread").is_none());
    assert!(!driver.is_open("cam"));
}

#[tokio::test]
async fn async_consumer_receives_images() {
    let driver = SimDriver::new(SimulatorConfig::free_running(Duration::from_millis(2)));
    let mut camera = open_camera(&driver, 16, 16);
    camera.start_capture(None).expect("start");

    let image = tokio::time::timeout(Duration::from_secs(2), camera.get_image_async())
        .await
        .expect("image before timeout")
        .expect("queue open");
    assert_eq!(image.frame_id(), 1);

    camera.close().expect("close");
}
