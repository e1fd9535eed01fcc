//! Stereo viewer running on the simulated capture engine

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use tracing::{info, warn};

use stereocam::driver::sim::SimDriver;
use stereocam::{Config, DriverSession, StereoCamera};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stereocam=info".into()),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Stereo viewer launching...");

    // Load configuration
    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(path.as_deref())?;
    stereocam::CONFIG.store(Arc::new(config.clone()));

    let driver = SimDriver::new(config.simulator.clone());
    driver.add_default_camera(&config.stereo.left_id);
    driver.add_default_camera(&config.stereo.right_id);

    let session = DriverSession::startup(driver, &config.session)?;
    let mut stereo = StereoCamera::from_config(&session, &config.stereo, &config.camera)?;
    info!(
        left = ?stereo.left().geometry(),
        right = ?stereo.right().geometry(),
        "Cameras ready"
    );

    stereo.start_capture()?;

    // Pair waits block, so they run off the async workers
    let pairs = stereo.pairs();
    let limit = config.stereo.pair_limit;
    let timeout = Duration::from_millis(config.stereo.pair_timeout_ms);
    let consumer = tokio::task::spawn_blocking(move || {
        let mut received = 0u64;
        while limit.map_or(true, |limit| received < limit) {
            let Some(pair) = pairs.wait_pair_timeout(timeout) else {
                break;
            };
            received += 1;
            info!(
                sequence = pair.sequence,
                left = pair.left.frame_id(),
                right = pair.right.frame_id(),
                skew_us = pair.left.timestamp().abs_diff(pair.right.timestamp()) / 1000,
                "Pair received"
            );
        }
        received
    });
    tokio::pin!(consumer);

    let received = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            stereo.stop_capture()?;
            consumer.await?
        }
        received = &mut consumer => received?,
    };

    let (left, right) = (stereo.left().metrics(), stereo.right().metrics());
    stereo.close()?;

    info!(
        pairs = received,
        left_dropped = left.dropped,
        right_dropped = right.dropped,
        "Stereo viewer shutting down"
    );
    if received == 0 {
        warn!("No pairs were received");
        return Err(eyre!("no frames arrived from the cameras"));
    }
    Ok(())
}
