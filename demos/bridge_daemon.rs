use std::{sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{error, info};
use treadbridge::{bridge::StateChangeHook, Bridge, BridgeConfig, Result};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🏃‍♀️ Treadbridge FTMS Bridge Daemon");

    let config = BridgeConfig::default();
    info!(
        "Looking for treadmills named '{}*' on {}",
        config.name_prefix, config.adapter
    );

    let bridge = Arc::new(Bridge::new(config).await?);

    // Print a status line whenever the connection changes
    let observer = bridge.clone();
    let on_state_change: StateChangeHook = Arc::new(move || {
        info!(
            "🔄 State changed: bridge {}",
            if observer.bridge_active() { "ACTIVE" } else { "INACTIVE" }
        );
    });

    let auto_loop = {
        let bridge = bridge.clone();
        tokio::spawn(async move { bridge.run_auto_loop(Some(on_state_change)).await })
    };

    // Periodic status report
    let reporter = {
        let bridge = bridge.clone();
        tokio::spawn(async move {
            loop {
                sleep(Duration::from_secs(5)).await;
                match bridge.get_status() {
                    Some(status) => info!(
                        "📊 {:.1} km/h | {:.2} km | {} s | {} steps | belt {}",
                        status.speed_kmh,
                        status.distance_km,
                        status.elapsed_time_s,
                        status.step_count,
                        if status.is_running() { "running" } else { "stopped" }
                    ),
                    None => info!("📊 No treadmill status yet"),
                }
            }
        })
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("❌ Failed to listen for Ctrl-C: {}", e);
    }

    info!("🛑 Shutting down...");
    reporter.abort();
    bridge.stop_auto_loop();
    if let Err(e) = auto_loop.await {
        error!("❌ Auto-discovery task failed: {}", e);
    }
    bridge.disconnect_treadmill().await;
    info!("✅ Bridge stopped");

    Ok(())
}
