//! ESP32 firmware.
//!
//! `cargo espflash flash --bin firmware --features esp32 --release`
//!
//! WiFi credentials are taken from `WIFI_SSID` / `WIFI_PASSWORD` at build
//! time. The node's defaults apply; remote writes through the resource layer
//! adjust them at run time.

#[cfg(feature = "esp32")]
fn main() {
    // Link ESP-IDF patches (must be first!)
    esp_idf_sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();

    if let Err(e) = firmware::run() {
        log::error!("Firmware stopped: {}", e);
    }
    // Nothing left to do; halt until external power cycles the board.
    // SAFETY: deep sleep never returns.
    unsafe { esp_idf_sys::esp_deep_sleep_start() };
}

#[cfg(feature = "esp32")]
mod firmware {
    use esp_idf_svc::eventloop::EspSystemEventLoop;
    use esp_idf_svc::hal::peripherals::Peripherals;
    use iot_audio_node::audio::{PcmCodec, ToneCapture};
    use iot_audio_node::clock::{SystemClock, SystemRtc};
    use iot_audio_node::controller::TcpProbeRegistrar;
    use iot_audio_node::network::{NetworkProvider, WifiNetwork};
    use iot_audio_node::persistence::RtcRetainedStore;
    use iot_audio_node::power::EspPower;
    use iot_audio_node::transport::HostConnector;
    use iot_audio_node::{Node, NodeConfig, NodeDrivers};
    use log::info;
    use std::error::Error;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    /// GPIO that reads high while USB power is present.
    const VBUS_SENSE_PIN: i32 = 4;

    pub fn run() -> Result<(), Box<dyn Error>> {
        info!("=== IoT audio node firmware starting ===");

        let config = NodeConfig {
            stats_port: None,
            ..NodeConfig::default()
        };

        let peripherals = Peripherals::take()?;
        let sysloop = EspSystemEventLoop::take()?;
        let network: Arc<dyn NetworkProvider> = Arc::new(WifiNetwork::new(
            peripherals.modem,
            sysloop,
            option_env!("WIFI_SSID").unwrap_or(""),
            option_env!("WIFI_PASSWORD").unwrap_or(""),
        )?);
        let store = RtcRetainedStore::take().ok_or("retained region already taken")?;

        let drivers = NodeDrivers {
            power: Arc::new(EspPower::new(VBUS_SENSE_PIN)),
            rtc: Arc::new(SystemRtc),
            store: Box::new(store),
            connector: Arc::new(HostConnector::new(
                network.clone(),
                config.transport.send_budget(),
            )),
            network,
            codec: Arc::new(PcmCodec::new(&config.capture)),
            // Synthetic tone; this board revision has no microphone wired.
            capture: Box::new(ToneCapture::new(config.capture, 440.0)),
            registrar: Arc::new(TcpProbeRegistrar::new(&config.registration)),
            clock: Arc::new(SystemClock::new()),
        };

        let mut node = Node::new(config, drivers)?;
        // Never cancelled: the device runs until it halts.
        node.run(&CancellationToken::new())?;
        Ok(())
    }
}

#[cfg(not(feature = "esp32"))]
fn main() {
    println!("This binary requires the 'esp32' feature.");
    println!("Use 'cargo run --bin node' for the host node.");
}
