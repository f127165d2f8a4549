//! ESP32 station-mode WiFi provider.

use super::{NetworkError, NetworkProvider};
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::hal::modem::Modem;
use esp_idf_svc::wifi::{AuthMethod, BlockingWifi, ClientConfiguration, Configuration, EspWifi};
use log::{info, warn};
use std::net::IpAddr;
use std::sync::Mutex;

/// WiFi-based network provider.
pub struct WifiNetwork {
    wifi: Mutex<BlockingWifi<EspWifi<'static>>>,
    ssid: String,
    password: String,
}

impl WifiNetwork {
    pub fn new(
        modem: Modem,
        sysloop: EspSystemEventLoop,
        ssid: &str,
        password: &str,
    ) -> Result<Self, NetworkError> {
        let esp_wifi = EspWifi::new(modem, sysloop.clone(), None)?;
        let wifi = BlockingWifi::wrap(esp_wifi, sysloop)?;
        Ok(Self {
            wifi: Mutex::new(wifi),
            ssid: ssid.to_string(),
            password: password.to_string(),
        })
    }
}

impl NetworkProvider for WifiNetwork {
    fn connect(&self) -> Result<(), NetworkError> {
        if self.ssid.is_empty() {
            return Err(NetworkError::NotConfigured);
        }
        let auth_method = if self.password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPA2Personal
        };
        let config = Configuration::Client(ClientConfiguration {
            ssid: self
                .ssid
                .as_str()
                .try_into()
                .map_err(|_| NetworkError::InvalidCredentials)?,
            password: self
                .password
                .as_str()
                .try_into()
                .map_err(|_| NetworkError::InvalidCredentials)?,
            auth_method,
            ..Default::default()
        });

        info!("Connecting to WiFi: {}", self.ssid);
        let mut wifi = self.wifi.lock().unwrap_or_else(|e| e.into_inner());
        wifi.set_configuration(&config)?;
        wifi.start()?;
        wifi.connect()?;
        wifi.wait_netif_up()?;

        let ip_info = wifi.wifi().sta_netif().get_ip_info()?;
        info!("WiFi connected, IP: {}", ip_info.ip);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        match self.wifi.lock() {
            Ok(wifi) => wifi.is_connected().unwrap_or(false),
            Err(e) => e.into_inner().is_connected().unwrap_or(false),
        }
    }

    fn ip_addr(&self) -> Option<IpAddr> {
        let wifi = self.wifi.lock().unwrap_or_else(|e| e.into_inner());
        if !wifi.is_connected().unwrap_or(false) {
            return None;
        }
        match wifi.wifi().sta_netif().get_ip_info() {
            Ok(info) => Some(IpAddr::V4(info.ip)),
            Err(e) => {
                warn!("No IP info: {:?}", e);
                None
            }
        }
    }
}
