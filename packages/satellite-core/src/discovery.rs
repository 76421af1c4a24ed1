//! mDNS/zeroconf advertisement (§6 Discovery, §1 "pluggable announcer").
//!
//! Best-effort: a failure to create the daemon or register the service is
//! logged and otherwise ignored, mirroring the teacher's `MdnsAdvertiser`
//! (the satellite runs fine without LAN discovery).

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use mdns_sd::{ServiceDaemon, ServiceInfo};

const SERVICE_TYPE: &str = "_wyoming._tcp.local.";

/// What to advertise (§6: `{name, host, port}`, name MAC-derived by
/// default, host a best-guess routable interface address).
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub name: String,
    pub host: IpAddr,
    pub port: u16,
}

/// Registers the satellite on the local mDNS responder; unregisters on
/// drop. Kept alive for the lifetime of `bootstrap_satellite`'s returned
/// handle.
pub struct SatelliteAdvertiser {
    daemon: ServiceDaemon,
    service_fullname: String,
    shutdown_called: AtomicBool,
}

impl SatelliteAdvertiser {
    pub fn new(config: &DiscoveryConfig) -> Result<Self, mdns_sd::Error> {
        let daemon = ServiceDaemon::new()?;

        let dns_hostname = sanitize_for_dns(&config.name);
        let mut txt = HashMap::new();
        txt.insert("version".to_string(), env!("CARGO_PKG_VERSION").to_string());

        let service = ServiceInfo::new(
            SERVICE_TYPE,
            &config.name,
            &format!("{dns_hostname}.local."),
            config.host,
            config.port,
            Some(txt),
        )?;

        let fullname = service.get_fullname().to_string();
        daemon.register(service)?;

        tracing::info!(
            name = %config.name,
            host = %config.host,
            port = config.port,
            "advertising satellite via mDNS"
        );

        Ok(Self {
            daemon,
            service_fullname: fullname,
            shutdown_called: AtomicBool::new(false),
        })
    }

    pub fn shutdown(&self) {
        if self.shutdown_called.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.daemon.unregister(&self.service_fullname) {
            tracing::warn!(error = %e, "failed to unregister mDNS service");
        }
    }
}

impl Drop for SatelliteAdvertiser {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn sanitize_for_dns(name: &str) -> String {
    name.to_lowercase()
        .replace(' ', "-")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect()
}

/// Derives the default satellite name (§6: "the name defaults to a
/// MAC-derived identifier"). `hostname` doesn't expose interface MAC
/// addresses, so the hostname itself stands in for the per-host suffix,
/// the same fallback the teacher's `mdns_advertise.rs` uses to build its
/// instance name.
pub fn default_name() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("satellite-{}", sanitize_for_dns(&host))
}

/// Best-guess routable interface address (§6: "host defaults to a
/// best-guess routable interface address").
pub fn default_host() -> IpAddr {
    local_ip_address::local_ip().unwrap_or(IpAddr::from([127, 0, 0, 1]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_spaces_and_punctuation() {
        assert_eq!(sanitize_for_dns("Kitchen Satellite!"), "kitchen-satellite");
    }

    #[test]
    fn default_host_never_panics() {
        let _ = default_host();
    }
}
