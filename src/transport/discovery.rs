//! Best-effort discovery of reachable instruments.
//!
//! Each backend is scanned independently and reports either the resources it
//! sees or the reason it could not look. Absence from a listing is only a hint:
//! LAN instruments in particular are reachable without ever appearing in a
//! cached VISA resource list, so [`DiscoveryReport::locate`] never blocks a
//! connection attempt.

use super::ConnectionParams;
use crate::config::Settings;
use serde::Serialize;

/// Result of scanning one backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendScan {
    /// Backend name ("serial", "visa")
    pub backend: &'static str,
    /// Resources found, or why the scan was not possible
    pub result: Result<Vec<String>, String>,
}

/// Whether a resource appeared in a discovery report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Listing {
    /// A backend listed the resource.
    Listed,
    /// No backend listed it. The instrument may still be reachable.
    NotListed,
}

/// Resources visible to every backend that was scanned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryReport {
    /// One entry per backend
    pub scans: Vec<BackendScan>,
}

impl DiscoveryReport {
    /// All resources found by successful scans.
    pub fn resources(&self) -> impl Iterator<Item = &str> {
        self.scans
            .iter()
            .filter_map(|scan| scan.result.as_ref().ok())
            .flatten()
            .map(String::as_str)
    }

    /// Backends that could not be scanned, with the reason.
    pub fn failures(&self) -> impl Iterator<Item = (&'static str, &str)> {
        self.scans.iter().filter_map(|scan| match &scan.result {
            Err(reason) => Some((scan.backend, reason.as_str())),
            Ok(_) => None,
        })
    }

    /// Look for `params` among the discovered resources.
    ///
    /// Matches the VISA resource string (case-insensitive) or, for serial
    /// ports, the port name or its configured alias.
    pub fn locate(&self, params: &ConnectionParams, settings: &Settings) -> Listing {
        let visa = params.visa_resource().to_ascii_uppercase();
        let serial_names: Vec<&str> = match params {
            ConnectionParams::Serial { port } => {
                vec![port.as_str(), settings.serial.device_path(port)]
            }
            _ => Vec::new(),
        };

        let found = self.resources().any(|resource| {
            resource.to_ascii_uppercase() == visa || serial_names.contains(&resource)
        });

        if found {
            Listing::Listed
        } else {
            Listing::NotListed
        }
    }
}

#[cfg(feature = "instrument_serial")]
fn scan_serial() -> BackendScan {
    BackendScan {
        backend: "serial",
        result: super::serial::available_ports().map_err(|e| e.to_string()),
    }
}

#[cfg(not(feature = "instrument_serial"))]
fn scan_serial() -> BackendScan {
    BackendScan {
        backend: "serial",
        result: Err("feature 'instrument_serial' is not enabled".to_string()),
    }
}

#[cfg(feature = "instrument_visa")]
fn scan_visa() -> BackendScan {
    BackendScan {
        backend: "visa",
        result: super::visa::list_resources().map_err(|e| e.to_string()),
    }
}

#[cfg(not(feature = "instrument_visa"))]
fn scan_visa() -> BackendScan {
    BackendScan {
        backend: "visa",
        result: Err("feature 'instrument_visa' is not enabled".to_string()),
    }
}

/// Scan every compiled-in backend.
///
/// Enumeration calls block briefly, so they run on the blocking pool.
pub async fn discover() -> DiscoveryReport {
    let scans = tokio::task::spawn_blocking(|| vec![scan_serial(), scan_visa()])
        .await
        .unwrap_or_else(|e| {
            vec![BackendScan {
                backend: "discovery",
                result: Err(format!("discovery task panicked: {}", e)),
            }]
        });
    DiscoveryReport { scans }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::resolve;

    fn report() -> DiscoveryReport {
        DiscoveryReport {
            scans: vec![
                BackendScan {
                    backend: "serial",
                    result: Ok(vec!["/dev/ttyUSB0".to_string(), "COM3".to_string()]),
                },
                BackendScan {
                    backend: "visa",
                    result: Ok(vec!["GPIB0::2::INSTR".to_string()]),
                },
                BackendScan {
                    backend: "usb",
                    result: Err("access denied".to_string()),
                },
            ],
        }
    }

    #[test]
    fn test_locate_visa_resource() {
        let settings = Settings::default();
        let params = resolve("GPIB:2").unwrap();
        assert_eq!(report().locate(&params, &settings), Listing::Listed);

        let params = resolve("GPIB:5").unwrap();
        assert_eq!(report().locate(&params, &settings), Listing::NotListed);
    }

    #[test]
    fn test_locate_serial_through_alias() {
        let mut settings = Settings::default();
        let params = resolve("COM7").unwrap();
        assert_eq!(report().locate(&params, &settings), Listing::NotListed);

        settings
            .serial
            .aliases
            .insert("COM7".to_string(), "/dev/ttyUSB0".to_string());
        assert_eq!(report().locate(&params, &settings), Listing::Listed);
    }

    #[test]
    fn test_failures_are_reported_not_hidden() {
        let report = report();
        let failures: Vec<_> = report.failures().collect();
        assert_eq!(failures, vec![("usb", "access denied")]);
        assert_eq!(report.resources().count(), 3);
    }

    #[tokio::test]
    async fn test_discover_reports_every_backend() {
        let report = discover().await;
        let backends: Vec<_> = report.scans.iter().map(|s| s.backend).collect();
        assert_eq!(backends, vec!["serial", "visa"]);
    }
}
