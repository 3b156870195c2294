//! Check-config command implementation.

use serde::Serialize;
use std::path::Path;
use synclink_core::{
    CertificateValidator, ClientConfig, DerValidator, ExtendedValidator, TimingWarning,
};

/// Outcome of loading one pinned certificate.
#[derive(Debug, Serialize)]
pub struct PinReport {
    /// Host the certificate is pinned for.
    pub host: String,
    /// Certificate file.
    pub path: String,
    /// Detected format, if loaded.
    pub format: Option<String>,
    /// Hex SHA-256 fingerprints, if loaded.
    pub fingerprints: Vec<String>,
    /// Certificate subjects, if loaded.
    pub subjects: Vec<String>,
    /// Load error, if any.
    pub error: Option<String>,
}

/// Result of checking a configuration.
#[derive(Debug, Serialize)]
pub struct ConfigReport {
    /// The parsed configuration.
    pub config: ClientConfig,
    /// Timing warnings.
    pub warnings: Vec<String>,
    /// Pinned certificate results.
    pub pins: Vec<PinReport>,
}

impl ConfigReport {
    fn is_ok(&self) -> bool {
        self.pins.iter().all(|pin| pin.error.is_none())
    }
}

/// Runs the check-config command.
pub fn run(path: &Path, allow_pem: bool, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(path)?;
    let config: ClientConfig = serde_json::from_str(&text)?;
    let report = check(config, allow_pem);

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => print_report(path, &report),
    }

    if report.is_ok() {
        Ok(())
    } else {
        Err("Configuration check failed".into())
    }
}

/// Validates timing and loads every pinned certificate.
pub fn check(config: ClientConfig, allow_pem: bool) -> ConfigReport {
    let validator: &dyn CertificateValidator = if allow_pem {
        &ExtendedValidator
    } else {
        &DerValidator
    };

    let warnings = config
        .timing
        .validate()
        .iter()
        .map(TimingWarning::to_string)
        .collect();

    let pins = config
        .pinned_certificate_paths
        .iter()
        .map(|(host, path)| match validator.load_pinned(path) {
            Ok(pinned) => PinReport {
                host: host.clone(),
                path: path.display().to_string(),
                format: Some(pinned.format.to_string()),
                fingerprints: pinned.fingerprints.iter().map(|f| hex(f)).collect(),
                subjects: pinned.subjects,
                error: None,
            },
            Err(e) => PinReport {
                host: host.clone(),
                path: path.display().to_string(),
                format: None,
                fingerprints: Vec::new(),
                subjects: Vec::new(),
                error: Some(e.to_string()),
            },
        })
        .collect();

    ConfigReport {
        config,
        warnings,
        pins,
    }
}

fn print_report(path: &Path, report: &ConfigReport) {
    let config = &report.config;
    let timing = &config.timing;

    println!("Checking configuration at {:?}", path);
    println!();
    println!("Log level:              {}", config.log_level);
    if let Some(agent) = config.effective_user_agent() {
        println!("User agent:             {}", agent);
    }
    if let Some(name) = &config.authorization_header_name {
        println!("Authorization header:   {}", name);
    }
    for (name, value) in &config.custom_request_headers {
        println!("Header:                 {}: {}", name, value);
    }
    println!("Connect timeout:        {} ms", timing.connect_timeout.as_millis());
    println!("Linger time:            {} ms", timing.connection_linger_time.as_millis());
    println!("Ping period:            {} ms", timing.ping_keepalive_period.as_millis());
    println!("Pong timeout:           {} ms", timing.pong_keepalive_timeout.as_millis());
    println!("Fast reconnect limit:   {} ms", timing.fast_reconnect_limit.as_millis());

    if !report.warnings.is_empty() {
        println!();
        for warning in &report.warnings {
            println!("warning: {}", warning);
        }
    }

    if !report.pins.is_empty() {
        println!();
        for pin in &report.pins {
            match &pin.error {
                None => {
                    println!(
                        "  {} -> {} ({}, {} certificate(s))",
                        pin.host,
                        pin.path,
                        pin.format.as_deref().unwrap_or("?"),
                        pin.fingerprints.len()
                    );
                    for subject in &pin.subjects {
                        println!("      {}", subject);
                    }
                }
                Some(error) => println!("  {} -> {}: {}", pin.host, pin.path, error),
            }
        }
    }

    println!();
    if report.is_ok() {
        println!("✓ Configuration check passed");
    } else {
        println!("✗ Configuration check failed");
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
