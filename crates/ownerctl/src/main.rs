//! ownerctl - capsule-owner certificate push
//!
//! Reads a batch of certificate specs, sends each to the cert store
//! of the RIB hosting the owner's server, and exits. The issuer on
//! the wire is the owner-scoped capsule name (`<owner>:<name>`), the
//! same identifier the server later advertises under.

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use trustmesh_core::types::{CertKind, CertSubmission};
use trustmesh_core::CERTSTORE_PORT;
use trustmesh_net::udp;

/// ownerctl - push owner certificates to RIBs
#[derive(Parser, Debug)]
#[command(name = "ownerctl")]
#[command(about = "Send a capsule owner's trust/distrust certificates to RIB cert stores")]
struct Config {
    /// Owner name prefixed onto every capsule name
    #[arg(short, long)]
    owner: String,

    /// JSON file with the certificates to send
    #[arg(short, long)]
    certs: PathBuf,

    /// Seconds between sends
    #[arg(long, default_value = "0.5")]
    gap_secs: f64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// One certificate spec from the batch file.
#[derive(Debug, Clone, Deserialize)]
struct CertSpec {
    /// RIB to submit to
    rib: Ipv4Addr,
    /// Capsule name, without the owner prefix
    name: String,
    #[serde(rename = "type")]
    kind: CertKind,
    /// Entity the certificate speaks about (server address or tag)
    entity: String,
    #[serde(default)]
    r_transitivity: Option<i64>,
}

async fn push_certs(config: &Config) -> anyhow::Result<()> {
    let raw = std::fs::read(&config.certs)
        .with_context(|| format!("reading {}", config.certs.display()))?;
    let specs: Vec<CertSpec> = serde_json::from_slice(&raw).context("parsing certificate batch")?;

    let socket = udp::bind_ephemeral(Ipv4Addr::UNSPECIFIED)?;
    let gap = Duration::from_secs_f64(config.gap_secs);

    for spec in specs {
        let submission = CertSubmission {
            issuer: format!("{}:{}", config.owner, spec.name),
            kind: spec.kind,
            entity: spec.entity,
            r_transitivity: spec.r_transitivity,
        };
        let dest = udp::dest(spec.rib, CERTSTORE_PORT);
        socket
            .send_to(submission.to_json().as_bytes(), dest)
            .await
            .with_context(|| format!("sending certificate to {dest}"))?;
        info!(issuer = %submission.issuer, rib = %spec.rib, "certificate sent");
        tokio::time::sleep(gap).await;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    let default_directive = if config.verbose { "ownerctl=debug" } else { "ownerctl=info" };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(default_directive.parse().unwrap()))
        .init();

    if let Err(e) = push_certs(&config).await {
        error!("ownerctl failed: {e:#}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_file_parses() {
        let raw = r#"[
            {"rib":"10.0.2.1","name":"x7k","type":"trust","entity":"11.0.0.2","r_transitivity":4},
            {"rib":"10.0.2.1","name":"x7k","type":"distrust","entity":"AS7"}
        ]"#;
        let specs: Vec<CertSpec> = serde_json::from_str(raw).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].kind, CertKind::Trust);
        assert_eq!(specs[0].r_transitivity, Some(4));
        assert!(specs[1].r_transitivity.is_none());
    }

    #[test]
    fn issuer_carries_owner_prefix() {
        let submission = CertSubmission {
            issuer: format!("{}:{}", "fogrobotics", "x7k"),
            kind: CertKind::Trust,
            entity: "11.0.0.2".into(),
            r_transitivity: None,
        };
        assert_eq!(submission.issuer, "fogrobotics:x7k");
    }
}
