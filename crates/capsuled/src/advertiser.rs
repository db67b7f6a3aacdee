//! Name advertiser.
//!
//! Announces one capsule name per tick to the home RIB's ad store,
//! cycling through the configured list forever. The origin RIB always
//! accepts its own server's records, so a re-advertisement doubles as
//! the retry path after lost floods.

use std::io;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;
use trustmesh_core::types::NameRecord;
use trustmesh_core::ADSTORE_PORT;
use trustmesh_net::udp;

pub fn advertisement(name: &str, server: Ipv4Addr, rib: Ipv4Addr) -> NameRecord {
    NameRecord {
        dc_name: name.to_owned(),
        origin_rib: rib,
        origin_server: server,
        td_path: Vec::new(),
        trust_cert: None,
        distrust_certs: Vec::new(),
    }
}

pub async fn run(
    names: Vec<String>,
    addr: Ipv4Addr,
    rib: Ipv4Addr,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> io::Result<()> {
    if names.is_empty() {
        return Ok(());
    }
    let socket = udp::bind_ephemeral(addr)?;
    let dest = udp::dest(rib, ADSTORE_PORT);
    let mut ticker = tokio::time::interval(interval);
    let mut index = 0usize;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let name = &names[index % names.len()];
                index = index.wrapping_add(1);
                let record = advertisement(name, addr, rib);
                if let Err(err) = socket.send_to(record.to_json().as_bytes(), dest).await {
                    debug!(%err, "advertisement send failed");
                } else {
                    debug!(name, %rib, "advertised");
                }
            }
            _ = shutdown.recv() => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advertisement_has_empty_path_and_no_certs() {
        let record = advertisement(
            "fogrobotics:x7k",
            "11.0.0.2".parse().unwrap(),
            "10.0.2.1".parse().unwrap(),
        );
        assert!(record.td_path.is_empty());
        assert!(record.trust_cert.is_none());
        assert!(record.distrust_certs.is_empty());
        assert_eq!(record.origin_rib, "10.0.2.1".parse::<Ipv4Addr>().unwrap());
        // Wire form round-trips.
        let back = NameRecord::from_json(record.to_json().as_bytes()).unwrap();
        assert_eq!(back, record);
    }
}
