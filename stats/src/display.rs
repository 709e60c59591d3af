// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use crate::NfCounters;
use std::fmt::Write;

/// One console row per port.
#[derive(Debug, Clone)]
pub struct PortRow {
    pub port: u16,
    pub rx: u64,
    pub tx: u64,
    pub tx_drop: u64,
}

/// One console row per live NF.
#[derive(Debug, Clone)]
pub struct NfRow {
    pub instance: u16,
    pub service: u16,
    pub tag: String,
    pub counters: NfCounters,
}

/// Render the periodic stats table the master prints each tick.
#[must_use]
pub fn render(ports: &[PortRow], nfs: &[NfRow]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "PORTS");
    let _ = writeln!(out, "-----");
    for p in ports {
        let _ = writeln!(
            out,
            "Port {:2} - rx: {:10} tx: {:10} tx_drop: {:10}",
            p.port, p.rx, p.tx, p.tx_drop
        );
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "NFS");
    let _ = writeln!(out, "---");
    for nf in nfs {
        let c = &nf.counters;
        let _ = writeln!(
            out,
            "NF {:2} (svc {:2}, {}) - rx: {:8} ({:8} drop) tx: {:8} ({:8} drop) bkpr_drop: {:8}",
            nf.instance, nf.service, nf.tag, c.rx, c.rx_drop, c.tx, c.tx_drop, c.bkpr_drop
        );
        let _ = writeln!(
            out,
            "      actions - drop: {:8} next: {:8} tonf: {:8} out: {:8} wakeups: {:8} throttles: {:8}",
            c.act_drop, c.act_next, c.act_tonf, c.act_out, c.wakeup_count, c.throttle_count
        );
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn render_includes_every_row() {
        let table = render(
            &[PortRow {
                port: 0,
                rx: 1,
                tx: 2,
                tx_drop: 3,
            }],
            &[NfRow {
                instance: 1,
                service: 2,
                tag: "fwd".to_string(),
                counters: NfCounters::default(),
            }],
        );
        assert!(table.contains("Port  0"));
        assert!(table.contains("svc  2"));
        assert!(table.contains("fwd"));
    }
}
