//! # Packet Efficiency
//!
//! Fraction of flits on a connection that carry payload. Every route and
//! direction sharing a connection contributes its headers and responses to
//! the same two sides of the wire, so efficiency is a property of the
//! connection under the full traffic mix, not of a single route.
//!
//! $$\text{eff}(c) = \min_{s \in \{fwd, rev\},\ data_s > 0} \frac{data_s}{total_s}$$

use super::Flow;
use crate::config::ProtocolConfig;
use crate::topology::{Connection, ConnectionId, Direction, Topology, TransferOp};
use std::collections::HashMap;

/// Side of a connection, relative to its `from → to` orientation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Forward,
    Reverse,
}

/// Data and total flits accumulated on one side of a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FlitTally {
    pub data: f64,
    pub total: f64,
}

impl FlitTally {
    pub fn efficiency(&self) -> Option<f64> {
        if self.data > 0.0 && self.total > 0.0 {
            Some(self.data / self.total)
        } else {
            None
        }
    }
}

/// Per-invocation efficiency calculator.
///
/// Holds the traffic mix and memoizes connection efficiencies; build a new
/// one for every set of flows.
pub struct EfficiencyCalculator<'a> {
    topology: &'a dyn Topology,
    protocol: &'a ProtocolConfig,
    flows: &'a [Flow<'a>],
    cache: HashMap<ConnectionId, f64>,
}

impl<'a> EfficiencyCalculator<'a> {
    pub fn new(
        topology: &'a dyn Topology,
        protocol: &'a ProtocolConfig,
        flows: &'a [Flow<'a>],
    ) -> Self {
        Self {
            topology,
            protocol,
            flows,
            cache: HashMap::new(),
        }
    }

    /// Efficiency of a route: the worst of the connections it traverses.
    /// Routes without connection data run at full efficiency.
    pub fn route_efficiency(&mut self, flow: &Flow<'_>) -> anyhow::Result<f64> {
        let mut eff: f64 = 1.0;
        for &id in &flow.route.connections {
            let conn = self.topology.connection(id).ok_or_else(|| {
                anyhow::anyhow!("unknown connection {} on route {}", id, flow.route.id)
            })?;
            eff = eff.min(self.connection_efficiency(&conn));
        }
        Ok(eff)
    }

    /// Memoized efficiency of `conn` under the calculator's traffic mix.
    pub fn connection_efficiency(&mut self, conn: &Connection) -> f64 {
        if let Some(&eff) = self.cache.get(&conn.id) {
            return eff;
        }
        let eff = self.compute(conn, self.protocol.packet_bytes, true);
        self.cache.insert(conn.id, eff);
        eff
    }

    fn compute(&self, conn: &Connection, packet_bytes: u32, apply_war: bool) -> f64 {
        if apply_war && self.needs_war(conn) {
            let half = (packet_bytes / 2).max(self.protocol.flit_bytes);
            let full = self.compute(conn, packet_bytes, false);
            let reduced = self.compute(conn, half, false);
            return (full + reduced) / 2.0;
        }
        let (fwd, rev) = self.tally(conn, packet_bytes);
        match (fwd.efficiency(), rev.efficiency()) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => 1.0,
        }
    }

    fn needs_war(&self, conn: &Connection) -> bool {
        self.topology.needs_half_granularity_war(conn.from)
            || self.topology.needs_half_granularity_war(conn.to)
    }

    /// Sums flits of every flow crossing `conn`, one packet per flow.
    pub fn tally(&self, conn: &Connection, packet_bytes: u32) -> (FlitTally, FlitTally) {
        let p = self.protocol;
        let data_flits = packet_bytes.div_ceil(p.flit_bytes) as f64;
        let response_divisor = if conn.collapsed_responses {
            p.collapsed_response_count.max(1) as f64
        } else {
            1.0
        };

        let mut fwd = FlitTally::default();
        let mut rev = FlitTally::default();
        for flow in self.flows.iter().filter(|f| f.route.connections.contains(&conn.id)) {
            let (data_tally, other_tally) = match data_side(conn, flow) {
                Side::Forward => (&mut fwd, &mut rev),
                Side::Reverse => (&mut rev, &mut fwd),
            };
            data_tally.data += data_flits;
            data_tally.total += data_flits;
            match flow.op {
                TransferOp::Write => {
                    data_tally.total += p.request_header_flits as f64;
                    other_tally.total += p.write_response_flits as f64 / response_divisor;
                }
                TransferOp::Read => {
                    data_tally.total += p.read_response_header_flits as f64;
                    other_tally.total += p.request_header_flits as f64;
                }
            }
        }
        (fwd, rev)
    }
}

fn data_side(conn: &Connection, flow: &Flow<'_>) -> Side {
    if conn.from == conn.to {
        return match flow.direction {
            Direction::Out => Side::Forward,
            Direction::In => Side::Reverse,
        };
    }
    match flow.route.data_source(flow.direction) {
        Some(src) if src == conn.from => Side::Forward,
        Some(src) if src == conn.to => Side::Reverse,
        _ => match flow.route.data_dest(flow.direction) {
            Some(dst) if dst == conn.from => Side::Reverse,
            _ => Side::Forward,
        },
    }
}
