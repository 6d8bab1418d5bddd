//! Endpoint switching hysteresis (§4.9 "Endpoint switching").

use crate::data::{CallEndpoint, EndpointKind};

pub const RELAY_SWITCH_THRESHOLD: f64 = 0.8;
pub const RELAY_TO_P2P_SWITCH_THRESHOLD: f64 = 0.6;
pub const P2P_TO_RELAY_SWITCH_THRESHOLD: f64 = 0.8;

/// `k` in the relay-to-relay comparison: TCP RTT counts double against UDP.
fn transport_weight(kind: EndpointKind) -> f64 {
    match kind {
        EndpointKind::TcpRelay => 2.0,
        _ => 1.0,
    }
}

/// Decides whether `candidate` should replace `current` as the
/// current endpoint, given each endpoint's current average RTT.
///
/// - relay → relay: switch when `candidate.rtt * k_candidate <
///   current.rtt * RELAY_SWITCH_THRESHOLD`.
/// - relay → P2P: switch when the P2P candidate's RTT is below
///   `current.rtt * RELAY_TO_P2P_SWITCH_THRESHOLD`.
/// - P2P → relay: switch back when the current P2P RTT exceeds
///   `candidate.rtt * P2P_TO_RELAY_SWITCH_THRESHOLD`.
pub fn should_switch(current: &CallEndpoint, candidate: &CallEndpoint) -> bool {
    let (Some(current_rtt), Some(candidate_rtt)) = (current.average_rtt(), candidate.average_rtt()) else {
        return false;
    };

    let current_is_relay = matches!(current.kind, EndpointKind::UdpRelay | EndpointKind::TcpRelay);
    let candidate_is_relay = matches!(candidate.kind, EndpointKind::UdpRelay | EndpointKind::TcpRelay);

    match (current_is_relay, candidate_is_relay) {
        (true, true) => candidate_rtt * transport_weight(candidate.kind) < current_rtt * RELAY_SWITCH_THRESHOLD,
        (true, false) => candidate_rtt < current_rtt * RELAY_TO_P2P_SWITCH_THRESHOLD,
        (false, true) => current_rtt > candidate_rtt * P2P_TO_RELAY_SWITCH_THRESHOLD,
        (false, false) => false,
    }
}

/// Picks the best switch target among `candidates`, or `None` if none beat
/// `current` under [`should_switch`].
pub fn pick_switch_target<'a>(current: &CallEndpoint, candidates: &'a [CallEndpoint]) -> Option<&'a CallEndpoint> {
    candidates
        .iter()
        .filter(|c| should_switch(current, c))
        .min_by(|a, b| {
            a.average_rtt()
                .unwrap_or(f64::INFINITY)
                .partial_cmp(&b.average_rtt().unwrap_or(f64::INFINITY))
                .unwrap()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use transport::{Endpoint as NetEndpoint, Protocol};

    fn endpoint(id: u64, kind: EndpointKind, rtt: f64) -> CallEndpoint {
        let mut e = CallEndpoint::new(
            id,
            kind,
            NetEndpoint::new(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), 1000, Protocol::Udp),
            [0u8; 16],
        );
        e.record_rtt(rtt);
        e
    }

    #[test]
    fn switches_between_relays_past_threshold() {
        let current = endpoint(1, EndpointKind::UdpRelay, 0.2);
        let candidate = endpoint(2, EndpointKind::UdpRelay, 0.1);
        assert!(should_switch(&current, &candidate));
    }

    #[test]
    fn does_not_switch_for_marginal_improvement() {
        let current = endpoint(1, EndpointKind::UdpRelay, 0.2);
        let candidate = endpoint(2, EndpointKind::UdpRelay, 0.19);
        assert!(!should_switch(&current, &candidate));
    }

    #[test]
    fn tcp_relay_candidate_counts_double() {
        let current = endpoint(1, EndpointKind::UdpRelay, 0.2);
        let candidate = endpoint(2, EndpointKind::TcpRelay, 0.09);
        // 0.09 * 2 = 0.18 < 0.2 * 0.8 = 0.16? no -> should not switch
        assert!(!should_switch(&current, &candidate));
    }

    #[test]
    fn switches_from_relay_to_much_faster_p2p() {
        let current = endpoint(1, EndpointKind::UdpRelay, 0.3);
        let candidate = endpoint(2, EndpointKind::UdpP2pInet, 0.1);
        assert!(should_switch(&current, &candidate));
    }

    #[test]
    fn switches_back_to_relay_when_p2p_degrades() {
        let current = endpoint(1, EndpointKind::UdpP2pInet, 0.5);
        let candidate = endpoint(2, EndpointKind::UdpRelay, 0.2);
        assert!(should_switch(&current, &candidate));
    }
}
