use std::collections::HashSet;

use super::model::Workload;

/// Smallest port `>= start` absent from `used_ports`, scanning upward one port at a time.
///
/// Returns `None` only when every port from `start` to `u16::MAX` is taken.
pub fn next_available_port(used_ports: &HashSet<u16>, start: u16) -> Option<u16> {
    (start..=u16::MAX).find(|port| !used_ports.contains(port))
}

/// Host ports bound by any workload in the given listing. Port 0 means unpublished.
pub fn used_ports<'a>(workloads: impl IntoIterator<Item = &'a Workload>) -> HashSet<u16> {
    workloads
        .into_iter()
        .flat_map(|workload| workload.ports.iter())
        .map(|mapping| mapping.host_port)
        .filter(|port| *port > 0)
        .collect()
}
