//! Service descriptor table.
//!
//! Every worker owns a block of [`PORT_STRIDE`] ports starting at
//! `BASE_PORT + worker * PORT_STRIDE`. Services take fixed offsets inside the
//! block in [`SERVICE_ORDER`], so two workers never share a port as long as
//! the service list fits in the stride.

use crate::types::{ServiceDescriptor, ServiceName};

/// First port of worker 0.
pub const BASE_PORT: u16 = 3000;

/// Ports reserved per worker.
pub const PORT_STRIDE: u16 = 10;

/// Fixed service order; the index is the port offset.
pub const SERVICE_ORDER: [ServiceName; 7] = [
    ServiceName::Frontend,
    ServiceName::Auth,
    ServiceName::User,
    ServiceName::News,
    ServiceName::Course,
    ServiceName::Planning,
    ServiceName::Statistics,
];

const _: () = assert!(SERVICE_ORDER.len() <= PORT_STRIDE as usize);

/// First port of a worker's block.
///
/// Indices above [`MAX_WORKER_ID`] are a caller contract violation; they are
/// clamped so the arithmetic stays inside `u16`. Front ends validate first.
pub fn base_port(worker_id: u16) -> u16 {
    BASE_PORT + worker_id.min(MAX_WORKER_ID) * PORT_STRIDE
}

/// [`base_port`] for a worker index that may be out of range.
pub fn checked_base_port(worker_id: u16) -> Option<u16> {
    (worker_id <= MAX_WORKER_ID).then(|| base_port(worker_id))
}

/// Port of the service at `offset` for `worker_id`.
pub fn port_for(worker_id: u16, offset: u16) -> u16 {
    base_port(worker_id) + offset
}

/// Deterministic descriptor set for a worker, in [`SERVICE_ORDER`].
pub fn descriptors_for(worker_id: u16) -> Vec<ServiceDescriptor> {
    SERVICE_ORDER
        .iter()
        .enumerate()
        .map(|(offset, name)| ServiceDescriptor {
            name: *name,
            port: port_for(worker_id, offset as u16),
        })
        .collect()
}

/// Descriptor of one named service for a worker.
pub fn descriptor_of(worker_id: u16, name: ServiceName) -> ServiceDescriptor {
    let offset = SERVICE_ORDER
        .iter()
        .position(|candidate| *candidate == name)
        .unwrap_or_default();
    ServiceDescriptor {
        name,
        port: port_for(worker_id, offset as u16),
    }
}

/// Largest worker index whose block still fits below `u16::MAX`.
pub const MAX_WORKER_ID: u16 = (u16::MAX - BASE_PORT) / PORT_STRIDE - 1;

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_worker_zero_layout() {
        let descriptors = descriptors_for(0);
        let ports: Vec<u16> = descriptors.iter().map(|d| d.port).collect();
        assert_eq!(ports, vec![3000, 3001, 3002, 3003, 3004, 3005, 3006]);
        assert_eq!(descriptors[0].name, ServiceName::Frontend);
        assert_eq!(descriptors[6].name, ServiceName::Statistics);
    }

    #[test]
    fn test_base_port_worker_three() {
        assert_eq!(base_port(3), 3030);
        assert_eq!(port_for(3, 4), 3034);
    }

    #[test]
    fn test_descriptor_of_matches_table() {
        for worker in [0, 1, 7] {
            for descriptor in descriptors_for(worker) {
                assert_eq!(descriptor_of(worker, descriptor.name), descriptor);
            }
        }
    }

    #[test]
    fn test_deterministic() {
        assert_eq!(descriptors_for(5), descriptors_for(5));
    }

    proptest! {
        #[test]
        fn prop_ports_unique_across_workers(
            w1 in 0u16..MAX_WORKER_ID,
            w2 in 0u16..MAX_WORKER_ID,
            i in 0u16..(SERVICE_ORDER.len() as u16),
        ) {
            prop_assume!(w1 != w2);
            prop_assert_ne!(port_for(w1, i), port_for(w2, i));
        }

        #[test]
        fn prop_ports_unique_within_worker(w in 0u16..MAX_WORKER_ID) {
            let ports: HashSet<u16> = descriptors_for(w).iter().map(|d| d.port).collect();
            prop_assert_eq!(ports.len(), SERVICE_ORDER.len());
        }

        #[test]
        fn prop_blocks_disjoint(w1 in 0u16..MAX_WORKER_ID, w2 in 0u16..MAX_WORKER_ID) {
            prop_assume!(w1 != w2);
            let a: HashSet<u16> = descriptors_for(w1).iter().map(|d| d.port).collect();
            let b: HashSet<u16> = descriptors_for(w2).iter().map(|d| d.port).collect();
            prop_assert!(a.is_disjoint(&b));
        }
    }

    #[test]
    fn test_out_of_range_worker_is_rejected_and_never_overflows() {
        assert_eq!(checked_base_port(MAX_WORKER_ID), Some(base_port(MAX_WORKER_ID)));
        assert_eq!(checked_base_port(MAX_WORKER_ID + 1), None);
        assert_eq!(checked_base_port(7000), None);

        let last = descriptors_for(u16::MAX);
        assert_eq!(last, descriptors_for(MAX_WORKER_ID));
        assert!(last.iter().all(|d| d.port > BASE_PORT));
    }
}
