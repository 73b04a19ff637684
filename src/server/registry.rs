// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! EdgeNode and Service registry backing the advertise/withdraw/list/find
//! protocol on the registry port.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use crate::server::protocol::ServiceEntry;

/// Stable identifier for a connected EdgeNode. Monotonic, never reused.
pub type EdgeId = u64;

/// A (advertised-id, service-kind) pair uniquely identifies a Service: a
/// repeat `helo` for the same pair updates in place rather than duplicating.
pub type ServiceKey = (String, String);

/// A node connected to the registry over a single long-lived socket.
#[derive(Debug, Clone)]
pub struct EdgeNode {
    pub id: EdgeId,
    pub node_name: String,
    pub public_ip: IpAddr,
    pub last_seen: Instant,
    #[allow(dead_code)]
    pub registered_at: Instant,
}

impl EdgeNode {
    pub fn new(id: EdgeId, node_name: String, public_ip: IpAddr) -> Self {
        let now = Instant::now();
        Self {
            id,
            node_name,
            public_ip,
            last_seen: now,
            registered_at: now,
        }
    }

    pub fn is_expired(&self, lease_duration: Duration) -> bool {
        self.last_seen.elapsed() > lease_duration
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }
}

/// A single service advertised by an EdgeNode, keyed by its own
/// (id, svc) pair rather than a registry-assigned id.
#[derive(Debug, Clone)]
pub struct Service {
    pub edge_id: EdgeId,
    pub id: String,
    pub svc: String,
    pub port: u16,
    pub data: u16,
    pub caps: String,
}

impl Service {
    fn to_entry(&self, ip: IpAddr) -> ServiceEntry {
        ServiceEntry {
            id: self.id.clone(),
            svc: self.svc.clone(),
            ip: ip.to_string(),
            port: self.port,
            data: self.data,
            caps: self.caps.clone(),
        }
    }

    fn key(&self) -> ServiceKey {
        (self.id.clone(), self.svc.clone())
    }
}

/// Registry of connected EdgeNodes and the Services they advertise, bounded
/// by `max_edges`/`max_services`.
#[derive(Debug)]
pub struct Registry {
    edges: HashMap<EdgeId, EdgeNode>,
    services: HashMap<ServiceKey, Service>,
    svc_index: HashMap<String, Vec<ServiceKey>>,
    edge_services: HashMap<EdgeId, Vec<ServiceKey>>,
    next_edge_id: EdgeId,
    max_edges: usize,
    max_services: usize,
}

impl Registry {
    pub fn new(max_edges: usize, max_services: usize) -> Self {
        Self {
            edges: HashMap::new(),
            services: HashMap::new(),
            svc_index: HashMap::new(),
            edge_services: HashMap::new(),
            next_edge_id: 1,
            max_edges,
            max_services,
        }
    }

    /// Register a new EdgeNode connection, returning its assigned id, or
    /// `None` if the registry is already at `max_edges`.
    pub fn add_edge(&mut self, node_name: String, public_ip: IpAddr) -> Option<EdgeId> {
        if self.edges.len() >= self.max_edges {
            return None;
        }
        let id = self.next_edge_id;
        self.next_edge_id += 1;
        self.edges.insert(id, EdgeNode::new(id, node_name, public_ip));
        self.edge_services.entry(id).or_default();
        Some(id)
    }

    /// Advertise a service under an already-registered edge. A repeat
    /// `helo` for the same (id, svc) pair updates the existing entry
    /// in place instead of allocating a new one; a genuinely new pair is
    /// rejected once the registry holds `max_services` entries.
    pub fn advertise(
        &mut self,
        edge_id: EdgeId,
        id: String,
        svc: String,
        port: u16,
        data: u16,
        caps: String,
    ) -> Option<()> {
        if !self.edges.contains_key(&edge_id) {
            return None;
        }

        let key = (id.clone(), svc.clone());
        if !self.services.contains_key(&key) && self.services.len() >= self.max_services {
            return None;
        }

        let prior_edge_id = self.services.get(&key).map(|s| s.edge_id);
        self.services.insert(
            key.clone(),
            Service {
                edge_id,
                id,
                svc: svc.clone(),
                port,
                data,
                caps,
            },
        );
        match prior_edge_id {
            None => {
                self.svc_index.entry(svc).or_default().push(key.clone());
                self.edge_services.entry(edge_id).or_default().push(key);
            }
            Some(prior) if prior != edge_id => {
                if let Some(list) = self.edge_services.get_mut(&prior) {
                    list.retain(|k| k != &key);
                }
                self.edge_services.entry(edge_id).or_default().push(key);
            }
            Some(_) => {}
        }
        if let Some(edge) = self.edges.get_mut(&edge_id) {
            edge.touch();
        }
        Some(())
    }

    /// Withdraw a single service by kind from an edge, or every service the
    /// edge advertises when `svc` is `None`.
    pub fn withdraw(&mut self, edge_id: EdgeId, svc: Option<&str>) {
        let keys: Vec<ServiceKey> = self
            .edge_services
            .get(&edge_id)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|key| match svc {
                Some(name) => key.1 == name,
                None => true,
            })
            .collect();

        for key in keys {
            self.remove_service(&key);
        }
    }

    fn remove_service(&mut self, key: &ServiceKey) -> Option<Service> {
        let service = self.services.remove(key)?;
        if let Some(list) = self.svc_index.get_mut(&service.svc) {
            list.retain(|k| k != key);
        }
        if let Some(list) = self.edge_services.get_mut(&service.edge_id) {
            list.retain(|k| k != key);
        }
        Some(service)
    }

    /// Disconnect an edge entirely, withdrawing every service it advertised.
    pub fn remove_edge(&mut self, edge_id: EdgeId) -> Option<EdgeNode> {
        self.withdraw(edge_id, None);
        self.edge_services.remove(&edge_id);
        self.edges.remove(&edge_id)
    }

    pub fn touch_edge(&mut self, edge_id: EdgeId) {
        if let Some(edge) = self.edges.get_mut(&edge_id) {
            edge.touch();
        }
    }

    /// List every advertised service.
    pub fn list(&self) -> Vec<ServiceEntry> {
        self.services
            .values()
            .filter_map(|s| self.edges.get(&s.edge_id).map(|e| s.to_entry(e.public_ip)))
            .collect()
    }

    /// Find every service of a given kind.
    pub fn find(&self, svc: &str) -> Vec<ServiceEntry> {
        self.svc_index
            .get(svc)
            .map(|keys| {
                keys.iter()
                    .filter_map(|key| self.services.get(key))
                    .filter_map(|s| self.edges.get(&s.edge_id).map(|e| s.to_entry(e.public_ip)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Sweep and remove edges idle past `lease_duration`, returning their ids.
    pub fn remove_expired(&mut self, lease_duration: Duration) -> Vec<EdgeId> {
        let expired: Vec<EdgeId> = self
            .edges
            .values()
            .filter(|e| e.is_expired(lease_duration))
            .map(|e| e.id)
            .collect();

        for id in &expired {
            self.remove_edge(*id);
        }

        expired
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))
    }

    fn reg() -> Registry {
        Registry::new(32, 128)
    }

    #[test]
    fn test_registry_new() {
        let reg = reg();
        assert_eq!(reg.edge_count(), 0);
        assert_eq!(reg.service_count(), 0);
    }

    #[test]
    fn test_add_edge_assigns_stable_ids() {
        let mut reg = reg();
        let a = reg.add_edge("KY4OLB-SDR1".into(), ip()).unwrap();
        let b = reg.add_edge("KY4OLB-SDR2".into(), ip()).unwrap();
        assert_ne!(a, b);
        assert_eq!(reg.edge_count(), 2);
    }

    #[test]
    fn test_add_edge_rejects_past_cap() {
        let mut reg = Registry::new(1, 128);
        assert!(reg.add_edge("a".into(), ip()).is_some());
        assert!(reg.add_edge("b".into(), ip()).is_none());
        assert_eq!(reg.edge_count(), 1);
    }

    #[test]
    fn test_advertise_and_list() {
        let mut reg = reg();
        let edge = reg.add_edge("KY4OLB-SDR1".into(), ip()).unwrap();
        let result = reg.advertise(edge, "KY4OLB-SDR1".into(), "sdr_server".into(), 4535, 4536, "rsp1a".into());
        assert!(result.is_some());

        let services = reg.list();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].svc, "sdr_server");
        assert_eq!(services[0].id, "KY4OLB-SDR1");
        assert_eq!(services[0].ip, "10.0.0.1");
    }

    #[test]
    fn test_advertise_unknown_edge_fails() {
        let mut reg = reg();
        assert!(reg
            .advertise(999, "x".into(), "sdr_server".into(), 1, 2, String::new())
            .is_none());
    }

    #[test]
    fn test_repeat_helo_upserts_not_duplicates() {
        let mut reg = reg();
        let edge = reg.add_edge("KY4OLB-SDR1".into(), ip()).unwrap();
        reg.advertise(edge, "KY4OLB-SDR1".into(), "sdr_server".into(), 4535, 4536, "rsp1a".into());
        reg.advertise(edge, "KY4OLB-SDR1".into(), "sdr_server".into(), 4535, 4536, "rsp1b".into());

        assert_eq!(reg.service_count(), 1);
        assert_eq!(reg.find("sdr_server")[0].caps, "rsp1b");
    }

    #[test]
    fn test_advertise_rejects_past_service_cap() {
        let mut reg = Registry::new(32, 1);
        let edge = reg.add_edge("KY4OLB-SDR1".into(), ip()).unwrap();
        assert!(reg
            .advertise(edge, "a".into(), "sdr_server".into(), 1, 2, String::new())
            .is_some());
        assert!(reg
            .advertise(edge, "b".into(), "sdr_server".into(), 1, 2, String::new())
            .is_none());
        assert_eq!(reg.service_count(), 1);
    }

    #[test]
    fn test_readvertise_under_new_edge_moves_ownership() {
        let mut reg = reg();
        let old_edge = reg.add_edge("KY4OLB-SDR1".into(), ip()).unwrap();
        reg.advertise(old_edge, "KY4OLB-SDR1".into(), "sdr_server".into(), 4535, 4536, "rsp1a".into());

        // node reconnects before the stale session is reaped, re-advertising
        // the same (id, svc) under a fresh edge id.
        let new_edge = reg.add_edge("KY4OLB-SDR1".into(), ip()).unwrap();
        reg.advertise(new_edge, "KY4OLB-SDR1".into(), "sdr_server".into(), 4535, 4536, "rsp1b".into());

        reg.remove_edge(old_edge);

        assert_eq!(reg.service_count(), 1);
        assert_eq!(reg.find("sdr_server")[0].caps, "rsp1b");
    }

    #[test]
    fn test_find_by_kind() {
        let mut reg = reg();
        let edge = reg.add_edge("KY4OLB-SDR1".into(), ip()).unwrap();
        reg.advertise(edge, "KY4OLB-SDR1".into(), "sdr_server".into(), 4535, 4536, "rsp1a".into());
        reg.advertise(edge, "KY4OLB-SDR1".into(), "controller".into(), 9000, 0, String::new());

        assert_eq!(reg.find("sdr_server").len(), 1);
        assert_eq!(reg.find("controller").len(), 1);
        assert!(reg.find("nonexistent").is_empty());
    }

    #[test]
    fn test_withdraw_single_service() {
        let mut reg = reg();
        let edge = reg.add_edge("KY4OLB-SDR1".into(), ip()).unwrap();
        reg.advertise(edge, "KY4OLB-SDR1".into(), "sdr_server".into(), 4535, 4536, "rsp1a".into());
        reg.advertise(edge, "KY4OLB-SDR1".into(), "controller".into(), 9000, 0, String::new());

        reg.withdraw(edge, Some("sdr_server"));

        assert_eq!(reg.service_count(), 1);
        assert!(reg.find("sdr_server").is_empty());
        assert_eq!(reg.find("controller").len(), 1);
    }

    #[test]
    fn test_remove_edge_withdraws_all_services() {
        let mut reg = reg();
        let edge = reg.add_edge("KY4OLB-SDR1".into(), ip()).unwrap();
        reg.advertise(edge, "KY4OLB-SDR1".into(), "sdr_server".into(), 4535, 4536, "rsp1a".into());
        reg.advertise(edge, "KY4OLB-SDR1".into(), "controller".into(), 9000, 0, String::new());

        reg.remove_edge(edge);

        assert_eq!(reg.edge_count(), 0);
        assert_eq!(reg.service_count(), 0);
    }

    #[test]
    fn test_remove_expired() {
        let mut reg = reg();
        let stale = reg.add_edge("stale".into(), ip()).unwrap();
        reg.edges.get_mut(&stale).unwrap().last_seen = Instant::now() - Duration::from_secs(200);
        let fresh = reg.add_edge("fresh".into(), ip()).unwrap();

        let expired = reg.remove_expired(Duration::from_secs(120));

        assert_eq!(expired, vec![stale]);
        assert_eq!(reg.edge_count(), 1);
        assert!(reg.edges.contains_key(&fresh));
    }

    #[test]
    fn test_touch_edge_resets_lease() {
        let mut reg = reg();
        let edge = reg.add_edge("KY4OLB-SDR1".into(), ip()).unwrap();
        reg.edges.get_mut(&edge).unwrap().last_seen = Instant::now() - Duration::from_secs(200);

        reg.touch_edge(edge);

        assert!(reg.remove_expired(Duration::from_secs(120)).is_empty());
    }
}
