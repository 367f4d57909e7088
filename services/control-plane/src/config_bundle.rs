//! Config bundle generation: one WireGuard interface per peer link, the
//! combined `/etc/network/interfaces` stanza set, and the FRR OSPF config,
//! plus the fingerprint the agent uses to detect drift.
//!
//! Each point-to-point `/31` link gets its own named WireGuard interface
//! (`wg-hub2`, `wg-worker7`, ...) rather than one interface carrying every
//! peer, so OSPF can treat each link as a genuine point-to-point network and
//! so the per-link listen-port allocation in [`crate::ipam`] has somewhere
//! to land. Line order matters in all three renderers: dummy (loopback)
//! interface first, then tunnel interfaces in link order, then the FRR
//! daemon config with its route-map and OSPF stanzas.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use gluon_networking::{WgInterface, WgPeer, WgPublicKey, HUB_SIDE_KEEPALIVE_SECS, OSPF_MULTICAST_ALLOWED_IP};
use gluon_reconcile::BundleFingerprint;

use crate::models::NodeRole;

/// One point-to-point WireGuard link to a single peer.
#[derive(Debug, Clone)]
pub struct PeerLink {
    /// Interface name, unique per node (e.g. `wg-hub2`, `wg-worker7`).
    pub interface_name: String,
    pub listen_port: u16,
    /// This node's address on the link's `/31`.
    pub local_address: Ipv4Addr,
    pub peer_public_key: WgPublicKey,
    pub peer_endpoint: Option<String>,
    pub allowed_ips: Vec<String>,
    /// Whether this side's peer stanza carries `PersistentKeepalive`. Only
    /// the hub side of a hub-worker link does; workers and hub-to-hub links
    /// rely on OSPF hello/dead timers instead.
    pub keepalive: bool,
    pub ospf_cost: u32,
}

/// `AllowedIPs` for the hub's stanza describing a worker peer: just the
/// worker's own loopback, the shared link subnet, and OSPF multicast.
pub fn hub_to_worker_allowed_ips(worker_loopback: Ipv4Addr, link_subnet: &str) -> Vec<String> {
    vec![
        format!("{worker_loopback}/32"),
        link_subnet.to_string(),
        OSPF_MULTICAST_ALLOWED_IP.to_string(),
    ]
}

/// `AllowedIPs` for the worker's stanza describing its hub peer: the hub's
/// loopback, the link subnet, the whole loopback pool (so routes to every
/// other node's loopback resolve via this link), and OSPF multicast.
pub fn worker_to_hub_allowed_ips(
    hub_loopback: Ipv4Addr,
    link_subnet: &str,
    loopback_pool_cidr: &str,
) -> Vec<String> {
    vec![
        format!("{hub_loopback}/32"),
        link_subnet.to_string(),
        loopback_pool_cidr.to_string(),
        OSPF_MULTICAST_ALLOWED_IP.to_string(),
    ]
}

/// `AllowedIPs` for either side of a hub-to-hub mesh link: the link subnet,
/// the loopback pool, and OSPF multicast. Neither side needs the peer's
/// bare loopback separately since the loopback pool already covers it.
pub fn hub_to_hub_allowed_ips(link_subnet: &str, loopback_pool_cidr: &str) -> Vec<String> {
    vec![
        link_subnet.to_string(),
        loopback_pool_cidr.to_string(),
        OSPF_MULTICAST_ALLOWED_IP.to_string(),
    ]
}

/// Everything needed to render one node's full config bundle.
#[derive(Debug, Clone)]
pub struct BundleSpec {
    pub hostname: String,
    pub role: NodeRole,
    pub hub_number: Option<i32>,
    pub loopback_address: Ipv4Addr,
    pub links: Vec<PeerLink>,
    /// OSPF area every interface (dummy and links alike) is placed in.
    pub ospf_area: u32,
    /// OSPF hello-interval for link interfaces, in seconds. `0` suppresses
    /// the hello/dead-interval lines entirely and leaves FRR's defaults.
    pub ospf_hello_interval: u32,
    /// OSPF dead-interval for link interfaces, in seconds.
    pub ospf_dead_interval: u32,
}

/// The fully rendered bundle: per-interface WireGuard configs, the combined
/// interfaces/FRR text, and their fingerprint.
#[derive(Debug, Clone)]
pub struct RenderedBundle {
    /// Interface name -> WireGuard config text.
    pub wireguard_configs: BTreeMap<String, String>,
    pub interfaces_config: String,
    pub frr_config: String,
    pub fingerprint: BundleFingerprint,
}

const DUMMY_INTERFACE_NAME: &str = "dummy0";

pub fn render_bundle(spec: &BundleSpec) -> RenderedBundle {
    let wireguard_configs = render_wireguard(spec);
    let interfaces_config = render_interfaces(spec);
    let frr_config = render_frr(spec);

    let metadata = serde_json::json!({
        "hostname": spec.hostname,
        "role": match spec.role { NodeRole::Hub => "hub", NodeRole::Worker => "worker" },
        "hub_number": spec.hub_number,
        "loopback_address": spec.loopback_address.to_string(),
        "links": spec.links.iter().map(|l| serde_json::json!({
            "interface": l.interface_name,
            "port": l.listen_port,
            "peer": l.peer_public_key.as_str(),
        })).collect::<Vec<_>>(),
    });

    let mut rendered_files: Vec<&str> = wireguard_configs.values().map(String::as_str).collect();
    rendered_files.push(&interfaces_config);
    rendered_files.push(&frr_config);
    let fingerprint = BundleFingerprint::compute(&metadata, &rendered_files);

    RenderedBundle {
        wireguard_configs,
        interfaces_config,
        frr_config,
        fingerprint,
    }
}

fn render_wireguard(spec: &BundleSpec) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for link in &spec.links {
        let mut iface = WgInterface::new(link.interface_name.clone(), link.listen_port);
        let mut peer = WgPeer::new(link.peer_public_key.clone(), link.allowed_ips.clone());
        if let Some(endpoint) = &link.peer_endpoint {
            peer = peer.with_endpoint(endpoint.clone());
        }
        if link.keepalive {
            peer = peer.with_keepalive(HUB_SIDE_KEEPALIVE_SECS);
        }
        iface.add_peer(peer);
        out.insert(link.interface_name.clone(), iface.render());
    }
    out
}

fn render_interfaces(spec: &BundleSpec) -> String {
    let mut out = String::new();
    out.push_str(&format!("auto {DUMMY_INTERFACE_NAME}\n"));
    out.push_str(&format!("iface {DUMMY_INTERFACE_NAME} inet static\n"));
    out.push_str(&format!(
        "    pre-up ip link add {DUMMY_INTERFACE_NAME} type dummy || true\n"
    ));
    out.push_str(&format!("    address {}/32\n", spec.loopback_address));
    out.push_str(&format!(
        "    post-down ip link del {DUMMY_INTERFACE_NAME} || true\n"
    ));

    for link in &spec.links {
        let iface = &link.interface_name;
        out.push('\n');
        out.push_str(&format!("auto {iface}\n"));
        out.push_str(&format!("iface {iface} inet manual\n"));
        out.push_str(&format!("    pre-up ip link add {iface} type wireguard || true\n"));
        out.push_str(&format!(
            "    up ip addr add {}/31 dev {iface}\n",
            link.local_address
        ));
        out.push_str(&format!(
            "    up wg setconf {iface} /etc/wireguard/{iface}.conf\n"
        ));
        out.push_str(&format!("    post-down ip link del {iface} || true\n"));
    }

    out
}

fn render_frr(spec: &BundleSpec) -> String {
    let is_worker = matches!(spec.role, NodeRole::Worker);

    let mut out = String::new();
    out.push_str("frr version 9\n");
    out.push_str("frr defaults traditional\n");
    out.push_str(&format!("hostname {}\n", spec.hostname));
    out.push_str("log syslog informational\n");
    if is_worker {
        out.push_str("no ip forwarding\n");
    }
    out.push_str("no ipv6 forwarding\n");
    out.push_str("service integrated-vtysh-config\n");
    out.push('\n');

    if is_worker {
        out.push_str("route-map RM_SET_SRC permit 10\n");
        out.push_str(&format!(" set src {}\n", spec.loopback_address));
        out.push_str("!\n\n");
    }

    out.push_str(&format!("interface {DUMMY_INTERFACE_NAME}\n"));
    out.push_str(&format!(" ip ospf area {}\n", spec.ospf_area));
    out.push_str(" no ip ospf passive\n");
    out.push_str("!\n");

    for link in &spec.links {
        out.push_str(&format!("interface {}\n", link.interface_name));
        out.push_str(&format!(" ip ospf area {}\n", spec.ospf_area));
        out.push_str(&format!(" ip ospf cost {}\n", link.ospf_cost));
        if spec.ospf_hello_interval > 0 {
            out.push_str(&format!(" ip ospf dead-interval {}\n", spec.ospf_dead_interval));
            out.push_str(&format!(" ip ospf hello-interval {}\n", spec.ospf_hello_interval));
        }
        out.push_str(" ip ospf network point-to-point\n");
        out.push_str(" ip ospf prefix-suppression\n");
        out.push_str(" no ip ospf passive\n");
        out.push_str("!\n");
    }
    out.push('\n');

    out.push_str("router ospf\n");
    out.push_str(&format!(" ospf router-id {}\n", spec.loopback_address));
    if is_worker {
        out.push_str(" log-adjacency-changes\n");
        out.push_str(" max-metric router-lsa administrative\n");
    }
    out.push_str(" passive-interface default\n");
    out.push_str("!\n");

    if is_worker {
        out.push('\n');
        out.push_str("ip protocol ospf route-map RM_SET_SRC\n");
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_spec() -> BundleSpec {
        BundleSpec {
            hostname: "worker-1".into(),
            role: NodeRole::Worker,
            hub_number: None,
            loopback_address: "10.255.0.5".parse().unwrap(),
            links: vec![PeerLink {
                interface_name: "wg-hub1".into(),
                listen_port: 52001,
                local_address: "10.254.0.3".parse().unwrap(),
                peer_public_key: WgPublicKey::empty(),
                peer_endpoint: Some("198.51.100.10:52000".into()),
                allowed_ips: worker_to_hub_allowed_ips(
                    "10.255.0.1".parse().unwrap(),
                    "10.254.0.2/31",
                    "10.255.0.0/24",
                ),
                keepalive: false,
                ospf_cost: 10,
            }],
            ospf_area: 10,
            ospf_hello_interval: 1,
            ospf_dead_interval: 3,
        }
    }

    #[test]
    fn dummy_interface_has_no_cost_and_is_not_passive() {
        let spec = sample_spec();
        let frr = render_frr(&spec);
        let dummy_block = frr.split("!\n").next().unwrap();
        assert!(dummy_block.contains(&format!("interface {DUMMY_INTERFACE_NAME}")));
        assert!(!dummy_block.contains("ip ospf cost"));
        assert!(dummy_block.contains("no ip ospf passive"));
    }

    #[test]
    fn link_interface_orders_dead_interval_before_hello_interval() {
        let spec = sample_spec();
        let frr = render_frr(&spec);
        let dead_pos = frr.find("dead-interval").unwrap();
        let hello_pos = frr.find("hello-interval").unwrap();
        assert!(dead_pos < hello_pos);
    }

    #[test]
    fn worker_max_metric_is_administrative() {
        let spec = sample_spec();
        let frr = render_frr(&spec);
        assert!(frr.contains("max-metric router-lsa administrative"));
        assert!(!frr.contains("on-startup"));
    }

    #[test]
    fn worker_frr_includes_route_map_and_no_forwarding() {
        let spec = sample_spec();
        let frr = render_frr(&spec);
        assert!(frr.contains("no ip forwarding"));
        assert!(frr.contains("route-map RM_SET_SRC"));
        assert!(frr.contains("ip protocol ospf route-map RM_SET_SRC"));
    }

    #[test]
    fn hub_frr_omits_route_map() {
        let mut spec = sample_spec();
        spec.role = NodeRole::Hub;
        spec.hub_number = Some(1);
        let frr = render_frr(&spec);
        assert!(!frr.contains("route-map"));
        assert!(!frr.contains("no ip forwarding"));
    }

    #[test]
    fn frr_has_one_stanza_per_link_interface() {
        let mut spec = sample_spec();
        spec.links.push(PeerLink {
            interface_name: "wg-hub2".into(),
            listen_port: 53001,
            local_address: "10.254.0.5".parse().unwrap(),
            peer_public_key: WgPublicKey::empty(),
            peer_endpoint: Some("198.51.100.11:53000".into()),
            allowed_ips: hub_to_hub_allowed_ips("10.253.0.4/31", "10.255.0.0/24"),
            keepalive: false,
            ospf_cost: 10,
        });
        let frr = render_frr(&spec);
        assert_eq!(frr.matches("interface wg-hub1").count(), 1);
        assert_eq!(frr.matches("interface wg-hub2").count(), 1);
    }

    #[test]
    fn interfaces_config_lists_dummy_before_tunnels() {
        let spec = sample_spec();
        let cfg = render_interfaces(&spec);
        let dummy_pos = cfg.find(DUMMY_INTERFACE_NAME).unwrap();
        let tunnel_pos = cfg.find("wg-hub1").unwrap();
        assert!(dummy_pos < tunnel_pos);
    }

    #[test]
    fn wireguard_configs_keyed_by_interface_name() {
        let spec = sample_spec();
        let bundle = render_bundle(&spec);
        assert!(bundle.wireguard_configs.contains_key("wg-hub1"));
        assert!(bundle.wireguard_configs["wg-hub1"].contains("PRIVATE_KEY_PLACEHOLDER"));
    }

    #[test]
    fn bundle_fingerprint_is_stable_for_same_spec() {
        let spec = sample_spec();
        let a = render_bundle(&spec);
        let b = render_bundle(&spec);
        assert_eq!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn hub_to_worker_allowed_ips_omits_loopback_pool() {
        let ips = hub_to_worker_allowed_ips("10.255.0.2".parse().unwrap(), "10.254.0.2/31");
        assert_eq!(ips, vec!["10.255.0.2/32", "10.254.0.2/31", OSPF_MULTICAST_ALLOWED_IP]);
    }

    #[test]
    fn worker_to_hub_allowed_ips_includes_loopback_pool() {
        let ips = worker_to_hub_allowed_ips(
            "10.255.0.1".parse().unwrap(),
            "10.254.0.2/31",
            "10.255.0.0/24",
        );
        assert_eq!(
            ips,
            vec!["10.255.0.1/32", "10.254.0.2/31", "10.255.0.0/24", OSPF_MULTICAST_ALLOWED_IP]
        );
    }

    #[test]
    fn bundle_fingerprint_changes_when_peer_changes() {
        let spec = sample_spec();
        let mut spec2 = spec.clone();
        spec2.links[0].peer_endpoint = Some("198.51.100.11:52000".into());
        let a = render_bundle(&spec);
        let b = render_bundle(&spec2);
        assert_ne!(a.fingerprint, b.fingerprint);
    }
}
