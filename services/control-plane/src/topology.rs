//! Assembles a node's [`crate::config_bundle::BundleSpec`] from the current
//! state of the data model: who its peers are, what `/31` each link uses,
//! and which port the hub side of each worker link listens on.
//!
//! Nothing here is persisted beyond the link/address allocations IPAM
//! already owns; the peer list itself is recomputed on every call so it
//! always reflects the current roster (a decommissioned worker simply stops
//! appearing).

use gluon_id::NodeId;
use gluon_networking::WgPublicKey;
use sqlx::PgPool;

use crate::config_bundle::{hub_to_hub_allowed_ips, hub_to_worker_allowed_ips, worker_to_hub_allowed_ips, BundleSpec, PeerLink};
use crate::ipam::{self, IpamError};
use crate::models::{DeploymentSettingsRow, NodeRole, NodeRow, NodeStatus};

/// Looks up the public key a peer has uploaded for one of its own WireGuard
/// interfaces. Keys are per-interface (mirrors the agent's
/// `wg-keys-state.json`), so the caller names the exact interface on the
/// peer's side that terminates this link, not just "the peer's key".
fn peer_key_for_interface(node: &NodeRow, interface_name: &str) -> WgPublicKey {
    node.wireguard_keys
        .as_ref()
        .and_then(|keys| keys.get(interface_name))
        .and_then(|v| v.as_str())
        .and_then(|s| WgPublicKey::from_base64(s).ok())
        .unwrap_or_else(WgPublicKey::empty)
}

fn is_active(node: &NodeRow) -> bool {
    !matches!(node.status, NodeStatus::Decommissioned | NodeStatus::Maintenance)
}

pub async fn load_node(pool: &PgPool, node_id: i64) -> Result<Option<NodeRow>, IpamError> {
    let row = sqlx::query_as::<_, NodeRow>(
        r#"SELECT id, hostname, provider, os, role, status, hub_number, wireguard_keys,
                  public_address, reported_desired_role, kubernetes_joined_role,
                  last_heartbeat_at, last_heartbeat_snapshot, created_at, updated_at
           FROM nodes WHERE id = $1"#,
    )
    .bind(node_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Builds the full peer-link set for `node` and assembles its bundle spec.
pub async fn build_bundle_spec(
    pool: &PgPool,
    settings: &DeploymentSettingsRow,
    node: &NodeRow,
) -> Result<BundleSpec, IpamError> {
    let loopback_address = ipam::allocate_loopback_ip(pool, NodeId::new(node.id)).await?;

    let links = match node.role {
        NodeRole::Hub => build_hub_links(pool, settings, node).await?,
        NodeRole::Worker => build_worker_links(pool, settings, node).await?,
    };

    Ok(BundleSpec {
        hostname: node.hostname.clone(),
        role: node.role,
        hub_number: node.hub_number,
        loopback_address,
        links,
        ospf_area: settings.ospf_area as u32,
        ospf_hello_interval: settings.ospf_hello_interval as u32,
        ospf_dead_interval: settings.ospf_dead_interval as u32,
    })
}

/// Sanitizes a hostname into a usable WireGuard interface name: dots aren't
/// valid in `ip link` names, and interface names top out at 15 characters.
fn interface_name_for_peer(hostname: &str) -> String {
    let sanitized: String = hostname.chars().map(|c| if c == '.' { '-' } else { c }).collect();
    let name = format!("wg-{sanitized}");
    name.chars().take(15).collect()
}

async fn build_hub_links(
    pool: &PgPool,
    settings: &DeploymentSettingsRow,
    hub: &NodeRow,
) -> Result<Vec<PeerLink>, IpamError> {
    let hub_number = hub.hub_number.expect("hub has a hub_number once assigned");
    let mut links = Vec::new();

    let other_hubs: Vec<NodeRow> = sqlx::query_as(
        r#"SELECT id, hostname, provider, os, role, status, hub_number, wireguard_keys,
                  public_address, reported_desired_role, kubernetes_joined_role,
                  last_heartbeat_at, last_heartbeat_snapshot, created_at, updated_at
           FROM nodes WHERE role = 'hub' AND id != $1 AND hub_number IS NOT NULL"#,
    )
    .bind(hub.id)
    .fetch_all(pool)
    .await?;

    for peer_hub in other_hubs.into_iter().filter(is_active) {
        let peer_hub_number = peer_hub.hub_number.expect("peer hub has a hub_number");
        let alloc = ipam::allocate_hub_link(
            pool,
            NodeId::new(hub.id),
            hub_number,
            NodeId::new(peer_hub.id),
            peer_hub_number,
        )
        .await?;
        let (local_address, _) = side_addresses(hub.id, &alloc);
        let local_port = ipam::hub_mesh_listen_port(hub_number, peer_hub_number);
        let peer_port = ipam::hub_mesh_listen_port(peer_hub_number, hub_number);
        links.push(PeerLink {
            interface_name: interface_name_for_peer(&peer_hub.hostname),
            listen_port: local_port,
            local_address,
            peer_public_key: peer_key_for_interface(&peer_hub, &interface_name_for_peer(&hub.hostname)),
            peer_endpoint: peer_hub
                .public_address
                .as_ref()
                .map(|addr| format!("{addr}:{peer_port}")),
            allowed_ips: hub_to_hub_allowed_ips(&alloc.subnet_cidr, &settings.loopback_prefix),
            keepalive: false,
            ospf_cost: settings.hub_to_hub_cost as u32,
        });
    }

    let workers: Vec<NodeRow> = sqlx::query_as(
        r#"SELECT id, hostname, provider, os, role, status, hub_number, wireguard_keys,
                  public_address, reported_desired_role, kubernetes_joined_role,
                  last_heartbeat_at, last_heartbeat_snapshot, created_at, updated_at
           FROM nodes WHERE role = 'worker' AND hub_number = $1"#,
    )
    .bind(hub_number)
    .fetch_all(pool)
    .await?;

    for worker in workers.into_iter().filter(is_active) {
        let alloc = ipam::allocate_worker_link(
            pool,
            settings,
            NodeId::new(hub.id),
            hub_number,
            NodeId::new(worker.id),
        )
        .await?;
        let (local_address, _) = side_addresses(hub.id, &alloc);
        let listen_port = alloc
            .hub_listen_port
            .expect("hub-worker link allocations always carry a listen port") as u16;
        let worker_loopback = ipam::allocate_loopback_ip(pool, NodeId::new(worker.id)).await?;
        links.push(PeerLink {
            interface_name: interface_name_for_peer(&worker.hostname),
            listen_port,
            local_address,
            peer_public_key: peer_key_for_interface(&worker, &format!("wg-hub{hub_number}")),
            peer_endpoint: None,
            allowed_ips: hub_to_worker_allowed_ips(worker_loopback, &alloc.subnet_cidr),
            keepalive: true,
            ospf_cost: settings.hub_to_worker_cost as u32,
        });
    }

    Ok(links)
}

async fn build_worker_links(
    pool: &PgPool,
    settings: &DeploymentSettingsRow,
    worker: &NodeRow,
) -> Result<Vec<PeerLink>, IpamError> {
    let Some(hub_number) = worker.hub_number else {
        return Ok(Vec::new());
    };

    let Some(hub) = sqlx::query_as::<_, NodeRow>(
        r#"SELECT id, hostname, provider, os, role, status, hub_number, wireguard_keys,
                  public_address, reported_desired_role, kubernetes_joined_role,
                  last_heartbeat_at, last_heartbeat_snapshot, created_at, updated_at
           FROM nodes WHERE role = 'hub' AND hub_number = $1"#,
    )
    .bind(hub_number)
    .fetch_optional(pool)
    .await?
    else {
        return Ok(Vec::new());
    };

    let alloc = ipam::allocate_worker_link(
        pool,
        settings,
        NodeId::new(hub.id),
        hub_number,
        NodeId::new(worker.id),
    )
    .await?;
    let (_, local_address) = side_addresses(hub.id, &alloc);
    let hub_port = alloc
        .hub_listen_port
        .expect("hub-worker link allocations always carry a listen port") as u16;
    let hub_loopback = ipam::allocate_loopback_ip(pool, NodeId::new(hub.id)).await?;

    Ok(vec![PeerLink {
        interface_name: format!("wg-hub{hub_number}"),
        listen_port: ipam::worker_own_listen_port(hub_number),
        local_address,
        peer_public_key: peer_key_for_interface(&hub, &interface_name_for_peer(&worker.hostname)),
        peer_endpoint: hub
            .public_address
            .as_ref()
            .map(|addr| format!("{addr}:{hub_port}")),
        allowed_ips: worker_to_hub_allowed_ips(hub_loopback, &alloc.subnet_cidr, &settings.loopback_prefix),
        keepalive: false,
        ospf_cost: settings.worker_to_hub_cost as u32,
    }])
}

/// `link_allocations.hub_address`/`peer_address` are keyed by which node
/// requested the allocation first (`hub_node_id`/`peer_node_id`), not by
/// overlay role, so callers must resolve which address belongs to which
/// physical node id.
fn side_addresses(
    requesting_node_id: i64,
    alloc: &crate::models::LinkAllocationRow,
) -> (std::net::Ipv4Addr, std::net::Ipv4Addr) {
    use std::net::Ipv4Addr;
    use std::str::FromStr;
    let hub_addr = Ipv4Addr::from_str(&alloc.hub_address).expect("stored address is valid IPv4");
    let peer_addr = Ipv4Addr::from_str(&alloc.peer_address).expect("stored address is valid IPv4");
    if alloc.hub_node_id == requesting_node_id {
        (hub_addr, peer_addr)
    } else {
        (peer_addr, hub_addr)
    }
}
