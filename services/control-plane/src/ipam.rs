//! IP address management: pool seeding, loopback assignment, hub numbering,
//! and point-to-point link allocation.
//!
//! Pools are seeded lazily, addresses and hub numbers are assigned by
//! scanning for the first free value under a row lock, using
//! [`gluon_networking`]'s allocators instead of hand-rolled address
//! arithmetic.

use std::net::Ipv4Addr;
use std::str::FromStr;

use gluon_id::NodeId;
use gluon_networking::{Ipv4Allocator, Ipv4Prefix, LinkAllocator, LinkSubnet, NetworkError};
use sqlx::PgPool;
use thiserror::Error;

use crate::db::DbError;
use crate::models::{DeploymentSettingsRow, IpPoolPurpose, IpPoolRow, LinkAllocationRow, NodeRole};

#[derive(Debug, Error)]
pub enum IpamError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error("no hub numbers remain (all of 1..=3 are assigned)")]
    HubNumbersExhausted,
}

impl From<sqlx::Error> for IpamError {
    fn from(e: sqlx::Error) -> Self {
        IpamError::Db(e.into())
    }
}

/// Hub numbers are a small fixed set: the overlay's WireGuard listen-port
/// formula (`base + hub_number * 1000 + worker_id`) only has room for three
/// hubs before ports from different hubs could collide.
pub const HUB_NUMBERS: [i32; 3] = [1, 2, 3];

/// Loads the singleton deployment settings row.
pub async fn load_settings(pool: &PgPool) -> Result<DeploymentSettingsRow, IpamError> {
    let row = sqlx::query_as::<_, DeploymentSettingsRow>(
        r#"SELECT id, overlay_prefix, hub_to_hub_prefix, hub_worker_prefix_template,
                  loopback_prefix, wireguard_base_port, hub_to_hub_cost, hub_to_worker_cost,
                  worker_to_hub_cost, ospf_area, ospf_hello_interval, ospf_dead_interval,
                  updated_at
           FROM deployment_settings WHERE id = 1"#,
    )
    .fetch_one(pool)
    .await?;
    Ok(row)
}

/// Creates the loopback, hub-to-hub, and per-hub worker pools if they don't
/// already exist. Safe to call on every startup.
pub async fn ensure_default_pools(
    pool: &PgPool,
    settings: &DeploymentSettingsRow,
) -> Result<(), IpamError> {
    ensure_pool(pool, IpPoolPurpose::Loopback, None, &settings.loopback_prefix).await?;
    ensure_pool(
        pool,
        IpPoolPurpose::HubToHub,
        None,
        &settings.hub_to_hub_prefix,
    )
    .await?;

    for hub_number in HUB_NUMBERS {
        let cidr = settings
            .hub_worker_prefix_template
            .replace("{hub}", &hub_number.to_string());
        ensure_pool(pool, IpPoolPurpose::HubWorker, Some(hub_number), &cidr).await?;
    }

    Ok(())
}

async fn ensure_pool(
    pool: &PgPool,
    purpose: IpPoolPurpose,
    hub_number: Option<i32>,
    cidr: &str,
) -> Result<IpPoolRow, IpamError> {
    if let Some(existing) = sqlx::query_as::<_, IpPoolRow>(
        r#"
        SELECT id, purpose, hub_number, cidr, created_at
        FROM ip_pools
        WHERE purpose = $1 AND hub_number IS NOT DISTINCT FROM $2
        "#,
    )
    .bind(purpose)
    .bind(hub_number)
    .fetch_optional(pool)
    .await?
    {
        return Ok(existing);
    }

    let row = sqlx::query_as::<_, IpPoolRow>(
        r#"
        INSERT INTO ip_pools (purpose, hub_number, cidr)
        VALUES ($1, $2, $3)
        ON CONFLICT (purpose, hub_number) DO UPDATE SET cidr = ip_pools.cidr
        RETURNING id, purpose, hub_number, cidr, created_at
        "#,
    )
    .bind(purpose)
    .bind(hub_number)
    .bind(cidr)
    .fetch_one(pool)
    .await?;

    Ok(row)
}

/// Allocates (or returns the existing) loopback `/32` for a node from the
/// loopback pool.
pub async fn allocate_loopback_ip(pool: &PgPool, node_id: NodeId) -> Result<Ipv4Addr, IpamError> {
    if let Some(existing) = sqlx::query_scalar::<_, String>(
        r#"
        SELECT a.address
        FROM ip_allocations a
        JOIN ip_pools p ON p.id = a.pool_id
        WHERE p.purpose = 'loopback' AND a.node_id = $1
        "#,
    )
    .bind(node_id.value())
    .fetch_optional(pool)
    .await?
    {
        return Ok(Ipv4Addr::from_str(&existing).expect("stored address is valid IPv4"));
    }

    let pool_row = sqlx::query_as::<_, IpPoolRow>(
        r#"SELECT id, purpose, hub_number, cidr, created_at FROM ip_pools WHERE purpose = 'loopback'"#,
    )
    .fetch_one(pool)
    .await?;

    let taken: Vec<String> = sqlx::query_scalar(
        r#"SELECT address FROM ip_allocations WHERE pool_id = $1 FOR UPDATE"#,
    )
    .bind(pool_row.id)
    .fetch_all(pool)
    .await?;
    let taken: Vec<Ipv4Addr> = taken
        .iter()
        .map(|a| Ipv4Addr::from_str(a).expect("stored address is valid IPv4"))
        .collect();

    let prefix = Ipv4Prefix::from_cidr(&pool_row.cidr)?;
    let allocator = Ipv4Allocator::new(prefix);
    let address = allocator.allocate(&taken)?;

    sqlx::query(
        r#"INSERT INTO ip_allocations (pool_id, node_id, address) VALUES ($1, $2, $3)"#,
    )
    .bind(pool_row.id)
    .bind(node_id.value())
    .bind(address.to_string())
    .execute(pool)
    .await?;

    Ok(address)
}

/// Assigns the lowest free hub number (1, 2, or 3) to a hub node, scanning
/// hub nodes in ascending node-id order so the assignment is deterministic
/// regardless of arrival order.
pub async fn ensure_hub_number(pool: &PgPool, node_id: NodeId) -> Result<i32, IpamError> {
    if let Some(existing) = sqlx::query_scalar::<_, Option<i32>>(
        r#"SELECT hub_number FROM nodes WHERE id = $1"#,
    )
    .bind(node_id.value())
    .fetch_one(pool)
    .await?
    {
        return Ok(existing);
    }

    let assigned: Vec<i32> = sqlx::query_scalar(
        r#"
        SELECT hub_number FROM nodes
        WHERE role = 'hub' AND hub_number IS NOT NULL
        ORDER BY id
        FOR UPDATE
        "#,
    )
    .fetch_all(pool)
    .await?;

    let hub_number = HUB_NUMBERS
        .into_iter()
        .find(|n| !assigned.contains(n))
        .ok_or(IpamError::HubNumbersExhausted)?;

    sqlx::query(r#"UPDATE nodes SET hub_number = $2 WHERE id = $1"#)
        .bind(node_id.value())
        .bind(hub_number)
        .execute(pool)
        .await?;

    Ok(hub_number)
}

/// The hub-side listen port for a given worker's link to its hub: each
/// worker on a hub gets a distinct port so the hub's per-link WireGuard
/// interfaces don't collide, derived from the worker's 1-based ordinal
/// among that hub's existing links.
pub fn worker_listen_port(
    settings: &DeploymentSettingsRow,
    hub_number: i32,
    worker_ordinal: i64,
) -> Result<u16, IpamError> {
    if !(1..1000).contains(&worker_ordinal) {
        return Err(IpamError::Network(NetworkError::PortSpaceExhausted {
            hub_number,
            worker_id: worker_ordinal,
        }));
    }
    let port = settings.wireguard_base_port as i64 + (hub_number as i64 - 1) * 1000 + worker_ordinal;
    Ok(port as u16)
}

/// The port a hub listens on for its link to one specific other hub: a
/// distinct, direction-sensitive port per ordered pair so two hubs' mesh
/// links never collide with each other or with any worker-link port range.
pub fn hub_mesh_listen_port(local_hub: i32, remote_hub: i32) -> u16 {
    (51820 + local_hub * 10 + remote_hub) as u16
}

/// The port a worker's own WireGuard interface listens on for its link to
/// its hub (the worker dials out, so this just needs to be stable, not
/// reachable from outside).
pub fn worker_own_listen_port(hub_number: i32) -> u16 {
    (51820 + hub_number - 1) as u16
}

/// Allocates a `/31` link between a worker and the hub it's assigned to,
/// reusing any existing allocation for the pair. Also assigns and persists
/// the hub-side listen port for the link.
pub async fn allocate_worker_link(
    pool: &PgPool,
    settings: &DeploymentSettingsRow,
    hub_node_id: NodeId,
    hub_number: i32,
    worker_node_id: NodeId,
) -> Result<LinkAllocationRow, IpamError> {
    allocate_link_with_port(
        pool,
        IpPoolPurpose::HubWorker,
        Some(hub_number),
        hub_node_id,
        worker_node_id,
        PortAssignment::PerWorkerOrdinal(settings, hub_number),
    )
    .await
}

/// Allocates a `/31` link between two hubs (the hub-to-hub mesh). The
/// hub-side listen port recorded on the allocation is `node_a`'s (the
/// mesh link has no single "hub side", but a port still needs to be
/// persisted for reuse, so we fix it to the first-named hub's).
pub async fn allocate_hub_link(
    pool: &PgPool,
    hub_a: NodeId,
    hub_a_number: i32,
    hub_b: NodeId,
    hub_b_number: i32,
) -> Result<LinkAllocationRow, IpamError> {
    allocate_link_with_port(
        pool,
        IpPoolPurpose::HubToHub,
        None,
        hub_a,
        hub_b,
        PortAssignment::Fixed(hub_mesh_listen_port(hub_a_number, hub_b_number)),
    )
    .await
}

/// How to derive the `hub_listen_port` recorded on a new link allocation.
enum PortAssignment<'a> {
    /// Hub-to-hub links: the port only depends on the two hub numbers, so
    /// it's computed up front by the caller.
    Fixed(u16),
    /// Hub-worker links: the port depends on this worker's ordinal among
    /// the hub's existing links, so it must be computed under the same
    /// row lock that serializes allocation of that ordinal.
    PerWorkerOrdinal(&'a DeploymentSettingsRow, i32),
}

async fn allocate_link_with_port(
    pool: &PgPool,
    purpose: IpPoolPurpose,
    hub_number: Option<i32>,
    node_a: NodeId,
    node_b: NodeId,
    port_assignment: PortAssignment<'_>,
) -> Result<LinkAllocationRow, IpamError> {
    // Hub-to-hub links are requested from either hub's perspective (whichever
    // hub's bundle is being built calls this with itself first), so the pair
    // must be looked up regardless of which side was named first or the same
    // link gets allocated twice under two different node orderings.
    if let Some(existing) = sqlx::query_as::<_, LinkAllocationRow>(
        r#"
        SELECT id, pool_id, hub_node_id, peer_node_id, subnet_cidr, hub_address, peer_address,
               hub_listen_port, created_at
        FROM link_allocations
        WHERE (hub_node_id = $1 AND peer_node_id = $2) OR (hub_node_id = $2 AND peer_node_id = $1)
        "#,
    )
    .bind(node_a.value())
    .bind(node_b.value())
    .fetch_optional(pool)
    .await?
    {
        return Ok(existing);
    }

    let pool_row = sqlx::query_as::<_, IpPoolRow>(
        r#"SELECT id, purpose, hub_number, cidr, created_at FROM ip_pools
           WHERE purpose = $1 AND hub_number IS NOT DISTINCT FROM $2"#,
    )
    .bind(purpose)
    .bind(hub_number)
    .fetch_one(pool)
    .await?;

    let taken_rows: Vec<(String, String)> = sqlx::query_as(
        r#"SELECT hub_address, peer_address FROM link_allocations WHERE pool_id = $1 FOR UPDATE"#,
    )
    .bind(pool_row.id)
    .fetch_all(pool)
    .await?;
    let existing_count = taken_rows.len() as i64;
    let taken: Vec<LinkSubnet> = taken_rows
        .iter()
        .map(|(a, b)| LinkSubnet {
            lower: Ipv4Addr::from_str(a).expect("stored address is valid IPv4"),
            higher: Ipv4Addr::from_str(b).expect("stored address is valid IPv4"),
        })
        .collect();

    let prefix = Ipv4Prefix::from_cidr(&pool_row.cidr)?;
    let allocator = LinkAllocator::new(prefix);
    let link = allocator.allocate(&taken)?;

    let hub_listen_port = match port_assignment {
        PortAssignment::Fixed(port) => Some(port as i32),
        PortAssignment::PerWorkerOrdinal(settings, hub_number) => {
            Some(worker_listen_port(settings, hub_number, existing_count + 1)? as i32)
        }
    };

    let row = sqlx::query_as::<_, LinkAllocationRow>(
        r#"
        INSERT INTO link_allocations
            (pool_id, hub_node_id, peer_node_id, subnet_cidr, hub_address, peer_address, hub_listen_port)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING id, pool_id, hub_node_id, peer_node_id, subnet_cidr, hub_address, peer_address,
                  hub_listen_port, created_at
        "#,
    )
    .bind(pool_row.id)
    .bind(node_a.value())
    .bind(node_b.value())
    .bind(link.cidr())
    .bind(link.lower.to_string())
    .bind(link.higher.to_string())
    .bind(hub_listen_port)
    .fetch_one(pool)
    .await?;

    Ok(row)
}

/// Whether a node's role requires a hub number.
pub fn role_requires_hub_number(role: NodeRole) -> bool {
    matches!(role, NodeRole::Hub)
}

#[cfg(test)]
mod port_tests {
    use super::*;

    fn settings() -> DeploymentSettingsRow {
        DeploymentSettingsRow {
            id: 1,
            overlay_prefix: "10.255.0.0/16".into(),
            hub_to_hub_prefix: "10.253.0.0/20".into(),
            hub_worker_prefix_template: "10.254.{hub}.0/24".into(),
            loopback_prefix: "10.255.0.0/24".into(),
            wireguard_base_port: 52000,
            hub_to_hub_cost: 10,
            hub_to_worker_cost: 10,
            worker_to_hub_cost: 10,
            ospf_area: 10,
            ospf_hello_interval: 1,
            ospf_dead_interval: 3,
            updated_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn worker_listen_port_follows_formula() {
        let s = settings();
        assert_eq!(worker_listen_port(&s, 1, 1).unwrap(), 52001);
        assert_eq!(worker_listen_port(&s, 2, 1).unwrap(), 53001);
    }

    #[test]
    fn worker_listen_port_exhausts_at_1000() {
        let s = settings();
        assert!(matches!(
            worker_listen_port(&s, 1, 1000),
            Err(IpamError::Network(NetworkError::PortSpaceExhausted { .. }))
        ));
    }

    #[test]
    fn hub_mesh_port_is_asymmetric_per_ordered_pair() {
        assert_eq!(hub_mesh_listen_port(1, 2), 51832);
        assert_eq!(hub_mesh_listen_port(2, 1), 51841);
        assert_ne!(hub_mesh_listen_port(1, 2), hub_mesh_listen_port(2, 1));
    }

    #[test]
    fn worker_own_listen_port_depends_only_on_hub_number() {
        assert_eq!(worker_own_listen_port(1), 51820);
        assert_eq!(worker_own_listen_port(2), 51821);
    }
}
