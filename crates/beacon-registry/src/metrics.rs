//! Metric names recorded through the `metrics` facade.
//!
//! Installing a recorder/exporter is left to the host process.

/// Live clients in the registry (gauge).
pub const CLIENTS_ACTIVE: &str = "beacon_clients_active";
/// Clients inserted (counter).
pub const CLIENTS_ADDED_TOTAL: &str = "beacon_clients_added_total";
/// Clients removed by `remove` or `close` (counter).
pub const CLIENTS_REMOVED_TOTAL: &str = "beacon_clients_removed_total";
/// Clients displaced by a duplicate id (counter).
pub const CLIENTS_EVICTED_TOTAL: &str = "beacon_clients_evicted_total";
/// Broadcast messages a client could not accept (counter).
pub const BROADCAST_DROPS_TOTAL: &str = "beacon_broadcast_drops_total";
