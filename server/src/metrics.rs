//! Server metrics.

use metriken::{Counter, Gauge, metric};

#[metric(
    name = "connections_accepted",
    description = "Total number of connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "connections_active",
    description = "Number of currently active connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(
    name = "connections_rejected",
    description = "Connections dropped at the connection limit"
)]
pub static CONNECTIONS_REJECTED: Counter = Counter::new();

#[metric(name = "commands_processed", description = "Total commands executed")]
pub static COMMANDS: Counter = Counter::new();

#[metric(name = "store_gets", description = "Total GET/MGET key lookups")]
pub static GETS: Counter = Counter::new();

#[metric(name = "store_sets", description = "Total SET/MSET key writes")]
pub static SETS: Counter = Counter::new();

#[metric(name = "store_deletes", description = "Total DEL key removals")]
pub static DELETES: Counter = Counter::new();

#[metric(name = "protocol_errors", description = "Total protocol parse errors")]
pub static PROTOCOL_ERRORS: Counter = Counter::new();
