//! Database schema of the keel tables.

/// Per-stream row locked while a unit of work writes to the stream.
pub const CREATE_STREAMS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS keel_streams (
    aggregate_root_name VARCHAR(255) NOT NULL,
    aggregate_root_id   VARCHAR(255) NOT NULL,
    current_version     BIGINT NOT NULL DEFAULT 0,
    PRIMARY KEY (aggregate_root_name, aggregate_root_id)
);
";

/// Event streams.
pub const CREATE_EVENTS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS keel_events (
    aggregate_root_name VARCHAR(255) NOT NULL,
    aggregate_root_id   VARCHAR(255) NOT NULL,
    version             BIGINT NOT NULL CHECK (version > 0),
    name                VARCHAR(255) NOT NULL,
    data                JSONB NOT NULL,
    occurred_time       TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (aggregate_root_name, aggregate_root_id, version)
);
";

/// Snapshots, at most one per stream and version.
pub const CREATE_SNAPSHOTS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS keel_snapshots (
    aggregate_root_name VARCHAR(255) NOT NULL,
    aggregate_root_id   VARCHAR(255) NOT NULL,
    version             BIGINT NOT NULL,
    name                VARCHAR(255) NOT NULL,
    data                JSONB NOT NULL,
    created_time        TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (aggregate_root_name, aggregate_root_id, version)
);
";

/// Which endpoint receives which message type.
pub const CREATE_SUBSCRIPTIONS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS keel_subscriptions (
    message_type VARCHAR(512) NOT NULL,
    queue        VARCHAR(255) NOT NULL,
    machine      VARCHAR(255) NOT NULL,
    PRIMARY KEY (message_type, queue, machine)
);
";

/// Known input queues.
pub const CREATE_QUEUES_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS keel_queues (
    queue   VARCHAR(255) NOT NULL,
    machine VARCHAR(255) NOT NULL,
    PRIMARY KEY (queue, machine)
);
";

/// Messages waiting in a queue, received in `seq` order.
pub const CREATE_MESSAGES_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS keel_messages (
    seq           BIGSERIAL PRIMARY KEY,
    id            UUID NOT NULL UNIQUE,
    queue         VARCHAR(255) NOT NULL,
    machine       VARCHAR(255) NOT NULL,
    headers       JSONB NOT NULL,
    body          BYTEA NOT NULL,
    reply_to      VARCHAR(512),
    recoverable   BOOLEAN NOT NULL,
    enqueued_time TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_keel_messages_queue
    ON keel_messages (queue, machine, seq);
";

/// Every statement, in creation order.
pub const ALL: &[&str] = &[
    CREATE_STREAMS_TABLE,
    CREATE_EVENTS_TABLE,
    CREATE_SNAPSHOTS_TABLE,
    CREATE_SUBSCRIPTIONS_TABLE,
    CREATE_QUEUES_TABLE,
    CREATE_MESSAGES_TABLE,
];
