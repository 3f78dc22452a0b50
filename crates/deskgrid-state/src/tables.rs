//! redb table definitions for the deskgrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Shape shared by every table: string key, JSON value.
pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Server records keyed by `{server_id}`.
pub const SERVERS: JsonTable = TableDefinition::new("servers");

/// Workspace health records keyed by `{container_id}`.
pub const WORKSPACES: JsonTable = TableDefinition::new("workspaces");
