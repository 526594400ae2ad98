//! Protocol constants and defaults.
//!
//! Command names in the `std.` namespace are reserved by the hub.

// =============================================================================
// STANDARD COMMANDS
// =============================================================================

/// Echo the given parameter back to the caller.
pub const STD_ECHO: &str = "std.Echo";

/// Return details about the connected client.
pub const STD_CLIENT: &str = "std.Client";

/// Prefix reserved for hub commands.
pub const STD_PREFIX: &str = "std.";

// =============================================================================
// ENTITY DEFAULTS
// =============================================================================

/// Default name of the primary key field of an entity.
pub const DEFAULT_KEY_FIELD: &str = "id";

/// Filter expression matching every entity of a container.
pub const FILTER_ALL: &str = "true";

/// Default database addressed when no database is configured.
pub const DEFAULT_DATABASE: &str = "main_db";

// =============================================================================
// LIMITS
// =============================================================================

/// Upper bound for keys reserved by a single `ReserveKeys` task.
pub const MAX_RESERVE_KEYS: u32 = 10_000;

/// Default maximum number of entities returned by a query page.
/// `None` in the config means "no limit".
pub const DEFAULT_MAX_QUERY_COUNT: Option<u32> = None;
