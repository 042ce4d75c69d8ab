//! Contract the core depends on for the Discord side (§4.E). The concrete
//! implementation lives in `discord_bridge.rs`; this module only fixes the
//! shape so the Decision Engine can be built and tested against a fake.
//!
//! Methods return boxed futures rather than using `async fn` directly: `Core`
//! holds this behind `Arc<dyn DiscordBridge>` so the bridge can be swapped
//! out wholesale on `reload_config`, and native `async fn` in a trait isn't
//! object-safe. Same shape as `audit::AuditDispatcher`.

use std::{
	collections::HashSet,
	future::Future,
	pin::Pin,
};

use miette::Result;

use crate::audit::AuditEntry;

/// Four-valued live role status. Keeping this a closed variant (rather than
/// a nullable bool, which the source's earlier iteration used and which
/// conflated `NotInGuild`/`MissingRole`) is called out explicitly in the
/// spec's DESIGN NOTES.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleStatus {
	HasRole,
	MissingRole,
	NotInGuild,
	Indeterminate,
}

/// What the core needs from the Discord side. Login/join threads only ever
/// call `check_whitelist_status`, and only within a bounded wall-clock
/// timeout — see §5.
pub trait DiscordBridge: Send + Sync {
	/// Live role-status query for `discord_id`, bounded by `timeout_ms`.
	/// Must map unknown-user and timeout conditions to `NotInGuild` /
	/// `Indeterminate` respectively rather than failing.
	fn check_whitelist_status(&self, discord_id: u64, timeout_ms: u64) -> Pin<Box<dyn Future<Output = RoleStatus> + Send + '_>>;

	/// Best-effort dispatch of an audit entry to the configured log channel.
	/// Failures must not propagate to the caller.
	fn audit_dispatch(&self, entry: AuditEntry) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Delivered by the bridge when a user's role set changes.
#[derive(Debug, Clone)]
pub struct RoleChangeNotification {
	pub discord_id: u64,
	pub roles: HashSet<u64>,
}

/// Delivered by the bridge when a user's display name or nickname changes.
#[derive(Debug, Clone)]
pub struct IdentityChangeNotification {
	pub discord_id: u64,
	pub new_name: Option<String>,
	pub new_nick: Option<String>,
}
