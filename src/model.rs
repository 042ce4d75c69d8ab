//! Value types for the durable cache: players, audit events, and whitelist
//! applications. Mutation is always "produce a replacement record and
//! upsert" — nothing here is mutated in place once stored.

use serde::{
	Deserialize,
	Serialize,
};
use uuid::Uuid;

/// A player's linkage and access state, keyed by game UUID in the cache store.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlayerRecord {
	#[serde(rename = "discordId")]
	pub discord_id: Option<u64>,

	#[serde(rename = "hasAccess")]
	pub has_access: Option<bool>,

	#[serde(rename = "isAdmin", default)]
	pub is_admin: bool,

	#[serde(rename = "mcName")]
	pub mc_name: Option<String>,

	#[serde(rename = "discordName")]
	pub discord_name: Option<String>,

	#[serde(rename = "discordNick")]
	pub discord_nick: Option<String>,

	#[serde(rename = "banReason")]
	pub ban_reason: Option<String>,

	#[serde(rename = "banUntilEpochMillis")]
	pub ban_until_epoch_ms: Option<i64>,

	#[serde(rename = "warnCount", default)]
	pub warn_count: u32,
}

impl PlayerRecord {
	/// True if `ban_until_epoch_ms > now`, or the ban is permanent (no
	/// `until` but a reason is set). See DESIGN.md's open-question decision.
	pub fn is_banned_at(&self, now_epoch_ms: i64) -> bool {
		match (self.ban_reason.as_ref(), self.ban_until_epoch_ms) {
			(Some(_), None) => true,
			(Some(_), Some(until)) => until > now_epoch_ms,
			(None, _) => false,
		}
	}
}

/// The enumerated audit event kinds (§3 EventEntry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
	Link,
	WhitelistAdd,
	WhitelistRemove,
	ApplySubmit,
	ApplyApprove,
	ApplyDeny,
	Warn,
	Ban,
	Unban,
	Comment,
	FirstAllow,
	FirstLegacyKick,
}

/// An append-only audit record. Never mutated once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEntry {
	#[serde(rename = "type")]
	pub kind: EventKind,

	#[serde(rename = "targetUuid")]
	pub target_uuid: Option<String>,

	#[serde(rename = "targetDiscordId")]
	pub target_discord_id: Option<u64>,

	#[serde(rename = "actorDiscordId")]
	pub actor_discord_id: Option<u64>,

	pub message: Option<String>,

	#[serde(rename = "untilEpochMillis")]
	pub until_epoch_ms: Option<i64>,

	#[serde(rename = "atEpochMillis")]
	pub at_epoch_ms: i64,
}

impl EventEntry {
	pub fn new(kind: EventKind, at_epoch_ms: i64) -> Self {
		Self {
			kind,
			target_uuid: None,
			target_discord_id: None,
			actor_discord_id: None,
			message: None,
			until_epoch_ms: None,
			at_epoch_ms,
		}
	}

	pub fn with_target_uuid(mut self, uuid: Uuid) -> Self {
		self.target_uuid = Some(uuid.to_string());
		self
	}

	pub fn with_target_discord_id(mut self, id: u64) -> Self {
		self.target_discord_id = Some(id);
		self
	}

	pub fn with_actor(mut self, actor: Option<u64>) -> Self {
		self.actor_discord_id = actor;
		self
	}

	pub fn with_message(mut self, message: impl Into<String>) -> Self {
		self.message = Some(message.into());
		self
	}

	pub fn with_until(mut self, until_epoch_ms: Option<i64>) -> Self {
		self.until_epoch_ms = until_epoch_ms;
		self
	}
}

/// Workflow status for a `WhitelistApplication`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
	Pending,
	Approved,
	Denied,
}

/// A whitelist application submitted via `/whitelist apply`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhitelistApplication {
	pub id: String,

	#[serde(rename = "discordId")]
	pub discord_id: u64,

	#[serde(rename = "mcName")]
	pub mc_name: String,

	#[serde(rename = "resolvedUuid")]
	pub resolved_uuid: Option<String>,

	pub status: ApplicationStatus,

	pub reason: Option<String>,

	#[serde(rename = "submittedAtEpochMillis")]
	pub submitted_at_epoch_ms: i64,

	#[serde(rename = "decidedAtEpochMillis")]
	pub decided_at_epoch_ms: Option<i64>,

	#[serde(rename = "decidedByDiscordId")]
	pub decided_by_discord_id: Option<u64>,
}

impl WhitelistApplication {
	pub fn new(id: String, discord_id: u64, mc_name: String, resolved_uuid: Option<String>, submitted_at_epoch_ms: i64) -> Self {
		Self {
			id,
			discord_id,
			mc_name,
			resolved_uuid,
			status: ApplicationStatus::Pending,
			reason: None,
			submitted_at_epoch_ms,
			decided_at_epoch_ms: None,
			decided_by_discord_id: None,
		}
	}

	/// Transitions out of `pending`. Returns `false` (no-op) if already decided.
	fn decide(&mut self, status: ApplicationStatus, actor_discord_id: u64, reason: Option<String>, now_epoch_ms: i64) -> bool {
		if self.status != ApplicationStatus::Pending {
			return false;
		}
		self.status = status;
		self.reason = reason;
		self.decided_at_epoch_ms = Some(now_epoch_ms);
		self.decided_by_discord_id = Some(actor_discord_id);
		true
	}

	pub fn approve(&mut self, actor_discord_id: u64, reason: Option<String>, now_epoch_ms: i64) -> bool {
		self.decide(ApplicationStatus::Approved, actor_discord_id, reason, now_epoch_ms)
	}

	pub fn deny(&mut self, actor_discord_id: u64, reason: Option<String>, now_epoch_ms: i64) -> bool {
		self.decide(ApplicationStatus::Denied, actor_discord_id, reason, now_epoch_ms)
	}
}

/// The full on-disk cache-file shape (§6 External Interfaces).
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CacheFile {
	#[serde(default)]
	pub players: std::collections::HashMap<String, PlayerRecord>,

	#[serde(default)]
	pub events: Vec<EventEntry>,

	#[serde(default)]
	pub applications: Vec<WhitelistApplication>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn permanent_ban_has_no_until() {
		let mut rec = PlayerRecord::default();
		rec.ban_reason = Some("Griefing".into());
		assert!(rec.is_banned_at(i64::MAX));
	}

	#[test]
	fn expired_ban_is_not_active() {
		let mut rec = PlayerRecord::default();
		rec.ban_reason = Some("Griefing".into());
		rec.ban_until_epoch_ms = Some(1000);
		assert!(!rec.is_banned_at(2000));
		assert!(rec.is_banned_at(500));
	}

	#[test]
	fn application_double_decision_rejected() {
		let mut app = WhitelistApplication::new("id".into(), 1, "Name".into(), None, 0);
		assert!(app.approve(99, None, 10));
		assert!(!app.approve(99, None, 20));
		assert_eq!(app.decided_at_epoch_ms, Some(10));
	}
}
