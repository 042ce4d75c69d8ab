//! Short-TTL bidirectional map of link tokens to (uuid, mcName) (§4.C).
//!
//! Backed by `DashMap` rather than a single `Mutex<HashMap>` so login/join
//! threads, Discord command handlers, and any admin tooling can read and
//! write concurrently without serializing on one lock — the same shape the
//! pack's `twilight-cache-inmemory` uses for its guild/channel/user caches
//! (`other_examples/1a1ee6a6_...`).

use chrono::Utc;
use dashmap::DashMap;
use rand::RngCore;
use uuid::Uuid;

const TTL_MS: i64 = 30 * 60 * 1000;

#[derive(Debug, Clone)]
pub struct LinkTokenEntry {
	pub token: String,
	pub uuid: Uuid,
	pub mc_name: Option<String>,
	pub issued_at_epoch_ms: i64,
}

impl LinkTokenEntry {
	fn expires_at(&self) -> i64 {
		self.issued_at_epoch_ms + TTL_MS
	}
}

#[derive(Debug, Clone)]
pub struct LinkTokenInfo {
	pub token: String,
	pub uuid: Uuid,
	pub mc_name: Option<String>,
	pub issued_at_epoch_ms: i64,
	pub expires_in_ms: i64,
}

#[derive(Default)]
pub struct LinkTokenService {
	by_token: DashMap<String, LinkTokenEntry>,
	by_uuid: DashMap<Uuid, String>,
}

impl LinkTokenService {
	pub fn new() -> Self {
		Self::default()
	}

	fn now_ms() -> i64 {
		Utc::now().timestamp_millis()
	}

	/// Purges entries whose TTL has elapsed. Called before every public operation.
	fn cleanup_expired(&self) {
		let now = Self::now_ms();
		let expired: Vec<(Uuid, String)> = self
			.by_token
			.iter()
			.filter(|entry| entry.expires_at() < now)
			.map(|entry| (entry.uuid, entry.token.clone()))
			.collect();

		for (uuid, token) in expired {
			self.by_token.remove(&token);
			self.by_uuid.remove_if(&uuid, |_, existing| existing == &token);
		}
	}

	/// Issues (or reuses) a token for `uuid`. If a live entry exists and
	/// `mc_name` is `None` or unchanged, its token is returned unmodified; if
	/// the name changed, the entry is replaced in place (same token).
	pub fn issue_token(&self, uuid: Uuid, mc_name: Option<String>) -> String {
		self.cleanup_expired();

		if let Some(existing_token) = self.by_uuid.get(&uuid).map(|r| r.clone()) {
			if let Some(mut entry) = self.by_token.get_mut(&existing_token) {
				if mc_name.is_none() || entry.mc_name == mc_name {
					return entry.token.clone();
				}
				entry.mc_name = mc_name;
				return entry.token.clone();
			}
		}

		let token = generate_token();
		let entry = LinkTokenEntry {
			token: token.clone(),
			uuid,
			mc_name,
			issued_at_epoch_ms: Self::now_ms(),
		};
		self.by_uuid.insert(uuid, token.clone());
		self.by_token.insert(token.clone(), entry);
		token
	}

	/// Removes and returns the entry for `token`, if present and unexpired.
	pub fn consume(&self, token: &str) -> Option<LinkTokenEntry> {
		self.cleanup_expired();

		let (_, entry) = self.by_token.remove(token)?;
		self.by_uuid.remove_if(&entry.uuid, |_, existing| existing == token);
		Some(entry)
	}

	/// All live entries, sorted by ascending remaining TTL (clamped to ≥ 0).
	pub fn list_active(&self) -> Vec<LinkTokenInfo> {
		self.cleanup_expired();

		let now = Self::now_ms();
		let mut entries: Vec<LinkTokenInfo> = self
			.by_token
			.iter()
			.map(|entry| LinkTokenInfo {
				token: entry.token.clone(),
				uuid: entry.uuid,
				mc_name: entry.mc_name.clone(),
				issued_at_epoch_ms: entry.issued_at_epoch_ms,
				expires_in_ms: (entry.expires_at() - now).max(0),
			})
			.collect();

		entries.sort_by_key(|entry| entry.expires_in_ms);
		entries
	}
}

fn generate_token() -> String {
	let mut bytes = [0u8; 6];
	rand::rng().fill_bytes(&mut bytes);
	bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn issue_then_consume_round_trips() {
		let service = LinkTokenService::new();
		let uuid = Uuid::new_v4();
		let token = service.issue_token(uuid, Some("Steve".into()));
		assert_eq!(token.len(), 12);

		let entry = service.consume(&token).unwrap();
		assert_eq!(entry.uuid, uuid);
		assert_eq!(entry.mc_name.as_deref(), Some("Steve"));

		assert!(service.consume(&token).is_none());
	}

	#[test]
	fn issue_reuses_existing_token_for_same_name() {
		let service = LinkTokenService::new();
		let uuid = Uuid::new_v4();
		let t1 = service.issue_token(uuid, Some("Steve".into()));
		let t2 = service.issue_token(uuid, Some("Steve".into()));
		assert_eq!(t1, t2);
	}

	#[test]
	fn issue_updates_name_but_keeps_token() {
		let service = LinkTokenService::new();
		let uuid = Uuid::new_v4();
		let t1 = service.issue_token(uuid, Some("Steve".into()));
		let t2 = service.issue_token(uuid, Some("Alex".into()));
		assert_eq!(t1, t2);

		let entry = service.consume(&t1).unwrap();
		assert_eq!(entry.mc_name.as_deref(), Some("Alex"));
	}

	#[test]
	fn list_active_sorted_ascending_by_expiry() {
		let service = LinkTokenService::new();
		let a = service.issue_token(Uuid::new_v4(), None);
		let b = service.issue_token(Uuid::new_v4(), None);

		// force distinct issued_at so expiry ordering is deterministic
		if let Some(mut entry) = service.by_token.get_mut(&a) {
			entry.issued_at_epoch_ms -= 1000;
		}

		let active = service.list_active();
		assert_eq!(active.len(), 2);
		assert_eq!(active[0].token, a);
		assert_eq!(active[1].token, b);
	}
}
