//! Authoritative in-memory state plus a durable, debounced JSON snapshot (§4.D).
//!
//! The players map is a `DashMap` for lock-free concurrent reads/writes
//! (same rationale as `link_tokens.rs`). Events and applications are guarded
//! by short-held locks, per §5's "do not hold locks across I/O" rule. Saves
//! run on a single background worker task servicing an unbounded channel —
//! the save-coalescing shape mirrors the teacher's single background-worker
//! pattern for periodic persistence in `main.rs` ("start background worker to
//! periodically persist rate limiter state"), generalized here to debounce +
//! coalesce instead of a fixed interval.

use std::{
	collections::HashMap,
	path::{
		Path,
		PathBuf,
	},
	sync::Arc,
	time::Duration,
};

use miette::{
	IntoDiagnostic,
	Result,
	WrapErr,
};
use tokio::sync::{
	mpsc,
	oneshot,
	Mutex as TokioMutex,
};
use tracing::{
	error,
	info,
	warn,
};
use uuid::Uuid;

use crate::model::{
	CacheFile,
	EventEntry,
	PlayerRecord,
	WhitelistApplication,
};

const SAVE_DEBOUNCE: Duration = Duration::from_millis(200);

struct Shared {
	players: dashmap::DashMap<Uuid, PlayerRecord>,
	events: TokioMutex<Vec<EventEntry>>,
	applications: dashmap::DashMap<String, WhitelistApplication>,
}

enum SaveCommand {
	Enqueue(PathBuf),
	Fire(PathBuf),
	Flush(oneshot::Sender<()>),
}

pub struct CacheStore {
	shared: Arc<Shared>,
	save_tx: mpsc::UnboundedSender<SaveCommand>,
}

impl Default for CacheStore {
	fn default() -> Self {
		Self::new()
	}
}

impl CacheStore {
	pub fn new() -> Self {
		let shared = Arc::new(Shared {
			players: dashmap::DashMap::new(),
			events: TokioMutex::new(Vec::new()),
			applications: dashmap::DashMap::new(),
		});

		let (save_tx, save_rx) = mpsc::unbounded_channel();
		tokio::spawn(save_worker(shared.clone(), save_rx, save_tx.clone()));

		Self {
			shared,
			save_tx,
		}
	}

	// -- players --------------------------------------------------------

	pub fn get(&self, uuid: &Uuid) -> Option<PlayerRecord> {
		self.shared.players.get(uuid).map(|r| r.clone())
	}

	/// Replaces the record for `uuid` atomically. Maintains the "at most one
	/// record per non-null discordId" invariant by detaching any other
	/// record that currently holds the incoming `discord_id`.
	pub fn upsert(&self, uuid: Uuid, record: PlayerRecord) {
		if let Some(discord_id) = record.discord_id {
			let collision = self
				.shared
				.players
				.iter()
				.find(|entry| *entry.key() != uuid && entry.value().discord_id == Some(discord_id))
				.map(|entry| *entry.key());

			if let Some(other_uuid) = collision {
				if let Some(mut other) = self.shared.players.get_mut(&other_uuid) {
					other.discord_id = None;
				}
			}
		}

		self.shared.players.insert(uuid, record);
	}

	pub fn find_by_discord_id(&self, discord_id: u64) -> Option<(Uuid, PlayerRecord)> {
		self
			.shared
			.players
			.iter()
			.find(|entry| entry.value().discord_id == Some(discord_id))
			.map(|entry| (*entry.key(), entry.value().clone()))
	}

	/// Case-insensitive; returns the first hit. Collisions are undefined
	/// (iteration order of the underlying map), matching the source behavior.
	pub fn find_by_name(&self, name: &str) -> Option<(Uuid, PlayerRecord)> {
		let needle = name.to_ascii_lowercase();
		self
			.shared
			.players
			.iter()
			.find(|entry| entry.value().mc_name.as_deref().map(|n| n.to_ascii_lowercase()) == Some(needle.clone()))
			.map(|entry| (*entry.key(), entry.value().clone()))
	}

	pub fn snapshot(&self) -> HashMap<Uuid, PlayerRecord> {
		self.shared.players.iter().map(|entry| (*entry.key(), entry.value().clone())).collect()
	}

	// -- events -----------------------------------------------------------

	pub async fn append_event(&self, event: EventEntry) {
		let mut events = self.shared.events.lock().await;
		events.push(event);
	}

	pub async fn events_snapshot(&self) -> Vec<EventEntry> {
		self.shared.events.lock().await.clone()
	}

	// -- applications -------------------------------------------------------

	pub fn add_application(&self, app: WhitelistApplication) {
		self.shared.applications.insert(app.id.clone(), app);
	}

	/// Applies `mutator` to the stored application, returning the updated
	/// record, or `None` if the id is unknown or `mutator` reports failure.
	pub fn update_application<F>(&self, id: &str, mutator: F) -> Option<WhitelistApplication>
	where
		F: FnOnce(&mut WhitelistApplication) -> bool,
	{
		let mut entry = self.shared.applications.get_mut(id)?;
		if mutator(&mut entry) {
			Some(entry.clone())
		} else {
			None
		}
	}

	pub fn get_application(&self, id: &str) -> Option<WhitelistApplication> {
		self.shared.applications.get(id).map(|r| r.clone())
	}

	pub fn applications_snapshot(&self) -> Vec<WhitelistApplication> {
		let mut apps: Vec<WhitelistApplication> = self.shared.applications.iter().map(|entry| entry.value().clone()).collect();
		apps.sort_by_key(|app| app.submitted_at_epoch_ms);
		apps
	}

	// -- persistence --------------------------------------------------------

	/// Reads `cache_path`; on failure, tries `cache_path.bak`; if both fail,
	/// starts empty. Replaces all in-memory state.
	pub async fn load(&self, cache_path: impl AsRef<Path>) -> Result<()> {
		let cache_path = cache_path.as_ref();
		let backup_path = backup_path(cache_path);

		let primary = match tokio::fs::read_to_string(cache_path).await {
			Ok(content) => match serde_json::from_str(&content) {
				Ok(parsed) => Some(parsed),
				Err(err) => {
					warn!(error = %err, path = %cache_path.display(), "failed to parse cache file, trying backup");
					None
				},
			},
			Err(primary_err) => {
				warn!(error = %primary_err, path = %cache_path.display(), "failed to read cache file, trying backup");
				None
			},
		};

		let cache_file: CacheFile = match primary {
			Some(parsed) => parsed,
			None => match tokio::fs::read_to_string(&backup_path).await {
				Ok(content) => match serde_json::from_str(&content) {
					Ok(parsed) => parsed,
					Err(err) => {
						warn!(error = %err, path = %backup_path.display(), "failed to parse backup cache file, starting empty");
						CacheFile::default()
					},
				},
				Err(backup_err) => {
					warn!(error = %backup_err, path = %backup_path.display(), "failed to read backup cache file, starting empty");
					CacheFile::default()
				},
			},
		};

		self.shared.players.clear();
		for (uuid_str, record) in cache_file.players {
			if let Ok(uuid) = uuid_str.parse::<Uuid>() {
				self.shared.players.insert(uuid, record);
			} else {
				warn!(uuid = %uuid_str, "dropping cache entry with malformed uuid");
			}
		}

		self.shared.applications.clear();
		for app in &cache_file.applications {
			self.shared.applications.insert(app.id.clone(), app.clone());
		}

		*self.shared.events.lock().await = cache_file.events;

		info!(
			players = self.shared.players.len(),
			events = self.shared.events.lock().await.len(),
			applications = self.shared.applications.len(),
			"loaded cache store"
		);

		Ok(())
	}

	/// Rotates the primary file to `.bak` (if present) and writes a fresh
	/// snapshot. Reads a consistent copy first; no lock is held across I/O.
	pub async fn save(&self, cache_path: impl AsRef<Path>) -> Result<()> {
		do_save(&self.shared, cache_path.as_ref()).await
	}

	/// Schedules a save ~200ms out, coalescing with any save already pending.
	pub fn enqueue_save(&self, cache_path: impl AsRef<Path>) {
		let _ = self.save_tx.send(SaveCommand::Enqueue(cache_path.as_ref().to_path_buf()));
	}

	/// Waits for the in-flight (or about-to-run) save to finish. Returns
	/// `true` if it completed within `timeout_ms`, `false` on timeout. If no
	/// save is pending, returns `true` immediately.
	pub async fn flush_saves(&self, timeout_ms: u64) -> bool {
		let (tx, rx) = oneshot::channel();
		if self.save_tx.send(SaveCommand::Flush(tx)).is_err() {
			return false;
		}
		tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await.is_ok()
	}
}

fn backup_path(cache_path: &Path) -> PathBuf {
	let mut name = cache_path.as_os_str().to_os_string();
	name.push(".bak");
	PathBuf::from(name)
}

async fn do_save(shared: &Shared, cache_path: &Path) -> Result<()> {
	// copy-then-serialize: collect a consistent snapshot before touching the filesystem
	let players: HashMap<String, PlayerRecord> = shared
		.players
		.iter()
		.map(|entry| (entry.key().to_string(), entry.value().clone()))
		.collect();
	let events = shared.events.lock().await.clone();
	let applications: Vec<WhitelistApplication> = shared.applications.iter().map(|entry| entry.value().clone()).collect();

	let cache_file = CacheFile {
		players,
		events,
		applications,
	};

	if let Some(parent) = cache_path.parent() {
		tokio::fs::create_dir_all(parent)
			.await
			.into_diagnostic()
			.wrap_err("failed to create cache directory")?;
	}

	if tokio::fs::try_exists(cache_path).await.into_diagnostic().wrap_err("failed to stat cache file")? {
		tokio::fs::rename(cache_path, backup_path(cache_path))
			.await
			.into_diagnostic()
			.wrap_err("failed to rotate cache file to backup")?;
	}

	let json = serde_json::to_string_pretty(&cache_file)
		.into_diagnostic()
		.wrap_err("failed to serialize cache store")?;

	tokio::fs::write(cache_path, json)
		.await
		.into_diagnostic()
		.wrap_err("failed to write cache file")?;

	info!(
		players = cache_file.players.len(),
		events = cache_file.events.len(),
		applications = cache_file.applications.len(),
		"saved cache store"
	);

	Ok(())
}

async fn save_worker(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<SaveCommand>, tx: mpsc::UnboundedSender<SaveCommand>) {
	let mut armed = false;
	let mut pending_flushes: Vec<oneshot::Sender<()>> = Vec::new();

	while let Some(cmd) = rx.recv().await {
		match cmd {
			SaveCommand::Enqueue(path) => {
				if !armed {
					armed = true;
					let tx = tx.clone();
					tokio::spawn(async move {
						tokio::time::sleep(SAVE_DEBOUNCE).await;
						let _ = tx.send(SaveCommand::Fire(path));
					});
				}
			},
			SaveCommand::Fire(path) => {
				armed = false;
				if let Err(err) = do_save(&shared, &path).await {
					error!(error = ?err, "cache store save failed");
				}
				for waiter in pending_flushes.drain(..) {
					let _ = waiter.send(());
				}
			},
			SaveCommand::Flush(responder) => {
				if armed {
					pending_flushes.push(responder);
				} else {
					let _ = responder.send(());
				}
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use tempfile::tempdir;

	use super::*;
	use crate::model::EventKind;

	#[tokio::test]
	async fn upsert_then_get_round_trips() {
		let store = CacheStore::new();
		let uuid = Uuid::new_v4();
		let mut record = PlayerRecord::default();
		record.mc_name = Some("Steve".into());
		store.upsert(uuid, record.clone());
		assert_eq!(store.get(&uuid), Some(record));
	}

	#[tokio::test]
	async fn upsert_detaches_prior_discord_id_owner() {
		let store = CacheStore::new();
		let first = Uuid::new_v4();
		let second = Uuid::new_v4();

		let mut rec1 = PlayerRecord::default();
		rec1.discord_id = Some(42);
		store.upsert(first, rec1);

		let mut rec2 = PlayerRecord::default();
		rec2.discord_id = Some(42);
		store.upsert(second, rec2);

		assert_eq!(store.get(&first).unwrap().discord_id, None);
		assert_eq!(store.get(&second).unwrap().discord_id, Some(42));
	}

	#[tokio::test]
	async fn find_by_name_is_case_insensitive() {
		let store = CacheStore::new();
		let uuid = Uuid::new_v4();
		let mut record = PlayerRecord::default();
		record.mc_name = Some("Steve".into());
		store.upsert(uuid, record);

		let (found_uuid, _) = store.find_by_name("STEVE").unwrap();
		assert_eq!(found_uuid, uuid);
	}

	#[tokio::test]
	async fn application_workflow_rejects_double_decision() {
		let store = CacheStore::new();
		let app = WhitelistApplication::new("id-1".into(), 7, "Name".into(), None, 0);
		store.add_application(app);

		let updated = store.update_application("id-1", |app| app.approve(99, None, 10));
		assert!(updated.is_some());

		let second = store.update_application("id-1", |app| app.approve(99, None, 20));
		assert!(second.is_none());
	}

	#[tokio::test]
	async fn save_then_load_round_trips() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("argus_db.json");

		let store = CacheStore::new();
		let uuid = Uuid::new_v4();
		let mut record = PlayerRecord::default();
		record.mc_name = Some("Steve".into());
		store.upsert(uuid, record.clone());
		store.append_event(EventEntry::new(EventKind::Link, 123).with_target_uuid(uuid)).await;

		store.save(&path).await.unwrap();

		let loaded = CacheStore::new();
		loaded.load(&path).await.unwrap();
		assert_eq!(loaded.get(&uuid), Some(record));
		assert_eq!(loaded.events_snapshot().await.len(), 1);
	}

	#[tokio::test]
	async fn load_falls_back_to_backup_on_primary_failure() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("argus_db.json");
		let backup = backup_path(&path);

		let store = CacheStore::new();
		let uuid = Uuid::new_v4();
		store.upsert(uuid, PlayerRecord::default());
		store.save(&path).await.unwrap();

		// corrupt primary, leaving a valid copy in place as backup
		tokio::fs::copy(&path, &backup).await.unwrap();
		tokio::fs::write(&path, "not json").await.unwrap();

		let loaded = CacheStore::new();
		loaded.load(&path).await.unwrap();
		assert!(loaded.get(&uuid).is_some());
	}

	#[tokio::test]
	async fn enqueue_save_coalesces_bursts() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("argus_db.json");

		let store = CacheStore::new();
		for i in 0..5 {
			store.upsert(Uuid::new_v4(), PlayerRecord::default());
			store.enqueue_save(&path);
			let _ = i;
		}

		assert!(store.flush_saves(2000).await);
		assert!(tokio::fs::try_exists(&path).await.unwrap());
	}

	#[tokio::test]
	async fn flush_saves_is_a_noop_when_nothing_pending() {
		let store = CacheStore::new();
		assert!(store.flush_saves(100).await);
	}
}
