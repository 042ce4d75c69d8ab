//! Structured audit event sink with a pluggable dispatcher (§4.B).
//!
//! The dispatcher is a late-bound capability owned by `Core` (see DESIGN
//! NOTES: "prefer a Core value that owns these components" over a true
//! process-wide static) — it forwards entries to the Discord Bridge's log
//! channel when one is attached. Dispatch failures are caught and logged,
//! never propagated to the caller, mirroring how the teacher's
//! `handler/opt_out.rs` wraps every send in `.into_diagnostic()` but never
//! lets a notification failure abort the calling command.

use std::{
	collections::HashMap,
	sync::Arc,
};

use miette::Result;
use tokio::sync::RwLock;
use tracing::{
	error,
	info,
};

/// A single structured audit entry.
#[derive(Debug, Clone)]
pub struct AuditEntry {
	pub action: String,
	pub subject: Option<String>,
	pub actor: Option<String>,
	pub description: Option<String>,
	pub metadata: HashMap<String, String>,
}

impl AuditEntry {
	pub fn new(action: impl Into<String>) -> Self {
		Self {
			action: action.into(),
			subject: None,
			actor: None,
			description: None,
			metadata: HashMap::new(),
		}
	}

	pub fn subject(mut self, subject: impl Into<String>) -> Self {
		self.subject = Some(subject.into());
		self
	}

	pub fn actor(mut self, actor: impl Into<String>) -> Self {
		self.actor = Some(actor.into());
		self
	}

	pub fn description(mut self, description: impl Into<String>) -> Self {
		self.description = Some(description.into());
		self
	}

	pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.metadata.insert(key.into(), value.into());
		self
	}

	/// Human-readable "em-dash joined" rendering, for the process logger.
	fn render(&self) -> String {
		let mut parts = vec![self.action.clone()];
		if let Some(subject) = &self.subject {
			parts.push(format!("subject: {subject}"));
		}
		if let Some(actor) = &self.actor {
			parts.push(format!("actor: {actor}"));
		}
		if let Some(description) = &self.description {
			parts.push(description.clone());
		}
		for (key, value) in &self.metadata {
			parts.push(format!("{key}={value}"));
		}
		parts.join(" -- ")
	}
}

/// Implemented by whatever can actually deliver an audit entry (the Discord
/// Bridge's log-channel sender, in production; a recording fake in tests).
pub trait AuditDispatcher: Send + Sync {
	fn dispatch(&self, entry: AuditEntry) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>>;
}

pub struct AuditLog {
	dispatcher: RwLock<Option<Arc<dyn AuditDispatcher>>>,
}

impl Default for AuditLog {
	fn default() -> Self {
		Self::new()
	}
}

impl AuditLog {
	pub fn new() -> Self {
		Self {
			dispatcher: RwLock::new(None),
		}
	}

	pub async fn set_dispatcher(&self, dispatcher: Arc<dyn AuditDispatcher>) {
		*self.dispatcher.write().await = Some(dispatcher);
	}

	pub async fn clear_dispatcher(&self) {
		*self.dispatcher.write().await = None;
	}

	/// Logs a structured entry: always mirrored to the process logger, and
	/// best-effort forwarded to the dispatcher if one is attached.
	pub async fn log(&self, entry: AuditEntry) {
		info!(action = %entry.action, "{}", entry.render());

		let dispatcher = self.dispatcher.read().await.clone();
		if let Some(dispatcher) = dispatcher {
			if let Err(err) = dispatcher.dispatch(entry).await {
				error!(error = ?err, "audit dispatcher failed");
			}
		}
	}

	/// Convenience constructor + log in one call.
	pub async fn log_parts(
		&self,
		action: impl Into<String>,
		subject: Option<String>,
		actor: Option<String>,
		description: Option<String>,
		metadata: HashMap<String, String>,
	) {
		let mut entry = AuditEntry::new(action);
		entry.subject = subject;
		entry.actor = actor;
		entry.description = description;
		entry.metadata = metadata;
		self.log(entry).await;
	}

	/// Legacy path: an unstructured message logged under the `audit` action.
	pub async fn log_message(&self, message: impl Into<String>) {
		self.log(AuditEntry::new("audit").description(message)).await;
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{
		AtomicUsize,
		Ordering,
	};

	use super::*;

	struct FailingDispatcher;
	impl AuditDispatcher for FailingDispatcher {
		fn dispatch(&self, _entry: AuditEntry) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>> {
			Box::pin(async { Err(miette::miette!("boom")) })
		}
	}

	struct CountingDispatcher(Arc<AtomicUsize>);
	impl AuditDispatcher for CountingDispatcher {
		fn dispatch(&self, _entry: AuditEntry) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>> {
			let counter = self.0.clone();
			Box::pin(async move {
				counter.fetch_add(1, Ordering::SeqCst);
				Ok(())
			})
		}
	}

	#[tokio::test]
	async fn dispatch_failure_does_not_panic_or_propagate() {
		let log = AuditLog::new();
		log.set_dispatcher(Arc::new(FailingDispatcher)).await;
		log.log_message("should not panic").await;
	}

	#[tokio::test]
	async fn dispatch_forwards_to_attached_sink() {
		let log = AuditLog::new();
		let counter = Arc::new(AtomicUsize::new(0));
		log.set_dispatcher(Arc::new(CountingDispatcher(counter.clone()))).await;
		log.log_message("hello").await;
		assert_eq!(counter.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn render_joins_with_em_dash() {
		let entry = AuditEntry::new("ban").subject("uuid-1").description("Griefing");
		assert_eq!(entry.render(), "ban -- subject: uuid-1 -- Griefing");
	}
}
