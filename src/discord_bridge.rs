//! Concrete `DiscordBridge` backed by serenity's gateway cache + REST API.
//!
//! Mirrors the teacher's `discord_listener` shape in `main.rs` (matching on
//! `FullEvent` and translating gateway events into calls against owned
//! state) but routes everything through `Core` instead of a completion
//! handler. Role-status lookups prefer the gateway cache and only fall back
//! to a REST call, bounded by the caller's timeout, when the member isn't
//! cached yet.

use std::{
	future::Future,
	pin::Pin,
};

use miette::{
	miette,
	IntoDiagnostic,
	Result,
	WrapErr,
};
use poise::serenity_prelude::{
	self as serenity,
	GuildId,
	RoleId,
	UserId,
};
use tracing::warn;

use crate::{
	audit::{
		AuditDispatcher,
		AuditEntry,
	},
	bridge::{
		DiscordBridge,
		RoleStatus,
	},
};

pub struct LiveDiscordBridge {
	ctx: serenity::Context,
	guild_id: GuildId,
	whitelist_role_id: RoleId,
	log_channel_id: Option<serenity::ChannelId>,
}

impl LiveDiscordBridge {
	pub fn new(ctx: serenity::Context, guild_id: u64, whitelist_role_id: u64, log_channel_id: Option<u64>) -> Self {
		Self {
			ctx,
			guild_id: GuildId::new(guild_id),
			whitelist_role_id: RoleId::new(whitelist_role_id),
			log_channel_id: log_channel_id.map(serenity::ChannelId::new),
		}
	}

	async fn member_roles(&self, discord_id: u64) -> Result<Option<Vec<RoleId>>> {
		let user_id = UserId::new(discord_id);

		if let Some(guild) = self.ctx.cache.guild(self.guild_id) {
			if let Some(member) = guild.members.get(&user_id) {
				return Ok(Some(member.roles.clone()));
			}
		}

		match self.guild_id.member(&self.ctx.http, user_id).await {
			Ok(member) => Ok(Some(member.roles)),
			Err(serenity::Error::Http(serenity::HttpError::UnsuccessfulRequest(resp))) if resp.status_code == serenity::StatusCode::NOT_FOUND => Ok(None),
			Err(err) => Err(err).into_diagnostic().wrap_err("failed to fetch discord guild member"),
		}
	}
}

impl DiscordBridge for LiveDiscordBridge {
	fn check_whitelist_status(&self, discord_id: u64, timeout_ms: u64) -> Pin<Box<dyn Future<Output = RoleStatus> + Send + '_>> {
		Box::pin(async move {
			let lookup = tokio::time::timeout(std::time::Duration::from_millis(timeout_ms), self.member_roles(discord_id)).await;

			match lookup {
				Err(_) => RoleStatus::Indeterminate,
				Ok(Err(err)) => {
					warn!(error = ?err, discord_id, "role status lookup failed");
					RoleStatus::Indeterminate
				},
				Ok(Ok(None)) => RoleStatus::NotInGuild,
				Ok(Ok(Some(roles))) => {
					if roles.contains(&self.whitelist_role_id) {
						RoleStatus::HasRole
					} else {
						RoleStatus::MissingRole
					}
				},
			}
		})
	}

	fn audit_dispatch(&self, entry: AuditEntry) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
		Box::pin(async move {
			let Some(channel_id) = self.log_channel_id else {
				return Ok(());
			};

			let mut lines = vec![format!("**{}**", entry.action)];
			if let Some(subject) = &entry.subject {
				lines.push(format!("subject: `{subject}`"));
			}
			if let Some(actor) = &entry.actor {
				lines.push(format!("actor: `{actor}`"));
			}
			if let Some(description) = &entry.description {
				lines.push(description.clone());
			}

			channel_id
				.say(&self.ctx.http, lines.join("\n"))
				.await
				.into_diagnostic()
				.wrap_err("failed to post audit entry to discord log channel")?;

			Ok(())
		})
	}
}

impl AuditDispatcher for LiveDiscordBridge {
	fn dispatch(&self, entry: AuditEntry) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
		self.audit_dispatch(entry)
	}
}

/// Bridges a serenity role-update event into the generic notification the
/// core consumes, resolving the guild's current role set for the member.
pub fn roles_for_member(ctx: &serenity::Context, guild_id: GuildId, user_id: UserId) -> Option<std::collections::HashSet<u64>> {
	ctx.cache.guild(guild_id)?.members.get(&user_id).map(|member| member.roles.iter().map(|r| r.get()).collect())
}

pub fn require_configured(guild_id: Option<u64>, whitelist_role_id: Option<u64>) -> Result<(u64, u64)> {
	match (guild_id, whitelist_role_id) {
		(Some(guild_id), Some(role_id)) => Ok((guild_id, role_id)),
		_ => Err(miette!("discord bridge requires guildId and whitelistRoleId to be configured")),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn require_configured_rejects_partial_config() {
		assert!(require_configured(None, Some(1)).is_err());
		assert!(require_configured(Some(1), None).is_err());
		assert!(require_configured(Some(1), Some(2)).is_ok());
	}
}
