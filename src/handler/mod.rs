//! Slash-command surface (§6 Discord bridge interfaces). Grounded in the
//! teacher's `handler/admin.rs` subcommand-group shape, generalized from
//! prefix commands gated on bot ownership to slash commands gated on the
//! configured admin role.

pub mod link;
pub mod whitelist;

use std::sync::Arc;

use miette::{
	miette,
	Report,
	Result,
};
use poise::serenity_prelude::Member;

use crate::core::Core;

pub type Context<'a> = poise::Context<'a, Arc<Core>, Report>;

/// `check` hook shared by every admin-only subcommand: the invoking member
/// must hold the configured `adminRoleId`.
pub async fn require_admin(ctx: Context<'_>) -> Result<bool> {
	let settings = ctx.data().settings().await;
	let Some(admin_role_id) = settings.admin_role_id else {
		return Err(miette!("admin role is not configured"));
	};

	let Some(member) = ctx.author_member().await else {
		return Err(miette!("this command must be used in the configured guild"));
	};

	if member_has_role(&member, admin_role_id) {
		Ok(true)
	} else {
		Err(miette!("you do not have permission to use this command"))
	}
}

fn member_has_role(member: &Member, role_id: u64) -> bool {
	member.roles.iter().any(|r| r.get() == role_id)
}

pub fn all_commands() -> Vec<poise::Command<Arc<Core>, Report>> {
	vec![link::link(), whitelist::whitelist()]
}
