//! `/whitelist ...` — the moderation and application surface (§6). Public
//! subcommands (`apply`, `my`, `help`) need no role; everything else checks
//! `require_admin`, mirroring the teacher's `admin()` subcommand-group shape
//! in `handler/admin.rs` but gated on a configured Discord role instead of
//! bot ownership.

use miette::{
	IntoDiagnostic,
	Report,
};
use uuid::Uuid;

use super::{
	require_admin,
	Context,
};

#[poise::command(
	slash_command,
	subcommands(
		"apply",
		"my",
		"help",
		"add",
		"remove",
		"status",
		"review",
		"list_applications",
		"approve",
		"deny",
		"warn",
		"ban",
		"unban",
		"comment"
	)
)]
pub async fn whitelist(_ctx: Context<'_>) -> Result<(), Report> {
	unreachable!("only usable as a subcommand")
}

/// Public: submit a whitelist application for a Minecraft username.
#[poise::command(slash_command)]
async fn apply(ctx: Context<'_>, #[description = "Your Minecraft username"] mc_name: String) -> Result<(), Report> {
	let reply = match ctx.data().submit_application(ctx.author().id.get(), &mc_name).await {
		Ok(id) => format!("Application submitted (id={id}). An admin will review it soon."),
		Err(err) => format!("Could not submit application: {err}"),
	};
	ctx.say(reply).await.into_diagnostic()?;
	Ok(())
}

/// Public: the invoking user's own warn count and active ban, if any.
#[poise::command(slash_command, rename = "my")]
async fn my(ctx: Context<'_>) -> Result<(), Report> {
	let discord_id = ctx.author().id.get();
	let reply = match ctx.data().my_status(discord_id) {
		Some((warn_count, Some(ban_message))) => format!("warnCount={warn_count} {ban_message}"),
		Some((warn_count, None)) => format!("warnCount={warn_count}"),
		None => "You are not linked to a Minecraft account yet. Use /link with the token shown in-game.".to_string(),
	};
	ctx.say(reply).await.into_diagnostic()?;
	Ok(())
}

/// Public: summary of available commands.
#[poise::command(slash_command)]
async fn help(ctx: Context<'_>) -> Result<(), Report> {
	ctx
		.say(concat!(
			"/link <token> -- link your Discord account\n",
			"/whitelist apply <mcName> -- apply for the whitelist\n",
			"/whitelist my -- your own whitelist status\n",
			"/whitelist help -- this message\n",
			"Admin only: add, remove, status, review, list-applications, approve, deny, warn, ban, unban, comment"
		))
		.await
		.into_diagnostic()?;
	Ok(())
}

#[poise::command(slash_command, check = "require_admin")]
async fn add(ctx: Context<'_>, #[description = "Player UUID or known name"] player: String, #[description = "Minecraft name, if not already known"] mc_name: Option<String>) -> Result<(), Report> {
	let uuid = resolve_player(&ctx, &player)?;
	let actor = ctx.author().name.clone();
	let reply = ctx.data().whitelist_add(uuid, mc_name, &actor).await;
	ctx.say(reply).await.into_diagnostic()?;
	Ok(())
}

#[poise::command(slash_command, check = "require_admin")]
async fn remove(ctx: Context<'_>, #[description = "Player UUID or known name"] player: String) -> Result<(), Report> {
	let uuid = resolve_player(&ctx, &player)?;
	let actor = ctx.author().name.clone();
	let reply = ctx.data().whitelist_remove(uuid, &actor).await;
	ctx.say(reply).await.into_diagnostic()?;
	Ok(())
}

#[poise::command(slash_command, check = "require_admin")]
async fn status(ctx: Context<'_>, #[description = "Player UUID or known name"] player: String) -> Result<(), Report> {
	let uuid = resolve_player(&ctx, &player)?;
	ctx.say(ctx.data().whitelist_status(uuid)).await.into_diagnostic()?;
	Ok(())
}

#[poise::command(slash_command, check = "require_admin")]
async fn review(ctx: Context<'_>, #[description = "Player UUID or known name"] player: String) -> Result<(), Report> {
	let uuid = resolve_player(&ctx, &player)?;
	let events = ctx.data().review_player(uuid).await;
	if events.is_empty() {
		ctx.say(format!("No events for {uuid}")).await.into_diagnostic()?;
		return Ok(());
	}
	let lines: Vec<String> = events
		.into_iter()
		.map(|event| match (&event.message, event.actor_discord_id) {
			(Some(message), Some(actor)) => format!("{:?} -- {message} -- by {actor}", event.kind),
			(Some(message), None) => format!("{:?} -- {message}", event.kind),
			(None, Some(actor)) => format!("{:?} -- by {actor}", event.kind),
			(None, None) => format!("{:?}", event.kind),
		})
		.collect();
	ctx.say(lines.join("\n")).await.into_diagnostic()?;
	Ok(())
}

#[poise::command(slash_command, rename = "list-applications", check = "require_admin")]
async fn list_applications(ctx: Context<'_>) -> Result<(), Report> {
	let pending = ctx.data().list_pending_applications();
	if pending.is_empty() {
		ctx.say("No pending applications.").await.into_diagnostic()?;
		return Ok(());
	}
	let lines: Vec<String> = pending
		.into_iter()
		.map(|app| format!("{} -- {} (discord={})", app.id, app.mc_name, app.discord_id))
		.collect();
	ctx.say(lines.join("\n")).await.into_diagnostic()?;
	Ok(())
}

#[poise::command(slash_command, check = "require_admin")]
async fn approve(ctx: Context<'_>, #[description = "Application id"] id: String, #[description = "Reason"] reason: Option<String>) -> Result<(), Report> {
	let reply = match ctx.data().approve_application(&id, ctx.author().id.get(), reason).await {
		Ok(message) => message,
		Err(err) => format!("Could not approve: {err}"),
	};
	ctx.say(reply).await.into_diagnostic()?;
	Ok(())
}

#[poise::command(slash_command, check = "require_admin")]
async fn deny(ctx: Context<'_>, #[description = "Application id"] id: String, #[description = "Reason"] reason: Option<String>) -> Result<(), Report> {
	let reply = match ctx.data().deny_application(&id, ctx.author().id.get(), reason).await {
		Ok(message) => message,
		Err(err) => format!("Could not deny: {err}"),
	};
	ctx.say(reply).await.into_diagnostic()?;
	Ok(())
}

#[poise::command(slash_command, check = "require_admin")]
async fn warn(ctx: Context<'_>, #[description = "Player UUID or known name"] player: String, #[description = "Reason"] reason: String) -> Result<(), Report> {
	let uuid = resolve_player(&ctx, &player)?;
	let reply = ctx.data().warn_player(uuid, ctx.author().id.get(), reason).await;
	ctx.say(reply).await.into_diagnostic()?;
	Ok(())
}

#[poise::command(slash_command, check = "require_admin")]
async fn ban(
	ctx: Context<'_>,
	#[description = "Player UUID or known name"] player: String,
	#[description = "Reason"] reason: String,
	#[description = "Ban duration in minutes; omit for a permanent ban"] duration_minutes: Option<i64>,
) -> Result<(), Report> {
	let uuid = resolve_player(&ctx, &player)?;
	let until = duration_minutes.map(|mins| chrono::Utc::now().timestamp_millis() + mins * 60_000);
	let reply = ctx.data().ban_player(uuid, ctx.author().id.get(), reason, until).await;
	ctx.say(reply).await.into_diagnostic()?;
	Ok(())
}

#[poise::command(slash_command, check = "require_admin")]
async fn unban(ctx: Context<'_>, #[description = "Player UUID or known name"] player: String, #[description = "Reason"] reason: Option<String>) -> Result<(), Report> {
	let uuid = resolve_player(&ctx, &player)?;
	let reply = ctx.data().unban_player(uuid, ctx.author().id.get(), reason).await;
	ctx.say(reply).await.into_diagnostic()?;
	Ok(())
}

#[poise::command(slash_command, check = "require_admin")]
async fn comment(ctx: Context<'_>, #[description = "Player UUID or known name"] player: String, #[description = "Note"] note: String) -> Result<(), Report> {
	let uuid = resolve_player(&ctx, &player)?;
	let reply = ctx.data().comment_on_player(uuid, ctx.author().id.get(), note).await;
	ctx.say(reply).await.into_diagnostic()?;
	Ok(())
}

fn resolve_player(ctx: &Context<'_>, raw: &str) -> Result<Uuid, Report> {
	if let Ok(uuid) = raw.parse::<Uuid>() {
		return Ok(uuid);
	}
	ctx
		.data()
		.cache()
		.find_by_name(raw)
		.map(|(uuid, _)| uuid)
		.ok_or_else(|| miette::miette!("{raw:?} is not a known player name or UUID"))
}
