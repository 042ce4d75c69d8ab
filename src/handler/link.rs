//! `/link <token>` — public, links the invoking Discord user to whatever
//! Minecraft UUID the token was issued for (§4.G.3).

use miette::{
	IntoDiagnostic,
	Report,
};

use super::Context;

#[poise::command(slash_command)]
pub async fn link(ctx: Context<'_>, #[description = "Token shown in-game"] token: String) -> Result<(), Report> {
	let author = ctx.author();
	let nick = match ctx.author_member().await {
		Some(member) => member.nick.clone(),
		None => None,
	};

	let reply = match ctx.data().link_discord_user(&token, author.id.get(), author.name.clone(), nick).await {
		Ok(message) => message,
		Err(err) => format!("Could not link: {err}"),
	};

	ctx.say(reply).await.into_diagnostic()?;
	Ok(())
}
