mod audit;
mod bridge;
mod cache_store;
mod core;
mod discord_bridge;
mod handler;
mod link_tokens;
mod model;
mod profile_resolver;
mod settings;

use std::sync::Arc;

use lazy_static::lazy_static;
use miette::{
	IntoDiagnostic,
	Report,
	Result,
	WrapErr,
};
use poise::{
	serenity_prelude::{
		ClientBuilder,
		FullEvent,
		GatewayIntents,
	},
	Framework,
	FrameworkError,
	FrameworkOptions,
};
use tracing::{
	error,
	info,
	trace,
	warn,
};

use crate::{
	core::Core,
	discord_bridge::LiveDiscordBridge,
	settings::Settings,
};

lazy_static! {
	pub static ref APP_VERSION: semver::Version = semver::Version::parse(env!("CARGO_PKG_VERSION"))
		.into_diagnostic()
		.wrap_err("failed to parse version")
		.unwrap();
	pub static ref APP_NAME: String = env!("CARGO_PKG_NAME").into();
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
	tracing_subscriber::fmt::init();
	info!(version = %*APP_VERSION, "Starting {}...", *APP_NAME);

	let config_path = Settings::default_path();
	let core = Arc::new(Core::new(config_path));
	core.initialize().await.wrap_err("failed to initialize core")?;
	core.start_discord().await.wrap_err("failed to validate discord settings")?;

	let settings = core.settings().await;
	if settings.bot_token.trim().is_empty() {
		warn!("botToken is not configured; running with the Discord bridge disabled");
		// park forever so the process still runs moderation-free, matching
		// the spec's "never let the bridge being unconfigured crash startup"
		std::future::pending::<()>().await;
		return Ok(());
	}

	let poise_options: FrameworkOptions<Arc<Core>, Report> = FrameworkOptions {
		commands: handler::all_commands(),
		pre_command: |ctx| {
			Box::pin(async move {
				let invocation = ctx.invocation_string();
				trace!(sender = %ctx.author(), invocation = invocation, "Executing command...");
			})
		},
		on_error: |error: FrameworkError<'_, Arc<Core>, Report>| {
			Box::pin(async move {
				let err = match &error {
					FrameworkError::Setup {
						error, ..
					} => Some(error),
					FrameworkError::EventHandler {
						error, ..
					} => Some(error),
					_ => None,
				};

				if let Some(err) = err {
					error!(error = ?err, "generic error in bot framework");
					return;
				}

				error!("generic error in bot framework: {}", error);
				if let Err(e) = poise::builtins::on_error(error).await {
					error!("Error while notifying user about error: {}", e);
				}
			})
		},
		skip_checks_for_owners: false,
		event_handler: |ctx, ev, _framework, core| Box::pin(discord_listener(ctx, ev, core)),
		..Default::default()
	};

	let framework = Framework::builder()
		.setup(move |ctx, ready, framework| {
			Box::pin(async move {
				poise::builtins::register_globally(ctx, &framework.options().commands)
					.await
					.into_diagnostic()
					.wrap_err("failed to register slash commands")?;
				info!(guilds = ready.guilds.len(), "discord bridge ready");
				Ok(core)
			})
		})
		.options(poise_options)
		.build();

	ClientBuilder::new(&settings.bot_token, GatewayIntents::GUILDS | GatewayIntents::GUILD_MEMBERS)
		.framework(framework)
		.await
		.into_diagnostic()
		.wrap_err("failed to create discord client")?
		.start()
		.await
		.into_diagnostic()
		.wrap_err("failed to start discord client")?;

	Ok(())
}

async fn discord_listener<'a>(ctx: &'a poise::serenity_prelude::Context, ev: &'a FullEvent, core: &'a Arc<Core>) -> Result<()> {
	match ev {
		FullEvent::Ready {
			..
		} => {
			let settings = core.settings().await;
			if let (Some(guild_id), Some(whitelist_role_id)) = (settings.guild_id, settings.whitelist_role_id) {
				let bridge = Arc::new(LiveDiscordBridge::new(ctx.clone(), guild_id, whitelist_role_id, settings.log_channel_id));
				core.set_bridge(bridge.clone()).await;
				core.audit().set_dispatcher(bridge).await;
			}
		},
		FullEvent::GuildMemberUpdate {
			event, ..
		} => {
			core.on_role_change(event.user.id.get(), &event.roles.iter().map(|r| r.get()).collect()).await;
			core
				.on_identity_change(event.user.id.get(), event.user.global_name.clone(), event.nick.clone())
				.await;
		},
		FullEvent::GuildMemberRemoval {
			user, ..
		} => {
			core.on_role_change(user.id.get(), &std::collections::HashSet::new()).await;
		},
		_ => {},
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use ctor::ctor;

	#[ctor]
	fn init_tests() {
		std::env::set_var("RUST_LOG", "trace");
		tracing_subscriber::fmt::init();
	}
}
