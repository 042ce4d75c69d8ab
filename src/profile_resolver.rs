//! Username → (UUID, canonical name) via the Mojang profile API (§4.F).
//! Only ever called from moderation actions (`submit_application`), never
//! from the login hot path.

use std::time::Duration;

use miette::{
	miette,
	IntoDiagnostic,
	Result,
	WrapErr,
};
use serde::Deserialize;
use uuid::Uuid;

const PROFILE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct ProfileResponse {
	id: String,
	name: String,
}

pub struct ProfileResolver {
	client: reqwest::Client,
}

impl Default for ProfileResolver {
	fn default() -> Self {
		Self::new()
	}
}

impl ProfileResolver {
	pub fn new() -> Self {
		Self {
			client: reqwest::Client::builder()
				.timeout(PROFILE_TIMEOUT)
				.build()
				.expect("failed to build profile resolver http client"),
		}
	}

	/// `GET https://api.mojang.com/users/profiles/minecraft/{name}`. Any
	/// non-200, network, or parse error is a failure.
	pub async fn lookup_profile(&self, name: &str) -> Result<(Uuid, String)> {
		let url = format!("https://api.mojang.com/users/profiles/minecraft/{name}");

		let response = self
			.client
			.get(&url)
			.send()
			.await
			.into_diagnostic()
			.wrap_err("failed to reach mojang profile service")?;

		if !response.status().is_success() {
			return Err(miette!("mojang profile lookup for {name} failed with status {}", response.status()));
		}

		let profile: ProfileResponse = response
			.json()
			.await
			.into_diagnostic()
			.wrap_err("failed to parse mojang profile response")?;

		let uuid = parse_undashed_uuid(&profile.id).wrap_err("mojang returned a malformed uuid")?;

		Ok((uuid, profile.name))
	}
}

/// Mojang returns UUIDs without dashes; insert the standard 8-4-4-4-12 form.
fn parse_undashed_uuid(raw: &str) -> Result<Uuid> {
	if raw.len() != 32 || !raw.chars().all(|c| c.is_ascii_hexdigit()) {
		return Err(miette!("expected 32 hex characters, got {raw:?}"));
	}

	let dashed = format!(
		"{}-{}-{}-{}-{}",
		&raw[0..8],
		&raw[8..12],
		&raw[12..16],
		&raw[16..20],
		&raw[20..32]
	);

	dashed.parse::<Uuid>().into_diagnostic().wrap_err("failed to parse dashed uuid")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn dashes_undashed_uuid() {
		let uuid = parse_undashed_uuid("069a79f444e94726a5befca90e38aaf5").unwrap();
		assert_eq!(uuid.to_string(), "069a79f4-44e9-4726-a5be-fca90e38aaf5");
	}

	#[test]
	fn rejects_malformed_uuid() {
		assert!(parse_undashed_uuid("not-a-uuid").is_err());
	}
}
