use std::path::{Path, PathBuf};

use eyre::ensure;
use figment::{
	Figment,
	providers::{Env, Format, Serialized, Toml, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::cli::Cli;

/// Effective configuration: config file and `GALE_*` environment
/// variables first, CLI arguments on top.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Settings {
	#[serde(default)]
	pub inbounds:           Vec<String>,
	#[serde(default)]
	pub outbounds:          Vec<String>,
	pub cert_chain:         Option<PathBuf>,
	pub key_file:           Option<PathBuf>,
	pub blacklist:          Option<PathBuf>,
	#[serde(default)]
	pub block_internal_ips: bool,
	#[serde(default)]
	pub block_countries:    Vec<String>,
}

impl Settings {
	pub fn load(cli: &Cli) -> eyre::Result<Self> {
		let mut figment = Figment::from(Serialized::defaults(Settings::default()));

		let default_toml = Path::new("gale.toml");
		if default_toml.exists() {
			figment = figment.merge(Toml::file(default_toml));
		}
		let default_yaml = Path::new("gale.yaml");
		if default_yaml.exists() {
			figment = figment.merge(Yaml::file(default_yaml));
		}

		if let Some(config) = &cli.config {
			figment = match config.extension().and_then(|ext| ext.to_str()) {
				Some("yaml" | "yml") => figment.merge(Yaml::file(config)),
				_ => figment.merge(Toml::file(config)),
			};
		}

		figment = figment.merge(Env::prefixed("GALE_"));

		let mut settings: Settings = figment.extract()?;

		settings.inbounds.extend(cli.inbounds.iter().cloned());
		settings.outbounds.extend(cli.outbounds.iter().cloned());
		if cli.cert_chain.is_some() {
			settings.cert_chain = cli.cert_chain.clone();
		}
		if cli.key_file.is_some() {
			settings.key_file = cli.key_file.clone();
		}
		if cli.blacklist.is_some() {
			settings.blacklist = cli.blacklist.clone();
		}
		if cli.block_internal_ips {
			settings.block_internal_ips = true;
		}
		if let Some(countries) = &cli.block_countries {
			settings
				.block_countries
				.extend(countries.split(',').map(|country| country.trim().to_owned()));
		}

		ensure!(!settings.inbounds.is_empty(), "no inbound routes configured");
		Ok(settings)
	}
}
