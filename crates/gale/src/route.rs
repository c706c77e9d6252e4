//! Startup route resolution and the per-route accept loops.

use std::{collections::HashMap, net::IpAddr, sync::Arc};

use eyre::{Context as _, bail, ensure};
use gale_core::{
	policy::DestPolicy,
	throttle::ThrottleMap,
	url::{ProxyKind, RouteSpec},
};
use gale_proto::cipher::Cipher;
use gale_transport::{Acceptor, Outbound, tls::TlsIdentity};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{conf::Settings, session};

pub const SS_CIPHER: &str = "chacha20-ietf-poly1305";

/// Everything one listener needs, shared by all of its sessions.
pub struct Route {
	pub inbound:         RouteSpec,
	pub outbound:        Option<Arc<Outbound>>,
	pub outbound_cipher: Option<Cipher>,
	pub inbound_cipher:  Option<Cipher>,
	pub policy:          Arc<DestPolicy>,
	pub identity:        Option<TlsIdentity>,
	pub ul:              Option<ThrottleMap>,
	pub dl:              Option<ThrottleMap>,
}

fn validate(spec: &mut RouteSpec) -> eyre::Result<()> {
	match spec.proxy {
		ProxyKind::Ss => {
			ensure!(
				spec.username.as_deref() == Some(SS_CIPHER),
				"route {spec}: supported ss cipher is {SS_CIPHER}"
			);
			ensure!(spec.password.is_some(), "route {spec}: ss requires a password");
		}
		ProxyKind::Socks4 => {
			if spec.username.is_some() || spec.password.is_some() {
				warn!(target: "gale::route", "socks4 does not support authorization, ignoring credentials");
				spec.username = None;
				spec.password = None;
			}
		}
		_ => {}
	}
	Ok(())
}

fn ss_cipher(spec: &RouteSpec) -> Option<Cipher> {
	match (spec.proxy, &spec.password) {
		(ProxyKind::Ss, Some(password)) => Some(Cipher::new(password)),
		_ => None,
	}
}

fn load_blacklist(settings: &Settings) -> eyre::Result<std::collections::HashSet<IpAddr>> {
	let Some(path) = &settings.blacklist else {
		return Ok(Default::default());
	};
	let text = std::fs::read_to_string(path).with_context(|| format!("reading blacklist {}", path.display()))?;
	let mut set = std::collections::HashSet::new();
	for line in text.lines() {
		let line = line.trim();
		if line.is_empty() || line.starts_with('#') {
			continue;
		}
		match line.parse::<IpAddr>() {
			Ok(ip) => {
				set.insert(ip);
			}
			Err(_) => warn!(target: "gale::route", "skipping non-IP blacklist entry {line:?}"),
		}
	}
	Ok(set)
}

/// Parses every URL, resolves `via` references (by name or 1-based
/// position) and assembles the per-route contexts. Any error here
/// aborts startup.
pub fn build(settings: &Settings) -> eyre::Result<Vec<Route>> {
	let policy = Arc::new(DestPolicy {
		blacklist:          load_blacklist(settings)?,
		block_internal_ips: settings.block_internal_ips,
		blocked_countries:  settings.block_countries.iter().cloned().collect(),
	});

	let mut outbounds: HashMap<String, (Arc<Outbound>, Option<Cipher>)> = HashMap::new();
	for (index, url) in settings.outbounds.iter().enumerate() {
		let mut spec: RouteSpec = url.parse().with_context(|| format!("bad outbound url {url:?}"))?;
		validate(&mut spec)?;
		let key = spec.name.clone().unwrap_or_else(|| (index + 1).to_string());
		let cipher = ss_cipher(&spec);
		let outbound = Arc::new(Outbound::new(spec).wrap_err_with(|| format!("outbound {url:?}"))?);
		outbounds.insert(key, (outbound, cipher));
	}

	let mut routes = Vec::new();
	for url in &settings.inbounds {
		let mut spec: RouteSpec = url.parse().with_context(|| format!("bad inbound url {url:?}"))?;
		validate(&mut spec)?;

		let identity = if spec.transport.needs_cert() {
			match (&settings.cert_chain, &settings.key_file) {
				(Some(cert_chain), Some(key_file)) => Some(TlsIdentity::load(cert_chain, key_file)?),
				_ => bail!("route {spec}: {} listener needs --cert-chain and --key-file", spec.transport.as_str()),
			}
		} else {
			None
		};

		let (outbound, outbound_cipher) = match &spec.via {
			Some(via) => match outbounds.get(via) {
				Some((outbound, cipher)) => (Some(outbound.clone()), cipher.clone()),
				None => bail!("route {spec}: via={via} does not name an outbound"),
			},
			None => (None, None),
		};

		routes.push(Route {
			inbound_cipher: ss_cipher(&spec),
			ul: spec.ul.map(|kb| ThrottleMap::new(kb * 1024)),
			dl: spec.dl.map(|kb| ThrottleMap::new(kb * 1024)),
			inbound: spec,
			outbound,
			outbound_cipher,
			policy: policy.clone(),
			identity,
		});
	}
	Ok(routes)
}

/// Binds every route and serves until SIGINT.
pub async fn run(routes: Vec<Route>) -> eyre::Result<()> {
	let cancel = CancellationToken::new();
	let mut set = JoinSet::new();

	for route in routes {
		let identity = route.identity.as_ref().map(|identity| identity.clone_identity());
		let acceptor = Acceptor::bind(&route.inbound, identity, route.policy.clone())
			.await
			.wrap_err_with(|| format!("binding {}", route.inbound))?;
		let via = match &route.outbound {
			Some(outbound) => outbound.spec().to_string(),
			None => String::from("direct"),
		};
		info!(target: "gale::route", "serving {} (bound {}) -> {via}", route.inbound, acceptor.local_addr());
		set.spawn(serve(Arc::new(route), acceptor, cancel.child_token()));
	}

	tokio::signal::ctrl_c().await.wrap_err("waiting for ctrl-c")?;
	info!(target: "gale::route", "shutting down");
	cancel.cancel();
	set.shutdown().await;
	Ok(())
}

/// One route's accept loop; every connection becomes a spawned
/// session. Session errors never reach this loop.
pub async fn serve(route: Arc<Route>, mut acceptor: Acceptor, cancel: CancellationToken) {
	loop {
		tokio::select! {
			_ = cancel.cancelled() => break,
			accepted = acceptor.accept() => match accepted {
				Ok((pending, peer)) => {
					let route = route.clone();
					tokio::spawn(session::handle(route, pending, peer));
				}
				Err(err) => {
					warn!(target: "gale::route", "accept failed on {}: {err}", route.inbound);
					break;
				}
			}
		}
	}
}
