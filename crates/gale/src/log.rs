use time::macros::format_description;
use tracing::Level;
use tracing_subscriber::{
	filter::{LevelFilter, Targets},
	fmt::time::LocalTime,
	layer::SubscriberExt as _,
	util::SubscriberInitExt as _,
};

pub fn init(verbose: u8) -> eyre::Result<()> {
	let level = match verbose {
		0 => Level::INFO,
		1 => Level::DEBUG,
		_ => Level::TRACE,
	};
	let filter = Targets::new()
		.with_targets(vec![
			("gale", level),
			("gale_core", level),
			("gale_proto", level),
			("gale_transport", level),
		])
		.with_default(LevelFilter::WARN);
	tracing_subscriber::registry()
		.with(filter)
		.with(
			tracing_subscriber::fmt::layer()
				.with_target(true)
				.with_timer(LocalTime::new(format_description!(
					"[year repr:last_two]-[month]-[day] [hour]:[minute]:[second]"
				))),
		)
		.try_init()?;

	Ok(())
}
