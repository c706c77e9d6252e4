use clap::Parser as _;
use tracing::info;

mod cli;
mod conf;
mod log;
mod route;
mod session;

#[tokio::main]
async fn main() -> eyre::Result<()> {
	let cli = cli::Cli::parse();
	log::init(cli.verbose)?;
	gale_transport::init_crypto();

	let settings = conf::Settings::load(&cli)?;
	let routes = route::build(&settings)?;
	info!(target: "gale", "starting with {} route(s)", routes.len());
	route::run(routes).await
}
