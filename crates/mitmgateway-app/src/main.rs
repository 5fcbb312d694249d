use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use mitmgateway::ca::RcgenAuthority;
use mitmgateway::{Config, Proxy, parse_config};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mitmgateway")]
#[command(about = "Intercepting HTTP/HTTPS/WebSocket proxy")]
struct Args {
	/// YAML configuration file.
	#[arg(short, long)]
	config: Option<PathBuf>,

	/// Listen address, overrides the config file.
	#[arg(short, long)]
	listen: Option<String>,

	/// Root CA private key (PEM), overrides the config file. An ephemeral
	/// root is generated when neither is given.
	#[arg(long)]
	ca_key: Option<PathBuf>,

	/// Write the root CA certificate (PEM) to this path at startup, for
	/// distribution to clients.
	#[arg(long)]
	export_ca_cert: Option<PathBuf>,

	/// Write the root CA private key (PEM) to this path at startup, so an
	/// ephemeral root can be reused across runs via --ca-key.
	#[arg(long)]
	export_ca_key: Option<PathBuf>,

	/// Log filter, e.g. `info` or `mitmgateway=debug`.
	#[arg(long)]
	log_filter: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();

	let mut cfg = match &args.config {
		Some(path) => {
			let contents = std::fs::read_to_string(path)
				.with_context(|| format!("reading config {}", path.display()))?;
			parse_config(&contents)?
		},
		None => Config::default(),
	};
	if let Some(listen) = &args.listen {
		cfg.listen = listen
			.parse()
			.with_context(|| format!("invalid listen address {listen}"))?;
	}
	if let Some(key) = args.ca_key {
		cfg.ca_key_path = Some(key);
	}

	let filter = args
		.log_filter
		.or(cfg.log_filter.clone())
		.map(EnvFilter::new)
		.unwrap_or_else(|| EnvFilter::from_default_env().add_directive("info".parse().unwrap()));
	tracing_subscriber::fmt().with_env_filter(filter).init();

	// Two TLS providers can end up linked in; pin the default explicitly.
	mitmgateway::install_default_crypto();

	let ca = match &cfg.ca_key_path {
		Some(path) => {
			let pem = std::fs::read_to_string(path)
				.with_context(|| format!("reading CA key {}", path.display()))?;
			RcgenAuthority::from_key_pem(&pem).context("loading CA key")?
		},
		None => {
			info!("no CA key configured; generating an ephemeral root");
			RcgenAuthority::generate().context("generating root CA")?
		},
	};
	if let Some(path) = &args.export_ca_cert {
		std::fs::write(path, ca.root_cert_pem())
			.with_context(|| format!("writing CA certificate {}", path.display()))?;
		info!("root CA certificate written to {}", path.display());
	}
	if let Some(path) = &args.export_ca_key {
		std::fs::write(path, ca.root_key_pem())
			.with_context(|| format!("writing CA key {}", path.display()))?;
		info!("root CA key written to {}", path.display());
	}

	let proxy = Proxy::builder()
		.listen(cfg.listen)
		.certificate_authority(Arc::new(ca))
		.upstream(cfg.upstream.clone())
		.bind()
		.await?;

	let handle = proxy.handle();
	tokio::spawn(async move {
		let _ = tokio::signal::ctrl_c().await;
		info!("shutting down");
		handle.shutdown();
	});

	proxy.serve().await
}
