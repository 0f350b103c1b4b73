use std::path::PathBuf;

use clap::{Args, Parser};
use tracing_subscriber::EnvFilter;

mod cluster;
mod config;
mod error;
mod operator;
mod pki;
mod retry;
#[cfg(test)]
mod testing;

use cluster::KubeClusterApi;
use config::{BootstrapSettings, ExistingPolicy, InputProperties};
use retry::PollConfig;

#[derive(Parser)]
#[command(name = "openunison-bootstrap")]
#[command(bin_name = "openunison-bootstrap")]
enum OpenUnisonBootstrapCli {
    Bootstrap(BootstrapArgs),
    ApiServerFlags(ApiServerFlagsArgs),
}

#[derive(Args)]
#[command(author, version, about, long_about = None)]
struct BootstrapArgs {
    /// Input properties file
    #[arg(short, long)]
    properties: PathBuf,
    /// Overrides a property, KEY=VALUE
    #[arg(long = "set", value_name = "KEY=VALUE")]
    overrides: Vec<String>,
    #[arg(long, value_enum, default_value_t = ExistingPolicy::Fail)]
    on_existing: ExistingPolicy,
    /// Directory holding `<alias>.pem` trust certificates
    #[arg(long, default_value = "/etc/extracerts")]
    extra_certs: PathBuf,
    /// signerName for the service CSRs, e.g. a cert-manager or cluster signer
    #[arg(long)]
    csr_signer: String,
    /// Appended to CSR names so a rerun does not collide with earlier requests
    #[arg(long)]
    csr_suffix: Option<String>,
    /// Reads of a CSR or token secret before giving up
    #[arg(long, default_value_t = 10)]
    poll_attempts: u32,
}

#[derive(Args)]
#[command(author, version, about, long_about = None)]
struct ApiServerFlagsArgs {
    #[arg(short, long, default_value = "openunison")]
    namespace: String,
}

async fn run_bootstrap(args: BootstrapArgs) -> Result<(), error::Error> {
    let mut props = InputProperties::from_file(&args.properties)?;
    props.apply_overrides(&args.overrides)?;
    props.validate()?;

    let settings = BootstrapSettings {
        on_existing: args.on_existing,
        csr_suffix: args.csr_suffix,
        csr_poll: PollConfig::with_max_attempts(args.poll_attempts),
        token_poll: PollConfig::with_max_attempts(args.poll_attempts),
        ..BootstrapSettings::new(args.csr_signer)
    };
    settings.validate()?;
    let api = KubeClusterApi::try_default(args.extra_certs).await?;
    operator::bootstrap(&api, &props, &settings).await
}

async fn print_api_server_flags(args: ApiServerFlagsArgs) -> Result<(), error::Error> {
    let api = KubeClusterApi::try_default(PathBuf::new()).await?;
    for flag in operator::read_api_server_flags(&api, &args.namespace).await? {
        println!("{}", flag);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match OpenUnisonBootstrapCli::parse() {
        OpenUnisonBootstrapCli::Bootstrap(args) => run_bootstrap(args).await?,
        OpenUnisonBootstrapCli::ApiServerFlags(args) => print_api_server_flags(args).await?,
    }

    Ok(())
}
