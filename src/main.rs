use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use my_meters::config::{EntryStore, DEFAULT_API_URL, DEFAULT_SCAN_INTERVAL};
use my_meters::config_flow::{ConfigFlow, FlowResult, UserInput};
use my_meters::error::SetupError;
use my_meters::{Integration, IntegrationContext};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Delay before setting up again when the API was unreachable.
const SETUP_RETRY: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    /// File holding the config entry and the corrections.
    #[arg(long, env = "MY_METERS_STORE", default_value = "my_meters.json")]
    store: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check the API credentials and store them.
    Setup {
        #[arg(long, env = "MY_METERS_API_URL", default_value = DEFAULT_API_URL)]
        api_url: String,

        #[arg(long, env = "MY_METERS_API_TOKEN", hide_env_values = true)]
        api_token: String,

        /// Seconds between polls.
        #[arg(long, default_value_t = DEFAULT_SCAN_INTERVAL, value_parser = clap::value_parser!(u64).range(1..))]
        scan_interval: u64,
    },

    /// Show the correction form, or submit it with `--set`.
    Options {
        /// Correction for one meter, e.g. `--set 1001=5.6`.
        #[arg(long = "set", value_name = "ID=VALUE", value_parser = parse_assignment)]
        set: Vec<(String, String)>,
    },

    /// Poll once and print every sensor as JSON.
    Show,

    /// Poll forever. SIGHUP reloads the stored entry.
    Run,

    /// Delete the stored entry and all corrections.
    Remove,
}

fn parse_assignment(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((id, value)) if !id.trim().is_empty() => {
            Ok((id.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected ID=VALUE, got `{raw}`")),
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("my_meters=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();
    let mut integration = Integration::new(EntryStore::new(args.store));

    match args.command {
        Command::Setup {
            api_url,
            api_token,
            scan_interval,
        } => {
            let input = UserInput {
                api_url,
                api_token,
                scan_interval: Some(scan_interval),
            };
            match ConfigFlow::new().step_user(Some(input)).await {
                FlowResult::CreateEntry { title, data } => {
                    integration.create_entry(title, data)?;
                    println!("Stored entry in {}", integration.store().path().display());
                }
                FlowResult::ShowForm { errors, .. } => bail!("setup failed: {errors:?}"),
            }
        }
        Command::Options { set } => {
            integration.setup().await.context("failed to set up the entry")?;
            let result = if set.is_empty() {
                let flow = integration
                    .options_flow()
                    .context("entry is not set up")?;
                println!("{}", serde_json::to_string_pretty(&flow.fields())?);
                Ok(())
            } else {
                submit_options(&mut integration, set.into_iter().collect())
            };
            integration.unload();
            result?;
        }
        Command::Show => {
            integration.setup().await.context("failed to set up the entry")?;
            let context = integration.context().context("entry is not set up")?;
            println!("{}", serde_json::to_string_pretty(&context.sensor_states())?);
            integration.unload();
        }
        Command::Run => run(integration).await?,
        Command::Remove => {
            if integration.store().remove()? {
                println!("Removed {}", integration.store().path().display());
            } else {
                println!("Nothing to remove");
            }
        }
    }

    Ok(())
}

fn submit_options(
    integration: &mut Integration,
    input: BTreeMap<String, String>,
) -> anyhow::Result<()> {
    match integration.submit_options(input)? {
        FlowResult::CreateEntry { data, .. } => {
            println!(
                "Stored {} corrections; send SIGHUP to a running instance to apply them",
                data.len()
            );
            Ok(())
        }
        FlowResult::ShowForm { errors, .. } => bail!("invalid corrections: {errors:?}"),
    }
}

fn log_states(context: &IntegrationContext) {
    for state in context.sensor_states() {
        info!(
            sensor = %state.name,
            value = ?state.state,
            unit = ?state.unit_of_measurement,
            available = state.available,
            "sensor state"
        );
    }
}

/// Keeps the entry set up until Ctrl-C, reloading it whenever asked to.
async fn run(mut integration: Integration) -> anyhow::Result<()> {
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut hangups = Hangups::register();

    loop {
        match integration.setup().await {
            Ok(()) => {}
            Err(SetupError::NotReady(e)) => {
                warn!(error = %e, retry_in = ?SETUP_RETRY, "entry not ready");
                tokio::select! {
                    result = &mut shutdown => return Ok(result?),
                    _ = hangups.recv() => continue,
                    _ = sleep(SETUP_RETRY) => continue,
                }
            }
            Err(e) => return Err(e.into()),
        }

        let context = integration.context().context("entry is not set up")?;
        let mut updates = context.coordinator().subscribe();
        log_states(context);
        let mut options_changed = integration.update_listener();

        loop {
            tokio::select! {
                result = &mut shutdown => {
                    info!("shutting down");
                    integration.unload();
                    return Ok(result?);
                }
                _ = &mut options_changed => break,
                _ = hangups.recv() => {
                    info!("reload requested");
                    break;
                }
                changed = updates.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if let Some(context) = integration.context() {
                        log_states(context);
                    }
                }
            }
        }

        integration.unload();
    }
}

/// SIGHUP listener, registered once for the whole run so that a hangup
/// arriving between two waits is queued instead of killing the process.
#[cfg(unix)]
struct Hangups(Option<tokio::signal::unix::Signal>);

#[cfg(unix)]
impl Hangups {
    fn register() -> Self {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::hangup()) {
            Ok(hangups) => Self(Some(hangups)),
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGHUP");
                Self(None)
            }
        }
    }

    async fn recv(&mut self) {
        if let Some(hangups) = self.0.as_mut() {
            if hangups.recv().await.is_some() {
                return;
            }
        }
        std::future::pending::<()>().await
    }
}

#[cfg(not(unix))]
struct Hangups;

#[cfg(not(unix))]
impl Hangups {
    fn register() -> Self {
        Self
    }

    async fn recv(&mut self) {
        std::future::pending::<()>().await
    }
}
