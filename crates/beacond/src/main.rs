use anyhow::Context;
use beacon_types::{DeliveryOutcome, MessageId, Recipient};
use beacond::logging::{DiagnosticFormat, LoggingConfig};
use beacond::{PluginController, TrackingConfig};
use clap::{Args, Parser};
use mimetree::MimeNode;
use std::io::{Read, Write};
use std::path::PathBuf;

/// Email open and click tracking.
///
/// Instruments the html part of a message with an open beacon and
/// tracked links, and reports delivery outcomes to the tracking service.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Opt {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Base url of the tracking service. Overrides any
    /// base_url in the configuration file.
    #[arg(long)]
    base_url: Option<String>,

    /// Directory where diagnostic log files will be placed.
    /// If omitted, diagnostics will be printed to stderr.
    #[arg(long)]
    diag_log_dir: Option<PathBuf>,

    /// How diagnostic logs render. full, compact and pretty are intended
    /// for human consumption. json outputs machine readable records.
    #[arg(long, default_value = "full")]
    diag_format: DiagnosticFormat,

    /// Print the prometheus metrics to stdout before exiting
    #[arg(long)]
    dump_metrics: bool,

    #[command(subcommand)]
    cmd: SubCommand,
}

#[derive(Debug, Parser)]
enum SubCommand {
    /// Rewrite a message, adding the open beacon and tracked links
    Rewrite(RewriteCommand),
    /// Report a successful delivery
    Delivered(OutcomeCommand),
    /// Report a permanent failure
    Bounced(OutcomeCommand),
    /// Report a temporary failure. Only sent when
    /// dispatch_deferred is enabled in the configuration.
    Deferred(OutcomeCommand),
}

#[derive(Debug, Args)]
struct RewriteCommand {
    #[arg(long)]
    message_id: String,

    /// Read the message from this file rather than stdin
    #[arg(long)]
    input: Option<PathBuf>,

    /// Write the rewritten message to this file rather than stdout
    #[arg(long)]
    output: Option<PathBuf>,
}

impl RewriteCommand {
    fn run(&self, controller: &PluginController) -> anyhow::Result<()> {
        let mut data = vec![];
        match &self.input {
            Some(path) => {
                data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?
            }
            None => {
                std::io::stdin()
                    .read_to_end(&mut data)
                    .context("reading message from stdin")?;
            }
        }

        let mut root = MimeNode::parse(&data).context("parsing message")?;
        let message_id = MessageId::new(self.message_id.as_str());
        controller.on_body_ready(&message_id, &mut root, || {});
        let rendered = root.to_message_bytes().context("rendering message")?;

        match &self.output {
            Some(path) => std::fs::write(path, &rendered)
                .with_context(|| format!("writing {}", path.display()))?,
            None => {
                let mut stdout = std::io::stdout().lock();
                stdout.write_all(&rendered)?;
                stdout.flush()?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Args)]
struct OutcomeCommand {
    #[arg(long)]
    message_id: String,

    /// Enhanced status code reported by the remote host
    #[arg(long)]
    status: Option<String>,

    /// Status message reported by the remote host
    #[arg(long)]
    status_message: Option<String>,

    /// The recipients of the message
    recipients: Vec<String>,
}

impl OutcomeCommand {
    fn message_id(&self) -> MessageId {
        MessageId::new(self.message_id.as_str())
    }

    fn outcome(&self) -> DeliveryOutcome {
        DeliveryOutcome::new(self.recipients.iter().map(Recipient::new).collect())
            .with_status(self.status.clone(), self.status_message.clone())
    }
}

impl SubCommand {
    async fn run(&self, controller: &PluginController) -> anyhow::Result<()> {
        match self {
            Self::Rewrite(cmd) => cmd.run(controller)?,
            Self::Delivered(cmd) => {
                controller.on_delivered(&cmd.message_id(), &cmd.outcome(), || {})
            }
            Self::Bounced(cmd) => controller.on_bounced(&cmd.message_id(), &cmd.outcome(), || {}),
            Self::Deferred(cmd) => {
                controller.on_deferred(&cmd.message_id(), &cmd.outcome(), || {})
            }
        }
        controller.wait_idle().await;
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();

    let _log_guard = LoggingConfig {
        log_dir: opts.diag_log_dir.clone(),
        filter_env_var: "BEACOND_LOG",
        default_filter: "beacond=info,beacon_api_client=info",
        diag_format: opts.diag_format,
    }
    .init()?;

    let mut config = match &opts.config {
        Some(path) => TrackingConfig::load(path)?,
        None => TrackingConfig::default(),
    };
    if let Some(base_url) = &opts.base_url {
        config = config.with_base_url(base_url);
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?
        .block_on(async move { run(opts, config).await })
}

async fn run(opts: Opt, config: TrackingConfig) -> anyhow::Result<()> {
    let controller =
        PluginController::with_http_transport(&config, tokio::runtime::Handle::current())?;

    opts.cmd.run(&controller).await?;

    if opts.dump_metrics {
        print!("{}", beacond::metrics::render_metrics()?);
    }
    Ok(())
}
