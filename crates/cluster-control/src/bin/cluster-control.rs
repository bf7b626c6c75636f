//! cluster-control CLI - provision and operate a small EC2 cluster.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use cluster_control::github::GithubClient;
use cluster_control::provider::aws::AwsCli;
use cluster_control::remote::SshConnector;
use cluster_control::service::follow_logs_script;
use cluster_control::template::Timeouts;
use cluster_control::{
    ui, BatchReport, Bootstrapper, ClusterDir, ClusterState, ClusterTemplate, Deprovisioner,
    Provisioner, ServiceController, SourceUpdater,
};

/// Provision and operate a small EC2 cluster running one service.
#[derive(Parser)]
#[command(name = "cluster-control", version)]
#[command(about = "Provision and operate a small EC2 cluster running one service")]
struct Cli {
    /// Directory holding the template, state and keys of the cluster.
    #[arg(long, env = "CLUSTER_CONTROL_DIR", default_value = ".cluster-control", global = true)]
    dir: PathBuf,

    /// AWS named profile (or set `AWS_PROFILE` env var).
    #[arg(long, env = "AWS_PROFILE", global = true)]
    aws_profile: Option<String>,

    /// GitHub token for deploy keys (or set `GITHUB_TOKEN` env var).
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true, global = true)]
    github_token: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a template and store it in the cluster directory.
    Create {
        /// Template file (YAML).
        template: PathBuf,
    },

    /// Allocate all resources and bootstrap the instances.
    Up,

    /// Start the service on every instance.
    Start,

    /// Stop the service on every instance.
    Stop,

    /// Fast-forward the source checkout on every instance.
    Pull,

    /// Run the build command on every instance.
    Build,

    /// Release every resource of the cluster.
    Down,

    /// Show recorded resources and service status.
    Status,

    /// Print the service address.
    Ip {
        /// Print the public address of every instance.
        #[arg(long)]
        all: bool,
    },

    /// Open a shell on an instance.
    Ssh {
        /// Instance index.
        #[arg(short, long, default_value_t = 0)]
        instance: usize,
    },

    /// Follow the service journal on an instance.
    Logs {
        /// Instance index.
        #[arg(short, long, default_value_t = 0)]
        instance: usize,
    },

    /// Copy a file from an instance.
    Get {
        /// Path on the instance.
        remote: String,
        /// Local destination.
        local: PathBuf,
        /// Instance index.
        #[arg(short, long, default_value_t = 0)]
        instance: usize,
    },

    /// Copy a file to an instance.
    Put {
        /// Local file.
        local: PathBuf,
        /// Destination on the instance.
        remote: String,
        /// Instance index.
        #[arg(short, long, default_value_t = 0)]
        instance: usize,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "info,cluster_control=debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn connector(dir: &ClusterDir, template: &ClusterTemplate) -> SshConnector {
    SshConnector::new(
        template.instances.user.clone(),
        dir.key_file(&template.key_pair_name()),
    )
}

fn github_client(token: Option<&str>) -> Result<Option<GithubClient>> {
    token
        .map(GithubClient::new)
        .transpose()
        .context("Failed to create GitHub client")
}

/// Print per-instance results, then fail if any instance failed.
fn finish(report: &BatchReport) -> Result<()> {
    ui::print_report(report);
    report.ensure_success()?;
    Ok(())
}

/// Interactive ssh session on one instance.
async fn open_session(
    dir: &ClusterDir,
    template: &ClusterTemplate,
    instance: usize,
    script: Option<&str>,
) -> Result<()> {
    let state = ClusterState::load_active(dir, "connect")?;
    let transport = connector(dir, template).transport(state.instance(instance)?)?;
    let status = transport.interactive(script).await?;
    if !status.success() {
        bail!("ssh exited with {status}");
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        ui::print_error(&format!("{e:#}"));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let dir = ClusterDir::new(cli.dir.clone());

    match cli.command {
        Commands::Create { template } => {
            let parsed = dir.create(&template)?;
            ui::print_success(&format!(
                "Cluster '{}' defined in {}",
                parsed.name,
                dir.root().display()
            ));
        }

        Commands::Up => {
            let template = dir.load_template()?;
            let ec2 = AwsCli::new(&template.region).with_profile(cli.aws_profile.clone());
            let github = github_client(cli.github_token.as_deref())?;

            ui::print_section(&format!("Bringing up {}", template.name));
            ui::print_step("Allocating resources");
            let mut provisioner = Provisioner::new(&ec2, &dir, &template);
            if let Some(github) = &github {
                provisioner = provisioner.with_deploy_keys(github);
            }
            let mut state = provisioner.up().await?;

            ui::print_step("Bootstrapping instances");
            let connector = connector(&dir, &template);
            let report = Bootstrapper::new(&dir, &template, &connector)
                .run(&mut state)
                .await?;
            finish(&report)?;

            if let Some(address) = state.service_address() {
                ui::print_kv("Service", &format!("{address}:{}", template.service.port));
            }
        }

        Commands::Start => {
            let template = dir.load_template()?;
            let connector = connector(&dir, &template);
            let controller = ServiceController::new(&dir, &template, &connector);
            finish(&controller.start().await?)?;
        }

        Commands::Stop => {
            let template = dir.load_template()?;
            let connector = connector(&dir, &template);
            let controller = ServiceController::new(&dir, &template, &connector);
            finish(&controller.stop().await?)?;
        }

        Commands::Pull => {
            let template = dir.load_template()?;
            let connector = connector(&dir, &template);
            let updater = SourceUpdater::new(&dir, &template, &connector);
            finish(&updater.pull().await?)?;
        }

        Commands::Build => {
            let template = dir.load_template()?;
            let connector = connector(&dir, &template);
            let updater = SourceUpdater::new(&dir, &template, &connector);
            finish(&updater.build().await?)?;
        }

        Commands::Down => {
            let Some(state) = ClusterState::load(&dir)? else {
                ui::print_info("No cluster state, nothing to release");
                return Ok(());
            };
            let timeouts = match dir.load_template() {
                Ok(template) => template.timeouts,
                Err(e) => {
                    warn!(error = %e, "Using default timeouts");
                    Timeouts::default()
                }
            };
            let ec2 = AwsCli::new(&state.region).with_profile(cli.aws_profile.clone());
            let github = github_client(cli.github_token.as_deref())?;

            ui::print_section(&format!("Tearing down {}", state.name));
            let mut deprovisioner = Deprovisioner::new(&ec2, &dir).with_timeouts(timeouts);
            if let Some(github) = &github {
                deprovisioner = deprovisioner.with_deploy_keys(github);
            }
            deprovisioner.down().await?;
            ui::print_success("All resources released");
        }

        Commands::Status => match ClusterState::load(&dir)? {
            Some(state) => ui::print_state(&state),
            None => ui::print_info(&format!(
                "No cluster is provisioned in {}",
                dir.root().display()
            )),
        },

        Commands::Ip { all } => {
            let state = ClusterState::load_active(&dir, "ip")?;
            if all {
                for instance in &state.instances {
                    println!(
                        "{}\t{}",
                        instance.name,
                        instance.public_ip.as_deref().unwrap_or("-")
                    );
                }
            } else {
                match state.service_address() {
                    Some(address) => println!("{address}"),
                    None => bail!("no public address recorded for {}", state.name),
                }
            }
        }

        Commands::Ssh { instance } => {
            let template = dir.load_template()?;
            open_session(&dir, &template, instance, None).await?;
        }

        Commands::Logs { instance } => {
            let template = dir.load_template()?;
            let script = follow_logs_script(&template);
            open_session(&dir, &template, instance, Some(&script)).await?;
        }

        Commands::Get {
            remote,
            local,
            instance,
        } => {
            let state = ClusterState::load_active(&dir, "copy")?;
            let template = dir.load_template()?;
            let transport = connector(&dir, &template).transport(state.instance(instance)?)?;
            transport.copy_from(&remote, &local).await?;
            ui::print_success(&format!("Copied {remote} to {}", local.display()));
        }

        Commands::Put {
            local,
            remote,
            instance,
        } => {
            let state = ClusterState::load_active(&dir, "copy")?;
            let template = dir.load_template()?;
            let transport = connector(&dir, &template).transport(state.instance(instance)?)?;
            transport.copy_to(&local, &remote).await?;
            ui::print_success(&format!("Copied {} to {remote}", local.display()));
        }
    }

    Ok(())
}
