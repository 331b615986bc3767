//! kwpm command line
//!
//! ```bash
//! # Print the site manifests
//! kwpm --config blog.yaml render --all
//!
//! # Check a manifest written by hand
//! kwpm validate deployment.yaml
//!
//! # Apply with debug logging
//! RUST_LOG=debug kwpm --config blog.yaml apply
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use kwpm::manifest::mariadb::DEFAULT_PV_BASE_PATH;
use kwpm::manifest::{render, wordpress, Manifest};
use kwpm::{preflight, validation, ApplyOutcome, DbCredentials, KwpmClient, SiteSpec};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Kubernetes WordPress manager
#[derive(Parser, Debug)]
#[command(name = "kwpm")]
#[command(version, about = "Render, validate and apply WordPress sites on Kubernetes")]
struct Args {
    /// Site configuration file (YAML or JSON)
    #[arg(long, short, global = true, env = "KWPM_CONFIG")]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Base directory for local persistent volumes
    #[arg(long, global = true, env = "KWPM_PV_BASE_PATH", default_value = DEFAULT_PV_BASE_PATH)]
    pv_base_path: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the site deployment as YAML
    Render {
        /// Include service, config maps and claim
        #[arg(long)]
        all: bool,
    },
    /// Check a deployment manifest for broken invariants
    Validate {
        /// Manifest file; the configured site is checked when omitted
        file: Option<PathBuf>,
    },
    /// Create the namespace, config maps, claim and database secret
    Provision {
        #[arg(long, env = "KWPM_DB_USER")]
        db_user: Option<String>,
        #[arg(long, env = "KWPM_DB_PASSWORD", hide_env_values = true)]
        db_password: Option<String>,
        #[arg(long, env = "KWPM_DB_NAME")]
        db_name: Option<String>,
    },
    /// Report dependencies the site deployment is missing in the cluster
    Preflight,
    /// Apply the site deployment and service
    Apply,
    /// Delete the site deployment and service
    Delete,
    /// Roll the site pods
    Restart,
    /// List kwpm namespaces
    Namespaces,
    /// Manage the shared MariaDB backend
    Mariadb {
        #[command(subcommand)]
        command: MariadbCommand,
    },
    /// Print the JSON schema of the site configuration
    Schema,
}

#[derive(Subcommand, Debug)]
enum MariadbCommand {
    Create {
        #[arg(long, env = "KWPM_MARIADB_ROOT_PASSWORD", hide_env_values = true)]
        root_password: String,
        /// Node hosting the local volume
        #[arg(long)]
        node: String,
    },
    Remove,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match args.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
    }

    let site = match &args.config {
        Some(path) => SiteSpec::load(path)?,
        None => SiteSpec::default(),
    };

    match args.command {
        Command::Render { all } => {
            let mut manifests = Vec::new();
            if all {
                manifests.push(Manifest::ConfigMap(wordpress::uploads_config_map(&site)));
                manifests.push(Manifest::ConfigMap(wordpress::nginx_config_map(&site)));
                manifests.push(Manifest::PersistentVolumeClaim(wordpress::storage_claim(&site)));
                manifests.push(Manifest::Service(wordpress::service(&site)));
            }
            manifests.push(Manifest::Deployment(wordpress::deployment(&site)));
            print!("{}", render::to_yaml(&manifests)?);
        }
        Command::Validate { file } => {
            let deployment = match file {
                Some(path) => render::parse_deployment(&std::fs::read_to_string(path)?)?,
                None => wordpress::deployment(&site),
            };
            let violations = validation::validate(&deployment);
            if violations.is_empty() {
                info!("Deployment is valid");
            } else {
                for v in &violations {
                    error!("{}", v);
                }
                anyhow::bail!("{} violation(s) found", violations.len());
            }
        }
        Command::Schema => {
            let schema = schemars::schema_for!(SiteSpec);
            println!("{}", serde_json::to_string_pretty(&schema)?);
        }
        command => run_against_cluster(command, &site, &args.pv_base_path).await?,
    }

    Ok(())
}

async fn run_against_cluster(
    command: Command,
    site: &SiteSpec,
    pv_base_path: &str,
) -> anyhow::Result<()> {
    let client = KwpmClient::new(pv_base_path).await?;
    info!("Connected to Kubernetes API server");

    match command {
        Command::Provision {
            db_user,
            db_password,
            db_name,
        } => {
            let credentials = match (db_user, db_password, db_name) {
                (Some(user), Some(password), Some(db_name)) => Some(DbCredentials {
                    user,
                    password,
                    db_name,
                }),
                (None, None, None) => None,
                _ => anyhow::bail!("--db-user, --db-password and --db-name go together"),
            };
            client.provision_site(site, credentials.as_ref()).await?;
        }
        Command::Preflight => {
            let inventory = client.inventory(&site.namespace()).await?;
            let missing = preflight::check(&wordpress::deployment(site), &inventory);
            if missing.is_empty() {
                info!(namespace = %site.namespace(), "All dependencies present");
            } else {
                for m in &missing {
                    error!("Missing {}", m);
                }
                anyhow::bail!("{} missing dependencies", missing.len());
            }
        }
        Command::Apply => match client.apply_site(site).await? {
            ApplyOutcome::Created => info!(site = %site.name, "Created"),
            ApplyOutcome::Updated(paths) => {
                info!(site = %site.name, fields = paths.len(), "Updated")
            }
            ApplyOutcome::Unchanged => info!(site = %site.name, "Unchanged"),
        },
        Command::Delete => client.delete_site(site).await?,
        Command::Restart => client.restart_site(site).await?,
        Command::Namespaces => {
            for ns in client.kwpm_namespaces().await? {
                let phase = ns
                    .status
                    .as_ref()
                    .and_then(|s| s.phase.clone())
                    .unwrap_or_default();
                let age = ns
                    .metadata
                    .creation_timestamp
                    .as_ref()
                    .map(|t| format_age(chrono::Utc::now() - t.0))
                    .unwrap_or_default();
                println!(
                    "{}\t{}\t{}",
                    ns.metadata.name.unwrap_or_default(),
                    phase,
                    age
                );
            }
        }
        Command::Mariadb { command } => match command {
            MariadbCommand::Create {
                root_password,
                node,
            } => {
                client
                    .create_mariadb_if_not_exists(&root_password, &node)
                    .await?
            }
            MariadbCommand::Remove => client.remove_mariadb().await?,
        },
        Command::Render { .. } | Command::Validate { .. } | Command::Schema => {}
    }
    Ok(())
}

fn format_age(age: chrono::Duration) -> String {
    if age.num_days() > 0 {
        format!("{}d", age.num_days())
    } else if age.num_hours() > 0 {
        format!("{}h", age.num_hours())
    } else {
        format!("{}m", age.num_minutes().max(0))
    }
}
