mod logging;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{ArgGroup, Parser, Subcommand};
use rescue_core::{AnimalDraft, Environment, ProductionOverride};
use rescue_identity::{assign_external_id, OrganizationRegistry};
use rescue_reconcile::{
    check_reset_preconditions, reset_all, AmbiguityPolicy, ExecuteRequest, MigrationPlan, ReconcileConfig,
    ReconcileError, Reconciler, ResetConfirmation,
};
use rescue_storage::{ArchivedEntry, AuditArchive, PgStore, StoreError};
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "rescue-cli", version)]
#[command(about = "Maintenance CLI for rescue listing identifiers")]
struct Cli {
    /// Overrides DATABASE_URL
    #[arg(long, global = true)]
    database_url: Option<String>,
    /// Overrides RESCUE_ENVIRONMENT
    #[arg(long, global = true)]
    environment: Option<Environment>,
    /// Overrides RESCUE_ORGANIZATIONS_FILE
    #[arg(long, global = true)]
    organizations: Option<std::path::PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Plan, or apply, the identifier migration for one organization
    #[command(group(ArgGroup::new("mode").required(true).args(["dry_run", "apply"])))]
    Reconcile {
        #[arg(long)]
        org: String,
        /// Print the plan and its checksum without writing anything
        #[arg(long)]
        dry_run: bool,
        /// Apply the plan whose checksum is passed to --confirm
        #[arg(long, requires = "confirm")]
        apply: bool,
        #[arg(long)]
        confirm: Option<String>,
        /// Apply resolvable groups even when others are ambiguous
        #[arg(long)]
        exclude_ambiguous: bool,
        #[arg(long)]
        allow_production: bool,
    },
    /// Delete every animal, image, and scrape log
    ResetAll {
        /// Must be exactly "DELETE ALL"
        #[arg(long)]
        confirm: String,
        /// Must be exactly "yes"
        #[arg(long)]
        go_ahead: String,
        /// Also needs RESCUE_RESET_PRODUCTION_UNLOCK=1
        #[arg(long)]
        allow_production: bool,
    },
    /// Apply pending schema migrations
    Migrate,
    /// Show which identifier scheme an external id belongs to
    Classify {
        #[arg(long)]
        external_id: String,
    },
    /// Print the current-scheme external id for a listing
    GenerateId {
        #[arg(long)]
        org: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        animal_type: Option<String>,
        #[arg(long)]
        breed: Option<String>,
        #[arg(long)]
        sex: Option<String>,
        #[arg(long)]
        age: Option<String>,
    },
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    if let Some(err) = err.downcast_ref::<ReconcileError>() {
        return err.exit_code();
    }
    match err.downcast_ref::<StoreError>() {
        Some(store) if store.is_unreachable() => 2,
        _ => 1,
    }
}

/// Collects the typed answers and rejects them before any connection is opened.
fn reset_confirmation(
    config: &ReconcileConfig,
    confirm: String,
    go_ahead: String,
    allow_production: bool,
) -> Result<ResetConfirmation, ReconcileError> {
    if allow_production && !config.reset_production_unlock {
        warn!("--allow-production ignored: RESCUE_RESET_PRODUCTION_UNLOCK is not set");
    }
    let confirmation = ResetConfirmation {
        typed_confirmation: confirm,
        typed_go_ahead: go_ahead,
        production_override: ProductionOverride::from_flag(allow_production && config.reset_production_unlock),
    };
    check_reset_preconditions(config.environment, &confirmation)?;
    Ok(confirmation)
}

/// A dry run still reports its plan when the reports directory is not writable.
async fn archive_plan(archive: &AuditArchive, plan: &MigrationPlan) -> Option<ArchivedEntry> {
    match archive.store_json(&plan.org_id, "plan", plan).await {
        Ok(entry) => {
            info!(path = %entry.absolute_path.display(), checksum = %plan.checksum, "plan archived");
            Some(entry)
        }
        Err(err) => {
            warn!("plan not archived: {err:#}");
            None
        }
    }
}

fn load_registry(config: &ReconcileConfig) -> Result<Arc<OrganizationRegistry>> {
    Ok(Arc::new(OrganizationRegistry::load(&config.organizations_file)?))
}

async fn connect(config: &ReconcileConfig) -> Result<Arc<PgStore>> {
    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to the listing store")?;
    Ok(Arc::new(store))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = ReconcileConfig::from_env()?;
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }
    if let Some(environment) = cli.environment {
        config.environment = environment;
    }
    if let Some(path) = cli.organizations {
        config.organizations_file = path;
    }
    let archive = AuditArchive::new(config.reports_dir.clone());

    match cli.command {
        Commands::Reconcile {
            org,
            dry_run,
            apply: _,
            confirm,
            exclude_ambiguous,
            allow_production,
        } => {
            let registry = load_registry(&config)?;
            let store = connect(&config).await?;
            let reconciler = Reconciler::new(store, registry);
            let plan = reconciler.plan_organization(&org).await?;

            if dry_run {
                archive_plan(&archive, &plan).await;
                return print_json(&plan);
            }

            let request = ExecuteRequest {
                confirmation: confirm.unwrap_or_default(),
                environment: config.environment,
                production_override: ProductionOverride::from_flag(allow_production || config.allow_production),
                ambiguity: if exclude_ambiguous {
                    AmbiguityPolicy::ExcludeAmbiguous
                } else {
                    AmbiguityPolicy::Refuse
                },
            };
            let report = match reconciler.execute(&plan, &request).await {
                Ok(report) => report,
                Err(err) => {
                    if err.may_have_mutated() {
                        error!(org_id = %org, error = %err, "reconciliation stopped after writing");
                    }
                    return Err(err.into());
                }
            };
            let entry = archive.store_json(&org, "report", &report).await?;
            info!(path = %entry.absolute_path.display(), run_id = %report.run_id, "report archived");
            print_json(&report)
        }
        Commands::ResetAll {
            confirm,
            go_ahead,
            allow_production,
        } => {
            let confirmation = reset_confirmation(&config, confirm, go_ahead, allow_production)?;
            let store = connect(&config).await?;
            let report = reset_all(&*store, config.environment, &confirmation).await?;
            let entry = archive.store_json("", "reset", &report).await?;
            info!(path = %entry.absolute_path.display(), "reset report archived");
            print_json(&report)
        }
        Commands::Migrate => {
            let store = connect(&config).await?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
            Ok(())
        }
        Commands::Classify { external_id } => {
            let registry = load_registry(&config)?;
            let org_id = registry.organization_for(&external_id).map(|o| o.org_id.clone());
            print_json(&serde_json::json!({
                "external_id": external_id,
                "org_id": org_id,
                "classification": registry.classify(&external_id),
            }))
        }
        Commands::GenerateId {
            org,
            name,
            animal_type,
            breed,
            sex,
            age,
        } => {
            let registry = load_registry(&config)?;
            let identity = registry
                .get(&org)
                .ok_or_else(|| ReconcileError::UnknownOrganization(org.clone()))?;
            let mut draft = AnimalDraft::new(org.clone(), name, Utc::now());
            draft.animal_type = animal_type;
            draft.breed = breed;
            draft.sex = sex;
            draft.age_text = age;
            println!("{}", assign_external_id(identity, &mut draft));
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = exit_code_for(&err);
            error!(exit_code = code, "{err:#}");
            eprintln!("error: {err:#}");
            ExitCode::from(code)
        }
    }
}
