use capability_orchestrator::app::plugins::registry_from_config;
use capability_orchestrator::core::job::JobState;
use capability_orchestrator::domain::model::Account;
use capability_orchestrator::domain::ports::ServiceInstanceStore;
use capability_orchestrator::utils::error::{ErrorSeverity, OrchestratorError, Result};
use capability_orchestrator::utils::{logger, validation::Validate};
use capability_orchestrator::{
    CapabilityManifest, CapabilityProvisioningOrchestrator, CliConfig, InMemoryStore,
    OrchestratorConfig,
};
use clap::Parser;
use std::sync::Arc;

fn main() {
    let cli = CliConfig::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => exit_with(&e),
    };

    // 初始化日誌
    if config.json_logging() {
        logger::init_json_logger(&config.logging.level);
    } else {
        logger::init_cli_logger(cli.verbose);
    }

    tracing::info!("Starting capability-orchestrator CLI");
    if cli.verbose {
        tracing::debug!("CLI config: {:?}", cli);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads())
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => exit_with(&OrchestratorError::IoError(e)),
    };

    if let Err(e) = runtime.block_on(run(cli, config)) {
        exit_with(&e);
    }
}

fn load_config(cli: &CliConfig) -> Result<OrchestratorConfig> {
    cli.validate()?;
    let config = match &cli.config {
        Some(path) => OrchestratorConfig::from_file(path)?,
        None => OrchestratorConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

async fn run(cli: CliConfig, config: OrchestratorConfig) -> Result<()> {
    let manifest = CapabilityManifest::from_file(&cli.manifest)?;
    manifest.validate()?;

    let plugins = registry_from_config(&config.plugins);
    if plugins.plugin_types().is_empty() {
        tracing::warn!("⚠️ No [[plugins]] configured, every service will fail validation");
    }

    // 以 manifest 內容初始化記憶體 store
    let store = Arc::new(InMemoryStore::new());
    let account_id = store.insert_account(Account::new(&cli.account)).await;
    let (capability, definitions) = manifest.into_parts();
    let capability_name = capability.name.clone();
    for definition in definitions {
        store.insert_definition(definition).await;
    }
    let capability_id = store.insert_capability(capability).await;

    let mut settings = config.settings();
    settings.sync |= cli.sync;
    let orchestrator = CapabilityProvisioningOrchestrator::new(store.clone(), plugins, settings);

    if cli.dry_run {
        let levels = orchestrator.plan(capability_id).await?;
        println!("📋 Plan for '{}':", capability_name);
        for (depth, level) in levels.iter().enumerate() {
            let keys: Vec<String> = level.iter().map(|d| d.key()).collect();
            println!("  level {}: {}", depth, keys.join(", "));
        }
        return Ok(());
    }

    let outcome = orchestrator.apply(account_id, capability_id).await?;
    let record = orchestrator.wait(&outcome).await?;

    let status = orchestrator
        .capability_status(account_id, capability_id)
        .await?
        .map(|s| s.to_string())
        .unwrap_or_else(|| "UNKNOWN".to_string());
    println!("📦 Capability '{}' on '{}': {}", capability_name, cli.account, status);

    for instance in store.list_instances(account_id).await? {
        println!(
            "  {:<12} {}/{} {}",
            instance.status.to_string(),
            instance.plugin_type,
            instance.name,
            instance.resource_id.as_deref().unwrap_or("-")
        );
    }
    if let Some(result) = &record.result {
        println!("{}", serde_json::to_string_pretty(result)?);
    }

    match record.state {
        JobState::Failed(message) => Err(OrchestratorError::ResourceCreationError {
            instance: capability_name,
            message,
        }),
        _ => {
            println!("✅ Apply completed successfully!");
            Ok(())
        }
    }
}

fn exit_with(e: &OrchestratorError) -> ! {
    tracing::error!(
        "❌ Apply failed: {} (Category: {:?}, Severity: {:?})",
        e,
        e.category(),
        e.severity()
    );
    tracing::error!("💡 Recovery suggestion: {}", e.recovery_suggestion());

    eprintln!("❌ {}", e.user_friendly_message());
    eprintln!("💡 建議: {}", e.recovery_suggestion());

    // 根據錯誤嚴重程度決定退出碼
    let exit_code = match e.severity() {
        ErrorSeverity::Low => 0,
        ErrorSeverity::Medium => 2,
        ErrorSeverity::High => 1,
        ErrorSeverity::Critical => 3,
    };
    std::process::exit(exit_code)
}
