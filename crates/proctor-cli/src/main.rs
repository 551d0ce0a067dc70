use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use proctor_core::collab::{StoreCostLedger, StoreNotificationSink};
use proctor_core::config::{load_config, write_sample_config, EngineConfig};
use proctor_core::engine::{CronDispatcher, RunExecutor, SuiteRunner, INVOKER_BREAKER};
use proctor_core::errors::{ConfigError, EngineError};
use proctor_core::functions::FunctionRegistry;
use proctor_core::model::{EvaluationSuite, FunctionMetadata, RunStatus, TestCaseResult};
use proctor_core::providers::{HttpVersionClient, Invocation, VersionClient, VersionInfo};
use proctor_core::resilience::{BreakerRegistry, CircuitBreaker};
use proctor_core::sandbox::{ProcessSandbox, Sandbox};
use proctor_core::storage::Store;

#[derive(Parser)]
#[command(
    name = "proctor",
    version,
    about = "Evaluation orchestration & scoring engine"
)]
struct Cli {
    /// Engine config file. Defaults apply when the file does not exist.
    #[arg(long, global = true, default_value = "proctor.yaml")]
    config: PathBuf,

    /// Reject unknown keys in the config file.
    #[arg(long, global = true)]
    strict: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a sample proctor.yaml
    Init,
    Suite(SuiteArgs),
    Run(RunArgs),
    Metrics(MetricsArgs),
    Function(FunctionArgs),
    /// Sweep PENDING runs, once or on a schedule
    Cron(CronArgs),
    /// Rewrite legacy 0-100 scale rates in storage to 0-1
    Migrate,
    Version,
}

#[derive(Parser)]
struct SuiteArgs {
    #[command(subcommand)]
    cmd: SuiteSub,
}

#[derive(Subcommand)]
enum SuiteSub {
    /// Import a suite document (YAML or JSON)
    Import {
        #[arg(long)]
        file: PathBuf,
        /// Override the document's tenant
        #[arg(long)]
        tenant: Option<String>,
    },
}

#[derive(Parser)]
struct RunArgs {
    #[command(subcommand)]
    cmd: RunSub,
}

#[derive(Subcommand)]
enum RunSub {
    /// Create a PENDING run
    Create {
        #[arg(long)]
        tenant: String,
        /// Suite name
        #[arg(long)]
        suite: String,
        /// Version under evaluation
        #[arg(long)]
        version: String,
    },
    /// Claim and execute one run
    Execute { run_id: i64 },
    /// Cancel a run that has not finished
    Cancel { run_id: i64 },
    /// Print one run as JSON
    Show { run_id: i64 },
    /// List a tenant's runs for a suite or a version
    List {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        suite: Option<String>,
        #[arg(long)]
        version: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Parser)]
struct MetricsArgs {
    #[command(subcommand)]
    cmd: MetricsSub,
}

#[derive(Subcommand)]
enum MetricsSub {
    /// Aggregate metrics of one run
    Run { run_id: i64 },
    /// Roll-up across a tenant's runs
    Tenant { tenant: String },
}

#[derive(Parser)]
struct FunctionArgs {
    #[command(subcommand)]
    cmd: FunctionSub,
}

#[derive(Subcommand)]
enum FunctionSub {
    /// Register a scoring function from a code file
    Register {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        file: PathBuf,
        /// Optional metadata document (parameters, examples)
        #[arg(long)]
        metadata: Option<PathBuf>,
    },
    /// Replace a function's code
    Update {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        file: PathBuf,
    },
    /// Replay a function's stored examples against its code
    Test {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        name: String,
    },
    /// Allow a function to be used by custom criteria again
    Activate {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        name: String,
    },
    /// Stop a function from being used by custom criteria
    Deactivate {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        name: String,
    },
}

#[derive(Parser)]
struct CronArgs {
    /// Run a single sweep and exit
    #[arg(long)]
    once: bool,
}

mod exit_codes {
    pub const OK: i32 = 0;
    pub const RUN_FAILED: i32 = 1;
    pub const CONFIG_ERROR: i32 = 2;
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    init_logging();
    let cli = Cli::parse();
    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("fatal: {e:?}");
            exit_codes::CONFIG_ERROR
        }
    };
    std::process::exit(code);
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    let Cli {
        config,
        strict,
        cmd,
    } = cli;
    match cmd {
        Command::Init => cmd_init(&config),
        Command::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(exit_codes::OK)
        }
        cmd => {
            let cfg = load_or_default(&config, strict)?;
            match cmd {
                Command::Suite(args) => match args.cmd {
                    SuiteSub::Import { file, tenant } => cmd_suite_import(&cfg, &file, tenant),
                },
                Command::Run(args) => match args.cmd {
                    RunSub::Create {
                        tenant,
                        suite,
                        version,
                    } => cmd_run_create(&cfg, &tenant, &suite, &version),
                    RunSub::Execute { run_id } => cmd_run_execute(&cfg, run_id).await,
                    RunSub::Cancel { run_id } => cmd_run_cancel(&cfg, run_id),
                    RunSub::Show { run_id } => cmd_run_show(&cfg, run_id),
                    RunSub::List {
                        tenant,
                        suite,
                        version,
                        limit,
                    } => cmd_run_list(&cfg, &tenant, suite, version, limit),
                },
                Command::Metrics(args) => match args.cmd {
                    MetricsSub::Run { run_id } => cmd_metrics_run(&cfg, run_id),
                    MetricsSub::Tenant { tenant } => cmd_metrics_tenant(&cfg, &tenant),
                },
                Command::Function(args) => match args.cmd {
                    FunctionSub::Register {
                        tenant,
                        name,
                        file,
                        metadata,
                    } => cmd_function_register(&cfg, &tenant, &name, &file, metadata).await,
                    FunctionSub::Update { tenant, name, file } => {
                        cmd_function_update(&cfg, &tenant, &name, &file).await
                    }
                    FunctionSub::Test { tenant, name } => {
                        cmd_function_test(&cfg, &tenant, &name).await
                    }
                    FunctionSub::Activate { tenant, name } => {
                        cmd_function_set_active(&cfg, &tenant, &name, true)
                    }
                    FunctionSub::Deactivate { tenant, name } => {
                        cmd_function_set_active(&cfg, &tenant, &name, false)
                    }
                },
                Command::Cron(args) => cmd_cron(&cfg, args.once).await,
                Command::Migrate => cmd_migrate(&cfg),
                Command::Init | Command::Version => unreachable!(),
            }
        }
    }
}

fn load_or_default(path: &Path, strict: bool) -> Result<EngineConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "no config file; using defaults");
        return Ok(EngineConfig::default());
    }
    load_config(path, strict)
}

fn cmd_init(config: &Path) -> anyhow::Result<i32> {
    if config.exists() {
        eprintln!("note: {} already exists", config.display());
        return Ok(exit_codes::OK);
    }
    ensure_parent_dir(config)?;
    write_sample_config(config)?;
    eprintln!("created {}", config.display());
    Ok(exit_codes::OK)
}

fn cmd_suite_import(
    cfg: &EngineConfig,
    file: &Path,
    tenant: Option<String>,
) -> anyhow::Result<i32> {
    let raw = std::fs::read_to_string(file)?;
    let mut suite: EvaluationSuite =
        serde_yaml::from_str(&raw).map_err(|e| anyhow::anyhow!("cannot parse suite document: {e}"))?;
    if let Some(t) = tenant {
        suite.tenant = t;
    }
    if suite.tenant.trim().is_empty() {
        anyhow::bail!("suite document needs a tenant (or pass --tenant)");
    }
    suite.validate()?;

    let store = open_store(cfg)?;
    let id = store.put_suite(&suite)?;
    eprintln!(
        "imported suite '{}' for tenant '{}' (id {}, {} cases)",
        suite.name,
        suite.tenant,
        id,
        suite.test_cases.len()
    );
    Ok(exit_codes::OK)
}

fn cmd_run_create(
    cfg: &EngineConfig,
    tenant: &str,
    suite_name: &str,
    version: &str,
) -> anyhow::Result<i32> {
    let store = open_store(cfg)?;
    let suite = store
        .suite_by_name(tenant, suite_name)?
        .ok_or_else(|| anyhow::anyhow!("no suite named '{suite_name}' for tenant '{tenant}'"))?;
    let run_id = store.create_run(tenant, suite.id, version, Some("cli"))?;
    eprintln!("created run {run_id} (suite '{suite_name}', version '{version}')");
    println!("{run_id}");
    Ok(exit_codes::OK)
}

async fn cmd_run_execute(cfg: &EngineConfig, run_id: i64) -> anyhow::Result<i32> {
    let store = open_store(cfg)?;
    let executor = build_executor(cfg, store.clone());

    match executor.execute(run_id).await {
        Ok(outcome) => {
            match outcome.status {
                RunStatus::Completed => {
                    let run = store.get_run(run_id)?;
                    if let Some(results) = &run.results {
                        print_results(results);
                    }
                    if let Some(m) = &outcome.metrics {
                        eprintln!(
                            "run {run_id} completed: pass_rate={:.2} overall_score={:.2} avg_ms={:.0}",
                            m.pass_rate, m.overall_score, m.avg_execution_ms
                        );
                    }
                }
                other => eprintln!("run {run_id} finished as {other}"),
            }
            Ok(exit_codes::OK)
        }
        Err(EngineError::ClaimLost { status }) => {
            eprintln!("not claimed: run {run_id} is already {status}");
            Ok(exit_codes::RUN_FAILED)
        }
        Err(e) => {
            eprintln!("run {run_id} failed: {e}");
            Ok(exit_codes::RUN_FAILED)
        }
    }
}

fn cmd_run_cancel(cfg: &EngineConfig, run_id: i64) -> anyhow::Result<i32> {
    let store = open_store(cfg)?;
    if store.cancel_run(run_id)? {
        eprintln!("cancelled run {run_id}");
    } else {
        eprintln!("note: run {run_id} already finished; nothing to cancel");
    }
    Ok(exit_codes::OK)
}

fn cmd_run_show(cfg: &EngineConfig, run_id: i64) -> anyhow::Result<i32> {
    let store = open_store(cfg)?;
    let run = store.get_run(run_id)?;
    println!("{}", serde_json::to_string_pretty(&run)?);
    Ok(exit_codes::OK)
}

fn cmd_run_list(
    cfg: &EngineConfig,
    tenant: &str,
    suite: Option<String>,
    version: Option<String>,
    limit: usize,
) -> anyhow::Result<i32> {
    let store = open_store(cfg)?;
    let runs = match (suite, version) {
        (Some(name), None) => {
            let suite = store
                .suite_by_name(tenant, &name)?
                .ok_or_else(|| anyhow::anyhow!("no suite named '{name}' for tenant '{tenant}'"))?;
            store.runs_for_suite(tenant, suite.id)?
        }
        (None, Some(v)) => store.runs_for_version(tenant, &v)?,
        _ => anyhow::bail!("pass exactly one of --suite or --version"),
    };

    for run in runs.iter().take(limit) {
        let rate = run
            .pass_rate
            .map(|p| format!("{p:.2}"))
            .unwrap_or_else(|| "-".into());
        println!(
            "{}\t{}\t{}\t{}\t{}",
            run.id, run.status, run.version_id, run.created_at, rate
        );
    }
    Ok(exit_codes::OK)
}

fn cmd_metrics_run(cfg: &EngineConfig, run_id: i64) -> anyhow::Result<i32> {
    let store = open_store(cfg)?;
    let metrics = store.run_metrics(run_id)?;
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    Ok(exit_codes::OK)
}

fn cmd_metrics_tenant(cfg: &EngineConfig, tenant: &str) -> anyhow::Result<i32> {
    let store = open_store(cfg)?;
    let metrics = store.tenant_metrics(tenant)?;
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    Ok(exit_codes::OK)
}

async fn cmd_function_register(
    cfg: &EngineConfig,
    tenant: &str,
    name: &str,
    file: &Path,
    metadata: Option<PathBuf>,
) -> anyhow::Result<i32> {
    let code = std::fs::read_to_string(file)?;
    let metadata: FunctionMetadata = match metadata {
        Some(p) => serde_yaml::from_str(&std::fs::read_to_string(&p)?)
            .map_err(|e| anyhow::anyhow!("cannot parse metadata document: {e}"))?,
        None => FunctionMetadata::default(),
    };

    let store = open_store(cfg)?;
    let registry = build_registry(cfg, store);
    let func = registry.register(tenant, name, &code, metadata).await?;
    eprintln!("registered '{}' v{} (id {})", func.name, func.version, func.id);
    Ok(exit_codes::OK)
}

async fn cmd_function_update(
    cfg: &EngineConfig,
    tenant: &str,
    name: &str,
    file: &Path,
) -> anyhow::Result<i32> {
    let code = std::fs::read_to_string(file)?;
    let store = open_store(cfg)?;
    let registry = build_registry(cfg, store);
    let func = registry.update(tenant, name, &code).await?;
    eprintln!("updated '{}' to v{}", func.name, func.version);
    Ok(exit_codes::OK)
}

async fn cmd_function_test(cfg: &EngineConfig, tenant: &str, name: &str) -> anyhow::Result<i32> {
    let store = open_store(cfg)?;
    let func = store
        .function_by_name(tenant, name)?
        .ok_or_else(|| anyhow::anyhow!("no scoring function '{name}' for tenant '{tenant}'"))?;

    let registry = build_registry(cfg, store);
    let reports = registry.test_function(func.id).await?;
    if reports.is_empty() {
        eprintln!("note: '{name}' has no stored examples");
        return Ok(exit_codes::OK);
    }

    let mut failed = 0;
    for r in &reports {
        if r.passed {
            eprintln!("PASS [{}]: score {:.3}", r.index, r.score.unwrap_or(0.0));
        } else {
            failed += 1;
            eprintln!(
                "FAIL [{}]: {}",
                r.index,
                r.error.as_deref().unwrap_or("score mismatch")
            );
        }
    }
    eprintln!("Examples: pass={} fail={}", reports.len() - failed, failed);
    Ok(if failed > 0 {
        exit_codes::RUN_FAILED
    } else {
        exit_codes::OK
    })
}

fn cmd_function_set_active(
    cfg: &EngineConfig,
    tenant: &str,
    name: &str,
    active: bool,
) -> anyhow::Result<i32> {
    let store = open_store(cfg)?;
    store.set_function_active(tenant, name, active)?;
    eprintln!(
        "'{name}' is now {}",
        if active { "active" } else { "inactive" }
    );
    Ok(exit_codes::OK)
}

async fn cmd_cron(cfg: &EngineConfig, once: bool) -> anyhow::Result<i32> {
    let store = open_store(cfg)?;
    let executor = build_executor(cfg, store.clone());
    let cron = CronDispatcher {
        store,
        executor,
        batch_size: cfg.cron.batch_size,
    };

    if once {
        let summary = cron.tick().await?;
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(exit_codes::OK);
    }

    let interval = Duration::from_secs(cfg.cron.interval_secs);
    eprintln!("dispatching every {}s (ctrl-c to stop)", cfg.cron.interval_secs);
    tokio::select! {
        _ = cron.run(interval) => {}
        _ = tokio::signal::ctrl_c() => {
            eprintln!("shutting down");
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_migrate(cfg: &EngineConfig) -> anyhow::Result<i32> {
    let store = open_store(cfg)?;
    let rewritten = store.normalize_historical()?;
    eprintln!("normalized {rewritten} runs");
    Ok(exit_codes::OK)
}

fn print_results(results: &[TestCaseResult]) {
    let mut pass = 0;
    let mut fail = 0;
    for r in results {
        if r.passed {
            pass += 1;
        } else {
            fail += 1;
            let why = r.error.as_deref().unwrap_or("scored below threshold");
            eprintln!("FAIL [{}]: {}", r.test_case_id, why);
        }
    }
    eprintln!("Results: pass={pass} fail={fail}");
}

fn open_store(cfg: &EngineConfig) -> anyhow::Result<Store> {
    let path = Path::new(&cfg.db);
    ensure_parent_dir(path)?;
    let store = Store::open(path)?;
    store.init_schema()?;
    Ok(store)
}

fn build_executor(cfg: &EngineConfig, store: Store) -> RunExecutor {
    let invoker: Arc<dyn VersionClient> = if cfg.invoker.base_url.is_empty() {
        Arc::new(EchoVersionClient)
    } else {
        Arc::new(HttpVersionClient::new(
            &cfg.invoker.base_url,
            cfg.invoker.api_key.clone().unwrap_or_default(),
        ))
    };
    let sandbox: Arc<dyn Sandbox> = Arc::new(ProcessSandbox::new(
        &cfg.sandbox.program,
        &cfg.sandbox.check_flag,
    ));
    let strategies =
        proctor_scoring::default_strategies(store.clone(), sandbox, cfg.sandbox.limits());
    let breakers = BreakerRegistry::new(vec![CircuitBreaker::new(
        INVOKER_BREAKER,
        cfg.breaker.config(),
    )]);
    let runner = SuiteRunner::new(
        invoker,
        strategies,
        cfg.retry.policy(),
        breakers,
        cfg.parallel,
    );
    RunExecutor {
        store: store.clone(),
        runner,
        ledger: Arc::new(StoreCostLedger {
            store: store.clone(),
        }),
        notifier: Arc::new(StoreNotificationSink { store }),
    }
}

fn build_registry(cfg: &EngineConfig, store: Store) -> FunctionRegistry {
    let sandbox: Arc<dyn Sandbox> = Arc::new(ProcessSandbox::new(
        &cfg.sandbox.program,
        &cfg.sandbox.check_flag,
    ));
    FunctionRegistry::new(store, sandbox, cfg.sandbox.limits())
}

fn ensure_parent_dir(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Local stand-in when no invoker endpoint is configured: echoes the test
/// case input back as the output. Only useful for smoke runs.
struct EchoVersionClient;

#[async_trait::async_trait]
impl VersionClient for EchoVersionClient {
    async fn resolve(&self, version_id: &str) -> Result<VersionInfo, EngineError> {
        Ok(VersionInfo {
            id: version_id.to_string(),
            name: "echo".into(),
            model: String::new(),
        })
    }

    async fn invoke(
        &self,
        _version_id: &str,
        input: &serde_json::Value,
    ) -> Result<Invocation, EngineError> {
        Ok(Invocation {
            output: input.clone(),
            tokens: 0,
            cost_usd: 0.0,
        })
    }
}
