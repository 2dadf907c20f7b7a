// crates/replica-judge-cli/src/main.rs
// ============================================================================
// Module: Replica Judge CLI Entry Point
// Description: Command dispatcher for evaluator, rule, lock, and backlog tasks.
// Purpose: Drive the evaluator and inspect its state from the command line.
// Dependencies: clap, replica-judge-config, replica-judge-core,
//               replica-judge-store-sqlite, serde_json, thiserror, tokio.
// ============================================================================

//! ## Overview
//! `replica-judge` loads `replica-judge.toml`, materializes the collaborator
//! snapshot named by `[inventory]`, opens the configured store, and runs one
//! subcommand. Results are JSON on stdout; failures are a single line on
//! stderr with a failure exit code. `evaluate` runs the blocking evaluator
//! loop off the async runtime and stops between passes on Ctrl-C.

// ============================================================================
// SECTION: Modules
// ============================================================================


// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs::File;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use clap::Args;
use clap::Parser;
use clap::Subcommand;
use replica_judge_config::EventSinkKind;
use replica_judge_config::EventsConfig;
use replica_judge_config::JudgeConfig;
use replica_judge_config::MAX_DID_LIMIT;
use replica_judge_core::AccountId;
use replica_judge_core::ChangeBacklog;
use replica_judge_core::ChangeHooks;
use replica_judge_core::DidKey;
use replica_judge_core::Evaluator;
use replica_judge_core::EvaluatorEventSink;
use replica_judge_core::FileEventSink;
use replica_judge_core::InMemoryBacklog;
use replica_judge_core::InMemoryIdentifierGraph;
use replica_judge_core::InMemoryLockStore;
use replica_judge_core::InMemoryQuotaGate;
use replica_judge_core::InMemoryResourceCatalog;
use replica_judge_core::InMemoryRuleStore;
use replica_judge_core::Inventory;
use replica_judge_core::InventoryCollaborators;
use replica_judge_core::LockStore;
use replica_judge_core::NoopEventSink;
use replica_judge_core::QuotaAllowance;
use replica_judge_core::QuotaError;
use replica_judge_core::QuotaGate;
use replica_judge_core::RseId;
use replica_judge_core::RuleId;
use replica_judge_core::RuleSpec;
use replica_judge_core::RuleStore;
use replica_judge_core::RunMode;
use replica_judge_core::StderrEventSink;
use replica_judge_core::StoreError;
use replica_judge_core::Timestamp;
use replica_judge_core::create_rule;
use replica_judge_core::get_rule;
use replica_judge_core::list_dataset_locks;
use replica_judge_core::list_file_locks;
use replica_judge_store_sqlite::MAX_SPEC_BYTES;
use replica_judge_store_sqlite::SqliteJudgeStore;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

// ============================================================================
// SECTION: CLI Types
// ============================================================================

/// Top-level CLI definition.
#[derive(Parser, Debug)]
#[command(name = "replica-judge", version, disable_help_subcommand = true)]
struct Cli {
    /// Selected subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the rule evaluator.
    Evaluate(EvaluateCommand),
    /// Replication rule utilities.
    Rule {
        /// Selected rule subcommand.
        #[command(subcommand)]
        command: RuleCommand,
    },
    /// Replica lock queries.
    Locks {
        /// Selected lock subcommand.
        #[command(subcommand)]
        command: LocksCommand,
    },
    /// Record identifier hierarchy mutations.
    Backlog {
        /// Selected backlog subcommand.
        #[command(subcommand)]
        command: BacklogCommand,
    },
    /// Configuration utilities.
    Config {
        /// Selected config subcommand.
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

/// Shared `--config` argument.
#[derive(Args, Debug, Clone)]
struct ConfigArgs {
    /// Config file path (defaults to `REPLICA_JUDGE_CONFIG` or `replica-judge.toml`).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

/// Identifier selection arguments.
#[derive(Args, Debug, Clone)]
struct DidArgs {
    /// Identifier scope.
    #[arg(long)]
    scope: String,
    /// Identifier name.
    #[arg(long)]
    name: String,
}

impl DidArgs {
    /// Returns the selected identifier.
    fn key(&self) -> DidKey {
        DidKey::new(self.scope.as_str(), self.name.as_str())
    }
}

/// Arguments for `evaluate`.
#[derive(Args, Debug)]
struct EvaluateCommand {
    /// Config selection.
    #[command(flatten)]
    config: ConfigArgs,
    /// Run one pass and exit.
    #[arg(long)]
    once: bool,
    /// Override the per-pass identifier bound.
    #[arg(long, value_name = "N")]
    did_limit: Option<usize>,
}

/// Rule subcommands.
#[derive(Subcommand, Debug)]
enum RuleCommand {
    /// Create a rule from a JSON request.
    Create(RuleCreateCommand),
    /// Show a rule.
    Get(RuleIdCommand),
    /// Remove a rule and all of its locks.
    Purge(RuleIdCommand),
    /// Remove rules whose lifetime elapsed.
    PurgeExpired(ConfigArgs),
}

/// Arguments for `rule create`.
#[derive(Args, Debug)]
struct RuleCreateCommand {
    /// Config selection.
    #[command(flatten)]
    config: ConfigArgs,
    /// Rule request JSON file.
    #[arg(long, value_name = "PATH")]
    input: PathBuf,
}

/// Arguments for rule commands addressing one rule.
#[derive(Args, Debug)]
struct RuleIdCommand {
    /// Config selection.
    #[command(flatten)]
    config: ConfigArgs,
    /// Rule identifier.
    rule_id: u64,
}

/// Lock query subcommands.
#[derive(Subcommand, Debug)]
enum LocksCommand {
    /// List file locks on a file.
    Files(LocksQueryCommand),
    /// List dataset locks on a dataset.
    Datasets(LocksQueryCommand),
}

/// Arguments for lock queries.
#[derive(Args, Debug)]
struct LocksQueryCommand {
    /// Config selection.
    #[command(flatten)]
    config: ConfigArgs,
    /// Queried identifier.
    #[command(flatten)]
    did: DidArgs,
}

/// Backlog subcommands.
#[derive(Subcommand, Debug)]
enum BacklogCommand {
    /// Record that children were attached to a collection.
    Attach(BacklogMutationCommand),
    /// Record that children were detached from a collection.
    Detach(BacklogMutationCommand),
}

/// Arguments for backlog mutation hooks.
#[derive(Args, Debug)]
struct BacklogMutationCommand {
    /// Config selection.
    #[command(flatten)]
    config: ConfigArgs,
    /// Collection whose content changed.
    #[command(flatten)]
    did: DidArgs,
    /// Child names in the collection's scope.
    #[arg(long = "child", value_name = "NAME", required = true)]
    children: Vec<String>,
    /// Account performing the attachment.
    #[arg(long, default_value = "root")]
    account: String,
}

/// Config subcommands.
#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Load and validate the configuration.
    Validate(ConfigArgs),
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// CLI error wrapper carrying the user-facing message.
#[derive(Debug, Error)]
#[error("{message}")]
struct CliError {
    /// Human-readable error message.
    message: String,
}

impl CliError {
    /// Constructs a new [`CliError`].
    const fn new(message: String) -> Self {
        Self {
            message,
        }
    }
}

/// CLI result alias for fallible operations.
type CliResult<T> = Result<T, CliError>;

// ============================================================================
// SECTION: Entry Point
// ============================================================================

/// CLI entry point returning an exit code.
#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    match run(Cli::parse()).await {
        Ok(code) => code,
        Err(err) => emit_error(&err.to_string()),
    }
}

/// Executes the CLI command dispatcher.
async fn run(cli: Cli) -> CliResult<ExitCode> {
    match cli.command {
        Commands::Config {
            command: ConfigCommand::Validate(args),
        } => command_config_validate(&args),
        command => {
            let config_path = command_config_path(&command);
            let session = Session::open(config_path)?;
            match &session.store {
                StoreHandle::Memory(store) => dispatch(&session, store, command).await,
                StoreHandle::Sqlite(store) => dispatch(&session, store, command).await,
            }
        }
    }
}

/// Returns the `--config` value of a store-backed command.
fn command_config_path(command: &Commands) -> Option<&Path> {
    let args = match command {
        Commands::Evaluate(command) => &command.config,
        Commands::Rule {
            command,
        } => match command {
            RuleCommand::Create(command) => &command.config,
            RuleCommand::Get(command) | RuleCommand::Purge(command) => &command.config,
            RuleCommand::PurgeExpired(args) => args,
        },
        Commands::Locks {
            command: LocksCommand::Files(command) | LocksCommand::Datasets(command),
        } => &command.config,
        Commands::Backlog {
            command: BacklogCommand::Attach(command) | BacklogCommand::Detach(command),
        } => &command.config,
        Commands::Config {
            command: ConfigCommand::Validate(args),
        } => args,
    };
    args.config.as_deref()
}

/// Runs a store-backed command against `store`.
async fn dispatch<S: Backend>(
    session: &Session,
    store: &S,
    command: Commands,
) -> CliResult<ExitCode> {
    match command {
        Commands::Evaluate(command) => command_evaluate(session, store, &command).await,
        Commands::Rule {
            command,
        } => match command {
            RuleCommand::Create(command) => command_rule_create(session, store, &command),
            RuleCommand::Get(command) => command_rule_get(store, &command),
            RuleCommand::Purge(command) => command_rule_purge(session, store, &command),
            RuleCommand::PurgeExpired(_) => command_rule_purge_expired(session, store),
        },
        Commands::Locks {
            command,
        } => command_locks(store, &command),
        Commands::Backlog {
            command,
        } => command_backlog(store, &command),
        Commands::Config {
            command: ConfigCommand::Validate(args),
        } => command_config_validate(&args),
    }
}

// ============================================================================
// SECTION: Session
// ============================================================================

/// Loaded configuration, collaborators, and store.
struct Session {
    /// Validated configuration.
    config: JudgeConfig,
    /// Identifier graph, resource catalog, and quota gate.
    collaborators: InventoryCollaborators,
    /// Backlog, rule, and lock persistence.
    store: StoreHandle,
}

impl Session {
    /// Loads configuration, the inventory snapshot, and the store.
    fn open(config_path: Option<&Path>) -> CliResult<Self> {
        let config = JudgeConfig::load(config_path)
            .map_err(|err| CliError::new(format!("failed to load config: {err}")))?;
        let inventory = match &config.inventory.path {
            Some(path) => Inventory::load(path)
                .map_err(|err| CliError::new(format!("failed to load inventory: {err}")))?,
            None => Inventory::default(),
        };
        let collaborators = inventory
            .build()
            .map_err(|err| CliError::new(format!("invalid inventory: {err}")))?;
        let store = match config.store.sqlite_config() {
            Some(sqlite) => StoreHandle::Sqlite(
                SqliteJudgeStore::open(&sqlite)
                    .map_err(|err| CliError::new(format!("failed to open store: {err}")))?,
            ),
            None => StoreHandle::Memory(MemoryStore::default()),
        };
        Ok(Self {
            config,
            collaborators,
            store,
        })
    }

    /// Builds the configured event sink.
    fn event_sink(&self) -> CliResult<Arc<dyn EvaluatorEventSink>> {
        build_event_sink(&self.config.events)
    }

    /// Builds an evaluator over `store` and the session collaborators.
    fn evaluator<S: Backend>(&self, store: &S) -> CliResult<CliEvaluator<S>> {
        Ok(Evaluator::new(
            store.backlog(),
            store.rules(),
            store.locks(),
            self.collaborators.graph.clone(),
            self.collaborators.catalog.clone(),
            CommittedQuota {
                limits: self.collaborators.quota.clone(),
                store: store.clone(),
            },
        )
        .with_config(self.config.evaluator.to_evaluator_config())
        .with_events(self.event_sink()?))
    }
}

/// Evaluator over a CLI backend and inventory collaborators.
type CliEvaluator<S> = Evaluator<
    <S as Backend>::Backlog,
    <S as Backend>::Rules,
    <S as Backend>::Locks,
    InMemoryIdentifierGraph,
    InMemoryResourceCatalog,
    CommittedQuota<S>,
>;

/// Builds the event sink selected by `[events]`.
fn build_event_sink(events: &EventsConfig) -> CliResult<Arc<dyn EvaluatorEventSink>> {
    match (events.sink, &events.path) {
        (EventSinkKind::None, _) => Ok(Arc::new(NoopEventSink)),
        (EventSinkKind::Stderr, _) => Ok(Arc::new(StderrEventSink)),
        (EventSinkKind::File, Some(path)) => FileEventSink::new(path)
            .map(|sink| Arc::new(sink) as Arc<dyn EvaluatorEventSink>)
            .map_err(|err| CliError::new(format!("failed to open event log: {err}"))),
        (EventSinkKind::File, None) => {
            Err(CliError::new("file event sink requires events.path".to_string()))
        }
    }
}

// ============================================================================
// SECTION: Store Backends
// ============================================================================

/// Configured persistence backend.
enum StoreHandle {
    /// Process-local stores.
    Memory(MemoryStore),
    /// Shared `SQLite` database.
    Sqlite(SqliteJudgeStore),
}

/// Process-local backlog, rule, and lock stores.
#[derive(Clone, Default)]
struct MemoryStore {
    /// Change backlog.
    backlog: InMemoryBacklog,
    /// Rule store.
    rules: InMemoryRuleStore,
    /// Lock store.
    locks: InMemoryLockStore,
}

/// Persistence backend the CLI can drive.
trait Backend: Clone + Send + 'static {
    /// Backlog handle type.
    type Backlog: ChangeBacklog + Send + 'static;
    /// Rule store handle type.
    type Rules: RuleStore + Send + 'static;
    /// Lock store handle type.
    type Locks: LockStore + Send + 'static;

    /// Returns a backlog handle.
    fn backlog(&self) -> Self::Backlog;
    /// Returns a rule store handle.
    fn rules(&self) -> Self::Rules;
    /// Returns a lock store handle.
    fn locks(&self) -> Self::Locks;
    /// Returns the net bytes committed lock batches charged to `account` at
    /// `rse_id`.
    fn committed_bytes(&self, account: &AccountId, rse_id: &RseId) -> Result<i64, StoreError>;
}

impl Backend for MemoryStore {
    type Backlog = InMemoryBacklog;
    type Locks = InMemoryLockStore;
    type Rules = InMemoryRuleStore;

    fn backlog(&self) -> Self::Backlog {
        self.backlog.clone()
    }

    fn rules(&self) -> Self::Rules {
        self.rules.clone()
    }

    fn locks(&self) -> Self::Locks {
        self.locks.clone()
    }

    fn committed_bytes(&self, account: &AccountId, rse_id: &RseId) -> Result<i64, StoreError> {
        Ok(self
            .locks
            .counter_updates()?
            .iter()
            .filter(|delta| &delta.account == account && &delta.rse_id == rse_id)
            .map(|delta| delta.bytes)
            .sum())
    }
}

impl Backend for SqliteJudgeStore {
    type Backlog = Self;
    type Locks = Self;
    type Rules = Self;

    fn backlog(&self) -> Self::Backlog {
        self.clone()
    }

    fn rules(&self) -> Self::Rules {
        self.clone()
    }

    fn locks(&self) -> Self::Locks {
        self.clone()
    }

    fn committed_bytes(&self, account: &AccountId, rse_id: &RseId) -> Result<i64, StoreError> {
        self.account_usage(account, rse_id).map_err(StoreError::from)
    }
}

/// Quota gate charging committed lock bytes against inventory allowances.
///
/// The inventory's `used_bytes` is the usage outside this store; counter
/// deltas recorded with each lock batch are subtracted on every lookup so
/// loop mode sees the locks of earlier passes.
#[derive(Clone)]
struct CommittedQuota<S> {
    /// Inventory limits and external usage.
    limits: InMemoryQuotaGate,
    /// Store holding committed counter deltas.
    store: S,
}

impl<S: Backend> QuotaGate for CommittedQuota<S> {
    fn allowance(
        &self,
        account: &AccountId,
        rse_id: &RseId,
    ) -> Result<QuotaAllowance, QuotaError> {
        match self.limits.allowance(account, rse_id)? {
            QuotaAllowance::Unlimited => Ok(QuotaAllowance::Unlimited),
            QuotaAllowance::Remaining(remaining) => {
                let committed = self
                    .store
                    .committed_bytes(account, rse_id)
                    .map_err(|err| QuotaError::Backend(err.to_string()))?;
                let remaining = remaining.saturating_add_signed(committed.saturating_neg());
                Ok(QuotaAllowance::Remaining(remaining))
            }
        }
    }
}

// ============================================================================
// SECTION: Evaluate Command
// ============================================================================

/// Executes `evaluate`.
async fn command_evaluate<S: Backend>(
    session: &Session,
    store: &S,
    command: &EvaluateCommand,
) -> CliResult<ExitCode> {
    let did_limit = resolve_did_limit(command.did_limit, session.config.evaluator.did_limit)?;
    let mut evaluator = session.evaluator(store)?;
    let shutdown = Arc::new(AtomicBool::new(false));
    let signal_flag = Arc::clone(&shutdown);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_flag.store(true, Ordering::SeqCst);
        }
    });
    let mode = RunMode {
        once: command.once,
        did_limit,
    };
    let report = tokio::task::spawn_blocking(move || evaluator.run(mode, &shutdown))
        .await
        .map_err(|err| CliError::new(format!("evaluator task failed: {err}")))?
        .map_err(|err| CliError::new(format!("evaluation failed: {err}")))?;
    write_json(&report)?;
    Ok(ExitCode::SUCCESS)
}

/// Applies the `--did-limit` override within configured bounds.
fn resolve_did_limit(requested: Option<usize>, configured: usize) -> CliResult<usize> {
    match requested {
        None => Ok(configured),
        Some(limit) if (1 ..= MAX_DID_LIMIT).contains(&limit) => Ok(limit),
        Some(_) => {
            Err(CliError::new(format!("--did-limit must be between 1 and {MAX_DID_LIMIT}")))
        }
    }
}

// ============================================================================
// SECTION: Rule Commands
// ============================================================================

/// Executes `rule create`.
fn command_rule_create<S: Backend>(
    session: &Session,
    store: &S,
    command: &RuleCreateCommand,
) -> CliResult<ExitCode> {
    let bytes = read_bytes_with_limit(&command.input, MAX_SPEC_BYTES).map_err(|err| {
        CliError::new(format!("failed to read {}: {err}", command.input.display()))
    })?;
    let spec: RuleSpec = serde_json::from_slice(&bytes)
        .map_err(|err| CliError::new(format!("invalid rule request: {err}")))?;
    let rule_id = create_rule(&session.collaborators.graph, &store.rules(), &spec)
        .map_err(|err| CliError::new(format!("failed to create rule: {err}")))?;
    write_json(&json!({ "rule_id": rule_id.get() }))?;
    Ok(ExitCode::SUCCESS)
}

/// Executes `rule get`.
fn command_rule_get<S: Backend>(store: &S, command: &RuleIdCommand) -> CliResult<ExitCode> {
    let rule = get_rule(&store.rules(), parse_rule_id(command.rule_id)?)
        .map_err(|err| CliError::new(format!("failed to load rule: {err}")))?;
    write_json(&rule)?;
    Ok(ExitCode::SUCCESS)
}

/// Executes `rule purge`.
fn command_rule_purge<S: Backend>(
    session: &Session,
    store: &S,
    command: &RuleIdCommand,
) -> CliResult<ExitCode> {
    let rule_id = parse_rule_id(command.rule_id)?;
    let removed = session
        .evaluator(store)?
        .purge_rule(rule_id)
        .map_err(|err| CliError::new(format!("failed to purge rule: {err}")))?;
    write_json(&json!({ "rule_id": rule_id.get(), "locks_removed": removed }))?;
    Ok(ExitCode::SUCCESS)
}

/// Executes `rule purge-expired`.
fn command_rule_purge_expired<S: Backend>(session: &Session, store: &S) -> CliResult<ExitCode> {
    let report = session
        .evaluator(store)?
        .purge_expired(Timestamp::now())
        .map_err(|err| CliError::new(format!("failed to purge expired rules: {err}")))?;
    write_json(&report)?;
    Ok(ExitCode::SUCCESS)
}

/// Parses a rule identifier argument.
fn parse_rule_id(raw: u64) -> CliResult<RuleId> {
    RuleId::from_raw(raw).ok_or_else(|| CliError::new("rule id must be non-zero".to_string()))
}

// ============================================================================
// SECTION: Lock and Backlog Commands
// ============================================================================

/// Executes `locks files` and `locks datasets`.
fn command_locks<S: Backend>(store: &S, command: &LocksCommand) -> CliResult<ExitCode> {
    let locks = match command {
        LocksCommand::Files(query) => list_file_locks(&store.locks(), &query.did.key()),
        LocksCommand::Datasets(query) => list_dataset_locks(&store.locks(), &query.did.key()),
    }
    .map_err(|err| CliError::new(format!("failed to list locks: {err}")))?;
    write_json(&locks)?;
    Ok(ExitCode::SUCCESS)
}

/// Executes `backlog attach` and `backlog detach`.
fn command_backlog<S: Backend>(store: &S, command: &BacklogCommand) -> CliResult<ExitCode> {
    let hooks = ChangeHooks::new(store.backlog());
    let (mutation, enqueued) = match command {
        BacklogCommand::Attach(mutation) => {
            let children = mutation_children(mutation);
            let actor = AccountId::new(mutation.account.as_str());
            (mutation, hooks.on_attach(&mutation.did.key(), &children, &actor))
        }
        BacklogCommand::Detach(mutation) => {
            let children = mutation_children(mutation);
            (mutation, hooks.on_detach(&mutation.did.key(), &children))
        }
    };
    let enqueued =
        enqueued.map_err(|err| CliError::new(format!("failed to record mutation: {err}")))?;
    write_json(&json!({ "did": mutation.did.key().to_string(), "enqueued": enqueued }))?;
    Ok(ExitCode::SUCCESS)
}

/// Returns the mutated children as identifiers in the parent's scope.
fn mutation_children(mutation: &BacklogMutationCommand) -> Vec<DidKey> {
    mutation
        .children
        .iter()
        .map(|name| DidKey::new(mutation.did.scope.as_str(), name.as_str()))
        .collect()
}

// ============================================================================
// SECTION: Config Command
// ============================================================================

/// Executes `config validate`.
fn command_config_validate(args: &ConfigArgs) -> CliResult<ExitCode> {
    JudgeConfig::load(args.config.as_deref())
        .map_err(|err| CliError::new(format!("failed to load config: {err}")))?;
    write_json(&json!({ "valid": true }))?;
    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// SECTION: Input Helpers
// ============================================================================

/// Bounded read failures.
#[derive(Debug, Error)]
enum ReadLimitError {
    /// File I/O failure.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// File size exceeds the configured limit.
    #[error("file exceeds size limit ({size} > {limit} bytes)")]
    TooLarge {
        /// Actual size in bytes.
        size: u64,
        /// Allowed limit in bytes.
        limit: usize,
    },
}

/// Reads a file from disk while enforcing a hard size limit.
fn read_bytes_with_limit(path: &Path, max_bytes: usize) -> Result<Vec<u8>, ReadLimitError> {
    let file = File::open(path)?;
    let size = file.metadata()?.len();
    let limit = u64::try_from(max_bytes).unwrap_or(u64::MAX);
    if size > limit {
        return Err(ReadLimitError::TooLarge {
            size,
            limit: max_bytes,
        });
    }
    let mut bytes = Vec::new();
    file.take(limit.saturating_add(1)).read_to_end(&mut bytes)?;
    if bytes.len() > max_bytes {
        return Err(ReadLimitError::TooLarge {
            size: u64::try_from(bytes.len()).unwrap_or(u64::MAX),
            limit: max_bytes,
        });
    }
    Ok(bytes)
}

// ============================================================================
// SECTION: Output Helpers
// ============================================================================

/// Writes a value to stdout as one JSON line.
fn write_json<T: Serialize>(value: &T) -> CliResult<()> {
    let mut bytes = serde_json::to_vec(value)
        .map_err(|err| CliError::new(format!("failed to serialize output: {err}")))?;
    bytes.push(b'\n');
    std::io::stdout()
        .write_all(&bytes)
        .map_err(|err| CliError::new(format!("failed to write stdout: {err}")))
}

/// Writes a single line to stderr.
fn write_stderr_line(message: &str) -> std::io::Result<()> {
    let mut stderr = std::io::stderr();
    writeln!(&mut stderr, "{message}")
}

/// Emits an error message to stderr and returns a failure exit code.
fn emit_error(message: &str) -> ExitCode {
    let _ = write_stderr_line(message);
    ExitCode::FAILURE
}
