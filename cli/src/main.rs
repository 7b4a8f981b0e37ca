//! qbs-session CLI - drives a `qbs session` process from the command line.
//!
//! ```text
//! main() -> load config -> Session::spawn() -> start -> auto-resolve
//!                                                  |
//!                                                  v
//!                      resolve | build | clean | install | run-env | watch
//! ```
//!
//! One-shot commands wait for the active project to resolve, issue their
//! request, and exit non-zero when the result carries errors. `watch` keeps
//! the session open until Ctrl-C and reloads the config on SIGHUP.

mod logger;

use std::{
    env,
    fs::{self, OpenOptions},
    future::Future,
    io,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Mutex,
};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use qbs_config::{
    QbsConfig, ResolvedSettings, SharedSettings, StateStore, config_path, default_project,
    discover_projects,
};
use qbs_session::{
    Collaborators, Emitter, ProjectStore, Selection, Session, SessionError, SessionHandle,
    SessionStatus, Subscription,
};

#[derive(Debug, Parser)]
#[command(name = "qbs-session", version, about = "Drive a qbs build session")]
struct Cli {
    /// Config file to use instead of ~/.qbs-session/config.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Workspace directory. Defaults to the current directory.
    #[arg(long, short = 'C', global = true)]
    workspace: Option<PathBuf>,

    /// Project file, relative to the workspace.
    #[arg(long, short, global = true)]
    project: Option<PathBuf>,

    #[arg(long, global = true)]
    profile: Option<String>,

    #[arg(long, global = true)]
    configuration: Option<String>,

    /// Log to stderr instead of the log file.
    #[arg(long, global = true)]
    log_stderr: bool,

    /// Report task progress.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
enum Command {
    /// Resolve the project.
    Resolve,
    /// Build the given products, or the whole project.
    Build { products: Vec<String> },
    /// Clean the given products, or the whole project.
    Clean { products: Vec<String> },
    /// Install the given products, or the whole project.
    Install { products: Vec<String> },
    /// Print the run environment of a product.
    RunEnv { product: String },
    /// Keep the session open, re-resolving as settings change.
    Watch,
}

/// Selection values given on the command line. They win over the config.
#[derive(Debug, Clone, Default)]
struct SelectionOverrides {
    profile: Option<String>,
    configuration: Option<String>,
}

impl SelectionOverrides {
    fn apply(&self, selection: &mut Selection) {
        if let Some(profile) = &self.profile {
            selection.profile = Some(profile.clone());
        }
        if let Some(configuration) = &self.configuration {
            selection.configuration.clone_from(configuration);
        }
    }
}

/// Everything needed to re-read the settings after startup.
struct SettingsSource {
    config: Option<PathBuf>,
    workspace: PathBuf,
    overrides: SelectionOverrides,
}

impl SettingsSource {
    fn load(&self) -> Result<ResolvedSettings> {
        let config = load_config(self.config.as_deref())?;
        let mut settings = config
            .resolve(&self.workspace)
            .context("invalid configuration")?;
        self.overrides.apply(&mut settings.selection);
        Ok(settings)
    }
}

fn init_tracing(to_stderr: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    if to_stderr {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(io::stderr))
            .with(env_filter)
            .init();
        return;
    }

    let (log_file, init_warnings) = open_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // stdout and stderr carry build output; without a log file, stay quiet.
    tracing_subscriber::registry().with(env_filter).init();
}

fn open_log_file() -> (Option<(PathBuf, fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&candidate)
        {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    // Primary: ~/.qbs-session/logs/qbs-session.log
    if let Some(config_path) = config_path()
        && let Some(config_dir) = config_path.parent()
    {
        candidates.push(config_dir.join("logs").join("qbs-session.log"));
    }

    candidates.push(
        PathBuf::from(".qbs-session")
            .join("logs")
            .join("qbs-session.log"),
    );

    candidates
}

fn load_config(path: Option<&Path>) -> Result<QbsConfig> {
    match path {
        Some(path) => QbsConfig::load_from(path)?
            .with_context(|| format!("config file {} not found", path.display())),
        None => Ok(QbsConfig::load()?.unwrap_or_default()),
    }
}

fn workspace_dir(requested: Option<&Path>) -> Result<PathBuf> {
    let dir = match requested {
        Some(dir) => dir.to_path_buf(),
        None => env::current_dir().context("reading current directory")?,
    };
    dir.canonicalize()
        .with_context(|| format!("workspace {} is not accessible", dir.display()))
}

/// Project to activate before starting. `None` defers to the project the
/// store remembers for this workspace.
fn initial_project(
    requested: Option<&Path>,
    workspace: &Path,
    store: Option<&StateStore>,
) -> Result<Option<PathBuf>> {
    if let Some(project) = requested {
        return Ok(Some(workspace.join(project)));
    }
    if store.and_then(|s| s.load()).is_some() {
        return Ok(None);
    }
    let candidates = discover_projects(workspace)
        .with_context(|| format!("scanning {} for projects", workspace.display()))?;
    let project = default_project(workspace, &candidates)
        .with_context(|| format!("no .qbs project file in {}", workspace.display()))?;
    Ok(Some(project))
}

fn apply_selection(handle: &SessionHandle, selection: &Selection) {
    handle.set_profile(selection.profile.clone());
    handle.set_configuration(selection.configuration.clone());
    handle.set_custom_properties(selection.custom_properties.clone());
}

/// Channel fed by an emitter for as long as the value lives.
struct Forwarded<T> {
    _subscription: Subscription,
    rx: mpsc::UnboundedReceiver<T>,
}

fn forward<T: Clone + Send + 'static>(emitter: &Emitter<T>) -> Forwarded<T> {
    let (tx, rx) = mpsc::unbounded_channel();
    let subscription = emitter.subscribe(move |event: &T| {
        let _ = tx.send(event.clone());
    });
    Forwarded {
        _subscription: subscription,
        rx,
    }
}

/// Run `fut` to completion unless the session stops or the user interrupts.
async fn until_stopped<F: Future>(
    fut: F,
    statuses: &mut Forwarded<SessionStatus>,
    handle: &SessionHandle,
) -> Result<F::Output> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            out = &mut fut => return Ok(out),
            status = statuses.rx.recv() => match status {
                Some(SessionStatus::Stopped) | None => bail!("qbs session stopped unexpectedly"),
                Some(_) => {}
            },
            _ = tokio::signal::ctrl_c() => {
                handle.cancel();
                bail!("interrupted");
            }
        }
    }
}

async fn wait_started(
    statuses: &mut Forwarded<SessionStatus>,
    errors: &mut Forwarded<SessionError>,
) -> Result<()> {
    while let Some(status) = statuses.rx.recv().await {
        match status {
            SessionStatus::Started => return Ok(()),
            SessionStatus::Stopped => {
                return match errors.rx.try_recv() {
                    Ok(err) => Err(anyhow::Error::new(err).context("qbs session failed to start")),
                    Err(_) => bail!("qbs session failed to start"),
                };
            }
            SessionStatus::Starting | SessionStatus::Stopping => {}
        }
    }
    bail!("session task ended before qbs started")
}

async fn drive(
    handle: &SessionHandle,
    command: &Command,
    source: &SettingsSource,
    shared: &SharedSettings,
) -> Result<bool> {
    let hub = handle.hub();
    let mut statuses = forward(&hub.status_changed);
    let mut errors = forward(&hub.error);
    let mut resolved = forward(&hub.project_resolved);

    handle.start();
    wait_started(&mut statuses, &mut errors).await?;

    if *command == Command::Watch {
        return watch(handle, &mut statuses, source, shared).await;
    }

    let result = until_stopped(resolved.rx.recv(), &mut statuses, handle)
        .await?
        .context("session ended while resolving")?;
    if !result.is_empty() {
        return Ok(false);
    }

    match command {
        Command::Resolve | Command::Watch => Ok(true),
        Command::Build { products } => {
            let mut built = forward(&hub.project_built);
            handle.build(products.clone());
            let result = until_stopped(built.rx.recv(), &mut statuses, handle)
                .await?
                .context("session ended while building")?;
            Ok(result.is_empty())
        }
        Command::Clean { products } => {
            let mut cleaned = forward(&hub.project_cleaned);
            handle.clean(products.clone());
            let result = until_stopped(cleaned.rx.recv(), &mut statuses, handle)
                .await?
                .context("session ended while cleaning")?;
            Ok(result.is_empty())
        }
        Command::Install { products } => {
            let mut installed = forward(&hub.project_installed);
            handle.install(products.clone());
            let result = until_stopped(installed.rx.recv(), &mut statuses, handle)
                .await?
                .context("session ended while installing")?;
            Ok(result.is_empty())
        }
        Command::RunEnv { product } => {
            let result = until_stopped(
                handle.ensure_run_environment_updated(product.clone()),
                &mut statuses,
                handle,
            )
            .await?
            .context("session ended while fetching the run environment")?;
            if !result.error.is_empty() {
                for item in result.error.items() {
                    eprintln!("error: {item}");
                }
                return Ok(false);
            }
            for (key, value) in result.environment.iter() {
                println!("{key}={value}");
            }
            Ok(true)
        }
    }
}

async fn watch(
    handle: &SessionHandle,
    statuses: &mut Forwarded<SessionStatus>,
    source: &SettingsSource,
    shared: &SharedSettings,
) -> Result<bool> {
    let mut reload = ReloadSignal::new()?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("listening for Ctrl-C")?;
                tracing::info!("Interrupted; stopping session");
                handle.cancel();
                return Ok(true);
            }
            status = statuses.rx.recv() => match status {
                Some(SessionStatus::Stopped) if !shared.current().session.restart_on_crash => {
                    return Ok(false);
                }
                None => return Ok(false),
                Some(_) => {}
            },
            () = reload.recv() => reload_settings(handle, source, shared),
        }
    }
}

fn reload_settings(handle: &SessionHandle, source: &SettingsSource, shared: &SharedSettings) {
    let settings = match source.load() {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Config reload failed; keeping current settings: {e:#}");
            eprintln!("warning: config reload failed: {e:#}");
            return;
        }
    };
    tracing::info!("Config reloaded");
    let selection = settings.selection.clone();
    for event in shared.replace(settings) {
        handle.settings_changed(event);
    }
    apply_selection(handle, &selection);
}

#[cfg(unix)]
struct ReloadSignal(tokio::signal::unix::Signal);

#[cfg(unix)]
impl ReloadSignal {
    fn new() -> Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};
        let hangup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
        Ok(Self(hangup))
    }

    async fn recv(&mut self) {
        if self.0.recv().await.is_none() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
struct ReloadSignal;

#[cfg(not(unix))]
impl ReloadSignal {
    fn new() -> Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) {
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_stderr);

    let workspace = workspace_dir(cli.workspace.as_deref())?;
    let source = SettingsSource {
        config: cli.config.clone(),
        workspace: workspace.clone(),
        overrides: SelectionOverrides {
            profile: cli.profile.clone(),
            configuration: cli.configuration.clone(),
        },
    };
    let settings = source.load()?;

    let store = StateStore::open_default(&workspace);
    let project = initial_project(cli.project.as_deref(), &workspace, store.as_ref())?;

    let shared = SharedSettings::new(settings.clone());
    let mut collaborators = Collaborators::new(shared.clone());
    if let Some(store) = store {
        collaborators = collaborators.with_store(store);
    }

    let session = Session::spawn(settings.session.clone(), collaborators);
    let handle = session.handle();
    let console = logger::attach(handle.hub(), cli.verbose);

    apply_selection(&handle, &settings.selection);
    if let Some(project) = project {
        handle.set_project(project);
    }

    let outcome = drive(&handle, &cli.command, &source, &shared).await;
    session.shutdown().await;
    console.dispose();

    match outcome {
        Ok(true) => Ok(ExitCode::SUCCESS),
        Ok(false) => Ok(ExitCode::FAILURE),
        Err(e) => Err(e),
    }
}
