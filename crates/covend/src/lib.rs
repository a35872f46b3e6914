//! covend - workspace-local workflow orchestration daemon.
//!
//! Library components for the daemon process: storage, event bus, process
//! manager, workflow engine, grimoire registry, scheduler, review gateway,
//! HTTP surface, and the supervisor that wires them together over a Unix
//! socket under `<workspace>/.coven/`.

pub mod bus;
pub mod engine;
pub mod git;
pub mod process;
pub mod questions;
pub mod registry;
pub mod review;
pub mod scheduler;
pub mod server;
pub mod storage;
pub mod tracker;
pub mod worktree;

use std::fs::File;
use std::io::Write as _;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use coven_core::Config;
use fs2::FileExt;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use bus::EventBus;
use engine::WorkflowEngine;
use process::ProcessManager;
use registry::GrimoireRegistry;
use review::ReviewGateway;
use scheduler::Scheduler;
use server::AppState;
use storage::Storage;
use tracker::StoreTaskSource;
use worktree::GitWorktrees;

/// Type alias for application-level errors with context and backtraces.
pub type AppResult<T> = eyre::Result<T>;

/// Grace period for in-flight steps to abort during shutdown.
///
/// After the root token is cancelled, the daemon waits this long for
/// workflow drivers to checkpoint before force-killing child process
/// groups.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Filesystem layout under `<workspace>/.coven/`.
#[derive(Debug, Clone)]
pub struct DaemonPaths {
    pub state_dir: PathBuf,
    pub socket_path: PathBuf,
    pub pid_path: PathBuf,
    pub log_path: PathBuf,
    pub db_path: PathBuf,
    pub output_dir: PathBuf,
}

impl DaemonPaths {
    pub fn new(workspace: &Path) -> Self {
        let state_dir = workspace.join(".coven");
        Self {
            socket_path: state_dir.join("covend.sock"),
            pid_path: state_dir.join("covend.pid"),
            log_path: state_dir.join("covend.log"),
            db_path: state_dir.join("covend.db"),
            output_dir: state_dir.join("output"),
            state_dir,
        }
    }
}

/// Daemon state.
pub struct Daemon {
    workspace: PathBuf,
    paths: DaemonPaths,
    storage: Arc<Storage>,
    bus: Arc<EventBus>,
    processes: Arc<ProcessManager>,
    engine: Arc<WorkflowEngine>,
    scheduler: Arc<Scheduler>,
    registry: Arc<GrimoireRegistry>,
    review: Arc<ReviewGateway>,
    worktrees: Arc<dyn worktree::WorktreeProvider>,
    config: Config,
    root_token: CancellationToken,
    listener: Option<UnixListener>,
    // NOTE(lifetime): held to maintain the exclusive PID lock; released on drop.
    #[allow(dead_code)]
    lock_file: File,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("workspace", &self.workspace)
            .finish_non_exhaustive()
    }
}

impl Daemon {
    /// Initialize the daemon against a workspace.
    ///
    /// Startup order: workspace validation, state directory, PID lock,
    /// stale-socket cleanup, socket bind (0600), then storage, bus, process
    /// manager, engine, and scheduler.
    pub async fn new(workspace: PathBuf, agent_bin_override: Option<PathBuf>) -> AppResult<Self> {
        let workspace = workspace
            .canonicalize()
            .map_err(|e| eyre::eyre!("workspace {} not accessible: {e}", workspace.display()))?;
        if !git::is_git_repo(&workspace) {
            eyre::bail!(
                "workspace {} is not a version-controlled project",
                workspace.display()
            );
        }

        let paths = DaemonPaths::new(&workspace);
        std::fs::create_dir_all(&paths.state_dir)?;
        std::fs::create_dir_all(&paths.output_dir)?;

        let lock_file = acquire_pid_lock(&paths.pid_path)?;

        // A dead daemon leaves its socket behind; remove before binding.
        if paths.socket_path.exists() {
            std::fs::remove_file(&paths.socket_path)?;
        }
        let listener = UnixListener::bind(&paths.socket_path)?;
        std::fs::set_permissions(&paths.socket_path, std::fs::Permissions::from_mode(0o600))?;

        let mut config = Config::load_workspace(&workspace)?;
        if let Some(agent_bin) = agent_bin_override {
            config.agent_bin = agent_bin;
        }

        let storage = Arc::new(
            Storage::new(&paths.db_path)
                .await?
                .with_output_dir(paths.output_dir.clone()),
        );
        storage.migrate_embedded().await?;

        let bus = Arc::new(EventBus::new(
            Arc::clone(&storage),
            Duration::from_millis(config.slow_consumer_timeout_ms),
        ));
        let processes = Arc::new(ProcessManager::new(
            paths.output_dir.clone(),
            config.ring_buffer_lines,
            Duration::from_millis(config.kill_grace_ms),
        ));
        let registry = Arc::new(GrimoireRegistry::load(
            &workspace.join(&config.grimoires_dir),
        ));
        let worktrees: Arc<dyn worktree::WorktreeProvider> =
            Arc::new(GitWorktrees::new(workspace.clone()));

        let base_branch = match &config.base_branch {
            Some(branch) => branch.clone(),
            None => git::detect_default_branch(&workspace)?,
        };

        let root_token = CancellationToken::new();
        let engine = Arc::new(WorkflowEngine::new(
            Arc::clone(&storage),
            Arc::clone(&bus),
            Arc::clone(&processes),
            Arc::clone(&worktrees),
            Arc::clone(&registry),
            config.clone(),
            base_branch,
            root_token.clone(),
        ));
        let review = Arc::new(ReviewGateway::new(
            Arc::clone(&storage),
            Arc::clone(&bus),
            Arc::clone(&worktrees),
            Arc::clone(&registry),
            Arc::clone(&engine),
        ));
        let source = Arc::new(StoreTaskSource::new(Arc::clone(&storage)));
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&storage),
            Arc::clone(&engine),
            Arc::clone(&registry),
            source,
            config.clone(),
        ));

        Ok(Self {
            workspace,
            paths,
            storage,
            bus,
            processes,
            engine,
            scheduler,
            registry,
            review,
            worktrees,
            config,
            root_token,
            listener: Some(listener),
            lock_file,
        })
    }

    /// Token that, when cancelled, begins graceful shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.root_token.clone()
    }

    pub fn paths(&self) -> &DaemonPaths {
        &self.paths
    }

    /// Run the daemon until shutdown.
    pub async fn run(mut self) -> AppResult<()> {
        info!(workspace = %self.workspace.display(), "covend starting");
        info!(socket = %self.paths.socket_path.display(), "control socket bound");
        info!(
            max_concurrent_agents = self.config.max_concurrent_agents,
            grimoires = ?self.registry.names(),
            "configuration loaded"
        );

        // Resume workflows interrupted by a previous crash or shutdown.
        match self.engine.resume_interrupted().await {
            Ok(resumed) if !resumed.is_empty() => {
                info!("resumed {} interrupted workflow(s)", resumed.len());
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "failed to resume interrupted workflows"),
        }

        // Background scheduler loop.
        let scheduler = Arc::clone(&self.scheduler);
        let scheduler_handle = tokio::spawn(scheduler.run());

        let state = Arc::new(AppState {
            storage: Arc::clone(&self.storage),
            bus: Arc::clone(&self.bus),
            engine: Arc::clone(&self.engine),
            registry: Arc::clone(&self.registry),
            review: Arc::clone(&self.review),
            processes: Arc::clone(&self.processes),
            worktrees: Arc::clone(&self.worktrees),
            config: self.config.clone(),
            workspace: self.workspace.clone(),
            started_at: std::time::Instant::now(),
            shutdown: self.root_token.clone(),
        });

        let listener = self.listener.take().expect("listener taken once");
        if let Err(e) = server::serve(listener, state).await {
            warn!(error = %e, "http server error");
        }

        // Shutdown: stop claiming, give drivers time to checkpoint, then
        // signal every child process group.
        info!("shutting down");
        self.scheduler.shutdown();
        scheduler_handle.abort();
        tokio::time::sleep(SHUTDOWN_GRACE_PERIOD).await;
        self.processes.kill_all(None).await;

        if let Err(e) = std::fs::remove_file(&self.paths.socket_path) {
            warn!(error = %e, "failed to remove socket file");
        }
        if let Err(e) = std::fs::remove_file(&self.paths.pid_path) {
            warn!(error = %e, "failed to remove pid file");
        }
        info!("covend stopped");
        Ok(())
    }
}

/// Acquire the single-instance PID lock.
///
/// Opens without truncating so a losing contender cannot wipe the winner's
/// PID; the file is truncated and rewritten only once the lock is held. A
/// stale file from a dead daemon carries no lock, so acquisition succeeds
/// and the PID is overwritten.
fn acquire_pid_lock(pid_path: &Path) -> AppResult<File> {
    let file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(pid_path)?;
    file.try_lock_exclusive().map_err(|_| {
        let holder = std::fs::read_to_string(pid_path).unwrap_or_default();
        eyre::eyre!(
            "another covend instance holds the lock (pid {})",
            holder.trim()
        )
    })?;
    let mut file = file;
    file.set_len(0)?;
    writeln!(file, "{}", std::process::id())?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;
    use tempfile::TempDir;

    fn setup_workspace() -> TempDir {
        let dir = TempDir::new().unwrap();
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test"],
        ] {
            StdCommand::new("git")
                .args(&args)
                .current_dir(dir.path())
                .output()
                .unwrap();
        }
        std::fs::write(dir.path().join("README.md"), "# ws\n").unwrap();
        StdCommand::new("git")
            .args(["add", "-A"])
            .current_dir(dir.path())
            .output()
            .unwrap();
        StdCommand::new("git")
            .args(["commit", "-m", "init"])
            .current_dir(dir.path())
            .output()
            .unwrap();
        dir
    }

    #[test]
    fn paths_follow_coven_layout() {
        let paths = DaemonPaths::new(Path::new("/ws"));
        assert_eq!(paths.socket_path, PathBuf::from("/ws/.coven/covend.sock"));
        assert_eq!(paths.pid_path, PathBuf::from("/ws/.coven/covend.pid"));
        assert_eq!(paths.db_path, PathBuf::from("/ws/.coven/covend.db"));
    }

    #[test]
    fn pid_lock_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let pid_path = dir.path().join("covend.pid");

        let first = acquire_pid_lock(&pid_path).unwrap();
        assert!(acquire_pid_lock(&pid_path).is_err());
        drop(first);
        assert!(acquire_pid_lock(&pid_path).is_ok());
    }

    #[tokio::test]
    async fn daemon_rejects_non_git_workspace() {
        let dir = TempDir::new().unwrap();
        let result = Daemon::new(dir.path().to_path_buf(), None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn daemon_initializes_and_binds_socket() {
        let ws = setup_workspace();
        let daemon = Daemon::new(ws.path().to_path_buf(), None).await.unwrap();
        assert!(daemon.paths().socket_path.exists());
        assert!(daemon.paths().pid_path.exists());

        let mode = std::fs::metadata(&daemon.paths().socket_path)
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);

        // Second instance against the same workspace must fail.
        let second = Daemon::new(ws.path().to_path_buf(), None).await;
        assert!(second.is_err());
    }
}
