//! The job supervisor.
//!
//! Each admitted job becomes one child process running the pipeline
//! script in its own process group, with a watcher thread that owns the
//! process handle and two reader threads that drain its output into the
//! run log and the progress tracker. All durable state lives in the job
//! store; the in-memory map below only tracks what is needed to signal
//! and account for live children, and is rebuilt empty on restart (the
//! startup reconciliation pass fails whatever rows were left RUNNING).

use std::collections::{HashMap, VecDeque};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read, Write as _};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;

use argpipe_common::db::Pool;
use argpipe_common::prelude::*;
use argpipe_common::rest_api::LaunchRequest;
use tracing::{debug, error, info, warn};

use crate::classify::classify;
use crate::progress::ProgressTracker;
use crate::run_number::RunAllocator;

/// How many trailing stderr lines we keep for failure messages.
const STDERR_TAIL_LINES: usize = 50;

/// What the supervisor remembers about one live child.
#[derive(Debug)]
struct RunningJob {
    /// Child pid, which is also its process-group id. `None` while the
    /// slot is reserved but the spawn has not finished yet.
    pid: Option<i32>,
    /// Set when a stop was requested, so the watcher reports STOPPED
    /// instead of FAILED when the child dies of our signal.
    stop_requested: bool,
    /// Why the stop was requested, for `error_message`.
    stop_reason: Option<String>,
}

/// Owns the lifecycle of every pipeline child process.
pub struct Supervisor {
    config: Arc<Config>,
    pool: Pool,
    allocator: RunAllocator,
    running: Arc<Mutex<HashMap<String, RunningJob>>>,
}

impl Supervisor {
    /// Create a supervisor. No children exist yet; the caller runs the
    /// store reconciliation before accepting requests.
    pub fn new(config: Arc<Config>, pool: Pool) -> Supervisor {
        let allocator = RunAllocator::new(config.outputs_root.clone());
        Supervisor {
            config,
            pool,
            allocator,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Pids of the children currently alive under this supervisor.
    pub fn live_pids(&self) -> Vec<i32> {
        self.running
            .lock()
            .expect("running map poisoned")
            .values()
            .filter_map(|job| job.pid)
            .collect()
    }

    /// Admit and start a new job.
    ///
    /// Admission reserves a slot in the running map under a short lock;
    /// the run-number scan, the row insert and the spawn itself all
    /// happen outside it, so stopping some other job never waits on a
    /// launch in flight.
    #[tracing::instrument(skip(self, request), fields(sample_id = %request.sample_id))]
    pub fn launch(&self, request: &LaunchRequest) -> Result<Job> {
        let input_type = classify(&request.sample_id)?;
        let prokka_mode = request.prokka_mode.unwrap_or(ProkkaMode::Auto);
        if prokka_mode == ProkkaMode::Custom
            && (request.prokka_genus.is_none() || request.prokka_species.is_none())
        {
            return Err(Error::InvalidInput(
                "custom annotation mode needs prokka_genus and prokka_species".to_string(),
            ));
        }

        let job_id = Uuid::new_v4().to_string();
        {
            let mut running = self.running.lock().expect("running map poisoned");
            if running.len() >= self.config.max_concurrent_jobs {
                return Err(Error::TooManyJobs(self.config.max_concurrent_jobs));
            }
            running.insert(
                job_id.clone(),
                RunningJob {
                    pid: None,
                    stop_requested: false,
                    stop_reason: None,
                },
            );
        }

        let launched = self.start_job(&job_id, request, input_type, prokka_mode);
        if launched.is_err() {
            // Release the reserved slot; the row (if one was created)
            // has already been settled as FAILED.
            self.running
                .lock()
                .expect("running map poisoned")
                .remove(&job_id);
        }
        launched
    }

    /// Allocate, record and spawn one admitted job. The caller holds a
    /// reserved slot for `job_id` and releases it if we fail.
    fn start_job(
        &self,
        job_id: &str,
        request: &LaunchRequest,
        input_type: InputType,
        prokka_mode: ProkkaMode,
    ) -> Result<Job> {
        let mut conn = self.connection()?;
        let run = self.allocator.allocate(&request.sample_id)?;
        let job = NewJob {
            id: job_id.to_string(),
            sample_id: request.sample_id.clone(),
            input_type: Some(input_type),
            status: Status::Pending,
            run_number: Some(run.run_number),
            output_dir: Some(run.path.display().to_string()),
            threads: request.threads.unwrap_or(self.config.default_threads),
            prokka_mode,
            prokka_genus: request.prokka_genus.clone(),
            prokka_species: request.prokka_species.clone(),
            force: request.force.unwrap_or(false),
            created_at: Utc::now().naive_utc(),
        }
        .insert(&mut conn)?;

        let spawned = match self.spawn_pipeline(&job, &run.path) {
            Ok(spawned) => spawned,
            Err(err) => {
                let message = format!("could not start pipeline: {:#}", err);
                error!("job {}: {}", job.id, message);
                Job::update_status(
                    &job.id,
                    Status::Failed,
                    StatusFields {
                        completed_at: Some(Utc::now().naive_utc()),
                        error_message: Some(message),
                        ..StatusFields::default()
                    },
                    &mut conn,
                )?;
                return Err(Error::Other(err));
            }
        };

        let pid = spawned.pid;
        let job = Job::update_status(
            &job.id,
            Status::Running,
            StatusFields {
                pid: Some(pid),
                started_at: Some(Utc::now().naive_utc()),
                ..StatusFields::default()
            },
            &mut conn,
        )?;

        // Publish the pid, and pick up any stop that raced the spawn.
        let stop_pending = {
            let mut running = self.running.lock().expect("running map poisoned");
            match running.get_mut(job_id) {
                Some(entry) => {
                    entry.pid = Some(pid);
                    entry.stop_requested
                }
                None => false,
            }
        };
        self.start_watcher(&job.id, spawned);
        if stop_pending {
            info!("delivering deferred stop to job {} (pgid {})", job.id, pid);
            signal_group(pid, Signal::SIGTERM);
            self.arm_kill_timer(
                job_id.to_string(),
                pid,
                Duration::from_secs(self.config.stop_grace_period_seconds),
            );
        }
        info!(
            "job {} running as pid {} (run {} of {})",
            job.id, pid, job.run_number.unwrap_or(0), job.sample_id
        );
        Ok(job)
    }

    /// Stop a job.
    ///
    /// RUNNING children get a graceful SIGTERM to the whole process
    /// group; a timer SIGKILLs whatever is still alive after the grace
    /// period. The watcher reports the STOPPED transition exactly once,
    /// so repeated stops of a running job converge.
    #[tracing::instrument(skip(self))]
    pub fn stop(&self, job_id: &str) -> Result<()> {
        // Flag the live entry first; a stop that lands while the spawn
        // is still publishing its pid is delivered by start_job.
        let live = {
            let mut running = self.running.lock().expect("running map poisoned");
            match running.get_mut(job_id) {
                Some(entry) => {
                    entry.stop_requested = true;
                    entry
                        .stop_reason
                        .get_or_insert_with(|| "stopped by user request".to_string());
                    Some(entry.pid)
                }
                None => None,
            }
        };

        match live {
            Some(Some(pid)) => {
                info!("stopping job {} (pgid {})", job_id, pid);
                signal_group(pid, Signal::SIGTERM);
                self.arm_kill_timer(
                    job_id.to_string(),
                    pid,
                    Duration::from_secs(self.config.stop_grace_period_seconds),
                );
                Ok(())
            }
            // Reserved slot, no pid yet: flagged, nothing to signal.
            Some(None) => Ok(()),
            None => {
                // No live child. Settle the record, if there is one.
                let mut conn = self.connection()?;
                let job = Job::find(job_id, &mut conn)?;
                if job.status.is_terminal() {
                    return Err(Error::AlreadyTerminal(job_id.to_string()));
                }
                let message = match job.status {
                    Status::Pending => "stopped before the pipeline started",
                    _ => "stopped; process was already gone",
                };
                warn!("job {} has no live child; marking STOPPED", job_id);
                Job::update_status(
                    job_id,
                    Status::Stopped,
                    StatusFields {
                        completed_at: Some(Utc::now().naive_utc()),
                        error_message: Some(message.to_string()),
                        ..StatusFields::default()
                    },
                    &mut conn,
                )?;
                Ok(())
            }
        }
    }

    /// Forget a job that is being deleted: drop its in-memory entry and
    /// kill its process group outright. The caller is about to remove
    /// the row, so there is no state left to transition.
    pub fn forget(&self, job_id: &str) {
        let entry = self
            .running
            .lock()
            .expect("running map poisoned")
            .remove(job_id);
        if let Some(RunningJob { pid: Some(pid), .. }) = entry {
            warn!("killing job {} ahead of deletion", job_id);
            signal_group(pid, Signal::SIGKILL);
        }
    }

    /// Gracefully terminate every running child, then force-kill the
    /// survivors once the drain period expires.
    pub fn drain(&self) {
        let targets: Vec<(String, i32)> = {
            let mut running = self.running.lock().expect("running map poisoned");
            for entry in running.values_mut() {
                entry.stop_requested = true;
                entry
                    .stop_reason
                    .get_or_insert_with(|| "service shutting down".to_string());
            }
            running
                .iter()
                .filter_map(|(id, entry)| entry.pid.map(|pid| (id.clone(), pid)))
                .collect()
        };
        if targets.is_empty() {
            return;
        }

        info!("draining {} running job(s)", targets.len());
        for (_, pid) in &targets {
            signal_group(*pid, Signal::SIGTERM);
        }

        let deadline = Instant::now() + Duration::from_secs(self.config.shutdown_drain_seconds);
        while Instant::now() < deadline {
            if self.running.lock().expect("running map poisoned").is_empty() {
                return;
            }
            thread::sleep(Duration::from_millis(200));
        }

        for (job_id, pid) in &targets {
            if self.is_still_running(job_id, *pid) {
                warn!("job {} survived the drain period; killing", job_id);
                signal_group(*pid, Signal::SIGKILL);
            }
        }

        // Give the watchers a moment to record the final transitions.
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if self.running.lock().expect("running map poisoned").is_empty() {
                return;
            }
            thread::sleep(Duration::from_millis(100));
        }
    }

    /// Spawn the pipeline script for `job` and wire up its output.
    fn spawn_pipeline(&self, job: &Job, run_dir: &Path) -> anyhow::Result<SpawnedChild> {
        let logs_dir = run_dir.join("logs");
        fs::create_dir_all(&logs_dir)
            .with_context(|| format!("could not create {}", logs_dir.display()))?;
        let log_path = logs_dir.join(format!(
            "pipeline_{}.log",
            Utc::now().format("%Y%m%d_%H%M%S")
        ));
        let log_file = File::create(&log_path)
            .with_context(|| format!("could not create {}", log_path.display()))?;

        let mut command = Command::new(&self.config.script_path);
        command
            .arg(&job.sample_id)
            .arg("--prokka-mode")
            .arg(job.prokka_mode.as_str())
            .arg("-t")
            .arg(job.threads.to_string());
        if let Some(genus) = &job.prokka_genus {
            command.arg("--prokka-genus").arg(genus);
        }
        if let Some(species) = &job.prokka_species {
            command.arg("--prokka-species").arg(species);
        }
        if job.force {
            command.arg("--force");
        }
        command
            .current_dir(self.config.script_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // The script fans out into its own children; a fresh process
            // group lets stop() signal all of them at once.
            .process_group(0);

        debug!("spawning {:?}", command);
        let mut child = command.spawn().with_context(|| {
            format!("could not spawn {}", self.config.script_path.display())
        })?;
        let pid = child.id() as i32;

        let tracker = Arc::new(ProgressTracker::new(job.id.clone(), self.pool.clone()));
        let log_file = Arc::new(Mutex::new(log_file));
        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("child stdout is missing"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("child stderr is missing"))?;
        let readers = vec![
            spawn_reader(&job.id, "stdout", stdout, tracker.clone(), log_file.clone(), None),
            spawn_reader(
                &job.id,
                "stderr",
                stderr,
                tracker.clone(),
                log_file,
                Some(stderr_tail.clone()),
            ),
        ];

        Ok(SpawnedChild {
            child,
            pid,
            readers,
            tracker,
            stderr_tail,
        })
    }

    /// Start the watcher thread that blocks on the child's exit and
    /// issues the terminal transition. No lock is held across the wait.
    fn start_watcher(&self, job_id: &str, spawned: SpawnedChild) {
        if let Some(timeout) = self.config.job_timeout_seconds {
            self.arm_timeout_timer(job_id.to_string(), spawned.pid, timeout);
        }

        let job_id = job_id.to_string();
        let pool = self.pool.clone();
        let running = self.running.clone();
        let builder = thread::Builder::new().name(format!("watch-{}", job_id));
        let spawn_job_id = job_id.clone();
        let spawn_result = builder.spawn(move || {
            let SpawnedChild {
                mut child,
                pid,
                readers,
                tracker,
                stderr_tail,
            } = spawned;

            // The readers finish when the pipes close, which is how we
            // know every last line reached the log and the tracker.
            for reader in readers {
                let _ = reader.join();
            }
            let status = match child.wait() {
                Ok(status) => status,
                Err(err) => {
                    error!("could not wait for job {}: {}", job_id, err);
                    return;
                }
            };

            let exit_code = status
                .code()
                .unwrap_or_else(|| 128 + status.signal().unwrap_or(0));
            let stop_reason = {
                let mut map = running.lock().expect("running map poisoned");
                let entry = map.remove(&job_id);
                entry.and_then(|e| {
                    if e.stop_requested {
                        Some(e.stop_reason.unwrap_or_else(|| {
                            "stopped by user request".to_string()
                        }))
                    } else {
                        None
                    }
                })
            };

            let (terminal, error_message) = if let Some(reason) = stop_reason {
                (
                    Status::Stopped,
                    Some(format!("{} (exit code {})", reason, exit_code)),
                )
            } else if status.success() {
                (Status::Completed, None)
            } else {
                (Status::Failed, Some(failure_message(exit_code, &stderr_tail, &tracker)))
            };
            debug!(
                "job {} (pid {}) exited with {}; recording {}",
                job_id, pid, exit_code, terminal
            );

            let result = pool
                .get()
                .map_err(|err| Error::Other(err.into()))
                .and_then(|mut conn| {
                    Job::update_status(
                        &job_id,
                        terminal,
                        StatusFields {
                            completed_at: Some(Utc::now().naive_utc()),
                            exit_code: Some(exit_code),
                            error_message,
                            ..StatusFields::default()
                        },
                        &mut conn,
                    )
                });
            match result {
                Ok(_) => {}
                // The row was deleted while the child ran.
                Err(Error::NotFound(_)) => {
                    debug!("job {} vanished before its exit was recorded", job_id);
                }
                Err(err) => {
                    error!("could not record exit of job {}: {}", job_id, err);
                }
            }
        });
        if let Err(err) = spawn_result {
            error!("could not spawn watcher for job {}: {}", spawn_job_id, err);
        }
    }

    /// Arm the SIGKILL escalation used by `stop`.
    fn arm_kill_timer(&self, job_id: String, pid: i32, grace: Duration) {
        let running = self.running.clone();
        let builder = thread::Builder::new().name(format!("kill-{}", job_id));
        let result = builder.spawn(move || {
            thread::sleep(grace);
            let still_running = running
                .lock()
                .expect("running map poisoned")
                .get(&job_id)
                .map(|entry| entry.pid == Some(pid))
                .unwrap_or(false);
            if still_running {
                warn!("job {} ignored SIGTERM; sending SIGKILL", job_id);
                signal_group(pid, Signal::SIGKILL);
            }
        });
        if let Err(err) = result {
            error!("could not arm kill timer: {}", err);
        }
    }

    /// Arm the optional wall-clock limit for a fresh job.
    fn arm_timeout_timer(&self, job_id: String, pid: i32, timeout_seconds: u64) {
        let running = self.running.clone();
        let grace = Duration::from_secs(self.config.stop_grace_period_seconds);
        let builder = thread::Builder::new().name(format!("timeout-{}", job_id));
        let result = builder.spawn(move || {
            thread::sleep(Duration::from_secs(timeout_seconds));
            let expired = {
                let mut map = running.lock().expect("running map poisoned");
                match map.get_mut(&job_id) {
                    Some(entry) if entry.pid == Some(pid) => {
                        entry.stop_requested = true;
                        entry.stop_reason.get_or_insert_with(|| {
                            format!("wall-clock limit of {}s exceeded", timeout_seconds)
                        });
                        true
                    }
                    _ => false,
                }
            };
            if expired {
                warn!("job {} hit its wall-clock limit", job_id);
                signal_group(pid, Signal::SIGTERM);
                thread::sleep(grace);
                let still_running = running
                    .lock()
                    .expect("running map poisoned")
                    .get(&job_id)
                    .map(|entry| entry.pid == Some(pid))
                    .unwrap_or(false);
                if still_running {
                    signal_group(pid, Signal::SIGKILL);
                }
            }
        });
        if let Err(err) = result {
            error!("could not arm timeout timer: {}", err);
        }
    }

    fn is_still_running(&self, job_id: &str, pid: i32) -> bool {
        self.running
            .lock()
            .expect("running map poisoned")
            .get(job_id)
            .map(|entry| entry.pid == Some(pid))
            .unwrap_or(false)
    }

    fn connection(&self) -> Result<argpipe_common::db::PooledConnection> {
        self.pool
            .get()
            .context("could not check out a database connection")
            .map_err(Error::Other)
    }
}

/// Everything the watcher needs to adopt a freshly spawned child.
struct SpawnedChild {
    child: Child,
    pid: i32,
    readers: Vec<thread::JoinHandle<()>>,
    tracker: Arc<ProgressTracker>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

/// Mirror one output stream into the run log, the progress tracker, and
/// (for stderr) the bounded failure tail.
fn spawn_reader(
    job_id: &str,
    stream: &'static str,
    source: impl Read + Send + 'static,
    tracker: Arc<ProgressTracker>,
    log_file: Arc<Mutex<File>>,
    tail: Option<Arc<Mutex<VecDeque<String>>>>,
) -> thread::JoinHandle<()> {
    let job_id = job_id.to_string();
    thread::Builder::new()
        .name(format!("{}-{}", stream, job_id))
        .spawn(move || {
            let reader = BufReader::new(source);
            for line in reader.lines() {
                let line = match line {
                    Ok(line) => line,
                    // The pipe breaks when the child dies mid-line.
                    Err(_) => break,
                };
                {
                    let mut file = log_file.lock().expect("log file poisoned");
                    let _ = writeln!(file, "{}", line);
                }
                if let Some(tail) = &tail {
                    let mut tail = tail.lock().expect("stderr tail poisoned");
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line.clone());
                }
                tracker.observe_line(&line);
            }
        })
        .expect("could not spawn reader thread")
}

/// Compose the failure message from the stderr tail, falling back to the
/// log preview when the child said nothing on stderr.
fn failure_message(
    exit_code: i32,
    stderr_tail: &Mutex<VecDeque<String>>,
    tracker: &ProgressTracker,
) -> String {
    let tail = stderr_tail.lock().expect("stderr tail poisoned");
    let detail = if tail.is_empty() {
        let preview = tracker.preview();
        preview
            .lines()
            .rev()
            .take(5)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>()
            .join("\n")
    } else {
        tail.iter()
            .rev()
            .take(5)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    };
    if detail.is_empty() {
        format!("pipeline exited with code {}", exit_code)
    } else {
        format!("pipeline exited with code {}: {}", exit_code, detail)
    }
}

/// Signal a whole process group, ignoring already-gone groups.
fn signal_group(pgid: i32, signal: Signal) {
    match killpg(Pid::from_raw(pgid), signal) {
        Ok(()) => {}
        Err(nix::errno::Errno::ESRCH) => {
            debug!("process group {} already gone", pgid);
        }
        Err(err) => {
            warn!("could not signal process group {}: {}", pgid, err);
        }
    }
}
