//! The database-asset manager.
//!
//! The pipeline leans on several reference data bundles (taxonomy,
//! resistance catalogs, typing schemes). They are installed under one
//! root, probed on every query (install state is never trusted from a
//! previous write), and refreshed by background downloads. Partial data
//! that does not pass the probe counts as absent and gets overwritten by
//! the next download.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write as _};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use argpipe_common::prelude::*;
use argpipe_common::rest_api::{AssetStatus, DownloadProgress};
use tracing::{error, info};

/// How a bundle is fetched or rebuilt.
#[derive(Debug)]
enum DownloadRecipe {
    /// Fetch an archive over HTTP and unpack it with `tar`.
    Archive {
        url: &'static str,
        archive_name: &'static str,
        tar_flags: &'static str,
    },
    /// Run a tool that installs the bundle itself. `{path}` in an
    /// argument is replaced with the install directory.
    Command {
        program: &'static str,
        args: &'static [&'static str],
    },
}

/// One reference bundle we know about.
#[derive(Debug)]
pub struct AssetSpec {
    /// Stable key, also the URL path segment.
    pub key: &'static str,
    /// Human-readable name.
    pub display_name: &'static str,
    /// Install directory under the databases root.
    subdir: &'static str,
    /// Files whose presence (anywhere under the install directory)
    /// means the bundle is usable.
    marker_files: &'static [&'static str],
    /// Rough expected size, for operators deciding what to install.
    size_estimate: &'static str,
    /// Can the pipeline run at all without this bundle?
    pub required: bool,
    recipe: DownloadRecipe,
}

/// The catalog of known bundles.
const CATALOG: &[AssetSpec] = &[
    AssetSpec {
        key: "kraken2",
        display_name: "Kraken2",
        subdir: "kraken2_db",
        marker_files: &["hash.k2d"],
        size_estimate: "8 GB",
        required: true,
        recipe: DownloadRecipe::Archive {
            url: "https://genome-idx.s3.amazonaws.com/kraken/k2_standard_08gb_20231009.tar.gz",
            archive_name: "kraken2_db.tar.gz",
            tar_flags: "-xzf",
        },
    },
    AssetSpec {
        key: "amrfinder",
        display_name: "AMRFinderPlus",
        subdir: "amrfinder_db",
        marker_files: &["AMRProt", "AMR.LIB"],
        size_estimate: "~200 MB",
        required: true,
        recipe: DownloadRecipe::Command {
            program: "amrfinder_update",
            args: &["--force_update", "--database", "{path}"],
        },
    },
    AssetSpec {
        key: "card",
        display_name: "CARD",
        subdir: "card_db",
        marker_files: &["card.json"],
        size_estimate: "~1 GB",
        required: false,
        recipe: DownloadRecipe::Archive {
            url: "https://card.mcmaster.ca/latest/data",
            archive_name: "card-data.tar.bz2",
            tar_flags: "-xjf",
        },
    },
    AssetSpec {
        key: "pointfinder",
        display_name: "PointFinder",
        subdir: "pointfinder_db",
        marker_files: &["config"],
        size_estimate: "~3 MB",
        required: false,
        recipe: DownloadRecipe::Command {
            program: "git",
            args: &[
                "clone",
                "https://bitbucket.org/genomicepidemiology/pointfinder_db.git",
                "{path}",
            ],
        },
    },
    AssetSpec {
        key: "mlst",
        display_name: "MLST",
        subdir: "mlst_db",
        marker_files: &["pubmlst"],
        size_estimate: "~200 MB",
        required: false,
        recipe: DownloadRecipe::Command {
            program: "mlst",
            args: &["--update"],
        },
    },
    AssetSpec {
        key: "kma",
        display_name: "KMA/ResFinder index",
        subdir: "kma_db",
        marker_files: &["resfinder.name"],
        size_estimate: "~60 MB",
        required: false,
        recipe: DownloadRecipe::Command {
            program: "bash",
            args: &[
                "-c",
                "for db in resfinder card ncbi; do \
                 kma index -i \"$(abricate --datadir)/$db/sequences\" -o {path}/$db; \
                 done",
            ],
        },
    },
];

/// In-memory record of one download session.
#[derive(Clone, Debug)]
struct DownloadTask {
    state: &'static str,
    percent: i32,
    message: String,
    error: Option<String>,
}

/// Tracks bundle state and runs downloads in background threads.
pub struct AssetManager {
    config: Arc<Config>,
    downloads: Mutex<HashMap<&'static str, DownloadTask>>,
    active: Mutex<usize>,
}

impl AssetManager {
    /// Create a manager rooted at the configured databases directory.
    pub fn new(config: Arc<Config>) -> AssetManager {
        AssetManager {
            config,
            downloads: Mutex::new(HashMap::new()),
            active: Mutex::new(0),
        }
    }

    /// Status of every known bundle, in catalog order.
    pub fn list(&self) -> Vec<AssetStatus> {
        CATALOG.iter().map(|spec| self.status_of(spec)).collect()
    }

    /// Status of one bundle.
    pub fn status(&self, key: &str) -> Result<AssetStatus> {
        let spec = find_spec(key)?;
        Ok(self.status_of(spec))
    }

    /// Progress of the current (or last failed) download of one bundle.
    pub fn progress(&self, key: &str) -> Result<DownloadProgress> {
        let spec = find_spec(key)?;
        let downloads = self.downloads.lock().expect("downloads lock poisoned");
        if let Some(task) = downloads.get(spec.key) {
            return Ok(DownloadProgress {
                state: task.state.to_string(),
                percent: task.percent,
                last_message: task.message.clone(),
            });
        }
        Ok(DownloadProgress {
            state: "idle".to_string(),
            percent: if self.probe(spec).0 { 100 } else { 0 },
            last_message: String::new(),
        })
    }

    /// Start a background download of one bundle.
    ///
    /// At most one download runs per key; a fresh `update` resets the
    /// progress of a previously failed one. The global concurrency cap
    /// is enforced by the worker itself, which waits for a slot.
    pub fn update(self: &Arc<Self>, key: &str) -> Result<()> {
        let spec = find_spec(key)?;
        {
            let mut downloads = self.downloads.lock().expect("downloads lock poisoned");
            if let Some(task) = downloads.get(spec.key) {
                if task.state == "downloading" {
                    return Err(Error::AlreadyDownloading(spec.key.to_string()));
                }
            }
            downloads.insert(
                spec.key,
                DownloadTask {
                    state: "downloading",
                    percent: 0,
                    message: "starting".to_string(),
                    error: None,
                },
            );
        }

        let manager = Arc::clone(self);
        thread::Builder::new()
            .name(format!("download-{}", spec.key))
            .spawn(move || manager.run_download(spec))
            .map_err(|err| {
                Error::Other(anyhow!("could not spawn download thread: {}", err))
            })?;
        info!("download of {} started", spec.key);
        Ok(())
    }

    /// Fail the row and clean up when the worker is done.
    fn run_download(&self, spec: &'static AssetSpec) {
        self.wait_for_slot(spec);
        let result = self.download(spec);
        {
            let mut active = self.active.lock().expect("active lock poisoned");
            *active -= 1;
        }

        let mut downloads = self.downloads.lock().expect("downloads lock poisoned");
        match result {
            Ok(()) => {
                info!("download of {} finished", spec.key);
                downloads.remove(spec.key);
            }
            Err(err) => {
                error!("download of {} failed: {:#}", spec.key, err);
                downloads.insert(
                    spec.key,
                    DownloadTask {
                        state: "error",
                        percent: 0,
                        message: format!("{:#}", err),
                        error: Some(format!("{:#}", err)),
                    },
                );
            }
        }
    }

    /// Block until the global download cap has room for us.
    fn wait_for_slot(&self, spec: &'static AssetSpec) {
        loop {
            {
                let mut active = self.active.lock().expect("active lock poisoned");
                if *active < self.config.max_concurrent_downloads {
                    *active += 1;
                    return;
                }
            }
            self.set_progress(spec, -1, "waiting for a download slot");
            thread::sleep(Duration::from_millis(500));
        }
    }

    /// Run one download to completion and verify the probe afterwards.
    fn download(&self, spec: &'static AssetSpec) -> anyhow::Result<()> {
        let install_path = self.install_path(spec);
        fs::create_dir_all(&install_path).with_context(|| {
            format!("could not create {}", install_path.display())
        })?;

        match &spec.recipe {
            DownloadRecipe::Archive {
                url,
                archive_name,
                tar_flags,
            } => self.download_archive(spec, &install_path, url, archive_name, tar_flags)?,
            DownloadRecipe::Command { program, args } => {
                self.run_install_command(spec, &install_path, program, args)?
            }
        }

        let (installed, _) = self.probe(spec);
        if !installed {
            anyhow::bail!("marker files still missing after install");
        }
        self.set_progress(spec, 100, "installed");
        Ok(())
    }

    /// Stream an archive to `<name>.tmp`, rename, unpack with `tar`,
    /// and delete the archive.
    fn download_archive(
        &self,
        spec: &'static AssetSpec,
        install_path: &Path,
        url: &str,
        archive_name: &str,
        tar_flags: &str,
    ) -> anyhow::Result<()> {
        let archive_path = install_path.join(archive_name);
        let tmp_path = install_path.join(format!("{}.tmp", archive_name));

        self.set_progress(spec, 0, "downloading");
        let response = ureq::get(url)
            .timeout(Duration::from_secs(24 * 60 * 60))
            .call()
            .with_context(|| format!("could not download {}", url))?;
        let total_bytes: Option<u64> = response
            .header("Content-Length")
            .and_then(|v| v.parse().ok());

        let mut reader = response.into_reader();
        let mut file = File::create(&tmp_path)
            .with_context(|| format!("could not write {}", tmp_path.display()))?;
        let mut buffer = [0u8; 64 * 1024];
        let mut downloaded: u64 = 0;
        loop {
            let n = reader
                .read(&mut buffer)
                .with_context(|| format!("error downloading {}", url))?;
            if n == 0 {
                break;
            }
            file.write_all(&buffer[..n])
                .with_context(|| format!("could not write {}", tmp_path.display()))?;
            downloaded += n as u64;
            match total_bytes {
                // Extraction still follows, so cap the visible percent.
                Some(total) if total > 0 => self.set_progress(
                    spec,
                    (((downloaded * 100) / total) as i32).min(95),
                    &format!("downloaded {} of {} bytes", downloaded, total),
                ),
                _ => self.set_progress(
                    spec,
                    -1,
                    &format!("downloaded {} bytes", downloaded),
                ),
            }
        }
        file.flush()
            .with_context(|| format!("could not flush {}", tmp_path.display()))?;
        drop(file);
        fs::rename(&tmp_path, &archive_path).with_context(|| {
            format!("could not move archive into {}", archive_path.display())
        })?;

        self.set_progress(spec, -1, "extracting archive");
        let status = Command::new("tar")
            .arg(tar_flags)
            .arg(archive_name)
            .current_dir(install_path)
            .status()
            .context("could not run tar")?;
        if !status.success() {
            anyhow::bail!("tar exited with {}", status);
        }

        let _ = fs::remove_file(&archive_path);
        Ok(())
    }

    /// Run a tool that performs the install itself, with a heartbeat so
    /// the client sees the session is alive.
    fn run_install_command(
        &self,
        spec: &'static AssetSpec,
        install_path: &Path,
        program: &str,
        args: &[&str],
    ) -> anyhow::Result<()> {
        let path_str = install_path.display().to_string();
        let args: Vec<String> = args
            .iter()
            .map(|arg| arg.replace("{path}", &path_str))
            .collect();

        self.set_progress(spec, -1, "installing");
        let mut child = Command::new(program)
            .args(&args)
            .spawn()
            .with_context(|| format!("could not run {}", program))?;

        let started = Instant::now();
        loop {
            match child.try_wait().context("could not poll installer")? {
                Some(status) if status.success() => return Ok(()),
                Some(status) => anyhow::bail!("{} exited with {}", program, status),
                None => {
                    let elapsed = started.elapsed().as_secs();
                    self.set_progress(
                        spec,
                        -1,
                        &format!("installing ({}m{:02}s)", elapsed / 60, elapsed % 60),
                    );
                    thread::sleep(Duration::from_secs(2));
                }
            }
        }
    }

    /// Probe one bundle: (installed, size in bytes).
    fn probe(&self, spec: &AssetSpec) -> (bool, u64) {
        let install_path = self.install_path(spec);
        if !install_path.is_dir() {
            return (false, 0);
        }

        let installed = spec.marker_files.iter().any(|marker| {
            let pattern = format!("{}/**/{}", install_path.display(), marker);
            glob::glob(&pattern)
                .map(|mut paths| paths.any(|p| p.is_ok()))
                .unwrap_or(false)
        });

        let mut size = 0;
        if let Ok(paths) = glob::glob(&format!("{}/**/*", install_path.display())) {
            for path in paths.flatten() {
                if let Ok(metadata) = path.metadata() {
                    if metadata.is_file() {
                        size += metadata.len();
                    }
                }
            }
        }
        (installed, size)
    }

    fn status_of(&self, spec: &AssetSpec) -> AssetStatus {
        let (installed, size_bytes) = self.probe(spec);
        let downloads = self.downloads.lock().expect("downloads lock poisoned");
        let task = downloads.get(spec.key);
        AssetStatus {
            key: spec.key.to_string(),
            display_name: spec.display_name.to_string(),
            install_path: self.install_path(spec).display().to_string(),
            required: spec.required,
            installed,
            size_bytes,
            size_estimate: spec.size_estimate.to_string(),
            download_state: task.map(|t| t.state).unwrap_or("idle").to_string(),
            download_progress_percent: task.map(|t| t.percent),
            last_error: task.and_then(|t| t.error.clone()),
        }
    }

    fn install_path(&self, spec: &AssetSpec) -> PathBuf {
        self.config.databases_root.join(spec.subdir)
    }

    /// Merge a progress update, never letting a session's percent move
    /// backwards (the indeterminate -1 excepted).
    fn set_progress(&self, spec: &'static AssetSpec, percent: i32, message: &str) {
        let mut downloads = self.downloads.lock().expect("downloads lock poisoned");
        if let Some(task) = downloads.get_mut(spec.key) {
            task.percent = if percent < 0 {
                percent
            } else {
                task.percent.max(percent)
            };
            task.message = message.to_string();
        }
    }
}

fn find_spec(key: &str) -> Result<&'static AssetSpec> {
    CATALOG
        .iter()
        .find(|spec| spec.key == key)
        .ok_or_else(|| Error::NotFound(format!("database {}", key)))
}
