//! `argpiped`: the HTTP daemon in front of the AMR analysis pipeline.
//!
//! The handlers below are thin adapters: they validate the request,
//! call into the supervisor / store / parser / asset manager, and map
//! component errors onto the wire taxonomy. All business rules live in
//! the components.

#[macro_use]
extern crate rocket;

use std::sync::Arc;

use rocket::http::Status as HttpStatus;
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use serde_json::json;

use argpipe_common::db::{self, Pool};
use argpipe_common::prelude::*;
use argpipe_common::rest_api::{
    AckResponse, AnalysisResults, AssetStatus, DownloadProgress, FileEntry,
    JobListItem, JobListResponse, JobStatusResponse, LaunchRequest, LaunchResponse,
};
use argpipe_common::tracing_support;
use tracing::{info, warn};

mod assets;
mod classify;
mod output_parser;
mod progress;
mod run_number;
mod supervisor;
mod util;

use assets::AssetManager;
use supervisor::Supervisor;
use util::{ApiResult, DbConn};

/// Liveness probe: confirms the daemon is up and its pipeline script is
/// where the configuration says it is.
#[get("/health")]
fn health(config: &State<Arc<Config>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "pipeline_script_exists": config.script_path.is_file(),
    }))
}

/// Launch a new analysis run.
#[post("/launch", data = "<request>")]
fn launch(
    supervisor: &State<Arc<Supervisor>>,
    request: Json<LaunchRequest>,
) -> ApiResult<Json<LaunchResponse>> {
    let job = supervisor.launch(&request)?;
    Ok(Json(LaunchResponse {
        job_id: job.id,
        sample_id: job.sample_id,
        status: job.status,
        created_at: job.created_at,
    }))
}

/// Look up the live status of a job.
#[get("/status/<job_id>")]
fn job_status(mut conn: DbConn, job_id: &str) -> ApiResult<Json<JobStatusResponse>> {
    let job = Job::find(job_id, &mut conn)?;
    Ok(Json(job.into()))
}

/// Parse and return the results of a completed job.
#[get("/results/<job_id>")]
fn job_results(mut conn: DbConn, job_id: &str) -> ApiResult<Json<AnalysisResults>> {
    let job = Job::find(job_id, &mut conn)?;
    if job.status != Status::Completed {
        return Err(Error::NotCompleted(job_id.to_string()).into());
    }
    let output_dir = job
        .output_dir
        .clone()
        .ok_or_else(|| Error::NotCompleted(job_id.to_string()))?;
    let parsed = output_parser::parse_run_directory(Path::new(&output_dir));
    Ok(Json(parsed.into_results(&job)))
}

/// List jobs, newest first.
#[get("/jobs?<status_filter>&<limit>&<offset>")]
fn list_jobs(
    mut conn: DbConn,
    status_filter: Option<&str>,
    limit: Option<i64>,
    offset: Option<i64>,
) -> ApiResult<Json<JobListResponse>> {
    let status = match status_filter {
        Some(raw) => Some(
            raw.parse::<Status>()
                .map_err(Error::InvalidInput)?,
        ),
        None => None,
    };
    let limit = limit.unwrap_or(100).clamp(1, 1000);
    let offset = offset.unwrap_or(0).max(0);
    let total = Job::count(status, &mut conn)?;
    let jobs = Job::list(status, limit, offset, &mut conn)?
        .into_iter()
        .map(JobListItem::from)
        .collect();
    Ok(Json(JobListResponse { total, jobs }))
}

/// Stop a running (or still pending) job.
#[post("/jobs/<job_id>/stop")]
fn stop_job(
    supervisor: &State<Arc<Supervisor>>,
    job_id: &str,
) -> ApiResult<Json<AckResponse>> {
    supervisor.stop(job_id)?;
    Ok(Json(AckResponse::new()))
}

/// Delete a job row, best-effort removing its run directory.
#[delete("/jobs/<job_id>")]
fn delete_job(
    supervisor: &State<Arc<Supervisor>>,
    mut conn: DbConn,
    job_id: &str,
) -> ApiResult<HttpStatus> {
    let job = Job::find(job_id, &mut conn)?;
    supervisor.forget(job_id);
    if let Some(output_dir) = &job.output_dir {
        match std::fs::remove_dir_all(output_dir) {
            Ok(()) => info!("removed {}", output_dir),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!("could not remove {}: {}", output_dir, err),
        }
    }
    Job::delete(job_id, &mut conn)?;
    Ok(HttpStatus::NoContent)
}

/// List every file a job's run produced.
#[get("/jobs/<job_id>/files")]
fn job_files(mut conn: DbConn, job_id: &str) -> ApiResult<Json<Vec<FileEntry>>> {
    let job = Job::find(job_id, &mut conn)?;
    let files = match &job.output_dir {
        Some(dir) if Path::new(dir).is_dir() => {
            output_parser::list_run_files(Path::new(dir))?
        }
        _ => vec![],
    };
    Ok(Json(files))
}

/// Report the install state of every reference bundle.
#[get("/databases")]
fn list_databases(assets: &State<Arc<AssetManager>>) -> Json<Vec<AssetStatus>> {
    Json(assets.list())
}

/// Start a background download of one reference bundle.
#[post("/databases/<key>/update")]
fn update_database(
    assets: &State<Arc<AssetManager>>,
    key: &str,
) -> ApiResult<Json<AckResponse>> {
    assets.update(key)?;
    Ok(Json(AckResponse::new()))
}

/// Report the progress of one reference bundle's download.
#[get("/databases/<key>/progress")]
fn database_progress(
    assets: &State<Arc<AssetManager>>,
    key: &str,
) -> ApiResult<Json<DownloadProgress>> {
    Ok(Json(assets.progress(key)?))
}

/// Assemble the Rocket instance. Shared with the tests, which drive it
/// through a local client instead of a socket.
fn build_rocket(
    config: Arc<Config>,
    pool: Pool,
    supervisor: Arc<Supervisor>,
    assets: Arc<AssetManager>,
) -> Rocket<Build> {
    let figment = rocket::Config::figment()
        .merge(("address", config.api_host.clone()))
        .merge(("port", config.api_port));
    rocket::custom(figment)
        .manage(pool)
        .manage(config)
        .manage(supervisor)
        .manage(assets)
        .mount("/", routes![health])
        .mount(
            "/api",
            routes![
                launch,
                job_status,
                job_results,
                list_jobs,
                stop_job,
                delete_job,
                job_files,
                list_databases,
                update_database,
                database_progress,
            ],
        )
}

#[rocket::main]
async fn main() -> Result<()> {
    tracing_support::initialize_tracing();
    let config = Arc::new(Config::from_env()?);
    info!(
        "starting argpiped on {}:{} (script {})",
        config.api_host,
        config.api_port,
        config.script_path.display()
    );

    let pool = db::pool(&config.database_url, 8)?;
    let supervisor = Arc::new(Supervisor::new(config.clone(), pool.clone()));
    {
        let mut conn = pool
            .get()
            .context("could not open the job store")
            .map_err(Error::Other)?;
        db::run_pending_migrations(&mut conn)?;
        // A fresh supervisor has no children, so every RUNNING row left
        // over from the previous process is an orphan.
        let reconciled = Job::reconcile_orphans(&supervisor.live_pids(), &mut conn)?;
        if reconciled > 0 {
            warn!("failed {} orphaned job(s) from a previous run", reconciled);
        }
    }
    let assets = Arc::new(AssetManager::new(config.clone()));

    let rocket = build_rocket(config.clone(), pool, supervisor.clone(), assets);
    rocket
        .launch()
        .await
        .context("server error")
        .map_err(Error::Other)?;

    // Rocket has stopped accepting requests; give running pipelines the
    // configured drain window before the process exits.
    supervisor.drain();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rocket::http::ContentType;
    use rocket::local::blocking::Client;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use std::time::{Duration, Instant};

    /// A pipeline stand-in that writes a minimal result tree and logs
    /// like the real script.
    const HAPPY_SCRIPT: &str = r#"#!/bin/sh
sample="$1"
run_dir=$(ls -d "outputs/${sample}"_* 2>/dev/null | sort | tail -n 1)
echo "Downloading ${sample} with prefetch"
echo "Running SPAdes assembly"
mkdir -p "${run_dir}/04_arg_detection/resfinder"
printf '#FILE\tSEQUENCE\tGENE\t%%COVERAGE\t%%IDENTITY\tRESISTANCE\n' \
    > "${run_dir}/04_arg_detection/resfinder/${sample}_resfinder.tsv"
printf 'c.fa\tctg1\tblaTEM-1B\t100.00\t99.88\tBeta-lactam\n' \
    >> "${run_dir}/04_arg_detection/resfinder/${sample}_resfinder.tsv"
printf 'c.fa\tctg2\ttet(A)\t98.00\t97.10\tTetracycline\n' \
    >> "${run_dir}/04_arg_detection/resfinder/${sample}_resfinder.tsv"
echo "Pipeline completed successfully"
exit 0
"#;

    /// A pipeline stand-in that blocks until it is signalled.
    const SLOW_SCRIPT: &str = "#!/bin/sh\necho \"Downloading $1 with prefetch\"\nsleep 600\n";

    /// A pipeline stand-in that fails after complaining on stderr.
    const FAILING_SCRIPT: &str =
        "#!/bin/sh\necho 'Downloading input' \necho 'assembler ran out of memory' >&2\nexit 3\n";

    struct TestService {
        client: Client,
        outputs_root: PathBuf,
        _tmp: tempfile::TempDir,
    }

    fn test_service(script: &str, max_concurrent_jobs: usize) -> TestService {
        let tmp = tempfile::tempdir().unwrap();
        let script_path = tmp.path().join("pipeline.sh");
        fs::write(&script_path, script).unwrap();
        fs::set_permissions(&script_path, fs::Permissions::from_mode(0o755)).unwrap();

        let outputs_root = tmp.path().join("outputs");
        let config = Arc::new(Config {
            api_host: "127.0.0.1".to_string(),
            api_port: 0,
            database_url: tmp.path().join("jobs.db").display().to_string(),
            outputs_root: outputs_root.clone(),
            script_path,
            databases_root: tmp.path().join("databases"),
            max_concurrent_jobs,
            max_concurrent_downloads: 2,
            stop_grace_period_seconds: 2,
            shutdown_drain_seconds: 2,
            default_threads: 8,
            job_timeout_seconds: None,
        });

        let pool = db::pool(&config.database_url, 4).unwrap();
        db::run_pending_migrations(&mut pool.get().unwrap()).unwrap();
        let supervisor = Arc::new(Supervisor::new(config.clone(), pool.clone()));
        let assets = Arc::new(AssetManager::new(config.clone()));
        let rocket = build_rocket(config, pool, supervisor, assets);
        TestService {
            client: Client::tracked(rocket).unwrap(),
            outputs_root,
            _tmp: tmp,
        }
    }

    fn launch_sample(service: &TestService, sample_id: &str) -> serde_json::Value {
        let response = service
            .client
            .post("/api/launch")
            .header(ContentType::JSON)
            .body(json!({ "sample_id": sample_id }).to_string())
            .dispatch();
        assert_eq!(response.status(), HttpStatus::Ok);
        response.into_json().unwrap()
    }

    fn wait_for_status(
        service: &TestService,
        job_id: &str,
        wanted: &str,
    ) -> serde_json::Value {
        let deadline = Instant::now() + Duration::from_secs(15);
        loop {
            let response = service
                .client
                .get(format!("/api/status/{}", job_id))
                .dispatch();
            assert_eq!(response.status(), HttpStatus::Ok);
            let body: serde_json::Value = response.into_json().unwrap();
            if body["status"] == wanted {
                return body;
            }
            assert!(
                Instant::now() < deadline,
                "job {} stuck in {} waiting for {}",
                job_id,
                body["status"],
                wanted
            );
            std::thread::sleep(Duration::from_millis(100));
        }
    }

    #[test]
    fn happy_path_reads_archive() {
        let service = test_service(HAPPY_SCRIPT, 1);
        let launched = launch_sample(&service, "SRR28083254");
        assert_eq!(launched["status"], "RUNNING");
        let job_id = launched["job_id"].as_str().unwrap();

        let status = wait_for_status(&service, job_id, "COMPLETED");
        assert_eq!(status["exit_code"], 0);
        assert_eq!(status["run_number"], 1);
        assert_eq!(status["progress_percent"], 100);

        let response = service
            .client
            .get(format!("/api/results/{}", job_id))
            .dispatch();
        assert_eq!(response.status(), HttpStatus::Ok);
        let results: serde_json::Value = response.into_json().unwrap();
        assert_eq!(results["total_arg_genes"], 2);
        assert_eq!(results["arg_detection"]["resfinder"]["num_genes"], 2);
        assert_eq!(
            results["unique_resistance_types"],
            json!(["Beta-lactam", "Tetracycline"])
        );

        // The run log landed in the run directory.
        let logs = service.outputs_root.join("SRR28083254_1/logs");
        assert!(fs::read_dir(logs).unwrap().next().is_some());
    }

    #[test]
    fn classifier_rejection_creates_no_row() {
        let service = test_service(HAPPY_SCRIPT, 1);
        let response = service
            .client
            .post("/api/launch")
            .header(ContentType::JSON)
            .body(json!({ "sample_id": "../../etc/passwd" }).to_string())
            .dispatch();
        assert_eq!(response.status(), HttpStatus::BadRequest);
        let body: serde_json::Value = response.into_json().unwrap();
        assert_eq!(body["error"], "invalid_input");

        let jobs: serde_json::Value = service
            .client
            .get("/api/jobs")
            .dispatch()
            .into_json()
            .unwrap();
        assert_eq!(jobs["total"], 0);
    }

    #[test]
    fn admission_cap_rejects_the_second_launch() {
        let service = test_service(SLOW_SCRIPT, 1);
        let first = launch_sample(&service, "SRR101");
        let first_id = first["job_id"].as_str().unwrap();

        let response = service
            .client
            .post("/api/launch")
            .header(ContentType::JSON)
            .body(json!({ "sample_id": "SRR102" }).to_string())
            .dispatch();
        assert_eq!(response.status(), HttpStatus::TooManyRequests);
        let body: serde_json::Value = response.into_json().unwrap();
        assert_eq!(body["error"], "too_many_jobs");

        // The first job is unaffected.
        let status: serde_json::Value = service
            .client
            .get(format!("/api/status/{}", first_id))
            .dispatch()
            .into_json()
            .unwrap();
        assert_eq!(status["status"], "RUNNING");

        // Stop it so the test tree tears down promptly.
        let response = service
            .client
            .post(format!("/api/jobs/{}/stop", first_id))
            .dispatch();
        assert_eq!(response.status(), HttpStatus::Ok);
        wait_for_status(&service, first_id, "STOPPED");
    }

    #[test]
    fn stop_terminates_the_process_group() {
        let service = test_service(SLOW_SCRIPT, 1);
        let launched = launch_sample(&service, "SRR201");
        let job_id = launched["job_id"].as_str().unwrap();

        let response = service
            .client
            .post(format!("/api/jobs/{}/stop", job_id))
            .dispatch();
        assert_eq!(response.status(), HttpStatus::Ok);
        let ack: serde_json::Value = response.into_json().unwrap();
        assert_eq!(ack["ack"], true);

        let status = wait_for_status(&service, job_id, "STOPPED");
        assert!(status["exit_code"].as_i64().is_some());
        assert!(!status["error_message"].as_str().unwrap().is_empty());

        // Stopping a terminal job is a documented conflict.
        let response = service
            .client
            .post(format!("/api/jobs/{}/stop", job_id))
            .dispatch();
        assert_eq!(response.status(), HttpStatus::Conflict);
        let body: serde_json::Value = response.into_json().unwrap();
        assert_eq!(body["error"], "already_terminal");
    }

    #[test]
    fn failing_pipeline_reports_stderr_tail() {
        let service = test_service(FAILING_SCRIPT, 1);
        let launched = launch_sample(&service, "SRR301");
        let job_id = launched["job_id"].as_str().unwrap();

        let status = wait_for_status(&service, job_id, "FAILED");
        assert_eq!(status["exit_code"], 3);
        let message = status["error_message"].as_str().unwrap();
        assert!(message.contains("assembler ran out of memory"), "{}", message);

        // Results are only defined for completed jobs.
        let response = service
            .client
            .get(format!("/api/results/{}", job_id))
            .dispatch();
        assert_eq!(response.status(), HttpStatus::Conflict);
    }

    #[test]
    fn run_numbers_skip_over_gaps() {
        let service = test_service(HAPPY_SCRIPT, 1);
        fs::create_dir_all(service.outputs_root.join("SRR1_1")).unwrap();
        fs::create_dir_all(service.outputs_root.join("SRR1_3")).unwrap();

        let launched = launch_sample(&service, "SRR1");
        let job_id = launched["job_id"].as_str().unwrap();
        let status = wait_for_status(&service, job_id, "COMPLETED");
        assert_eq!(status["run_number"], 4);
    }

    #[test]
    fn unknown_ids_are_not_found() {
        let service = test_service(HAPPY_SCRIPT, 1);
        for request in [
            service.client.get("/api/status/nope").dispatch(),
            service.client.get("/api/results/nope").dispatch(),
            service.client.post("/api/jobs/nope/stop").dispatch(),
            service.client.delete("/api/jobs/nope").dispatch(),
            service.client.get("/api/jobs/nope/files").dispatch(),
        ] {
            assert_eq!(request.status(), HttpStatus::NotFound);
        }
    }

    #[test]
    fn delete_removes_row_and_run_directory() {
        let service = test_service(HAPPY_SCRIPT, 1);
        let launched = launch_sample(&service, "SRR401");
        let job_id = launched["job_id"].as_str().unwrap();
        wait_for_status(&service, job_id, "COMPLETED");

        let run_dir = service.outputs_root.join("SRR401_1");
        assert!(run_dir.is_dir());

        let response = service
            .client
            .delete(format!("/api/jobs/{}", job_id))
            .dispatch();
        assert_eq!(response.status(), HttpStatus::NoContent);
        assert!(!run_dir.exists());

        let response = service
            .client
            .get(format!("/api/status/{}", job_id))
            .dispatch();
        assert_eq!(response.status(), HttpStatus::NotFound);
    }

    #[test]
    fn files_endpoint_lists_the_run_tree() {
        let service = test_service(HAPPY_SCRIPT, 1);
        let launched = launch_sample(&service, "SRR501");
        let job_id = launched["job_id"].as_str().unwrap();
        wait_for_status(&service, job_id, "COMPLETED");

        let files: serde_json::Value = service
            .client
            .get(format!("/api/jobs/{}/files", job_id))
            .dispatch()
            .into_json()
            .unwrap();
        let rel_paths: Vec<&str> = files
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["rel_path"].as_str().unwrap())
            .collect();
        assert!(rel_paths
            .iter()
            .any(|p| p.ends_with("SRR501_resfinder.tsv")));
    }

    #[test]
    fn databases_surface_reports_the_catalog() {
        let service = test_service(HAPPY_SCRIPT, 1);
        let databases: serde_json::Value = service
            .client
            .get("/api/databases")
            .dispatch()
            .into_json()
            .unwrap();
        let keys: Vec<&str> = databases
            .as_array()
            .unwrap()
            .iter()
            .map(|d| d["key"].as_str().unwrap())
            .collect();
        assert!(keys.contains(&"kraken2"));
        assert!(keys.contains(&"amrfinder"));

        let response = service
            .client
            .get("/api/databases/kraken2/progress")
            .dispatch();
        assert_eq!(response.status(), HttpStatus::Ok);
        let progress: serde_json::Value = response.into_json().unwrap();
        assert_eq!(progress["state"], "idle");

        let response = service
            .client
            .post("/api/databases/nope/update")
            .dispatch();
        assert_eq!(response.status(), HttpStatus::NotFound);
    }

    #[test]
    fn list_filters_by_status() {
        let service = test_service(HAPPY_SCRIPT, 2);
        let first = launch_sample(&service, "SRR601");
        wait_for_status(&service, first["job_id"].as_str().unwrap(), "COMPLETED");

        let completed: serde_json::Value = service
            .client
            .get("/api/jobs?status_filter=COMPLETED")
            .dispatch()
            .into_json()
            .unwrap();
        assert_eq!(completed["total"], 1);

        let stopped: serde_json::Value = service
            .client
            .get("/api/jobs?status_filter=STOPPED")
            .dispatch()
            .into_json()
            .unwrap();
        assert_eq!(stopped["total"], 0);

        let response = service
            .client
            .get("/api/jobs?status_filter=BOGUS")
            .dispatch();
        assert_eq!(response.status(), HttpStatus::BadRequest);
    }
}
