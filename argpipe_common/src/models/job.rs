use diesel::prelude::*;

use crate::prelude::*;
use crate::schema::jobs;

/// A supervised pipeline run.
#[derive(Clone, Debug, Deserialize, Identifiable, Queryable, Serialize)]
#[diesel(table_name = jobs)]
pub struct Job {
    /// The unique ID of this job (a UUID rendered as text).
    pub id: String,
    /// The sample identifier submitted by the caller.
    pub sample_id: String,
    /// The input shape the classifier decided on.
    pub input_type: Option<InputType>,
    /// The current status of this job.
    pub status: Status,
    /// The per-sample run number, allocated when the job is admitted.
    pub run_number: Option<i32>,
    /// Absolute path of `<outputs_root>/<sample_id>_<run_number>`.
    pub output_dir: Option<String>,
    /// OS process id of the pipeline; meaningful only while running.
    pub pid: Option<i32>,
    /// Thread count passed to the pipeline.
    pub threads: i32,
    /// Annotation mode passed to the pipeline.
    pub prokka_mode: ProkkaMode,
    /// Genus override, only meaningful in custom mode.
    pub prokka_genus: Option<String>,
    /// Species override, only meaningful in custom mode.
    pub prokka_species: Option<String>,
    /// Run the pipeline non-interactively, overwriting stale state.
    pub force: bool,
    /// When this job was created.
    pub created_at: NaiveDateTime,
    /// When the pipeline was spawned.
    pub started_at: Option<NaiveDateTime>,
    /// When the job reached a terminal status.
    pub completed_at: Option<NaiveDateTime>,
    /// Exit code of the pipeline, set on the terminal transition.
    pub exit_code: Option<i32>,
    /// Why the job failed, populated only on FAILED and STOPPED.
    pub error_message: Option<String>,
    /// Estimated progress in percent, monotonically non-decreasing.
    pub progress_percent: i32,
    /// The phase the progress tracker last recognized.
    pub current_step: String,
    /// Bounded tail of the pipeline log.
    pub logs_preview: Option<String>,
}

/// Optional fields merged into a job row alongside a status change.
#[derive(AsChangeset, Debug, Default)]
#[diesel(table_name = jobs)]
pub struct StatusFields {
    /// OS process id of the freshly spawned pipeline.
    pub pid: Option<i32>,
    /// When the pipeline was spawned.
    pub started_at: Option<NaiveDateTime>,
    /// When the job reached a terminal status.
    pub completed_at: Option<NaiveDateTime>,
    /// Exit code of the pipeline.
    pub exit_code: Option<i32>,
    /// Why the job failed or was stopped.
    pub error_message: Option<String>,
}

/// Internal changeset for `update_status`, carrying the new status plus
/// whatever extra fields the caller supplied.
#[derive(AsChangeset)]
#[diesel(table_name = jobs)]
struct StatusChange {
    status: Status,
    #[diesel(embed)]
    fields: StatusFields,
}

impl Job {
    /// Find a job by ID.
    #[tracing::instrument(skip(conn), level = "trace")]
    pub fn find(id: &str, conn: &mut SqliteConnection) -> Result<Job> {
        jobs::table
            .find(id)
            .first(conn)
            .optional()
            .with_context(|| format!("could not load job {}", id))
            .map_err(Error::Other)?
            .ok_or_else(|| Error::NotFound(format!("job {}", id)))
    }

    /// Find all jobs with the specified status.
    #[tracing::instrument(skip(conn), level = "trace")]
    pub fn find_by_status(
        status: Status,
        conn: &mut SqliteConnection,
    ) -> Result<Vec<Job>> {
        jobs::table
            .filter(jobs::status.eq(status))
            .order_by(jobs::created_at.desc())
            .load(conn)
            .with_context(|| format!("could not load jobs with status {}", status))
            .map_err(Error::Other)
    }

    /// List jobs, newest first, with an optional status filter.
    #[tracing::instrument(skip(conn), level = "trace")]
    pub fn list(
        status: Option<Status>,
        limit: i64,
        offset: i64,
        conn: &mut SqliteConnection,
    ) -> Result<Vec<Job>> {
        let mut query = jobs::table.into_boxed();
        if let Some(status) = status {
            query = query.filter(jobs::status.eq(status));
        }
        query
            .order_by(jobs::created_at.desc())
            .then_order_by(jobs::id.asc())
            .limit(limit)
            .offset(offset)
            .load(conn)
            .context("could not list jobs")
            .map_err(Error::Other)
    }

    /// Count jobs, with an optional status filter.
    #[tracing::instrument(skip(conn), level = "trace")]
    pub fn count(status: Option<Status>, conn: &mut SqliteConnection) -> Result<i64> {
        let mut query = jobs::table.into_boxed();
        if let Some(status) = status {
            query = query.filter(jobs::status.eq(status));
        }
        query
            .count()
            .get_result(conn)
            .context("could not count jobs")
            .map_err(Error::Other)
    }

    /// Move a job to `to`, merging in the supplied fields.
    ///
    /// The whole check-and-write runs inside one transaction, so the
    /// transition table is enforced even when the supervisor's watcher
    /// and an HTTP `stop` race on the same row.
    #[tracing::instrument(skip(conn), level = "trace")]
    pub fn update_status(
        id: &str,
        to: Status,
        fields: StatusFields,
        conn: &mut SqliteConnection,
    ) -> Result<Job> {
        conn.transaction(|conn| {
            let job = Job::find(id, conn)?;
            if !job.status.can_transition_to(to) {
                return Err(Error::InvalidTransition {
                    from: job.status,
                    to,
                });
            }
            diesel::update(jobs::table.find(id))
                .set(StatusChange { status: to, fields })
                .get_result(conn)
                .with_context(|| format!("could not update status of job {}", id))
                .map_err(Error::Other)
        })
    }

    /// Merge a progress estimate into a job row.
    ///
    /// `progress_percent` never regresses: the stored value is the max of
    /// the old and new percentages regardless of call order.
    #[tracing::instrument(skip(conn, preview), level = "trace")]
    pub fn update_progress(
        id: &str,
        percent: i32,
        step: &str,
        preview: &str,
        conn: &mut SqliteConnection,
    ) -> Result<()> {
        conn.transaction(|conn| {
            let current: i32 = jobs::table
                .find(id)
                .select(jobs::progress_percent)
                .first(conn)
                .optional()?
                .ok_or_else(|| Error::NotFound(format!("job {}", id)))?;
            diesel::update(jobs::table.find(id))
                .set((
                    jobs::progress_percent.eq(current.max(percent)),
                    jobs::current_step.eq(step),
                    jobs::logs_preview.eq(preview),
                ))
                .execute(conn)
                .with_context(|| format!("could not update progress of job {}", id))
                .map_err(Error::Other)?;
            Ok(())
        })
    }

    /// Delete a job row.
    #[tracing::instrument(skip(conn), level = "trace")]
    pub fn delete(id: &str, conn: &mut SqliteConnection) -> Result<()> {
        let deleted = diesel::delete(jobs::table.find(id))
            .execute(conn)
            .with_context(|| format!("could not delete job {}", id))
            .map_err(Error::Other)?;
        if deleted == 0 {
            return Err(Error::NotFound(format!("job {}", id)));
        }
        Ok(())
    }

    /// Fail every RUNNING row whose pid is not a live child of this
    /// process. Called once at startup, before the supervisor accepts
    /// work, so a crashed predecessor's jobs do not stay RUNNING forever.
    /// Orphaned children are left for the OS; we never re-adopt them.
    #[tracing::instrument(skip(conn), level = "debug")]
    pub fn reconcile_orphans(
        live_pids: &[i32],
        conn: &mut SqliteConnection,
    ) -> Result<usize> {
        let running = Job::find_by_status(Status::Running, conn)?;
        let mut reconciled = 0;
        for job in running {
            let alive = job.pid.map(|pid| live_pids.contains(&pid)).unwrap_or(false);
            if alive {
                continue;
            }
            warn!(
                "job {} was RUNNING with no live process; marking FAILED",
                job.id
            );
            Job::update_status(
                &job.id,
                Status::Failed,
                StatusFields {
                    completed_at: Some(Utc::now().naive_utc()),
                    error_message: Some("supervisor restarted; process lost".to_string()),
                    ..StatusFields::default()
                },
                conn,
            )?;
            reconciled += 1;
        }
        Ok(reconciled)
    }
}

/// Data required to create a new `Job`.
#[derive(Debug, Insertable)]
#[diesel(table_name = jobs)]
pub struct NewJob {
    /// The unique ID for this job.
    pub id: String,
    /// The sample identifier submitted by the caller.
    pub sample_id: String,
    /// The input shape the classifier decided on.
    pub input_type: Option<InputType>,
    /// Initial status, always `PENDING`.
    pub status: Status,
    /// The run number allocated for this submission.
    pub run_number: Option<i32>,
    /// Absolute path of the run directory.
    pub output_dir: Option<String>,
    /// Thread count passed to the pipeline.
    pub threads: i32,
    /// Annotation mode passed to the pipeline.
    pub prokka_mode: ProkkaMode,
    /// Genus override, only meaningful in custom mode.
    pub prokka_genus: Option<String>,
    /// Species override, only meaningful in custom mode.
    pub prokka_species: Option<String>,
    /// Run the pipeline non-interactively.
    pub force: bool,
    /// When this job was created.
    pub created_at: NaiveDateTime,
}

impl NewJob {
    /// Insert a new job into the database.
    #[tracing::instrument(skip(conn), level = "trace")]
    pub fn insert(&self, conn: &mut SqliteConnection) -> Result<Job> {
        diesel::insert_into(jobs::table)
            .values(self)
            .get_result(conn)
            .context("error inserting job")
            .map_err(Error::Other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn test_conn() -> SqliteConnection {
        let mut conn = SqliteConnection::establish(":memory:").unwrap();
        db::run_pending_migrations(&mut conn).unwrap();
        conn
    }

    fn new_job(sample_id: &str) -> NewJob {
        NewJob {
            id: Uuid::new_v4().to_string(),
            sample_id: sample_id.to_string(),
            input_type: Some(InputType::ReadsArchive),
            status: Status::Pending,
            run_number: Some(1),
            output_dir: Some(format!("/tmp/outputs/{}_1", sample_id)),
            threads: 8,
            prokka_mode: ProkkaMode::Auto,
            prokka_genus: None,
            prokka_species: None,
            force: false,
            created_at: Utc::now().naive_utc(),
        }
    }

    #[test]
    fn insert_find_and_list() {
        let mut conn = test_conn();
        let job = new_job("SRR28083254").insert(&mut conn).unwrap();
        assert_eq!(job.status, Status::Pending);
        assert_eq!(job.progress_percent, 0);
        assert_eq!(job.current_step, "initializing");

        let found = Job::find(&job.id, &mut conn).unwrap();
        assert_eq!(found.sample_id, "SRR28083254");

        assert_eq!(Job::count(None, &mut conn).unwrap(), 1);
        assert_eq!(
            Job::list(Some(Status::Pending), 10, 0, &mut conn)
                .unwrap()
                .len(),
            1
        );
        assert!(Job::list(Some(Status::Running), 10, 0, &mut conn)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn find_unknown_job_is_not_found() {
        let mut conn = test_conn();
        match Job::find("no-such-id", &mut conn) {
            Err(Error::NotFound(_)) => {}
            other => panic!("expected NotFound, got {:?}", other.map(|j| j.id)),
        }
    }

    #[test]
    fn status_transitions_are_enforced() {
        let mut conn = test_conn();
        let job = new_job("SRR1").insert(&mut conn).unwrap();

        // PENDING -> COMPLETED is not an edge.
        match Job::update_status(
            &job.id,
            Status::Completed,
            StatusFields::default(),
            &mut conn,
        ) {
            Err(Error::InvalidTransition { from, to }) => {
                assert_eq!(from, Status::Pending);
                assert_eq!(to, Status::Completed);
            }
            other => panic!("expected InvalidTransition, got {:?}", other.is_ok()),
        }

        // PENDING -> RUNNING -> COMPLETED is.
        let job = Job::update_status(
            &job.id,
            Status::Running,
            StatusFields {
                pid: Some(4242),
                started_at: Some(Utc::now().naive_utc()),
                ..StatusFields::default()
            },
            &mut conn,
        )
        .unwrap();
        assert_eq!(job.status, Status::Running);
        assert_eq!(job.pid, Some(4242));

        let job = Job::update_status(
            &job.id,
            Status::Completed,
            StatusFields {
                completed_at: Some(Utc::now().naive_utc()),
                exit_code: Some(0),
                ..StatusFields::default()
            },
            &mut conn,
        )
        .unwrap();
        assert_eq!(job.exit_code, Some(0));

        // Terminal rows never move again.
        match Job::update_status(&job.id, Status::Running, StatusFields::default(), &mut conn)
        {
            Err(Error::InvalidTransition { .. }) => {}
            other => panic!("expected InvalidTransition, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn progress_is_monotonic_regardless_of_call_order() {
        let mut conn = test_conn();
        let job = new_job("SRR2").insert(&mut conn).unwrap();

        Job::update_progress(&job.id, 40, "assembly", "line 1", &mut conn).unwrap();
        Job::update_progress(&job.id, 20, "quality_control", "line 2", &mut conn).unwrap();

        let job = Job::find(&job.id, &mut conn).unwrap();
        assert_eq!(job.progress_percent, 40);
        // The step and preview still merge; only the percent is clamped.
        assert_eq!(job.current_step, "quality_control");
        assert_eq!(job.logs_preview.as_deref(), Some("line 2"));
    }

    #[test]
    fn reconcile_fails_running_rows_without_live_pids() {
        let mut conn = test_conn();
        let job = new_job("SRR3").insert(&mut conn).unwrap();
        Job::update_status(
            &job.id,
            Status::Running,
            StatusFields {
                pid: Some(999_999),
                started_at: Some(Utc::now().naive_utc()),
                ..StatusFields::default()
            },
            &mut conn,
        )
        .unwrap();

        let reconciled = Job::reconcile_orphans(&[], &mut conn).unwrap();
        assert_eq!(reconciled, 1);

        let job = Job::find(&job.id, &mut conn).unwrap();
        assert_eq!(job.status, Status::Failed);
        assert_eq!(
            job.error_message.as_deref(),
            Some("supervisor restarted; process lost")
        );

        // A second pass has nothing left to do.
        assert_eq!(Job::reconcile_orphans(&[], &mut conn).unwrap(), 0);
    }

    #[test]
    fn reconcile_spares_jobs_with_live_pids() {
        let mut conn = test_conn();
        let job = new_job("SRR4").insert(&mut conn).unwrap();
        Job::update_status(
            &job.id,
            Status::Running,
            StatusFields {
                pid: Some(1234),
                ..StatusFields::default()
            },
            &mut conn,
        )
        .unwrap();

        assert_eq!(Job::reconcile_orphans(&[1234], &mut conn).unwrap(), 0);
        let job = Job::find(&job.id, &mut conn).unwrap();
        assert_eq!(job.status, Status::Running);
    }

    #[test]
    fn delete_removes_the_row() {
        let mut conn = test_conn();
        let job = new_job("SRR5").insert(&mut conn).unwrap();
        Job::delete(&job.id, &mut conn).unwrap();
        assert!(matches!(
            Job::find(&job.id, &mut conn),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            Job::delete(&job.id, &mut conn),
            Err(Error::NotFound(_))
        ));
    }
}
