//! Database models.

use std::fmt;
use std::str::FromStr;

use diesel::backend::Backend;
use diesel::deserialize::{self, FromSql, FromSqlRow};
use diesel::expression::AsExpression;
use diesel::serialize::{self, IsNull, Output, ToSql};
use diesel::sql_types::Text;
use diesel::sqlite::Sqlite;
use serde::{Deserialize, Serialize};

mod job;

pub use self::job::*;

/// Possible job status values.
///
/// `COMPLETED`, `FAILED` and `STOPPED` are terminal: a job that reaches
/// one of them never transitions again.
#[derive(
    AsExpression, FromSqlRow, Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize,
)]
#[diesel(sql_type = Text)]
pub enum Status {
    /// The job row exists but the pipeline has not been spawned yet.
    #[serde(rename = "PENDING")]
    Pending,
    /// The pipeline is running as a supervised child process.
    #[serde(rename = "RUNNING")]
    Running,
    /// The pipeline exited with status 0.
    #[serde(rename = "COMPLETED")]
    Completed,
    /// The pipeline exited with a non-zero status, or was lost in a crash.
    #[serde(rename = "FAILED")]
    Failed,
    /// The pipeline was terminated at the caller's request.
    #[serde(rename = "STOPPED")]
    Stopped,
}

impl Status {
    /// The canonical on-disk and on-wire spelling of this status.
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "PENDING",
            Status::Running => "RUNNING",
            Status::Completed => "COMPLETED",
            Status::Failed => "FAILED",
            Status::Stopped => "STOPPED",
        }
    }

    /// Does this status forbid any further transition?
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed | Status::Stopped)
    }

    /// Is `self -> to` an edge of the status machine?
    pub fn can_transition_to(self, to: Status) -> bool {
        match self {
            Status::Pending => {
                matches!(to, Status::Running | Status::Failed | Status::Stopped)
            }
            Status::Running => {
                matches!(to, Status::Completed | Status::Failed | Status::Stopped)
            }
            Status::Completed | Status::Failed | Status::Stopped => false,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Status::Pending),
            "RUNNING" => Ok(Status::Running),
            "COMPLETED" => Ok(Status::Completed),
            "FAILED" => Ok(Status::Failed),
            "STOPPED" => Ok(Status::Stopped),
            other => Err(format!("unknown status {:?}", other)),
        }
    }
}

impl ToSql<Text, Sqlite> for Status {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Sqlite>) -> serialize::Result {
        out.set_value(self.as_str());
        Ok(IsNull::No)
    }
}

impl FromSql<Text, Sqlite> for Status {
    fn from_sql(bytes: <Sqlite as Backend>::RawValue<'_>) -> deserialize::Result<Self> {
        let s = <String as FromSql<Text, Sqlite>>::from_sql(bytes)?;
        s.parse().map_err(Into::into)
    }
}

/// Input shapes the pipeline accepts, decided by the input classifier.
#[derive(
    AsExpression, FromSqlRow, Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize,
)]
#[diesel(sql_type = Text)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    /// A sequencing-read archive accession (`SRR…`, `ERR…`, `DRR…`).
    ReadsArchive,
    /// A nucleotide sequence accession (`CP…`, `NC_…`, `NZ_…`).
    SequenceAccession,
    /// An assembly accession (`GCA_…`, `GCF_…`).
    AssemblyAccession,
    /// A FASTA file readable on the local filesystem.
    LocalFile,
}

impl InputType {
    /// The canonical on-disk and on-wire spelling of this input type.
    pub fn as_str(self) -> &'static str {
        match self {
            InputType::ReadsArchive => "reads_archive",
            InputType::SequenceAccession => "sequence_accession",
            InputType::AssemblyAccession => "assembly_accession",
            InputType::LocalFile => "local_file",
        }
    }
}

impl fmt::Display for InputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql<Text, Sqlite> for InputType {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Sqlite>) -> serialize::Result {
        out.set_value(self.as_str());
        Ok(IsNull::No)
    }
}

impl FromSql<Text, Sqlite> for InputType {
    fn from_sql(bytes: <Sqlite as Backend>::RawValue<'_>) -> deserialize::Result<Self> {
        let s = <String as FromSql<Text, Sqlite>>::from_sql(bytes)?;
        match s.as_str() {
            "reads_archive" => Ok(InputType::ReadsArchive),
            "sequence_accession" => Ok(InputType::SequenceAccession),
            "assembly_accession" => Ok(InputType::AssemblyAccession),
            "local_file" => Ok(InputType::LocalFile),
            other => Err(format!("unknown input type {:?}", other).into()),
        }
    }
}

/// Annotation modes understood by the pipeline's `--prokka-mode` flag.
#[derive(
    AsExpression, FromSqlRow, Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize,
)]
#[diesel(sql_type = Text)]
#[serde(rename_all = "lowercase")]
pub enum ProkkaMode {
    /// Let the pipeline pick genus and species from its taxonomy step.
    Auto,
    /// Annotate without an organism hint.
    Generic,
    /// Use the pipeline's built-in E. coli profile.
    Ecoli,
    /// Use the caller-supplied genus and species.
    Custom,
}

impl ProkkaMode {
    /// The spelling passed on the pipeline command line.
    pub fn as_str(self) -> &'static str {
        match self {
            ProkkaMode::Auto => "auto",
            ProkkaMode::Generic => "generic",
            ProkkaMode::Ecoli => "ecoli",
            ProkkaMode::Custom => "custom",
        }
    }
}

impl fmt::Display for ProkkaMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql<Text, Sqlite> for ProkkaMode {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Sqlite>) -> serialize::Result {
        out.set_value(self.as_str());
        Ok(IsNull::No)
    }
}

impl FromSql<Text, Sqlite> for ProkkaMode {
    fn from_sql(bytes: <Sqlite as Backend>::RawValue<'_>) -> deserialize::Result<Self> {
        let s = <String as FromSql<Text, Sqlite>>::from_sql(bytes)?;
        match s.as_str() {
            "auto" => Ok(ProkkaMode::Auto),
            "generic" => Ok(ProkkaMode::Generic),
            "ecoli" => Ok(ProkkaMode::Ecoli),
            "custom" => Ok(ProkkaMode::Custom),
            other => Err(format!("unknown prokka mode {:?}", other).into()),
        }
    }
}
