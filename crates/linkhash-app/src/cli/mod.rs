use std::path::PathBuf;

use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};
use linkhash_server::{PAGE_LIMIT_DEFAULT, RecordStatus};

/// Top-level CLI entry point.
#[derive(Debug, Parser)]
#[command(
    name = "linkhash",
    version,
    author,
    about = "Privacy-preserving record linkage digest service"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
    /// Increase logging verbosity (-v, -vv, -vvv).
    #[arg(global = true, short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
    /// Override `storage.path` from the configuration.
    #[arg(global = true, long = "data-dir", value_name = "DIR")]
    pub data_dir: Option<PathBuf>,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub fn print_help() {
        let mut cmd = Cli::command();
        let _ = cmd.print_help();
        println!();
    }
}

/// Supported subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the HTTP server together with the worker pool.
    Serve(ServeArgs),
    /// Inspect and manage jobs.
    Jobs(JobsArgs),
    /// Read records of a job.
    Records(RecordsArgs),
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Override `server.listen_addr` from the configuration.
    #[arg(long, value_name = "ADDR")]
    pub listen: Option<String>,
}

#[derive(Debug, Args)]
pub struct JobsArgs {
    #[command(subcommand)]
    pub command: JobsCommands,
}

#[derive(Debug, Subcommand)]
pub enum JobsCommands {
    /// List job ids.
    List,
    /// Print a job's schema (never its secret).
    Show(JobIdArgs),
    /// Print run-length status ranges for a job.
    Status(JobIdArgs),
    /// Delete a job and all of its records.
    Delete(JobIdArgs),
    /// Re-enqueue `Queued` records and process them until the queue drains.
    Redispatch(RedispatchArgs),
    /// Return `InProgress` records stranded by a crashed worker to `Queued`.
    Requeue(RequeueArgs),
}

#[derive(Debug, Args)]
pub struct JobIdArgs {
    #[arg(value_name = "JOB_ID")]
    pub job_id: String,
}

#[derive(Debug, Args)]
pub struct RedispatchArgs {
    #[arg(value_name = "JOB_ID")]
    pub job_id: String,
    /// Skip schema validation while processing.
    #[arg(long)]
    pub no_validate: bool,
}

#[derive(Debug, Args)]
pub struct RequeueArgs {
    #[arg(value_name = "JOB_ID")]
    pub job_id: String,
    /// Immediately re-dispatch and process the requeued records.
    #[arg(long)]
    pub redispatch: bool,
}

#[derive(Debug, Args)]
pub struct RecordsArgs {
    #[command(subcommand)]
    pub command: RecordsCommands,
}

#[derive(Debug, Subcommand)]
pub enum RecordsCommands {
    /// Stream records as JSON lines, walking the cursor paginator.
    Export(ExportArgs),
}

#[derive(Debug, Args)]
pub struct ExportArgs {
    #[arg(value_name = "JOB_ID")]
    pub job_id: String,
    #[arg(long)]
    pub index_start: Option<u64>,
    #[arg(long)]
    pub index_end: Option<u64>,
    /// Only export records in these states (comma separated).
    #[arg(long, value_delimiter = ',', value_parser = parse_status)]
    pub status: Vec<RecordStatus>,
    /// Records fetched per page.
    #[arg(long, default_value_t = PAGE_LIMIT_DEFAULT)]
    pub page_size: usize,
}

fn parse_status(raw: &str) -> Result<RecordStatus, String> {
    raw.trim()
        .parse::<RecordStatus>()
        .map_err(|_| format!("unknown record status `{raw}`"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_parses_status_list() {
        let cli = Cli::try_parse_from([
            "linkhash",
            "records",
            "export",
            "job-1",
            "--status",
            "done,error",
        ])
        .expect("parse");
        let Some(Commands::Records(RecordsArgs {
            command: RecordsCommands::Export(args),
        })) = cli.command
        else {
            panic!("expected records export");
        };
        assert_eq!(args.status, vec![RecordStatus::Done, RecordStatus::Error]);
        assert_eq!(args.page_size, PAGE_LIMIT_DEFAULT);
    }

    #[test]
    fn global_flags_work_after_subcommand() {
        let cli = Cli::try_parse_from(["linkhash", "jobs", "list", "-vv", "--data-dir", "/tmp/x"])
            .expect("parse");
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/x")));
    }

    #[test]
    fn unknown_status_is_rejected() {
        assert!(
            Cli::try_parse_from(["linkhash", "records", "export", "j", "--status", "finished"])
                .is_err()
        );
    }
}
